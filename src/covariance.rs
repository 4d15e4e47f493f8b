//! Sparse curvature (covariance) matrix from contribution maps.
//!
//! The curvature between reconstruction pixels `i` and `j` is
//!
//! ```text
//! F[i, j] = Σ_k map_i[k] · map_j[k] / noise[k]
//! ```
//!
//! summed over observation pixels `k` present in both maps. Most pairs are zero:
//! two reconstruction pixels only overlap when they map onto nearby observation
//! pixels, which in turn means they are close on the adjacency graph. Instead
//! of evaluating all `N²` pairs, the generator:
//!
//! 1. **Contiguous pass** — for each seed pixel, records the diagonal and runs
//!    a breadth-first search over the adjacency graph. A candidate whose
//!    covariance with the seed is strictly above `neighbour_search_limit` is
//!    recorded, appended to the seed's neighbour list, and expanded. Any other
//!    candidate ends its branch of the search.
//! 2. **Non-contiguous pass** — for each seed, every pair drawn from its
//!    neighbour list is evaluated. This finds pixels that overlap through a
//!    common third pixel's patch (shared blur support) without being adjacent.
//!
//! Every evaluated pair is memoized under its unordered key, so `(a, b)` and
//! `(b, a)` always resolve to one stored value.

use std::collections::{BTreeMap, HashMap, VecDeque};

use nalgebra::DMatrix;
use tracing::debug;

use crate::error::{check_index, check_len, check_noise, InversionResult};
use crate::graph::AdjacencyGraph;
use crate::mapping::PixelContributionMap;

/// Parameters controlling the covariance search.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CovarianceConfig {
    /// A candidate is expanded only if its covariance with the seed is
    /// strictly greater than this value. Default 0.0.
    pub neighbour_search_limit: f64,
}

impl Default for CovarianceConfig {
    fn default() -> Self {
        Self {
            neighbour_search_limit: 0.0,
        }
    }
}

// ── Sparse symmetric map ────────────────────────────────────────────────────

/// Non-zero curvature entries keyed by unordered pixel pair.
///
/// Each pair is stored once under `(min, max)`, so `get(i, j) == get(j, i)`
/// holds structurally.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SparseCovarianceMap {
    pixels: usize,
    values: BTreeMap<(usize, usize), f64>,
}

impl SparseCovarianceMap {
    pub fn new(pixels: usize) -> Self {
        Self {
            pixels,
            values: BTreeMap::new(),
        }
    }

    pub fn pixels(&self) -> usize {
        self.pixels
    }

    /// Number of stored unordered pairs (diagonal included).
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, i: usize, j: usize) -> Option<f64> {
        self.values.get(&canonical(i, j)).copied()
    }

    pub fn contains(&self, i: usize, j: usize) -> bool {
        self.values.contains_key(&canonical(i, j))
    }

    pub(crate) fn insert(&mut self, i: usize, j: usize, value: f64) {
        self.values.insert(canonical(i, j), value);
    }

    /// Iterate `(i, j, value)` with `i <= j`, in ascending pair order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, usize, f64)> + '_ {
        self.values.iter().map(|(&(i, j), &v)| (i, j, v))
    }

    /// Dense symmetric curvature matrix; absent pairs are zero.
    pub fn to_dense(&self) -> DMatrix<f64> {
        let mut dense = DMatrix::zeros(self.pixels, self.pixels);
        for (i, j, v) in self.iter() {
            dense[(i, j)] = v;
            dense[(j, i)] = v;
        }
        dense
    }
}

#[inline]
fn canonical(i: usize, j: usize) -> (usize, usize) {
    if i <= j {
        (i, j)
    } else {
        (j, i)
    }
}

// ── Pair memoization ────────────────────────────────────────────────────────

/// Computed pair values keyed by the packed unordered pair `min * N + max`.
#[derive(Debug, Clone)]
struct PairCache {
    pixels: u64,
    values: HashMap<u64, f64>,
}

impl PairCache {
    fn new(pixels: usize) -> Self {
        Self {
            pixels: pixels as u64,
            values: HashMap::new(),
        }
    }

    #[inline]
    fn key(&self, a: usize, b: usize) -> u64 {
        let (lo, hi) = canonical(a, b);
        lo as u64 * self.pixels + hi as u64
    }

    fn get_or_compute(&mut self, a: usize, b: usize, compute: impl FnOnce() -> f64) -> f64 {
        let key = self.key(a, b);
        *self.values.entry(key).or_insert_with(compute)
    }

    #[cfg(feature = "parallel")]
    fn insert_computed(&mut self, a: usize, b: usize, value: f64) {
        let key = self.key(a, b);
        let stored = *self.values.entry(key).or_insert(value);
        debug_assert_eq!(stored.to_bits(), value.to_bits());
    }

    fn contains(&self, a: usize, b: usize) -> bool {
        self.values.contains_key(&self.key(a, b))
    }

    fn len(&self) -> usize {
        self.values.len()
    }
}

/// Covariance between `a` and `b`, always evaluated in `(min, max)` order.
#[inline]
fn pair_covariance(maps: &[PixelContributionMap], noise: &[f64], a: usize, b: usize) -> f64 {
    let (lo, hi) = canonical(a, b);
    maps[lo].overlap(&maps[hi], noise)
}

// ── Breadth-first search ────────────────────────────────────────────────────

/// FIFO search state reused across seeds.
///
/// A node is marked visited when it is enqueued, so it is yielded at most
/// once per search. Only nodes that were touched are cleared on reset.
#[derive(Debug, Clone)]
struct BreadthFirstSearch {
    queue: VecDeque<usize>,
    visited: Vec<bool>,
    touched: Vec<usize>,
}

impl BreadthFirstSearch {
    fn new(pixels: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            visited: vec![false; pixels],
            touched: Vec::new(),
        }
    }

    fn reset(&mut self) {
        self.queue.clear();
        for i in self.touched.drain(..) {
            self.visited[i] = false;
        }
    }

    fn mark(&mut self, index: usize) -> bool {
        if self.visited[index] {
            return false;
        }
        self.visited[index] = true;
        self.touched.push(index);
        true
    }

    /// Mark `index` visited and enqueue its unvisited neighbours.
    fn add_neighbours_of(&mut self, graph: &AdjacencyGraph, index: usize) {
        self.mark(index);
        for neighbour in graph.neighbors(index) {
            if self.mark(neighbour) {
                self.queue.push_back(neighbour);
            }
        }
    }

    fn pop(&mut self) -> Option<usize> {
        self.queue.pop_front()
    }
}

/// Bounded search around `seed`. Returns accepted candidates in visit order.
///
/// `evaluate` is called exactly once per visited candidate.
fn search_contiguous(
    graph: &AdjacencyGraph,
    seed: usize,
    limit: f64,
    bfs: &mut BreadthFirstSearch,
    mut evaluate: impl FnMut(usize) -> f64,
) -> Vec<(usize, f64)> {
    bfs.reset();
    bfs.add_neighbours_of(graph, seed);

    let mut accepted = Vec::new();
    while let Some(candidate) = bfs.pop() {
        let value = evaluate(candidate);
        if value > limit {
            accepted.push((candidate, value));
            bfs.add_neighbours_of(graph, candidate);
        }
    }
    accepted
}

// ── Generator ───────────────────────────────────────────────────────────────

/// Incremental builder of a [`SparseCovarianceMap`].
///
/// Call [`find_all_contiguous_covariances`](Self::find_all_contiguous_covariances)
/// then [`find_all_non_contiguous_covariances`](Self::find_all_non_contiguous_covariances),
/// or use [`create_covariance_matrix`] which does both.
pub struct CovarianceMatrixGenerator<'a> {
    maps: &'a [PixelContributionMap],
    noise: &'a [f64],
    graph: &'a AdjacencyGraph,
    neighbour_search_limit: f64,
    cache: PairCache,
    covariances: SparseCovarianceMap,
    neighbour_lists: Vec<Vec<usize>>,
    bfs: BreadthFirstSearch,
}

impl<'a> CovarianceMatrixGenerator<'a> {
    /// Validate inputs and set up an empty generator.
    ///
    /// `noise` is the per-observation divisor: pass `σ²` to obtain the
    /// curvature matrix `M·diag(1/σ²)·Mᵗ`.
    pub fn new(
        maps: &'a [PixelContributionMap],
        noise: &'a [f64],
        graph: &'a AdjacencyGraph,
        config: &CovarianceConfig,
    ) -> InversionResult<Self> {
        let pixels = maps.len();
        check_len("adjacency graph pixels", pixels, graph.pixels())?;
        check_noise(noise)?;
        for map in maps {
            if let Some(max) = map.max_index() {
                check_index("contribution map observation", max, noise.len())?;
            }
        }

        Ok(Self {
            maps,
            noise,
            graph,
            neighbour_search_limit: config.neighbour_search_limit,
            cache: PairCache::new(pixels),
            covariances: SparseCovarianceMap::new(pixels),
            neighbour_lists: vec![Vec::new(); pixels],
            bfs: BreadthFirstSearch::new(pixels),
        })
    }

    pub fn pixels(&self) -> usize {
        self.maps.len()
    }

    /// Memoized covariance between `a` and `b`.
    pub fn covariance(&mut self, a: usize, b: usize) -> f64 {
        let (maps, noise) = (self.maps, self.noise);
        self.cache
            .get_or_compute(a, b, || pair_covariance(maps, noise, a, b))
    }

    /// Whether the pair has been evaluated (in either order).
    pub fn is_evaluated(&self, a: usize, b: usize) -> bool {
        self.cache.contains(a, b)
    }

    /// Pixels accepted by the contiguous search around `seed`, in visit order.
    pub fn neighbour_list(&self, seed: usize) -> &[usize] {
        &self.neighbour_lists[seed]
    }

    pub fn covariances(&self) -> &SparseCovarianceMap {
        &self.covariances
    }

    pub fn into_covariances(self) -> SparseCovarianceMap {
        self.covariances
    }

    /// Record the diagonal for `seed` and the contiguous patch of
    /// above-threshold covariances around it.
    pub fn find_contiguous_covariances(&mut self, seed: usize) {
        let diagonal = self.covariance(seed, seed);
        self.covariances.insert(seed, seed, diagonal);

        let (maps, noise, graph) = (self.maps, self.noise, self.graph);
        let cache = &mut self.cache;
        let accepted = search_contiguous(
            graph,
            seed,
            self.neighbour_search_limit,
            &mut self.bfs,
            |candidate| {
                cache.get_or_compute(seed, candidate, || {
                    pair_covariance(maps, noise, seed, candidate)
                })
            },
        );

        for (candidate, value) in accepted {
            self.neighbour_lists[seed].push(candidate);
            self.covariances.insert(seed, candidate, value);
        }
    }

    pub fn find_all_contiguous_covariances(&mut self) {
        for seed in 0..self.pixels() {
            self.find_contiguous_covariances(seed);
        }
    }

    /// Same result as [`find_all_contiguous_covariances`](Self::find_all_contiguous_covariances),
    /// with seeds searched in parallel.
    ///
    /// Each seed evaluates its candidates independently; evaluations are
    /// merged into the cache in seed order afterwards. Pair values are
    /// computed in canonical order, so every thread produces identical bits.
    #[cfg(feature = "parallel")]
    pub fn find_all_contiguous_covariances_parallel(&mut self) {
        use rayon::prelude::*;

        let (maps, noise, graph) = (self.maps, self.noise, self.graph);
        let limit = self.neighbour_search_limit;
        let pixels = self.pixels();

        let searches: Vec<(Vec<(usize, f64)>, Vec<(usize, f64)>)> = (0..pixels)
            .into_par_iter()
            .map_init(
                || BreadthFirstSearch::new(pixels),
                |bfs, seed| {
                    let mut evaluated = Vec::new();
                    let accepted = search_contiguous(graph, seed, limit, bfs, |candidate| {
                        let value = pair_covariance(maps, noise, seed, candidate);
                        evaluated.push((candidate, value));
                        value
                    });
                    (evaluated, accepted)
                },
            )
            .collect();

        for (seed, (evaluated, accepted)) in searches.into_iter().enumerate() {
            let diagonal = self.covariance(seed, seed);
            self.covariances.insert(seed, seed, diagonal);
            for (candidate, value) in evaluated {
                self.cache.insert_computed(seed, candidate, value);
            }
            for (candidate, value) in accepted {
                self.neighbour_lists[seed].push(candidate);
                self.covariances.insert(seed, candidate, value);
            }
        }
    }

    /// Record positive covariances between pixels that share a seed's patch.
    ///
    /// Pairs are canonical, so each unordered pair in a list is evaluated once.
    pub fn find_all_non_contiguous_covariances(&mut self) {
        for seed in 0..self.pixels() {
            let list = std::mem::take(&mut self.neighbour_lists[seed]);
            for (i, &a) in list.iter().enumerate() {
                for &b in &list[i + 1..] {
                    if a == b {
                        continue;
                    }
                    let value = self.covariance(a, b);
                    if value > 0.0 {
                        self.covariances.insert(a, b, value);
                    }
                }
            }
            self.neighbour_lists[seed] = list;
        }
    }
}

/// Build the sparse curvature map with the contiguous and non-contiguous passes.
pub fn create_covariance_matrix(
    maps: &[PixelContributionMap],
    noise: &[f64],
    graph: &AdjacencyGraph,
    config: &CovarianceConfig,
) -> InversionResult<SparseCovarianceMap> {
    let mut generator = CovarianceMatrixGenerator::new(maps, noise, graph, config)?;

    #[cfg(feature = "parallel")]
    generator.find_all_contiguous_covariances_parallel();
    #[cfg(not(feature = "parallel"))]
    generator.find_all_contiguous_covariances();
    let contiguous = generator.covariances().len();

    generator.find_all_non_contiguous_covariances();

    debug!(
        "Covariance search: {} pixels, {} contiguous pairs, {} non-contiguous pairs, {} evaluated",
        generator.pixels(),
        contiguous,
        generator.covariances().len() - contiguous,
        generator.cache.len(),
    );

    Ok(generator.into_covariances())
}

/// Densify a sparse curvature map into an `N × N` symmetric matrix.
pub fn curvature_matrix_from_covariances(covariances: &SparseCovarianceMap) -> DMatrix<f64> {
    covariances.to_dense()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn map(entries: &[(usize, f64)]) -> PixelContributionMap {
        PixelContributionMap::from_entries(entries.iter().copied()).unwrap()
    }

    /// Dense reference: every pair evaluated.
    fn brute_force(maps: &[PixelContributionMap], noise: &[f64]) -> DMatrix<f64> {
        let n = maps.len();
        DMatrix::from_fn(n, n, |i, j| pair_covariance(maps, noise, i, j))
    }

    #[test]
    fn test_diagonal_always_present() {
        // Pixel 2 has no contribution at all and no neighbours.
        let maps = vec![map(&[(0, 1.0)]), map(&[(1, 1.0)]), PixelContributionMap::default()];
        let graph = AdjacencyGraph::new(vec![vec![1], vec![0], vec![]]).unwrap();
        let cov = create_covariance_matrix(&maps, &[1.0, 1.0], &graph, &CovarianceConfig::default())
            .unwrap();
        for s in 0..3 {
            assert!(cov.contains(s, s), "missing diagonal ({s}, {s})");
        }
        assert_eq!(cov.get(2, 2), Some(0.0));
        assert_eq!(cov.get(0, 1), None);
    }

    #[test]
    fn test_identity_mapping_on_lattice_is_diagonal() {
        let graph = AdjacencyGraph::rectangular(3, 3);
        let maps: Vec<_> = (0..9).map(|i| map(&[(i, 1.0)])).collect();
        let noise = vec![2.0; 9];
        let cov = create_covariance_matrix(&maps, &noise, &graph, &CovarianceConfig::default())
            .unwrap();
        assert_eq!(cov.len(), 9);
        for s in 0..9 {
            assert_relative_eq!(cov.get(s, s).unwrap(), 0.5);
        }
    }

    #[test]
    fn test_contiguous_chain_matches_brute_force() {
        // 1D chain where each reconstruction pixel overlaps its neighbour's
        // observation pixel: F is tridiagonal.
        let n = 6;
        let graph = AdjacencyGraph::from_pairs(n, &(0..n - 1).map(|i| (i, i + 1)).collect::<Vec<_>>())
            .unwrap();
        let maps: Vec<_> = (0..n)
            .map(|i| {
                let mut e = vec![(i, 0.5)];
                if i + 1 < n {
                    e.push((i + 1, 0.25));
                }
                if i > 0 {
                    e.push((i - 1, 0.25));
                }
                map(&e)
            })
            .collect();
        let noise = vec![1.0, 2.0, 1.5, 1.0, 0.5, 1.0];
        let cov = create_covariance_matrix(&maps, &noise, &graph, &CovarianceConfig::default())
            .unwrap();
        let reference = brute_force(&maps, &noise);
        let dense = cov.to_dense();
        for i in 0..n {
            for j in 0..n {
                assert_relative_eq!(dense[(i, j)], reference[(i, j)], epsilon = 1e-14);
            }
        }
        // Pixels two apart share observation pixel i+1.
        assert!(cov.contains(0, 2));
    }

    #[test]
    fn test_non_contiguous_pass_finds_shared_patch_pairs() {
        // Star graph: 1 and 2 are both adjacent to 0 but not to each other,
        // yet they overlap on observation pixel 1.
        let graph = AdjacencyGraph::from_pairs(3, &[(0, 1), (0, 2)]).unwrap();
        let maps = vec![
            map(&[(0, 1.0), (1, 1.0)]),
            map(&[(0, 1.0), (1, 1.0)]),
            map(&[(1, 1.0), (2, 1.0)]),
        ];
        let noise = [1.0, 1.0, 1.0];
        let mut generator =
            CovarianceMatrixGenerator::new(&maps, &noise, &graph, &CovarianceConfig::default())
                .unwrap();
        generator.find_contiguous_covariances(0);
        assert_eq!(generator.neighbour_list(0), &[1, 2]);
        assert!(!generator.covariances().contains(1, 2));

        generator.find_all_non_contiguous_covariances();
        let cov = generator.into_covariances();
        assert_eq!(cov.get(1, 2), Some(1.0));
        assert_eq!(cov.get(2, 1), Some(1.0));
    }

    #[test]
    fn test_rejected_candidate_is_not_expanded() {
        // Chain 0 - 1 - 2. Pixel 1 has zero overlap with 0, so 2 is never reached
        // from 0 even though (0, 2) overlap.
        let graph = AdjacencyGraph::from_pairs(3, &[(0, 1), (1, 2)]).unwrap();
        let maps = vec![map(&[(0, 1.0)]), map(&[(1, 1.0)]), map(&[(0, 1.0)])];
        let noise = [1.0, 1.0];
        let mut generator =
            CovarianceMatrixGenerator::new(&maps, &noise, &graph, &CovarianceConfig::default())
                .unwrap();
        generator.find_contiguous_covariances(0);
        assert!(generator.is_evaluated(0, 1));
        assert!(!generator.is_evaluated(0, 2));
        assert!(generator.neighbour_list(0).is_empty());

        generator.find_all_contiguous_covariances();
        generator.find_all_non_contiguous_covariances();
        assert!(!generator.is_evaluated(0, 2));
        assert!(!generator.covariances().contains(0, 2));
    }

    #[test]
    fn test_threshold_is_strict() {
        let graph = AdjacencyGraph::from_pairs(2, &[(0, 1)]).unwrap();
        let maps = vec![map(&[(0, 1.0)]), map(&[(0, 0.5)])];
        let noise = [1.0];

        let at_limit = CovarianceConfig {
            neighbour_search_limit: 0.5,
        };
        let cov = create_covariance_matrix(&maps, &noise, &graph, &at_limit).unwrap();
        assert!(!cov.contains(0, 1));

        let below = CovarianceConfig {
            neighbour_search_limit: 0.49,
        };
        let cov = create_covariance_matrix(&maps, &noise, &graph, &below).unwrap();
        assert_eq!(cov.get(0, 1), Some(0.5));
    }

    #[test]
    fn test_pairs_are_symmetric_and_memoized() {
        let graph = AdjacencyGraph::rectangular(2, 3);
        let maps: Vec<_> = (0..6)
            .map(|i| map(&[(i, 0.7), ((i + 1) % 6, 0.3), ((i + 3) % 6, 0.1)]))
            .collect();
        let noise = [1.0, 0.3, 2.0, 0.9, 1.1, 0.7];
        let mut generator =
            CovarianceMatrixGenerator::new(&maps, &noise, &graph, &CovarianceConfig::default())
                .unwrap();
        generator.find_all_contiguous_covariances();
        generator.find_all_non_contiguous_covariances();
        let evaluated = generator.cache.len();

        let ab = generator.covariance(1, 4);
        let ba = generator.covariance(4, 1);
        assert_eq!(ab.to_bits(), ba.to_bits());
        let cov = generator.into_covariances();
        for (i, j, v) in cov.iter() {
            assert!(i <= j);
            assert_eq!(cov.get(j, i), Some(v));
        }
        assert!(evaluated <= 6 * 7 / 2);
    }

    #[test]
    fn test_rejects_graph_size_mismatch() {
        let graph = AdjacencyGraph::rectangular(2, 2);
        let maps = vec![map(&[(0, 1.0)])];
        assert!(CovarianceMatrixGenerator::new(&maps, &[1.0], &graph, &CovarianceConfig::default())
            .is_err());
    }

    #[test]
    fn test_rejects_map_outside_noise() {
        let graph = AdjacencyGraph::new(vec![vec![]]).unwrap();
        let maps = vec![map(&[(3, 1.0)])];
        assert!(CovarianceMatrixGenerator::new(&maps, &[1.0], &graph, &CovarianceConfig::default())
            .is_err());
    }
}
