//! Neighbor relation among reconstruction pixels.
//!
//! `AdjacencyGraph` stores one neighbor list per reconstruction pixel in a
//! compact offsets + flat-index layout: the neighbors of pixel `i` are
//! `neighbor_indices[offsets[i]..offsets[i + 1]]`.
//!
//! Graphs come from the discretization (a rectangular lattice or the shared
//! edges of a Voronoi tessellation). They are validated once on construction
//! and are immutable afterwards, so every consumer can index without checks.

use crate::error::{check_index, InversionError, InversionResult};

/// Undirected, symmetric neighbor graph over reconstruction pixels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdjacencyGraph {
    offsets: Vec<u32>,
    neighbor_indices: Vec<u32>,
}

impl AdjacencyGraph {
    /// Build a graph from per-pixel neighbor lists.
    ///
    /// Duplicate entries within a list are removed and each list is sorted.
    /// Fails if an index is out of range, if a pixel lists itself, or if the
    /// relation is not symmetric.
    pub fn new(neighbors: Vec<Vec<usize>>) -> InversionResult<Self> {
        let pixels = neighbors.len();

        let mut lists = neighbors;
        for (i, list) in lists.iter_mut().enumerate() {
            for &n in list.iter() {
                check_index("adjacency graph neighbor", n, pixels)?;
                if n == i {
                    return Err(InversionError::SelfLoop { index: i });
                }
            }
            list.sort_unstable();
            list.dedup();
        }

        for (a, list) in lists.iter().enumerate() {
            for &b in list {
                if lists[b].binary_search(&a).is_err() {
                    return Err(InversionError::AsymmetricGraph { a, b });
                }
            }
        }

        let mut offsets = Vec::with_capacity(pixels + 1);
        let mut neighbor_indices = Vec::with_capacity(lists.iter().map(Vec::len).sum());
        offsets.push(0);
        for list in lists {
            neighbor_indices.extend(list.into_iter().map(|n| n as u32));
            offsets.push(neighbor_indices.len() as u32);
        }

        Ok(Self {
            offsets,
            neighbor_indices,
        })
    }

    /// Four-connected rectangular lattice of `rows × cols` pixels.
    ///
    /// Pixel indices increase left to right, then top to bottom.
    pub fn rectangular(rows: usize, cols: usize) -> Self {
        let mut offsets = Vec::with_capacity(rows * cols + 1);
        let mut neighbor_indices = Vec::with_capacity(4 * rows * cols);
        offsets.push(0);
        for r in 0..rows {
            for c in 0..cols {
                let i = r * cols + c;
                // ascending index order: up, left, right, down
                if r > 0 {
                    neighbor_indices.push((i - cols) as u32);
                }
                if c > 0 {
                    neighbor_indices.push((i - 1) as u32);
                }
                if c + 1 < cols {
                    neighbor_indices.push((i + 1) as u32);
                }
                if r + 1 < rows {
                    neighbor_indices.push((i + cols) as u32);
                }
                offsets.push(neighbor_indices.len() as u32);
            }
        }
        Self {
            offsets,
            neighbor_indices,
        }
    }

    /// Build a graph from undirected pixel pairs (e.g. Voronoi cells sharing a ridge).
    pub fn from_pairs(pixels: usize, pairs: &[(usize, usize)]) -> InversionResult<Self> {
        let mut lists = vec![Vec::new(); pixels];
        for &(a, b) in pairs {
            check_index("pixel pair", a, pixels)?;
            check_index("pixel pair", b, pixels)?;
            lists[a].push(b);
            lists[b].push(a);
        }
        Self::new(lists)
    }

    /// Number of reconstruction pixels.
    pub fn pixels(&self) -> usize {
        self.offsets.len() - 1
    }

    /// Neighbors of pixel `i`, sorted ascending.
    #[inline]
    pub fn neighbors(&self, i: usize) -> impl ExactSizeIterator<Item = usize> + '_ {
        let start = self.offsets[i] as usize;
        let end = self.offsets[i + 1] as usize;
        self.neighbor_indices[start..end].iter().map(|&n| n as usize)
    }

    #[inline]
    pub fn neighbor_count(&self, i: usize) -> usize {
        (self.offsets[i + 1] - self.offsets[i]) as usize
    }

    pub fn neighbor_counts(&self) -> Vec<usize> {
        (0..self.pixels()).map(|i| self.neighbor_count(i)).collect()
    }

    /// Each undirected edge exactly once, as `(a, b)` with `a < b`, ascending.
    pub fn edges(&self) -> Vec<(usize, usize)> {
        let mut edges = Vec::with_capacity(self.neighbor_indices.len() / 2);
        for a in 0..self.pixels() {
            edges.extend(self.neighbors(a).filter(|&b| b > a).map(|b| (a, b)));
        }
        edges
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rectangular_3x3_neighbors() {
        let g = AdjacencyGraph::rectangular(3, 3);
        assert_eq!(g.pixels(), 9);
        assert_eq!(g.neighbors(0).collect::<Vec<_>>(), vec![1, 3]);
        assert_eq!(g.neighbors(4).collect::<Vec<_>>(), vec![1, 3, 5, 7]);
        assert_eq!(g.neighbors(8).collect::<Vec<_>>(), vec![5, 7]);
        assert_eq!(g.neighbor_counts(), vec![2, 3, 2, 3, 4, 3, 2, 3, 2]);
        assert_eq!(g.edges().len(), 12);
    }

    #[test]
    fn test_from_pairs_matches_voronoi_cross() {
        // Five points shaped like the 5-face of a die: centre touches all corners,
        // corners touch their two adjacent corners.
        let pairs = [
            (2, 0),
            (2, 1),
            (2, 3),
            (2, 4),
            (0, 1),
            (0, 3),
            (3, 4),
            (4, 1),
        ];
        let g = AdjacencyGraph::from_pairs(5, &pairs).unwrap();
        assert_eq!(g.neighbor_counts(), vec![3, 3, 4, 3, 3]);
        assert_eq!(g.neighbors(2).collect::<Vec<_>>(), vec![0, 1, 3, 4]);
        assert_eq!(g.neighbors(0).collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[test]
    fn test_new_dedups_and_sorts() {
        let g = AdjacencyGraph::new(vec![vec![2, 1, 1], vec![0], vec![0]]).unwrap();
        assert_eq!(g.neighbors(0).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(g.edges(), vec![(0, 1), (0, 2)]);
    }

    #[test]
    fn test_new_rejects_asymmetric() {
        let err = AdjacencyGraph::new(vec![vec![1], vec![]]).unwrap_err();
        assert_eq!(err, InversionError::AsymmetricGraph { a: 0, b: 1 });
    }

    #[test]
    fn test_new_rejects_out_of_range() {
        let err = AdjacencyGraph::new(vec![vec![5], vec![]]).unwrap_err();
        assert!(matches!(err, InversionError::IndexOutOfRange { index: 5, bound: 2, .. }));
    }

    #[test]
    fn test_new_rejects_self_loop() {
        let err = AdjacencyGraph::new(vec![vec![1], vec![0, 1], vec![]]).unwrap_err();
        assert_eq!(err, InversionError::SelfLoop { index: 1 });
        assert_eq!(err.to_string(), "Adjacency graph pixel 1 lists itself as a neighbor");
    }

    #[test]
    fn test_isolated_pixel() {
        let g = AdjacencyGraph::new(vec![vec![1], vec![0], vec![]]).unwrap();
        assert_eq!(g.neighbor_count(2), 0);
        assert_eq!(g.neighbors(2).count(), 0);
    }
}
