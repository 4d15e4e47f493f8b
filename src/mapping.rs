//! Mapping between observation pixels and reconstruction pixels.
//!
//! Each observation pixel is split into an `S × S` sub-grid. Every sub-pixel is
//! traced to exactly one reconstruction pixel, so a sub-pixel contributes a
//! fraction `1/S²` of its observation pixel to that reconstruction pixel.
//!
//! Two representations are produced from the same sub-grid assignment:
//!
//! - [`MappingMatrix`] — dense `(reconstruction × observation)` matrix.
//! - [`PixelContributionMap`] — one sparse row per reconstruction pixel, with
//!   observation indices sorted ascending. This is the form the covariance
//!   search works on.

use nalgebra::{DMatrix, DVector};

use crate::error::{check_index, check_len, check_noise, InversionError, InversionResult};

// ── Sparse contribution rows ────────────────────────────────────────────────

/// Contribution of observation pixels to one reconstruction pixel.
///
/// Stored as parallel `indices` / `weights` arrays with strictly increasing
/// observation indices and non-negative weights.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PixelContributionMap {
    indices: Vec<u32>,
    weights: Vec<f64>,
}

impl PixelContributionMap {
    /// Build a map from `(observation index, weight)` entries.
    ///
    /// Repeated indices are summed. Fails on negative or non-finite weights.
    pub fn from_entries(entries: impl IntoIterator<Item = (usize, f64)>) -> InversionResult<Self> {
        let mut entries: Vec<(usize, f64)> = entries.into_iter().collect();
        for &(index, value) in &entries {
            if !(value.is_finite() && value >= 0.0) {
                return Err(InversionError::NegativeWeight { index, value });
            }
        }
        entries.sort_by_key(|&(i, _)| i);

        let mut map = Self::default();
        for (index, weight) in entries {
            match map.indices.last() {
                Some(&last) if last as usize == index => {
                    if let Some(w) = map.weights.last_mut() {
                        *w += weight;
                    }
                }
                _ => {
                    map.indices.push(index as u32);
                    map.weights.push(weight);
                }
            }
        }
        Ok(map)
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Iterate `(observation index, weight)` in ascending index order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, f64)> + '_ {
        self.indices
            .iter()
            .zip(&self.weights)
            .map(|(&i, &w)| (i as usize, w))
    }

    /// Weight for observation pixel `index`, zero if absent.
    pub fn get(&self, index: usize) -> f64 {
        match self.indices.binary_search(&(index as u32)) {
            Ok(pos) => self.weights[pos],
            Err(_) => 0.0,
        }
    }

    /// Sum of weights over all observation pixels.
    pub fn total(&self) -> f64 {
        self.weights.iter().sum()
    }

    /// Largest observation index, if any.
    pub(crate) fn max_index(&self) -> Option<usize> {
        self.indices.last().map(|&i| i as usize)
    }

    /// `Σ_k self[k] · other[k] / divisor[k]` over indices present in both maps.
    ///
    /// Walks both sorted index arrays in lockstep, so the summation order is
    /// the ascending shared index order regardless of argument order.
    #[inline]
    pub fn overlap(&self, other: &PixelContributionMap, divisor: &[f64]) -> f64 {
        let (mut i, mut j) = (0usize, 0usize);
        let mut sum = 0.0;
        while i < self.indices.len() && j < other.indices.len() {
            let a = self.indices[i];
            let b = other.indices[j];
            if a < b {
                i += 1;
            } else if b < a {
                j += 1;
            } else {
                debug_assert!((a as usize) < divisor.len());
                sum += self.weights[i] * other.weights[j] / divisor[a as usize];
                i += 1;
                j += 1;
            }
        }
        sum
    }
}

// ── Dense mapping matrix ────────────────────────────────────────────────────

/// Dense `(reconstruction pixels × observation pixels)` mapping matrix.
///
/// Entry `(r, o)` is the fraction of observation pixel `o` that maps to
/// reconstruction pixel `r`. A blurred mapping matrix (the output of a
/// [`Convolver`](crate::Convolver)) uses the same type and orientation.
#[derive(Debug, Clone, PartialEq)]
pub struct MappingMatrix {
    matrix: DMatrix<f64>,
}

impl MappingMatrix {
    /// Wrap an existing `(reconstruction × observation)` matrix.
    pub fn from_matrix(matrix: DMatrix<f64>) -> Self {
        Self { matrix }
    }

    /// Build the mapping matrix from a sub-grid assignment.
    ///
    /// `sub_to_reconstruction[k]` and `sub_to_observation[k]` give the pixels
    /// sub-pixel `k` belongs to. Both must have length
    /// `observation_pixels * sub_grid_size²`.
    pub fn from_sub_grid(
        reconstruction_pixels: usize,
        observation_pixels: usize,
        sub_grid_size: usize,
        sub_to_reconstruction: &[usize],
        sub_to_observation: &[usize],
    ) -> InversionResult<Self> {
        validate_sub_grid(
            reconstruction_pixels,
            observation_pixels,
            sub_grid_size,
            sub_to_reconstruction,
            sub_to_observation,
        )?;
        let mut matrix = DMatrix::zeros(reconstruction_pixels, observation_pixels);
        fill_mapping_matrix(&mut matrix, sub_grid_size, sub_to_reconstruction, sub_to_observation);
        Ok(Self { matrix })
    }

    pub fn reconstruction_pixels(&self) -> usize {
        self.matrix.nrows()
    }

    pub fn observation_pixels(&self) -> usize {
        self.matrix.ncols()
    }

    pub fn matrix(&self) -> &DMatrix<f64> {
        &self.matrix
    }

    pub fn into_matrix(self) -> DMatrix<f64> {
        self.matrix
    }

    #[inline]
    pub fn entry(&self, reconstruction: usize, observation: usize) -> f64 {
        self.matrix[(reconstruction, observation)]
    }

    /// Sparse rows keeping every strictly positive entry.
    pub fn contribution_maps(&self) -> Vec<PixelContributionMap> {
        self.matrix
            .row_iter()
            .map(|row| {
                let mut map = PixelContributionMap::default();
                for (o, &w) in row.iter().enumerate() {
                    if w > 0.0 {
                        map.indices.push(o as u32);
                        map.weights.push(w);
                    }
                }
                map
            })
            .collect()
    }
}

/// Accumulate `1/S²` into `(r, o)` for every sub-pixel. Inputs are not checked.
fn fill_mapping_matrix(
    matrix: &mut DMatrix<f64>,
    sub_grid_size: usize,
    sub_to_reconstruction: &[usize],
    sub_to_observation: &[usize],
) {
    let sub_grid_fraction = 1.0 / (sub_grid_size * sub_grid_size) as f64;
    for (&r, &o) in sub_to_reconstruction.iter().zip(sub_to_observation) {
        debug_assert!(r < matrix.nrows() && o < matrix.ncols());
        matrix[(r, o)] += sub_grid_fraction;
    }
}

fn validate_sub_grid(
    reconstruction_pixels: usize,
    observation_pixels: usize,
    sub_grid_size: usize,
    sub_to_reconstruction: &[usize],
    sub_to_observation: &[usize],
) -> InversionResult<()> {
    if sub_grid_size == 0 {
        return Err(InversionError::InvalidSubGridSize(sub_grid_size));
    }
    let total_sub_pixels = observation_pixels * sub_grid_size * sub_grid_size;
    check_len("sub_to_reconstruction", total_sub_pixels, sub_to_reconstruction.len())?;
    check_len("sub_to_observation", total_sub_pixels, sub_to_observation.len())?;
    for &r in sub_to_reconstruction {
        check_index("sub_to_reconstruction", r, reconstruction_pixels)?;
    }
    for &o in sub_to_observation {
        check_index("sub_to_observation", o, observation_pixels)?;
    }
    Ok(())
}

/// Build one sparse contribution map per reconstruction pixel from a sub-grid assignment.
///
/// Produces the same values as [`MappingMatrix::from_sub_grid`] without
/// allocating the dense matrix.
pub fn contribution_maps_from_sub_grid(
    reconstruction_pixels: usize,
    observation_pixels: usize,
    sub_grid_size: usize,
    sub_to_reconstruction: &[usize],
    sub_to_observation: &[usize],
) -> InversionResult<Vec<PixelContributionMap>> {
    validate_sub_grid(
        reconstruction_pixels,
        observation_pixels,
        sub_grid_size,
        sub_to_reconstruction,
        sub_to_observation,
    )?;
    let sub_grid_fraction = 1.0 / (sub_grid_size * sub_grid_size) as f64;

    let mut entries: Vec<Vec<(usize, f64)>> = vec![Vec::new(); reconstruction_pixels];
    for (&r, &o) in sub_to_reconstruction.iter().zip(sub_to_observation) {
        entries[r].push((o, sub_grid_fraction));
    }
    entries
        .into_iter()
        .map(PixelContributionMap::from_entries)
        .collect()
}

/// Data vector `d[r] = Σ_o image[o] · map_r[o] / noise[o]²` from sparse rows.
pub fn data_vector_from_contribution_maps(
    maps: &[PixelContributionMap],
    noise: &[f64],
    image: &[f64],
) -> InversionResult<DVector<f64>> {
    check_len("image", noise.len(), image.len())?;
    check_noise(noise)?;
    for map in maps {
        if let Some(max) = map.max_index() {
            check_index("contribution map observation", max, noise.len())?;
        }
    }

    Ok(DVector::from_iterator(
        maps.len(),
        maps.iter().map(|map| {
            map.iter()
                .map(|(o, w)| image[o] * w / (noise[o] * noise[o]))
                .sum::<f64>()
        }),
    ))
}
