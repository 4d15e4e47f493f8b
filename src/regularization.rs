//! Smoothness penalty over the reconstruction-pixel adjacency graph.
//!
//! The regularization matrix is `H = Σ BᵗB` over difference-operator rows `B`,
//! one row per directed edge: the row for `a → b` holds `-w[a]` at column `a`
//! and `+w[a]` at column `b`. Expanding `BᵗB` for that row gives four entries,
//! so `H` is accumulated edge by edge without building any `B`:
//!
//! ```text
//! H[a,a] += w[a]²   H[b,b] += w[a]²   H[a,b] -= w[a]²   H[b,a] -= w[a]²
//! ```
//!
//! plus the mirrored terms for `b → a` with `w[b]²`.
//!
//! # Schemes
//!
//! - [`Regularization::Constant`] — one weight for every pixel.
//! - [`Regularization::Weighted`] — per-pixel weights interpolated between a
//!   signal and a background coefficient by the pixel's normalized signal.

use nalgebra::DMatrix;

use crate::error::{check_index, check_len, check_weights, InversionResult};
use crate::graph::AdjacencyGraph;

/// Build `H` directly from undirected pixel pairs.
///
/// `pairs` lists each edge once. A direction `a → b` contributes only when
/// `neighbor_counts[a] > 0`; an isolated pixel keeps a zero row and column.
pub fn regularization_matrix_from_pixel_pairs(
    pixels: usize,
    weights: &[f64],
    neighbor_counts: &[usize],
    pairs: &[(usize, usize)],
) -> InversionResult<DMatrix<f64>> {
    check_len("regularization weights", pixels, weights.len())?;
    check_len("neighbor counts", pixels, neighbor_counts.len())?;
    check_weights(weights)?;
    for &(a, b) in pairs {
        check_index("regularization pair", a, pixels)?;
        check_index("regularization pair", b, pixels)?;
    }

    let mut h = DMatrix::zeros(pixels, pixels);
    for &(a, b) in pairs {
        for (from, to) in [(a, b), (b, a)] {
            if neighbor_counts[from] == 0 {
                continue;
            }
            let w2 = weights[from] * weights[from];
            h[(from, from)] += w2;
            h[(to, to)] += w2;
            h[(from, to)] -= w2;
            h[(to, from)] -= w2;
        }
    }
    Ok(h)
}

/// Per-pixel weights for the weighted scheme.
///
/// `w_i = signal_coefficient · s_i + background_coefficient · (1 − s_i)`,
/// where `s_i ∈ [0, 1]` is the normalized signal of pixel `i`.
pub fn regularization_weights_from_pixel_signals(
    signal_coefficient: f64,
    background_coefficient: f64,
    pixel_signals: &[f64],
) -> Vec<f64> {
    pixel_signals
        .iter()
        .map(|&s| signal_coefficient * s + background_coefficient * (1.0 - s))
        .collect()
}

/// Regularization scheme applied over an adjacency graph.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Regularization {
    /// Uniform weight for every pixel.
    Constant {
        coefficient: f64,
        /// Added to every diagonal entry so that `H` is positive-definite.
        diagonal_floor: f64,
    },
    /// Weights interpolated from per-pixel signals in `[0, 1]`.
    Weighted {
        signal_coefficient: f64,
        background_coefficient: f64,
        /// Added to every diagonal entry so that `H` is positive-definite.
        diagonal_floor: f64,
    },
}

impl Default for Regularization {
    fn default() -> Self {
        Regularization::Constant {
            coefficient: 1.0,
            diagonal_floor: 1e-8,
        }
    }
}

impl Regularization {
    /// Constant scheme with the default diagonal floor.
    pub fn constant(coefficient: f64) -> Self {
        Regularization::Constant {
            coefficient,
            diagonal_floor: 1e-8,
        }
    }

    /// Weighted scheme with the default diagonal floor.
    pub fn weighted(signal_coefficient: f64, background_coefficient: f64) -> Self {
        Regularization::Weighted {
            signal_coefficient,
            background_coefficient,
            diagonal_floor: 1e-8,
        }
    }

    fn diagonal_floor(&self) -> f64 {
        match *self {
            Regularization::Constant { diagonal_floor, .. } => diagonal_floor,
            Regularization::Weighted { diagonal_floor, .. } => diagonal_floor,
        }
    }

    /// Per-pixel weights. `pixel_signals` is required for the weighted scheme
    /// and ignored by the constant one.
    pub fn weights(&self, pixels: usize, pixel_signals: Option<&[f64]>) -> InversionResult<Vec<f64>> {
        let weights = match *self {
            Regularization::Constant { coefficient, .. } => vec![coefficient; pixels],
            Regularization::Weighted {
                signal_coefficient,
                background_coefficient,
                ..
            } => {
                let signals = pixel_signals.unwrap_or(&[]);
                check_len("pixel signals", pixels, signals.len())?;
                regularization_weights_from_pixel_signals(
                    signal_coefficient,
                    background_coefficient,
                    signals,
                )
            }
        };
        check_weights(&weights)?;
        Ok(weights)
    }

    /// Regularization matrix over `graph`, including the diagonal floor.
    pub fn regularization_matrix(
        &self,
        graph: &AdjacencyGraph,
        pixel_signals: Option<&[f64]>,
    ) -> InversionResult<DMatrix<f64>> {
        let pixels = graph.pixels();
        let weights = self.weights(pixels, pixel_signals)?;
        let mut h = regularization_matrix_from_pixel_pairs(
            pixels,
            &weights,
            &graph.neighbor_counts(),
            &graph.edges(),
        )?;
        let floor = self.diagonal_floor();
        if floor != 0.0 {
            for i in 0..pixels {
                h[(i, i)] += floor;
            }
        }
        Ok(h)
    }
}
