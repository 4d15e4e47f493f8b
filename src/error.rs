//! Error types for the inversion engine.
//!
//! Numerical failures (a matrix that is not positive-definite, a singular
//! linear system) and caller precondition violations (mismatched lengths,
//! out-of-range indices, non-positive noise) share one enum so that a
//! likelihood evaluator can tell an invalid model from a poorly fitting one.

use std::fmt;

use thiserror::Error;

/// Which matrix a decomposition failed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatrixKind {
    /// The curvature matrix plus the regularization matrix, `F + H`.
    CurvatureReg,
    /// The regularization matrix `H`.
    Regularization,
}

impl fmt::Display for MatrixKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatrixKind::CurvatureReg => write!(f, "curvature + regularization matrix"),
            MatrixKind::Regularization => write!(f, "regularization matrix"),
        }
    }
}

/// Errors raised while building or solving an inversion.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InversionError {
    #[error("Cholesky decomposition failed: {matrix} is not positive-definite")]
    NotPositiveDefinite { matrix: MatrixKind },

    #[error("Linear system of {pixels} pixels is singular")]
    SingularSystem { pixels: usize },

    #[error("Length mismatch for {what}: expected {expected}, got {actual}")]
    LengthMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("Index out of range for {what}: {index} >= {bound}")]
    IndexOutOfRange {
        what: &'static str,
        index: usize,
        bound: usize,
    },

    #[error("Noise value at observation pixel {index} must be positive and finite, got {value}")]
    NonPositiveNoise { index: usize, value: f64 },

    #[error("Weight at index {index} must be non-negative and finite, got {value}")]
    NegativeWeight { index: usize, value: f64 },

    #[error("Adjacency graph pixel {index} lists itself as a neighbor")]
    SelfLoop { index: usize },

    #[error("Adjacency graph is not symmetric: {b} is a neighbor of {a} but not vice versa")]
    AsymmetricGraph { a: usize, b: usize },

    #[error("Sub-grid size must be at least 1, got {0}")]
    InvalidSubGridSize(usize),
}

pub type InversionResult<T> = Result<T, InversionError>;

// ── Boundary validation helpers ─────────────────────────────────────────────

pub(crate) fn check_len(what: &'static str, expected: usize, actual: usize) -> InversionResult<()> {
    if expected != actual {
        return Err(InversionError::LengthMismatch {
            what,
            expected,
            actual,
        });
    }
    Ok(())
}

pub(crate) fn check_index(what: &'static str, index: usize, bound: usize) -> InversionResult<()> {
    if index >= bound {
        return Err(InversionError::IndexOutOfRange { what, index, bound });
    }
    Ok(())
}

/// Every noise value must be strictly positive and finite.
pub(crate) fn check_noise(noise: &[f64]) -> InversionResult<()> {
    match noise.iter().position(|&v| !(v.is_finite() && v > 0.0)) {
        Some(index) => Err(InversionError::NonPositiveNoise {
            index,
            value: noise[index],
        }),
        None => Ok(()),
    }
}

pub(crate) fn check_weights(weights: &[f64]) -> InversionResult<()> {
    match weights.iter().position(|&v| !(v.is_finite() && v >= 0.0)) {
        Some(index) => Err(InversionError::NegativeWeight {
            index,
            value: weights[index],
        }),
        None => Ok(()),
    }
}
