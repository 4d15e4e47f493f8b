//! Regularized linear inversion.
//!
//! Given a blurred mapping matrix `M` (reconstruction × observation), an image,
//! its per-pixel noise `σ` and a regularization matrix `H`, the inversion
//! solves the normal equations
//!
//! ```text
//! (F + H) · s = d,    d = M · (image / σ²),    F = M · diag(1/σ²) · Mᵗ
//! ```
//!
//! and exposes the quantities a Bayesian likelihood needs: the reconstructed
//! image `Mᵗ·s`, the regularization term `sᵀHs`, and the log-determinants of
//! `F + H` and `H` taken from their Cholesky factors.
//!
//! The curvature matrix `F` comes from one of two paths, selected by
//! [`CurvatureMethod`]: a dense product over the mapping matrix, or the sparse
//! covariance search of [`crate::covariance`]. Both give the same matrix when
//! the search reaches every overlapping pair.

use std::f64::consts::PI;

use nalgebra::{DMatrix, DVector};
use tracing::debug;

use crate::covariance::{create_covariance_matrix, curvature_matrix_from_covariances, CovarianceConfig};
use crate::error::{check_len, check_noise, InversionError, InversionResult, MatrixKind};
use crate::graph::AdjacencyGraph;
use crate::mapping::MappingMatrix;
use crate::regularization::Regularization;

// ── Blurring seam ───────────────────────────────────────────────────────────

/// Blurring operator applied to the mapping matrix before the inversion.
///
/// Implementations convolve each reconstruction pixel's row over the
/// observation grid (e.g. with an instrument PSF). The output keeps the
/// `(reconstruction × observation)` shape.
pub trait Convolver {
    fn convolve_mapping_matrix(&self, mapping: &MappingMatrix) -> MappingMatrix;
}

/// Identity convolver.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoBlur;

impl Convolver for NoBlur {
    fn convolve_mapping_matrix(&self, mapping: &MappingMatrix) -> MappingMatrix {
        mapping.clone()
    }
}

// ── Configuration ───────────────────────────────────────────────────────────

/// How the curvature matrix `F` is assembled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CurvatureMethod {
    /// Dense product `M · diag(1/σ²) · Mᵗ`.
    #[default]
    Dense,
    /// Breadth-first covariance search over the adjacency graph.
    Covariance,
}

/// Parameters for [`inversion_from_mapping`].
#[derive(Debug, Clone, Default)]
pub struct InversionConfig {
    /// Curvature assembly path. Default [`CurvatureMethod::Dense`].
    pub curvature: CurvatureMethod,
    /// Search settings used by [`CurvatureMethod::Covariance`].
    pub covariance: CovarianceConfig,
}

// ── Assembly ────────────────────────────────────────────────────────────────

/// Data vector `d[r] = Σ_o image[o] · M[r,o] / σ[o]²`.
pub fn data_vector(
    mapping: &MappingMatrix,
    image: &[f64],
    noise: &[f64],
) -> InversionResult<DVector<f64>> {
    check_len("image", mapping.observation_pixels(), image.len())?;
    check_len("noise", mapping.observation_pixels(), noise.len())?;
    check_noise(noise)?;

    let weighted = DVector::from_iterator(
        image.len(),
        image.iter().zip(noise).map(|(&v, &s)| v / (s * s)),
    );
    Ok(mapping.matrix() * weighted)
}

/// Dense curvature matrix `F = M · diag(1/σ²) · Mᵗ`.
pub fn curvature_matrix(mapping: &MappingMatrix, noise: &[f64]) -> InversionResult<DMatrix<f64>> {
    check_len("noise", mapping.observation_pixels(), noise.len())?;
    check_noise(noise)?;

    let mut scaled = mapping.matrix().clone();
    for (mut column, &sigma) in scaled.column_iter_mut().zip(noise) {
        column /= sigma;
    }
    let mut curvature = &scaled * scaled.transpose();
    curvature.fill_upper_triangle_with_lower_triangle();
    Ok(curvature)
}

/// Curvature matrix through the sparse covariance search.
///
/// The search divides each overlap by the value it is handed, so it is given
/// `σ²` to match [`curvature_matrix`].
pub fn curvature_matrix_via_covariances(
    mapping: &MappingMatrix,
    noise: &[f64],
    graph: &AdjacencyGraph,
    config: &CovarianceConfig,
) -> InversionResult<DMatrix<f64>> {
    check_len("noise", mapping.observation_pixels(), noise.len())?;
    check_noise(noise)?;
    let variance: Vec<f64> = noise.iter().map(|s| s * s).collect();
    let maps = mapping.contribution_maps();
    let covariances = create_covariance_matrix(&maps, &variance, graph, config)?;
    Ok(curvature_matrix_from_covariances(&covariances))
}

/// `ln det A = 2 Σ ln L_ii` from the Cholesky factor `A = L Lᵗ`.
///
/// Fails with [`InversionError::NotPositiveDefinite`] naming `kind` when the
/// factorization does not exist, or when a pivot `L_ii²` is no larger than
/// `10 · n · ε · max_i A_ii`. A rank-deficient matrix with fractional entries rounds
/// to a tiny positive pivot instead of an exact zero.
pub fn log_determinant_cholesky(matrix: &DMatrix<f64>, kind: MatrixKind) -> InversionResult<f64> {
    let Some(cholesky) = matrix.clone().cholesky() else {
        debug!("Cholesky failed on {} ({} pixels)", kind, matrix.nrows());
        return Err(InversionError::NotPositiveDefinite { matrix: kind });
    };

    let tolerance = pivot_tolerance(matrix);
    let pivots = cholesky.l_dirty().diagonal();
    if let Some(index) = pivots.iter().position(|&l| !(l * l > tolerance)) {
        debug!(
            "Cholesky pivot {} of {} is {:e}, below tolerance {:e}",
            index,
            kind,
            pivots[index] * pivots[index],
            tolerance
        );
        return Err(InversionError::NotPositiveDefinite { matrix: kind });
    }

    Ok(2.0 * pivots.iter().map(|l| l.ln()).sum::<f64>())
}

fn pivot_tolerance(matrix: &DMatrix<f64>) -> f64 {
    let max_diagonal = matrix.diagonal().iter().fold(0.0_f64, |m, &d| m.max(d.abs()));
    10.0 * matrix.nrows() as f64 * f64::EPSILON * max_diagonal
}

/// `Σ_o ln(2π σ[o]²)`.
pub fn noise_normalization(noise: &[f64]) -> f64 {
    noise.iter().map(|s| (2.0 * PI * s * s).ln()).sum()
}

// ── Solved inversion ────────────────────────────────────────────────────────

/// Matrices and solution of one regularized inversion.
#[derive(Debug, Clone)]
pub struct Inversion {
    blurred_mapping: MappingMatrix,
    regularization_matrix: DMatrix<f64>,
    curvature_matrix: DMatrix<f64>,
    curvature_reg_matrix: DMatrix<f64>,
    solution: DVector<f64>,
    log_det_curvature_reg: f64,
}

impl Inversion {
    /// Solve `(F + H) s = d`.
    ///
    /// `F + H` must be positive-definite. Its Cholesky factor gives
    /// `ln det(F + H)`; the solution itself comes from an LU solve.
    pub fn new(
        blurred_mapping: MappingMatrix,
        data_vector: DVector<f64>,
        curvature_matrix: DMatrix<f64>,
        regularization_matrix: DMatrix<f64>,
    ) -> InversionResult<Self> {
        let pixels = blurred_mapping.reconstruction_pixels();
        check_len("data vector", pixels, data_vector.len())?;
        check_len("curvature matrix rows", pixels, curvature_matrix.nrows())?;
        check_len("curvature matrix columns", pixels, curvature_matrix.ncols())?;
        check_len("regularization matrix rows", pixels, regularization_matrix.nrows())?;
        check_len("regularization matrix columns", pixels, regularization_matrix.ncols())?;

        let curvature_reg_matrix = &curvature_matrix + &regularization_matrix;
        let log_det_curvature_reg =
            log_determinant_cholesky(&curvature_reg_matrix, MatrixKind::CurvatureReg)?;

        let solution = curvature_reg_matrix
            .clone()
            .lu()
            .solve(&data_vector)
            .ok_or(InversionError::SingularSystem { pixels })?;

        debug!(
            "Inversion solved: {} pixels, {} observations, ln det(F+H) = {:.6}",
            pixels,
            blurred_mapping.observation_pixels(),
            log_det_curvature_reg,
        );

        Ok(Self {
            blurred_mapping,
            regularization_matrix,
            curvature_matrix,
            curvature_reg_matrix,
            solution,
            log_det_curvature_reg,
        })
    }

    pub fn blurred_mapping(&self) -> &MappingMatrix {
        &self.blurred_mapping
    }

    pub fn regularization_matrix(&self) -> &DMatrix<f64> {
        &self.regularization_matrix
    }

    pub fn curvature_matrix(&self) -> &DMatrix<f64> {
        &self.curvature_matrix
    }

    pub fn curvature_reg_matrix(&self) -> &DMatrix<f64> {
        &self.curvature_reg_matrix
    }

    /// Reconstruction-pixel values `s`.
    pub fn solution(&self) -> &DVector<f64> {
        &self.solution
    }

    /// Model image `Mᵗ · s` on the observation grid.
    pub fn reconstructed_data_vector(&self) -> DVector<f64> {
        self.blurred_mapping.matrix().tr_mul(&self.solution)
    }

    /// `sᵀ H s`. The regularization coefficient is already inside `H`.
    pub fn regularization_term(&self) -> f64 {
        self.solution.dot(&(&self.regularization_matrix * &self.solution))
    }

    /// `ln det(F + H)`, computed when the inversion was solved.
    pub fn log_det_curvature_reg_matrix_term(&self) -> f64 {
        self.log_det_curvature_reg
    }

    /// `ln det H`. Fails when `H` is only positive semi-definite.
    pub fn log_det_regularization_matrix_term(&self) -> InversionResult<f64> {
        log_determinant_cholesky(&self.regularization_matrix, MatrixKind::Regularization)
    }

    /// `Σ_o ((image[o] − model[o]) / σ[o])²`.
    pub fn chi_squared(&self, image: &[f64], noise: &[f64]) -> InversionResult<f64> {
        let observations = self.blurred_mapping.observation_pixels();
        check_len("image", observations, image.len())?;
        check_len("noise", observations, noise.len())?;
        check_noise(noise)?;

        let model = self.reconstructed_data_vector();
        Ok(image
            .iter()
            .zip(model.iter())
            .zip(noise)
            .map(|((&v, &m), &s)| {
                let r = (v - m) / s;
                r * r
            })
            .sum())
    }

    /// `−½ (χ² + sᵀHs + Σ ln 2πσ²)`.
    pub fn likelihood_with_regularization(&self, image: &[f64], noise: &[f64]) -> InversionResult<f64> {
        let chi_squared = self.chi_squared(image, noise)?;
        Ok(-0.5 * (chi_squared + self.regularization_term() + noise_normalization(noise)))
    }

    /// Bayesian evidence
    /// `−½ (χ² + sᵀHs + ln det(F+H) − ln det H + Σ ln 2πσ²)`.
    pub fn evidence(&self, image: &[f64], noise: &[f64]) -> InversionResult<f64> {
        let chi_squared = self.chi_squared(image, noise)?;
        let log_det_regularization = self.log_det_regularization_matrix_term()?;
        Ok(-0.5
            * (chi_squared
                + self.regularization_term()
                + self.log_det_curvature_reg
                - log_det_regularization
                + noise_normalization(noise)))
    }
}

/// Blur the mapping, assemble `d`, `F` and `H`, and solve.
///
/// `pixel_signals` feeds [`Regularization::Weighted`] and is ignored by the
/// constant scheme.
#[allow(clippy::too_many_arguments)]
pub fn inversion_from_mapping<C: Convolver + ?Sized>(
    image: &[f64],
    noise: &[f64],
    convolver: &C,
    mapping: &MappingMatrix,
    graph: &AdjacencyGraph,
    regularization: &Regularization,
    pixel_signals: Option<&[f64]>,
    config: &InversionConfig,
) -> InversionResult<Inversion> {
    check_len("adjacency graph pixels", mapping.reconstruction_pixels(), graph.pixels())?;

    let blurred = convolver.convolve_mapping_matrix(mapping);
    check_len("blurred mapping rows", mapping.reconstruction_pixels(), blurred.reconstruction_pixels())?;
    check_len("blurred mapping columns", mapping.observation_pixels(), blurred.observation_pixels())?;

    let data = data_vector(&blurred, image, noise)?;
    let curvature = match config.curvature {
        CurvatureMethod::Dense => curvature_matrix(&blurred, noise)?,
        CurvatureMethod::Covariance => {
            curvature_matrix_via_covariances(&blurred, noise, graph, &config.covariance)?
        }
    };
    let regularization_matrix = regularization.regularization_matrix(graph, pixel_signals)?;

    debug!(
        "Assembled inversion: {} pixels via {:?} curvature",
        graph.pixels(),
        config.curvature
    );

    Inversion::new(blurred, data, curvature, regularization_matrix)
}
