//! Python bindings for pixinv via PyO3.
//!
//! Exposes the inversion engine to Python as the `pixinvrs` module. Mapping
//! matrices cross the boundary as `(reconstruction, observation)` float arrays
//! and adjacency graphs as lists of neighbor lists.

mod helpers;

use numpy::{PyArray1, PyArray2, PyReadonlyArray1, PyReadonlyArray2};
use pyo3::prelude::*;

use pixinv::{
    curvature_matrix_via_covariances, inversion_from_mapping, CovarianceConfig, CurvatureMethod,
    Inversion, InversionConfig, MappingMatrix, NoBlur,
};

use helpers::{
    graph_from_py, mapping_from_py, matrix_to_py, regularization_from_args, to_py_err,
    vec_from_py, vector_to_py,
};

// ═══════════════════════════════════════════════════════════════════════════
// Free functions
// ═══════════════════════════════════════════════════════════════════════════

/// Build the mapping matrix from a sub-grid assignment.
///
/// Args:
///     reconstruction_pixels: Number of reconstruction pixels.
///     observation_pixels: Number of observation pixels.
///     sub_grid_size: Sub-pixels per observation pixel along each axis.
///     sub_to_reconstruction: Reconstruction pixel of every sub-pixel.
///     sub_to_observation: Observation pixel of every sub-pixel.
///
/// Returns:
///     Array of shape (reconstruction_pixels, observation_pixels).
#[pyfunction]
fn mapping_matrix<'py>(
    py: Python<'py>,
    reconstruction_pixels: usize,
    observation_pixels: usize,
    sub_grid_size: usize,
    sub_to_reconstruction: Vec<usize>,
    sub_to_observation: Vec<usize>,
) -> PyResult<Bound<'py, PyArray2<f64>>> {
    let mapping = MappingMatrix::from_sub_grid(
        reconstruction_pixels,
        observation_pixels,
        sub_grid_size,
        &sub_to_reconstruction,
        &sub_to_observation,
    )
    .map_err(to_py_err)?;
    Ok(matrix_to_py(py, mapping.matrix()))
}

/// Smoothness penalty matrix over an adjacency graph.
///
/// Constant regularization by default. Pass both `signal_coefficient` and
/// `background_coefficient` together with `pixel_signals` (values in [0, 1])
/// for weighted regularization.
#[pyfunction]
#[pyo3(signature = (
    neighbors,
    coefficient = 1.0,
    signal_coefficient = None,
    background_coefficient = None,
    pixel_signals = None,
    diagonal_floor = 1e-8,
))]
fn regularization_matrix<'py>(
    py: Python<'py>,
    neighbors: Vec<Vec<usize>>,
    coefficient: f64,
    signal_coefficient: Option<f64>,
    background_coefficient: Option<f64>,
    pixel_signals: Option<PyReadonlyArray1<'py, f64>>,
    diagonal_floor: f64,
) -> PyResult<Bound<'py, PyArray2<f64>>> {
    let graph = graph_from_py(neighbors)?;
    let regularization =
        regularization_from_args(coefficient, signal_coefficient, background_coefficient, diagonal_floor)?;
    let signals = pixel_signals.as_ref().map(vec_from_py);
    let h = regularization
        .regularization_matrix(&graph, signals.as_deref())
        .map_err(to_py_err)?;
    Ok(matrix_to_py(py, &h))
}

/// Curvature matrix found by the breadth-first covariance search.
///
/// Args:
///     mapping: (Blurred) mapping matrix, shape (reconstruction, observation).
///     noise: Per-observation noise sigma.
///     neighbors: Adjacency lists of the reconstruction pixels.
///     neighbour_search_limit: Expansion threshold. Default 0.
#[pyfunction]
#[pyo3(signature = (mapping, noise, neighbors, neighbour_search_limit = 0.0))]
fn covariance_matrix<'py>(
    py: Python<'py>,
    mapping: PyReadonlyArray2<'py, f64>,
    noise: PyReadonlyArray1<'py, f64>,
    neighbors: Vec<Vec<usize>>,
    neighbour_search_limit: f64,
) -> PyResult<Bound<'py, PyArray2<f64>>> {
    let mapping = mapping_from_py(&mapping);
    let noise = vec_from_py(&noise);
    let graph = graph_from_py(neighbors)?;
    let config = CovarianceConfig {
        neighbour_search_limit,
    };
    let f = curvature_matrix_via_covariances(&mapping, &noise, &graph, &config).map_err(to_py_err)?;
    Ok(matrix_to_py(py, &f))
}

// ═══════════════════════════════════════════════════════════════════════════
// PyInversion — wraps Inversion
// ═══════════════════════════════════════════════════════════════════════════

/// A solved regularized inversion.
///
/// The mapping matrix is taken as already blurred.
///
/// Example:
///     inv = pixinvrs.Inversion(image, noise, mapping, neighbors, coefficient=2.0)
///     model = inv.reconstructed_data_vector
///     evidence = inv.evidence
#[pyclass(name = "Inversion")]
struct PyInversion {
    inner: Inversion,
    image: Vec<f64>,
    noise: Vec<f64>,
}

#[pymethods]
impl PyInversion {
    /// Assemble and solve `(F + H) s = d`.
    ///
    /// Args:
    ///     image: Observed values, one per observation pixel.
    ///     noise: Noise sigma, one per observation pixel.
    ///     mapping: Blurred mapping matrix, shape (reconstruction, observation).
    ///     neighbors: Adjacency lists of the reconstruction pixels.
    ///     coefficient: Constant regularization coefficient. Default 1.
    ///     signal_coefficient / background_coefficient: Weighted regularization.
    ///     pixel_signals: Per-pixel signal in [0, 1] for weighted regularization.
    ///     diagonal_floor: Added to the diagonal of H. Default 1e-8.
    ///     curvature: "dense" (default) or "covariance".
    ///     neighbour_search_limit: Threshold for the covariance search. Default 0.
    #[new]
    #[allow(clippy::too_many_arguments)]
    #[pyo3(signature = (
        image,
        noise,
        mapping,
        neighbors,
        coefficient = 1.0,
        signal_coefficient = None,
        background_coefficient = None,
        pixel_signals = None,
        diagonal_floor = 1e-8,
        curvature = "dense",
        neighbour_search_limit = 0.0,
    ))]
    fn new<'py>(
        image: PyReadonlyArray1<'py, f64>,
        noise: PyReadonlyArray1<'py, f64>,
        mapping: PyReadonlyArray2<'py, f64>,
        neighbors: Vec<Vec<usize>>,
        coefficient: f64,
        signal_coefficient: Option<f64>,
        background_coefficient: Option<f64>,
        pixel_signals: Option<PyReadonlyArray1<'py, f64>>,
        diagonal_floor: f64,
        curvature: &str,
        neighbour_search_limit: f64,
    ) -> PyResult<Self> {
        let curvature = match curvature {
            "dense" => CurvatureMethod::Dense,
            "covariance" => CurvatureMethod::Covariance,
            other => {
                return Err(pyo3::exceptions::PyValueError::new_err(format!(
                    "curvature must be \"dense\" or \"covariance\", got {other:?}"
                )))
            }
        };
        let config = InversionConfig {
            curvature,
            covariance: CovarianceConfig {
                neighbour_search_limit,
            },
        };
        let regularization =
            regularization_from_args(coefficient, signal_coefficient, background_coefficient, diagonal_floor)?;

        let image = vec_from_py(&image);
        let noise = vec_from_py(&noise);
        let mapping = mapping_from_py(&mapping);
        let graph = graph_from_py(neighbors)?;
        let signals = pixel_signals.as_ref().map(vec_from_py);

        let inner = inversion_from_mapping(
            &image,
            &noise,
            &NoBlur,
            &mapping,
            &graph,
            &regularization,
            signals.as_deref(),
            &config,
        )
        .map_err(to_py_err)?;

        Ok(Self { inner, image, noise })
    }

    /// Reconstruction-pixel values.
    #[getter]
    fn solution<'py>(&self, py: Python<'py>) -> Bound<'py, PyArray1<f64>> {
        vector_to_py(py, self.inner.solution())
    }

    /// Model image on the observation grid.
    #[getter]
    fn reconstructed_data_vector<'py>(&self, py: Python<'py>) -> Bound<'py, PyArray1<f64>> {
        vector_to_py(py, &self.inner.reconstructed_data_vector())
    }

    #[getter]
    fn curvature_matrix<'py>(&self, py: Python<'py>) -> Bound<'py, PyArray2<f64>> {
        matrix_to_py(py, self.inner.curvature_matrix())
    }

    #[getter]
    fn regularization_matrix<'py>(&self, py: Python<'py>) -> Bound<'py, PyArray2<f64>> {
        matrix_to_py(py, self.inner.regularization_matrix())
    }

    #[getter]
    fn regularization_term(&self) -> f64 {
        self.inner.regularization_term()
    }

    #[getter]
    fn log_det_curvature_reg_matrix_term(&self) -> f64 {
        self.inner.log_det_curvature_reg_matrix_term()
    }

    /// Raises RuntimeError if the regularization matrix is not positive-definite.
    #[getter]
    fn log_det_regularization_matrix_term(&self) -> PyResult<f64> {
        self.inner.log_det_regularization_matrix_term().map_err(to_py_err)
    }

    #[getter]
    fn chi_squared(&self) -> PyResult<f64> {
        self.inner.chi_squared(&self.image, &self.noise).map_err(to_py_err)
    }

    #[getter]
    fn likelihood_with_regularization(&self) -> PyResult<f64> {
        self.inner
            .likelihood_with_regularization(&self.image, &self.noise)
            .map_err(to_py_err)
    }

    /// Bayesian evidence of the fit.
    #[getter]
    fn evidence(&self) -> PyResult<f64> {
        self.inner.evidence(&self.image, &self.noise).map_err(to_py_err)
    }

    fn __repr__(&self) -> String {
        format!(
            "Inversion(pixels={}, observations={}, regularization_term={:.6})",
            self.inner.solution().len(),
            self.image.len(),
            self.inner.regularization_term(),
        )
    }
}

#[pymodule]
fn pixinvrs(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<PyInversion>()?;
    m.add_function(wrap_pyfunction!(mapping_matrix, m)?)?;
    m.add_function(wrap_pyfunction!(regularization_matrix, m)?)?;
    m.add_function(wrap_pyfunction!(covariance_matrix, m)?)?;
    Ok(())
}
