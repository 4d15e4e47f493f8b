use nalgebra::{DMatrix, DVector};
use numpy::ndarray::Array2;
use numpy::{PyArray1, PyArray2, PyReadonlyArray1, PyReadonlyArray2};
use pyo3::prelude::*;

use pixinv::{AdjacencyGraph, InversionError, MappingMatrix, Regularization};

/// Map an engine error onto a Python exception.
///
/// Failed decompositions are numerical (`RuntimeError`); everything else is a
/// bad argument from the caller (`ValueError`).
pub(crate) fn to_py_err(err: InversionError) -> PyErr {
    match err {
        InversionError::NotPositiveDefinite { .. } | InversionError::SingularSystem { .. } => {
            pyo3::exceptions::PyRuntimeError::new_err(err.to_string())
        }
        _ => pyo3::exceptions::PyValueError::new_err(err.to_string()),
    }
}

pub(crate) fn matrix_to_py<'py>(py: Python<'py>, m: &DMatrix<f64>) -> Bound<'py, PyArray2<f64>> {
    PyArray2::from_owned_array(py, Array2::from_shape_fn((m.nrows(), m.ncols()), |(i, j)| m[(i, j)]))
}

pub(crate) fn vector_to_py<'py>(py: Python<'py>, v: &DVector<f64>) -> Bound<'py, PyArray1<f64>> {
    PyArray1::from_vec(py, v.iter().copied().collect())
}

pub(crate) fn vec_from_py(arr: &PyReadonlyArray1<'_, f64>) -> Vec<f64> {
    arr.as_array().to_vec()
}

/// Read a `(reconstruction × observation)` mapping matrix.
pub(crate) fn mapping_from_py(arr: &PyReadonlyArray2<'_, f64>) -> MappingMatrix {
    let a = arr.as_array();
    MappingMatrix::from_matrix(DMatrix::from_fn(a.nrows(), a.ncols(), |i, j| a[[i, j]]))
}

pub(crate) fn graph_from_py(neighbors: Vec<Vec<usize>>) -> PyResult<AdjacencyGraph> {
    AdjacencyGraph::new(neighbors).map_err(to_py_err)
}

/// Pick the scheme from keyword arguments: weighted when both weighted
/// coefficients are given, constant otherwise.
pub(crate) fn regularization_from_args(
    coefficient: f64,
    signal_coefficient: Option<f64>,
    background_coefficient: Option<f64>,
    diagonal_floor: f64,
) -> PyResult<Regularization> {
    match (signal_coefficient, background_coefficient) {
        (Some(signal_coefficient), Some(background_coefficient)) => Ok(Regularization::Weighted {
            signal_coefficient,
            background_coefficient,
            diagonal_floor,
        }),
        (None, None) => Ok(Regularization::Constant {
            coefficient,
            diagonal_floor,
        }),
        _ => Err(pyo3::exceptions::PyValueError::new_err(
            "signal_coefficient and background_coefficient must be given together",
        )),
    }
}
