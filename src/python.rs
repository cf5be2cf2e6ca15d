use crate::config::FitConfig;
use crate::fitting::common::fitstruct::FitResult;
use crate::ports::{Port, PortKind};
use num_complex::Complex64;
use numpy::{PyArray1, PyReadonlyArray1};
use pyo3::prelude::*;
use pyo3::types::PyDict;

fn result_dict<'py>(py: Python<'py>, result: &FitResult) -> PyResult<Bound<'py, PyDict>> {
    let dict = PyDict::new_bound(py);
    dict.set_item("values", result.values.clone())?;
    dict.set_item("errors", result.errors.clone())?;
    dict.set_item("chi_square", result.chi_square)?;
    let warnings: Vec<String> = result.warnings.iter().map(ToString::to_string).collect();
    dict.set_item("warnings", warnings)?;
    Ok(dict)
}

/// Calibrates and fits one trace, returning the fitted values, their errors and chi-square.
#[pyfunction]
#[pyo3(name = "autofit")]
#[pyo3(text_signature = "(port: str, f: numpy.ndarray, z: numpy.ndarray, /)")]
fn autofit_py<'py>(
    py: Python<'py>,
    port: &str,
    f: PyReadonlyArray1<'py, f64>,
    z: PyReadonlyArray1<'py, Complex64>,
) -> PyResult<Bound<'py, PyDict>> {
    let kind: PortKind = port.parse()?;
    let mut port = Port::with_data(kind, f.as_slice()?.to_vec(), z.as_slice()?.to_vec())?;
    py.allow_threads(|| port.autofit())?;
    result_dict(py, port.fit_result()?)
}

/// Fits a tail-type resonance, returning the retained frequencies, the simulated trace and
/// the fit record.
#[pyfunction]
#[pyo3(name = "tail_port")]
#[pyo3(text_signature = "(f: numpy.ndarray, z: numpy.ndarray, /)")]
#[allow(clippy::type_complexity)]
fn tail_port_py<'py>(
    py: Python<'py>,
    f: PyReadonlyArray1<'py, f64>,
    z: PyReadonlyArray1<'py, Complex64>,
) -> PyResult<(
    Bound<'py, PyArray1<f64>>,
    Bound<'py, PyArray1<Complex64>>,
    Bound<'py, PyDict>,
)> {
    let (f, z) = (f.as_slice()?.to_vec(), z.as_slice()?.to_vec());
    let (f_fit, z_sim, result) =
        py.allow_threads(|| crate::ports::tail_port(&f, &z, &FitConfig::default()))?;
    Ok((
        PyArray1::from_vec_bound(py, f_fit),
        PyArray1::from_vec_bound(py, z_sim),
        result_dict(py, &result)?,
    ))
}

/// Resonator circle fits.
#[pymodule]
fn resofit(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(autofit_py, m)?)?;
    m.add_function(wrap_pyfunction!(tail_port_py, m)?)?;
    Ok(())
}
