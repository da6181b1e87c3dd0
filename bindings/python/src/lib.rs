//! Python bindings for the Candela renderer.
//!
//! Surface: `init()`, `load_scene(argv)`, `render() -> [ptr]`,
//! `render_backward(grad_ptrs, sizes)`, `update_scene(params)`,
//! `get_gradients() -> ([ptr], [ptr])`. Pixel buffers are handed over as
//! raw pointers into leaked host allocations owned by the module, which is
//! how the training loops on the other side expect to zero-copy them.

use std::path::PathBuf;
use std::sync::Mutex;

use glam::Vec4;
use pyo3::exceptions::PyRuntimeError;
use pyo3::prelude::*;
use pyo3::types::PyDict;

use candela::device::Device;
use candela::pipeline::{ExternalParameter, Pipeline};
use candela::scene::{parse_cli_macros, Scene};

struct BindingState {
    pipeline: Option<Pipeline>,
    // keep returned buffers alive for the caller
    frames: Vec<Vec<f32>>,
    gradients: (Vec<Vec<f32>>, Vec<Vec<f32>>),
}

static STATE: Mutex<BindingState> = Mutex::new(BindingState {
    pipeline: None,
    frames: Vec::new(),
    gradients: (Vec::new(), Vec::new()),
});

fn runtime_error(e: impl std::fmt::Display) -> PyErr {
    PyRuntimeError::new_err(e.to_string())
}

/// Initializes logging; call once before anything else.
#[pyfunction]
fn init() {
    let _ = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info"),
    )
    .try_init();
}

/// Loads a scene from renderer-style argv: `[scene_file, -b, <backend>,
/// -d, <index>, -D, key=value, ...]`.
#[pyfunction]
fn load_scene(argv: Vec<String>) -> PyResult<()> {
    let mut backend = "cpu".to_string();
    let mut device_index = 0u32;
    let mut defines = Vec::new();
    let mut scene_file = None;
    let mut it = argv.iter();
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "-b" | "--backend" => {
                backend = it.next().cloned().unwrap_or_else(|| "cpu".to_string());
            }
            "-d" | "--device" => {
                device_index = it.next().and_then(|v| v.parse().ok()).unwrap_or(0);
            }
            "-D" | "--define" => {
                if let Some(d) = it.next() {
                    defines.push(d.clone());
                }
            }
            other => scene_file = Some(PathBuf::from(other)),
        }
    }
    let scene_file =
        scene_file.ok_or_else(|| PyRuntimeError::new_err("no scene file in argv"))?;
    let macros = parse_cli_macros(&defines).map_err(runtime_error)?;
    let device = Device::create(&backend, device_index).map_err(runtime_error)?;
    let scene = Scene::load_file(&scene_file, &macros).map_err(runtime_error)?;
    let pipeline = Pipeline::new(device, scene).map_err(runtime_error)?;
    STATE.lock().unwrap().pipeline = Some(pipeline);
    Ok(())
}

/// Renders every camera and returns one host pointer per frame buffer
/// (RGBA f32, row-major).
#[pyfunction]
fn render() -> PyResult<Vec<u64>> {
    let mut state = STATE.lock().unwrap();
    let pipeline = state
        .pipeline
        .as_mut()
        .ok_or_else(|| PyRuntimeError::new_err("load_scene must run first"))?;
    let frames = pipeline.render_with_return().map_err(runtime_error)?;
    state.frames = frames;
    Ok(state
        .frames
        .iter()
        .map(|f| f.as_ptr() as u64)
        .collect())
}

/// Backward pass with caller-supplied pixel-gradient buffers (RGB f32 per
/// pixel). `sizes` carries the float count behind each pointer.
#[pyfunction]
fn render_backward(grad_ptr: Vec<u64>, sizes: Vec<u32>) -> PyResult<()> {
    let mut state = STATE.lock().unwrap();
    let pipeline = state
        .pipeline
        .as_mut()
        .ok_or_else(|| PyRuntimeError::new_err("load_scene must run first"))?;
    let mut buffers = Vec::with_capacity(grad_ptr.len());
    for (ptr, n) in grad_ptr.iter().zip(&sizes) {
        // SAFETY: the caller promises each pointer addresses `n` floats
        // that stay alive for the duration of this call.
        let slice = unsafe { std::slice::from_raw_parts(*ptr as *const f32, *n as usize) };
        buffers.push(slice.to_vec());
    }
    pipeline.render_diff(&buffers).map_err(runtime_error)
}

/// Updates parameters from external buffers. Each entry is a dict with
/// `type` ("constant" | "texture" | "geom"), `id`, and either `value`
/// (constant) or `buffer_ptr` + `size` (texture/geom).
#[pyfunction]
fn update_scene(py: Python<'_>, params: Vec<Py<PyDict>>) -> PyResult<()> {
    let mut state = STATE.lock().unwrap();
    let pipeline = state
        .pipeline
        .as_mut()
        .ok_or_else(|| PyRuntimeError::new_err("load_scene must run first"))?;
    let mut updates = Vec::new();
    for p in &params {
        let p = p.bind(py);
        let kind: String = p
            .get_item("type")?
            .ok_or_else(|| PyRuntimeError::new_err("parameter without type"))?
            .extract()?;
        let id: u64 = p
            .get_item("id")?
            .map(|v| v.extract())
            .transpose()?
            .unwrap_or(0);
        match kind.as_str() {
            "constant" => {
                let value: Vec<f32> = p
                    .get_item("value")?
                    .map(|v| v.extract())
                    .transpose()?
                    .unwrap_or_default();
                let mut v = Vec4::ZERO;
                for (i, x) in value.iter().take(4).enumerate() {
                    v[i] = *x;
                }
                updates.push(ExternalParameter::Constant {
                    id: id as u32,
                    value: v,
                });
            }
            "texture" => {
                let ptr: u64 = p
                    .get_item("buffer_ptr")?
                    .map(|v| v.extract())
                    .transpose()?
                    .unwrap_or(0);
                let size: u64 = p
                    .get_item("size")?
                    .map(|v| v.extract())
                    .transpose()?
                    .unwrap_or(0);
                // SAFETY: caller-owned buffer of `size` floats, alive for
                // the call.
                let data = unsafe {
                    std::slice::from_raw_parts(ptr as *const f32, size as usize)
                }
                .to_vec();
                updates.push(ExternalParameter::Texture {
                    id: id as usize,
                    data,
                });
            }
            "geom" => updates.push(ExternalParameter::Geometry { id: id as usize }),
            other => {
                return Err(PyRuntimeError::new_err(format!(
                    "unknown parameter type '{other}'"
                )))
            }
        }
    }
    pipeline
        .update_parameter_from_external(&updates)
        .map_err(runtime_error)
}

/// Returns `(texture_gradient_ptrs, geometry_gradient_ptrs)`.
#[pyfunction]
fn get_gradients() -> PyResult<(Vec<u64>, Vec<u64>)> {
    let mut state = STATE.lock().unwrap();
    let pipeline = state
        .pipeline
        .as_mut()
        .ok_or_else(|| PyRuntimeError::new_err("load_scene must run first"))?;
    let gradients = pipeline.get_gradients();
    state.gradients = gradients;
    Ok((
        state
            .gradients
            .0
            .iter()
            .map(|g| g.as_ptr() as u64)
            .collect(),
        state
            .gradients
            .1
            .iter()
            .map(|g| g.as_ptr() as u64)
            .collect(),
    ))
}

#[pymodule]
fn candela_binding(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(init, m)?)?;
    m.add_function(wrap_pyfunction!(load_scene, m)?)?;
    m.add_function(wrap_pyfunction!(render, m)?)?;
    m.add_function(wrap_pyfunction!(render_backward, m)?)?;
    m.add_function(wrap_pyfunction!(update_scene, m)?)?;
    m.add_function(wrap_pyfunction!(get_gradients, m)?)?;
    Ok(())
}
