//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use std::path::PathBuf;

use candela::device::Device;
use candela::pipeline::Pipeline;
use candela::scene::{MacroMap, Scene};

/// Writes a scene source to a unique temp directory and returns its path.
pub fn write_scene(name: &str, source: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "candela-tests-{}-{name}",
        std::process::id()
    ));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("scene.scene");
    // route render outputs into the same temp dir
    let source = source.replace("$OUT", &dir.display().to_string().replace('\\', "/"));
    std::fs::write(&path, source).unwrap();
    path
}

/// Parses, loads, and builds a pipeline for a scene source.
pub fn build_pipeline(name: &str, source: &str) -> Pipeline {
    let path = write_scene(name, source);
    let scene = Scene::load_file(&path, &MacroMap::default()).unwrap();
    let device = Device::create("cpu", 0).unwrap();
    Pipeline::new(device, scene).unwrap()
}

/// A closed box with a white floor, rear wall, and a downward-facing area
/// light, looked at by a small camera. `$OUT` expands to the temp dir.
pub fn cornell_lite(spp: u32, resolution: u32, integrator: &str, extra: &str) -> String {
    format!(
        r#"
        white_kd : texture constant {{ v {{ 0.75, 0.75, 0.75 }} semantic {{ "albedo" }} }}
        white : surface matte {{ kd {{ @white_kd }} }}
        lamp_e : texture constant {{ v {{ 12, 12, 12 }} semantic {{ "illuminant" }} }}
        lamp_l : light diffuse {{ emission {{ @lamp_e }} }}

        floor : shape quad {{ size {{ 4 }} surface {{ @white }} }}
        wall : shape quad {{
            size {{ 4 }}
            surface {{ @white }}
            transform : transform srt {{ rotation {{ 1, 0, 0, 90 }} translation {{ 0, 1, -2 }} }}
        }}
        lamp : shape quad {{
            size {{ 1.5 }}
            light {{ @lamp_l }}
            transform : transform srt {{ rotation {{ 1, 0, 0, 180 }} translation {{ 0, 2.2, 0 }} }}
        }}

        cam : camera pinhole {{
            spp {{ {spp} }}
            fov {{ 60 }}
            film : film color {{ resolution {{ {resolution}, {resolution} }} }}
            transform : transform view {{ position {{ 0, 1, 3.5 }} look_at {{ 0, 0.8, 0 }} }}
            file {{ "$OUT/render.exr" }}
        }}

        render {{
            cameras {{ @cam }}
            shapes {{ @floor, @wall, @lamp }}
            integrator : integrator {integrator} {{
                depth {{ 5 }}
                sampler : sampler independent {{ seed {{ 7 }} }}
                {extra}
            }}
        }}
        "#
    )
}

/// Mean luminance of an RGBA buffer.
pub fn mean_luminance(pixels: &[f32]) -> f32 {
    let n = pixels.len() / 4;
    let mut sum = 0.0;
    for i in 0..n {
        sum += 0.2126 * pixels[i * 4] + 0.7152 * pixels[i * 4 + 1] + 0.0722 * pixels[i * 4 + 2];
    }
    sum / n as f32
}
