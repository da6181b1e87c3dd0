//! Differentiable-rendering end-to-end behavior.

mod common;

use candela::device::Device;
use candela::pipeline::Pipeline;
use candela::scene::{MacroMap, Scene};

fn scene_source(kd: f32, integrator: &str, out_dir: &str) -> String {
    format!(
        r#"
        kd : texture constant {{ v {{ {kd}, {kd}, {kd} }} semantic {{ "albedo" }} requires_grad {{ true }} }}
        mat : surface matte {{ kd {{ @kd }} }}
        lamp_e : texture constant {{ v {{ 8, 8, 8 }} semantic {{ "illuminant" }} }}
        lamp_l : light diffuse {{ emission {{ @lamp_e }} }}
        floor : shape quad {{ size {{ 4 }} surface {{ @mat }} }}
        lamp : shape quad {{
            size {{ 1.5 }}
            light {{ @lamp_l }}
            transform : transform srt {{ rotation {{ 1, 0, 0, 180 }} translation {{ 0, 2, 0 }} }}
        }}
        cam : camera pinhole {{
            spp {{ 1 }}
            fov {{ 50 }}
            film : film color {{ resolution {{ 6, 6 }} }}
            transform : transform view {{ position {{ 0, 1.2, 2.5 }} look_at {{ 0, 0, 0 }} }}
            file {{ "{out_dir}/render.exr" }}
        }}
        render {{
            cameras {{ @cam }}
            shapes {{ @floor, @lamp }}
            {integrator}
        }}
        "#
    )
}

fn temp_dir(name: &str) -> String {
    let dir = std::env::temp_dir().join(format!("candela-diff-{}-{name}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    dir.display().to_string().replace('\\', "/")
}

fn load_pipeline(dir: &str, source: &str) -> Pipeline {
    let path = std::path::PathBuf::from(dir).join("scene.scene");
    std::fs::write(&path, source).unwrap();
    let scene = Scene::load_file(&path, &MacroMap::default()).unwrap();
    Pipeline::new(Device::create("cpu", 0).unwrap(), scene).unwrap()
}

#[test]
fn external_backward_produces_a_positive_albedo_gradient() {
    let dir = temp_dir("external");
    let integrator = r#"integrator : integrator megapath {
        depth { 2 }
        sampler : sampler independent { seed { 5 } }
    }"#;
    let mut pipeline = load_pipeline(&dir, &scene_source(0.5, integrator, &dir));
    let frames = pipeline.render_with_return().unwrap();
    assert!(common::mean_luminance(&frames[0]) > 0.0);

    // d(loss)/d(pixel) = 1 everywhere: brighter albedo raises every pixel,
    // so the reduced kd gradient must be positive
    let grads = vec![vec![1.0f32; 6 * 6 * 3]];
    pipeline.render_diff(&grads).unwrap();
    let diff = pipeline.differentiation().expect("engine expected");
    let binding = pipeline.texture_instances()[0]
        .binding()
        .expect("kd should be bound")
        .clone();
    let g = diff.constant_gradient(&binding);
    assert!(g.x.is_finite() && g.y.is_finite() && g.z.is_finite());
    assert!(g.x > 0.0, "gradient should be positive, got {g:?}");
    assert!((g.x - g.y).abs() < 1e-4, "gray scene, gray gradient: {g:?}");
}

#[test]
fn gradient_descent_pulls_albedo_toward_the_target() {
    // render the target with a darker albedo, then optimize a brighter one
    // toward it
    let dir = temp_dir("descent");
    let plain = r#"integrator : integrator megapath {
        depth { 2 }
        sampler : sampler independent { seed { 5 } }
    }"#;
    let mut target_pipeline = load_pipeline(&dir, &scene_source(0.2, plain, &dir));
    target_pipeline.render().unwrap();
    let target = format!("{dir}/render.exr");
    assert!(std::path::Path::new(&target).exists());

    let grad_integrator = format!(
        r#"integrator : integrator megapath_grad {{
            depth {{ 2 }}
            iterations {{ 12 }}
            target {{ "{target}" }}
            sampler : sampler independent {{ seed {{ 5 }} }}
        }}"#
    );
    let dir2 = temp_dir("descent-opt");
    let source = scene_source(0.8, &grad_integrator, &dir2)
        + "\n// optimizer picked up from the render block\n";
    let source = source.replace(
        "shapes { @floor, @lamp }",
        "shapes { @floor, @lamp }\n            optimizer : optimizer adam { learning_rate { 0.08 } }",
    );
    let mut pipeline = load_pipeline(&dir2, &source);
    pipeline.render().unwrap();

    let diff = pipeline.differentiation().expect("engine expected");
    let binding = pipeline.texture_instances()[0]
        .binding()
        .expect("kd should be bound")
        .clone();
    let kd = diff.decode_constant(&binding);
    assert!(
        kd.x < 0.8 - 1e-3,
        "albedo should move down from 0.8, got {kd:?}"
    );
    assert!(kd.x >= 0.0);
}

#[test]
fn update_scene_overwrites_parameters() {
    let dir = temp_dir("update");
    let integrator = r#"integrator : integrator megapath {
        depth { 2 }
        sampler : sampler independent { seed { 5 } }
    }"#;
    let mut pipeline = load_pipeline(&dir, &scene_source(0.5, integrator, &dir));
    let binding = pipeline.texture_instances()[0]
        .binding()
        .expect("kd should be bound")
        .clone();
    pipeline
        .update_parameter_from_external(&[candela::pipeline::ExternalParameter::Constant {
            id: 0,
            value: glam::Vec4::new(0.9, 0.8, 0.7, 0.0),
        }])
        .unwrap();
    let diff = pipeline.differentiation().unwrap();
    let v = diff.decode_constant(&binding);
    assert!((v.x - 0.9).abs() < 1e-6);
    assert!((v.z - 0.7).abs() < 1e-6);
}
