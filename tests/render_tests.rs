//! End-to-end renders on tiny scenes.

mod common;

use common::{build_pipeline, cornell_lite, mean_luminance};
use glam::UVec2;

#[test]
fn environment_only_scene_reproduces_the_map() {
    // a constant environment map and no geometry: every pixel must equal
    // the map value (filter weight is 1)
    let source = r#"
        env_e : texture constant { v { 0.25, 0.5, 0.75 } semantic { "illuminant" } }
        cam : camera pinhole {
            spp { 1 }
            fov { 60 }
            film : film color { resolution { 8, 8 } }
            file { "$OUT/env.exr" }
        }
        render {
            cameras { @cam }
            environment : environment map { emission { @env_e } }
            integrator : integrator megapath {
                depth { 1 }
                sampler : sampler independent { seed { 1 } }
            }
        }
    "#;
    let mut pipeline = build_pipeline("env-only", source);
    let frames = pipeline.render_with_return().unwrap();
    let img = &frames[0];
    for px in img.chunks_exact(4) {
        assert!((px[0] - 0.25).abs() < 1e-4, "r = {}", px[0]);
        assert!((px[1] - 0.5).abs() < 1e-4);
        assert!((px[2] - 0.75).abs() < 1e-4);
    }
}

#[test]
fn cornell_lite_megakernel_sees_light() {
    let mut pipeline = build_pipeline("cornell-mega", &cornell_lite(16, 16, "megapath", ""));
    let frames = pipeline.render_with_return().unwrap();
    let img = &frames[0];
    let mean = mean_luminance(img);
    assert!(mean > 0.01, "scene is black: mean = {mean}");
    assert!(mean < 50.0, "scene blew up: mean = {mean}");
    for v in img {
        assert!(v.is_finite());
    }
    // the floor center should be lit
    let film = pipeline.film(0);
    let (center, w) = film.read(UVec2::new(8, 10));
    assert!(w > 0.0);
    assert!(center.max_element() > 0.0);
}

#[test]
fn wavefront_agrees_with_megakernel() {
    let mut mega = build_pipeline("agree-mega", &cornell_lite(32, 12, "megapath", ""));
    let mega_img = mega.render_with_return().unwrap().remove(0);
    let mut wave = build_pipeline("agree-wave", &cornell_lite(32, 12, "wavepath", ""));
    let wave_img = wave.render_with_return().unwrap().remove(0);
    let a = mean_luminance(&mega_img);
    let b = mean_luminance(&wave_img);
    assert!(a > 0.0 && b > 0.0);
    let ratio = a / b;
    assert!(
        (0.7..1.4).contains(&ratio),
        "megakernel {a} vs wavefront {b}"
    );
}

#[test]
fn renders_are_deterministic_for_a_fixed_seed() {
    let mut p1 = build_pipeline("det-a", &cornell_lite(8, 8, "megapath", ""));
    let img1 = p1.render_with_return().unwrap().remove(0);
    let mut p2 = build_pipeline("det-b", &cornell_lite(8, 8, "megapath", ""));
    let img2 = p2.render_with_return().unwrap().remove(0);
    assert_eq!(img1, img2);
}

#[test]
fn aov_integrator_runs_and_saves() {
    let mut pipeline = build_pipeline(
        "aov",
        &cornell_lite(4, 8, "aov", r#"components { "normal,depth,mask,albedo" } dump { "final" }"#),
    );
    let frames = pipeline.render_with_return().unwrap();
    assert!(mean_luminance(&frames[0]) > 0.0);
}

#[test]
fn volumetric_integrator_handles_a_plain_scene() {
    let mut pipeline = build_pipeline("vpt-plain", &cornell_lite(8, 8, "vpt", ""));
    let frames = pipeline.render_with_return().unwrap();
    let mean = mean_luminance(&frames[0]);
    assert!(mean > 0.0 && mean.is_finite());
}

#[test]
fn photon_mapping_produces_light() {
    let mut pipeline = build_pipeline(
        "photon",
        &cornell_lite(4, 8, "photon", "photons_per_iteration { 4096 }"),
    );
    let frames = pipeline.render_with_return().unwrap();
    let mean = mean_luminance(&frames[0]);
    assert!(mean > 0.0 && mean.is_finite(), "mean = {mean}");
}

#[test]
fn pssmlt_matches_independent_sampling_roughly() {
    let mut mc = build_pipeline("pssmlt-ref", &cornell_lite(64, 6, "megapath", ""));
    let mc_img = mc.render_with_return().unwrap().remove(0);
    let mut mlt = build_pipeline("pssmlt", &cornell_lite(64, 6, "pssmlt", "sigma { 0.02 }"));
    let mlt_img = mlt.render_with_return().unwrap().remove(0);
    let a = mean_luminance(&mc_img);
    let b = mean_luminance(&mlt_img);
    assert!(b.is_finite() && b > 0.0, "pssmlt produced {b}");
    let ratio = a / b;
    assert!((0.4..2.5).contains(&ratio), "mc {a} vs pssmlt {b}");
}

#[test]
fn dynamic_transform_moves_between_shutter_samples() {
    // an animated occluder sweeping over the lamp changes nothing fatal:
    // render completes with finite output
    let source = r#"
        white_kd : texture constant { v { 0.7, 0.7, 0.7 } semantic { "albedo" } }
        white : surface matte { kd { @white_kd } }
        lamp_e : texture constant { v { 10, 10, 10 } semantic { "illuminant" } }
        lamp_l : light diffuse { emission { @lamp_e } }
        floor : shape quad { size { 4 } surface { @white } }
        lamp : shape quad {
            size { 1 }
            light { @lamp_l }
            transform : transform srt { rotation { 1, 0, 0, 180 } translation { 0, 2, 0 } }
        }
        mover : shape cube {
            size { 0.5 }
            surface { @white }
            transform : transform lerp {
                time_span { 0, 1 }
                translation_begin { -2, 0.5, 0 }
                translation_end { 2, 0.5, 0 }
            }
        }
        cam : camera pinhole {
            spp { 8 }
            shutter_span { 0, 1 }
            shutter_samples { 4 }
            fov { 60 }
            film : film color { resolution { 8, 8 } }
            transform : transform view { position { 0, 1, 3 } look_at { 0, 0.5, 0 } }
            file { "$OUT/motion.exr" }
        }
        render {
            cameras { @cam }
            shapes { @floor, @lamp, @mover }
            integrator : integrator megapath {
                depth { 3 }
                sampler : sampler independent { seed { 2 } }
            }
        }
    "#;
    let mut pipeline = build_pipeline("motion", source);
    let frames = pipeline.render_with_return().unwrap();
    for v in &frames[0] {
        assert!(v.is_finite());
    }
}

#[test]
fn tile_shared_sampler_renders() {
    let mut pipeline = build_pipeline(
        "tiled",
        &cornell_lite(8, 8, "megapath", "")
            .replace(
                "sampler : sampler independent { seed { 7 } }",
                "sampler : sampler tile_shared { tile_size { 4 } jitter { true } base : sampler pmj02bn { seed { 3 } } }",
            ),
    );
    let frames = pipeline.render_with_return().unwrap();
    assert!(mean_luminance(&frames[0]) > 0.0);
}
