//! Medium tracker invariants and volumetric rendering.

mod common;

use candela::mediums::{MediumNode, MediumTracker};
use common::{build_pipeline, mean_luminance};
use glam::Vec3;

#[test]
fn enter_exit_restores_size_and_current() {
    let mut t = MediumTracker::new();
    t.enter(2, 4);
    let size = t.size();
    let current = t.current();
    t.enter(5, 9);
    t.exit(5, 9);
    assert_eq!(t.size(), size);
    assert_eq!(t.current(), current);
}

#[test]
fn duplicate_entries_need_matching_exits() {
    let mut t = MediumTracker::new();
    t.enter(1, 2);
    t.enter(1, 2);
    assert_eq!(t.size(), 2);
    t.exit(1, 2);
    assert_eq!(t.size(), 1);
    assert!(!t.vacuum());
    t.exit(1, 2);
    assert!(t.vacuum());
    // a stale exit on an empty stack is ignored
    t.exit(1, 2);
    assert!(t.vacuum());
}

#[test]
fn transmittance_decays_with_distance() {
    let m = MediumNode::Homogeneous {
        sigma_a: Vec3::splat(0.5),
        sigma_s: Vec3::splat(0.5),
        g: 0.2,
        eta: 1.0,
        priority: 0,
    };
    let t1 = m.transmittance(1.0);
    let t2 = m.transmittance(2.0);
    assert!(t2.x < t1.x);
    assert!((t1.x - (-1.0f32).exp()).abs() < 1e-5);
}

#[test]
fn volumetric_scene_with_fog_stays_finite_and_dims_the_light() {
    let fog = |density: f32| {
        format!(
            r#"
            white_kd : texture constant {{ v {{ 0.7, 0.7, 0.7 }} semantic {{ "albedo" }} }}
            white : surface matte {{ kd {{ @white_kd }} }}
            lamp_e : texture constant {{ v {{ 10, 10, 10 }} semantic {{ "illuminant" }} }}
            lamp_l : light diffuse {{ emission {{ @lamp_e }} }}
            fog : medium homogeneous {{
                sigma_a {{ {density}, {density}, {density} }}
                sigma_s {{ 0.01, 0.01, 0.01 }}
                priority {{ 1 }}
            }}
            floor : shape quad {{ size {{ 4 }} surface {{ @white }} }}
            lamp : shape quad {{
                size {{ 1.5 }}
                light {{ @lamp_l }}
                transform : transform srt {{ rotation {{ 1, 0, 0, 180 }} translation {{ 0, 2, 0 }} }}
            }}
            aquarium : shape cube {{
                size {{ 6 }}
                medium {{ @fog }}
            }}
            cam : camera pinhole {{
                spp {{ 8 }}
                fov {{ 60 }}
                film : film color {{ resolution {{ 6, 6 }} }}
                transform : transform view {{ position {{ 0, 1, 2.5 }} look_at {{ 0, 0.5, 0 }} }}
                file {{ "$OUT/fog.exr" }}
            }}
            render {{
                cameras {{ @cam }}
                shapes {{ @floor, @lamp, @aquarium }}
                integrator : integrator vpt {{
                    depth {{ 4 }}
                    sampler : sampler independent {{ seed {{ 9 }} }}
                }}
            }}
            "#
        )
    };
    let mut thin = build_pipeline("fog-thin", &fog(0.01));
    let thin_img = thin.render_with_return().unwrap().remove(0);
    let mut thick = build_pipeline("fog-thick", &fog(1.5));
    let thick_img = thick.render_with_return().unwrap().remove(0);
    let a = mean_luminance(&thin_img);
    let b = mean_luminance(&thick_img);
    assert!(a.is_finite() && b.is_finite());
    assert!(a > 0.0);
    assert!(
        b < a,
        "absorbing fog must dim the image: thin {a} vs thick {b}"
    );
}
