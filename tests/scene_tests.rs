//! Scene-description loading and error reporting.

mod common;

use candela::errors::CandelaError;
use candela::scene::{MacroMap, NodeRef, Scene, SceneNodeTag};
use common::write_scene;

#[test]
fn full_scene_loads_with_typed_nodes() {
    let path = write_scene(
        "load-full",
        r#"
        kd : texture constant { v { 0.5, 0.5, 0.5 } semantic { "albedo" } }
        mat : surface matte { kd { @kd } }
        e : texture constant { v { 5, 5, 5 } semantic { "illuminant" } }
        l : light diffuse { emission { @e } }
        floor : shape quad { size { 2 } surface { @mat } }
        lamp : shape quad { size { 1 } light { @l } }
        cam : camera pinhole {
            spp { 4 }
            film : film color { resolution { 4, 4 } }
            file { "$OUT/x.exr" }
        }
        render {
            cameras { @cam }
            shapes { @floor, @lamp }
            integrator : integrator megapath { depth { 3 } }
        }
        "#,
    );
    let scene = Scene::load_file(&path, &MacroMap::default()).unwrap();
    assert_eq!(scene.cameras.len(), 1);
    assert_eq!(scene.root_shapes.len(), 2);
    assert_eq!(scene.surfaces.len(), 1);
    assert_eq!(scene.lights.len(), 1);
    assert_eq!(scene.textures.len(), 2);
    assert_eq!(scene.cameras[0].spp, 4);
}

#[test]
fn shared_nodes_are_cached_by_identifier() {
    let path = write_scene(
        "load-cache",
        r#"
        kd : texture constant { v { 0.5 } }
        mat : surface matte { kd { @kd } }
        a : shape quad { size { 1 } surface { @mat } }
        b : shape quad { size { 2 } surface { @mat } }
        cam : camera pinhole { film : film color { resolution { 2, 2 } } file { "$OUT/y.exr" } }
        render { cameras { @cam } shapes { @a, @b } }
        "#,
    );
    let scene = Scene::load_file(&path, &MacroMap::default()).unwrap();
    // the surface and its texture load once despite two referencing shapes
    assert_eq!(scene.surfaces.len(), 1);
    assert_eq!(scene.textures.len(), 1);
}

#[test]
fn missing_required_property_is_reported_with_the_node() {
    let path = write_scene(
        "load-missing",
        r#"
        mat : surface matte { }
        a : shape quad { surface { @mat } }
        cam : camera pinhole { film : film color { } file { "$OUT/z.exr" } }
        render { cameras { @cam } shapes { @a } }
        "#,
    );
    let err = Scene::load_file(&path, &MacroMap::default()).unwrap_err();
    match err {
        CandelaError::MissingProperty { name, .. } => assert_eq!(name, "kd"),
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn unknown_plugin_is_an_error() {
    let path = write_scene(
        "load-unknown",
        r#"
        s : surface velvet { }
        a : shape quad { surface { @s } }
        cam : camera pinhole { film : film color { } file { "$OUT/u.exr" } }
        render { cameras { @cam } shapes { @a } }
        "#,
    );
    let err = Scene::load_file(&path, &MacroMap::default()).unwrap_err();
    assert!(matches!(err, CandelaError::UnknownPlugin { .. }), "{err}");
}

#[test]
fn unresolved_reference_is_an_error() {
    let path = write_scene(
        "load-unresolved",
        r#"
        cam : camera pinhole { film : film color { } file { "$OUT/v.exr" } }
        render { cameras { @cam } shapes { @ghost } }
        "#,
    );
    let err = Scene::load_file(&path, &MacroMap::default()).unwrap_err();
    assert!(
        matches!(err, CandelaError::UnresolvedReference { .. }),
        "{err}"
    );
}

#[test]
fn deformable_shape_fails_at_pipeline_build() {
    let source = r#"
        kd : texture constant { v { 0.5 } }
        mat : surface matte { kd { @kd } }
        soft : shape quad { surface { @mat } deformable { true } }
        cam : camera pinhole { film : film color { resolution { 2, 2 } } file { "$OUT/d.exr" } }
        render { cameras { @cam } shapes { @soft } }
    "#;
    let path = write_scene("deformable", source);
    let scene = Scene::load_file(&path, &MacroMap::default()).unwrap();
    let device = candela::device::Device::create("cpu", 0).unwrap();
    let err = candela::pipeline::Pipeline::new(device, scene).unwrap_err();
    assert!(matches!(err, CandelaError::DeformableMesh(_)), "{err}");
}

#[test]
fn desc_resolution_checks_tags() {
    let path = write_scene(
        "tags",
        r#"
        kd : texture constant { v { 1 } }
        cam : camera pinhole { film : film color { } file { "$OUT/t.exr" } }
        render { cameras { @cam } }
        "#,
    );
    let scene = Scene::load_file(&path, &MacroMap::default()).unwrap();
    let desc = scene.desc();
    assert!(desc
        .resolve(&NodeRef::Named("kd".into()), SceneNodeTag::Texture)
        .is_ok());
    assert!(desc
        .resolve(&NodeRef::Named("kd".into()), SceneNodeTag::Surface)
        .is_err());
}
