//! Scene-description nodes and their typed property bags.
//!
//! A parsed scene is a tree of [`SceneNodeDesc`]s held in a [`SceneDesc`]
//! arena. Each node carries an identifier, a [`SceneNodeTag`], an
//! implementation string, a source location, and a bag of named property
//! values. Property getters come in required and `_or` flavors: required
//! getters error with the node's source location; recoverable coercions
//! (scalar from a longer list, f64 → int precision loss) go to the warning
//! sink and continue.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use log::warn;
use rustc_hash::FxHashMap;
use slotmap::{new_key_type, SlotMap};

use crate::errors::{CandelaError, Result};

/// Category of a scene node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SceneNodeTag {
    Root,
    Internal,
    Camera,
    Film,
    Filter,
    Shape,
    Surface,
    Light,
    Texture,
    Sampler,
    Integrator,
    Transform,
    Medium,
    Environment,
    Optimizer,
    Loss,
}

impl SceneNodeTag {
    pub fn name(self) -> &'static str {
        match self {
            SceneNodeTag::Root => "root",
            SceneNodeTag::Internal => "internal",
            SceneNodeTag::Camera => "camera",
            SceneNodeTag::Film => "film",
            SceneNodeTag::Filter => "filter",
            SceneNodeTag::Shape => "shape",
            SceneNodeTag::Surface => "surface",
            SceneNodeTag::Light => "light",
            SceneNodeTag::Texture => "texture",
            SceneNodeTag::Sampler => "sampler",
            SceneNodeTag::Integrator => "integrator",
            SceneNodeTag::Transform => "transform",
            SceneNodeTag::Medium => "medium",
            SceneNodeTag::Environment => "environment",
            SceneNodeTag::Optimizer => "optimizer",
            SceneNodeTag::Loss => "loss",
        }
    }

    /// Parses a tag keyword.
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "camera" => SceneNodeTag::Camera,
            "film" => SceneNodeTag::Film,
            "filter" => SceneNodeTag::Filter,
            "shape" => SceneNodeTag::Shape,
            "surface" => SceneNodeTag::Surface,
            "light" => SceneNodeTag::Light,
            "texture" => SceneNodeTag::Texture,
            "sampler" => SceneNodeTag::Sampler,
            "integrator" => SceneNodeTag::Integrator,
            "transform" => SceneNodeTag::Transform,
            "medium" => SceneNodeTag::Medium,
            "environment" => SceneNodeTag::Environment,
            "optimizer" => SceneNodeTag::Optimizer,
            "loss" => SceneNodeTag::Loss,
            _ => return None,
        })
    }
}

impl fmt::Display for SceneNodeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Where a node or error came from in the scene source.
#[derive(Debug, Clone, Default)]
pub struct SourceLocation {
    pub file: Option<Arc<PathBuf>>,
    pub line: u32,
    pub column: u32,
}

impl SourceLocation {
    pub fn new(file: Arc<PathBuf>, line: u32, column: u32) -> Self {
        Self {
            file: Some(file),
            line,
            column,
        }
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.file {
            Some(file) => write!(f, "{}:{}:{}", file.display(), self.line, self.column),
            None => f.write_str("<unknown>"),
        }
    }
}

new_key_type! {
    /// Stable arena key of a description node.
    pub struct NodeKey;
}

/// A reference from a property to another node: either by name or to an
/// anonymous inline child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeRef {
    Named(String),
    Inline(NodeKey),
}

/// One property value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Numbers(Vec<f64>),
    Bools(Vec<bool>),
    Strings(Vec<String>),
    Nodes(Vec<NodeRef>),
    Paths(Vec<PathBuf>),
}

impl Value {
    fn kind(&self) -> &'static str {
        match self {
            Value::Numbers(_) => "number list",
            Value::Bools(_) => "bool list",
            Value::Strings(_) => "string list",
            Value::Nodes(_) => "node list",
            Value::Paths(_) => "path list",
        }
    }
}

/// One description node.
#[derive(Debug, Clone)]
pub struct SceneNodeDesc {
    identifier: String,
    tag: SceneNodeTag,
    impl_type: String,
    location: SourceLocation,
    properties: FxHashMap<String, Value>,
}

impl SceneNodeDesc {
    pub fn new(
        identifier: impl Into<String>,
        tag: SceneNodeTag,
        impl_type: impl Into<String>,
        location: SourceLocation,
    ) -> Self {
        Self {
            identifier: identifier.into(),
            tag,
            impl_type: impl_type.into(),
            location,
            properties: FxHashMap::default(),
        }
    }

    #[inline]
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    #[inline]
    pub fn tag(&self) -> SceneNodeTag {
        self.tag
    }

    /// Implementation string, lowercased at parse time.
    #[inline]
    pub fn impl_type(&self) -> &str {
        &self.impl_type
    }

    #[inline]
    pub fn location(&self) -> &SourceLocation {
        &self.location
    }

    /// Adds a property; redefinition within one node is fatal.
    pub fn add_property(&mut self, name: impl Into<String>, value: Value) -> Result<()> {
        let name = name.into();
        if self.properties.contains_key(&name) {
            return Err(CandelaError::NodeRedefinition(format!(
                "property '{name}' in node '{}'",
                self.identifier
            )));
        }
        self.properties.insert(name, value);
        Ok(())
    }

    pub fn has_property(&self, name: &str) -> bool {
        self.properties.contains_key(name)
    }

    pub fn property_names(&self) -> impl Iterator<Item = &str> {
        self.properties.keys().map(String::as_str)
    }

    fn missing(&self, name: &str) -> CandelaError {
        CandelaError::MissingProperty {
            name: name.to_string(),
            node: self.identifier.clone(),
            location: self.location.clone(),
        }
    }

    fn wrong_type(&self, name: &str, actual: &Value, expected: &'static str) -> CandelaError {
        CandelaError::PropertyType {
            name: name.to_string(),
            node: self.identifier.clone(),
            actual: actual.kind(),
            expected,
        }
    }

    fn numbers(&self, name: &str) -> Result<&[f64]> {
        match self.properties.get(name) {
            None => Err(self.missing(name)),
            Some(Value::Numbers(v)) => Ok(v),
            Some(other) => Err(self.wrong_type(name, other, "number list")),
        }
    }

    // ------------------------------------------------------------------
    // scalar getters
    // ------------------------------------------------------------------

    pub fn property_f32(&self, name: &str) -> Result<f32> {
        let v = self.numbers(name)?;
        match v {
            [] => Err(self.missing(name)),
            [x] => Ok(*x as f32),
            _ => {
                warn!(
                    "Coercing scalar '{name}' from a {}-element list in node '{}'.",
                    v.len(),
                    self.identifier
                );
                Ok(v[0] as f32)
            }
        }
    }

    pub fn property_f32_or(&self, name: &str, default: f32) -> f32 {
        if self.has_property(name) {
            self.property_f32(name).unwrap_or(default)
        } else {
            default
        }
    }

    pub fn property_u32(&self, name: &str) -> Result<u32> {
        let x = f64::from(self.property_f32(name)?);
        let i = x as u32;
        if (i as f64 - x).abs() > 1e-6 {
            warn!(
                "Conversion of property '{name}' (value = {x}) to int loses precision in node '{}'.",
                self.identifier
            );
        }
        Ok(i)
    }

    pub fn property_u32_or(&self, name: &str, default: u32) -> u32 {
        if self.has_property(name) {
            self.property_u32(name).unwrap_or(default)
        } else {
            default
        }
    }

    pub fn property_bool(&self, name: &str) -> Result<bool> {
        match self.properties.get(name) {
            None => Err(self.missing(name)),
            Some(Value::Bools(v)) if !v.is_empty() => Ok(v[0]),
            Some(other @ Value::Bools(_)) => Err(self.wrong_type(name, other, "bool")),
            Some(other) => Err(self.wrong_type(name, other, "bool list")),
        }
    }

    pub fn property_bool_or(&self, name: &str, default: bool) -> bool {
        if self.has_property(name) {
            self.property_bool(name).unwrap_or(default)
        } else {
            default
        }
    }

    pub fn property_string(&self, name: &str) -> Result<String> {
        match self.properties.get(name) {
            None => Err(self.missing(name)),
            Some(Value::Strings(v)) if !v.is_empty() => Ok(v[0].clone()),
            Some(other) => Err(self.wrong_type(name, other, "string list")),
        }
    }

    pub fn property_string_or(&self, name: &str, default: &str) -> String {
        if self.has_property(name) {
            self.property_string(name).unwrap_or_else(|_| default.to_string())
        } else {
            default.to_string()
        }
    }

    // ------------------------------------------------------------------
    // vector getters
    // ------------------------------------------------------------------

    fn property_fixed<const N: usize>(&self, name: &str) -> Result<[f32; N]> {
        let v = self.numbers(name)?;
        if v.len() < N {
            return Err(self.wrong_type(
                name,
                &Value::Numbers(v.to_vec()),
                "longer number list",
            ));
        }
        if v.len() > N {
            warn!(
                "Property '{name}' in node '{}' has {} elements; using the first {N}.",
                self.identifier,
                v.len()
            );
        }
        let mut out = [0.0f32; N];
        for (o, x) in out.iter_mut().zip(v) {
            *o = *x as f32;
        }
        Ok(out)
    }

    pub fn property_v2(&self, name: &str) -> Result<glam::Vec2> {
        self.property_fixed::<2>(name).map(glam::Vec2::from)
    }

    pub fn property_v2_or(&self, name: &str, default: glam::Vec2) -> glam::Vec2 {
        if self.has_property(name) {
            self.property_v2(name)
                .unwrap_or_else(|_| glam::Vec2::splat(self.property_f32_or(name, default.x)))
        } else {
            default
        }
    }

    pub fn property_v3(&self, name: &str) -> Result<glam::Vec3> {
        self.property_fixed::<3>(name).map(glam::Vec3::from)
    }

    pub fn property_v3_or(&self, name: &str, default: glam::Vec3) -> glam::Vec3 {
        if self.has_property(name) {
            self.property_v3(name)
                .unwrap_or_else(|_| glam::Vec3::splat(self.property_f32_or(name, default.x)))
        } else {
            default
        }
    }

    pub fn property_v4_or(&self, name: &str, default: glam::Vec4) -> glam::Vec4 {
        if self.has_property(name) {
            self.property_fixed::<4>(name)
                .map(glam::Vec4::from)
                .unwrap_or_else(|_| glam::Vec4::splat(self.property_f32_or(name, default.x)))
        } else {
            default
        }
    }

    // ------------------------------------------------------------------
    // list getters
    // ------------------------------------------------------------------

    pub fn property_f32_list(&self, name: &str) -> Result<Vec<f32>> {
        Ok(self.numbers(name)?.iter().map(|&x| x as f32).collect())
    }

    pub fn property_f32_list_or_empty(&self, name: &str) -> Vec<f32> {
        self.property_f32_list(name).unwrap_or_default()
    }

    pub fn property_node(&self, name: &str) -> Result<NodeRef> {
        match self.properties.get(name) {
            None => Err(self.missing(name)),
            Some(Value::Nodes(v)) if !v.is_empty() => Ok(v[0].clone()),
            Some(other) => Err(self.wrong_type(name, other, "node list")),
        }
    }

    pub fn property_node_or_none(&self, name: &str) -> Option<NodeRef> {
        self.property_node(name).ok()
    }

    pub fn property_node_list(&self, name: &str) -> Result<Vec<NodeRef>> {
        match self.properties.get(name) {
            None => Err(self.missing(name)),
            Some(Value::Nodes(v)) => Ok(v.clone()),
            Some(other) => Err(self.wrong_type(name, other, "node list")),
        }
    }

    pub fn property_node_list_or_empty(&self, name: &str) -> Vec<NodeRef> {
        self.property_node_list(name).unwrap_or_default()
    }

    pub fn property_path(&self, name: &str) -> Result<PathBuf> {
        match self.properties.get(name) {
            None => Err(self.missing(name)),
            Some(Value::Paths(v)) if !v.is_empty() => Ok(v[0].clone()),
            Some(Value::Strings(v)) if !v.is_empty() => Ok(PathBuf::from(&v[0])),
            Some(other) => Err(self.wrong_type(name, other, "path list")),
        }
    }

    pub fn property_path_or(&self, name: &str, default: impl Into<PathBuf>) -> PathBuf {
        if self.has_property(name) {
            self.property_path(name).unwrap_or_else(|_| default.into())
        } else {
            default.into()
        }
    }
}

/// The parse product: an arena of description nodes with global name
/// resolution.
#[derive(Debug, Default)]
pub struct SceneDesc {
    nodes: SlotMap<NodeKey, SceneNodeDesc>,
    by_name: FxHashMap<String, NodeKey>,
    root: Option<NodeKey>,
}

impl SceneDesc {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defines a named global node. Redefinition is fatal.
    pub fn define(&mut self, node: SceneNodeDesc) -> Result<NodeKey> {
        let name = node.identifier().to_string();
        if self.by_name.contains_key(&name) {
            return Err(CandelaError::NodeRedefinition(name));
        }
        let key = self.nodes.insert(node);
        self.by_name.insert(name, key);
        Ok(key)
    }

    /// Defines an anonymous inline node.
    pub fn define_inline(&mut self, node: SceneNodeDesc) -> NodeKey {
        self.nodes.insert(node)
    }

    /// Defines (or replaces) the root node.
    pub fn define_root(&mut self, node: SceneNodeDesc) -> Result<NodeKey> {
        if self.root.is_some() {
            return Err(CandelaError::NodeRedefinition("<root>".to_string()));
        }
        let key = self.nodes.insert(node);
        self.root = Some(key);
        Ok(key)
    }

    pub fn root(&self) -> Option<&SceneNodeDesc> {
        self.root.map(|k| &self.nodes[k])
    }

    pub fn node(&self, key: NodeKey) -> &SceneNodeDesc {
        &self.nodes[key]
    }

    pub fn node_mut(&mut self, key: NodeKey) -> &mut SceneNodeDesc {
        &mut self.nodes[key]
    }

    /// Resolves a reference, checking the expected tag.
    pub fn resolve(&self, reference: &NodeRef, expected: SceneNodeTag) -> Result<&SceneNodeDesc> {
        let node = match reference {
            NodeRef::Inline(key) => &self.nodes[*key],
            NodeRef::Named(name) => {
                let key = self.by_name.get(name).ok_or_else(|| {
                    CandelaError::UnresolvedReference {
                        identifier: name.clone(),
                        expected: expected.name(),
                    }
                })?;
                &self.nodes[*key]
            }
        };
        if node.tag() != expected && node.tag() != SceneNodeTag::Internal {
            return Err(CandelaError::UnresolvedReference {
                identifier: node.identifier().to_string(),
                expected: expected.name(),
            });
        }
        Ok(node)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &SceneNodeDesc> {
        self.nodes.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node() -> SceneNodeDesc {
        let mut n = SceneNodeDesc::new(
            "n",
            SceneNodeTag::Camera,
            "pinhole",
            SourceLocation::default(),
        );
        n.add_property("spp", Value::Numbers(vec![64.0])).unwrap();
        n.add_property("fov", Value::Numbers(vec![35.5])).unwrap();
        n.add_property("pos", Value::Numbers(vec![1.0, 2.0, 3.0]))
            .unwrap();
        n
    }

    #[test]
    fn required_getter_errors_on_missing() {
        let n = node();
        assert!(n.property_f32("missing").is_err());
        assert_eq!(n.property_u32("spp").unwrap(), 64);
        assert_eq!(n.property_f32_or("missing", 2.5), 2.5);
    }

    #[test]
    fn scalar_coerces_from_list_head() {
        let n = node();
        assert_eq!(n.property_f32("pos").unwrap(), 1.0);
        assert_eq!(
            n.property_v3("pos").unwrap(),
            glam::Vec3::new(1.0, 2.0, 3.0)
        );
    }

    #[test]
    fn property_redefinition_is_fatal() {
        let mut n = node();
        assert!(n.add_property("spp", Value::Numbers(vec![1.0])).is_err());
    }

    #[test]
    fn desc_resolves_named_references() {
        let mut desc = SceneDesc::new();
        desc.define(node()).unwrap();
        let r = NodeRef::Named("n".to_string());
        assert!(desc.resolve(&r, SceneNodeTag::Camera).is_ok());
        assert!(desc.resolve(&r, SceneNodeTag::Film).is_err());
        let missing = NodeRef::Named("absent".to_string());
        assert!(desc.resolve(&missing, SceneNodeTag::Camera).is_err());
    }
}
