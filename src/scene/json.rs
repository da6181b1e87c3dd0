//! The JSON scene-description variant.
//!
//! Mirrors the native text form: the top-level object maps identifiers to
//! `{ "type": "<tag>", "impl": "<name>", "prop": { ... } }` entries, with
//! the special key `"render"` holding the root node. Property values are
//! scalars or arrays of numbers/bools/strings, `"@name"` reference strings,
//! or nested node objects. Macros appear inside strings (`"$KEY"`, keeping
//! the document valid JSON) and substitute textually before the final
//! parse; an optional top-level `"define"` object provides in-file defaults
//! that the command line overrides. A fully substituted string that reads
//! as a number or bool coerces to that type.

use std::path::Path;
use std::sync::Arc;

use serde_json::Value as Json;

use super::desc::{NodeRef, SceneDesc, SceneNodeDesc, SceneNodeTag, SourceLocation, Value};
use super::parser::MacroMap;
use crate::errors::{CandelaError, Result};

pub(crate) fn parse_json_into(
    desc: &mut SceneDesc,
    path: &Path,
    cli_macros: &MacroMap,
) -> Result<()> {
    let text = std::fs::read_to_string(path)?;
    let raw: Json = serde_json::from_str(&text)?;

    // gather in-file defines, then substitute
    let mut macros = MacroMap::default();
    if let Some(defines) = raw.get("define").and_then(Json::as_object) {
        for (k, v) in defines {
            if !cli_macros.contains_key(k) {
                let value = match v {
                    Json::String(s) => s.clone(),
                    other => other.to_string(),
                };
                macros.insert(k.clone(), value);
            }
        }
    }
    let mut text = text;
    let mut keys: Vec<&String> = macros.keys().chain(cli_macros.keys()).collect();
    keys.sort_by_key(|k| std::cmp::Reverse(k.len()));
    for key in keys {
        let value = cli_macros
            .get(key.as_str())
            .or_else(|| macros.get(key.as_str()))
            .cloned()
            .unwrap_or_default();
        text = text.replace(&format!("${key}"), &value);
    }
    let root: Json = serde_json::from_str(&text)?;

    let location = SourceLocation::new(Arc::new(path.to_path_buf()), 0, 0);
    let Json::Object(map) = root else {
        return Err(CandelaError::SceneParse {
            location,
            message: "top-level JSON value must be an object".to_string(),
        });
    };

    let mut ctx = JsonContext {
        desc,
        location,
        inline_counter: 0,
    };
    for (name, body) in &map {
        match name.as_str() {
            "define" => {}
            "import" => {
                let base = path.parent().map(Path::to_path_buf).unwrap_or_default();
                for import in as_string_list(body) {
                    super::parser::parse_into(ctx.desc, &base.join(import), cli_macros)?;
                }
            }
            "render" => {
                let node = ctx.node_from_json("<root>", SceneNodeTag::Root, body)?;
                ctx.desc.define_root(node)?;
            }
            _ => {
                let tag = body
                    .get("type")
                    .and_then(Json::as_str)
                    .and_then(SceneNodeTag::parse)
                    .ok_or_else(|| ctx.error(format!("node '{name}' has no valid \"type\"")))?;
                let node = ctx.node_from_json(name, tag, body)?;
                ctx.desc.define(node)?;
            }
        }
    }
    Ok(())
}

fn as_string_list(v: &Json) -> Vec<String> {
    match v {
        Json::String(s) => vec![s.clone()],
        Json::Array(a) => a
            .iter()
            .filter_map(Json::as_str)
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

struct JsonContext<'a> {
    desc: &'a mut SceneDesc,
    location: SourceLocation,
    inline_counter: usize,
}

impl JsonContext<'_> {
    fn error(&self, message: String) -> CandelaError {
        CandelaError::SceneParse {
            location: self.location.clone(),
            message,
        }
    }

    fn node_from_json(&mut self, name: &str, tag: SceneNodeTag, body: &Json) -> Result<SceneNodeDesc> {
        let impl_type = body
            .get("impl")
            .and_then(Json::as_str)
            .unwrap_or("")
            .to_ascii_lowercase();
        let mut node = SceneNodeDesc::new(name, tag, impl_type, self.location.clone());
        if let Some(props) = body.get("prop").and_then(Json::as_object) {
            for (prop, value) in props {
                let v = self.value_from_json(name, prop, value)?;
                node.add_property(prop.clone(), v)?;
            }
        }
        Ok(node)
    }

    fn value_from_json(&mut self, owner: &str, prop: &str, value: &Json) -> Result<Value> {
        match value {
            Json::Number(n) => Ok(Value::Numbers(vec![n.as_f64().unwrap_or(0.0)])),
            Json::Bool(b) => Ok(Value::Bools(vec![*b])),
            Json::String(s) => Ok(self.string_value(s)),
            Json::Object(_) => {
                let key = self.inline_node(owner, prop, value)?;
                Ok(Value::Nodes(vec![NodeRef::Inline(key)]))
            }
            Json::Array(items) => self.list_value(owner, prop, items),
            Json::Null => Err(self.error(format!("null value for property '{prop}'"))),
        }
    }

    fn string_value(&self, s: &str) -> Value {
        if let Some(name) = s.strip_prefix('@') {
            Value::Nodes(vec![NodeRef::Named(name.to_string())])
        } else if let Ok(n) = s.parse::<f64>() {
            Value::Numbers(vec![n])
        } else if s == "true" || s == "false" {
            Value::Bools(vec![s == "true"])
        } else {
            Value::Strings(vec![s.to_string()])
        }
    }

    fn inline_node(&mut self, owner: &str, prop: &str, body: &Json) -> Result<super::desc::NodeKey> {
        let tag = body
            .get("type")
            .and_then(Json::as_str)
            .and_then(SceneNodeTag::parse)
            .or_else(|| SceneNodeTag::parse(prop))
            .unwrap_or(SceneNodeTag::Internal);
        self.inline_counter += 1;
        let identifier = format!("{owner}${prop}{}", self.inline_counter);
        let node = self.node_from_json(&identifier, tag, body)?;
        Ok(self.desc.define_inline(node))
    }

    fn list_value(&mut self, owner: &str, prop: &str, items: &[Json]) -> Result<Value> {
        let mut numbers = Vec::new();
        let mut bools = Vec::new();
        let mut strings = Vec::new();
        let mut nodes = Vec::new();
        for item in items {
            match item {
                Json::Number(n) => numbers.push(n.as_f64().unwrap_or(0.0)),
                Json::Bool(b) => bools.push(*b),
                Json::String(s) => match self.string_value(s) {
                    Value::Nodes(mut v) => nodes.append(&mut v),
                    Value::Strings(mut v) => strings.append(&mut v),
                    Value::Numbers(mut v) => numbers.append(&mut v),
                    Value::Bools(mut v) => bools.append(&mut v),
                    Value::Paths(_) => unreachable!(),
                },
                Json::Object(_) => {
                    nodes.push(NodeRef::Inline(self.inline_node(owner, prop, item)?));
                }
                _ => return Err(self.error(format!("unsupported list item in '{prop}'"))),
            }
        }
        let kinds =
            usize::from(!numbers.is_empty()) + usize::from(!bools.is_empty())
                + usize::from(!strings.is_empty()) + usize::from(!nodes.is_empty());
        if kinds > 1 {
            return Err(self.error(format!("mixed value types in property '{prop}'")));
        }
        Ok(if !bools.is_empty() {
            Value::Bools(bools)
        } else if !strings.is_empty() {
            Value::Strings(strings)
        } else if !nodes.is_empty() {
            Value::Nodes(nodes)
        } else {
            Value::Numbers(numbers)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::parser::parse_scene_file;

    #[test]
    fn json_variant_mirrors_the_text_form() {
        let dir = std::env::temp_dir().join(format!("candela-json-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("scene.json");
        std::fs::write(
            &path,
            r#"{
                "define": { "SPP": 4 },
                "cam": {
                    "type": "camera",
                    "impl": "pinhole",
                    "prop": {
                        "spp": "$SPP",
                        "film": { "type": "film", "impl": "color",
                                  "prop": { "resolution": [32, 32] } }
                    }
                },
                "render": { "impl": "render", "prop": { "cameras": ["@cam"] } }
            }"#,
        )
        .unwrap();
        let desc = parse_scene_file(&path, &MacroMap::default()).unwrap();
        let root = desc.root().unwrap();
        let cams = root.property_node_list("cameras").unwrap();
        let cam = desc.resolve(&cams[0], SceneNodeTag::Camera).unwrap();
        assert_eq!(cam.property_u32("spp").unwrap(), 4);
    }
}
