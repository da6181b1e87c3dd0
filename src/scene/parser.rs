//! The text scene-description parser.
//!
//! Grammar (brace-delimited, whitespace-insensitive):
//!
//! ```text
//! // comment
//! import "other_scene.scene"
//! define SPP 256
//!
//! camera : camera pinhole {
//!     spp { $SPP }
//!     film : film color { resolution { 1024, 768 } }
//!     transform { @camera_pose }
//!     file { "outputs/render.exr" }
//! }
//!
//! render {
//!     cameras { @camera }
//!     integrator : integrator megapath { depth { 10 } }
//!     shapes { @floor, @bunny }
//! }
//! ```
//!
//! Properties are `name { values }` lists (numbers, `true`/`false`,
//! `"strings"`, `@references`) or `name : tag impl { body }` inline nodes;
//! an omitted tag is inferred from the property name. Macros are textual:
//! `define KEY value` in the file, `-D KEY=value` on the command line, with
//! the command line taking precedence. `import` includes another file into
//! the same description.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustc_hash::FxHashMap;

use super::desc::{NodeRef, SceneDesc, SceneNodeDesc, SceneNodeTag, SourceLocation, Value};
use crate::errors::{CandelaError, Result};

/// Macro table: command-line definitions take precedence over in-file ones.
pub type MacroMap = FxHashMap<String, String>;

/// Parses a scene file (text DSL or JSON by extension) into a description.
pub fn parse_scene_file(path: &Path, cli_macros: &MacroMap) -> Result<SceneDesc> {
    let mut desc = SceneDesc::new();
    parse_into(&mut desc, path, cli_macros)?;
    Ok(desc)
}

pub(crate) fn parse_into(desc: &mut SceneDesc, path: &Path, cli_macros: &MacroMap) -> Result<()> {
    if !path.exists() {
        return Err(CandelaError::SceneFileNotFound(path.to_path_buf()));
    }
    if path
        .extension()
        .is_some_and(|e| e.eq_ignore_ascii_case("json"))
    {
        return super::json::parse_json_into(desc, path, cli_macros);
    }
    let source = std::fs::read_to_string(path)?;
    let source = expand_macros(&source, cli_macros)?;
    let mut parser = Parser::new(desc, &source, path.to_path_buf(), cli_macros);
    parser.parse_all()
}

/// Strips `define` lines and substitutes `$KEY` occurrences. Textual
/// substitution happens before parsing; the command line wins on conflicts.
fn expand_macros(source: &str, cli_macros: &MacroMap) -> Result<String> {
    let mut macros: MacroMap = MacroMap::default();
    let mut body = String::with_capacity(source.len());
    for line in source.lines() {
        let trimmed = line.trim_start();
        if let Some(rest) = trimmed.strip_prefix("define ") {
            let mut parts = rest.splitn(2, char::is_whitespace);
            let key = parts
                .next()
                .filter(|k| !k.is_empty())
                .ok_or_else(|| CandelaError::InvalidMacro(rest.to_string()))?;
            let value = parts.next().unwrap_or("").trim().to_string();
            if !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                return Err(CandelaError::InvalidMacro(key.to_string()));
            }
            if !cli_macros.contains_key(key) {
                macros.insert(key.to_string(), value);
            }
            body.push('\n'); // keep line numbers stable
            continue;
        }
        body.push_str(line);
        body.push('\n');
    }
    // substitute; longest key first so $AB is not eaten by $A
    let mut keys: Vec<&String> = macros.keys().chain(cli_macros.keys()).collect();
    keys.sort_by_key(|k| std::cmp::Reverse(k.len()));
    let mut out = body;
    for key in keys {
        let value = cli_macros
            .get(key.as_str())
            .or_else(|| macros.get(key.as_str()))
            .cloned()
            .unwrap_or_default();
        out = out.replace(&format!("${key}"), &value);
    }
    Ok(out)
}

struct Parser<'a> {
    desc: &'a mut SceneDesc,
    chars: Vec<char>,
    pos: usize,
    line: u32,
    column: u32,
    file: Arc<PathBuf>,
    cli_macros: &'a MacroMap,
    inline_counter: usize,
}

impl<'a> Parser<'a> {
    fn new(
        desc: &'a mut SceneDesc,
        source: &str,
        file: PathBuf,
        cli_macros: &'a MacroMap,
    ) -> Self {
        Self {
            desc,
            chars: source.chars().collect(),
            pos: 0,
            line: 1,
            column: 1,
            file: Arc::new(file),
            cli_macros,
            inline_counter: 0,
        }
    }

    fn location(&self) -> SourceLocation {
        SourceLocation::new(Arc::clone(&self.file), self.line, self.column)
    }

    fn error(&self, message: impl Into<String>) -> CandelaError {
        CandelaError::SceneParse {
            location: self.location(),
            message: message.into(),
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn skip_whitespace(&mut self) {
        loop {
            match self.peek() {
                Some(c) if c.is_whitespace() => {
                    self.bump();
                }
                Some('/') if self.chars.get(self.pos + 1) == Some(&'/') => {
                    while let Some(c) = self.bump() {
                        if c == '\n' {
                            break;
                        }
                    }
                }
                _ => break,
            }
        }
    }

    fn eof(&mut self) -> bool {
        self.skip_whitespace();
        self.pos >= self.chars.len()
    }

    fn expect(&mut self, c: char) -> Result<()> {
        self.skip_whitespace();
        match self.bump() {
            Some(got) if got == c => Ok(()),
            Some(got) => Err(self.error(format!("expected '{c}', found '{got}'"))),
            None => Err(self.error(format!("expected '{c}', found end of input"))),
        }
    }

    fn read_identifier(&mut self) -> Result<String> {
        self.skip_whitespace();
        let mut ident = String::new();
        match self.peek() {
            Some(c) if c.is_ascii_alphabetic() || c == '_' => {
                ident.push(c);
                self.bump();
            }
            Some(c) => return Err(self.error(format!("expected identifier, found '{c}'"))),
            None => return Err(self.error("expected identifier, found end of input")),
        }
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                ident.push(c);
                self.bump();
            } else {
                break;
            }
        }
        Ok(ident)
    }

    fn read_string(&mut self) -> Result<String> {
        self.expect('"')?;
        let mut s = String::new();
        loop {
            match self.bump() {
                Some('"') => return Ok(s),
                Some('\\') => match self.bump() {
                    Some(c) => s.push(c),
                    None => return Err(self.error("unterminated string")),
                },
                Some(c) => s.push(c),
                None => return Err(self.error("unterminated string")),
            }
        }
    }

    fn read_number(&mut self) -> Result<f64> {
        self.skip_whitespace();
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() || matches!(c, '+' | '-' | '.' | 'e' | 'E') {
                self.bump();
            } else {
                break;
            }
        }
        let text: String = self.chars[start..self.pos].iter().collect();
        text.parse::<f64>()
            .map_err(|_| self.error(format!("invalid number '{text}'")))
    }

    fn parse_all(&mut self) -> Result<()> {
        while !self.eof() {
            let ident = self.read_identifier()?;
            match ident.as_str() {
                "import" => {
                    let rel = self.read_string()?;
                    let base = self.file.parent().map(Path::to_path_buf).unwrap_or_default();
                    let target = base.join(rel);
                    parse_into(self.desc, &target, self.cli_macros)?;
                }
                "render" => {
                    let node = SceneNodeDesc::new(
                        "<root>",
                        SceneNodeTag::Root,
                        "render",
                        self.location(),
                    );
                    let node = self.parse_node_body(node)?;
                    self.desc.define_root(node)?;
                }
                name => {
                    self.expect(':')?;
                    let tag_word = self.read_identifier()?;
                    let tag = SceneNodeTag::parse(&tag_word)
                        .ok_or_else(|| self.error(format!("unknown node tag '{tag_word}'")))?;
                    let impl_type = self.read_identifier()?.to_ascii_lowercase();
                    let node = SceneNodeDesc::new(name, tag, impl_type, self.location());
                    let node = self.parse_node_body(node)?;
                    self.desc.define(node)?;
                }
            }
        }
        Ok(())
    }

    fn parse_node_body(&mut self, mut node: SceneNodeDesc) -> Result<SceneNodeDesc> {
        self.expect('{')?;
        loop {
            self.skip_whitespace();
            if self.peek() == Some('}') {
                self.bump();
                return Ok(node);
            }
            let prop = self.read_identifier()?;
            self.skip_whitespace();
            match self.peek() {
                Some(':') => {
                    // inline node property; tag inferred from the property
                    // name when not a known tag keyword
                    self.bump();
                    self.skip_whitespace();
                    let first = self.read_identifier()?;
                    let (tag, impl_type) = match SceneNodeTag::parse(&first) {
                        Some(tag) => (tag, self.read_identifier()?.to_ascii_lowercase()),
                        None => (
                            SceneNodeTag::parse(&prop).unwrap_or(SceneNodeTag::Internal),
                            first.to_ascii_lowercase(),
                        ),
                    };
                    self.inline_counter += 1;
                    let identifier =
                        format!("{}$inline{}", node.identifier(), self.inline_counter);
                    let inline = SceneNodeDesc::new(identifier, tag, impl_type, self.location());
                    let inline = self.parse_node_body(inline)?;
                    let key = self.desc.define_inline(inline);
                    node.add_property(prop, Value::Nodes(vec![NodeRef::Inline(key)]))?;
                }
                Some('{') => {
                    let value = self.parse_value_list()?;
                    node.add_property(prop, value)?;
                }
                other => {
                    return Err(self.error(format!(
                        "expected '{{' or ':' after property '{prop}', found {other:?}"
                    )))
                }
            }
        }
    }

    fn parse_value_list(&mut self) -> Result<Value> {
        self.expect('{')?;
        let mut value: Option<Value> = None;
        loop {
            self.skip_whitespace();
            match self.peek() {
                Some('}') => {
                    self.bump();
                    return Ok(value.unwrap_or(Value::Numbers(Vec::new())));
                }
                Some(',') => {
                    self.bump();
                }
                Some('"') => {
                    let s = self.read_string()?;
                    match &mut value {
                        None => value = Some(Value::Strings(vec![s])),
                        Some(Value::Strings(v)) => v.push(s),
                        Some(_) => return Err(self.error("mixed value types in property list")),
                    }
                }
                Some('@') => {
                    self.bump();
                    let name = self.read_identifier()?;
                    let r = NodeRef::Named(name);
                    match &mut value {
                        None => value = Some(Value::Nodes(vec![r])),
                        Some(Value::Nodes(v)) => v.push(r),
                        Some(_) => return Err(self.error("mixed value types in property list")),
                    }
                }
                Some(c) if c.is_ascii_alphabetic() => {
                    let word = self.read_identifier()?;
                    let b = match word.as_str() {
                        "true" => true,
                        "false" => false,
                        other => {
                            return Err(self.error(format!("unexpected word '{other}' in list")))
                        }
                    };
                    match &mut value {
                        None => value = Some(Value::Bools(vec![b])),
                        Some(Value::Bools(v)) => v.push(b),
                        Some(_) => return Err(self.error("mixed value types in property list")),
                    }
                }
                Some(_) => {
                    let n = self.read_number()?;
                    match &mut value {
                        None => value = Some(Value::Numbers(vec![n])),
                        Some(Value::Numbers(v)) => v.push(n),
                        Some(_) => return Err(self.error("mixed value types in property list")),
                    }
                }
                None => return Err(self.error("unterminated property list")),
            }
        }
    }
}

/// Parses `-D key=value` command-line macro definitions.
pub fn parse_cli_macros(defines: &[String]) -> Result<MacroMap> {
    let mut macros = MacroMap::default();
    for d in defines {
        let (key, value) = d
            .split_once('=')
            .ok_or_else(|| CandelaError::InvalidMacro(d.clone()))?;
        if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(CandelaError::InvalidMacro(d.clone()));
        }
        macros.insert(key.to_string(), value.to_string());
    }
    Ok(macros)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_str(source: &str) -> Result<SceneDesc> {
        let dir = std::env::temp_dir().join(format!(
            "candela-parse-{}-{:p}",
            std::process::id(),
            &source
        ));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("scene.scene");
        std::fs::write(&path, source).unwrap();
        parse_scene_file(&path, &MacroMap::default())
    }

    #[test]
    fn parses_nodes_and_inline_properties() {
        let desc = parse_str(
            r#"
            // a camera
            cam : camera pinhole {
                spp { 16 }
                fov { 35.0 }
                film : film color { resolution { 64, 64 } }
                file { "out.exr" }
            }
            render {
                cameras { @cam }
            }
            "#,
        )
        .unwrap();
        let root = desc.root().unwrap();
        let cams = root.property_node_list("cameras").unwrap();
        let cam = desc.resolve(&cams[0], SceneNodeTag::Camera).unwrap();
        assert_eq!(cam.property_u32("spp").unwrap(), 16);
        let film_ref = cam.property_node("film").unwrap();
        let film = desc.resolve(&film_ref, SceneNodeTag::Film).unwrap();
        assert_eq!(film.property_v2("resolution").unwrap(), glam::Vec2::new(64.0, 64.0));
    }

    #[test]
    fn macros_substitute_with_cli_precedence() {
        let dir = std::env::temp_dir().join(format!("candela-macro-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("m.scene");
        std::fs::write(
            &path,
            "define SPP 8\ncam : camera pinhole { spp { $SPP } }\n",
        )
        .unwrap();
        let d = parse_scene_file(&path, &MacroMap::default()).unwrap();
        let cam = d
            .resolve(&NodeRef::Named("cam".into()), SceneNodeTag::Camera)
            .unwrap();
        assert_eq!(cam.property_u32("spp").unwrap(), 8);

        let cli = parse_cli_macros(&["SPP=32".to_string()]).unwrap();
        let d = parse_scene_file(&path, &cli).unwrap();
        let cam = d
            .resolve(&NodeRef::Named("cam".into()), SceneNodeTag::Camera)
            .unwrap();
        assert_eq!(cam.property_u32("spp").unwrap(), 32);
    }

    #[test]
    fn bad_macro_definition_errors() {
        assert!(parse_cli_macros(&["novalue".to_string()]).is_err());
        assert!(parse_cli_macros(&["bad key=1".to_string()]).is_err());
    }

    #[test]
    fn duplicate_definitions_are_fatal() {
        let r = parse_str("a : film color { }\na : film color { }\n");
        assert!(r.is_err());
    }
}
