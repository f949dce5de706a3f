//! `manifest.json` parsing.
//!
//! A plugin directory is named after the plugin and holds a `manifest.json` that
//! declares the executable and the functions it offers. Functions may be listed in
//! a flat `functions` array or described by a `schema` object; both shapes end up as
//! the same [`FunctionDefinition`] list.

use crate::protocol::PROTOCOL_VERSION;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const MANIFEST_FILE: &str = "manifest.json";
pub const SUPPORTED_MANIFEST_VERSION: u64 = 1;
/// Function names starting with this prefix belong to the host.
pub const RESERVED_PREFIX: &str = "rise_";
pub const DEFAULT_DESCRIPTION: &str = "No description provided.";

const RESERVED_NAMES: [&str; 8] = ["con", "prn", "aux", "nul", "com1", "com2", "lpt1", "lpt2"];

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("manifest not found: {0}")]
    NotFound(PathBuf),
    #[error("failed to read manifest {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("JSON parse error in {path}: {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("Missing required field: {0}")]
    MissingField(&'static str),
    #[error("field '{field}' must be {expected}")]
    InvalidField {
        field: &'static str,
        expected: &'static str,
    },
    #[error("Unsupported protocol_version '{0}' (expected '{PROTOCOL_VERSION}')")]
    UnsupportedProtocol(String),
    #[error("Unsupported manifest version {0} (expected {SUPPORTED_MANIFEST_VERSION})")]
    UnsupportedVersion(String),
    #[error("Manifest missing both 'schema' and 'functions'")]
    MissingFunctions,
    #[error("Function entry missing 'name'")]
    FunctionMissingName,
    #[error("Function '{0}' missing 'description'")]
    FunctionMissingDescription(String),
    #[error("Invalid plugin name: {0}")]
    InvalidPluginName(String),
    #[error("Function '{0}' uses reserved '{RESERVED_PREFIX}' prefix")]
    ReservedPrefix(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterDefinition {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub description: String,
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl ParameterDefinition {
    fn from_schema(name: &str, schema: &Value, required: bool) -> Self {
        Self {
            name: name.to_string(),
            kind: str_field(schema, "type").unwrap_or("string").to_string(),
            description: str_field(schema, "description").unwrap_or_default().to_string(),
            required,
            enum_values: schema.get("enum").and_then(Value::as_array).cloned(),
            default: schema.get("default").filter(|v| !v.is_null()).cloned(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Vec<ParameterDefinition>,
    pub tags: Vec<String>,
}

impl FunctionDefinition {
    /// Build from an object holding `name`, `description`, a JSON-Schema `parameters`
    /// object and optional `tags`.
    fn from_value(value: &Value) -> Self {
        let schema = value.get("parameters").unwrap_or(&Value::Null);
        Self {
            name: str_field(value, "name").unwrap_or_default().to_string(),
            description: str_field(value, "description").unwrap_or_default().to_string(),
            parameters: parameters_from_schema(schema),
            tags: string_list(value.get("tags")),
        }
    }

    pub fn parameter(&self, name: &str) -> Option<&ParameterDefinition> {
        self.parameters.iter().find(|p| p.name == name)
    }

    pub fn required_parameters(&self) -> impl Iterator<Item = &ParameterDefinition> {
        self.parameters.iter().filter(|p| p.required)
    }

    /// The function as a JSON-Schema tool definition.
    pub fn to_schema(&self) -> Value {
        let mut properties = Map::new();
        let mut required = Vec::new();
        for param in &self.parameters {
            let mut prop = json!({ "type": param.kind, "description": param.description });
            if let Some(values) = param.enum_values.as_ref().filter(|v| !v.is_empty()) {
                prop["enum"] = Value::Array(values.clone());
            }
            if let Some(default) = &param.default {
                prop["default"] = default.clone();
            }
            properties.insert(param.name.clone(), prop);
            if param.required {
                required.push(Value::from(param.name.as_str()));
            }
        }

        let mut schema = json!({
            "name": self.name,
            "description": self.description,
            "parameters": {
                "type": "object",
                "properties": properties,
                "required": required,
            }
        });
        if !self.tags.is_empty() {
            schema["tags"] = json!(self.tags);
        }
        schema
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct McpConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub launch_on_startup: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Manifest {
    pub name: String,
    pub description: String,
    pub directory: PathBuf,
    pub executable: String,
    pub executable_path: PathBuf,
    pub manifest_version: u64,
    pub protocol_version: String,
    pub persistent: bool,
    /// Only honoured when exactly one function is declared.
    pub passthrough: bool,
    pub functions: Vec<FunctionDefinition>,
    pub tags: Vec<String>,
    pub mcp: McpConfig,
}

impl Manifest {
    /// Parse `<plugin_dir>/manifest.json`.
    pub fn load(plugin_dir: &Path) -> Result<Self, ManifestError> {
        Self::from_file(&plugin_dir.join(MANIFEST_FILE))
    }

    pub fn from_file(path: &Path) -> Result<Self, ManifestError> {
        if !path.exists() {
            return Err(ManifestError::NotFound(path.to_path_buf()));
        }
        let content = fs::read_to_string(path).map_err(|source| ManifestError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let content = content.strip_prefix('\u{feff}').unwrap_or(&content);
        let raw: Value = serde_json::from_str(content).map_err(|source| ManifestError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        let directory = path.parent().unwrap_or_else(|| Path::new(".")).to_path_buf();
        Self::from_value(&raw, &directory)
    }

    /// Parse an already-decoded manifest that lives in `directory`.
    pub fn from_value(raw: &Value, directory: &Path) -> Result<Self, ManifestError> {
        for field in ["manifestVersion", "executable", "persistent", "protocol_version"] {
            if raw.get(field).is_none() {
                return Err(ManifestError::MissingField(field));
            }
        }

        let protocol_version = match &raw["protocol_version"] {
            Value::String(version) if version == PROTOCOL_VERSION => version.clone(),
            Value::String(version) => return Err(ManifestError::UnsupportedProtocol(version.clone())),
            other => return Err(ManifestError::UnsupportedProtocol(other.to_string())),
        };

        let manifest_version = match raw["manifestVersion"].as_u64() {
            Some(SUPPORTED_MANIFEST_VERSION) => SUPPORTED_MANIFEST_VERSION,
            _ => {
                return Err(ManifestError::UnsupportedVersion(
                    raw["manifestVersion"].to_string(),
                ))
            }
        };

        let executable = str_field(raw, "executable")
            .filter(|exe| !exe.is_empty())
            .ok_or(ManifestError::InvalidField {
                field: "executable",
                expected: "a non-empty string",
            })?
            .to_string();
        let persistent = raw["persistent"]
            .as_bool()
            .ok_or(ManifestError::InvalidField {
                field: "persistent",
                expected: "a boolean",
            })?;

        let functions = parse_functions(raw)?;
        if let Some(reserved) = functions
            .iter()
            .find(|f| f.name.starts_with(RESERVED_PREFIX))
        {
            return Err(ManifestError::ReservedPrefix(reserved.name.clone()));
        }

        let passthrough =
            raw.get("passthrough").and_then(Value::as_bool).unwrap_or(false) && functions.len() == 1;

        let mcp = raw
            .get("mcp")
            .filter(|v| v.is_object())
            .and_then(|v| serde_json::from_value::<McpConfig>(v.clone()).ok())
            .unwrap_or_default();

        let name = directory
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        Ok(Self {
            name,
            description: str_field(raw, "description")
                .unwrap_or(DEFAULT_DESCRIPTION)
                .to_string(),
            directory: directory.to_path_buf(),
            executable_path: directory.join(&executable),
            executable,
            manifest_version,
            protocol_version,
            persistent,
            passthrough,
            functions,
            tags: string_list(raw.get("tags")),
            mcp,
        })
    }

    pub fn function(&self, name: &str) -> Option<&FunctionDefinition> {
        self.functions.iter().find(|f| f.name == name)
    }

    pub fn function_names(&self) -> Vec<&str> {
        self.functions.iter().map(|f| f.name.as_str()).collect()
    }

    pub fn tool_schemas(&self) -> Vec<Value> {
        self.functions.iter().map(FunctionDefinition::to_schema).collect()
    }
}

fn parse_functions(raw: &Value) -> Result<Vec<FunctionDefinition>, ManifestError> {
    let functions = if let Some(schema) = raw.get("schema").filter(|s| s.is_object()) {
        functions_from_schema(schema)
    } else if let Some(Value::Array(entries)) = raw.get("functions") {
        entries
            .iter()
            .filter(|entry| entry.is_object())
            .map(FunctionDefinition::from_value)
            .collect()
    } else {
        return Err(ManifestError::MissingFunctions);
    };

    for function in &functions {
        if function.name.is_empty() {
            return Err(ManifestError::FunctionMissingName);
        }
        if function.description.is_empty() {
            return Err(ManifestError::FunctionMissingDescription(
                function.name.clone(),
            ));
        }
    }
    Ok(functions)
}

/// Unified-schema shapes: `anyOf`/`oneOf` lists, a single function carrying
/// `properties`, or an object keyed by function name.
fn functions_from_schema(schema: &Value) -> Vec<FunctionDefinition> {
    if let Some(Value::Array(items)) = schema.get("anyOf").or_else(|| schema.get("oneOf")) {
        return items.iter().filter_map(schema_item_function).collect();
    }
    if schema.get("properties").is_some() {
        return schema_item_function(schema).into_iter().collect();
    }
    let Some(entries) = schema.as_object() else {
        return Vec::new();
    };
    entries
        .iter()
        .filter(|(_, definition)| definition.get("description").is_some())
        .map(|(name, definition)| {
            let mut function = FunctionDefinition::from_value(definition);
            function.name = name.clone();
            function
        })
        .collect()
}

fn schema_item_function(item: &Value) -> Option<FunctionDefinition> {
    if !item.is_object() {
        return None;
    }
    let mut name = str_field(item, "name")
        .or_else(|| str_field(item, "title"))
        .unwrap_or_default();
    let mut description = str_field(item, "description").unwrap_or_default();
    let mut body = item;

    if let Some(wrapped) = item.get("function").filter(|f| f.is_object()) {
        name = str_field(wrapped, "name").unwrap_or(name);
        description = str_field(wrapped, "description").unwrap_or(description);
        body = wrapped;
    }
    if name.is_empty() {
        return None;
    }

    Some(FunctionDefinition {
        name: name.to_string(),
        description: description.to_string(),
        parameters: parameters_from_schema(body.get("parameters").unwrap_or(&Value::Null)),
        tags: string_list(body.get("tags")),
    })
}

fn parameters_from_schema(schema: &Value) -> Vec<ParameterDefinition> {
    let Some(properties) = schema.get("properties").and_then(Value::as_object) else {
        return Vec::new();
    };
    let required: Vec<&str> = schema
        .get("required")
        .and_then(Value::as_array)
        .map(|names| names.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();

    properties
        .iter()
        .map(|(name, prop)| {
            ParameterDefinition::from_schema(name, prop, required.contains(&name.as_str()))
        })
        .collect()
}

fn str_field<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(Value::as_str)
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Names of subdirectories of `plugins_dir` that contain a manifest, sorted.
pub fn discover_plugins(plugins_dir: &Path) -> Vec<String> {
    let Ok(entries) = fs::read_dir(plugins_dir) else {
        return Vec::new();
    };
    let mut names: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_dir() && entry.path().join(MANIFEST_FILE).is_file())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

/// A plugin name is a letter followed by letters, digits, `_` or `-`, and is not a
/// reserved device name.
pub fn validate_plugin_name(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    if !first.is_ascii_alphabetic() {
        return false;
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
        return false;
    }
    !RESERVED_NAMES.contains(&name.to_ascii_lowercase().as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn base() -> Value {
        json!({
            "manifestVersion": 1,
            "protocol_version": "2.0",
            "executable": "plugin.py",
            "persistent": false,
            "functions": [{
                "name": "echo",
                "description": "Echo text back",
                "tags": ["util"],
                "parameters": {
                    "type": "object",
                    "properties": {
                        "text": {"type": "string", "description": "Text to echo"},
                        "times": {"type": "integer", "default": 1}
                    },
                    "required": ["text"]
                }
            }]
        })
    }

    fn parse(raw: &Value) -> Result<Manifest, ManifestError> {
        Manifest::from_value(raw, Path::new("/plugins/echoer"))
    }

    #[test]
    fn parses_flat_function_list() {
        let manifest = parse(&base()).expect("valid manifest");
        assert_eq!(manifest.name, "echoer");
        assert_eq!(manifest.description, DEFAULT_DESCRIPTION);
        assert_eq!(manifest.executable_path, PathBuf::from("/plugins/echoer/plugin.py"));

        let echo = manifest.function("echo").unwrap();
        assert_eq!(echo.tags, vec!["util".to_string()]);
        let names: Vec<_> = echo.parameters.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["text", "times"]);
        assert!(echo.parameter("text").unwrap().required);
        let times = echo.parameter("times").unwrap();
        assert!(!times.required);
        assert_eq!(times.kind, "integer");
        assert_eq!(times.default, Some(json!(1)));
    }

    #[test]
    fn rejects_unsupported_versions() {
        let mut raw = base();
        raw["protocol_version"] = json!("1.0");
        assert!(matches!(parse(&raw), Err(ManifestError::UnsupportedProtocol(v)) if v == "1.0"));

        let mut raw = base();
        raw["manifestVersion"] = json!(2);
        assert!(matches!(parse(&raw), Err(ManifestError::UnsupportedVersion(_))));
    }

    #[test]
    fn reports_first_missing_required_field() {
        let mut raw = base();
        raw.as_object_mut().unwrap().remove("persistent");
        let err = parse(&raw).unwrap_err();
        assert_eq!(err.to_string(), "Missing required field: persistent");
    }

    #[test]
    fn rejects_reserved_prefix() {
        let mut raw = base();
        raw["functions"][0]["name"] = json!("rise_echo");
        assert!(matches!(parse(&raw), Err(ManifestError::ReservedPrefix(name)) if name == "rise_echo"));
    }

    #[test]
    fn passthrough_needs_single_function() {
        let mut raw = base();
        raw["passthrough"] = json!(true);
        assert!(parse(&raw).unwrap().passthrough);

        raw["functions"]
            .as_array_mut()
            .unwrap()
            .push(json!({"name": "other", "description": "Another one"}));
        let manifest = parse(&raw).expect("passthrough with two functions still loads");
        assert!(!manifest.passthrough);
    }

    #[test]
    fn requires_functions_and_descriptions() {
        let mut raw = base();
        raw.as_object_mut().unwrap().remove("functions");
        assert!(matches!(parse(&raw), Err(ManifestError::MissingFunctions)));

        let mut raw = base();
        raw["functions"][0]["description"] = json!("");
        assert!(matches!(
            parse(&raw),
            Err(ManifestError::FunctionMissingDescription(name)) if name == "echo"
        ));
    }

    #[test]
    fn schema_any_of_with_wrapped_functions() {
        let mut raw = base();
        raw.as_object_mut().unwrap().remove("functions");
        raw["schema"] = json!({
            "anyOf": [
                {"title": "first", "description": "First", "parameters": {"properties": {"q": {}}}},
                {"function": {"name": "second", "description": "Second"}},
                {"description": "nameless entries are skipped"}
            ]
        });
        let manifest = parse(&raw).unwrap();
        assert_eq!(manifest.function_names(), vec!["first", "second"]);
        let q = manifest.function("first").unwrap().parameter("q").unwrap();
        assert_eq!(q.kind, "string");
        assert!(!q.required);
    }

    #[test]
    fn schema_object_of_functions() {
        let mut raw = base();
        raw.as_object_mut().unwrap().remove("functions");
        raw["schema"] = json!({
            "lights_on": {"description": "Turn lights on"},
            "lights_off": {"description": "Turn lights off", "tags": ["rgb"]},
            "$comment": "ignored"
        });
        let manifest = parse(&raw).unwrap();
        assert_eq!(manifest.function_names(), vec!["lights_on", "lights_off"]);
        assert_eq!(manifest.function("lights_off").unwrap().tags, vec!["rgb"]);
    }

    #[test]
    fn tags_and_mcp_are_optional() {
        let mut raw = base();
        raw["tags"] = json!(["Audio", 3, "music"]);
        raw["mcp"] = json!({"enabled": true});
        let manifest = parse(&raw).unwrap();
        assert_eq!(manifest.tags, vec!["Audio".to_string(), "music".to_string()]);
        assert!(manifest.mcp.enabled);
        assert!(!manifest.mcp.launch_on_startup);
    }

    #[test]
    fn to_schema_lists_required_parameters() {
        let manifest = parse(&base()).unwrap();
        let schema = manifest.function("echo").unwrap().to_schema();
        assert_eq!(schema["parameters"]["type"], "object");
        assert_eq!(schema["parameters"]["required"], json!(["text"]));
        assert_eq!(schema["parameters"]["properties"]["times"]["default"], 1);
        assert_eq!(schema["tags"], json!(["util"]));
    }

    #[test]
    fn load_strips_bom_and_names_plugin_after_directory() {
        let root = TempDir::new().unwrap();
        let dir = root.path().join("bom_plugin");
        fs::create_dir(&dir).unwrap();
        let body = format!("\u{feff}{}", base());
        fs::write(dir.join(MANIFEST_FILE), body).unwrap();

        let manifest = Manifest::load(&dir).expect("BOM should be ignored");
        assert_eq!(manifest.name, "bom_plugin");
        assert_eq!(manifest.directory, dir);
    }

    #[test]
    fn discovery_lists_only_manifest_dirs() {
        let root = TempDir::new().unwrap();
        for name in ["zeta", "alpha"] {
            let dir = root.path().join(name);
            fs::create_dir(&dir).unwrap();
            fs::write(dir.join(MANIFEST_FILE), "{}").unwrap();
        }
        fs::create_dir(root.path().join("no_manifest")).unwrap();
        fs::write(root.path().join("stray.json"), "{}").unwrap();

        assert_eq!(discover_plugins(root.path()), vec!["alpha", "zeta"]);
        assert!(discover_plugins(&root.path().join("missing")).is_empty());
    }

    #[test]
    fn plugin_name_rules() {
        assert!(validate_plugin_name("spotify"));
        assert!(validate_plugin_name("my-plugin_2"));
        assert!(!validate_plugin_name(""));
        assert!(!validate_plugin_name("2fast"));
        assert!(!validate_plugin_name("../etc"));
        assert!(!validate_plugin_name("a/b"));
        assert!(!validate_plugin_name("COM1"));
        assert!(!validate_plugin_name("has space"));
    }
}
