// schema.rs — Typed action schema compiled from tool definitions.
//
// The gateway hands us the tool definitions behind an enforcement point.
// Each tool is one action; its JSON Schema `inputSchema` becomes a tree of
// parameter types the validator checks policy conditions against.
//
// Several tools may declare the same action (e.g. the same tool exposed by
// two targets). Their parameter types are merged when compatible and
// rejected with `SchemaError::Conflict` when they are not. Compilation is
// pure: the same definitions always yield the same schema and fingerprint.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SchemaError;

/// Action names must be usable as quoted policy identifiers and as keys
/// in the snapshot's action index.
const ACTION_NAME_PATTERN: &str = r"^[A-Za-z_][A-Za-z0-9_.:\-]*$";

/// One tool exposed behind an enforcement point.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolDefinition {
    /// Action name policies refer to (`action == "process_refund"`).
    pub name: String,
    /// Resource (target) identifier the tool is reached through, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    #[serde(default)]
    pub description: String,
    /// JSON Schema for the tool call's input document.
    #[serde(default = "empty_object_schema")]
    pub input_schema: Value,
}

fn empty_object_schema() -> Value {
    serde_json::json!({ "type": "object" })
}

impl ToolDefinition {
    pub fn new(name: impl Into<String>, input_schema: Value) -> Self {
        Self {
            name: name.into(),
            resource: None,
            description: String::new(),
            input_schema,
        }
    }

    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// Declared type of one parameter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParameterType {
    String,
    Number,
    Boolean,
    /// A string restricted to a closed set of values.
    Enum { values: BTreeSet<String> },
    Object { fields: BTreeMap<String, Parameter> },
    Array { items: Box<ParameterType> },
    /// No usable type information; type checks are skipped.
    Any,
}

impl ParameterType {
    /// Short type name used in findings.
    pub fn type_name(&self) -> &'static str {
        match self {
            ParameterType::String | ParameterType::Enum { .. } => "string",
            ParameterType::Number => "number",
            ParameterType::Boolean => "boolean",
            ParameterType::Object { .. } => "object",
            ParameterType::Array { .. } => "array",
            ParameterType::Any => "any",
        }
    }

    /// The closed value set, for enum parameters.
    pub fn enum_values(&self) -> Option<&BTreeSet<String>> {
        match self {
            ParameterType::Enum { values } => Some(values),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Parameter {
    pub ty: ParameterType,
    #[serde(default)]
    pub required: bool,
}

/// Parameters of one action, plus the tools that declared it.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActionSchema {
    pub tools: BTreeSet<String>,
    pub parameters: BTreeMap<String, Parameter>,
}

/// The compiled schema for one enforcement point.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Schema {
    pub actions: BTreeMap<String, ActionSchema>,
    #[serde(default)]
    pub resources: BTreeSet<String>,
}

impl Schema {
    /// A schema with no actions; validation against it skips existence checks.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn has_action(&self, name: &str) -> bool {
        self.actions.contains_key(name)
    }

    pub fn action(&self, name: &str) -> Option<&ActionSchema> {
        self.actions.get(name)
    }

    /// Resolve an input path inside one action's parameters.
    pub fn lookup(&self, action: &str, path: &[String]) -> Option<&ParameterType> {
        let schema = self.actions.get(action)?;
        let (first, rest) = path.split_first()?;
        let mut current = &schema.parameters.get(first)?.ty;
        for segment in rest {
            current = match current {
                ParameterType::Object { fields } => &fields.get(segment)?.ty,
                // Below an untyped value anything may exist.
                ParameterType::Any => return Some(current),
                _ => return None,
            };
        }
        Some(current)
    }

    /// SHA-256 of the canonical JSON form, lowercase hex.
    ///
    /// Maps are ordered, so two schemas compiled from the same definitions
    /// always share a fingerprint. Generation jobs use it as the target
    /// schema reference.
    pub fn fingerprint(&self) -> String {
        use sha2::{Digest, Sha256};
        let canonical = serde_json::to_vec(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(&canonical);
        format!("{:x}", hasher.finalize())
    }
}

/// Compiles tool definitions into a [`Schema`].
pub struct SchemaCompiler {
    action_name: Regex,
}

impl SchemaCompiler {
    pub fn new() -> Result<Self, SchemaError> {
        Ok(Self {
            action_name: Regex::new(ACTION_NAME_PATTERN)
                .map_err(|e| SchemaError::Pattern(e.to_string()))?,
        })
    }

    /// Merge every tool into one schema.
    pub fn compile(&self, tools: &[ToolDefinition]) -> Result<Schema, SchemaError> {
        let mut schema = Schema::default();
        for tool in tools {
            if !self.action_name.is_match(&tool.name) {
                return Err(SchemaError::InvalidActionName {
                    tool: tool.name.clone(),
                    name: tool.name.clone(),
                });
            }
            let parameters = object_parameters(&tool.name, &tool.input_schema)?;
            if let Some(resource) = &tool.resource {
                schema.resources.insert(resource.clone());
            }

            let source = tool_label(tool);
            match schema.actions.get_mut(&tool.name) {
                None => {
                    let mut tools = BTreeSet::new();
                    tools.insert(source);
                    schema.actions.insert(
                        tool.name.clone(),
                        ActionSchema {
                            tools,
                            parameters,
                        },
                    );
                }
                Some(existing) => {
                    let existing_tool = existing.tools.iter().next().cloned().unwrap_or_default();
                    let merged = merge_fields(
                        &tool.name,
                        "",
                        &existing_tool,
                        &source,
                        &existing.parameters,
                        &parameters,
                    )?;
                    existing.parameters = merged;
                    existing.tools.insert(source);
                }
            }
        }
        tracing::debug!(
            actions = schema.actions.len(),
            resources = schema.resources.len(),
            "compiled action schema"
        );
        Ok(schema)
    }

    /// Read a YAML or JSON manifest holding a list of tool definitions.
    ///
    /// The format is chosen by extension; anything other than `.json` is
    /// read as YAML, which also accepts JSON.
    pub fn load_manifest(path: &Path) -> Result<Vec<ToolDefinition>, SchemaError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| SchemaError::Manifest(format!("{}: {}", path.display(), e)))?;
        let is_json = path.extension().and_then(|e| e.to_str()) == Some("json");
        if is_json {
            serde_json::from_str(&text)
                .map_err(|e| SchemaError::Manifest(format!("{}: {}", path.display(), e)))
        } else {
            serde_yaml::from_str(&text)
                .map_err(|e| SchemaError::Manifest(format!("{}: {}", path.display(), e)))
        }
    }
}

fn tool_label(tool: &ToolDefinition) -> String {
    match &tool.resource {
        Some(resource) => format!("{}@{}", tool.name, resource),
        None => tool.name.clone(),
    }
}

/// Parameters of an object-typed JSON Schema node.
fn object_parameters(
    tool: &str,
    schema: &Value,
) -> Result<BTreeMap<String, Parameter>, SchemaError> {
    let object = match schema {
        Value::Object(map) => map,
        Value::Null => return Ok(BTreeMap::new()),
        _ => {
            return Err(SchemaError::InvalidToolSchema {
                tool: tool.to_string(),
                reason: "input schema must be a JSON object".to_string(),
            })
        }
    };
    if let Some(ty) = declared_type(object.get("type")) {
        if ty != "object" {
            return Err(SchemaError::InvalidToolSchema {
                tool: tool.to_string(),
                reason: format!("top-level type must be 'object', found '{}'", ty),
            });
        }
    }
    Ok(fields_of(object))
}

fn fields_of(object: &serde_json::Map<String, Value>) -> BTreeMap<String, Parameter> {
    let required: BTreeSet<&str> = object
        .get("required")
        .and_then(Value::as_array)
        .map(|names| names.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();

    let mut fields = BTreeMap::new();
    if let Some(Value::Object(properties)) = object.get("properties") {
        for (name, node) in properties {
            fields.insert(
                name.clone(),
                Parameter {
                    ty: parameter_type(node),
                    required: required.contains(name.as_str()),
                },
            );
        }
    }
    fields
}

/// The first non-null entry of `type`, which may be a string or a list.
fn declared_type(ty: Option<&Value>) -> Option<&str> {
    match ty? {
        Value::String(s) => Some(s.as_str()),
        Value::Array(list) => list
            .iter()
            .filter_map(Value::as_str)
            .find(|t| *t != "null"),
        _ => None,
    }
}

fn parameter_type(node: &Value) -> ParameterType {
    let object = match node {
        Value::Object(map) => map,
        _ => return ParameterType::Any,
    };
    let enum_values: Option<BTreeSet<String>> = object.get("enum").and_then(Value::as_array).and_then(|values| {
        values
            .iter()
            .map(|v| v.as_str().map(str::to_string))
            .collect::<Option<BTreeSet<String>>>()
    });

    match declared_type(object.get("type")) {
        Some("string") => match enum_values {
            Some(values) => ParameterType::Enum { values },
            None => ParameterType::String,
        },
        Some("integer") | Some("number") => ParameterType::Number,
        Some("boolean") => ParameterType::Boolean,
        Some("object") => ParameterType::Object {
            fields: fields_of(object),
        },
        Some("array") => ParameterType::Array {
            items: Box::new(object.get("items").map(parameter_type).unwrap_or(ParameterType::Any)),
        },
        None => match enum_values {
            Some(values) => ParameterType::Enum { values },
            None if object.contains_key("properties") => ParameterType::Object {
                fields: fields_of(object),
            },
            None => ParameterType::Any,
        },
        Some(_) => ParameterType::Any,
    }
}

fn merge_fields(
    action: &str,
    prefix: &str,
    existing_tool: &str,
    incoming_tool: &str,
    existing: &BTreeMap<String, Parameter>,
    incoming: &BTreeMap<String, Parameter>,
) -> Result<BTreeMap<String, Parameter>, SchemaError> {
    let mut merged = BTreeMap::new();
    let names: BTreeSet<&String> = existing.keys().chain(incoming.keys()).collect();
    for name in names {
        let path = if prefix.is_empty() {
            name.clone()
        } else {
            format!("{}.{}", prefix, name)
        };
        let param = match (existing.get(name), incoming.get(name)) {
            (Some(a), Some(b)) => Parameter {
                ty: merge_types(action, &path, existing_tool, incoming_tool, &a.ty, &b.ty)?,
                required: a.required && b.required,
            },
            // Declared by only one tool: optional from the action's view.
            (Some(only), None) | (None, Some(only)) => Parameter {
                ty: only.ty.clone(),
                required: false,
            },
            (None, None) => continue,
        };
        merged.insert(name.clone(), param);
    }
    Ok(merged)
}

fn merge_types(
    action: &str,
    path: &str,
    existing_tool: &str,
    incoming_tool: &str,
    a: &ParameterType,
    b: &ParameterType,
) -> Result<ParameterType, SchemaError> {
    use ParameterType as T;
    let merged = match (a, b) {
        (T::Any, _) | (_, T::Any) => T::Any,
        (T::String, T::String) => T::String,
        (T::Number, T::Number) => T::Number,
        (T::Boolean, T::Boolean) => T::Boolean,
        (T::Enum { values: x }, T::Enum { values: y }) => T::Enum {
            values: x.union(y).cloned().collect(),
        },
        (T::Enum { .. }, T::String) | (T::String, T::Enum { .. }) => T::String,
        (T::Object { fields: x }, T::Object { fields: y }) => T::Object {
            fields: merge_fields(action, path, existing_tool, incoming_tool, x, y)?,
        },
        (T::Array { items: x }, T::Array { items: y }) => T::Array {
            items: Box::new(merge_types(
                action,
                &format!("{}[]", path),
                existing_tool,
                incoming_tool,
                x,
                y,
            )?),
        },
        _ => {
            return Err(SchemaError::Conflict {
                action: action.to_string(),
                parameter: path.to_string(),
                existing_tool: existing_tool.to_string(),
                existing: a.type_name().to_string(),
                incoming_tool: incoming_tool.to_string(),
                incoming: b.type_name().to_string(),
            })
        }
    };
    Ok(merged)
}
