//! Blueprint variable schemas and binding.
//!
//! A blueprint declares typed variables; the binder matches resolved config
//! inputs against the declarations, validates constraints, and partitions
//! the result into native values (fed to blueprint logic) and cloud
//! parameters (forwarded to the control plane as template parameters).

use indexmap::IndexMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BindError {
    #[error("missing required variable '{0}'")]
    MissingVariable(String),

    #[error("unknown variable '{0}' provided")]
    UnknownVariable(String),

    #[error("variable '{name}': {reason}")]
    Validation { name: String, reason: String },
}

fn invalid(name: &str, reason: impl Into<String>) -> BindError {
    BindError::Validation { name: name.to_string(), reason: reason.into() }
}

/// Declared variable types. `parameter` marks the cloud-parameter family;
/// everything else stays native to the blueprint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VarType {
    #[default]
    String,
    Int,
    Bool,
    Path,
    Enum,
    List,
    Parameter,
}

/// A single variable declaration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VariableDef {
    #[serde(rename = "type", default)]
    pub var_type: VarType,

    #[serde(default)]
    pub default: Option<serde_json::Value>,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub allowed_values: Vec<String>,

    #[serde(default)]
    pub allowed_pattern: Option<String>,

    #[serde(default)]
    pub min_value: Option<i64>,

    #[serde(default)]
    pub max_value: Option<i64>,

    #[serde(default)]
    pub min_length: Option<usize>,

    #[serde(default)]
    pub max_length: Option<usize>,

    /// Mask the value in provider consoles and event details
    #[serde(default)]
    pub no_echo: bool,
}

pub type VariableSchema = IndexMap<String, VariableDef>;

/// A cloud parameter ready for submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parameter {
    pub key: String,
    pub value: String,
    pub no_echo: bool,
}

/// Result of binding inputs to a schema.
#[derive(Debug, Clone, Default)]
pub struct BoundVariables {
    /// Original typing retained; consumed by blueprint logic
    pub native: IndexMap<String, serde_json::Value>,
    /// Coerced to provider strings; forwarded as template parameters
    pub parameters: Vec<Parameter>,
}

impl BoundVariables {
    pub fn native_str(&self, name: &str) -> Option<String> {
        self.native.get(name).map(scalar_string)
    }
}

/// Bind resolved inputs against a schema.
///
/// With `strict` set (the default everywhere but lenient raw templates),
/// inputs not present in the schema are rejected.
pub fn bind(
    schema: &VariableSchema,
    inputs: &IndexMap<String, serde_json::Value>,
    strict: bool,
) -> Result<BoundVariables, BindError> {
    if strict {
        for name in inputs.keys() {
            if !schema.contains_key(name) {
                return Err(BindError::UnknownVariable(name.clone()));
            }
        }
    }

    let mut bound = BoundVariables::default();

    for (name, def) in schema {
        let value = match inputs.get(name) {
            Some(value) => value.clone(),
            None => match &def.default {
                Some(default) => default.clone(),
                None => return Err(BindError::MissingVariable(name.clone())),
            },
        };

        validate(name, def, &value)?;

        match def.var_type {
            VarType::Parameter => bound.parameters.push(Parameter {
                key: name.clone(),
                value: to_parameter_string(&value),
                no_echo: def.no_echo,
            }),
            _ => {
                bound.native.insert(name.clone(), value);
            }
        }
    }

    // Inputs without declarations pass through as native in lenient mode
    if !strict {
        for (name, value) in inputs {
            if !schema.contains_key(name) {
                bound.native.insert(name.clone(), value.clone());
            }
        }
    }

    Ok(bound)
}

fn validate(name: &str, def: &VariableDef, value: &serde_json::Value) -> Result<(), BindError> {
    match def.var_type {
        VarType::String | VarType::Parameter => {
            if value.is_array() || value.is_object() {
                if def.var_type == VarType::String {
                    return Err(invalid(name, "expected a string"));
                }
                // parameter lists are legal; they join on submission
                if value.is_object() {
                    return Err(invalid(name, "expected a scalar or list"));
                }
            }
        }
        VarType::Int => {
            let n = value
                .as_i64()
                .ok_or_else(|| invalid(name, "expected an integer"))?;
            if let Some(min) = def.min_value {
                if n < min {
                    return Err(invalid(name, format!("must be >= {}", min)));
                }
            }
            if let Some(max) = def.max_value {
                if n > max {
                    return Err(invalid(name, format!("must be <= {}", max)));
                }
            }
        }
        VarType::Bool => {
            if !value.is_boolean() {
                return Err(invalid(name, "expected a boolean"));
            }
        }
        VarType::Path => {
            let s = value
                .as_str()
                .ok_or_else(|| invalid(name, "expected a path string"))?;
            if !s.starts_with('/') {
                return Err(invalid(name, "must be an absolute path"));
            }
        }
        VarType::Enum => {
            let s = value
                .as_str()
                .ok_or_else(|| invalid(name, "expected a string"))?;
            if !def.allowed_values.is_empty() && !def.allowed_values.iter().any(|v| v == s) {
                return Err(invalid(
                    name,
                    format!("must be one of: {}", def.allowed_values.join(", ")),
                ));
            }
        }
        VarType::List => {
            if !value.is_array() {
                return Err(invalid(name, "expected a list"));
            }
        }
    }

    let as_text = scalar_string(value);

    if !def.allowed_values.is_empty() && def.var_type != VarType::Enum {
        if !def.allowed_values.iter().any(|v| *v == as_text) {
            return Err(invalid(
                name,
                format!("must be one of: {}", def.allowed_values.join(", ")),
            ));
        }
    }

    if let Some(pattern) = &def.allowed_pattern {
        let re = Regex::new(&format!("^{}$", pattern))
            .map_err(|e| invalid(name, format!("invalid allowed_pattern: {}", e)))?;
        if !re.is_match(&as_text) {
            return Err(invalid(name, format!("does not match pattern '{}'", pattern)));
        }
    }

    if let Some(min) = def.min_length {
        if as_text.len() < min {
            return Err(invalid(name, format!("shorter than {} characters", min)));
        }
    }
    if let Some(max) = def.max_length {
        if as_text.len() > max {
            return Err(invalid(name, format!("longer than {} characters", max)));
        }
    }

    Ok(())
}

/// Provider-side string form. Booleans become "true"/"false", lists join
/// on commas (the provider's list-parameter convention).
fn to_parameter_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Array(items) => items
            .iter()
            .map(scalar_string)
            .collect::<Vec<_>>()
            .join(","),
        other => scalar_string(other),
    }
}

fn scalar_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Bool(b) => b.to_string(),
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}
