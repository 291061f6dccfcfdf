//! Blueprint capability — template producers.
//!
//! A blueprint turns bound variables into a template body. External
//! blueprint libraries implement the trait; raw template files (optionally
//! `.j2`-templated) are handled in-core, deriving their variable schema
//! from the template's own Parameters section.

use indexmap::IndexMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::core::context::Context;
use crate::variables::{BoundVariables, VarType, VariableDef, VariableSchema};

#[derive(Debug, Error)]
pub enum BlueprintError {
    #[error("cannot read template {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("template substitution failed: {0}")]
    Substitution(String),

    #[error("invalid template {path}: {reason}")]
    BadTemplate { path: PathBuf, reason: String },
}

/// Template body format, used for dump file naming and provider hints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateFormat {
    Json,
    Yaml,
}

impl TemplateFormat {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Yaml => "yaml",
        }
    }
}

/// A rendered template ready for submission.
#[derive(Debug, Clone)]
pub struct Template {
    pub body: String,
    pub format: TemplateFormat,
    /// Set when the body was uploaded to an artifact store
    pub url: Option<String>,
}

impl Template {
    pub fn new(body: impl Into<String>, format: TemplateFormat) -> Self {
        Self { body: body.into(), format, url: None }
    }
}

/// An external producer of a template body from bound variables.
pub trait Blueprint: Send + Sync {
    fn name(&self) -> &str;

    fn variable_schema(&self) -> &VariableSchema;

    fn render(&self, ctx: &Context, vars: &BoundVariables) -> Result<Template, BlueprintError>;

    /// Optional fully-qualified-name override.
    fn fqn(&self, _ctx: &Context) -> Option<String> {
        None
    }

    /// Whether unknown variable inputs are a binding error. Raw templates
    /// whose schema could not be derived bind leniently.
    fn strict_variables(&self) -> bool {
        true
    }
}

/// Known blueprints by name; populated by the embedding application.
#[derive(Default)]
pub struct BlueprintRegistry {
    blueprints: IndexMap<String, std::sync::Arc<dyn Blueprint>>,
}

impl BlueprintRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, blueprint: std::sync::Arc<dyn Blueprint>) {
        self.blueprints.insert(blueprint.name().to_string(), blueprint);
    }

    pub fn get(&self, name: &str) -> Option<std::sync::Arc<dyn Blueprint>> {
        self.blueprints.get(name).cloned()
    }
}

// ============================================================================
// Raw templates
// ============================================================================

/// Blueprint backed by a template file. `.j2` paths get `{{ name }}`
/// substitution from the bound variables before submission.
pub struct RawTemplateBlueprint {
    name: String,
    path: PathBuf,
    body: String,
    format: TemplateFormat,
    templated: bool,
    schema: VariableSchema,
    strict: bool,
}

impl RawTemplateBlueprint {
    pub fn load(name: &str, path: &Path, config_dir: &Path) -> Result<Self, BlueprintError> {
        let full_path = if path.is_absolute() {
            path.to_path_buf()
        } else {
            config_dir.join(path)
        };
        let body = std::fs::read_to_string(&full_path).map_err(|source| BlueprintError::Io {
            path: full_path.clone(),
            source,
        })?;

        let templated = full_path.extension().is_some_and(|e| e == "j2");
        let format = detect_format(&full_path);
        let (schema, strict) = derive_schema(&body, templated);

        Ok(Self {
            name: name.to_string(),
            path: full_path,
            body,
            format,
            templated,
            schema,
            strict,
        })
    }
}

fn detect_format(path: &Path) -> TemplateFormat {
    let stem = path.to_string_lossy();
    let stem = stem.strip_suffix(".j2").unwrap_or(&stem);
    if stem.ends_with(".json") {
        TemplateFormat::Json
    } else {
        TemplateFormat::Yaml
    }
}

/// Parse the template's Parameters section into a schema of
/// parameter-typed variables. Templated (`.j2`) bodies always bind
/// leniently: their substitution placeholders are not declared anywhere.
fn derive_schema(body: &str, templated: bool) -> (VariableSchema, bool) {
    let strict = !templated;
    let parsed: Result<serde_yaml_ng::Value, _> = serde_yaml_ng::from_str(body);
    let value = match parsed {
        Ok(value) => value,
        Err(_) => return (VariableSchema::new(), strict),
    };

    let mut schema = VariableSchema::new();
    let parameters = value
        .get("Parameters")
        .and_then(serde_yaml_ng::Value::as_mapping);
    if let Some(parameters) = parameters {
        for (key, spec) in parameters {
            let name = match key.as_str() {
                Some(name) => name.to_string(),
                None => continue,
            };
            let mut def = VariableDef { var_type: VarType::Parameter, ..Default::default() };
            if let Some(default) = spec.get("Default") {
                def.default = Some(crate::lookups::parser::yaml_to_json(default));
            }
            if let Some(no_echo) = spec.get("NoEcho").and_then(serde_yaml_ng::Value::as_bool) {
                def.no_echo = no_echo;
            }
            if let Some(values) = spec.get("AllowedValues").and_then(serde_yaml_ng::Value::as_sequence) {
                def.allowed_values = values
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect();
            }
            if let Some(pattern) = spec.get("AllowedPattern").and_then(serde_yaml_ng::Value::as_str) {
                def.allowed_pattern = Some(pattern.to_string());
            }
            schema.insert(name, def);
        }
    }
    (schema, strict)
}

impl Blueprint for RawTemplateBlueprint {
    fn name(&self) -> &str {
        &self.name
    }

    fn variable_schema(&self) -> &VariableSchema {
        &self.schema
    }

    fn strict_variables(&self) -> bool {
        self.strict
    }

    fn render(&self, _ctx: &Context, vars: &BoundVariables) -> Result<Template, BlueprintError> {
        if !self.templated {
            return Ok(Template::new(self.body.clone(), self.format));
        }

        // Substitution values: native variables plus parameter strings
        let mut values: IndexMap<String, String> = IndexMap::new();
        for (name, value) in &vars.native {
            values.insert(
                name.clone(),
                crate::lookups::scalar_to_string(value).unwrap_or_else(|| value.to_string()),
            );
        }
        for parameter in &vars.parameters {
            values.insert(parameter.key.clone(), parameter.value.clone());
        }

        let body = substitute(&self.body, &values).map_err(|key| {
            BlueprintError::Substitution(format!(
                "unknown variable '{{{{ {} }}}}' in {}",
                key,
                self.path.display()
            ))
        })?;
        Ok(Template::new(body, self.format))
    }
}

/// Replace `{{ name }}` placeholders, scanning left to right.
fn substitute(template: &str, values: &IndexMap<String, String>) -> Result<String, String> {
    let mut result = template.to_string();
    let mut start = 0;

    while let Some(open) = result[start..].find("{{") {
        let open = start + open;
        let close = match result[open..].find("}}") {
            Some(close) => open + close + 2,
            None => break,
        };
        let key = result[open + 2..close - 2].trim().to_string();
        let value = values.get(&key).ok_or(key)?;
        result.replace_range(open..close, value);
        start = open + value.len();
    }

    Ok(result)
}
