//! Config parsing, environment substitution, and validation.
//!
//! The environment file's values substitute into the config document
//! before it is deserialized: a string that is exactly one `${name}`
//! takes the environment value with its type intact; embedded occurrences
//! interpolate scalars only. Lookup expressions (`${type arg}`) contain
//! whitespace and never collide with the `${name}` form.

use indexmap::IndexMap;
use std::path::Path;
use thiserror::Error;

use super::types::Config;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {reason}")]
    Io { path: String, reason: String },

    #[error("YAML parse error: {0}")]
    Yaml(String),

    #[error("cannot substitute non-scalar environment value '{name}' into a string")]
    NonScalarSubstitution { name: String },

    #[error("environment file line {line} is not in 'key: value' form")]
    BadEnvironmentLine { line: usize },
}

/// A single structural problem found by `validate_config`.
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Parse an environment file: either a YAML mapping or the legacy
/// newline-delimited `key: value` list.
pub fn parse_environment(
    raw: &str,
) -> Result<IndexMap<String, serde_yaml_ng::Value>, ConfigError> {
    if let Ok(serde_yaml_ng::Value::Mapping(map)) =
        serde_yaml_ng::from_str::<serde_yaml_ng::Value>(raw)
    {
        let mut env = IndexMap::new();
        for (key, value) in map {
            let key = match key {
                serde_yaml_ng::Value::String(s) => s,
                other => serde_yaml_ng::to_string(&other)
                    .unwrap_or_default()
                    .trim()
                    .to_string(),
            };
            env.insert(key, value);
        }
        return Ok(env);
    }

    // Legacy format: one `key: value` per line, '#' comments
    let mut env = IndexMap::new();
    for (index, line) in raw.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (key, value) = line
            .split_once(':')
            .ok_or(ConfigError::BadEnvironmentLine { line: index + 1 })?;
        env.insert(
            key.trim().to_string(),
            serde_yaml_ng::Value::String(value.trim().to_string()),
        );
    }
    Ok(env)
}

/// Parse a config document, substituting `${name}` environment references
/// before deserialization.
pub fn parse_config(
    raw: &str,
    environment: &IndexMap<String, serde_yaml_ng::Value>,
) -> Result<Config, ConfigError> {
    let document: serde_yaml_ng::Value =
        serde_yaml_ng::from_str(raw).map_err(|e| ConfigError::Yaml(e.to_string()))?;
    let substituted = substitute_references(&document, environment)?;
    serde_yaml_ng::from_value(substituted).map_err(|e| ConfigError::Yaml(e.to_string()))
}

/// Parse a config file from disk.
pub fn parse_config_file(
    path: &Path,
    environment: &IndexMap<String, serde_yaml_ng::Value>,
) -> Result<Config, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    parse_config(&raw, environment)
}

/// Walk the YAML tree replacing `${name}` environment references.
///
/// A string consisting solely of one reference takes the environment
/// value verbatim (lists and maps included); embedded references require
/// scalar values. Names not present in the environment are left intact —
/// they are lookup expressions or literal text.
fn substitute_references(
    value: &serde_yaml_ng::Value,
    environment: &IndexMap<String, serde_yaml_ng::Value>,
) -> Result<serde_yaml_ng::Value, ConfigError> {
    match value {
        serde_yaml_ng::Value::String(text) => {
            if let Some(name) = whole_reference(text) {
                if let Some(replacement) = environment.get(name) {
                    return Ok(replacement.clone());
                }
                return Ok(value.clone());
            }
            Ok(serde_yaml_ng::Value::String(interpolate(text, environment)?))
        }
        serde_yaml_ng::Value::Sequence(items) => {
            let substituted: Result<Vec<_>, _> = items
                .iter()
                .map(|item| substitute_references(item, environment))
                .collect();
            Ok(serde_yaml_ng::Value::Sequence(substituted?))
        }
        serde_yaml_ng::Value::Mapping(map) => {
            let mut out = serde_yaml_ng::Mapping::new();
            for (key, value) in map {
                out.insert(key.clone(), substitute_references(value, environment)?);
            }
            Ok(serde_yaml_ng::Value::Mapping(out))
        }
        other => Ok(other.clone()),
    }
}

/// The name inside a string that is exactly one `${name}` reference.
fn whole_reference(text: &str) -> Option<&str> {
    let inner = text.strip_prefix("${")?.strip_suffix('}')?;
    is_reference_name(inner).then_some(inner)
}

fn is_reference_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_lowercase() || c == '_')
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

fn interpolate(
    text: &str,
    environment: &IndexMap<String, serde_yaml_ng::Value>,
) -> Result<String, ConfigError> {
    let mut result = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) if is_reference_name(&after[..end]) => {
                let name = &after[..end];
                match environment.get(name) {
                    Some(serde_yaml_ng::Value::String(s)) => result.push_str(s),
                    Some(serde_yaml_ng::Value::Number(n)) => result.push_str(&n.to_string()),
                    Some(serde_yaml_ng::Value::Bool(b)) => result.push_str(&b.to_string()),
                    Some(_) => {
                        return Err(ConfigError::NonScalarSubstitution {
                            name: name.to_string(),
                        })
                    }
                    // unknown: keep the text (it may be a lookup or literal)
                    None => {
                        result.push_str(&rest[start..start + 2 + end + 1]);
                    }
                }
                rest = &after[end + 1..];
            }
            _ => {
                // not an environment reference (lookup expression, etc.)
                result.push_str("${");
                rest = after;
            }
        }
    }
    result.push_str(rest);
    Ok(result)
}

/// Validate a parsed config. Returns the list of errors (empty = valid).
pub fn validate_config(config: &Config) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    let error = |message: String| ValidationError { message };

    if config.namespace.is_empty() && config.stacks.len() > 1 {
        let mut seen = IndexMap::new();
        for def in &config.stacks {
            if let Some(previous) = seen.insert(def.stack_name().to_string(), &def.name) {
                errors.push(error(format!(
                    "empty namespace: stacks '{}' and '{}' would share the name '{}'",
                    previous,
                    def.name,
                    def.stack_name()
                )));
            }
        }
    }

    let mut names = IndexMap::new();
    for def in &config.stacks {
        if names.insert(def.name.as_str(), ()).is_some() {
            errors.push(error(format!("duplicate stack name '{}'", def.name)));
        }
    }

    for def in &config.stacks {
        match (&def.blueprint, &def.template_path) {
            (Some(_), Some(_)) => errors.push(error(format!(
                "stack '{}' declares both a blueprint and a template_path",
                def.name
            ))),
            (None, None) if !def.locked && !def.external => errors.push(error(format!(
                "stack '{}' needs a blueprint or a template_path",
                def.name
            ))),
            _ => {}
        }

        for dep in &def.requires {
            if !config.stacks.iter().any(|s| s.name == *dep) {
                errors.push(error(format!(
                    "stack '{}' requires unknown stack '{}'",
                    def.name, dep
                )));
            }
            if dep == &def.name {
                errors.push(error(format!("stack '{}' requires itself", def.name)));
            }
        }
    }

    errors
}

/// Top-level keys the schema does not recognize; warned about, not fatal,
/// so anchor-only definitions keep working.
pub fn unknown_top_level_keys(config: &Config) -> Vec<String> {
    config.extra.keys().cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> IndexMap<String, serde_yaml_ng::Value> {
        pairs
            .iter()
            .map(|(k, v)| {
                (
                    k.to_string(),
                    serde_yaml_ng::Value::String(v.to_string()),
                )
            })
            .collect()
    }

    #[test]
    fn test_parser_parse_valid() {
        let config = parse_config(
            r#"
namespace: prod
stacks:
  - name: vpc
    template_path: vpc.yaml
"#,
            &IndexMap::new(),
        )
        .unwrap();
        assert_eq!(config.namespace, "prod");
        assert!(validate_config(&config).is_empty());
    }

    #[test]
    fn test_parser_environment_substitution() {
        let config = parse_config(
            r#"
namespace: ${env_name}
stacks:
  - name: vpc
    template_path: vpc.yaml
    variables:
      Cidr: "10.${subnet_octet}.0.0/16"
"#,
            &env(&[("env_name", "staging"), ("subnet_octet", "42")]),
        )
        .unwrap();
        assert_eq!(config.namespace, "staging");
        let cidr = &config.stacks[0].variables["Cidr"];
        assert_eq!(cidr.as_str().unwrap(), "10.42.0.0/16");
    }

    #[test]
    fn test_parser_whole_reference_keeps_type() {
        let mut environment = IndexMap::new();
        environment.insert(
            "subnets".to_string(),
            serde_yaml_ng::from_str("[a, b, c]").unwrap(),
        );
        let config = parse_config(
            r#"
namespace: ns
stacks:
  - name: vpc
    template_path: vpc.yaml
    variables:
      Subnets: ${subnets}
"#,
            &environment,
        )
        .unwrap();
        assert!(config.stacks[0].variables["Subnets"].is_sequence());
    }

    #[test]
    fn test_parser_non_scalar_interpolation_rejected() {
        let mut environment = IndexMap::new();
        environment.insert(
            "subnets".to_string(),
            serde_yaml_ng::from_str("[a, b]").unwrap(),
        );
        let result = parse_config(
            r#"
namespace: ns
stacks:
  - name: vpc
    template_path: vpc.yaml
    variables:
      Joined: "prefix-${subnets}"
"#,
            &environment,
        );
        assert!(matches!(
            result,
            Err(ConfigError::NonScalarSubstitution { .. })
        ));
    }

    #[test]
    fn test_parser_lookup_expressions_untouched() {
        let config = parse_config(
            r#"
namespace: ns
stacks:
  - name: app
    template_path: app.yaml
    variables:
      VpcId: ${output vpc::Id}
      Region: ${region}
"#,
            &env(&[("region", "us-west-2")]),
        )
        .unwrap();
        assert_eq!(
            config.stacks[0].variables["VpcId"].as_str().unwrap(),
            "${output vpc::Id}"
        );
        assert_eq!(
            config.stacks[0].variables["Region"].as_str().unwrap(),
            "us-west-2"
        );
    }

    #[test]
    fn test_parser_unknown_reference_left_alone() {
        let config = parse_config(
            r#"
namespace: ns
stacks:
  - name: app
    template_path: app.yaml
    variables:
      Data: ${hook_data}
"#,
            &env(&[("other", "x")]),
        )
        .unwrap();
        assert_eq!(
            config.stacks[0].variables["Data"].as_str().unwrap(),
            "${hook_data}"
        );
    }

    #[test]
    fn test_parser_environment_yaml_format() {
        let environment = parse_environment(
            r#"
namespace: prod
subnet_count: 3
zones:
  - us-east-1a
  - us-east-1b
"#,
        )
        .unwrap();
        assert_eq!(environment["namespace"].as_str().unwrap(), "prod");
        assert_eq!(environment["subnet_count"].as_i64().unwrap(), 3);
        assert!(environment["zones"].is_sequence());
    }

    #[test]
    fn test_parser_environment_legacy_format() {
        let environment = parse_environment(
            "# comment\nnamespace: prod\nvpc_cidr: 10.0.0.0/16\n\n",
        )
        .unwrap();
        assert_eq!(environment["namespace"].as_str().unwrap(), "prod");
        assert_eq!(environment["vpc_cidr"].as_str().unwrap(), "10.0.0.0/16");
    }

    #[test]
    fn test_parser_environment_bad_line() {
        let result = parse_environment("just some words without a colon\nanother");
        assert!(result.is_err());
    }

    #[test]
    fn test_parser_duplicate_stack_name() {
        let config = parse_config(
            r#"
namespace: ns
stacks:
  - name: vpc
    template_path: a.yaml
  - name: vpc
    template_path: b.yaml
"#,
            &IndexMap::new(),
        )
        .unwrap();
        let errors = validate_config(&config);
        assert!(errors.iter().any(|e| e.message.contains("duplicate")));
    }

    #[test]
    fn test_parser_blueprint_and_template_exclusive() {
        let config = parse_config(
            r#"
namespace: ns
stacks:
  - name: vpc
    blueprint: vpc_blueprint
    template_path: vpc.yaml
"#,
            &IndexMap::new(),
        )
        .unwrap();
        let errors = validate_config(&config);
        assert!(errors.iter().any(|e| e.message.contains("both")));
    }

    #[test]
    fn test_parser_missing_template_source() {
        let config = parse_config(
            "namespace: ns\nstacks:\n  - name: vpc\n",
            &IndexMap::new(),
        )
        .unwrap();
        let errors = validate_config(&config);
        assert!(!errors.is_empty());
    }

    #[test]
    fn test_parser_locked_needs_no_source() {
        let config = parse_config(
            "namespace: ns\nstacks:\n  - name: vpc\n    locked: true\n",
            &IndexMap::new(),
        )
        .unwrap();
        assert!(validate_config(&config).is_empty());
    }

    #[test]
    fn test_parser_unknown_requires() {
        let config = parse_config(
            r#"
namespace: ns
stacks:
  - name: vpc
    template_path: vpc.yaml
    requires: [ghost]
"#,
            &IndexMap::new(),
        )
        .unwrap();
        let errors = validate_config(&config);
        assert!(errors.iter().any(|e| e.message.contains("unknown stack")));
    }

    #[test]
    fn test_parser_empty_namespace_collision() {
        let config = parse_config(
            r#"
namespace: ""
stacks:
  - name: a
    stack_name: shared
    template_path: a.yaml
  - name: b
    stack_name: shared
    template_path: b.yaml
"#,
            &IndexMap::new(),
        )
        .unwrap();
        let errors = validate_config(&config);
        assert!(errors.iter().any(|e| e.message.contains("share")));
    }

    #[test]
    fn test_parser_unknown_top_level_warns_not_errors() {
        let config = parse_config(
            r#"
namespace: ns
shared_anchors: &anchors
  key: value
stacks: []
"#,
            &IndexMap::new(),
        )
        .unwrap();
        assert!(validate_config(&config).is_empty());
        assert_eq!(unknown_top_level_keys(&config), vec!["shared_anchors"]);
    }

    #[test]
    fn test_parser_config_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("apilar.yaml");
        std::fs::write(&path, "namespace: ns\nstacks: []\n").unwrap();
        let config = parse_config_file(&path, &IndexMap::new()).unwrap();
        assert_eq!(config.namespace, "ns");
    }

    #[test]
    fn test_parser_invalid_yaml() {
        let result = parse_config("not: [valid: yaml: {{", &IndexMap::new());
        assert!(matches!(result, Err(ConfigError::Yaml(_))));
    }
}
