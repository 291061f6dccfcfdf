//! `${type arg}` expression parsing.
//!
//! Scans raw config values into a tree of literals, concatenations, and
//! lookups. Braces are balance-counted so lookups may nest:
//! `${output ${default env::dev}-vpc::Id}` parses the inner expression as
//! part of the outer argument.

use indexmap::IndexMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("unclosed lookup expression at offset {0}")]
    Unclosed(usize),

    #[error("empty lookup expression")]
    Empty,

    #[error("invalid lookup type '{0}'")]
    InvalidType(String),
}

/// Parsed form of a config value.
#[derive(Debug, Clone, PartialEq)]
pub enum ValueNode {
    /// Plain data with no expressions
    Literal(serde_json::Value),
    /// Adjacent text and expressions inside one string
    Concat(Vec<ValueNode>),
    /// `${name arg}`; the argument is itself a parsed value
    Lookup { name: String, arg: Box<ValueNode> },
    List(Vec<ValueNode>),
    Map(IndexMap<String, ValueNode>),
}

impl ValueNode {
    pub fn literal_str(text: &str) -> Self {
        Self::Literal(serde_json::Value::String(text.to_string()))
    }

    /// Whether any lookup appears anywhere in the tree.
    pub fn has_lookups(&self) -> bool {
        match self {
            Self::Literal(_) => false,
            Self::Lookup { .. } => true,
            Self::Concat(items) | Self::List(items) => items.iter().any(ValueNode::has_lookups),
            Self::Map(map) => map.values().any(ValueNode::has_lookups),
        }
    }
}

/// Parse any YAML value, recursing through lists and maps and scanning
/// strings for expressions.
pub fn parse_value(raw: &serde_yaml_ng::Value) -> Result<ValueNode, ParseError> {
    match raw {
        serde_yaml_ng::Value::String(s) => parse_expression(s),
        serde_yaml_ng::Value::Sequence(items) => {
            let parsed: Result<Vec<_>, _> = items.iter().map(parse_value).collect();
            Ok(ValueNode::List(parsed?))
        }
        serde_yaml_ng::Value::Mapping(map) => {
            let mut parsed = IndexMap::new();
            for (key, value) in map {
                let key = match key {
                    serde_yaml_ng::Value::String(s) => s.clone(),
                    other => yaml_scalar_to_string(other),
                };
                parsed.insert(key, parse_value(value)?);
            }
            Ok(ValueNode::Map(parsed))
        }
        other => Ok(ValueNode::Literal(yaml_to_json(other))),
    }
}

/// Parse a string that may contain `${...}` expressions.
pub fn parse_expression(input: &str) -> Result<ValueNode, ParseError> {
    let mut parts: Vec<ValueNode> = Vec::new();
    let mut rest = input;
    let mut offset = 0usize;

    while let Some(start) = rest.find("${") {
        if start > 0 {
            parts.push(ValueNode::literal_str(&rest[..start]));
        }
        let body_start = start + 2;
        let end = matching_brace(&rest[body_start..])
            .ok_or(ParseError::Unclosed(offset + start))?;
        let body = &rest[body_start..body_start + end];
        parts.push(parse_lookup_body(body)?);
        rest = &rest[body_start + end + 1..];
        offset += body_start + end + 1;
    }

    if !rest.is_empty() {
        parts.push(ValueNode::literal_str(rest));
    }

    match parts.len() {
        0 => Ok(ValueNode::literal_str("")),
        1 => Ok(parts.remove(0)),
        _ => Ok(ValueNode::Concat(parts)),
    }
}

/// Byte offset of the `}` matching an already-consumed `${`, counting
/// nested `${` openers.
fn matching_brace(input: &str) -> Option<usize> {
    let bytes = input.as_bytes();
    let mut depth = 0usize;
    let mut i = 0usize;
    while i < bytes.len() {
        if bytes[i] == b'$' && i + 1 < bytes.len() && bytes[i + 1] == b'{' {
            depth += 1;
            i += 2;
            continue;
        }
        if bytes[i] == b'}' {
            if depth == 0 {
                return Some(i);
            }
            depth -= 1;
        }
        i += 1;
    }
    None
}

/// Split a `type arg` body. Only the explicit form is accepted: without
/// whitespace the whole body is the type name and the argument is empty.
fn parse_lookup_body(body: &str) -> Result<ValueNode, ParseError> {
    let body = body.trim();
    if body.is_empty() {
        return Err(ParseError::Empty);
    }
    let (name, arg) = match body.find(char::is_whitespace) {
        Some(pos) => (&body[..pos], body[pos..].trim_start()),
        None => (body, ""),
    };
    if !valid_type_name(name) {
        return Err(ParseError::InvalidType(name.to_string()));
    }
    let arg = parse_expression(arg)?;
    Ok(ValueNode::Lookup {
        name: name.to_string(),
        arg: Box::new(arg),
    })
}

fn valid_type_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn yaml_scalar_to_string(value: &serde_yaml_ng::Value) -> String {
    match value {
        serde_yaml_ng::Value::String(s) => s.clone(),
        serde_yaml_ng::Value::Number(n) => n.to_string(),
        serde_yaml_ng::Value::Bool(b) => b.to_string(),
        other => format!("{:?}", other),
    }
}

pub(crate) fn yaml_to_json(value: &serde_yaml_ng::Value) -> serde_json::Value {
    match value {
        serde_yaml_ng::Value::Null => serde_json::Value::Null,
        serde_yaml_ng::Value::Bool(b) => serde_json::Value::Bool(*b),
        serde_yaml_ng::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                serde_json::Value::from(i)
            } else if let Some(f) = n.as_f64() {
                serde_json::Value::from(f)
            } else {
                serde_json::Value::String(n.to_string())
            }
        }
        serde_yaml_ng::Value::String(s) => serde_json::Value::String(s.clone()),
        serde_yaml_ng::Value::Sequence(items) => {
            serde_json::Value::Array(items.iter().map(yaml_to_json).collect())
        }
        serde_yaml_ng::Value::Mapping(map) => {
            let mut out = serde_json::Map::new();
            for (key, value) in map {
                out.insert(yaml_scalar_to_string(key), yaml_to_json(value));
            }
            serde_json::Value::Object(out)
        }
        serde_yaml_ng::Value::Tagged(tagged) => yaml_to_json(&tagged.value),
    }
}
