//! Built-in lookup handlers.
//!
//! Each handler owns one `${type arg}` grammar. Handlers that talk to the
//! control plane go through the provider capability; the rest read the
//! context, the process environment, or files relative to the config.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use regex::Regex;
use std::process::Command;

use super::{LookupHandler, LookupRegistry, ResolveError};
use crate::core::context::Context;
use crate::provider::{self, ImageQuery, Provider};

pub fn register_builtins(registry: &mut LookupRegistry) {
    registry.register("output", Box::new(OutputHandler));
    registry.register("rxref", Box::new(RxrefHandler));
    registry.register("xref", Box::new(XrefHandler));
    registry.register("envvar", Box::new(EnvvarHandler));
    registry.register("file", Box::new(FileHandler));
    registry.register("kms", Box::new(KmsHandler));
    registry.register("ssmstore", Box::new(SsmstoreHandler));
    registry.register("dynamodb", Box::new(DynamodbHandler));
    registry.register("ami", Box::new(AmiHandler));
    registry.register("hook_data", Box::new(HookDataHandler));
    registry.register("default", Box::new(DefaultHandler));
    registry.register("split", Box::new(SplitHandler));
}

/// Dereference `file://path` (relative to the config directory), or return
/// the value unchanged.
fn read_value_from_path(ctx: &Context, value: &str) -> Result<String, ResolveError> {
    match value.strip_prefix("file://") {
        Some(rel) => {
            let path = ctx.config_dir.join(rel);
            std::fs::read_to_string(&path).map_err(|e| {
                ResolveError::Handler {
                    lookup: "file".to_string(),
                    reason: format!("cannot read {}: {}", path.display(), e),
                }
            })
        }
        None => Ok(value.to_string()),
    }
}

fn split_stack_output(lookup: &str, arg: &str) -> Result<(String, String), ResolveError> {
    match arg.split_once("::") {
        Some((stack, output)) if !stack.is_empty() && !output.is_empty() => {
            Ok((stack.to_string(), output.to_string()))
        }
        _ => Err(ResolveError::handler(
            lookup,
            format!("expected <stack>::<output>, got '{}'", arg),
        )),
    }
}

/// Optional `region@` prefix used by several provider-backed lookups.
fn split_region(arg: &str) -> (Option<&str>, &str) {
    match arg.split_once('@') {
        Some((region, rest)) if !region.contains(char::is_whitespace) => (Some(region), rest),
        _ => (None, arg),
    }
}

// ============================================================================
// Stack output lookups
// ============================================================================

/// `${output stack::Name}` — read from the current plan's output cache.
/// A missing producer is how the planner discovers implicit edges.
pub struct OutputHandler;

impl LookupHandler for OutputHandler {
    fn resolve(
        &self,
        arg: &str,
        ctx: &Context,
        _provider: &dyn Provider,
    ) -> Result<serde_json::Value, ResolveError> {
        let (stack, output) = split_stack_output("output", arg)?;
        if !ctx.has_outputs(&stack) {
            return Err(ResolveError::UnresolvedDependency { producer: stack });
        }
        ctx.output(&stack, &output)
            .map(serde_json::Value::String)
            .ok_or(ResolveError::OutputDoesNotExist { stack, output })
    }
}

/// `${rxref stack::Name}` — resolve a namespace-qualified stack against the
/// live control plane, without creating a plan edge.
pub struct RxrefHandler;

impl LookupHandler for RxrefHandler {
    fn resolve(
        &self,
        arg: &str,
        ctx: &Context,
        provider: &dyn Provider,
    ) -> Result<serde_json::Value, ResolveError> {
        let (stack, output) = split_stack_output("rxref", arg)?;
        let fqn = ctx.get_fqn(&stack);
        Ok(serde_json::Value::String(provider::get_output(
            provider, &fqn, &output,
        )?))
    }
}

/// `${xref full-stack-name::Name}` — like rxref but already fully qualified.
pub struct XrefHandler;

impl LookupHandler for XrefHandler {
    fn resolve(
        &self,
        arg: &str,
        _ctx: &Context,
        provider: &dyn Provider,
    ) -> Result<serde_json::Value, ResolveError> {
        let (fqn, output) = split_stack_output("xref", arg)?;
        Ok(serde_json::Value::String(provider::get_output(
            provider, &fqn, &output,
        )?))
    }
}

// ============================================================================
// Environment lookups
// ============================================================================

/// `${envvar NAME}` — process environment; `file://` reads the variable
/// name from a file.
pub struct EnvvarHandler;

impl LookupHandler for EnvvarHandler {
    fn resolve(
        &self,
        arg: &str,
        ctx: &Context,
        _provider: &dyn Provider,
    ) -> Result<serde_json::Value, ResolveError> {
        let name = read_value_from_path(ctx, arg)?;
        let name = name.trim();
        std::env::var(name)
            .map(serde_json::Value::String)
            .map_err(|_| {
                ResolveError::handler("envvar", format!("environment variable '{}' is not set", name))
            })
    }
}

/// `${default name::fallback}` — an environment-file value if present,
/// else the literal fallback.
pub struct DefaultHandler;

impl LookupHandler for DefaultHandler {
    fn resolve(
        &self,
        arg: &str,
        ctx: &Context,
        _provider: &dyn Provider,
    ) -> Result<serde_json::Value, ResolveError> {
        let (name, fallback) = arg.split_once("::").ok_or_else(|| {
            ResolveError::handler("default", format!("expected <name>::<fallback>, got '{}'", arg))
        })?;
        let value = ctx
            .environment
            .get(name)
            .cloned()
            .unwrap_or_else(|| fallback.to_string());
        Ok(serde_json::Value::String(value))
    }
}

/// `${split delim::text}` — a list.
pub struct SplitHandler;

impl LookupHandler for SplitHandler {
    fn resolve(
        &self,
        arg: &str,
        _ctx: &Context,
        _provider: &dyn Provider,
    ) -> Result<serde_json::Value, ResolveError> {
        let (delimiter, text) = arg.split_once("::").ok_or_else(|| {
            ResolveError::handler("split", format!("expected <delimiter>::<text>, got '{}'", arg))
        })?;
        let items: Vec<serde_json::Value> = text
            .split(delimiter)
            .map(|part| serde_json::Value::String(part.to_string()))
            .collect();
        Ok(serde_json::Value::Array(items))
    }
}

/// `${hook_data key::path.to.leaf}` — read a hook result from the context.
pub struct HookDataHandler;

impl LookupHandler for HookDataHandler {
    fn resolve(
        &self,
        arg: &str,
        ctx: &Context,
        _provider: &dyn Provider,
    ) -> Result<serde_json::Value, ResolveError> {
        let (key, path) = match arg.split_once("::") {
            Some((key, path)) => (key, Some(path)),
            None => (arg, None),
        };
        let mut value = ctx.hook_data(key).ok_or_else(|| {
            ResolveError::handler("hook_data", format!("no hook data under key '{}'", key))
        })?;
        if let Some(path) = path {
            for segment in path.split('.') {
                value = value.get(segment).cloned().ok_or_else(|| {
                    ResolveError::handler(
                        "hook_data",
                        format!("'{}' missing in hook data '{}'", segment, key),
                    )
                })?;
            }
        }
        Ok(value)
    }
}

// ============================================================================
// File codecs
// ============================================================================

/// `${file codec:source}` — file contents through one of eight codecs.
pub struct FileHandler;

impl LookupHandler for FileHandler {
    fn resolve(
        &self,
        arg: &str,
        ctx: &Context,
        _provider: &dyn Provider,
    ) -> Result<serde_json::Value, ResolveError> {
        let (codec, source) = arg.split_once(':').ok_or_else(|| {
            ResolveError::handler("file", format!("expected <codec>:<source>, got '{}'", arg))
        })?;
        let raw = read_value_from_path(ctx, source)?;
        decode(codec, &raw)
    }
}

fn decode(codec: &str, raw: &str) -> Result<serde_json::Value, ResolveError> {
    match codec {
        "plain" => Ok(serde_json::Value::String(raw.to_string())),
        "base64" => Ok(serde_json::Value::String(BASE64.encode(raw.as_bytes()))),
        "parameterized" => Ok(parameterize_string(raw)),
        "parameterized-b64" => Ok(serde_json::json!({ "Fn::Base64": parameterize_string(raw) })),
        "json" => serde_json::from_str(raw)
            .map_err(|e| ResolveError::handler("file", format!("invalid JSON: {}", e))),
        "json-parameterized" => {
            let value: serde_json::Value = serde_json::from_str(raw)
                .map_err(|e| ResolveError::handler("file", format!("invalid JSON: {}", e)))?;
            Ok(parameterize_value(&value))
        }
        "yaml" => {
            let value: serde_yaml_ng::Value = serde_yaml_ng::from_str(raw)
                .map_err(|e| ResolveError::handler("file", format!("invalid YAML: {}", e)))?;
            Ok(super::parser::yaml_to_json(&value))
        }
        "yaml-parameterized" => {
            let value: serde_yaml_ng::Value = serde_yaml_ng::from_str(raw)
                .map_err(|e| ResolveError::handler("file", format!("invalid YAML: {}", e)))?;
            Ok(parameterize_value(&super::parser::yaml_to_json(&value)))
        }
        other => Err(ResolveError::handler(
            "file",
            format!("unknown codec '{}'", other),
        )),
    }
}

/// Replace `{{Name}}` placeholders with provider-intrinsic references,
/// producing a join expression when any placeholder is present.
fn parameterize_string(raw: &str) -> serde_json::Value {
    let pattern = Regex::new(r"\{\{([\w:|]+)\}\}").expect("valid pattern");
    let mut parts: Vec<serde_json::Value> = Vec::new();
    let mut cursor = 0usize;
    for capture in pattern.captures_iter(raw) {
        let whole = capture.get(0).expect("match");
        if whole.start() > cursor {
            parts.push(serde_json::Value::String(raw[cursor..whole.start()].to_string()));
        }
        parts.push(serde_json::json!({ "Ref": capture[1].to_string() }));
        cursor = whole.end();
    }
    if parts.is_empty() {
        return serde_json::Value::String(raw.to_string());
    }
    if cursor < raw.len() {
        parts.push(serde_json::Value::String(raw[cursor..].to_string()));
    }
    serde_json::json!({ "Fn::Join": ["", parts] })
}

fn parameterize_value(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::String(s) => parameterize_string(s),
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(parameterize_value).collect())
        }
        serde_json::Value::Object(map) => serde_json::Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), parameterize_value(v)))
                .collect(),
        ),
        other => other.clone(),
    }
}

// ============================================================================
// Provider-backed lookups
// ============================================================================

/// `${kms [region@]ciphertext}` — decrypt via the provider's crypto
/// facility; the ciphertext may be `file://`-indirected.
pub struct KmsHandler;

impl LookupHandler for KmsHandler {
    fn resolve(
        &self,
        arg: &str,
        ctx: &Context,
        provider: &dyn Provider,
    ) -> Result<serde_json::Value, ResolveError> {
        let (region, ciphertext) = split_region(arg);
        let ciphertext = read_value_from_path(ctx, ciphertext)?;
        Ok(serde_json::Value::String(
            provider.decrypt(ciphertext.trim(), region)?,
        ))
    }
}

/// `${ssmstore [region@]name}` — a named secret parameter.
pub struct SsmstoreHandler;

impl LookupHandler for SsmstoreHandler {
    fn resolve(
        &self,
        arg: &str,
        _ctx: &Context,
        provider: &dyn Provider,
    ) -> Result<serde_json::Value, ResolveError> {
        let (region, name) = split_region(arg);
        Ok(serde_json::Value::String(
            provider.get_parameter(name.trim(), region)?,
        ))
    }
}

/// `${dynamodb [region:]table@pk:value.attr[T]...}` — one attribute of one
/// item, with `[T]` asserting the terminal attribute type.
pub struct DynamodbHandler;

impl LookupHandler for DynamodbHandler {
    fn resolve(
        &self,
        arg: &str,
        _ctx: &Context,
        provider: &dyn Provider,
    ) -> Result<serde_json::Value, ResolveError> {
        let bad = |reason: String| ResolveError::handler("dynamodb", reason);
        let (address, query) = arg
            .split_once('@')
            .ok_or_else(|| bad(format!("expected <table>@<key>:<value>..., got '{}'", arg)))?;
        let (region, table) = match address.split_once(':') {
            Some((region, table)) => (Some(region), table),
            None => (None, address),
        };
        let (key_name, rest) = query
            .split_once(':')
            .ok_or_else(|| bad(format!("expected <key>:<value> after '@', got '{}'", query)))?;

        let mut segments = rest.split('.');
        let key_value = segments
            .next()
            .filter(|v| !v.is_empty())
            .ok_or_else(|| bad("missing partition key value".to_string()))?;

        let mut value = provider.get_item(table, key_name, key_value, region)?;
        for segment in segments {
            let (attr, type_hint) = split_type_hint(segment);
            value = value
                .get(attr)
                .cloned()
                .ok_or_else(|| bad(format!("attribute '{}' not found", attr)))?;
            if let Some(hint) = type_hint {
                check_type_hint(&value, hint)
                    .map_err(|reason| bad(format!("attribute '{}': {}", attr, reason)))?;
            }
        }
        Ok(value)
    }
}

fn split_type_hint(segment: &str) -> (&str, Option<char>) {
    if let Some(open) = segment.find('[') {
        if segment.ends_with(']') && segment.len() == open + 3 {
            let hint = segment.as_bytes()[open + 1] as char;
            return (&segment[..open], Some(hint));
        }
    }
    (segment, None)
}

fn check_type_hint(value: &serde_json::Value, hint: char) -> Result<(), String> {
    let ok = match hint {
        'S' => value.is_string(),
        'N' => value.is_number(),
        'M' => value.is_object(),
        'L' => value.is_array(),
        'B' => value.is_string(),
        other => return Err(format!("unknown type selector '{}'", other)),
    };
    if ok {
        Ok(())
    } else {
        Err(format!("value does not match type selector '{}'", hint))
    }
}

/// `${ami [region@]owners:a,b name_regex:pattern key:value...}` — the most
/// recent matching machine image.
pub struct AmiHandler;

impl LookupHandler for AmiHandler {
    fn resolve(
        &self,
        arg: &str,
        ctx: &Context,
        provider: &dyn Provider,
    ) -> Result<serde_json::Value, ResolveError> {
        let value = read_value_from_path(ctx, arg)?;
        let (region, filters) = split_region(value.trim());

        let mut query = ImageQuery::default();
        for token in filters.split_whitespace() {
            let (key, value) = token.split_once(':').ok_or_else(|| {
                ResolveError::handler("ami", format!("expected key:value filter, got '{}'", token))
            })?;
            match key {
                "owners" => query.owners = value.split(',').map(str::to_string).collect(),
                "name_regex" => query.name_regex = value.to_string(),
                "executable_users" => {
                    query.executable_users = value.split(',').map(str::to_string).collect()
                }
                other => {
                    query
                        .filters
                        .insert(other.to_string(), value.split(',').map(str::to_string).collect());
                }
            }
        }
        if query.owners.is_empty() {
            return Err(ResolveError::handler("ami", "'owners' filter is required"));
        }
        if query.name_regex.is_empty() {
            return Err(ResolveError::handler("ami", "'name_regex' filter is required"));
        }
        Ok(serde_json::Value::String(
            provider.find_image(&query, region)?,
        ))
    }
}

// ============================================================================
// Custom handlers
// ============================================================================

/// Config-registered handler: runs a program with the lookup argument and
/// yields its trimmed stdout.
pub struct CommandHandler {
    program: String,
}

impl CommandHandler {
    pub fn new(program: &str) -> Self {
        Self { program: program.to_string() }
    }
}

impl LookupHandler for CommandHandler {
    fn resolve(
        &self,
        arg: &str,
        _ctx: &Context,
        _provider: &dyn Provider,
    ) -> Result<serde_json::Value, ResolveError> {
        let output = Command::new(&self.program)
            .arg(arg)
            .output()
            .map_err(|e| {
                ResolveError::handler("command", format!("failed to run {}: {}", self.program, e))
            })?;
        if !output.status.success() {
            return Err(ResolveError::handler(
                "command",
                format!(
                    "{} exited with {}: {}",
                    self.program,
                    output.status.code().unwrap_or(-1),
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ));
        }
        Ok(serde_json::Value::String(
            String::from_utf8_lossy(&output.stdout).trim().to_string(),
        ))
    }
}
