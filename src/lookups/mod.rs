//! Lookup resolution.
//!
//! Config values are parsed into value trees (`parser`), then resolved
//! against a registry of named handlers (`handlers`). The planner only
//! asks a tree for its `dependencies()`; full resolution happens when a
//! step materializes, at which point a missing producer output is an
//! `UnresolvedDependency` error.

pub mod handlers;
pub mod parser;

use indexmap::IndexSet;
use std::collections::HashMap;
use thiserror::Error;

use crate::core::context::Context;
use crate::provider::{Provider, ProviderError};
use parser::{ParseError, ValueNode};

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("unknown lookup type '{0}'")]
    UnknownLookup(String),

    #[error("output of stack '{producer}' is not available yet")]
    UnresolvedDependency { producer: String },

    #[error("output '{output}' does not exist on stack '{stack}'")]
    OutputDoesNotExist { stack: String, output: String },

    #[error("cannot concatenate non-scalar result of lookup into a string")]
    InvalidConcatenation,

    #[error("lookup '{lookup}' failed: {reason}")]
    Handler { lookup: String, reason: String },

    #[error("provider call failed: {0}")]
    Provider(#[from] ProviderError),
}

impl ResolveError {
    fn handler(lookup: &str, reason: impl Into<String>) -> Self {
        Self::Handler { lookup: lookup.to_string(), reason: reason.into() }
    }
}

/// A named lookup implementation.
pub trait LookupHandler: Send + Sync {
    fn resolve(
        &self,
        arg: &str,
        ctx: &Context,
        provider: &dyn Provider,
    ) -> Result<serde_json::Value, ResolveError>;
}

/// Capability table of lookup handlers, keyed by type name.
pub struct LookupRegistry {
    handlers: HashMap<String, Box<dyn LookupHandler>>,
}

impl LookupRegistry {
    /// Registry with every built-in handler installed.
    pub fn with_builtins() -> Self {
        let mut registry = Self { handlers: HashMap::new() };
        handlers::register_builtins(&mut registry);
        registry
    }

    pub fn register(&mut self, name: &str, handler: Box<dyn LookupHandler>) {
        self.handlers.insert(name.to_string(), handler);
    }

    /// Install custom handlers declared in the config's `lookups` block.
    /// The only supported handler spec is `command:<program>`, which runs
    /// the program with the lookup argument and yields its stdout.
    pub fn register_from_config(
        &mut self,
        lookups: &indexmap::IndexMap<String, String>,
    ) -> Result<(), ResolveError> {
        for (name, spec) in lookups {
            match spec.split_once(':') {
                Some(("command", program)) => {
                    self.register(
                        name,
                        Box::new(handlers::CommandHandler::new(program)),
                    );
                }
                _ => {
                    return Err(ResolveError::handler(
                        name,
                        format!("unsupported handler spec '{}'", spec),
                    ))
                }
            }
        }
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Fully resolve a value tree. A value that is a single lookup yields
    /// the handler's native payload; mixed content is string-concatenated.
    pub fn resolve(
        &self,
        node: &ValueNode,
        ctx: &Context,
        provider: &dyn Provider,
    ) -> Result<serde_json::Value, ResolveError> {
        match node {
            ValueNode::Literal(value) => Ok(value.clone()),
            ValueNode::Lookup { name, arg } => {
                let handler = self
                    .handlers
                    .get(name)
                    .ok_or_else(|| ResolveError::UnknownLookup(name.clone()))?;
                let arg = self.resolve(arg, ctx, provider)?;
                let arg = scalar_to_string(&arg).ok_or(ResolveError::InvalidConcatenation)?;
                handler.resolve(&arg, ctx, provider)
            }
            ValueNode::Concat(parts) => {
                let mut out = String::new();
                for part in parts {
                    let value = self.resolve(part, ctx, provider)?;
                    out.push_str(
                        &scalar_to_string(&value).ok_or(ResolveError::InvalidConcatenation)?,
                    );
                }
                Ok(serde_json::Value::String(out))
            }
            ValueNode::List(items) => {
                let resolved: Result<Vec<_>, _> = items
                    .iter()
                    .map(|item| self.resolve(item, ctx, provider))
                    .collect();
                Ok(serde_json::Value::Array(resolved?))
            }
            ValueNode::Map(map) => {
                let mut out = serde_json::Map::new();
                for (key, value) in map {
                    out.insert(key.clone(), self.resolve(value, ctx, provider)?);
                }
                Ok(serde_json::Value::Object(out))
            }
        }
    }
}

/// Producers referenced by `output` lookups with statically-known stack
/// names. Nested expressions computing the stack name dynamically cannot
/// contribute an edge and are skipped, matching planner-mode semantics.
pub fn dependencies(node: &ValueNode) -> IndexSet<String> {
    let mut deps = IndexSet::new();
    collect_dependencies(node, &mut deps);
    deps
}

fn collect_dependencies(node: &ValueNode, deps: &mut IndexSet<String>) {
    match node {
        ValueNode::Literal(_) => {}
        ValueNode::Lookup { name, arg } => {
            if name == "output" {
                if let ValueNode::Literal(serde_json::Value::String(text)) = arg.as_ref() {
                    if let Some((stack, _)) = text.split_once("::") {
                        deps.insert(stack.to_string());
                    }
                }
            }
            collect_dependencies(arg, deps);
        }
        ValueNode::Concat(items) | ValueNode::List(items) => {
            for item in items {
                collect_dependencies(item, deps);
            }
        }
        ValueNode::Map(map) => {
            for value in map.values() {
                collect_dependencies(value, deps);
            }
        }
    }
}

/// String form of a scalar payload; `None` for arrays and objects.
pub fn scalar_to_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        serde_json::Value::Null => Some(String::new()),
        _ => None,
    }
}
