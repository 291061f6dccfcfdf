//! Runtime stack state, materialized from a definition for one invocation.

use indexmap::{IndexMap, IndexSet};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

use super::context::Context;
use super::types::{Config, InProgressBehavior, StackDef};
use crate::blueprint::{Blueprint, BlueprintError, BlueprintRegistry, RawTemplateBlueprint};
use crate::lookups::parser::{ParseError, ValueNode};
use crate::lookups::{self, LookupRegistry, ResolveError};
use crate::provider::{Provider, StackSubmission};
use crate::variables::{self, BindError};

#[derive(Debug, Error)]
pub enum StackError {
    #[error("stack '{stack}': {source}")]
    Parse {
        stack: String,
        source: ParseError,
    },

    #[error("stack '{stack}': unknown blueprint '{blueprint}'")]
    UnknownBlueprint { stack: String, blueprint: String },

    #[error("stack '{stack}' has neither a blueprint nor a template path")]
    NoTemplateSource { stack: String },

    #[error("stack '{stack}': cannot read stack policy {path}: {reason}")]
    StackPolicy {
        stack: String,
        path: String,
        reason: String,
    },

    #[error("variable '{variable}' in stack '{stack}' has a circular reference")]
    CircularReference { stack: String, variable: String },

    #[error("stack '{stack}': {source}")]
    Blueprint {
        stack: String,
        source: BlueprintError,
    },

    #[error("stack '{stack}': {source}")]
    Resolve {
        stack: String,
        source: ResolveError,
    },

    #[error("stack '{stack}': {source}")]
    Bind {
        stack: String,
        source: BindError,
    },
}

/// Gathered information about one stack in the current plan.
pub struct Stack {
    pub name: String,
    pub fqn: String,
    pub region: Option<String>,
    pub profile: Option<String>,
    pub tags: BTreeMap<String, String>,
    pub locked: bool,
    /// Present in the `--force` list; overrides `locked`
    pub forced: bool,
    pub enabled: bool,
    pub protected: bool,
    pub external: bool,
    pub in_progress_behavior: InProgressBehavior,
    pub notification_arns: Vec<String>,
    pub service_role: Option<String>,
    pub requires: Vec<String>,
    pub stack_policy: Option<String>,
    /// Parsed variable trees, re-resolved when the step materializes
    pub variables: IndexMap<String, ValueNode>,
    blueprint: Option<Arc<dyn Blueprint>>,
    /// Known only from the persisted graph; destroy-only
    pub placeholder: bool,
}

impl Stack {
    pub fn from_def(
        def: &StackDef,
        config: &Config,
        ctx: &Context,
        blueprints: &BlueprintRegistry,
        force: &[String],
    ) -> Result<Self, StackError> {
        let stack = def.name.clone();

        let mut variables = IndexMap::new();
        for (name, raw) in &def.variables {
            let node = lookups::parser::parse_value(raw)
                .map_err(|source| StackError::Parse { stack: stack.clone(), source })?;
            variables.insert(name.clone(), node);
        }

        let blueprint: Option<Arc<dyn Blueprint>> = if let Some(name) = &def.blueprint {
            Some(blueprints.get(name).ok_or_else(|| StackError::UnknownBlueprint {
                stack: stack.clone(),
                blueprint: name.clone(),
            })?)
        } else if let Some(path) = &def.template_path {
            let raw = RawTemplateBlueprint::load(&def.name, Path::new(path), &ctx.config_dir)
                .map_err(|source| StackError::Blueprint { stack: stack.clone(), source })?;
            Some(Arc::new(raw))
        } else if def.locked || def.external {
            None
        } else {
            return Err(StackError::NoTemplateSource { stack });
        };

        let fqn = match (&def.fqn, &blueprint) {
            (Some(fqn), _) => fqn.clone(),
            (None, Some(blueprint)) => blueprint
                .fqn(ctx)
                .unwrap_or_else(|| ctx.get_fqn(def.stack_name())),
            (None, None) => ctx.get_fqn(def.stack_name()),
        };

        let mut tags = BTreeMap::new();
        for (key, value) in &config.tags {
            tags.insert(key.clone(), value.clone());
        }
        for (key, value) in &def.tags {
            tags.insert(key.clone(), value.clone());
        }

        let stack_policy = match &def.stack_policy_path {
            Some(path) => {
                let full = ctx.config_dir.join(path);
                Some(std::fs::read_to_string(&full).map_err(|e| StackError::StackPolicy {
                    stack: stack.clone(),
                    path: path.clone(),
                    reason: e.to_string(),
                })?)
            }
            None => None,
        };

        Ok(Self {
            name: def.name.clone(),
            fqn,
            region: def.region.clone(),
            profile: def.profile.clone(),
            tags,
            locked: def.locked,
            forced: force.iter().any(|f| *f == def.name),
            enabled: def.enabled,
            protected: def.protected,
            external: def.external,
            in_progress_behavior: def.in_progress_behavior,
            notification_arns: def.notification_arns.clone(),
            service_role: config.service_role.clone(),
            requires: def.requires.clone(),
            stack_policy,
            variables,
            blueprint,
            placeholder: false,
        })
    }

    /// A stack known only by name, from the persisted graph of a prior
    /// invocation. Destroy steps need nothing more than the FQN.
    pub fn placeholder(name: &str, requires: &[String], ctx: &Context) -> Self {
        Self {
            name: name.to_string(),
            fqn: ctx.get_fqn(name),
            region: None,
            profile: None,
            tags: BTreeMap::new(),
            locked: false,
            forced: false,
            enabled: true,
            protected: false,
            external: false,
            in_progress_behavior: InProgressBehavior::Error,
            notification_arns: Vec::new(),
            service_role: None,
            requires: requires.to_vec(),
            stack_policy: None,
            variables: IndexMap::new(),
            blueprint: None,
            placeholder: true,
        }
    }

    /// Explicit `requires` plus producers referenced by `output` lookups.
    /// A stack referencing its own outputs is an error.
    pub fn dependencies(&self) -> Result<IndexSet<String>, StackError> {
        let mut deps: IndexSet<String> = self.requires.iter().cloned().collect();
        for (variable, node) in &self.variables {
            for producer in lookups::dependencies(node) {
                if producer == self.name {
                    return Err(StackError::CircularReference {
                        stack: self.name.clone(),
                        variable: variable.clone(),
                    });
                }
                deps.insert(producer);
            }
        }
        Ok(deps)
    }

    /// Resolve variables, bind them against the blueprint schema, render
    /// the template, and assemble the provider submission.
    pub fn resolve(
        &self,
        ctx: &Context,
        provider: &dyn Provider,
        registry: &LookupRegistry,
    ) -> Result<StackSubmission, StackError> {
        let blueprint = self
            .blueprint
            .as_ref()
            .ok_or_else(|| StackError::NoTemplateSource { stack: self.name.clone() })?;

        let mut inputs = IndexMap::new();
        for (name, node) in &self.variables {
            let value = registry
                .resolve(node, ctx, provider)
                .map_err(|source| StackError::Resolve { stack: self.name.clone(), source })?;
            inputs.insert(name.clone(), value);
        }

        let bound = variables::bind(
            blueprint.variable_schema(),
            &inputs,
            blueprint.strict_variables(),
        )
        .map_err(|source| StackError::Bind { stack: self.name.clone(), source })?;

        let template = blueprint
            .render(ctx, &bound)
            .map_err(|source| StackError::Blueprint { stack: self.name.clone(), source })?;

        Ok(StackSubmission {
            fqn: self.fqn.clone(),
            template,
            parameters: bound.parameters,
            tags: self.tags.clone(),
            stack_policy: self.stack_policy.clone(),
            service_role: self.service_role.clone(),
            notification_arns: self.notification_arns.clone(),
        })
    }
}
