//! Apilar — stack-set orchestration.
//!
//! Declarative stacks in, a DAG of steps out. Bounded-parallel execution
//! against a pluggable cloud-control capability, with lookups, hooks, and
//! a persisted dependency graph for pruning removed stacks.

pub mod blueprint;
pub mod cli;
pub mod core;
pub mod diff;
pub mod events;
pub mod hooks;
pub mod lookups;
pub mod provider;
pub mod variables;
