//! Execution-wide context: namespace, environment, shared caches, and the
//! process cancellation token.

use indexmap::IndexMap;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use super::types::Config;

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn mark_interrupted(_sig: libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

/// Install SIGINT/SIGTERM handlers that trip every process-scoped token.
pub fn install_signal_handlers() {
    unsafe {
        libc::signal(libc::SIGINT, mark_interrupted as libc::sighandler_t);
        libc::signal(libc::SIGTERM, mark_interrupted as libc::sighandler_t);
    }
}

/// Whether the process received SIGINT/SIGTERM (drives exit code 130).
pub fn was_interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

/// Cooperative cancellation signal shared by every worker.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
    process_scoped: bool,
}

impl CancellationToken {
    /// A token tripped only by an explicit `cancel()`. Used in tests.
    pub fn new() -> Self {
        Self::default()
    }

    /// A token also tripped by SIGINT/SIGTERM.
    pub fn for_process() -> Self {
        Self { flag: Arc::new(AtomicBool::new(false)), process_scoped: true }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.flag.load(Ordering::SeqCst) || (self.process_scoped && was_interrupted())
    }

    /// Sleep for `duration`, returning early (true) if canceled.
    pub fn wait(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_canceled() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let remaining = deadline - now;
            std::thread::sleep(remaining.min(Duration::from_millis(50)));
        }
    }
}

/// The environment a single invocation runs under.
///
/// Shared across workers; the outputs cache and hook-data bag are the only
/// mutable members and both are interior-locked. Outputs are write-once per
/// stack, published when the producing step completes.
pub struct Context {
    pub namespace: String,
    pub delimiter: String,
    /// Values substituted into the config and visible to `default` lookups
    pub environment: IndexMap<String, String>,
    /// Mappings passed through to blueprints
    pub mappings: IndexMap<String, serde_yaml_ng::Value>,
    /// Directory the config was loaded from; `file://` paths resolve here
    pub config_dir: PathBuf,
    pub cancel: CancellationToken,
    outputs: RwLock<HashMap<String, BTreeMap<String, String>>>,
    hook_data: RwLock<serde_json::Map<String, serde_json::Value>>,
}

impl Context {
    pub fn new(config: &Config, environment: IndexMap<String, String>, config_dir: &Path) -> Self {
        Self {
            namespace: config.namespace.clone(),
            delimiter: config.namespace_delimiter.clone(),
            environment,
            mappings: config.mappings.clone(),
            config_dir: config_dir.to_path_buf(),
            cancel: CancellationToken::for_process(),
            outputs: RwLock::new(HashMap::new()),
            hook_data: RwLock::new(serde_json::Map::new()),
        }
    }

    /// Bare context for tests: namespace only, test-scoped cancellation.
    pub fn for_namespace(namespace: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            delimiter: "-".to_string(),
            environment: IndexMap::new(),
            mappings: IndexMap::new(),
            config_dir: PathBuf::from("."),
            cancel: CancellationToken::new(),
            outputs: RwLock::new(HashMap::new()),
            hook_data: RwLock::new(serde_json::Map::new()),
        }
    }

    /// Fully qualified cloud-side name for a stack name.
    pub fn get_fqn(&self, name: &str) -> String {
        if self.namespace.is_empty() {
            name.to_string()
        } else {
            format!("{}{}{}", self.namespace, self.delimiter, name)
        }
    }

    /// Publish the outputs of a completed stack. First write wins; a
    /// producer completes exactly once per invocation.
    pub fn set_outputs(&self, logical_name: &str, outputs: BTreeMap<String, String>) {
        let mut cache = self.outputs.write().expect("outputs lock");
        cache.entry(logical_name.to_string()).or_insert(outputs);
    }

    pub fn has_outputs(&self, logical_name: &str) -> bool {
        self.outputs
            .read()
            .expect("outputs lock")
            .contains_key(logical_name)
    }

    pub fn output(&self, logical_name: &str, output_name: &str) -> Option<String> {
        self.outputs
            .read()
            .expect("outputs lock")
            .get(logical_name)
            .and_then(|outputs| outputs.get(output_name).cloned())
    }

    pub fn outputs_of(&self, logical_name: &str) -> Option<BTreeMap<String, String>> {
        self.outputs
            .read()
            .expect("outputs lock")
            .get(logical_name)
            .cloned()
    }

    /// Record a hook's result under its `data_key`.
    pub fn set_hook_data(&self, key: &str, value: serde_json::Value) {
        self.hook_data
            .write()
            .expect("hook data lock")
            .insert(key.to_string(), value);
    }

    pub fn hook_data(&self, key: &str) -> Option<serde_json::Value> {
        self.hook_data
            .read()
            .expect("hook data lock")
            .get(key)
            .cloned()
    }
}
