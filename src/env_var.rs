use std::sync::OnceLock;

use serde::Deserialize;

fn default_deadlock_timeout() -> f64 {
    600.0
}

fn default_backend() -> String {
    "local".to_owned()
}

fn default_enable_threading() -> bool {
    true
}

fn default_num_units() -> usize {
    1
}

fn default_local_window_size() -> usize {
    16 * 1024 * 1024
}

fn default_dephash_shards() -> usize {
    64
}

fn default_trace_dir() -> String {
    ".".to_owned()
}

#[derive(Deserialize, Debug)]
pub struct Config {
    /// A general timeout in seconds for blocking waits which may indicate a deadlock, default: 600.0 seconds
    #[serde(default = "default_deadlock_timeout")]
    pub deadlock_timeout: f64,

    /// The transport backend to use
    /// local -- all units are threads of the current process
    #[serde(default = "default_backend")]
    pub backend: String,

    /// Spawn the task worker pool, default: true
    #[serde(default = "default_enable_threading")]
    pub enable_threading: bool,

    /// Number of task workers per unit including the master thread
    pub num_threads: Option<usize>,

    /// Use every hardware thread of a core when sizing the worker pool
    pub max_smt: Option<bool>,

    /// Pin worker threads to cores, default: false
    #[serde(default)]
    pub thread_affinity: bool,

    /// Log the core each worker thread is pinned to, default: false
    #[serde(default)]
    pub thread_affinity_verbose: bool,

    /// Record per-unit task events and write them as csv at finalize, default: false
    #[serde(default)]
    pub enable_trace: bool,

    /// Directory the trace files are written to, default: "."
    #[serde(default = "default_trace_dir")]
    pub trace_dir: String,

    /// Spin inside init until a debugger flips the release flag, default: false
    #[serde(default)]
    pub init_breakpoint: bool,

    /// Print a backtrace when a task body panics, default: false
    #[serde(default)]
    pub task_print_backtrace: bool,

    /// Number of units launched by the in-process transport when the builder does not say, default: 1
    #[serde(default = "default_num_units")]
    pub num_units: usize,

    /// Size in bytes of the per-unit window serving non-collective allocations, default: 16 MiB
    #[serde(default = "default_local_window_size")]
    pub local_window_size: usize,

    /// Number of shards of the task dependency hash, default: 64
    #[serde(default = "default_dephash_shards")]
    pub dephash_shards: usize,

    /// Print runtime warnings, default: true
    pub runtime_warnings: Option<bool>,
}

/// Get the current Environment Variable configuration
pub fn config() -> &'static Config {
    static CONFIG: OnceLock<Config> = OnceLock::new();
    CONFIG.get_or_init(|| match envy::prefixed("DART_").from_env::<Config>() {
        Ok(config) => config,
        Err(error) => panic!("{}", error),
    })
}
