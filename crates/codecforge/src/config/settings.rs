use serde::Deserialize;

use crate::config::ConfigDoc;
use crate::error::Result;
use crate::workspace::WorkspaceConfig;

fn default_timeout_secs() -> u64 {
    3600
}

fn default_emulated_factor() -> u32 {
    4
}

fn default_fetch_retries() -> u32 {
    3
}

fn default_fetch_backoff_ms() -> u64 {
    2000
}

fn default_leak_probes() -> Vec<String> {
    vec!["glib-2.0".into(), "libudev".into()]
}

fn default_ledger_path() -> String {
    "versions.env".into()
}

/// How per-target failures during the dependency phase are reported.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum BuildMode {
    /// Report the first failing target; dependents of a failed target never start.
    #[default]
    Strict,
    /// Collect every failing target into one batch report.
    Triage,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BuildSettings {
    /// 0 = host core count.
    pub max_parallel: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_emulated_factor")]
    pub emulated_timeout_factor: u32,
    pub mode: BuildMode,
    #[serde(default = "default_fetch_retries")]
    pub fetch_retries: u32,
    #[serde(default = "default_fetch_backoff_ms")]
    pub fetch_backoff_ms: u64,
    /// Packages that only exist on the host; resolving any of them through the
    /// isolated search path means the isolation leaks.
    #[serde(default = "default_leak_probes")]
    pub leak_probe_packages: Vec<String>,
    pub strict_isolation: bool,
}

impl Default for BuildSettings {
    fn default() -> Self {
        Self {
            max_parallel: 0,
            timeout_secs: default_timeout_secs(),
            emulated_timeout_factor: default_emulated_factor(),
            mode: BuildMode::Strict,
            fetch_retries: default_fetch_retries(),
            fetch_backoff_ms: default_fetch_backoff_ms(),
            leak_probe_packages: default_leak_probes(),
            strict_isolation: false,
        }
    }
}

impl BuildSettings {
    pub fn workers(&self) -> usize {
        if self.max_parallel == 0 {
            num_cpus::get().max(1)
        } else {
            self.max_parallel
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LedgerSettings {
    #[serde(default = "default_ledger_path")]
    pub path: String,
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self {
            path: default_ledger_path(),
        }
    }
}

fn default_consumer_name() -> String {
    "ffmpeg".into()
}

fn default_debug_flags() -> Vec<String> {
    vec!["--enable-debug=3".into(), "--disable-stripping".into()]
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConsumerSettings {
    #[serde(default = "default_consumer_name")]
    pub name: String,
    /// Local checkout of the consumer program.
    pub source_dir: Option<String>,
    /// Ledger entry to fetch the consumer source from instead of `source_dir`.
    pub pin: Option<String>,
    /// Installed binary name (without platform suffix); defaults to `name`.
    pub binary: Option<String>,
    pub configure_flags: Vec<String>,
    /// pkg-config names the consumer needs beyond the active dependencies.
    pub extra_pkgconfig: Vec<String>,
    #[serde(default = "default_debug_flags")]
    pub debug_flags: Vec<String>,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            name: default_consumer_name(),
            source_dir: None,
            pin: None,
            binary: None,
            configure_flags: Vec::new(),
            extra_pkgconfig: Vec::new(),
            debug_flags: default_debug_flags(),
        }
    }
}

impl ConsumerSettings {
    pub fn binary_name(&self) -> &str {
        self.binary
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(self.name.as_str())
    }
}

/// Typed view of the run file, minus platform records.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub workspace: WorkspaceConfig,
    pub build: BuildSettings,
    pub ledger: LedgerSettings,
    pub consumer: ConsumerSettings,
}

impl Settings {
    pub fn from_doc(doc: &ConfigDoc) -> Result<Self> {
        Ok(Self {
            workspace: doc.deserialize_path("workspace")?.unwrap_or_default(),
            build: doc.deserialize_path("build")?.unwrap_or_default(),
            ledger: doc.deserialize_path("ledger")?.unwrap_or_default(),
            consumer: doc.deserialize_path("consumer")?.unwrap_or_default(),
        })
    }
}
