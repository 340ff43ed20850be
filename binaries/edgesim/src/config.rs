//! Edgesim configuration.
//!
//! Settings come from built-in defaults, an optional TOML file, the
//! `TOPO_NS`/`CORE_NS` environment variables and CLI flags, in increasing
//! order of precedence.

use std::path::Path;
use std::time::Duration;

use edgesim_orchestrator::{KubectlConfig, OrchestratorConfig};
use serde::{Deserialize, Serialize};

use crate::CommonArgs;

/// Edgesim configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EdgesimConfig {
    /// Namespaces.
    pub namespaces: NamespaceConfig,

    /// External tools.
    pub tools: ToolConfig,

    /// Pod readiness polling.
    pub readiness: ReadinessConfig,

    /// Interface configuration retries.
    pub configure: ConfigureConfig,

    /// Logging configuration.
    pub logging: LoggingConfig,
}

/// Namespace configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NamespaceConfig {
    /// Namespace holding the fabric and the simulation resources.
    pub topology: String,

    /// Namespace the SimNode pods run in.
    pub core: String,
}

impl Default for NamespaceConfig {
    fn default() -> Self {
        Self {
            topology: "eda".to_string(),
            core: "eda-system".to_string(),
        }
    }
}

/// External tool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolConfig {
    /// Apply/delete tool binary.
    pub etc: String,

    /// Cluster CLI binary.
    pub kubectl: String,

    /// Upper bound for one tool invocation in seconds.
    pub command_timeout_secs: u64,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            etc: "etc".to_string(),
            kubectl: "kubectl".to_string(),
            command_timeout_secs: 300,
        }
    }
}

/// Readiness polling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadinessConfig {
    /// Per-node timeout in seconds.
    pub timeout_secs: u64,

    /// Poll interval in milliseconds.
    pub poll_interval_ms: u64,

    /// Nodes polled or configured at the same time.
    pub max_parallel: usize,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 180,
            poll_interval_ms: 2000,
            max_parallel: 4,
        }
    }
}

/// Interface configuration retry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigureConfig {
    /// How long a missing interface is retried, in seconds.
    pub retry_window_secs: u64,

    /// Delay between retries in milliseconds.
    pub retry_interval_ms: u64,
}

impl Default for ConfigureConfig {
    fn default() -> Self {
        Self {
            retry_window_secs: 180,
            retry_interval_ms: 2000,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    pub level: String,

    /// Log format (pretty, json, compact).
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl EdgesimConfig {
    /// Loads configuration from a file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Merges CLI arguments (and their environment fallbacks) into the configuration.
    pub fn merge_cli_args(&mut self, args: &CommonArgs, log_level: Option<&str>) {
        if let Some(ref ns) = args.topology_namespace {
            self.namespaces.topology = ns.clone();
        }
        if let Some(ref ns) = args.core_namespace {
            self.namespaces.core = ns.clone();
        }
        if let Some(level) = log_level {
            self.logging.level = level.to_string();
        }
        if args.debug {
            self.logging.level = "debug".to_string();
        }
    }

    /// Validates the configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!("Invalid log level: {}", self.logging.level);
        }

        let valid_formats = ["pretty", "json", "compact"];
        if !valid_formats.contains(&self.logging.format.to_lowercase().as_str()) {
            anyhow::bail!("Invalid log format: {}", self.logging.format);
        }

        if self.namespaces.topology.trim().is_empty() || self.namespaces.core.trim().is_empty() {
            anyhow::bail!("Namespaces must not be empty");
        }
        if self.tools.etc.trim().is_empty() || self.tools.kubectl.trim().is_empty() {
            anyhow::bail!("Tool binaries must not be empty");
        }

        let zero = [
            ("tools.command_timeout_secs", self.tools.command_timeout_secs),
            ("readiness.timeout_secs", self.readiness.timeout_secs),
            ("readiness.poll_interval_ms", self.readiness.poll_interval_ms),
            ("readiness.max_parallel", self.readiness.max_parallel as u64),
            ("configure.retry_interval_ms", self.configure.retry_interval_ms),
        ]
        .into_iter()
        .find(|(_, value)| *value == 0);
        if let Some((key, _)) = zero {
            anyhow::bail!("{key} must be greater than zero");
        }

        Ok(())
    }

    /// Settings for the subprocess backend.
    pub fn kubectl_config(&self) -> KubectlConfig {
        KubectlConfig::default()
            .with_kubectl(&self.tools.kubectl)
            .with_etc(&self.tools.etc)
            .with_timeout(Duration::from_secs(self.tools.command_timeout_secs))
    }

    /// Settings for the apply and remove orchestrators.
    pub fn orchestrator_config(&self, debug: bool) -> OrchestratorConfig {
        OrchestratorConfig::builder()
            .core_namespace(&self.namespaces.core)
            .readiness_timeout(Duration::from_secs(self.readiness.timeout_secs))
            .poll_interval(Duration::from_millis(self.readiness.poll_interval_ms))
            .max_parallel(self.readiness.max_parallel)
            .configure_window(Duration::from_secs(self.configure.retry_window_secs))
            .configure_interval(Duration::from_millis(self.configure.retry_interval_ms))
            .debug(debug)
            .build()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn args() -> CommonArgs {
        CommonArgs {
            spec: None,
            topology: None,
            topology_namespace: None,
            core_namespace: None,
            debug: false,
        }
    }

    #[test]
    fn test_default_config() {
        let config = EdgesimConfig::default();

        assert_eq!(config.namespaces.topology, "eda");
        assert_eq!(config.namespaces.core, "eda-system");
        assert_eq!(config.tools.etc, "etc");
        assert_eq!(config.readiness.timeout_secs, 180);
        assert_eq!(config.readiness.max_parallel, 4);
        assert_eq!(config.logging.level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = EdgesimConfig::default();

        config.logging.level = "invalid".to_string();
        assert!(config.validate().is_err());
        config.logging.level = "info".to_string();

        config.logging.format = "invalid".to_string();
        assert!(config.validate().is_err());
        config.logging.format = "json".to_string();
        assert!(config.validate().is_ok());

        config.readiness.max_parallel = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("readiness.max_parallel"));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"[namespaces]\ntopology = \"lab\"\n\n[readiness]\ntimeout_secs = 30\n")
            .unwrap();
        let config = EdgesimConfig::from_file(file.path()).unwrap();

        assert_eq!(config.namespaces.topology, "lab");
        assert_eq!(config.namespaces.core, "eda-system");
        assert_eq!(config.readiness.timeout_secs, 30);
        assert_eq!(config.readiness.poll_interval_ms, 2000);
    }

    #[test]
    fn test_cli_overrides_file() {
        let mut config = EdgesimConfig::default();
        config.namespaces.topology = "from-file".to_string();

        let mut cli = args();
        cli.topology_namespace = Some("from-cli".to_string());
        cli.debug = true;
        config.merge_cli_args(&cli, Some("warn"));

        assert_eq!(config.namespaces.topology, "from-cli");
        assert_eq!(config.namespaces.core, "eda-system");
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_orchestrator_config_conversion() {
        let mut config = EdgesimConfig::default();
        config.namespaces.core = "core".to_string();
        config.readiness.poll_interval_ms = 500;

        let orchestrator = config.orchestrator_config(true);
        assert_eq!(orchestrator.core_namespace, "core");
        assert_eq!(orchestrator.poll_interval, Duration::from_millis(500));
        assert_eq!(orchestrator.readiness_timeout, Duration::from_secs(180));
        assert!(orchestrator.debug);

        let kubectl = config.kubectl_config();
        assert_eq!(kubectl.etc, "etc");
        assert_eq!(kubectl.command_timeout, Duration::from_secs(300));
    }

    #[test]
    fn test_print_config_round_trips() {
        let text = toml::to_string_pretty(&EdgesimConfig::default()).unwrap();
        assert!(text.contains("[namespaces]"));
        let parsed: EdgesimConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.configure.retry_window_secs, 180);
    }
}
