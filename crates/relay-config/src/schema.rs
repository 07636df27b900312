use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Root configuration — maps to `relay.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub agent: AgentConfig,
    pub pipeline: PipelineConfig,
    pub logging: LoggingConfig,
    pub trace: TraceConfig,
}

// ── Agent ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Agent identifier; also the root segment of every execution path.
    pub id: String,
    /// Model identifier handed to the prompt executor, e.g. "mock/echo".
    pub model: String,
    /// System prompt prepended to prompts built by the demo workflow.
    pub system_prompt: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            id: "relay-agent".into(),
            model: "mock/echo".into(),
            system_prompt: None,
        }
    }
}

// ── Pipeline ───────────────────────────────────────────────────

/// Default cap on concurrently initializing feature resources.
pub const DEFAULT_RESOURCE_INIT_CONCURRENCY: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Maximum feature resources initialized in parallel before a run.
    pub resource_init_concurrency: usize,
    /// Separator used when rendering execution paths in logs.
    pub path_separator: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            resource_init_concurrency: DEFAULT_RESOURCE_INIT_CONCURRENCY,
            path_separator: "/".into(),
        }
    }
}

// ── Logging ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
    /// Output format: "pretty", "json".
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "pretty".into(),
        }
    }
}

// ── Trace ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TraceConfig {
    /// Install the event tracer on agents built from this config.
    pub enabled: bool,
    /// Write every lifecycle event as a JSON line to this file.
    pub file: Option<PathBuf>,
}

// ── Validation ─────────────────────────────────────────────────

/// A single config validation issue.
#[derive(Debug)]
pub struct ConfigWarning {
    pub field: String,
    pub message: String,
    pub severity: WarningSeverity,
    pub hint: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarningSeverity {
    Error,
    Warning,
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self.severity {
            WarningSeverity::Error => "error",
            WarningSeverity::Warning => "warning",
        };
        write!(f, "{} {}: {}", label, self.field, self.message)?;
        if let Some(ref h) = self.hint {
            write!(f, " ({})", h)?;
        }
        Ok(())
    }
}

impl RelayConfig {
    /// Validate the config and return a list of warnings.
    /// Returns `Err` with all messages joined if any severity is Error.
    pub fn validate(&self) -> Result<Vec<ConfigWarning>, String> {
        let mut warnings = Vec::new();

        // ── Agent id ───
        if self.agent.id.trim().is_empty() {
            warnings.push(ConfigWarning {
                field: "agent.id".into(),
                message: "agent id is empty".into(),
                severity: WarningSeverity::Error,
                hint: Some("Set to e.g. 'relay-agent'".into()),
            });
        } else if self.agent.id.contains(&self.pipeline.path_separator) {
            warnings.push(ConfigWarning {
                field: "agent.id".into(),
                message: format!(
                    "agent id '{}' contains the path separator '{}'",
                    self.agent.id, self.pipeline.path_separator
                ),
                severity: WarningSeverity::Warning,
                hint: Some("Execution paths will be ambiguous".into()),
            });
        }

        // ── Agent model ───
        if self.agent.model.is_empty() {
            warnings.push(ConfigWarning {
                field: "agent.model".into(),
                message: "model is empty".into(),
                severity: WarningSeverity::Warning,
                hint: Some("Model-call events will report an empty model".into()),
            });
        }

        // ── Resource concurrency ───
        if self.pipeline.resource_init_concurrency == 0 {
            warnings.push(ConfigWarning {
                field: "pipeline.resource_init_concurrency".into(),
                message: "concurrency is 0 — no feature resource could ever initialize".into(),
                severity: WarningSeverity::Error,
                hint: Some(format!("Default is {}", DEFAULT_RESOURCE_INIT_CONCURRENCY)),
            });
        }

        // ── Path separator ───
        if self.pipeline.path_separator.is_empty() {
            warnings.push(ConfigWarning {
                field: "pipeline.path_separator".into(),
                message: "path separator is empty".into(),
                severity: WarningSeverity::Error,
                hint: Some("Use '/'".into()),
            });
        }

        // ── Logging format ───
        let valid_formats = ["pretty", "json"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            warnings.push(ConfigWarning {
                field: "logging.format".into(),
                message: format!("unknown log format '{}'", self.logging.format),
                severity: WarningSeverity::Warning,
                hint: Some(format!("Valid values: {}", valid_formats.join(", "))),
            });
        }

        // ── Logging level ───
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            warnings.push(ConfigWarning {
                field: "logging.level".into(),
                message: format!("unknown log level '{}'", self.logging.level),
                severity: WarningSeverity::Warning,
                hint: Some(format!("Valid values: {}", valid_levels.join(", "))),
            });
        }

        // ── Trace file ───
        if self.trace.file.is_some() && !self.trace.enabled {
            warnings.push(ConfigWarning {
                field: "trace.file".into(),
                message: "trace file is set but tracing is disabled".into(),
                severity: WarningSeverity::Warning,
                hint: Some("Set trace.enabled = true".into()),
            });
        }

        // Check for hard errors
        let errors: Vec<String> = warnings
            .iter()
            .filter(|w| w.severity == WarningSeverity::Error)
            .map(|w| format!("{}: {}", w.field, w.message))
            .collect();

        if !errors.is_empty() {
            return Err(format!("Configuration errors:\n  • {}", errors.join("\n  • ")));
        }

        Ok(warnings)
    }
}
