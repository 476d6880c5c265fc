use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::policy::{AutoApprovePolicy, PermissionType};

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

fn env_parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_opt(key).and_then(|v| v.parse().ok())
}

// ── Top-level config ──────────────────────────────────────────

/// Everything the runtime reads from its configuration collaborator.
///
/// Parsed from TOML, then `SWITCHYARD_*` environment overrides are applied
/// and the result is validated.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub runtime: RuntimeSettings,

    #[serde(default)]
    pub mirror: MirrorSettings,

    /// Tool providers keyed by provider name.
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderConfig>,

    /// Rate limits keyed by model-provider id.
    #[serde(default)]
    pub rate_limits: BTreeMap<String, RateLimitConfig>,
}

impl RuntimeConfig {
    /// Parse config from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let mut config: Self = toml::from_str(toml_str)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    /// Apply environment variable overrides.
    ///
    /// - `SWITCHYARD_MAX_CONCURRENT_STREAMS` -> `runtime.max_concurrent_streams`
    /// - `SWITCHYARD_MAX_TOOL_CALLS` -> `runtime.max_tool_calls`
    /// - `SWITCHYARD_MIRROR_TIMEOUT_MS` -> `mirror.probe_timeout_ms`
    /// - `SWITCHYARD_FALLBACK_REGISTRY` -> `mirror.fallback`
    pub fn apply_env_overrides(&mut self) {
        if let Some(v) = env_parsed("SWITCHYARD_MAX_CONCURRENT_STREAMS") {
            self.runtime.max_concurrent_streams = v;
        }
        if let Some(v) = env_parsed("SWITCHYARD_MAX_TOOL_CALLS") {
            self.runtime.max_tool_calls = v;
        }
        if let Some(v) = env_parsed("SWITCHYARD_MIRROR_TIMEOUT_MS") {
            self.mirror.probe_timeout_ms = v;
        }
        if let Some(v) = env_opt("SWITCHYARD_FALLBACK_REGISTRY") {
            self.mirror.fallback = v;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.runtime.max_concurrent_streams == 0 {
            return Err(ConfigError::Invalid(
                "runtime.max_concurrent_streams must be at least 1".into(),
            ));
        }
        if self.runtime.max_tool_calls == 0 {
            return Err(ConfigError::Invalid(
                "runtime.max_tool_calls must be at least 1".into(),
            ));
        }
        for (name, provider) in &self.providers {
            if name.trim().is_empty() {
                return Err(ConfigError::Invalid("provider name must not be empty".into()));
            }
            provider.transport.validate(name)?;
        }
        for (name, limit) in &self.rate_limits {
            limit.validate(name)?;
        }
        Ok(())
    }

    /// Print a redacted summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded:");
        tracing::info!(
            "  runtime:     max_concurrent_streams={}, max_tool_calls={}",
            self.runtime.max_concurrent_streams,
            self.runtime.max_tool_calls
        );
        tracing::info!(
            "  mirror:      candidates={}, timeout={}ms",
            self.mirror.candidates.len(),
            self.mirror.probe_timeout_ms
        );
        for (name, provider) in &self.providers {
            tracing::info!(
                "  provider:    {} ({}, enabled={}, auto_approve={:?})",
                name,
                provider.transport.kind(),
                provider.enabled,
                provider.auto_approve
            );
        }
        for (name, limit) in &self.rate_limits {
            tracing::info!(
                "  rate_limit:  {} (enabled={}, qps={})",
                name,
                limit.enabled,
                limit.qps
            );
        }
    }
}

// ── Runtime limits ────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeSettings {
    #[serde(default = "default_max_concurrent_streams")]
    pub max_concurrent_streams: usize,

    /// Hard cap on executed tool calls per turn.
    #[serde(default = "default_max_tool_calls")]
    pub max_tool_calls: usize,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

fn default_max_concurrent_streams() -> usize {
    10
}

fn default_max_tool_calls() -> usize {
    50
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_temperature() -> f32 {
    0.7
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            max_concurrent_streams: default_max_concurrent_streams(),
            max_tool_calls: default_max_tool_calls(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
        }
    }
}

// ── Package mirror selection ──────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorSettings {
    /// Candidate registry base URLs probed in parallel.
    #[serde(default = "default_mirror_candidates")]
    pub candidates: Vec<String>,

    /// Path appended to each candidate for the latency probe.
    #[serde(default = "default_probe_path")]
    pub probe_path: String,

    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    /// How long a selected mirror stays valid.
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,

    /// Used when every probe fails.
    #[serde(default = "default_fallback_registry")]
    pub fallback: String,
}

fn default_mirror_candidates() -> Vec<String> {
    vec![
        "https://registry.npmjs.org".into(),
        "https://registry.npmmirror.com".into(),
        "https://mirrors.cloud.tencent.com/npm".into(),
    ]
}

fn default_probe_path() -> String {
    "/tiny-tarball".into()
}

fn default_probe_timeout_ms() -> u64 {
    3_000
}

fn default_cache_ttl_secs() -> u64 {
    24 * 60 * 60
}

fn default_fallback_registry() -> String {
    "https://registry.npmjs.org".into()
}

impl MirrorSettings {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

impl Default for MirrorSettings {
    fn default() -> Self {
        Self {
            candidates: default_mirror_candidates(),
            probe_path: default_probe_path(),
            probe_timeout_ms: default_probe_timeout_ms(),
            cache_ttl_secs: default_cache_ttl_secs(),
            fallback: default_fallback_registry(),
        }
    }
}

// ── Tool providers ────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub transport: TransportParams,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub auto_approve: Vec<PermissionType>,
}

fn default_enabled() -> bool {
    true
}

impl ProviderConfig {
    pub fn new(transport: TransportParams) -> Self {
        Self {
            transport,
            enabled: true,
            description: None,
            auto_approve: Vec::new(),
        }
    }

    pub fn with_auto_approve(mut self, types: &[PermissionType]) -> Self {
        self.auto_approve = types.to_vec();
        self
    }

    pub fn policy(&self) -> AutoApprovePolicy {
        self.auto_approve.iter().copied().collect()
    }

    /// Record a remembered grant. Granting `all` replaces `read` and `write`.
    pub fn grant(&mut self, permission: PermissionType) {
        let mut policy = self.policy();
        policy.grant(permission);
        self.auto_approve = policy.types().collect();
    }
}

/// How to reach a tool provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportParams {
    /// Child process speaking newline-delimited JSON-RPC over stdin/stdout.
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: BTreeMap<String, String>,
        #[serde(default)]
        cwd: Option<PathBuf>,
    },
    /// Legacy server-sent-events binding (GET stream + POST endpoint).
    Sse {
        url: String,
        #[serde(default)]
        headers: BTreeMap<String, String>,
    },
    /// Streamable HTTP binding with session continuation headers.
    Http {
        url: String,
        #[serde(default)]
        headers: BTreeMap<String, String>,
    },
    /// Built-in provider served from inside this process.
    InProcess { builtin: String },
}

impl TransportParams {
    pub fn kind(&self) -> TransportKind {
        match self {
            TransportParams::Stdio { .. } => TransportKind::Stdio,
            TransportParams::Sse { .. } => TransportKind::Sse,
            TransportParams::Http { .. } => TransportKind::Http,
            TransportParams::InProcess { .. } => TransportKind::InProcess,
        }
    }

    pub fn validate(&self, provider: &str) -> Result<(), ConfigError> {
        match self {
            TransportParams::Stdio { command, .. } if command.trim().is_empty() => Err(
                ConfigError::Invalid(format!("providers.{provider}: stdio command is empty")),
            ),
            TransportParams::Sse { url, .. } | TransportParams::Http { url, .. }
                if !(url.starts_with("http://") || url.starts_with("https://")) =>
            {
                Err(ConfigError::Invalid(format!(
                    "providers.{provider}: url must be http(s), got '{url}'"
                )))
            }
            TransportParams::InProcess { builtin } if builtin.trim().is_empty() => Err(
                ConfigError::Invalid(format!("providers.{provider}: builtin name is empty")),
            ),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Stdio,
    Sse,
    Http,
    InProcess,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransportKind::Stdio => "stdio",
            TransportKind::Sse => "sse",
            TransportKind::Http => "http",
            TransportKind::InProcess => "in_process",
        };
        f.write_str(s)
    }
}

// ── Rate limits ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Requests per second; granted requests are spaced by `1000 / qps` ms.
    #[serde(default = "default_qps")]
    pub qps: f64,
}

fn default_qps() -> f64 {
    1.0
}

/// Slowest pacing accepted: one request a day.
pub const MIN_QPS: f64 = 1.0 / 86_400.0;

impl RateLimitConfig {
    /// Spacing between granted requests; `None` when requests are not paced.
    pub fn interval(&self) -> Option<Duration> {
        if !self.enabled {
            return None;
        }
        Duration::try_from_secs_f64(1.0 / self.qps).ok()
    }

    pub fn validate(&self, name: &str) -> Result<(), ConfigError> {
        if self.enabled && !(self.qps.is_finite() && self.qps >= MIN_QPS) {
            return Err(ConfigError::Invalid(format!(
                "rate_limits.{name}.qps must be a finite value of at least {MIN_QPS} when enabled, got {}",
                self.qps
            )));
        }
        Ok(())
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            qps: default_qps(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_minimal_toml() {
        let cfg = RuntimeConfig::from_toml("").unwrap();
        assert_eq!(cfg.runtime.max_concurrent_streams, 10);
        assert_eq!(cfg.runtime.max_tool_calls, 50);
        assert!(cfg.providers.is_empty());
        assert_eq!(cfg.mirror.candidates.len(), 3);
    }

    #[test]
    fn parse_full_toml() {
        let toml = r#"
[runtime]
max_concurrent_streams = 4
max_tool_calls = 20

[providers.fs]
description = "Local filesystem"
auto_approve = ["read"]
transport = { kind = "stdio", command = "npx", args = ["-y", "@scope/fs-server"] }

[providers.web]
enabled = false
transport = { kind = "http", url = "https://tools.example.com/mcp", headers = { Authorization = "Bearer x" } }

[providers.legacy]
transport = { kind = "sse", url = "http://localhost:9000/sse" }

[providers.builtin]
auto_approve = ["all"]
transport = { kind = "in_process", builtin = "artifacts" }

[rate_limits.openai]
enabled = true
qps = 2.0
"#;
        let cfg = RuntimeConfig::from_toml(toml).unwrap();
        assert_eq!(cfg.runtime.max_concurrent_streams, 4);
        assert_eq!(cfg.providers.len(), 4);

        let fs = &cfg.providers["fs"];
        assert!(fs.enabled);
        assert_eq!(fs.transport.kind(), TransportKind::Stdio);
        assert!(fs.policy().allows(PermissionType::Read));
        assert!(!fs.policy().allows(PermissionType::Write));

        assert!(!cfg.providers["web"].enabled);
        assert_eq!(cfg.providers["legacy"].transport.kind(), TransportKind::Sse);
        assert!(cfg.providers["builtin"].policy().allows(PermissionType::Write));

        let openai = cfg.rate_limits["openai"];
        assert!(openai.enabled);
        assert_eq!(openai.qps, 2.0);
    }

    #[test]
    fn rejects_empty_stdio_command() {
        let toml = r#"
[providers.broken]
transport = { kind = "stdio", command = "" }
"#;
        assert!(matches!(
            RuntimeConfig::from_toml(toml),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn rejects_non_http_url() {
        let toml = r#"
[providers.remote]
transport = { kind = "http", url = "ftp://example.com" }
"#;
        assert!(RuntimeConfig::from_toml(toml).is_err());
    }

    #[test]
    fn rejects_enabled_rate_limit_without_qps() {
        let toml = r#"
[rate_limits.anthropic]
enabled = true
qps = 0.0
"#;
        assert!(RuntimeConfig::from_toml(toml).is_err());
    }

    #[test]
    fn rejects_rate_limits_too_slow_to_schedule() {
        let tiny = RateLimitConfig {
            enabled: true,
            qps: 1e-30,
        };
        assert!(matches!(tiny.validate("slow"), Err(ConfigError::Invalid(_))));
        let unbounded = RateLimitConfig {
            enabled: true,
            qps: f64::INFINITY,
        };
        assert!(unbounded.validate("fast").is_err());
        let off = RateLimitConfig {
            enabled: false,
            qps: 0.0,
        };
        assert!(off.validate("off").is_ok());
        assert_eq!(off.interval(), None);
        assert_eq!(
            RateLimitConfig { enabled: true, qps: 4.0 }.interval(),
            Some(Duration::from_millis(250))
        );
    }

    #[test]
    fn remembered_all_grant_replaces_narrow_types() {
        let mut provider = ProviderConfig::new(TransportParams::InProcess {
            builtin: "fs".to_string(),
        })
        .with_auto_approve(&[PermissionType::Read]);
        provider.grant(PermissionType::Write);
        assert_eq!(provider.auto_approve, vec![PermissionType::Read, PermissionType::Write]);
        provider.grant(PermissionType::All);
        assert_eq!(provider.auto_approve, vec![PermissionType::All]);
    }

    #[test]
    fn unknown_transport_kind_is_parse_error() {
        let toml = r#"
[providers.x]
transport = { kind = "carrier-pigeon" }
"#;
        assert!(matches!(
            RuntimeConfig::from_toml(toml),
            Err(ConfigError::Parse(_))
        ));
    }
}
