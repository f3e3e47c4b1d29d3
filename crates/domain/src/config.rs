//! Launch configuration.
//!
//! Resolved exactly once at boot from three layers, highest precedence
//! first: environment variables, the persisted `daemon-settings.json`,
//! built-in defaults. The resolved value is immutable for the lifetime of
//! the process.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Security policy
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Inferred from `(host, token)` unless explicitly overridden.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityPolicy {
    /// Loopback bind with a token configured.
    Strict,
    /// Token present or loopback bind, but not both.
    Balanced,
    /// Non-loopback bind without a token. Refused at boot unless the
    /// operator sets `UNDOABLE_ALLOW_INSECURE_BIND_OPEN=1`.
    Permissive,
}

impl SecurityPolicy {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "strict" => Some(Self::Strict),
            "balanced" => Some(Self::Balanced),
            "permissive" => Some(Self::Permissive),
            _ => None,
        }
    }
}

/// Infer the effective policy from the bind host and token presence.
pub fn infer_security_policy(host: &str, has_token: bool) -> SecurityPolicy {
    let loopback = is_loopback_host(host);
    match (loopback, has_token) {
        (true, true) => SecurityPolicy::Strict,
        (false, false) => SecurityPolicy::Permissive,
        _ => SecurityPolicy::Balanced,
    }
}

fn is_loopback_host(host: &str) -> bool {
    if host == "localhost" {
        return true;
    }
    host.parse::<IpAddr>().map_or(false, |ip| ip.is_loopback())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Approval mode
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Which tool categories are gated behind human approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalMode {
    /// No approvals.
    Off,
    /// Gate mutate/exec/network tools.
    Mutate,
    /// Gate every non-read tool.
    Always,
}

impl ApprovalMode {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "off" => Some(Self::Off),
            "mutate" => Some(Self::Mutate),
            "always" => Some(Self::Always),
            _ => None,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stored settings
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The on-disk shape of `daemon-settings.json`. Every field optional —
/// absent fields fall through to defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoredSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval_mode: Option<ApprovalMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub security_policy: Option<SecurityPolicy>,
}

impl StoredSettings {
    /// Load from a JSON file. A missing file is an empty settings object;
    /// a corrupt file is logged and treated the same (degraded mode).
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "corrupt settings file, using defaults");
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }

    /// Persist atomically (write to temp, then rename).
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Launch config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 7433;
pub const DEFAULT_MAX_ITERATIONS: u32 = 25;

/// The fully resolved process configuration.
#[derive(Debug, Clone)]
pub struct LaunchConfig {
    pub host: String,
    pub port: u16,
    /// Bearer token gating every HTTP request. `None` = open (dev) mode.
    pub token: Option<String>,
    pub data_dir: PathBuf,
    pub max_iterations: u32,
    pub approval_mode: ApprovalMode,
    pub security_policy: SecurityPolicy,
    /// Override path for the exec registry snapshot.
    pub exec_state_file: Option<PathBuf>,
    /// Override path for the run state directory.
    pub run_state_file: Option<PathBuf>,
    pub allow_insecure_bind_open: bool,
}

impl LaunchConfig {
    /// Resolve from real process environment + the settings file named by
    /// `UNDOABLE_DAEMON_SETTINGS_FILE` (or `<data_dir>/daemon-settings.json`).
    pub fn from_env() -> Result<Self> {
        let vars: HashMap<String, String> = std::env::vars().collect();
        Self::resolve(&vars)
    }

    /// Resolve from an explicit variable map (testable entry point).
    pub fn resolve(vars: &HashMap<String, String>) -> Result<Self> {
        let get = |k: &str| vars.get(k).filter(|v| !v.is_empty()).cloned();

        let data_dir = get("UNDOABLE_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(default_data_dir);

        let settings_path = get("UNDOABLE_DAEMON_SETTINGS_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("daemon-settings.json"));
        let stored = StoredSettings::load(&settings_path);

        let host = get("UNDOABLE_DAEMON_HOST")
            .or_else(|| get("NRN_HOST"))
            .or(stored.host)
            .unwrap_or_else(|| DEFAULT_HOST.to_owned());

        let port = match get("UNDOABLE_DAEMON_PORT").or_else(|| get("NRN_PORT")) {
            Some(raw) => raw
                .parse::<u16>()
                .map_err(|_| Error::Validation(format!("invalid port '{raw}'")))?,
            None => stored.port.unwrap_or(DEFAULT_PORT),
        };

        let token = get("UNDOABLE_TOKEN").or(stored.token);

        let max_iterations = match get("UNDOABLE_MAX_ITERATIONS") {
            Some(raw) => raw
                .parse::<u32>()
                .map_err(|_| Error::Validation(format!("invalid max iterations '{raw}'")))?,
            None => stored.max_iterations.unwrap_or(DEFAULT_MAX_ITERATIONS),
        };

        let skip_permissions = get("UNDOABLE_DANGEROUSLY_SKIP_PERMISSIONS")
            .map_or(false, |v| is_truthy(&v));
        let approval_mode = if skip_permissions {
            ApprovalMode::Off
        } else {
            match get("UNDOABLE_RUN_MODE") {
                Some(raw) => ApprovalMode::parse(&raw)
                    .ok_or_else(|| Error::Validation(format!("invalid run mode '{raw}'")))?,
                None => stored.approval_mode.unwrap_or(ApprovalMode::Mutate),
            }
        };

        let security_policy = match get("UNDOABLE_SECURITY_POLICY") {
            Some(raw) => SecurityPolicy::parse(&raw)
                .ok_or_else(|| Error::Validation(format!("invalid security policy '{raw}'")))?,
            None => stored
                .security_policy
                .unwrap_or_else(|| infer_security_policy(&host, token.is_some())),
        };

        let allow_insecure_bind_open = get("UNDOABLE_ALLOW_INSECURE_BIND_OPEN")
            .map_or(false, |v| is_truthy(&v));

        Ok(Self {
            host,
            port,
            token,
            data_dir,
            max_iterations,
            approval_mode,
            security_policy,
            exec_state_file: get("UNDOABLE_EXEC_STATE_FILE").map(PathBuf::from),
            run_state_file: get("UNDOABLE_RUN_STATE_FILE").map(PathBuf::from),
            allow_insecure_bind_open,
        })
    }

    /// Refuse to serve on a non-loopback bind without a token, unless the
    /// operator explicitly opted out.
    pub fn check_bind_policy(&self) -> Result<()> {
        if self.security_policy == SecurityPolicy::Permissive && !self.allow_insecure_bind_open {
            return Err(Error::Auth(format!(
                "refusing to bind {}:{} without a token; set UNDOABLE_TOKEN \
                 or UNDOABLE_ALLOW_INSECURE_BIND_OPEN=1 to override",
                self.host, self.port
            )));
        }
        Ok(())
    }

    /// Path of the exec registry snapshot.
    pub fn exec_state_path(&self) -> PathBuf {
        self.exec_state_file
            .clone()
            .unwrap_or_else(|| self.data_dir.join("exec-sessions.json"))
    }

    /// Directory holding per-run JSONL logs.
    pub fn runs_dir(&self) -> PathBuf {
        self.run_state_file
            .clone()
            .unwrap_or_else(|| self.data_dir.join("runs"))
    }
}

fn default_data_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".undoable")
}

fn is_truthy(v: &str) -> bool {
    matches!(v, "1" | "true" | "yes")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_without_env() {
        let cfg = LaunchConfig::resolve(&vars(&[("UNDOABLE_DATA_DIR", "/tmp/ud-test-none")])).unwrap();
        assert_eq!(cfg.host, DEFAULT_HOST);
        assert_eq!(cfg.port, DEFAULT_PORT);
        assert!(cfg.token.is_none());
        assert_eq!(cfg.max_iterations, DEFAULT_MAX_ITERATIONS);
        assert_eq!(cfg.approval_mode, ApprovalMode::Mutate);
    }

    #[test]
    fn env_beats_stored_settings() {
        let dir = tempfile::tempdir().unwrap();
        let settings_path = dir.path().join("daemon-settings.json");
        StoredSettings {
            host: Some("0.0.0.0".into()),
            port: Some(9000),
            ..Default::default()
        }
        .save(&settings_path)
        .unwrap();

        let cfg = LaunchConfig::resolve(&vars(&[
            ("UNDOABLE_DAEMON_SETTINGS_FILE", settings_path.to_str().unwrap()),
            ("UNDOABLE_DAEMON_HOST", "127.0.0.1"),
        ]))
        .unwrap();
        assert_eq!(cfg.host, "127.0.0.1"); // env wins
        assert_eq!(cfg.port, 9000); // stored wins over default
    }

    #[test]
    fn nrn_aliases_accepted() {
        let cfg = LaunchConfig::resolve(&vars(&[
            ("UNDOABLE_DATA_DIR", "/tmp/ud-test-nrn"),
            ("NRN_HOST", "10.0.0.5"),
            ("NRN_PORT", "8123"),
            ("UNDOABLE_TOKEN", "tok"),
        ]))
        .unwrap();
        assert_eq!(cfg.host, "10.0.0.5");
        assert_eq!(cfg.port, 8123);
    }

    #[test]
    fn invalid_port_is_validation_error() {
        let err = LaunchConfig::resolve(&vars(&[("UNDOABLE_DAEMON_PORT", "not-a-port")]))
            .unwrap_err();
        assert_eq!(err.code(), "Validation");
    }

    #[test]
    fn policy_inference() {
        assert_eq!(infer_security_policy("127.0.0.1", true), SecurityPolicy::Strict);
        assert_eq!(infer_security_policy("localhost", true), SecurityPolicy::Strict);
        assert_eq!(infer_security_policy("0.0.0.0", false), SecurityPolicy::Permissive);
        assert_eq!(infer_security_policy("127.0.0.1", false), SecurityPolicy::Balanced);
        assert_eq!(infer_security_policy("0.0.0.0", true), SecurityPolicy::Balanced);
    }

    #[test]
    fn open_bind_without_token_refused() {
        let cfg = LaunchConfig::resolve(&vars(&[
            ("UNDOABLE_DATA_DIR", "/tmp/ud-test-bind"),
            ("UNDOABLE_DAEMON_HOST", "0.0.0.0"),
        ]))
        .unwrap();
        assert!(cfg.check_bind_policy().is_err());

        let cfg = LaunchConfig::resolve(&vars(&[
            ("UNDOABLE_DATA_DIR", "/tmp/ud-test-bind"),
            ("UNDOABLE_DAEMON_HOST", "0.0.0.0"),
            ("UNDOABLE_ALLOW_INSECURE_BIND_OPEN", "1"),
        ]))
        .unwrap();
        assert!(cfg.check_bind_policy().is_ok());
    }

    #[test]
    fn skip_permissions_forces_approval_off() {
        let cfg = LaunchConfig::resolve(&vars(&[
            ("UNDOABLE_DATA_DIR", "/tmp/ud-test-skip"),
            ("UNDOABLE_RUN_MODE", "always"),
            ("UNDOABLE_DANGEROUSLY_SKIP_PERMISSIONS", "true"),
        ]))
        .unwrap();
        assert_eq!(cfg.approval_mode, ApprovalMode::Off);
    }

    #[test]
    fn corrupt_settings_file_degrades_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon-settings.json");
        std::fs::write(&path, "{not json").unwrap();
        let settings = StoredSettings::load(&path);
        assert!(settings.host.is_none());
    }

    #[test]
    fn settings_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon-settings.json");
        let s = StoredSettings {
            token: Some("secret".into()),
            max_iterations: Some(10),
            ..Default::default()
        };
        s.save(&path).unwrap();
        let back = StoredSettings::load(&path);
        assert_eq!(back.token.as_deref(), Some("secret"));
        assert_eq!(back.max_iterations, Some(10));
    }
}
