//! Client session configuration.
//!
//! Mirrors the settings a notebook front end exposes: where the collab
//! gateway lives, the optional shared token, which kernel to use, and the
//! timing knobs for bootstrap and presence.

use std::path::PathBuf;

use thiserror::Error;

/// Default watchdog for the bootstrap snapshot fetch and the
/// connecting→fallback transition.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 2000;
/// Awareness heartbeat period.
pub const DEFAULT_HEARTBEAT_MS: u64 = 15_000;
/// Peers silent for longer than this are excluded from the peer count.
pub const DEFAULT_AWARENESS_STALE_MS: u64 = 60_000;
/// Auto-save cadence.
pub const DEFAULT_AUTOSAVE_MS: u64 = 30_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("collaboration is enabled but no server URL is configured")]
    MissingServerUrl,
    #[error("malformed server URL: {0}")]
    MalformedUrl(String),
}

/// Which execution backend the session talks to. Strict selection; there is
/// no automatic cross-fallback between the two.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KernelMode {
    #[default]
    Backend,
    Pyodide,
}

/// Everything a [`crate::session::NotebookSession`] needs to know.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Enable collaboration. Defaults to "configured iff a server URL is".
    pub collab_enabled: bool,
    /// Gateway base URL; ws/wss or http/https (normalized as needed).
    pub collab_server_url: Option<String>,
    /// Shared token appended as `token=` to websocket and snapshot URLs.
    pub collab_token: Option<String>,
    pub collab_connect_timeout_ms: u64,
    /// Kernel service base URL; absent means no backend kernel.
    pub backend_kernel_url: Option<String>,
    pub kernel_mode: KernelMode,
    /// External notebook blob store base URL; absent disables it.
    pub notebook_store_url: Option<String>,
    /// Directory for local notebook backups; absent disables them.
    pub backup_dir: Option<PathBuf>,
    /// Display name announced through awareness.
    pub user_name: String,
    pub heartbeat_interval_ms: u64,
    pub awareness_stale_ms: u64,
    pub autosave_interval_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            collab_enabled: false,
            collab_server_url: None,
            collab_token: None,
            collab_connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            backend_kernel_url: None,
            kernel_mode: KernelMode::default(),
            notebook_store_url: None,
            backup_dir: None,
            user_name: "anonymous".to_string(),
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_MS,
            awareness_stale_ms: DEFAULT_AWARENESS_STALE_MS,
            autosave_interval_ms: DEFAULT_AUTOSAVE_MS,
        }
    }
}

impl SessionConfig {
    /// Config for a collaborative session against `server_url`.
    pub fn collaborative(server_url: impl Into<String>) -> Self {
        Self {
            collab_enabled: true,
            collab_server_url: Some(server_url.into()),
            ..Self::default()
        }
    }

    /// Local-only config (no gateway).
    pub fn local_only() -> Self {
        Self::default()
    }

    /// Whether collaboration is effectively on.
    pub fn collab_active(&self) -> bool {
        self.collab_enabled
            && self
                .collab_server_url
                .as_deref()
                .map(|u| !u.is_empty())
                .unwrap_or(false)
    }

    fn server_base(&self) -> Result<&str, ConfigError> {
        let url = self
            .collab_server_url
            .as_deref()
            .filter(|u| !u.is_empty())
            .ok_or(ConfigError::MissingServerUrl)?;
        Ok(url.trim_end_matches('/'))
    }

    /// The websocket URL for `notebook_id`, with the token appended when
    /// configured. http/https schemes normalize to ws/wss.
    pub fn ws_url(&self, notebook_id: &str) -> Result<String, ConfigError> {
        let base = self.server_base()?;
        let base = normalize_scheme(base, "ws", "wss")?;
        let mut url = format!("{base}/ws/{notebook_id}");
        if let Some(token) = self.token() {
            url.push_str(&format!("?token={token}"));
        }
        Ok(url)
    }

    /// The HTTP snapshot URL for `notebook_id`. ws/wss schemes normalize to
    /// http/https.
    pub fn snapshot_url(&self, notebook_id: &str) -> Result<String, ConfigError> {
        let base = self.server_base()?;
        let base = normalize_scheme(base, "http", "https")?;
        let mut url = format!("{base}/{notebook_id}/snapshot");
        if let Some(token) = self.token() {
            url.push_str(&format!("?token={token}"));
        }
        Ok(url)
    }

    fn token(&self) -> Option<&str> {
        self.collab_token.as_deref().filter(|t| !t.is_empty())
    }
}

/// Rewrite a URL's scheme into the `plain`/`secure` pair, mapping both the
/// ws and http families onto it.
fn normalize_scheme(url: &str, plain: &str, secure: &str) -> Result<String, ConfigError> {
    let (scheme, rest) = url
        .split_once("://")
        .ok_or_else(|| ConfigError::MalformedUrl(url.to_string()))?;
    let scheme = match scheme {
        "ws" | "http" => plain,
        "wss" | "https" => secure,
        other => return Err(ConfigError::MalformedUrl(format!("scheme {other}"))),
    };
    Ok(format!("{scheme}://{rest}"))
}
