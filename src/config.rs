use anyhow::Result;
use serde::Deserialize;
use std::path::PathBuf;

/// Runtime configuration for the client core.
///
/// Deliberately not persisted anywhere; the host owns configuration storage
/// and hands a filled-in struct over (the `Deserialize` derive lets it live
/// inside a larger host config).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Application id passed to the daemon as `ANYTALK_APP_ID`.
    pub app_id: String,

    /// Access token passed to the daemon as `ANYTALK_ACCESS_TOKEN`.
    pub access_token: String,

    /// Daemon executable. Falls back to `anytalk-daemon` on `PATH`.
    pub daemon_path: Option<PathBuf>,

    /// When set, the daemon is managed externally and never spawned here.
    pub developer_mode: bool,

    /// Override for the daemon socket; normally resolved from the
    /// environment (see [`crate::socket_path`]).
    pub socket_path: Option<PathBuf>,
}

impl ClientConfig {
    /// Build a config from `ANYTALK_*` environment variables.
    pub fn from_env() -> Self {
        Self {
            app_id: std::env::var("ANYTALK_APP_ID").unwrap_or_default(),
            access_token: std::env::var("ANYTALK_ACCESS_TOKEN").unwrap_or_default(),
            daemon_path: std::env::var_os("ANYTALK_DAEMON_PATH").map(PathBuf::from),
            developer_mode: std::env::var("ANYTALK_DEVELOPER_MODE")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            socket_path: std::env::var_os("ANYTALK_SOCKET_PATH").map(PathBuf::from),
        }
    }

    /// Validate the configuration.
    ///
    /// Credentials are only required when we are the one spawning the
    /// daemon; in developer mode the external daemon brings its own.
    pub fn validate(&self) -> Result<()> {
        if !self.developer_mode {
            if self.app_id.is_empty() {
                return Err(anyhow::anyhow!("app_id cannot be empty"));
            }
            if self.access_token.is_empty() {
                return Err(anyhow::anyhow!("access_token cannot be empty"));
            }
        }
        Ok(())
    }
}
