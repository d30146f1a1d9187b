use crate::config::ClientConfig;

use anyhow::{Context, Result};
use std::time::Duration;
use tokio::process::{Child, Command};

const DEFAULT_DAEMON_PATH: &str = "anytalk-daemon";
const DEFAULT_RESOURCE_ID: &str = "volc.seedasr.sauc.duration";

/// Polls after SIGTERM before escalating to SIGKILL.
const GRACEFUL_POLLS: u32 = 10;
const GRACEFUL_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Spawns and terminates the anytalk daemon process.
///
/// Holding the `Child` keeps liveness checks and reaping safe against pid
/// reuse; only the graceful SIGTERM is addressed by raw pid, which leaves the
/// same small reuse window the original had between probe and signal.
pub struct DaemonSupervisor {
    child: Option<Child>,
}

impl DaemonSupervisor {
    pub fn new() -> Self {
        Self { child: None }
    }

    /// Spawn the daemon unless developer mode is on or one is already alive.
    ///
    /// Credentials are injected into the child environment only. The child
    /// receives SIGTERM if this process dies, so it cannot outlive us. A
    /// spawn or exec failure is reported here once; there is no automatic
    /// retry, a later `start` call may try again.
    pub fn start(&mut self, config: &ClientConfig) -> Result<()> {
        if config.developer_mode {
            tracing::info!("developer mode enabled, skipping daemon auto-start");
            return Ok(());
        }
        if self.is_running() {
            tracing::info!("daemon already running with pid {:?}", self.pid());
            return Ok(());
        }

        let path = config
            .daemon_path
            .clone()
            .unwrap_or_else(|| DEFAULT_DAEMON_PATH.into());

        let mut cmd = Command::new(&path);
        cmd.env("ANYTALK_APP_ID", &config.app_id)
            .env("ANYTALK_ACCESS_TOKEN", &config.access_token);
        // Defaults never override values already present in our environment,
        // which the child inherits.
        if std::env::var_os("ANYTALK_RESOURCE_ID").is_none() {
            cmd.env("ANYTALK_RESOURCE_ID", DEFAULT_RESOURCE_ID);
        }
        if std::env::var_os("RUST_LOG").is_none() {
            cmd.env("RUST_LOG", "info");
        }

        #[cfg(target_os = "linux")]
        unsafe {
            // PDEATHSIG is per-thread, but the runtime only tears its worker
            // threads down at shutdown, which is when we want the daemon gone
            // anyway.
            cmd.pre_exec(|| {
                if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM as libc::c_ulong) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn daemon at {path:?}"))?;
        tracing::info!("started anytalk daemon with pid {:?}", child.id());
        self.child = Some(child);
        Ok(())
    }

    /// Terminate the tracked daemon, gracefully first.
    ///
    /// SIGTERM, then liveness polls up to the escalation window, then SIGKILL
    /// and a blocking reap. No-op when nothing is tracked. The tracked child
    /// is cleared on every path.
    pub async fn stop(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        if matches!(child.try_wait(), Ok(Some(_))) {
            return;
        }

        if let Some(pid) = child.id() {
            tracing::info!("stopping daemon with pid {pid}");
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
            for _ in 0..GRACEFUL_POLLS {
                if matches!(child.try_wait(), Ok(Some(_))) {
                    tracing::info!("daemon terminated gracefully");
                    return;
                }
                tokio::time::sleep(GRACEFUL_POLL_INTERVAL).await;
            }

            tracing::warn!("daemon ignored SIGTERM, force killing");
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
    }

    /// Liveness probe against the tracked daemon. False when none is tracked.
    pub fn is_running(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(|c| c.id())
    }
}

impl Default for DaemonSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;
    use std::time::Instant;

    fn write_script(dir: &tempfile::TempDir, name: &str, body: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, body).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn config_for(path: PathBuf) -> ClientConfig {
        ClientConfig {
            daemon_path: Some(path),
            ..ClientConfig::default()
        }
    }

    #[tokio::test]
    async fn stop_without_start_returns_immediately() {
        let mut sup = DaemonSupervisor::new();
        let started = Instant::now();
        sup.stop().await;
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn developer_mode_skips_spawn() {
        let mut sup = DaemonSupervisor::new();
        let config = ClientConfig {
            developer_mode: true,
            ..ClientConfig::default()
        };
        sup.start(&config).unwrap();
        assert!(!sup.is_running());
        assert_eq!(sup.pid(), None);
    }

    #[tokio::test]
    async fn spawn_failure_is_reported_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut sup = DaemonSupervisor::new();
        let config = config_for(dir.path().join("no-such-daemon"));
        assert!(sup.start(&config).is_err());
        assert!(!sup.is_running());
    }

    #[tokio::test]
    async fn credentials_are_injected_into_the_child_only() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("env-dump");
        let script = write_script(
            &dir,
            "dump-env.sh",
            &format!("#!/bin/sh\nenv > {}\nexec sleep 30\n", out.display()),
        );
        let mut sup = DaemonSupervisor::new();
        let config = ClientConfig {
            app_id: "dump-app".into(),
            access_token: "dump-token".into(),
            daemon_path: Some(script),
            ..ClientConfig::default()
        };
        sup.start(&config).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        let mut env_dump = String::new();
        while Instant::now() < deadline {
            env_dump = std::fs::read_to_string(&out).unwrap_or_default();
            if env_dump.contains("ANYTALK_ACCESS_TOKEN=") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert!(env_dump.contains("ANYTALK_APP_ID=dump-app"), "{env_dump}");
        assert!(env_dump.contains("ANYTALK_ACCESS_TOKEN=dump-token"));
        assert!(env_dump.contains("RUST_LOG="));
        // The resource-id default applies only when the parent does not
        // already carry one; either way the child must see a value.
        match std::env::var("ANYTALK_RESOURCE_ID") {
            Ok(inherited) => {
                assert!(env_dump.contains(&format!("ANYTALK_RESOURCE_ID={inherited}")))
            }
            Err(_) => {
                assert!(env_dump.contains(&format!("ANYTALK_RESOURCE_ID={DEFAULT_RESOURCE_ID}")))
            }
        }

        // Injection goes one way; our own environment is untouched.
        assert_ne!(
            std::env::var("ANYTALK_APP_ID").ok().as_deref(),
            Some("dump-app")
        );
        assert_ne!(
            std::env::var("ANYTALK_ACCESS_TOKEN").ok().as_deref(),
            Some("dump-token")
        );

        sup.stop().await;
    }

    #[tokio::test]
    async fn graceful_termination() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(&dir, "daemon.sh", "#!/bin/sh\nexec sleep 30\n");
        let mut sup = DaemonSupervisor::new();
        sup.start(&config_for(script)).unwrap();
        assert!(sup.is_running());
        let pid = sup.pid();
        assert!(pid.is_some());

        // A second start while alive is a no-op.
        sup.start(&config_for(dir.path().join("unused"))).unwrap();
        assert_eq!(sup.pid(), pid);

        let started = Instant::now();
        sup.stop().await;
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(!sup.is_running());
        assert_eq!(sup.pid(), None);

        // Idempotent.
        sup.stop().await;
    }

    #[tokio::test]
    async fn escalates_to_sigkill() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(&dir, "stubborn.sh", "#!/bin/sh\ntrap '' TERM\nsleep 30 &\nwait\n");
        let mut sup = DaemonSupervisor::new();
        sup.start(&config_for(script)).unwrap();
        // Give the shell a moment to install its trap.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(sup.is_running());

        let started = Instant::now();
        sup.stop().await;
        let elapsed = started.elapsed();
        // Full escalation window, then the forced kill is near-instant.
        assert!(elapsed >= Duration::from_millis(900), "stopped too early: {elapsed:?}");
        assert!(elapsed < Duration::from_secs(5));
        assert!(!sup.is_running());
    }
}
