//! Making remote sync locations reachable as local paths.
//!
//! A sync URI such as `sftp://host/home/me/notes` only becomes usable once
//! its enclosing volume is mounted. [`MountManager`] mounts the volume for the
//! duration of a session and unmounts it afterwards, but only if it was the
//! one that mounted it.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use notesync_core::SyncError;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::{debug, info, instrument, warn};
use url::Url;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MountError {
    #[error("Invalid sync location {uri:?}: {reason}")]
    InvalidUri { uri: String, reason: String },

    #[error("Mounting {0} timed out")]
    Timeout(String),

    #[error("Mount operation for {0} was dropped before completing")]
    Cancelled(String),

    #[error("Cannot mount {uri}: {reason}")]
    Failed { uri: String, reason: String },
}

impl From<MountError> for SyncError {
    fn from(e: MountError) -> Self {
        SyncError::Mount(e.to_string())
    }
}

/// Completion handle of a mount or unmount operation.
pub type Completion = oneshot::Receiver<Result<(), MountError>>;

/// Host service that knows which volumes are mounted and can mount more.
#[async_trait]
pub trait VolumeMonitor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Local path of `uri` if its volume is currently mounted.
    async fn resolve(&self, uri: &Url) -> Result<Option<PathBuf>, MountError>;

    /// Start mounting the volume rooted at `volume`.
    fn mount_enclosing_volume(&self, volume: &Url) -> Completion;

    /// Start unmounting the volume rooted at `volume`.
    fn unmount(&self, volume: &Url) -> Completion;
}

/// Parse a configured sync location. Plain paths become `file://` URLs.
pub fn parse_sync_uri(uri: &str) -> Result<Url, MountError> {
    let trimmed = uri.trim();
    let invalid = |reason: &str| MountError::InvalidUri {
        uri: uri.to_string(),
        reason: reason.to_string(),
    };
    if trimmed.is_empty() {
        return Err(invalid("empty location"));
    }

    if let Ok(url) = Url::parse(trimmed) {
        // Single letters are Windows drive prefixes, not schemes
        if url.scheme().len() > 1 {
            return Ok(url);
        }
    }

    let path = std::path::absolute(trimmed).map_err(|e| invalid(&e.to_string()))?;
    Url::from_directory_path(&path).map_err(|_| invalid("not an absolute path"))
}

/// The outermost ancestor of `uri`: `scheme://[user@]host[:port]/`.
pub fn volume_root(uri: &Url) -> Url {
    let mut root = uri.clone();
    root.set_path("/");
    root.set_query(None);
    root.set_fragment(None);
    root
}

/// A sync location made reachable for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountedRoot {
    pub uri: Url,
    /// Local directory the backend works on.
    pub path: PathBuf,
    /// Whether this manager mounted the volume and must unmount it.
    pub mounted_by_us: bool,
    volume: Url,
}

/// Mounts enclosing volumes on demand and tracks which ones it owns.
pub struct MountManager {
    monitor: Arc<dyn VolumeMonitor>,
    timeout: Duration,
    /// Volumes mounted by us -> sessions still using them
    mounts: DashMap<String, usize>,
}

impl std::fmt::Debug for MountManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MountManager")
            .field("monitor", &self.monitor.name())
            .field("timeout", &self.timeout)
            .field("mounts", &self.mounts)
            .finish()
    }
}

impl MountManager {
    pub fn new(monitor: Arc<dyn VolumeMonitor>, timeout: Duration) -> Self {
        Self {
            monitor,
            timeout,
            mounts: DashMap::new(),
        }
    }

    /// Volumes currently mounted by this manager.
    pub fn active_mounts(&self) -> Vec<String> {
        self.mounts.iter().map(|e| e.key().clone()).collect()
    }

    async fn await_completion(&self, what: &str, completion: Completion) -> Result<(), MountError> {
        match tokio::time::timeout(self.timeout, completion).await {
            Err(_) => Err(MountError::Timeout(what.to_string())),
            Ok(Err(_)) => Err(MountError::Cancelled(what.to_string())),
            Ok(Ok(result)) => result,
        }
    }

    async fn ensure_dir(uri: &Url, path: &Path) -> Result<(), MountError> {
        if tokio::fs::try_exists(path).await.unwrap_or(false) {
            return Ok(());
        }
        debug!("Creating sync directory {}", path.display());
        tokio::fs::create_dir_all(path)
            .await
            .map_err(|e| MountError::Failed {
                uri: uri.to_string(),
                reason: format!("cannot create {}: {}", path.display(), e),
            })
    }

    #[instrument(skip(self), level = "debug")]
    pub async fn ensure_mounted(&self, uri: &str) -> Result<MountedRoot, MountError> {
        let uri = parse_sync_uri(uri)?;
        let volume = volume_root(&uri);

        if let Some(path) = self.monitor.resolve(&uri).await? {
            Self::ensure_dir(&uri, &path).await?;
            debug!("{} already reachable at {}", uri, path.display());
            return Ok(MountedRoot {
                uri,
                path,
                mounted_by_us: false,
                volume,
            });
        }

        info!("Mounting {} via {}", volume, self.monitor.name());
        let completion = self.monitor.mount_enclosing_volume(&volume);
        self.await_completion(volume.as_str(), completion).await?;
        *self.mounts.entry(volume.to_string()).or_insert(0) += 1;

        let resolved = match self.monitor.resolve(&uri).await {
            Ok(Some(path)) => Self::ensure_dir(&uri, &path).await.map(|_| path),
            Ok(None) => Err(MountError::Failed {
                uri: uri.to_string(),
                reason: "volume mounted but location is still unreachable".to_string(),
            }),
            Err(e) => Err(e),
        };

        let root = MountedRoot {
            uri,
            path: PathBuf::new(),
            mounted_by_us: true,
            volume,
        };
        match resolved {
            Ok(path) => Ok(MountedRoot { path, ..root }),
            Err(e) => {
                self.release(&root).await;
                Err(e)
            }
        }
    }

    /// Unmount the volume if we mounted it and no other session uses it.
    /// Failures are logged only.
    #[instrument(skip(self, root), level = "debug", fields(uri = %root.uri))]
    pub async fn release(&self, root: &MountedRoot) {
        if !root.mounted_by_us {
            return;
        }
        let key = root.volume.to_string();
        let last_user = match self.mounts.get_mut(&key) {
            Some(mut users) => {
                *users = users.saturating_sub(1);
                *users == 0
            }
            None => false,
        };
        if !last_user {
            return;
        }
        self.mounts.remove_if(&key, |_, users| *users == 0);

        let completion = self.monitor.unmount(&root.volume);
        match self.await_completion(&key, completion).await {
            Ok(()) => info!("Unmounted {}", key),
            Err(e) => warn!("Failed to unmount {}: {}", key, e),
        }
    }
}

/// Local filesystem only: `file://` locations are always mounted, anything
/// else cannot be mounted.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalVolumeMonitor;

fn immediate(result: Result<(), MountError>) -> Completion {
    let (tx, rx) = oneshot::channel();
    let _ = tx.send(result);
    rx
}

#[async_trait]
impl VolumeMonitor for LocalVolumeMonitor {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn resolve(&self, uri: &Url) -> Result<Option<PathBuf>, MountError> {
        if uri.scheme() != "file" {
            return Ok(None);
        }
        uri.to_file_path()
            .map(Some)
            .map_err(|_| MountError::InvalidUri {
                uri: uri.to_string(),
                reason: "not a local path".to_string(),
            })
    }

    fn mount_enclosing_volume(&self, volume: &Url) -> Completion {
        immediate(Err(MountError::Failed {
            uri: volume.to_string(),
            reason: format!("scheme {} needs a volume monitor", volume.scheme()),
        }))
    }

    fn unmount(&self, _volume: &Url) -> Completion {
        immediate(Ok(()))
    }
}

/// GVfs volumes through the `gio` command line tool.
#[derive(Debug, Clone)]
pub struct GioVolumeMonitor {
    program: String,
    command_timeout: Duration,
}

impl Default for GioVolumeMonitor {
    fn default() -> Self {
        Self::new("gio", Duration::from_secs(30))
    }
}

async fn run_cmd_with_timeout(cmd: &mut Command, timeout: Duration) -> Result<String, String> {
    let output = tokio::time::timeout(timeout, cmd.output())
        .await
        .map_err(|_| format!("command timed out after {}s", timeout.as_secs()))?
        .map_err(|e| format!("failed to execute command: {}", e))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(format!("command failed ({}): {}", output.status, stderr.trim()));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Extract the `local path:` attribute from `gio info` output.
fn parse_local_path(info: &str) -> Option<PathBuf> {
    info.lines()
        .filter_map(|line| line.trim().strip_prefix("local path:"))
        .map(str::trim)
        .find(|p| !p.is_empty())
        .map(PathBuf::from)
}

impl GioVolumeMonitor {
    pub fn new(program: impl Into<String>, command_timeout: Duration) -> Self {
        Self {
            program: program.into(),
            command_timeout,
        }
    }

    fn spawn(&self, args: Vec<String>, volume: &Url, ignore: &'static str) -> Completion {
        let (tx, rx) = oneshot::channel();
        let program = self.program.clone();
        let timeout = self.command_timeout;
        let uri = volume.to_string();

        tokio::spawn(async move {
            let result = run_cmd_with_timeout(Command::new(&program).args(&args), timeout).await;
            let outcome = match result {
                Ok(_) => Ok(()),
                Err(reason) if reason.contains(ignore) => {
                    debug!("{}: {}", uri, reason);
                    Ok(())
                }
                Err(reason) => Err(MountError::Failed { uri, reason }),
            };
            let _ = tx.send(outcome);
        });
        rx
    }
}

#[async_trait]
impl VolumeMonitor for GioVolumeMonitor {
    fn name(&self) -> &'static str {
        "gio"
    }

    async fn resolve(&self, uri: &Url) -> Result<Option<PathBuf>, MountError> {
        if uri.scheme() == "file" {
            return LocalVolumeMonitor.resolve(uri).await;
        }

        let mut cmd = Command::new(&self.program);
        cmd.arg("info").arg(uri.as_str());
        match run_cmd_with_timeout(&mut cmd, self.command_timeout).await {
            Ok(info) => Ok(parse_local_path(&info)),
            Err(reason) if reason.starts_with("failed to execute") => Err(MountError::Failed {
                uri: uri.to_string(),
                reason,
            }),
            Err(reason) => {
                debug!("{} is not reachable yet: {}", uri, reason);
                Ok(None)
            }
        }
    }

    fn mount_enclosing_volume(&self, volume: &Url) -> Completion {
        self.spawn(
            vec!["mount".to_string(), volume.to_string()],
            volume,
            "already mounted",
        )
    }

    fn unmount(&self, volume: &Url) -> Completion {
        self.spawn(
            vec!["mount".to_string(), "-u".to_string(), volume.to_string()],
            volume,
            "not mounted",
        )
    }
}
