use std::env;
use std::fs;
use std::io::ErrorKind;
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Filesystem layout for a scheduler or server process's private state:
/// identity keys and the list of nodes it last knew about, so a restart can
/// reconnect without waiting for a fresh discovery round.
///
/// Rooted at `--dest_path` (the same directory used for file transfer
/// staging) under a `.discoro` subdirectory, matching the original
/// scheduler's `os.path.join(dest_path, 'discoro', 'scheduler', auth)`
/// layout for per-computation staging.
#[derive(Debug, Clone)]
pub struct DiscoroHome {
    pub root: PathBuf,
    pub identity_key: PathBuf,
    pub identity_pub: PathBuf,
    pub state: PathBuf,
}

impl DiscoroHome {
    pub fn discover_with_override(override_root: Option<&Path>) -> Result<Self> {
        if let Some(root) = override_root {
            return Ok(Self::from_root(root.to_path_buf()));
        }

        if let Ok(root) = env::var("DISCORO_HOME")
            && !root.trim().is_empty()
        {
            return Ok(Self::from_root(PathBuf::from(root)));
        }

        Self::discover()
    }

    pub fn discover() -> Result<Self> {
        let home = env::var("HOME").context("HOME is not set")?;
        let root = Path::new(&home).join(".discoro");
        Ok(Self::from_root(root))
    }

    pub fn from_root(root: PathBuf) -> Self {
        Self {
            identity_key: root.join("identity.key"),
            identity_pub: root.join("identity.pub"),
            state: root.join("state.toml"),
            root,
        }
    }

    pub fn ensure_root_exists(&self) -> Result<()> {
        if self.root.exists() {
            let meta = fs::symlink_metadata(&self.root).with_context(|| {
                format!(
                    "failed to read metadata for discoro home: {}",
                    self.root.display()
                )
            })?;
            if meta.file_type().is_symlink() {
                anyhow::bail!(
                    "discoro home directory is a symlink (security violation): {}. \
                     Remove the symlink and restart.",
                    self.root.display()
                );
            }
        } else {
            fs::create_dir_all(&self.root).with_context(|| {
                format!("failed to create discoro home dir: {}", self.root.display())
            })?;
        }
        fs::set_permissions(&self.root, fs::Permissions::from_mode(0o700)).with_context(|| {
            format!(
                "failed to set discoro home dir permissions: {}",
                self.root.display()
            )
        })?;
        Ok(())
    }
}

/// Per-computation staging directory: `<dest_path>/discoro/scheduler/<auth>/`.
pub fn computation_staging_dir(dest_path: &Path, auth: &str) -> PathBuf {
    dest_path.join("discoro").join("scheduler").join(auth)
}

pub fn ensure_staging_dir(dest_path: &Path, auth: &str) -> Result<PathBuf> {
    let dir = computation_staging_dir(dest_path, auth);
    fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create staging dir: {}", dir.display()))?;
    Ok(dir)
}

pub fn remove_staging_dir(dest_path: &Path, auth: &str) -> Result<()> {
    let dir = computation_staging_dir(dest_path, auth);
    match fs::remove_dir_all(&dir) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("failed to remove staging dir: {}", dir.display())),
    }
}

// ---------------------------------------------------------------------------
// Node address parsing — used for the repeatable `--node` CLI flag
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeAddr {
    Socket(SocketAddr),
    Host { host: String, port: u16 },
}

impl NodeAddr {
    const DEFAULT_NODE_PORT: u16 = 51350;

    fn resolve_host(host: &str, port: u16) -> Result<SocketAddr> {
        let addrs: Vec<SocketAddr> = (host, port)
            .to_socket_addrs()
            .with_context(|| format!("failed to resolve '{host}:{port}'"))?
            .collect();
        if let Some(addr) = addrs.iter().copied().find(SocketAddr::is_ipv4) {
            return Ok(addr);
        }
        addrs
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("resolution returned no addresses for '{host}:{port}'"))
    }

    pub fn parse(input: &str) -> Result<Self> {
        if let Ok(addr) = input.parse::<SocketAddr>() {
            return Ok(Self::Socket(addr));
        }

        if let Some((host, port)) = input.rsplit_once(':')
            && let Ok(port) = port.parse::<u16>()
        {
            if host.is_empty() {
                anyhow::bail!("host cannot be empty");
            }
            return Ok(Self::Host {
                host: host.to_string(),
                port,
            });
        }

        if input.is_empty() {
            anyhow::bail!("node address cannot be empty");
        }
        Ok(Self::Host {
            host: input.to_string(),
            port: Self::DEFAULT_NODE_PORT,
        })
    }

    pub fn resolve(&self) -> Result<SocketAddr> {
        match self {
            NodeAddr::Socket(addr) => Ok(*addr),
            NodeAddr::Host { host, port } => Self::resolve_host(host, *port),
        }
    }

    pub async fn resolve_async(&self) -> Result<SocketAddr> {
        match self {
            NodeAddr::Socket(addr) => Ok(*addr),
            NodeAddr::Host { host, port } => {
                let host = host.clone();
                let port = *port;
                tokio::task::spawn_blocking(move || Self::resolve_host(&host, port))
                    .await
                    .map_err(|err| anyhow!("hostname resolution task failed: {err}"))?
            }
        }
    }
}

impl std::fmt::Display for NodeAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeAddr::Socket(addr) => write!(f, "{addr}"),
            NodeAddr::Host { host, port } => write!(f, "{host}:{port}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Persisted scheduler state — surviving restarts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PersistedState {
    #[serde(default)]
    pub known_nodes: Vec<String>,
}

pub async fn load_persisted_state(path: &Path) -> Result<PersistedState> {
    let raw = match tokio::fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(PersistedState::default()),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read state: {}", path.display()));
        }
    };
    toml::from_str(&raw).with_context(|| format!("failed to parse state: {}", path.display()))
}

pub async fn save_persisted_state(path: &Path, state: &PersistedState) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.exists()
    {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create directory: {}", parent.display()))?;
    }

    let serialized =
        toml::to_string_pretty(state).with_context(|| format!("failed to serialize state: {}", path.display()))?;
    tokio::fs::write(path, serialized)
        .await
        .with_context(|| format!("failed to write state: {}", path.display()))?;
    Ok(())
}
