use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Operating system of a render node. Selects the engine binary path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Linux,
    #[serde(alias = "osx", alias = "mac")]
    MacOs,
}

/// A machine in the render farm.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RenderNode {
    pub name: String,
    pub platform: Platform,
    /// Lower the scheduling priority of render processes on this node.
    pub renice: bool,
}

impl RenderNode {
    pub fn linux(name: &str) -> Self {
        Self {
            name: name.to_string(),
            platform: Platform::Linux,
            renice: false,
        }
    }
}

/// Paths to the render engine binaries on each platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnginePaths {
    pub blender_linux: String,
    pub blender_mac: String,
    pub terragen_linux: String,
    pub terragen_mac: String,
}

impl Default for EnginePaths {
    fn default() -> Self {
        Self {
            blender_linux: "/usr/local/bin/blender".to_string(),
            blender_mac: "/Applications/blender.app/Contents/MacOS/blender".to_string(),
            terragen_linux: "/mnt/data/software/terragen_rendernode/linux/terragen".to_string(),
            terragen_mac:
                "/mnt/data/software/terragen_rendernode/osx/terragen3.app/Contents/MacOS/Terragen_3"
                    .to_string(),
        }
    }
}

/// How to reach a render node's shell.
///
/// The remote command line is built as `program args... [user@]node "<command>"`.
/// Setting `include_host` to false runs commands locally (`sh -c "<command>"`),
/// which is how single-machine setups and the test suite use it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RemoteShellConfig {
    pub program: String,
    pub args: Vec<String>,
    pub user: Option<String>,
    pub include_host: bool,
}

impl Default for RemoteShellConfig {
    fn default() -> Self {
        Self {
            program: "ssh".to_string(),
            args: vec!["-o".to_string(), "BatchMode=yes".to_string()],
            user: None,
            include_host: true,
        }
    }
}

impl RemoteShellConfig {
    /// Run commands through the local shell instead of ssh.
    pub fn local() -> Self {
        Self {
            program: "sh".to_string(),
            args: vec!["-c".to_string()],
            user: None,
            include_host: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ControllerConfig {
    /// Ordered node universe. Dispatch iterates nodes in this order.
    pub nodes: Vec<RenderNode>,
    pub listen_addr: SocketAddr,
    /// A node that reports nothing for this long has its frame failed.
    pub node_timeout_ms: u64,
    pub dispatch_interval_ms: u64,
    /// Period of the autostart + state snapshot loop.
    pub update_interval_ms: u64,
    pub request_timeout_ms: u64,
    pub max_concurrent_jobs: usize,
    pub autostart: bool,
    pub verbose: bool,
    pub log_dir: PathBuf,
    pub state_file: PathBuf,
    pub engines: EnginePaths,
    pub remote_shell: RemoteShellConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            // SAFETY: This is a hardcoded valid address that will always parse
            listen_addr: "0.0.0.0:2020"
                .parse()
                .expect("default listen address is valid"),
            node_timeout_ms: 1_000_000,
            dispatch_interval_ms: 100,
            update_interval_ms: 30_000,
            request_timeout_ms: 10_000,
            max_concurrent_jobs: 1,
            autostart: true,
            verbose: false,
            log_dir: PathBuf::from("renderlogs"),
            state_file: PathBuf::from("serverstate.json"),
            engines: EnginePaths::default(),
            remote_shell: RemoteShellConfig::default(),
        }
    }
}

impl ControllerConfig {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_node(mut self, node: RenderNode) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn with_linux_nodes(mut self, names: &[&str]) -> Self {
        self.nodes.extend(names.iter().map(|n| RenderNode::linux(n)));
        self
    }

    pub fn node_timeout(&self) -> Duration {
        Duration::from_millis(self.node_timeout_ms)
    }

    pub fn dispatch_interval(&self) -> Duration {
        Duration::from_millis(self.dispatch_interval_ms)
    }

    pub fn update_interval(&self) -> Duration {
        Duration::from_millis(self.update_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn node(&self, name: &str) -> Option<&RenderNode> {
        self.nodes.iter().find(|n| n.name == name)
    }

    pub fn node_names(&self) -> Vec<String> {
        self.nodes.iter().map(|n| n.name.clone()).collect()
    }

    /// Load the config file, creating it from defaults when missing.
    ///
    /// A file that does not parse or does not carry exactly the expected fields is
    /// replaced with defaults rather than aborting startup.
    pub fn load_or_init(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!(path = %path.display(), "No config file found, creating one from defaults");
            let config = Self::default();
            config.save(path)?;
            return Ok(config);
        }

        let raw = std::fs::read_to_string(path)?;
        match serde_json::from_str::<Self>(&raw) {
            Ok(config) => {
                tracing::info!(path = %path.display(), nodes = config.nodes.len(), "Config file loaded");
                Ok(config)
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "Config file corrupt or outdated, rebuilding from defaults"
                );
                let config = Self::default();
                config.save(path)?;
                Ok(config)
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}
