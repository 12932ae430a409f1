use std::collections::HashMap;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::config::{ControllerConfig, EnginePaths, Platform, RemoteShellConfig};
use crate::error::{ControllerError, Result};
use crate::scheduler::Engine;
use crate::worker::engine::parser_for;
use crate::worker::executor::{ExecutionAdapter, FrameRequest, RenderEvent};

const EVENT_BUFFER: usize = 64;

/// Runs render and control commands on nodes through a remote shell (ssh by default).
///
/// The render command backgrounds the engine and prints its pid with
/// `pgrep -n`, since the local child is the ssh client and not the engine.
#[derive(Debug, Clone)]
pub struct RemoteShellExecutor {
    shell: RemoteShellConfig,
    engines: EnginePaths,
    platforms: HashMap<String, Platform>,
}

impl RemoteShellExecutor {
    pub fn new(config: &ControllerConfig) -> Self {
        Self {
            shell: config.remote_shell.clone(),
            engines: config.engines.clone(),
            platforms: config
                .nodes
                .iter()
                .map(|n| (n.name.clone(), n.platform))
                .collect(),
        }
    }

    fn platform(&self, node: &str) -> Platform {
        self.platforms.get(node).copied().unwrap_or(Platform::Linux)
    }

    /// Shell command line that renders one frame on the node.
    pub fn render_command(&self, request: &FrameRequest) -> String {
        let platform = self.platform(&request.node);
        match request.engine {
            Engine::Blender => {
                let binary = match platform {
                    Platform::Linux => &self.engines.blender_linux,
                    Platform::MacOs => &self.engines.blender_mac,
                };
                format!(
                    "{} -b -noaudio {} -f {} & pgrep -n blender",
                    shell_quote(binary),
                    shell_quote(&request.path),
                    request.frame
                )
            }
            Engine::Terragen => {
                let (binary, process) = match platform {
                    Platform::Linux => (&self.engines.terragen_linux, "terragen"),
                    Platform::MacOs => (&self.engines.terragen_mac, "Terragen"),
                };
                format!(
                    "{} -p {} -hide -exit -r -f {} & pgrep -n {}; wait",
                    shell_quote(binary),
                    shell_quote(&request.path),
                    request.frame,
                    process
                )
            }
        }
    }

    fn command(&self, node: &str, remote: &str) -> Command {
        let mut cmd = Command::new(&self.shell.program);
        cmd.args(&self.shell.args);
        if self.shell.include_host {
            match &self.shell.user {
                Some(user) => cmd.arg(format!("{}@{}", user, node)),
                None => cmd.arg(node),
            };
        }
        cmd.arg(remote);
        cmd
    }

    /// Run a short control command and wait for it.
    async fn control(&self, node: &str, remote: &str) -> Result<()> {
        let output = self
            .command(node, remote)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| ControllerError::RemoteControl {
                node: node.to_string(),
                message: e.to_string(),
            })?;
        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(ControllerError::RemoteControl {
                node: node.to_string(),
                message: format!("`{}` exited with {}: {}", remote, output.status, stderr.trim()),
            })
        }
    }
}

#[async_trait]
impl ExecutionAdapter for RemoteShellExecutor {
    async fn launch(&self, request: &FrameRequest) -> Result<mpsc::Receiver<RenderEvent>> {
        let remote = self.render_command(request);
        tracing::debug!(node = %request.node, frame = request.frame, command = %remote, "Launching render");

        let mut child = self
            .command(&request.node, &remote)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ControllerError::RemoteControl {
                node: request.node.clone(),
                message: e.to_string(),
            })?;

        let stdout = child.stdout.take().ok_or_else(|| ControllerError::RemoteControl {
            node: request.node.clone(),
            message: "render process has no stdout".to_string(),
        })?;
        if let Some(stderr) = child.stderr.take() {
            let node = request.node.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(node = %node, line = %line, "Render stderr");
                }
            });
        }

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let mut parser = parser_for(request.engine, request.frame);
        let node = request.node.clone();
        let frame = request.frame;
        let verbose = request.verbose;

        tokio::spawn(async move {
            let mut reader = BufReader::new(stdout);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf).await {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(node = %node, frame, error = %e, "Render output read failed");
                        break;
                    }
                }
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end();
                if verbose {
                    tracing::info!(node = %node, frame, "{}", line);
                } else {
                    tracing::trace!(node = %node, frame, "{}", line);
                }
                if let Some(event) = parser.parse_line(line) {
                    if tx.send(event).await.is_err() {
                        break;
                    }
                }
            }
            // Reap the shell; if the worker gave up early, dropping `child` kills it.
            if tx.is_closed() {
                return;
            }
            if let Err(e) = child.wait().await {
                tracing::debug!(node = %node, frame, error = %e, "Failed to reap render shell");
            }
        });

        Ok(rx)
    }

    async fn kill(&self, node: &str, pid: u32) -> Result<()> {
        self.control(node, &format!("kill {}", pid)).await
    }

    async fn renice(&self, node: &str, pid: u32) -> Result<()> {
        self.control(node, &format!("renice 20 -p {}", pid)).await?;
        tracing::info!(node, pid, "Reniced render process");
        Ok(())
    }

    async fn killall(&self, node: &str, process_name: &str) -> Result<()> {
        self.control(node, &format!("killall {}", shell_quote(process_name)))
            .await
    }
}

/// Single-quote `s` for a POSIX shell.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}
