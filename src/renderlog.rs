//! Human-readable audit trail for a render job.
//!
//! One text file per job, opened when the render first starts and appended to on
//! every later event. Lines are handed to a single [`LogWriter`] task and written
//! with `tokio::fs`, in the order they were produced. Write failures are logged
//! and otherwise ignored so a full disk never interrupts a render.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Local, Utc};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};

const HRULE: &str = "======================================================================";

#[derive(Debug)]
enum LogCommand {
    Append {
        path: PathBuf,
        /// Timestamp of a render start; the writer picks "started" or "resumed".
        start: Option<String>,
        lines: Vec<String>,
    },
    Flush(oneshot::Sender<()>),
}

/// Handle to the task that appends audit-log lines to disk.
#[derive(Debug, Clone)]
pub struct LogWriter {
    dir: PathBuf,
    tx: mpsc::UnboundedSender<LogCommand>,
}

impl LogWriter {
    /// Spawn the writer task for logs under `dir`. Must be called inside a tokio runtime.
    pub fn spawn(dir: &Path) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(write_records(rx));
        Self {
            dir: dir.to_path_buf(),
            tx,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Wait until everything sent so far has been written.
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        if self.tx.send(LogCommand::Flush(done)).is_ok() {
            let _ = wait.await;
        }
    }

    fn send(&self, command: LogCommand) {
        if self.tx.send(command).is_err() {
            tracing::debug!(dir = %self.dir.display(), "Render log writer has stopped");
        }
    }
}

async fn write_records(mut rx: mpsc::UnboundedReceiver<LogCommand>) {
    while let Some(command) = rx.recv().await {
        match command {
            LogCommand::Append { path, start, lines } => {
                let mut text = String::new();
                if let Some(stamp) = start {
                    let verb = match tokio::fs::try_exists(&path).await {
                        Ok(true) => "resumed",
                        _ => "started",
                    };
                    text.push_str(HRULE);
                    text.push('\n');
                    text.push_str(&format!("Render {} at {}\n", verb, stamp));
                }
                for line in lines {
                    text.push_str(&line);
                    text.push('\n');
                }
                if let Err(e) = append(&path, text.as_bytes()).await {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to write render log");
                }
            }
            LogCommand::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}

async fn append(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(bytes).await?;
    file.flush().await
}

#[derive(Debug, Clone)]
pub struct RenderLog {
    path: PathBuf,
    total_frames: usize,
    writer: LogWriter,
}

/// Fields written into the start and resume headers.
#[derive(Debug)]
pub struct LogHeader<'a> {
    pub project: &'a str,
    pub start_frame: i64,
    pub end_frame: i64,
    pub extra_frames: &'a [i64],
    pub nodes: &'a [String],
}

impl RenderLog {
    /// Log file for a project enqueued at `queued_at`: `<log_dir>/<stem>.<timestamp>.txt`.
    pub fn new(writer: &LogWriter, project: &str, queued_at: DateTime<Utc>, total_frames: usize) -> Self {
        let stem = Path::new(project)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "render".to_string());
        let stamp = queued_at.with_timezone(&Local).format("%Y-%m-%d_%H%M%S");
        Self {
            path: writer.dir().join(format!("{}.{}.txt", stem, stamp)),
            total_frames,
            writer: writer.clone(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes the start header, or a resume header if the file already exists.
    pub fn started(&self, header: &LogHeader<'_>) {
        let extras: Vec<String> = header.extra_frames.iter().map(|f| f.to_string()).collect();
        let lines = vec![
            format!("File: {}", header.project),
            format!(
                "Frames: {} - {}, [{}]",
                header.start_frame,
                header.end_frame,
                extras.join(", ")
            ),
            format!("On: {}", header.nodes.join(", ")),
            HRULE.to_string(),
        ];
        self.writer.send(LogCommand::Append {
            path: self.path.clone(),
            start: Some(timestamp()),
            lines,
        });
    }

    pub fn frame_sent(&self, frame: i64, node: &str) {
        self.append(&[format!(
            "Sent frame {} of {} to {} at {}",
            frame,
            self.total_frames,
            node,
            timestamp()
        )]);
    }

    pub fn frame_received(&self, frame: i64, node: &str, render_time: Option<Duration>) {
        let render_time = render_time
            .map(|d| format_duration(d.as_secs_f64()))
            .unwrap_or_else(|| "unknown".to_string());
        self.append(&[format!(
            "Received frame {} of {} from {} at {}. Render time was {}",
            frame,
            self.total_frames,
            node,
            timestamp(),
            render_time
        )]);
    }

    pub fn frame_failed(&self, frame: i64, node: &str, reason: &str) {
        self.append(&[format!(
            "ERROR: Frame {} failed to render on {} at {}: {}",
            frame,
            node,
            timestamp(),
            reason
        )]);
    }

    pub fn process_killed(&self, pid: u32, node: &str) {
        self.append(&[format!("Killed process {} on {} at {}", pid, node, timestamp())]);
    }

    pub fn node_added(&self, node: &str) {
        self.append(&[format!("Added {} to render pool at {}", node, timestamp())]);
    }

    pub fn node_removed(&self, node: &str) {
        self.append(&[format!("Removed {} from render pool at {}", node, timestamp())]);
    }

    pub fn finished(&self, elapsed: f64, average: f64) {
        self.footer("Render finished", elapsed, average);
    }

    pub fn stopped(&self, elapsed: f64, average: f64) {
        self.footer("Render stopped by user", elapsed, average);
    }

    pub fn server_shutdown(&self) {
        self.append(&[
            HRULE.to_string(),
            format!("Server shut down at {}", timestamp()),
            "If the server is restarted this render will be resumed in this log.".to_string(),
            HRULE.to_string(),
        ]);
    }

    fn footer(&self, what: &str, elapsed: f64, average: f64) {
        self.append(&[
            HRULE.to_string(),
            format!("{} at {}", what, timestamp()),
            format!("Total time: {}", format_duration(elapsed)),
            format!("Average time per frame: {}", format_duration(average)),
            HRULE.to_string(),
        ]);
    }

    fn append(&self, lines: &[String]) {
        self.writer.send(LogCommand::Append {
            path: self.path.clone(),
            start: None,
            lines: lines.to_vec(),
        });
    }
}

fn timestamp() -> String {
    Local::now().format("%H:%M:%S on %Y/%m/%d").to_string()
}

/// Formats seconds as `[Nd ][Nh ][Nm ]S.Ss`.
pub fn format_duration(seconds: f64) -> String {
    let seconds = seconds.max(0.0);
    let whole = seconds.trunc() as u64;
    let frac = seconds - whole as f64;
    let secs = (whole % 60) as f64 + frac;
    let minutes = (whole / 60) % 60;
    let hours = (whole / 3600) % 24;
    let days = whole / 86_400;

    if whole < 60 {
        format!("{:.1}s", secs)
    } else if whole < 3600 {
        format!("{}m {:.1}s", minutes, secs)
    } else if whole < 86_400 {
        format!("{}h {}m {:.1}s", hours, minutes, secs)
    } else {
        format!("{}d {}h {}m {:.1}s", days, hours, minutes, secs)
    }
}
