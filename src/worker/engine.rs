//! Turns render engine stdout into [`RenderEvent`]s.
//!
//! The remote command prints the engine's pid (`pgrep -n`) on a line of its own,
//! so every parser treats a bare integer line as the process id.

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;

use crate::scheduler::Engine;
use crate::worker::executor::RenderEvent;

pub trait OutputParser: Send {
    /// Returns the event carried by one line of output, if any.
    fn parse_line(&mut self, line: &str) -> Option<RenderEvent>;
}

/// Parser for the given engine, rendering `frame`.
pub fn parser_for(engine: Engine, frame: i64) -> Box<dyn OutputParser> {
    match engine {
        Engine::Blender => Box::new(BlenderParser::new()),
        Engine::Terragen => Box::new(TerragenParser::new(frame)),
    }
}

// Patterns are constant, so a compile failure is a programming error.
static BLENDER_TILES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:Tile|Rendered) +(\d+)/(\d+)").expect("valid regex"));
static BLENDER_SAMPLES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Sample (\d+)/(\d+)").expect("valid regex"));
static BLENDER_TIME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Time: (?:(\d+):)?(\d+):(\d+(?:\.\d+)?)").expect("valid regex")
});
static TERRAGEN_PERCENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+(?:\.\d+)?)%").expect("valid regex"));
static TERRAGEN_TIME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+):(\d+):(\d+)s").expect("valid regex"));

fn parse_pid(line: &str) -> Option<u32> {
    let trimmed = line.trim();
    if trimmed.is_empty() || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    trimmed.parse().ok()
}

/// Blender Cycles output.
///
/// Progress comes from `Fra:` status lines (tile counts in older releases,
/// sample counts in newer ones). `Saved:` marks the frame written.
#[derive(Debug, Default)]
pub struct BlenderParser;

impl BlenderParser {
    pub fn new() -> Self {
        Self
    }

    fn fraction(re: &Regex, line: &str) -> Option<f64> {
        let caps = re.captures(line)?;
        let done: f64 = caps.get(1)?.as_str().parse().ok()?;
        let total: f64 = caps.get(2)?.as_str().parse().ok()?;
        (total > 0.0).then(|| done / total * 100.0)
    }

    fn render_time(line: &str) -> Option<Duration> {
        let caps = BLENDER_TIME.captures(line)?;
        let hours: u64 = caps.get(1).map_or(Ok(0), |m| m.as_str().parse()).ok()?;
        let minutes: u64 = caps.get(2)?.as_str().parse().ok()?;
        let seconds: f64 = caps.get(3)?.as_str().parse().ok()?;
        Some(Duration::from_secs_f64(
            (hours * 3600 + minutes * 60) as f64 + seconds,
        ))
    }
}

impl OutputParser for BlenderParser {
    fn parse_line(&mut self, line: &str) -> Option<RenderEvent> {
        if let Some(pid) = parse_pid(line) {
            return Some(RenderEvent::ProcessIdentified(pid));
        }
        if line.starts_with("Fra:") {
            return Self::fraction(&BLENDER_TILES, line)
                .or_else(|| Self::fraction(&BLENDER_SAMPLES, line))
                .map(RenderEvent::ProgressUpdate);
        }
        if line.starts_with("Saved:") {
            return Some(RenderEvent::FrameSaved {
                render_time: Self::render_time(line),
            });
        }
        if let Some(message) = line.strip_prefix("Error:") {
            return Some(RenderEvent::WarningOrError(message.trim().to_string()));
        }
        None
    }
}

/// Terragen output.
///
/// Terragen echoes the frame number at startup, so a numeric line equal to the
/// frame is not a pid. Progress restarts at 0% for each render pass.
#[derive(Debug)]
pub struct TerragenParser {
    frame: i64,
}

impl TerragenParser {
    pub fn new(frame: i64) -> Self {
        Self { frame }
    }
}

impl OutputParser for TerragenParser {
    fn parse_line(&mut self, line: &str) -> Option<RenderEvent> {
        if let Some(pid) = parse_pid(line) {
            if i64::from(pid) == self.frame {
                return None;
            }
            return Some(RenderEvent::ProcessIdentified(pid));
        }
        let trimmed = line.trim_start();
        if trimmed.starts_with("Error") || trimmed.starts_with("ERROR") {
            return Some(RenderEvent::WarningOrError(trimmed.to_string()));
        }
        if trimmed.starts_with("Starting") || trimmed.starts_with("Rendered") {
            tracing::debug!(frame = self.frame, line = trimmed, "Terragen pass boundary");
            return None;
        }
        if trimmed.starts_with("Rendering") {
            let caps = TERRAGEN_PERCENT.captures(trimmed)?;
            let percent: f64 = caps.get(1)?.as_str().parse().ok()?;
            return Some(RenderEvent::ProgressUpdate(percent));
        }
        if trimmed.starts_with("Finished") {
            let render_time = TERRAGEN_TIME.captures(trimmed).and_then(|caps| {
                let h: u64 = caps.get(1)?.as_str().parse().ok()?;
                let m: u64 = caps.get(2)?.as_str().parse().ok()?;
                let s: u64 = caps.get(3)?.as_str().parse().ok()?;
                Some(Duration::from_secs(h * 3600 + m * 60 + s))
            });
            return Some(RenderEvent::FrameSaved { render_time });
        }
        None
    }
}
