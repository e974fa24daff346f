// Session log sink
//
// The caller decides where session messages and transfer progress go. Every sink also lands in
// the `log` facade so the JSON/txt log files stay complete.

use indicatif::{ProgressBar, ProgressStyle};
use log::Level;
use std::sync::Mutex;

pub trait LogSink: Send + Sync {
    fn message(&self, level: Level, text: &str);

    /// Transfer progress, 0-100.
    fn progress(&self, _percent: u8) {}

    fn info(&self, text: &str) {
        self.message(Level::Info, text);
    }

    fn warn(&self, text: &str) {
        self.message(Level::Warn, text);
    }

    fn error(&self, text: &str) {
        self.message(Level::Error, text);
    }
}

/// Forwards messages to the `log` facade and ignores progress.
#[derive(Debug, Default)]
pub struct LogForwardingSink;

impl LogSink for LogForwardingSink {
    fn message(&self, level: Level, text: &str) {
        log::log!(target: "attach_migrator::session", level, "{}", text);
    }
}

/// Log forwarding plus a terminal progress bar for the transfer stage.
pub struct ConsoleSink {
    bar: ProgressBar,
}

impl ConsoleSink {
    pub fn new() -> Self {
        let bar = ProgressBar::new(100);
        if let Ok(style) = ProgressStyle::with_template("{prefix} [{bar:40}] {pos:>3}%") {
            bar.set_style(style.progress_chars("=> "));
        }
        bar.set_prefix("Transfer");
        Self { bar }
    }
}

impl Default for ConsoleSink {
    fn default() -> Self {
        Self::new()
    }
}

impl LogSink for ConsoleSink {
    fn message(&self, level: Level, text: &str) {
        LogForwardingSink.message(level, text);
    }

    fn progress(&self, percent: u8) {
        let percent = percent.min(100);
        self.bar.set_position(u64::from(percent));
        if percent == 100 {
            self.bar.finish_and_clear();
        }
    }
}

/// Keeps everything in memory; used by embedders that render their own UI.
#[derive(Debug, Default)]
pub struct CollectingSink {
    messages: Mutex<Vec<(Level, String)>>,
    progress: Mutex<Vec<u8>>,
}

impl CollectingSink {
    pub fn messages(&self) -> Vec<(Level, String)> {
        self.messages.lock().map(|m| m.clone()).unwrap_or_default()
    }

    pub fn progress_values(&self) -> Vec<u8> {
        self.progress.lock().map(|p| p.clone()).unwrap_or_default()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.messages().iter().any(|(_, m)| m.contains(needle))
    }
}

impl LogSink for CollectingSink {
    fn message(&self, level: Level, text: &str) {
        LogForwardingSink.message(level, text);
        if let Ok(mut m) = self.messages.lock() {
            m.push((level, text.to_string()));
        }
    }

    fn progress(&self, percent: u8) {
        if let Ok(mut p) = self.progress.lock() {
            p.push(percent);
        }
    }
}
