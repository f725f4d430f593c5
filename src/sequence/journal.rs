//! Execution log of one sequence run.
//!
//! Every entry is also forwarded to the `log` facade at the matching level,
//! so the journal and the process log tell the same story.

use core::fmt;
use std::time::Instant;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Level {
    Debug,
    Info,
    Success,
    Warning,
    Error,
}

impl Level {
    fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Success => "SUCCESS",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
        }
    }

    fn facade(self) -> log::Level {
        match self {
            Self::Debug => log::Level::Debug,
            Self::Info | Self::Success => log::Level::Info,
            Self::Warning => log::Level::Warn,
            Self::Error => log::Level::Error,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    System,
    Sequence,
    Step,
    Hardware,
    User,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogEntry {
    pub id: u64,
    /// Since the sequence was loaded.
    pub elapsed_ms: u64,
    pub level: Level,
    pub category: Category,
    /// Zero-based index of the step this entry belongs to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_index: Option<usize>,
    pub message: String,
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.elapsed_ms / 1000;
        let millis = self.elapsed_ms % 1000;
        write!(f, "[{secs:>4}.{millis:03}s] {}", self.level.as_str())?;
        if let Some(i) = self.step_index {
            write!(f, " step {}", i + 1)?;
        }
        write!(f, ": {}", self.message)
    }
}

#[derive(Debug)]
pub struct Journal {
    epoch: Instant,
    next_id: u64,
    entries: Vec<LogEntry>,
}

impl Default for Journal {
    fn default() -> Self {
        Self::new()
    }
}

impl Journal {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            next_id: 1,
            entries: Vec::new(),
        }
    }

    pub fn push(&mut self, level: Level, category: Category, step_index: Option<usize>, message: String) {
        let entry = LogEntry {
            id: self.next_id,
            elapsed_ms: self.epoch.elapsed().as_millis() as u64,
            level,
            category,
            step_index,
            message,
        };
        self.next_id += 1;
        log::log!(target: "laserroom::sequence", level.facade(), "{entry}");
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }
}
