// src/callbacks.rs

//! Bridge from engine callbacks to the event channel
//!
//! The engine calls into `CallbackBridge` synchronously while it prepares and
//! commits. Every raw log line goes to the diagnostic log; phase
//! notifications and progress become events for the consumer.

use crate::engine::{EngineCallbacks, EngineEvent, LogLevel, ProgressKind, Question};
use crate::error::Result;
use crate::events::EventSender;
use crate::progress::ProgressTracker;
use std::fs::File;
use std::io::{LineWriter, Write};
use std::path::Path;
use tracing::{debug, error, trace, warn};

/// Engine log lines that are noise, not problems
const BENIGN_LOG_LINES: &[&str] = &[
    "error 0",
    "error 31 from alpm_db_get_pkg",
    "error 32",
    "extracting",
    "extract: skipping dir extraction",
    "command failed to execute correctly",
    "loading package data for",
];

/// Whether an engine log line is known noise
pub fn is_benign(line: &str) -> bool {
    BENIGN_LOG_LINES.iter().any(|pattern| line.contains(pattern))
}

/// Status line for an engine phase; `None` for phases reported elsewhere or not at all
pub fn event_text(event: EngineEvent) -> Option<&'static str> {
    match event {
        EngineEvent::CheckDepsStart => Some("Checking dependencies..."),
        EngineEvent::FileConflictsStart => Some("Checking file conflicts..."),
        EngineEvent::ResolveDepsStart => Some("Resolving dependencies..."),
        EngineEvent::InterConflictsStart => Some("Checking inter conflicts..."),
        EngineEvent::IntegrityStart => Some("Checking integrity..."),
        EngineEvent::LoadStart => Some("Loading packages..."),
        EngineEvent::DeltaIntegrityStart => Some("Checking target delta's integrity..."),
        EngineEvent::DeltaPatchesStart => Some("Applying deltas to packages..."),
        EngineEvent::DeltaPatchStart => Some("Applying delta patch to target package..."),
        EngineEvent::RetrieveStart => Some("Downloading files from the repository..."),
        EngineEvent::DiskspaceStart => Some("Checking disk space..."),
        EngineEvent::KeyringStart => Some("Checking keys in keyring..."),
        EngineEvent::KeyDownloadStart => Some("Downloading missing keys into the keyring..."),
        // Narrated per package by the progress callback
        EngineEvent::PackageOperationStart => None,
        _ => None,
    }
}

fn level_name(level: LogLevel) -> &'static str {
    match level {
        LogLevel::Error => "ERROR",
        LogLevel::Warning => "WARNING",
        LogLevel::Debug => "DEBUG",
        LogLevel::Function => "FUNCTION",
    }
}

/// Raw engine log for post-mortem use
///
/// Truncated when opened, then appended to line by line. Every engine line is
/// written here whatever the filtering decision.
pub struct DiagnosticLog {
    file: Option<LineWriter<File>>,
}

impl DiagnosticLog {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = File::create(path)?;
        debug!("Writing engine diagnostics to {}", path.display());
        Ok(Self {
            file: Some(LineWriter::new(file)),
        })
    }

    /// A log that forwards lines to `tracing` instead of a file
    pub fn disabled() -> Self {
        Self { file: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.file.is_some()
    }

    pub fn write(&mut self, level: LogLevel, line: &str) {
        let Some(file) = self.file.as_mut() else {
            trace!("[{}] {}", level_name(level), line);
            return;
        };

        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
        if let Err(e) = writeln!(file, "{} [{}] {}", timestamp, level_name(level), line) {
            warn!("Failed to write diagnostic log: {}", e);
            self.file = None;
        }
    }
}

/// Engine callbacks that report through an `EventSender`
pub struct CallbackBridge {
    tracker: ProgressTracker,
    events: EventSender,
    diagnostics: DiagnosticLog,
}

impl CallbackBridge {
    pub fn new(events: EventSender, diagnostics: DiagnosticLog) -> Self {
        Self {
            tracker: ProgressTracker::new(),
            events,
            diagnostics,
        }
    }

    pub fn tracker(&self) -> &ProgressTracker {
        &self.tracker
    }

    pub fn tracker_mut(&mut self) -> &mut ProgressTracker {
        &mut self.tracker
    }

    /// Send a fatal error event; terminates the process
    #[track_caller]
    pub fn fatal(&mut self, text: impl Into<String>) {
        self.events.fatal(text);
    }

    fn send_all(&mut self, events: Vec<crate::events::Event>) {
        for event in events {
            self.events.send(event);
        }
    }
}

impl EngineCallbacks for CallbackBridge {
    fn log(&mut self, level: LogLevel, line: &str) {
        let line = line.trim_end();
        self.diagnostics.write(level, line);

        if is_benign(line) {
            return;
        }

        match level {
            LogLevel::Error => error!("{}", line),
            // Engine text is not reliably in the user's language
            LogLevel::Warning => debug!("{}", line),
            LogLevel::Debug | LogLevel::Function => trace!("{}", line),
        }
    }

    fn event(&mut self, event: EngineEvent) {
        if let Some(text) = event_text(event) {
            self.events.info(text);
        }
    }

    fn question(&mut self, question: &Question) -> bool {
        let answer = question.default_answer();
        debug!("Engine asked {:?}, answering {}", question, answer);
        answer
    }

    fn progress(
        &mut self,
        kind: ProgressKind,
        target: Option<&str>,
        percent: u32,
        total: usize,
        current: usize,
    ) {
        let events = self.tracker.operation(kind, target, percent, total, current);
        self.send_all(events);
    }

    fn download(&mut self, filename: &str, transferred: u64, total: u64) {
        let events = self.tracker.download(filename, transferred, total);
        self.send_all(events);
    }

    fn total_download(&mut self, total: u64) {
        self.tracker.set_total_download_size(total);
    }
}
