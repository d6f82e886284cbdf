// src/progress.rs

//! Download and operation progress tracking
//!
//! Turns raw engine callbacks into `info` and `percent` events. Per-file
//! state resets whenever a new file name or total size shows up; the
//! transaction-wide counters live as long as the tracker.

use crate::engine::ProgressKind;
use crate::events::Event;
use tracing::debug;

/// Suffixes of sync database index files
const DATABASE_SUFFIXES: &[&str] = &[".db", ".files"];

/// Suffixes of package archives
const PACKAGE_SUFFIXES: &[&str] = &[
    ".pkg.tar.zst",
    ".pkg.tar.xz",
    ".pkg.tar.gz",
    ".pkg.tar",
];

/// What a downloaded file is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadKind {
    Database,
    Package,
}

/// Classify a download by suffix and strip the suffix for display
///
/// Files with an unrecognized suffix are treated as database indexes when no
/// package download size is known for the transaction, and as packages
/// otherwise.
pub fn classify_download(filename: &str, total_download_size: u64) -> (DownloadKind, &str) {
    for suffix in DATABASE_SUFFIXES {
        if let Some(stem) = filename.strip_suffix(suffix) {
            return (DownloadKind::Database, stem);
        }
    }
    for suffix in PACKAGE_SUFFIXES {
        if let Some(stem) = filename.strip_suffix(suffix) {
            return (DownloadKind::Package, stem);
        }
    }

    if total_download_size == 0 {
        (DownloadKind::Database, filename)
    } else {
        (DownloadKind::Package, filename)
    }
}

/// Progress estimate for a stream of unknown size
///
/// `(ln(1 + KiB))^2 / 200` keeps moving as bytes arrive. Capped at
/// `UNSIZED_PROGRESS_CAP` so an unsized stream never reports completion.
pub fn unsized_progress(transferred: u64) -> f64 {
    let kib = transferred as f64 / 1024.0;
    ((1.0 + kib).ln().powi(2) / 200.0).min(UNSIZED_PROGRESS_CAP)
}

/// Highest value reported for a stream of unknown size
pub const UNSIZED_PROGRESS_CAP: f64 = 0.99;

/// State of the file currently being downloaded
#[derive(Debug, Clone, PartialEq)]
struct FileProgress {
    filename: String,
    total: u64,
    last_progress: f64,
}

#[derive(Debug, Default)]
pub struct ProgressTracker {
    current: Option<FileProgress>,
    total_packages: usize,
    downloaded_packages: usize,
    total_download_size: u64,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of packages the current transaction expects to fetch
    pub fn set_total_packages(&mut self, total: usize) {
        self.total_packages = total;
    }

    pub fn total_packages(&self) -> usize {
        self.total_packages
    }

    /// Package archives seen so far
    pub fn downloaded_packages(&self) -> usize {
        self.downloaded_packages
    }

    pub fn set_total_download_size(&mut self, total: u64) {
        debug!("Total download size: {} bytes", total);
        self.total_download_size = total;
    }

    pub fn total_download_size(&self) -> u64 {
        self.total_download_size
    }

    /// Handle a per-file download callback
    pub fn download(&mut self, filename: &str, transferred: u64, total: u64) -> Vec<Event> {
        let is_new_file = match &self.current {
            Some(current) => current.filename != filename || current.total != total,
            None => true,
        };

        if is_new_file {
            self.current = Some(FileProgress {
                filename: filename.to_string(),
                total,
                last_progress: 0.0,
            });

            let (kind, stem) = classify_download(filename, self.total_download_size);
            let text = match kind {
                DownloadKind::Database => format!("Updating {} database", stem),
                DownloadKind::Package => {
                    self.downloaded_packages += 1;
                    debug!(
                        "Downloading package {} of {}",
                        self.downloaded_packages, self.total_packages
                    );
                    format!("Downloading {}...", stem)
                }
            };

            return vec![Event::info(text), Event::percent(0.0)];
        }

        let Some(current) = self.current.as_mut() else {
            return Vec::new();
        };

        let progress = if current.total > 0 {
            transferred as f64 / current.total as f64
        } else {
            unsized_progress(transferred)
        };

        if progress > current.last_progress {
            current.last_progress = progress;
            vec![Event::percent(progress)]
        } else {
            Vec::new()
        }
    }

    /// Handle a per-operation progress callback
    pub fn operation(
        &mut self,
        kind: ProgressKind,
        target: Option<&str>,
        percent: u32,
        total: usize,
        current: usize,
    ) -> Vec<Event> {
        match target {
            Some(target) if total > 0 => {
                let text = format!("{} {} ({}/{})", kind.verb(), target, current, total);
                vec![
                    Event::info(text),
                    Event::percent(current as f64 / total as f64),
                ]
            }
            _ => vec![Event::percent(f64::from(percent) / 100.0)],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;

    #[test]
    fn test_classify_download() {
        assert_eq!(
            classify_download("core.db", 0),
            (DownloadKind::Database, "core")
        );
        assert_eq!(
            classify_download("pkg-1.0.pkg.tar.xz", 100),
            (DownloadKind::Package, "pkg-1.0")
        );
        assert_eq!(
            classify_download("pkg-1.0-1-x86_64.pkg.tar.zst", 0),
            (DownloadKind::Package, "pkg-1.0-1-x86_64")
        );
        assert_eq!(
            classify_download("mystery.bin", 0),
            (DownloadKind::Database, "mystery.bin")
        );
        assert_eq!(
            classify_download("mystery.bin", 10),
            (DownloadKind::Package, "mystery.bin")
        );
    }

    #[test]
    fn test_download_sequence() {
        let mut tracker = ProgressTracker::new();
        tracker.set_total_download_size(1000);

        let events = tracker.download("pkg-1.0.pkg.tar.xz", 0, 1000);
        assert_eq!(
            events,
            vec![Event::info("Downloading pkg-1.0..."), Event::percent(0.0)]
        );
        assert_eq!(events[1].text, "0.00");

        let events = tracker.download("pkg-1.0.pkg.tar.xz", 500, 1000);
        assert_eq!(events, vec![Event::percent(0.5)]);
        assert_eq!(events[0].text, "0.50");

        assert!(tracker.download("pkg-1.0.pkg.tar.xz", 500, 1000).is_empty());
        assert_eq!(tracker.downloaded_packages(), 1);
    }

    #[test]
    fn test_progress_never_regresses() {
        let mut tracker = ProgressTracker::new();
        tracker.download("a.pkg.tar.zst", 0, 100);
        assert_eq!(tracker.download("a.pkg.tar.zst", 60, 100).len(), 1);
        assert!(tracker.download("a.pkg.tar.zst", 40, 100).is_empty());
        assert_eq!(
            tracker.download("a.pkg.tar.zst", 100, 100),
            vec![Event::percent(1.0)]
        );
    }

    #[test]
    fn test_new_total_resets_file() {
        let mut tracker = ProgressTracker::new();
        tracker.set_total_download_size(10);
        tracker.download("a.pkg.tar.zst", 0, 100);
        tracker.download("a.pkg.tar.zst", 90, 100);

        let events = tracker.download("a.pkg.tar.zst", 0, 200);
        assert_eq!(events.len(), 2);
        assert_eq!(events[1], Event::percent(0.0));
        assert_eq!(tracker.downloaded_packages(), 2);
    }

    #[test]
    fn test_database_download_label() {
        let mut tracker = ProgressTracker::new();
        let events = tracker.download("core.db", 0, 0);
        assert_eq!(events[0], Event::info("Updating core database"));
        assert_eq!(tracker.downloaded_packages(), 0);
    }

    #[test]
    fn test_unsized_download_uses_heuristic() {
        let mut tracker = ProgressTracker::new();
        tracker.download("extra.db", 0, 0);

        let events = tracker.download("extra.db", 1024 * 100, 0);
        assert_eq!(events.len(), 1);
        let value: f64 = events[0].text.parse().unwrap();
        let expected = (101f64).ln().powi(2) / 200.0;
        assert!((value - expected).abs() < 0.01);

        assert!(unsized_progress(1024 * 1024) < 1.0);
        assert!(unsized_progress(2048) > unsized_progress(1024));
        assert_eq!(unsized_progress(2 * 1024 * 1024 * 1024), UNSIZED_PROGRESS_CAP);
        assert_eq!(unsized_progress(u64::MAX), UNSIZED_PROGRESS_CAP);
    }

    #[test]
    fn test_operation_with_target() {
        let mut tracker = ProgressTracker::new();
        let events = tracker.operation(ProgressKind::Install, Some("bash"), 0, 4, 1);
        assert_eq!(
            events,
            vec![Event::info("Installing bash (1/4)"), Event::percent(0.25)]
        );
    }

    #[test]
    fn test_operation_without_target() {
        let mut tracker = ProgressTracker::new();
        let events = tracker.operation(ProgressKind::IntegrityCheck, None, 42, 0, 0);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Percent);
        assert_eq!(events[0].text, "0.42");
    }

    #[test]
    fn test_operation_remove_verb() {
        let mut tracker = ProgressTracker::new();
        let events = tracker.operation(ProgressKind::Remove, Some("vim"), 100, 2, 2);
        assert_eq!(events[0], Event::info("Removing vim (2/2)"));
        assert_eq!(events[1].text, "1.00");
    }
}
