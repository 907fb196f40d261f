//! Plain-text rendering for the command-line front end.

mod format;

use std::fmt::Write;

pub use format::{format_bytes, format_eta};

use crate::core::OperationEvent;
use crate::core::models::{BackupRecord, ProgressEvent, Volume};

/// Files listed in a history detail view before the rest are summarized.
const DETAIL_FILE_LIMIT: usize = 50;

pub fn render_progress(event: &ProgressEvent) -> String {
    format!(
        "{:5.1}% {} (ETA {})",
        event.percent,
        event.message,
        format_eta(event.eta_secs)
    )
}

pub fn render_volumes(volumes: &[Volume]) -> String {
    if volumes.is_empty() {
        return "No removable volumes found\n".to_string();
    }

    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<16} {:<24} {:<8} {:>10} {:>10}",
        "LABEL", "MOUNT", "FS", "FREE", "TOTAL"
    );
    for volume in volumes {
        let _ = writeln!(
            out,
            "{:<16} {:<24} {:<8} {:>10} {:>10}",
            volume.label,
            volume.mount_point.display(),
            volume.filesystem,
            format_bytes(volume.free_bytes),
            format_bytes(volume.total_bytes),
        );
    }
    out
}

/// History listing, newest first and numbered from 1.
pub fn render_history(history: &[BackupRecord]) -> String {
    if history.is_empty() {
        return "No backup history available\n".to_string();
    }

    let mut out = String::new();
    for (index, record) in history.iter().rev().enumerate() {
        let _ = writeln!(
            out,
            "{:>3}  {}  {} -> {}  ({} files)",
            index + 1,
            record.created_at.format("%Y-%m-%d %H:%M:%S"),
            record.source.display(),
            record.backup_dir.display(),
            record.file_count(),
        );
    }
    out
}

/// Details for entry `number` of the listing produced by `render_history`.
pub fn render_history_detail(history: &[BackupRecord], number: usize) -> Option<String> {
    let index = history.len().checked_sub(number).filter(|_| number > 0)?;
    let record = &history[index];

    let mut out = String::new();
    let _ = writeln!(out, "Timestamp: {}", record.created_at.to_rfc3339());
    let _ = writeln!(out, "Source: {}", record.source.display());
    let _ = writeln!(out, "Backup Location: {}", record.backup_dir.display());
    let _ = writeln!(out, "\nFiles backed up ({}):\n", record.file_count());

    for file in record.files.iter().take(DETAIL_FILE_LIMIT) {
        let _ = writeln!(out, "{}", file.display());
    }

    if record.files.len() > DETAIL_FILE_LIMIT {
        let _ = writeln!(
            out,
            "\n...and {} more files",
            record.files.len() - DETAIL_FILE_LIMIT
        );
    }

    Some(out)
}

/// One status line per lifecycle event; `None` for events that are not
/// worth printing.
pub fn render_event(event: &OperationEvent) -> Option<String> {
    match event {
        OperationEvent::Started { kind, source } => {
            Some(format!("Starting {} from {}", kind, source))
        }
        OperationEvent::Progress { event, .. } => Some(render_progress(event)),
        OperationEvent::Completed { message, .. } => Some(message.clone()),
        OperationEvent::Failed { reason, .. } => Some(reason.clone()),
        OperationEvent::Rejected { running, .. } => Some(format!(
            "Another operation is already running ({})",
            running
        )),
        OperationEvent::Reset { .. } => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::{OperationKind, ProgressChannel};
    use chrono::Local;
    use std::path::PathBuf;

    fn record(dir: &str, files: usize) -> BackupRecord {
        BackupRecord {
            id: dir.to_string(),
            source: PathBuf::from("/media/SRC"),
            backup_dir: PathBuf::from(dir),
            created_at: Local::now(),
            files: (0..files).map(|i| PathBuf::from(format!("f{}.txt", i))).collect(),
        }
    }

    #[test]
    fn progress_line_has_percent_and_eta() {
        let event = ProgressEvent {
            percent: 42.0,
            message: "Copying to DST...".to_string(),
            eta_secs: 90.0,
            channel: ProgressChannel::Transfer,
        };
        assert_eq!(render_progress(&event), " 42.0% Copying to DST... (ETA 01:30)");
    }

    #[test]
    fn history_is_numbered_newest_first() {
        let history = vec![record("/t/old", 1), record("/t/new", 2)];
        let listing = render_history(&history);
        let first = listing.lines().next().unwrap();
        assert!(first.starts_with("  1"));
        assert!(first.contains("/t/new"));
    }

    #[test]
    fn detail_truncates_long_file_lists() {
        let history = vec![record("/t/big", 60), record("/t/small", 1)];

        let detail = render_history_detail(&history, 2).unwrap();
        assert!(detail.contains("Backup Location: /t/big"));
        assert!(detail.contains("Files backed up (60):"));
        assert!(detail.contains("f49.txt"));
        assert!(!detail.contains("f50.txt"));
        assert!(detail.contains("...and 10 more files"));

        assert!(render_history_detail(&history, 0).is_none());
        assert!(render_history_detail(&history, 3).is_none());
    }

    #[test]
    fn reset_events_are_silent() {
        let event = OperationEvent::Reset {
            kind: OperationKind::Sync,
            message: "Ready for next operation".to_string(),
        };
        assert!(render_event(&event).is_none());
    }
}
