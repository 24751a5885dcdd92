//! Dump journal command implementation.
//!
//! Reads the log without taking the store lock or repairing anything, so
//! it also works on a store another process has open.

use crate::Format;
use cachedb_core::{Frame, Journal, JournalEntry, Scan};
use cachedb_storage::FileBackend;
use serde::Serialize;
use std::path::Path;

/// Journal frame representation for output.
#[derive(Debug, Serialize)]
pub struct FrameInfo {
    /// Offset in the journal file.
    pub offset: u64,
    /// Framed length in bytes.
    pub len: u64,
    /// Frame type.
    pub frame_type: &'static str,
    /// Device id, for identity frames.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    /// Sequence number of the first change, for local frames.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_seq: Option<u64>,
    /// Number of changes carried.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub changes: Option<usize>,
    /// Acknowledged local sequence number.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sent_seq: Option<u64>,
    /// Remote cursor reached.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_cursor: Option<u64>,
    /// Sync flag value, for settings frames.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync_enabled: Option<bool>,
}

impl FrameInfo {
    /// Summarizes one journal entry.
    pub fn from_entry(entry: &JournalEntry) -> Self {
        let mut info = Self {
            offset: entry.offset,
            len: entry.len,
            frame_type: entry.frame.frame_type().name(),
            device_id: None,
            first_seq: None,
            changes: None,
            sent_seq: None,
            remote_cursor: None,
            sync_enabled: None,
        };
        match &entry.frame {
            Frame::Identity { device, .. } => info.device_id = Some(device.to_string()),
            Frame::Local { first_seq, changes } => {
                info.first_seq = Some(first_seq.get());
                info.changes = Some(changes.len());
            }
            Frame::RemoteApplied {
                changes,
                remote_cursor,
            } => {
                info.changes = Some(changes.len());
                info.remote_cursor = Some(*remote_cursor);
            }
            Frame::Cursor {
                sent_seq,
                remote_cursor,
            } => {
                info.sent_seq = Some(sent_seq.get());
                info.remote_cursor = Some(*remote_cursor);
            }
            Frame::Settings { sync_enabled } => info.sync_enabled = Some(*sync_enabled),
        }
        info
    }
}

/// Journal dump output.
#[derive(Debug, Serialize)]
pub struct DumpResult {
    /// Listed frames.
    pub frames: Vec<FrameInfo>,
    /// Frames in the journal, listed or not.
    pub total: usize,
    /// Offset of a torn trailing frame.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub torn_at: Option<u64>,
}

/// Lists up to `limit` frames of a scanned journal.
pub fn summarize(scan: &Scan, limit: Option<usize>) -> DumpResult {
    DumpResult {
        frames: scan
            .entries
            .iter()
            .take(limit.unwrap_or(usize::MAX))
            .map(FrameInfo::from_entry)
            .collect(),
        total: scan.entries.len(),
        torn_at: scan.torn_at,
    }
}

/// Runs the dump-journal command.
pub fn run(path: &Path, limit: Option<usize>, format: Format) -> Result<(), Box<dyn std::error::Error>> {
    let journal_path = path.join("journal.log");
    if !journal_path.exists() {
        return Err(format!("no journal found at {}", journal_path.display()).into());
    }

    let journal = Journal::new(Box::new(FileBackend::open(&journal_path)?), false);
    let result = summarize(&journal.scan()?, limit);

    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&result)?),
        Format::Text => print_text_output(&result),
    }
    Ok(())
}

fn print_text_output(result: &DumpResult) {
    for frame in &result.frames {
        let mut line = format!("{:>10}  {:<14} {:>6}B", frame.offset, frame.frame_type, frame.len);
        if let Some(device) = &frame.device_id {
            line.push_str(&format!("  device={device}"));
        }
        if let Some(seq) = frame.first_seq {
            line.push_str(&format!("  first_seq={seq}"));
        }
        if let Some(changes) = frame.changes {
            line.push_str(&format!("  changes={changes}"));
        }
        if let Some(seq) = frame.sent_seq {
            line.push_str(&format!("  sent_seq={seq}"));
        }
        if let Some(cursor) = frame.remote_cursor {
            line.push_str(&format!("  remote_cursor={cursor}"));
        }
        if let Some(enabled) = frame.sync_enabled {
            line.push_str(&format!("  sync_enabled={enabled}"));
        }
        println!("{line}");
    }
    if result.frames.len() < result.total {
        println!("... {} more frames", result.total - result.frames.len());
    }
    if let Some(offset) = result.torn_at {
        println!("torn frame at offset {offset}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cachedb_core::{Config, Inventory};
    use tempfile::tempdir;

    #[tokio::test]
    async fn lists_frames_in_order() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("store");
        {
            let inventory = Inventory::open(Config::directory(&path)).await.unwrap();
            inventory.create_tag("Fragile", None).await.unwrap();
            inventory.set_sync_enabled(true).await.unwrap();
        }

        let journal = Journal::new(Box::new(FileBackend::open(&path.join("journal.log")).unwrap()), false);
        let result = summarize(&journal.scan().unwrap(), None);
        let types: Vec<_> = result.frames.iter().map(|f| f.frame_type).collect();
        assert_eq!(types, ["identity", "local", "settings"]);
        assert_eq!(result.frames[1].first_seq, Some(1));
        assert_eq!(result.frames[1].changes, Some(1));
        assert_eq!(result.frames[2].sync_enabled, Some(true));

        let limited = summarize(&journal.scan().unwrap(), Some(1));
        assert_eq!(limited.frames.len(), 1);
        assert_eq!(limited.total, 3);
    }
}
