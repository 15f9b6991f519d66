use std::io::Write;
use std::path::Path;

use crate::model::AuditEntry;

/// Append one entry as a single JSON line.
///
/// The file is opened in append mode (created if absent) and the whole line
/// is written in one call, so concurrent completions from different worker
/// threads do not interleave inside a line. Existing lines are never
/// rewritten.
pub fn append_entry(path: &Path, entry: &AuditEntry) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| e.to_string())?;
    }
    let line = serde_json::to_string(entry).map_err(|e| e.to_string())? + "\n";
    let mut f = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| e.to_string())?;
    f.write_all(line.as_bytes()).map_err(|e| e.to_string())
}

/// Read up to `limit` entries, newest first.
///
/// Malformed lines are skipped so corruption in one line never fails the
/// read of the rest. A missing file reads as empty history.
pub fn read_recent(path: &Path, limit: usize) -> Result<Vec<AuditEntry>, String> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let raw = std::fs::read_to_string(path).map_err(|e| e.to_string())?;

    let mut out = Vec::new();
    for line in raw.lines().rev() {
        if line.trim().is_empty() {
            continue;
        }
        if let Ok(entry) = serde_json::from_str::<AuditEntry>(line) {
            out.push(entry);
            if out.len() >= limit {
                break;
            }
        }
    }
    Ok(out)
}
