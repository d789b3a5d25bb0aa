//! Encoding of event-info and pattern-chunk blobs.
//!
//! Event info is a single JSON document. Chunks hold one [`PatternRecord`]
//! per line.

use pattern_core::{Pattern, PatternRecord, UserAndEventsInfo};

use crate::{StorageError, StorageResult};

pub fn encode_event_info(info: &UserAndEventsInfo) -> StorageResult<Vec<u8>> {
    serde_json::to_vec(info).map_err(|source| StorageError::Encode {
        what: "event info".to_string(),
        source,
    })
}

pub fn decode_event_info(path: &str, bytes: &[u8]) -> StorageResult<UserAndEventsInfo> {
    serde_json::from_slice(bytes.trim_ascii()).map_err(|err| StorageError::Decode {
        path: path.to_string(),
        line: err.line(),
        reason: err.to_string(),
    })
}

pub fn encode_patterns(patterns: &[Pattern]) -> StorageResult<Vec<u8>> {
    let mut out = Vec::new();
    for pattern in patterns {
        let record = PatternRecord::from(pattern.clone());
        serde_json::to_writer(&mut out, &record).map_err(|source| StorageError::Encode {
            what: format!("pattern {:?}", pattern.event_names),
            source,
        })?;
        out.push(b'\n');
    }
    Ok(out)
}

/// Blank lines are skipped; the first malformed line fails the whole chunk.
pub fn decode_patterns(path: &str, bytes: &[u8]) -> StorageResult<Vec<Pattern>> {
    let mut patterns = Vec::new();
    for (idx, line) in bytes.split(|byte| *byte == b'\n').enumerate() {
        let line = line.trim_ascii();
        if line.is_empty() {
            continue;
        }
        let record: PatternRecord = serde_json::from_slice(line).map_err(|err| StorageError::Decode {
            path: path.to_string(),
            line: idx + 1,
            reason: err.to_string(),
        })?;
        patterns.push(record.pattern);
    }
    Ok(patterns)
}
