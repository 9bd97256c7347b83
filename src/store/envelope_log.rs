//! Append-only JSONL journal of inter-agent envelopes, one per session.
//!
//! Every append is flushed to disk before the assigned sequence is
//! returned, so a mutation is never acknowledged ahead of its journal
//! entry. Truncation is never performed while a session is live.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use crate::error::{OrchestratorError, Result};
use crate::model::{Envelope, PayloadType};

pub struct EnvelopeLog {
    path: PathBuf,
    next_sequence: u64,
}

impl EnvelopeLog {
    /// Open (or create) the journal for a session, scanning any existing
    /// tail to recover the next sequence number.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let next_sequence = if path.exists() {
            last_sequence(&path)?.map(|s| s + 1).unwrap_or(1)
        } else {
            1
        };
        Ok(Self {
            path,
            next_sequence,
        })
    }

    /// Validate, assign the next sequence, append, and flush. Returns the
    /// assigned sequence.
    pub fn append(&mut self, mut envelope: Envelope) -> Result<u64> {
        envelope.validate()?;
        envelope.sequence = self.next_sequence;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let line = serde_json::to_string(&envelope)?;
        writeln!(file, "{line}")?;
        file.flush()?;
        file.sync_data()
            .map_err(|e| OrchestratorError::Storage(format!("journal sync failed: {e}")))?;

        self.next_sequence += 1;
        Ok(envelope.sequence)
    }

    /// All envelopes in sequence order.
    pub fn read_all(&self) -> Result<Vec<Envelope>> {
        read_envelopes(&self.path)
    }

    /// Envelopes with sequence strictly greater than the given one.
    pub fn read_after(&self, sequence: u64) -> Result<Vec<Envelope>> {
        Ok(read_envelopes(&self.path)?
            .into_iter()
            .filter(|e| e.sequence > sequence)
            .collect())
    }

    /// Envelopes of one payload type, in order.
    pub fn read_by_type(&self, payload_type: PayloadType) -> Result<Vec<Envelope>> {
        Ok(read_envelopes(&self.path)?
            .into_iter()
            .filter(|e| e.payload_type == payload_type)
            .collect())
    }
}

fn read_envelopes(path: &Path) -> Result<Vec<Envelope>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let reader = BufReader::new(File::open(path)?);
    let mut envelopes = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        envelopes.push(serde_json::from_str::<Envelope>(&line)?);
    }
    Ok(envelopes)
}

fn last_sequence(path: &Path) -> Result<Option<u64>> {
    Ok(read_envelopes(path)?.last().map(|e| e.sequence))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn envelope(payload_type: PayloadType) -> Envelope {
        Envelope::new(
            "s1",
            "orchestrator",
            "worker",
            payload_type,
            serde_json::json!({"n": 1}),
        )
    }

    #[test]
    fn sequences_are_monotone_and_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("events.jsonl");

        let mut log = EnvelopeLog::open(&path).unwrap();
        assert_eq!(log.append(envelope(PayloadType::Instruction)).unwrap(), 1);
        assert_eq!(log.append(envelope(PayloadType::Report)).unwrap(), 2);
        drop(log);

        let mut log = EnvelopeLog::open(&path).unwrap();
        assert_eq!(log.append(envelope(PayloadType::Review)).unwrap(), 3);
        assert_eq!(log.read_all().unwrap().len(), 3);
        assert_eq!(log.read_after(1).unwrap().len(), 2);
    }

    #[test]
    fn append_rejects_invalid_envelopes() {
        let dir = tempdir().unwrap();
        let mut log = EnvelopeLog::open(dir.path().join("events.jsonl")).unwrap();
        let mut bad = envelope(PayloadType::Error);
        bad.session_id.clear();
        assert!(matches!(
            log.append(bad),
            Err(OrchestratorError::ValidationFailed(_))
        ));
    }

    #[test]
    fn read_by_type_filters() {
        let dir = tempdir().unwrap();
        let mut log = EnvelopeLog::open(dir.path().join("events.jsonl")).unwrap();
        log.append(envelope(PayloadType::Instruction)).unwrap();
        log.append(envelope(PayloadType::ProgressEvent)).unwrap();
        log.append(envelope(PayloadType::ProgressEvent)).unwrap();
        assert_eq!(
            log.read_by_type(PayloadType::ProgressEvent).unwrap().len(),
            2
        );
    }
}
