// log.rs — Append-only JSONL decision log.
//
// One JSON record per line. Each record carries the SHA-256 of the previous
// line in `previous_hash`, so inserting, deleting or editing a line breaks
// the chain and `verify_chain` reports where.
//
// The writer sits behind a mutex: the adapter appends from many request
// threads at once, and the chain requires appends to be serialized.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::error::AuditError;
use crate::event::DecisionRecord;
use crate::hasher;

struct Writer {
    out: BufWriter<File>,
    /// Hash of the last line written.
    last_hash: Option<String>,
}

/// An append-only decision log backed by a JSONL file.
pub struct AuditLog {
    writer: Mutex<Writer>,
    path: PathBuf,
}

impl AuditLog {
    /// Open (or create) a log, recovering the chain head from existing content.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AuditError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|source| AuditError::OpenFailed {
                    path: path.clone(),
                    source,
                })?;
            }
        }

        let last_hash = if path.exists() {
            Self::read_last_hash(&path)?
        } else {
            None
        };

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| AuditError::OpenFailed {
                path: path.clone(),
                source,
            })?;

        tracing::debug!(
            path = %path.display(),
            resumed = last_hash.is_some(),
            "opened decision log"
        );
        Ok(Self {
            writer: Mutex::new(Writer {
                out: BufWriter::new(file),
                last_hash,
            }),
            path,
        })
    }

    /// Link the record to the chain, write it, and flush.
    pub fn append(&self, record: &mut DecisionRecord) -> Result<(), AuditError> {
        let mut writer = self.writer.lock();
        record.previous_hash = writer.last_hash.clone();
        let json = serde_json::to_string(record)?;
        writeln!(writer.out, "{}", json)?;
        writer.out.flush()?;
        writer.last_hash = Some(hasher::hash_str(&json));
        Ok(())
    }

    /// Read every record, oldest first. Blank lines are skipped.
    pub fn read_all(path: impl AsRef<Path>) -> Result<Vec<DecisionRecord>, AuditError> {
        let reader = Self::reader(path.as_ref())?;
        let mut records = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            records.push(serde_json::from_str(&line)?);
        }
        Ok(records)
    }

    /// Check every `previous_hash` against the hash of the line before it.
    pub fn verify_chain(path: impl AsRef<Path>) -> Result<bool, AuditError> {
        let reader = Self::reader(path.as_ref())?;
        let mut previous_hash: Option<String> = None;

        for (line_num, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record: DecisionRecord = serde_json::from_str(&line)?;
            if record.previous_hash != previous_hash {
                tracing::warn!(path = %path.as_ref().display(), line = line_num + 1, "decision log chain is broken");
                return Err(AuditError::IntegrityViolation {
                    line: line_num + 1,
                    expected: previous_hash.unwrap_or_else(|| "None".to_string()),
                    actual: record.previous_hash.unwrap_or_else(|| "None".to_string()),
                });
            }
            // Hash the raw line; re-serializing could reorder fields.
            previous_hash = Some(hasher::hash_str(&line));
        }
        Ok(true)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn reader(path: &Path) -> Result<BufReader<File>, AuditError> {
        let file = File::open(path).map_err(|source| AuditError::OpenFailed {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(BufReader::new(file))
    }

    fn read_last_hash(path: &Path) -> Result<Option<String>, AuditError> {
        let mut last_line: Option<String> = None;
        for line in Self::reader(path)?.lines() {
            let line = line?;
            if !line.trim().is_empty() {
                last_line = Some(line);
            }
        }
        Ok(last_line.map(|line| hasher::hash_str(&line)))
    }
}
