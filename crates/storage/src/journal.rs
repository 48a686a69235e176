//! Append-only JSON-lines journal backing the durable operation log.
//!
//! Every state change writes the full record as one line. On open the file is
//! replayed and the last line per key wins. A torn final line (crash during a
//! write) is skipped with a warning.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::error::StorageError;
use crate::record::{IdempotencyKey, LedgerOperation};

pub(crate) struct Journal {
    path: PathBuf,
    file: Arc<Mutex<File>>,
}

impl Journal {
    /// Open (creating if needed) the journal at `path` and replay it.
    pub(crate) fn open(
        path: &Path,
    ) -> Result<(Journal, HashMap<IdempotencyKey, LedgerOperation>), StorageError> {
        let mut replayed = HashMap::new();
        let mut torn_tail = false;
        if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            torn_tail = !contents.is_empty() && !contents.ends_with('\n');
            for (lineno, line) in contents.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<LedgerOperation>(line) {
                    Ok(op) => {
                        replayed.insert(op.key.clone(), op);
                    }
                    Err(e) => {
                        tracing::warn!(
                            path = %path.display(),
                            line = lineno + 1,
                            error = %e,
                            "skipping unreadable journal line"
                        );
                    }
                }
            }
        }

        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        if torn_tail {
            // Terminate the partial line so the next record starts cleanly.
            file.write_all(b"\n")?;
        }
        tracing::debug!(path = %path.display(), operations = replayed.len(), "journal opened");
        Ok((
            Journal {
                path: path.to_path_buf(),
                file: Arc::new(Mutex::new(file)),
            },
            replayed,
        ))
    }

    /// Append the current form of `op`. The write runs on the blocking
    /// pool; callers serialize appends for one key themselves.
    pub(crate) async fn append(&self, op: &LedgerOperation) -> Result<(), StorageError> {
        let mut line = serde_json::to_string(op)?;
        line.push('\n');
        let file = Arc::clone(&self.file);
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<(), StorageError> {
            let mut file = file.lock().map_err(|_| {
                StorageError::Backend(format!("journal lock poisoned: {}", path.display()))
            })?;
            file.write_all(line.as_bytes())?;
            file.flush()?;
            Ok(())
        })
        .await
        .map_err(|e| StorageError::Backend(format!("journal write task failed: {}", e)))?
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }
}

/// Read every record in a journal without opening it for writing.
///
/// Used by operator tooling to inspect a log file offline.
pub fn read_journal(path: &Path) -> Result<Vec<LedgerOperation>, StorageError> {
    if !path.exists() {
        return Err(StorageError::Backend(format!(
            "journal not found: {}",
            path.display()
        )));
    }
    let reader = BufReader::new(File::open(path)?);
    let mut latest: HashMap<IdempotencyKey, LedgerOperation> = HashMap::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        if let Ok(op) = serde_json::from_str::<LedgerOperation>(&line) {
            latest.insert(op.key.clone(), op);
        }
    }
    let mut ops: Vec<LedgerOperation> = latest.into_values().collect();
    ops.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.key.cmp(&b.key)));
    Ok(ops)
}
