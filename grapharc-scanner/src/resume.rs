//! Rebuilds crawl state from a partially written JSON-lines output file.
//!
//! The first record is the root and must carry `metadata.type`. Replaying the
//! records in file order through the same discovery rules as a live crawl
//! leaves exactly the nodes the interrupted run had queued but not emitted.

use crate::crawler::{CrawlState, CrawlTask, TraversalPolicy, discover_connections};
use crate::definition::DefinitionRegistry;
use crate::error::{Result, ScanError};
use indexmap::IndexMap;
use serde_json::Value;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::Path;
use tracing::{debug, info, warn};

/// Crawl state replayed from an output file, and where its last record ends.
#[derive(Debug)]
pub struct Checkpoint {
    pub state: CrawlState,
    /// Byte length of the input up to the end of the last parsed record.
    pub valid_len: u64,
    /// Whether the last parsed record was followed by a newline.
    pub terminated: bool,
}

impl Checkpoint {
    /// Cuts `path` back to the last parsed record and terminates it, so
    /// appended records start on a line of their own.
    pub fn repair(&self, path: &Path) -> Result<()> {
        let mut file = OpenOptions::new().write(true).open(path)?;
        let len = file.metadata()?.len();
        if len > self.valid_len {
            warn!(
                "Truncating {} from {} to {} bytes",
                path.display(),
                len,
                self.valid_len
            );
            file.set_len(self.valid_len)?;
        }
        if !self.terminated {
            file.seek(SeekFrom::End(0))?;
            file.write_all(b"\n")?;
        }
        file.flush()?;
        Ok(())
    }
}

/// Rebuilds the crawl state from `path` and repairs a partial final record
/// so the file can be appended to.
pub fn rebuild_state_from_path(
    path: impl AsRef<Path>,
    registry: &DefinitionRegistry,
    policy: &TraversalPolicy,
) -> Result<CrawlState> {
    let path = path.as_ref();
    let file = File::open(path)?;
    info!("Resuming crawl from {}", path.display());
    let checkpoint = rebuild_checkpoint(BufReader::new(file), registry, policy)?;
    checkpoint.repair(path)?;
    Ok(checkpoint.state)
}

pub fn rebuild_state<R: BufRead>(
    reader: R,
    registry: &DefinitionRegistry,
    policy: &TraversalPolicy,
) -> Result<CrawlState> {
    rebuild_checkpoint(reader, registry, policy).map(|checkpoint| checkpoint.state)
}

pub fn rebuild_checkpoint<R: BufRead>(
    mut reader: R,
    registry: &DefinitionRegistry,
    policy: &TraversalPolicy,
) -> Result<Checkpoint> {
    let mut pending: IndexMap<String, CrawlTask> = IndexMap::new();
    let mut visited: HashMap<String, String> = HashMap::new();
    let mut replayed = 0usize;
    // A half-written final line is expected after an interruption.
    let mut unparsable: Option<(usize, serde_json::Error)> = None;

    let mut line = String::new();
    let mut line_number = 0usize;
    let mut offset = 0u64;
    let mut valid_len = 0u64;
    let mut terminated = true;

    loop {
        line.clear();
        let read = reader.read_line(&mut line)?;
        if read == 0 {
            break;
        }
        line_number += 1;
        offset += read as u64;
        if line.trim().is_empty() {
            continue;
        }
        if let Some((bad_line, error)) = unparsable.take() {
            return Err(ScanError::Resume(format!(
                "line {} is not a JSON record: {}",
                bad_line, error
            )));
        }
        let record: Value = match serde_json::from_str(&line) {
            Ok(record) => record,
            Err(e) => {
                unparsable = Some((line_number, e));
                continue;
            }
        };
        valid_len = offset;
        terminated = line.ends_with('\n');

        let node_id = record
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| ScanError::Resume(format!("line {} has no id", line_number)))?
            .to_string();
        if replayed == 0 {
            let root_type = record
                .pointer("/metadata/type")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    ScanError::Resume("first record has no metadata.type".to_string())
                })?;
            if !registry.contains(root_type) {
                return Err(ScanError::Resume(format!(
                    "root {} has unknown type {}",
                    node_id, root_type
                )));
            }
            visited.insert(node_id.clone(), root_type.to_string());
            pending.insert(node_id.clone(), CrawlTask::new(&node_id, root_type, 1));
        }

        let Some(task) = pending.shift_remove(&node_id) else {
            warn!("Record {} was never queued, ignoring it.", node_id);
            continue;
        };
        replayed += 1;

        if !policy.descends_from(task.level) {
            continue;
        }
        for (connected_id, definition_name) in
            discover_connections(registry, &task.definition_name, &record)?
        {
            if policy.excludes(&definition_name) || visited.contains_key(&connected_id) {
                continue;
            }
            visited.insert(connected_id.clone(), definition_name.clone());
            pending.insert(
                connected_id.clone(),
                CrawlTask::new(connected_id, definition_name, task.level + 1),
            );
        }
    }

    if let Some((bad_line, error)) = unparsable {
        warn!("Ignoring truncated record on line {}: {}", bad_line, error);
    }
    if replayed == 0 {
        return Err(ScanError::Resume("no records to resume from".to_string()));
    }

    let mut state = CrawlState {
        visited,
        ..CrawlState::default()
    };
    for task in pending.into_values() {
        *state
            .pending_by_type
            .entry(task.definition_name.clone())
            .or_default() += 1;
        state.queue.push_back(task);
    }
    debug!(
        "Replayed {} records, {} nodes left to crawl: {}",
        replayed,
        state.queue.len(),
        state.pending_summary()
    );
    Ok(Checkpoint {
        state,
        valid_len,
        terminated,
    })
}
