//! File-backed catalogue.
//!
//! - Descriptors come from a TOML file of `[[stream]]` tables, re-read on
//!   every lookup so edits apply without a restart.
//! - Durable status and the last worker PID live in `{state_dir}/state.json`,
//!   rewritten atomically (temp file + rename) on every change.
//! - Log entries are appended to `{state_dir}/stream-logs.jsonl`, one JSON
//!   object per line, flushed after each entry.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::{Catalogue, StreamDescriptor, StreamLogEntry};
use crate::error::CatalogueError;
use crate::supervisor::types::{StreamId, StreamRuntimeState};

const STATE_FILE: &str = "state.json";
const LOG_FILE: &str = "stream-logs.jsonl";

#[derive(Debug, Deserialize)]
struct StreamsFile {
    #[serde(default, rename = "stream")]
    streams: Vec<StreamRecord>,
}

/// One `[[stream]]` table. Display fields such as `name` and `stream_type`
/// belong to the API layer and are ignored here.
#[derive(Debug, Deserialize)]
struct StreamRecord {
    id: String,
    url: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StateFile {
    #[serde(default)]
    streams: BTreeMap<StreamId, StreamState>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct StreamState {
    status: Option<StreamRuntimeState>,
    process_id: Option<u32>,
    updated_at: Option<String>,
}

/// Catalogue persisted as plain files.
pub struct FileCatalogue {
    streams_file: PathBuf,
    state_path: PathBuf,
    state: Mutex<StateFile>,
    log_writer: Mutex<BufWriter<fs::File>>,
}

impl FileCatalogue {
    /// Open (creating `state_dir` if needed) a catalogue over `streams_file`.
    ///
    /// The streams file itself is only required to exist when a descriptor
    /// is read.
    pub fn open(streams_file: &Path, state_dir: &Path) -> Result<Self, CatalogueError> {
        fs::create_dir_all(state_dir).map_err(|source| CatalogueError::Io {
            path: state_dir.to_path_buf(),
            source,
        })?;

        let state_path = state_dir.join(STATE_FILE);
        let state = match fs::read_to_string(&state_path) {
            Ok(contents) => {
                serde_json::from_str(&contents).map_err(|e| CatalogueError::Parse {
                    path: state_path.clone(),
                    message: e.to_string(),
                })?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StateFile::default(),
            Err(source) => {
                return Err(CatalogueError::Io {
                    path: state_path,
                    source,
                });
            }
        };

        let log_path = state_dir.join(LOG_FILE);
        let log_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .map_err(|source| CatalogueError::Io {
                path: log_path,
                source,
            })?;

        Ok(Self {
            streams_file: streams_file.to_path_buf(),
            state_path,
            state: Mutex::new(state),
            log_writer: Mutex::new(BufWriter::new(log_file)),
        })
    }

    /// Durable status last written for `id`.
    pub fn status(&self, id: &str) -> Option<StreamRuntimeState> {
        self.lock_state().streams.get(id).and_then(|s| s.status)
    }

    fn load_streams(&self) -> Result<Vec<StreamRecord>, CatalogueError> {
        let contents =
            fs::read_to_string(&self.streams_file).map_err(|source| CatalogueError::Io {
                path: self.streams_file.clone(),
                source,
            })?;
        let parsed: StreamsFile =
            toml::from_str(&contents).map_err(|e| CatalogueError::Parse {
                path: self.streams_file.clone(),
                message: e.to_string(),
            })?;
        Ok(parsed.streams)
    }

    /// Apply `update` to the stream's state and persist the whole file.
    fn update_state(
        &self,
        id: &str,
        update: impl FnOnce(&mut StreamState),
    ) -> Result<(), CatalogueError> {
        let mut state = self.lock_state();
        let entry = state.streams.entry(id.to_string()).or_default();
        update(entry);
        entry.updated_at = Some(Utc::now().to_rfc3339());

        let json = serde_json::to_string_pretty(&*state)?;
        let tmp = self.state_path.with_extension("json.tmp");
        fs::write(&tmp, json)
            .and_then(|()| fs::rename(&tmp, &self.state_path))
            .map_err(|source| CatalogueError::Io {
                path: self.state_path.clone(),
                source,
            })
    }

    fn lock_state(&self) -> MutexGuard<'_, StateFile> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Catalogue for FileCatalogue {
    fn read_descriptor(&self, id: &str) -> Result<StreamDescriptor, CatalogueError> {
        self.load_streams()?
            .into_iter()
            .find(|s| s.id == id)
            .map(|s| StreamDescriptor {
                id: s.id,
                source_location: s.url,
            })
            .ok_or_else(|| CatalogueError::NotFound(id.to_string()))
    }

    fn write_status(&self, id: &str, state: StreamRuntimeState) -> Result<(), CatalogueError> {
        self.update_state(id, |s| s.status = Some(state))
    }

    fn append_log(&self, entry: StreamLogEntry) -> Result<(), CatalogueError> {
        let mut writer = self
            .log_writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let io_err = |source: std::io::Error| CatalogueError::Io {
            path: self.state_path.with_file_name(LOG_FILE),
            source,
        };
        serde_json::to_writer(&mut *writer, &entry)?;
        writer.write_all(b"\n").map_err(io_err)?;
        writer.flush().map_err(io_err)
    }

    fn record_process(&self, id: &str, pid: Option<u32>) -> Result<(), CatalogueError> {
        self.update_state(id, |s| s.process_id = pid)
    }

    fn recorded_process(&self, id: &str) -> Option<u32> {
        self.lock_state().streams.get(id).and_then(|s| s.process_id)
    }

    fn list_ids(&self) -> Result<Vec<StreamId>, CatalogueError> {
        Ok(self.load_streams()?.into_iter().map(|s| s.id).collect())
    }
}
