// src/persistence.rs
//
// Best-effort JSON persistence of the camera → zones/lines configuration and
// counters. Durability is not required for counting correctness: a failed
// write is logged and in-memory state stays authoritative. Writes happen on
// a dedicated thread fed by a channel, so a slow or hung disk never blocks
// the store lock.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Sender};
use std::thread::{self, JoinHandle};
use tracing::{info, warn};

use crate::store::PersistedState;

pub fn save_state(path: &Path, state: &PersistedState) -> Result<()> {
    let json = serde_json::to_string_pretty(state).context("serializing counter state")?;
    // Write-then-rename so a crash mid-write never leaves a torn file.
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json).with_context(|| format!("writing {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("renaming into {}", path.display()))?;
    Ok(())
}

/// Load a previously saved state. A missing file is a normal first run; a
/// corrupt file is logged and treated the same, per the best-effort contract.
pub fn load_state(path: &Path) -> Option<PersistedState> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return None,
        Err(err) => {
            warn!("could not read {}: {err}", path.display());
            return None;
        }
    };
    match serde_json::from_str(&contents) {
        Ok(state) => Some(state),
        Err(err) => {
            warn!("ignoring corrupt state file {}: {err}", path.display());
            None
        }
    }
}

enum WriterMessage {
    Snapshot(PersistedState),
    Shutdown,
}

/// Handle to the background writer thread. Snapshots are fire-and-forget;
/// only the latest pending snapshot matters, so the writer drains its queue
/// and writes the last one it finds.
pub struct PersistenceHandle {
    tx: Sender<WriterMessage>,
    join: Option<JoinHandle<()>>,
}

impl PersistenceHandle {
    pub fn spawn(path: PathBuf) -> Self {
        let (tx, rx) = mpsc::channel::<WriterMessage>();
        let join = thread::Builder::new()
            .name("state-writer".to_string())
            .spawn(move || {
                info!("state writer started for {}", path.display());
                while let Ok(message) = rx.recv() {
                    let mut latest = match message {
                        WriterMessage::Snapshot(state) => Some(state),
                        WriterMessage::Shutdown => break,
                    };
                    let mut shutdown = false;
                    // Coalesce any backlog into the newest snapshot.
                    while let Ok(next) = rx.try_recv() {
                        match next {
                            WriterMessage::Snapshot(state) => latest = Some(state),
                            WriterMessage::Shutdown => shutdown = true,
                        }
                    }
                    if let Some(state) = latest {
                        if let Err(err) = save_state(&path, &state) {
                            warn!("state persistence failed (in-memory state retained): {err:#}");
                        }
                    }
                    if shutdown {
                        break;
                    }
                }
            })
            .expect("spawning state writer thread");
        Self {
            tx,
            join: Some(join),
        }
    }

    /// Queue a snapshot for writing. Never blocks, never fails the caller.
    pub fn schedule(&self, state: PersistedState) {
        if self.tx.send(WriterMessage::Snapshot(state)).is_err() {
            warn!("state writer is gone; snapshot dropped");
        }
    }
}

impl Drop for PersistenceHandle {
    fn drop(&mut self) {
        let _ = self.tx.send(WriterMessage::Shutdown);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}
