//! Input/output files for engines driven as `engine <input> <output>`.
//!
//! Two strategies keep concurrent requests apart: unique file names per
//! request, or the fixed configured names behind a process-wide lock that is
//! held from writing the input until the result has been read back.

use std::{
    io,
    path::{Path, PathBuf},
};

use log::{debug, warn};
use serde_json::Value;
use tokio::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use crate::config::Handoff;

pub struct HandoffFiles {
    config: Handoff,
    lock: Mutex<()>,
}

impl HandoffFiles {
    pub fn new(config: Handoff) -> Self {
        Self {
            config,
            lock: Mutex::new(()),
        }
    }

    /// Reserves the file pair for one engine run.
    ///
    /// With fixed names this waits for any in-flight run to finish and clears
    /// the previous output so it can never be mistaken for the new result.
    pub async fn acquire(&self) -> io::Result<HandoffSlot<'_>> {
        tokio::fs::create_dir_all(&self.config.dir).await?;

        if self.config.per_request {
            let id = Uuid::new_v4();
            return Ok(HandoffSlot {
                input: self
                    .config
                    .dir
                    .join(format!("{id}-{}", self.config.input_file)),
                output: self
                    .config
                    .dir
                    .join(format!("{id}-{}", self.config.output_file)),
                ephemeral: true,
                _guard: None,
            });
        }

        let guard = self.lock.lock().await;
        let slot = HandoffSlot {
            input: self.config.dir.join(&self.config.input_file),
            output: self.config.dir.join(&self.config.output_file),
            ephemeral: false,
            _guard: Some(guard),
        };
        remove_if_exists(&slot.output).await?;
        Ok(slot)
    }
}

/// A reserved input/output pair. Per-request files are deleted on drop.
pub struct HandoffSlot<'a> {
    input: PathBuf,
    output: PathBuf,
    ephemeral: bool,
    _guard: Option<MutexGuard<'a, ()>>,
}

impl HandoffSlot<'_> {
    pub fn input(&self) -> &Path {
        &self.input
    }

    pub fn output(&self) -> &Path {
        &self.output
    }

    pub fn is_ephemeral(&self) -> bool {
        self.ephemeral
    }

    pub async fn write_input(&self, payload: &[u8]) -> io::Result<()> {
        tokio::fs::write(&self.input, payload).await?;
        debug!("Wrote {} bytes to {}", payload.len(), self.input.display());
        Ok(())
    }

    /// Contents of the output file, `None` if the engine did not create it.
    pub async fn read_output(&self) -> io::Result<Option<String>> {
        match tokio::fs::read(&self.output).await {
            Ok(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).into_owned())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Leaves the parsed result in the output file for later inspection.
    pub async fn persist_result(&self, result: &Value) -> io::Result<()> {
        let pretty = serde_json::to_vec_pretty(result)?;
        tokio::fs::write(&self.output, pretty).await
    }
}

impl Drop for HandoffSlot<'_> {
    fn drop(&mut self) {
        if !self.ephemeral {
            return;
        }
        for path in [&self.input, &self.output] {
            if let Err(e) = std::fs::remove_file(path) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!("Failed to remove handoff file {}: {e}", path.display());
                }
            }
        }
    }
}

async fn remove_if_exists(path: &Path) -> io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
