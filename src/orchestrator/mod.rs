//! Simulation Request Orchestrator.
//!
//! Turns one decoded JSON request into one decoded JSON result by running the
//! external engine, or into a classified [`SimulationError`]. The checks run in
//! a fixed order: input, executable, exit code, empty output, JSON parse.

use std::{
    ffi::OsString,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};

use log::{debug, info, warn};
use serde_json::Value;

use crate::{
    config::{EngineConfig, Handoff},
    engine::{
        resolve_executable, DeliveryMode, EngineCommand, EngineInvocation, EngineRunner,
        HandoffFiles, ProcessRunner, RunError,
    },
    metrics,
};

pub mod error;
pub mod request;

pub use error::{FailureKind, SimulationError};
pub use request::{is_json_content_type, SimulationRequest};

/// Static engine settings, fixed at startup.
#[derive(Clone, Debug)]
pub struct EngineSettings {
    pub path: PathBuf,
    pub fallback_path: Option<PathBuf>,
    pub args: Vec<String>,
    pub delivery: DeliveryMode,
    pub timeout: Duration,
    pub handoff: Handoff,
}

impl From<&EngineConfig> for EngineSettings {
    fn from(cfg: &EngineConfig) -> Self {
        Self {
            path: PathBuf::from(&cfg.path),
            fallback_path: cfg.fallback_path.as_ref().map(PathBuf::from),
            args: cfg.args.clone(),
            delivery: cfg.delivery,
            timeout: cfg.timeout(),
            handoff: cfg.handoff.clone(),
        }
    }
}

impl EngineSettings {
    fn candidates(&self) -> Vec<PathBuf> {
        let mut candidates = vec![self.path.clone()];
        if let Some(fallback) = &self.fallback_path {
            candidates.push(fallback.clone());
        }
        candidates
    }
}

pub struct Orchestrator {
    settings: EngineSettings,
    runner: Arc<dyn EngineRunner>,
    handoff: HandoffFiles,
}

impl Orchestrator {
    pub fn new(settings: EngineSettings, runner: Arc<dyn EngineRunner>) -> Self {
        let handoff = HandoffFiles::new(settings.handoff.clone());
        Self {
            settings,
            runner,
            handoff,
        }
    }

    /// Orchestrator that runs the configured engine as a child process.
    pub fn from_config(cfg: &EngineConfig) -> Self {
        Self::new(EngineSettings::from(cfg), Arc::new(ProcessRunner))
    }

    /// Validates a raw HTTP body and runs it through [`Orchestrator::handle`].
    pub async fn handle_http(
        &self,
        content_type: Option<&str>,
        body: &[u8],
    ) -> Result<Value, SimulationError> {
        match SimulationRequest::from_http(content_type, body) {
            Ok(request) => self.handle(&request).await,
            Err(e) => {
                warn!("Rejected simulation request: {e}");
                metrics::record_outcome(e.kind().as_str());
                Err(e)
            }
        }
    }

    pub async fn handle(&self, request: &SimulationRequest) -> Result<Value, SimulationError> {
        let started = Instant::now();
        let outcome = self.simulate(request).await;

        match &outcome {
            Ok(_) => {
                info!(
                    "Simulation completed in {}ms",
                    started.elapsed().as_millis()
                );
                metrics::record_outcome(metrics::OUTCOME_OK);
            }
            Err(e) => {
                warn!("Simulation failed ({}): {e}", e.kind());
                metrics::record_outcome(e.kind().as_str());
            }
        }

        outcome
    }

    async fn simulate(&self, request: &SimulationRequest) -> Result<Value, SimulationError> {
        let candidates = self.settings.candidates();
        let resolved = resolve_executable(&candidates).await;
        let executable = resolved.ok_or(SimulationError::EngineNotFound {
            searched: candidates,
        })?;

        let payload = serde_json::to_vec(request.payload()).map_err(|e| {
            SimulationError::Internal(format!("Failed to serialize request: {e}"))
        })?;

        match self.settings.delivery {
            DeliveryMode::Stdin => {
                let invocation = self.invoke(&executable, Vec::new(), Some(payload)).await?;
                parse_result(&invocation, &invocation.stdout)
            }
            DeliveryMode::File => self.simulate_with_handoff(&executable, &payload).await,
        }
    }

    async fn simulate_with_handoff(
        &self,
        executable: &Path,
        payload: &[u8],
    ) -> Result<Value, SimulationError> {
        let slot = self
            .handoff
            .acquire()
            .await
            .map_err(|e| handoff_error("prepare handoff files", e))?;
        slot.write_input(payload)
            .await
            .map_err(|e| handoff_error("write engine input", e))?;

        let args = vec![
            slot.input().as_os_str().to_owned(),
            slot.output().as_os_str().to_owned(),
        ];
        let invocation = self.invoke(executable, args, None).await?;

        // Engines may write the output file or print to stdout; the file wins.
        let written = slot
            .read_output()
            .await
            .map_err(|e| handoff_error("read engine output", e))?
            .filter(|text| !text.trim().is_empty());

        match written {
            Some(text) => parse_result(&invocation, &text),
            None => {
                let result = parse_result(&invocation, &invocation.stdout)?;
                if !slot.is_ephemeral() {
                    if let Err(e) = slot.persist_result(&result).await {
                        warn!(
                            "Failed to keep result in {}: {e}",
                            slot.output().display()
                        );
                    }
                }
                Ok(result)
            }
        }
    }

    async fn invoke(
        &self,
        executable: &Path,
        delivery_args: Vec<OsString>,
        stdin: Option<Vec<u8>>,
    ) -> Result<EngineInvocation, SimulationError> {
        let mut args: Vec<OsString> = self.settings.args.iter().map(OsString::from).collect();
        args.extend(delivery_args);

        let command = EngineCommand {
            program: executable.to_path_buf(),
            args,
            stdin,
            timeout: self.settings.timeout,
        };

        debug!(
            "Invoking engine {} via {}",
            executable.display(),
            self.settings.delivery
        );
        let started = Instant::now();
        let result = self.runner.run(command).await;
        metrics::record_engine_duration(started.elapsed());

        let output = match result {
            Ok(output) => output,
            Err(RunError::TimedOut(timeout)) => {
                return Err(SimulationError::EngineTimeout { timeout })
            }
            // removed between resolution and spawn
            Err(RunError::Spawn(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SimulationError::EngineNotFound {
                    searched: vec![executable.to_path_buf()],
                })
            }
            Err(e) => return Err(SimulationError::Internal(e.to_string())),
        };

        let invocation = EngineInvocation::new(
            executable.to_path_buf(),
            self.settings.delivery,
            output,
            started.elapsed(),
        );
        debug!(
            "Engine {} ({} delivery) exited with {:?} after {}ms",
            invocation.executable.display(),
            invocation.delivery,
            invocation.exit_code,
            invocation.elapsed.as_millis()
        );
        debug!("Engine stdout: {:?}", invocation.stdout);
        if !invocation.stderr.is_empty() {
            debug!("Engine stderr: {:?}", invocation.stderr);
        }

        if !invocation.succeeded() {
            return Err(SimulationError::EngineExecutionFailed {
                exit_code: invocation.exit_code,
                stderr: invocation.stderr,
            });
        }

        Ok(invocation)
    }
}

fn parse_result(invocation: &EngineInvocation, raw: &str) -> Result<Value, SimulationError> {
    let text = raw.trim();
    if text.is_empty() {
        return Err(SimulationError::EmptyEngineOutput {
            stderr: invocation.stderr.clone(),
        });
    }

    let result: Value =
        serde_json::from_str(text).map_err(|e| SimulationError::MalformedEngineOutput {
            raw: text.to_string(),
            reason: e.to_string(),
        })?;
    debug!("Engine result: {result}");
    Ok(result)
}

fn handoff_error(action: &str, err: std::io::Error) -> SimulationError {
    SimulationError::Internal(format!("Failed to {action}: {err}"))
}
