//! Session execution: one worker thread per calibration run, with the
//! automatic retry policy of the session-management layer.

use std::thread::JoinHandle;

use log::{error, warn};

use crate::calibration::orchestrator::{Collaborators, Orchestrator};
use crate::calibration::session::CalibrationSession;
use crate::error::Result;
use crate::progress::{channel, ProgressHandle, ProgressSink};

/// Maximum automatic re-attempts for the on-chip focal actions.
const MAX_RETRIES: u32 = 3;

/// Entry point for running calibration sessions against a device.
#[derive(Clone)]
pub struct CalibrationEngine {
    links: Collaborators,
}

impl CalibrationEngine {
    pub fn new(links: Collaborators) -> Self {
        Self { links }
    }

    /// Run a session to completion on the calling thread.
    ///
    /// `OnChipFocalLength` and `OnChipExtended` failures are retried up to
    /// three times with the alternate speed profile; every other action
    /// surfaces its first failure for manual retry.
    pub fn run_session(
        &self,
        session: &mut CalibrationSession,
        progress: &ProgressSink,
    ) -> Result<()> {
        loop {
            let orchestrator = Orchestrator::new(self.links.clone(), progress.clone());
            match orchestrator.run(session) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    if session.action.auto_retries() && session.retry_count < MAX_RETRIES {
                        session.retry_count += 1;
                        session.toggle = true;
                        session.reset_results();
                        warn!(
                            "{} failed ({e}), retry {}/{MAX_RETRIES}",
                            session.action, session.retry_count
                        );
                        progress.reset();
                        continue;
                    }
                    error!("{} failed: {e}", session.action);
                    return Err(e);
                }
            }
        }
    }

    /// Spawn a dedicated worker thread for the session. The returned
    /// handle's progress side is safe to poll from the control thread.
    pub fn start(&self, session: CalibrationSession) -> Result<SessionHandle> {
        let (sink, handle) = channel();
        let engine = self.clone();
        let worker = std::thread::Builder::new()
            .name("calibration-session".into())
            .spawn(move || {
                let mut session = session;
                let result = engine.run_session(&mut session, &sink);
                (session, result)
            })
            .map_err(|e| {
                crate::error::CalibrationError::Device(format!(
                    "failed to spawn calibration worker: {e}"
                ))
            })?;

        Ok(SessionHandle {
            progress: handle,
            worker,
        })
    }

    /// Make the given table the active calibration.
    pub fn apply_table(&self, table: &[u8]) -> Result<()> {
        if table.is_empty() {
            return Ok(());
        }
        self.links.protocol.set_calibration_table(table)
    }

    /// Persist the currently applied calibration to device flash.
    pub fn keep(&self) -> Result<()> {
        self.links.protocol.write_calibration()
    }
}

/// Control-thread view of a running session.
pub struct SessionHandle {
    /// Progress/state/done/failed channel; all reads are tear-free.
    pub progress: ProgressHandle,
    worker: JoinHandle<(CalibrationSession, Result<()>)>,
}

impl SessionHandle {
    /// Wait for the worker to finish and take the session back.
    pub fn join(self) -> (CalibrationSession, Result<()>) {
        match self.worker.join() {
            Ok(outcome) => outcome,
            Err(_) => {
                let mut session = CalibrationSession::new(crate::calibration::session::Action::OnChip);
                session.reset_results();
                (
                    session,
                    Err(crate::error::CalibrationError::Device(
                        "calibration worker panicked".into(),
                    )),
                )
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.worker.is_finished()
    }
}
