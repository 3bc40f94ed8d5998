//! Single writer applying pool events to the snapshot.

use std::ops::ControlFlow;

use indicatif::ProgressBar;
use tracing::{debug, error, info, warn};

use super::OrchestratorError;
use crate::download::{AssetOutcome, PoolObserver};
use crate::ledger::{Ledger, LedgerEntry};
use crate::store::{self, Asset, AssetError, FailureRecord, PayloadSnapshot, StatePaths};

/// Owns every mutation of the in-memory snapshot during a run.
///
/// Each outcome updates link and asset state, appends a ledger entry and
/// counts towards the next checkpoint. The first store or ledger error is
/// kept and stops admission.
pub(super) struct OutcomeHandler<'a> {
    snapshot: &'a mut PayloadSnapshot,
    paths: &'a StatePaths,
    ledger: Ledger,
    progress: ProgressBar,
    checkpoint_every: usize,
    since_checkpoint: usize,
    checkpoints: usize,
    fatal: Option<OrchestratorError>,
}

impl<'a> OutcomeHandler<'a> {
    pub(super) fn new(
        snapshot: &'a mut PayloadSnapshot,
        paths: &'a StatePaths,
        ledger: Ledger,
        progress: ProgressBar,
        checkpoint_every: usize,
    ) -> Self {
        Self {
            snapshot,
            paths,
            ledger,
            progress,
            checkpoint_every: checkpoint_every.max(1),
            since_checkpoint: 0,
            checkpoints: 0,
            fatal: None,
        }
    }

    /// Saves the snapshot and rewrites the failure record.
    pub(super) fn checkpoint(&mut self) -> Result<(), OrchestratorError> {
        store::save(self.snapshot, &self.paths.payload)?;
        FailureRecord::from_snapshot(self.snapshot).save(&self.paths.failures)?;
        self.since_checkpoint = 0;
        self.checkpoints += 1;
        debug!(checkpoints = self.checkpoints, "checkpoint written");
        Ok(())
    }

    /// Checkpoints a final time and hands back the first fatal error.
    pub(super) fn finish(mut self) -> (usize, Result<(), OrchestratorError>) {
        let saved = self.checkpoint();
        self.progress.finish_and_clear();
        let result = match (self.fatal.take(), saved) {
            (Some(fatal), Err(save_error)) => {
                error!(error = %save_error, "final checkpoint failed after fatal error");
                Err(fatal)
            }
            (Some(fatal), Ok(())) => Err(fatal),
            (None, saved) => saved,
        };
        (self.checkpoints, result)
    }

    fn apply(&mut self, outcome: &AssetOutcome) -> Result<(), OrchestratorError> {
        let id = outcome.asset_id.as_str();
        for link in &outcome.fetched {
            self.snapshot.record_link(id, &link.url, link.bytes)?;
        }

        match &outcome.error {
            None => {
                let bytes = self.snapshot.get(id).map_or(0, Asset::bytes_downloaded);
                self.snapshot.mark_done(id, bytes)?;
                info!(
                    asset_id = %id,
                    bytes,
                    duration_ms = outcome.duration_ms(),
                    "asset done"
                );
            }
            Some(e) => {
                self.snapshot
                    .mark_failed(id, AssetError::new(e.kind(), e.to_string()))?;
                warn!(
                    asset_id = %id,
                    kind = %e.kind(),
                    error = %e,
                    links_fetched = outcome.fetched.len(),
                    duration_ms = outcome.duration_ms(),
                    "asset failed"
                );
            }
        }
        self.ledger.append(&LedgerEntry::from_outcome(outcome))?;

        self.since_checkpoint += 1;
        if self.since_checkpoint >= self.checkpoint_every {
            self.checkpoint()?;
        }
        Ok(())
    }

    fn stop(&mut self, error: OrchestratorError) -> ControlFlow<()> {
        error!(error = %error, "stopping run on state error");
        self.fatal.get_or_insert(error);
        ControlFlow::Break(())
    }
}

impl PoolObserver for OutcomeHandler<'_> {
    fn on_admit(&mut self, asset_id: &str) -> ControlFlow<()> {
        if self.fatal.is_some() {
            return ControlFlow::Break(());
        }
        match self.snapshot.mark_in_progress(asset_id) {
            Ok(()) => ControlFlow::Continue(()),
            Err(e) => self.stop(e.into()),
        }
    }

    fn on_outcome(&mut self, outcome: AssetOutcome) -> ControlFlow<()> {
        self.progress.inc(1);
        match self.apply(&outcome) {
            Ok(()) => ControlFlow::Continue(()),
            Err(e) => self.stop(e),
        }
    }
}
