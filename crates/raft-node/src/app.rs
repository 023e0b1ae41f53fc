//! # app
//!
//! why: the contract between a replicated node and the state it replicates
//! relations: implemented by kv.rs; called by driver.rs (snapshot) and node.rs (restore)
//! what: StateMachine trait and the process_commits consumer loop

use crate::error::StateMachineError;
use crate::pipeline::CommitBatch;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// application state fed by committed entries
///
/// `snapshot` is only called while no batch is outstanding, so the image
/// always matches the last acknowledged index
pub trait StateMachine: Send + Sync + 'static {
    fn apply(&self, batch: &CommitBatch) -> Result<(), StateMachineError>;

    fn snapshot(&self) -> Result<Vec<u8>, StateMachineError>;

    /// replace all state with a snapshot image
    fn restore(&self, data: &[u8]) -> Result<(), StateMachineError>;
}

/// apply every batch in order, acknowledging each one, until the node closes the pipeline
///
/// a batch that fails is failed back to the node, which stops and reports the cause
pub async fn process_commits<A>(app: &A, commits: &mut mpsc::Receiver<CommitBatch>) -> Result<(), StateMachineError>
where
    A: StateMachine + ?Sized,
{
    while let Some(mut batch) = commits.recv().await {
        match apply_batch(app, &batch) {
            Ok(()) => {
                batch.complete();
            }
            Err(e) => {
                let index = batch.last_index;
                let reason = e.to_string();
                warn!(index, error = %reason, "batch failed to apply");
                batch.fail(e);
                return Err(StateMachineError::Aborted { index, reason });
            }
        }
    }
    Ok(())
}

fn apply_batch<A>(app: &A, batch: &CommitBatch) -> Result<(), StateMachineError>
where
    A: StateMachine + ?Sized,
{
    if let Some(snapshot) = &batch.snapshot {
        debug!(index = snapshot.index(), "restoring from received snapshot");
        app.restore(&snapshot.data)?;
    }
    app.apply(batch)
}
