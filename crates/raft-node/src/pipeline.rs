//! # pipeline
//!
//! why: hand committed entries to the application one batch at a time
//! relations: fed by driver.rs after each ready, consumed through Node::commits
//! what: CommitBatch, ApplyDone, and the CommitPublisher that enforces backpressure
//!
//! the channel to the application holds a single batch, and the next batch is
//! not published until the previous one's ApplyDone has fired or been dropped.
//! batches with nothing for the application (no-ops, membership changes) are
//! acknowledged internally once everything before them is. a batch the
//! application cannot apply is failed instead, which stops the node.

use crate::error::StateMachineError;
use raft_core::Snapshot;
use std::collections::VecDeque;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// completion signal of one batch; fires at most once
#[derive(Debug)]
pub struct ApplyDone {
    tx: Option<oneshot::Sender<ApplyOutcome>>,
}

type ApplyOutcome = std::result::Result<(), StateMachineError>;

impl ApplyDone {
    fn new() -> (Self, oneshot::Receiver<ApplyOutcome>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// signal that the batch is applied; false if it already was
    pub fn fire(&mut self) -> bool {
        self.signal(Ok(()))
    }

    /// report that the batch could not be applied; the node stops with `error`
    pub fn fail(&mut self, error: StateMachineError) -> bool {
        self.signal(Err(error))
    }

    fn signal(&mut self, outcome: ApplyOutcome) -> bool {
        match self.tx.take() {
            Some(tx) => {
                // the driver may already be gone; nothing is waiting then
                let _ = tx.send(outcome);
                true
            }
            None => false,
        }
    }

    pub fn is_fired(&self) -> bool {
        self.tx.is_none()
    }
}

/// a run of committed commands, in log order
#[derive(Debug)]
pub struct CommitBatch {
    /// command payloads; no-op and membership entries are left out
    pub data: Vec<Vec<u8>>,
    /// log index of the last entry this batch covers
    pub last_index: u64,
    /// set when the application must restore this image before `data`
    pub snapshot: Option<Snapshot>,
    done: ApplyDone,
}

impl CommitBatch {
    /// fire the completion signal; a second call is a no-op returning false
    pub fn complete(&mut self) -> bool {
        self.done.fire()
    }

    /// fire the completion signal with an error; the node reports it and stops
    pub fn fail(&mut self, error: StateMachineError) -> bool {
        self.done.fail(error)
    }

    /// move the completion signal out, e.g. to fire it after the batch is dropped
    pub fn take_done(&mut self) -> ApplyDone {
        std::mem::replace(&mut self.done, ApplyDone { tx: None })
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty() && self.snapshot.is_none()
    }
}

/// how the in-flight batch ended
#[derive(Debug)]
pub(crate) enum Completion {
    Applied(u64),
    /// the signal was dropped without firing
    Abandoned(u64),
    Failed { last_index: u64, error: StateMachineError },
}

/// the application side of the pipeline is gone
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PipelineClosed;

#[derive(Debug)]
struct Pending {
    data: Vec<Vec<u8>>,
    last_index: u64,
    snapshot: Option<Snapshot>,
}

#[derive(Debug)]
struct InFlight {
    last_index: u64,
    done: oneshot::Receiver<ApplyOutcome>,
}

#[derive(Debug)]
pub(crate) struct CommitPublisher {
    tx: Option<mpsc::Sender<CommitBatch>>,
    pending: VecDeque<Pending>,
    in_flight: Option<InFlight>,
}

impl CommitPublisher {
    pub(crate) fn new() -> (Self, mpsc::Receiver<CommitBatch>) {
        let (tx, rx) = mpsc::channel(1);
        (Self { tx: Some(tx), pending: VecDeque::new(), in_flight: None }, rx)
    }

    pub(crate) fn enqueue(&mut self, data: Vec<Vec<u8>>, last_index: u64, snapshot: Option<Snapshot>) {
        // consecutive batches merge until one is handed out
        if snapshot.is_none() {
            if let Some(back) = self.pending.back_mut() {
                back.data.extend(data);
                back.last_index = last_index;
                return;
            }
        }
        self.pending.push_back(Pending { data, last_index, snapshot });
    }

    pub(crate) fn has_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.in_flight.is_none() && self.pending.is_empty()
    }

    /// publish the next batch if the slot is free
    ///
    /// returns the highest index acknowledged without involving the application
    pub(crate) fn publish(&mut self) -> Result<Option<u64>, PipelineClosed> {
        let mut acked = None;
        while self.in_flight.is_none() {
            let Some(next) = self.pending.pop_front() else {
                break;
            };
            if next.data.is_empty() && next.snapshot.is_none() {
                acked = Some(next.last_index);
                continue;
            }
            let Some(tx) = self.tx.as_ref() else {
                return Err(PipelineClosed);
            };
            let (done, rx) = ApplyDone::new();
            let last_index = next.last_index;
            let batch = CommitBatch { data: next.data, last_index, snapshot: next.snapshot, done };
            match tx.try_send(batch) {
                Ok(()) => {
                    debug!(last_index, "published commit batch");
                    self.in_flight = Some(InFlight { last_index, done: rx });
                }
                Err(mpsc::error::TrySendError::Full(batch)) => {
                    self.pending.push_front(Pending {
                        data: batch.data,
                        last_index: batch.last_index,
                        snapshot: batch.snapshot,
                    });
                    break;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => return Err(PipelineClosed),
            }
        }
        Ok(acked)
    }

    /// resolves when the in-flight batch completes; pends forever when there is none
    pub(crate) async fn completion(&mut self) -> Completion {
        let Some(in_flight) = self.in_flight.as_mut() else {
            return std::future::pending().await;
        };
        let result = (&mut in_flight.done).await;
        let last_index = in_flight.last_index;
        self.in_flight = None;
        match result {
            Ok(Ok(())) => Completion::Applied(last_index),
            Ok(Err(error)) => Completion::Failed { last_index, error },
            Err(_) => {
                warn!(last_index, "commit batch dropped without completion");
                Completion::Abandoned(last_index)
            }
        }
    }

    /// stop publishing; the application sees the end of the stream
    pub(crate) fn close(&mut self) {
        self.tx = None;
        self.pending.clear();
    }
}
