//! The unified operations queue: the in-process API surface for mutating
//! the declared config and steering running wants.

use tokio::sync::oneshot;
use uuid::Uuid;

use wunsch_core::WantConfig;

use crate::error::RuntimeError;

#[derive(Debug)]
pub enum WantOperation {
    Add(Vec<WantConfig>),
    Delete(Vec<Uuid>),
    Suspend(Vec<Uuid>),
    Resume(Vec<Uuid>),
    Stop(Vec<Uuid>),
    Start(Vec<Uuid>),
    AddLabel {
        id: Uuid,
        key: String,
        value: String,
    },
    RemoveLabel {
        id: Uuid,
        key: String,
    },
}

/// An operation plus its optional acknowledgement channel. The ack is
/// non-blocking on the reconciler side: a dropped receiver is ignored.
pub struct QueuedOperation {
    pub op: WantOperation,
    pub ack: Option<oneshot::Sender<Result<(), String>>>,
}

impl QueuedOperation {
    pub fn fire_and_forget(op: WantOperation) -> Self {
        Self { op, ack: None }
    }

    pub fn acked(op: WantOperation) -> (Self, oneshot::Receiver<Result<(), String>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                op,
                ack: Some(tx),
            },
            rx,
        )
    }

    pub(crate) fn ack(self, result: Result<(), RuntimeError>) {
        if let Some(tx) = self.ack {
            // non-blocking by contract: dropped receivers are fine
            let _ = tx.send(result.map_err(|e| e.to_string()));
        }
    }
}
