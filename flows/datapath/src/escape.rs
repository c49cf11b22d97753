//! Overflow escape hatch
//!
//! Bounded channel from the packet path to a single consumer. Records that
//! the table could not absorb are forwarded here as whole envelopes. The
//! producer side never waits: a full channel is a final loss.

use flow_common::{
    constants::{EPIPE, ENOSPC},
    EscapeRecord,
};
use thiserror::Error;
use tokio::sync::mpsc::{
    self,
    error::{TryRecvError, TrySendError},
};

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum EscapeError {
    #[error("escape hatch is full")]
    Full,
    #[error("escape hatch consumer is gone")]
    Closed,
}

impl EscapeError {
    pub fn errno(&self) -> i32 {
        match self {
            EscapeError::Full => ENOSPC,
            EscapeError::Closed => EPIPE,
        }
    }
}

/// Producer side, cloned into every execution context
#[derive(Clone, Debug)]
pub struct EscapeHatch {
    tx: mpsc::Sender<EscapeRecord>,
}

/// Consumer side, owned by exactly one reader
#[derive(Debug)]
pub struct EscapeReceiver {
    rx: mpsc::Receiver<EscapeRecord>,
}

/// Create an escape hatch holding at most `capacity` records
pub fn escape_hatch(capacity: usize) -> (EscapeHatch, EscapeReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (EscapeHatch { tx }, EscapeReceiver { rx })
}

impl EscapeHatch {
    /// Enqueue `record` without waiting
    pub fn try_emit(&self, record: EscapeRecord) -> Result<(), EscapeError> {
        self.tx.try_send(record).map_err(|err| match err {
            TrySendError::Full(_) => EscapeError::Full,
            TrySendError::Closed(_) => EscapeError::Closed,
        })
    }

    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }
}

impl EscapeReceiver {
    /// Wait for the next record; None once every producer is dropped
    pub async fn recv(&mut self) -> Option<EscapeRecord> {
        self.rx.recv().await
    }

    /// Take a record if one is queued
    pub fn try_recv(&mut self) -> Option<EscapeRecord> {
        match self.rx.try_recv() {
            Ok(record) => Some(record),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    /// Take every record currently queued
    pub fn drain(&mut self) -> Vec<EscapeRecord> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}
