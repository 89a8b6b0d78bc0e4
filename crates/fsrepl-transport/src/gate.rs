//! Bounded-concurrency gate.
//!
//! A counting admission primitive: at most `capacity` tickets are
//! outstanding at any instant. Waiters are admitted in whatever order the
//! underlying semaphore chooses. The gate knows nothing about the work it
//! bounds.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

/// Errors returned by [`Gate::acquire`].
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum GateError {
    /// The cancellation token fired before a slot became free.
    #[error("gate acquisition cancelled")]
    Cancelled,
    /// The gate was closed.
    #[error("gate closed")]
    Closed,
}

/// Counting gate with a fixed capacity. Cloning shares the same slots.
#[derive(Debug, Clone)]
pub struct Gate {
    sem: Arc<Semaphore>,
    capacity: usize,
}

impl Gate {
    /// Create a gate admitting at most `capacity` concurrent tickets.
    pub fn new(capacity: usize) -> Self {
        Self {
            sem: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Wait for a free slot or for `cancel` to fire, whichever comes first.
    ///
    /// A cancelled acquisition never leaves a ticket outstanding.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<Ticket, GateError> {
        if cancel.is_cancelled() {
            return Err(GateError::Cancelled);
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(GateError::Cancelled),
            permit = self.sem.clone().acquire_owned() => permit
                .map(|permit| Ticket { permit: Some(permit) })
                .map_err(|_| GateError::Closed),
        }
    }

    /// Take a slot only if one is free right now.
    pub fn try_acquire(&self) -> Option<Ticket> {
        self.sem
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|permit| Ticket {
                permit: Some(permit),
            })
    }

    /// Configured capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of tickets currently held.
    pub fn outstanding(&self) -> usize {
        self.capacity - self.sem.available_permits()
    }

    /// Close the gate; pending and future acquisitions fail with
    /// [`GateError::Closed`].
    pub fn close(&self) {
        self.sem.close();
    }
}

/// One admitted slot. Released on [`Ticket::release`] or on drop,
/// whichever happens first; releasing twice is a no-op.
#[derive(Debug)]
pub struct Ticket {
    permit: Option<OwnedSemaphorePermit>,
}

impl Ticket {
    /// Return the slot to the gate.
    pub fn release(&mut self) {
        self.permit.take();
    }

    /// Whether the slot has already been returned.
    pub fn is_released(&self) -> bool {
        self.permit.is_none()
    }
}
