use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::protocol::{Diary, Envelope, HealthData};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("{0} queue full")]
    Full(&'static str),
    #[error("{0} queue closed")]
    Closed(&'static str),
    #[error("{0} queue cannot be created with zero capacity")]
    ZeroCapacity(&'static str),
}

/// Producer side of a bounded FIFO owned by one consumer task.
///
/// Sends never block: a full queue is reported to the caller.
#[derive(Debug)]
pub struct Queue<T> {
    name: &'static str,
    tx: mpsc::Sender<T>,
}

impl<T> Clone for Queue<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            tx: self.tx.clone(),
        }
    }
}

impl<T> Queue<T> {
    pub fn try_send(&self, item: T) -> Result<(), QueueError> {
        self.tx.try_send(item).map_err(|e| match e {
            TrySendError::Full(_) => QueueError::Full(self.name),
            TrySendError::Closed(_) => QueueError::Closed(self.name),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }

    /// Items currently waiting in the queue.
    pub fn pending(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }
}

pub type CommandQueue = Queue<Envelope>;
pub type DiaryQueue = Queue<Diary>;
pub type DataQueue = Queue<HealthData>;

/// Creates a bounded queue; the receiver goes to the owning task.
pub fn bounded<T>(name: &'static str, capacity: usize) -> Result<(Queue<T>, mpsc::Receiver<T>), QueueError> {
    if capacity == 0 {
        return Err(QueueError::ZeroCapacity(name));
    }
    let (tx, rx) = mpsc::channel(capacity);
    Ok((Queue { name, tx }, rx))
}

pub fn command_queue(name: &'static str, capacity: usize) -> Result<(CommandQueue, mpsc::Receiver<Envelope>), QueueError> {
    bounded(name, capacity)
}
