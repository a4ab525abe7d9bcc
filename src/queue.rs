#![forbid(unsafe_code)]

//! Bounded multi-producer multi-consumer hand-off between worker pools.
//!
//! Producers wait when the queue is full; consumers share one receiver behind
//! an async mutex so each item is delivered to exactly one worker.

use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};

pub fn bounded<T>(capacity: usize) -> (QueueSender<T>, QueueReceiver<T>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        QueueSender { inner: tx },
        QueueReceiver {
            inner: Arc::new(Mutex::new(rx)),
        },
    )
}

#[derive(Debug)]
pub struct QueueSender<T> {
    inner: mpsc::Sender<T>,
}

impl<T> Clone for QueueSender<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> QueueSender<T> {
    /// Waits for a free slot. Hands the item back when every consumer is gone.
    #[cfg(test)]
    pub async fn push(&self, item: T) -> Result<(), T> {
        self.inner.send(item).await.map_err(|err| err.0)
    }

    /// Waits for a free slot without committing an item yet, so the caller
    /// keeps ownership if it gives up while waiting.
    pub async fn reserve(&self) -> Option<QueuePermit<'_, T>> {
        self.inner
            .reserve()
            .await
            .ok()
            .map(|inner| QueuePermit { inner })
    }

    #[cfg(test)]
    pub fn buffered(&self) -> usize {
        self.inner.max_capacity() - self.inner.capacity()
    }
}

pub struct QueuePermit<'a, T> {
    inner: mpsc::Permit<'a, T>,
}

impl<T> QueuePermit<'_, T> {
    pub fn send(self, item: T) {
        self.inner.send(item);
    }
}

#[derive(Debug)]
pub struct QueueReceiver<T> {
    inner: Arc<Mutex<mpsc::Receiver<T>>>,
}

impl<T> Clone for QueueReceiver<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> QueueReceiver<T> {
    /// Returns `None` once every sender is dropped and the buffer is empty.
    pub async fn pop(&self) -> Option<T> {
        self.inner.lock().await.recv().await
    }

    /// Closes the queue and returns whatever was still buffered.
    pub async fn close_and_drain(&self) -> Vec<T> {
        let mut rx = self.inner.lock().await;
        rx.close();
        let mut leftovers = Vec::new();
        while let Ok(item) = rx.try_recv() {
            leftovers.push(item);
        }
        leftovers
    }
}
