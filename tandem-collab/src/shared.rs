//! A document replica shared between tasks.

use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};

use tandem_core::{CrdtBuffer, Delta, MergeOutcome};

/// Every mutation of a replica that more than one task can reach goes
/// through this lock.
#[derive(Debug, Clone)]
pub struct SharedBuffer {
    inner: Arc<Mutex<CrdtBuffer>>,
}

impl SharedBuffer {
    pub fn new(buffer: CrdtBuffer) -> Self {
        Self {
            inner: Arc::new(Mutex::new(buffer)),
        }
    }

    /// Exclusive access for multi-step edits.
    pub async fn lock(&self) -> MutexGuard<'_, CrdtBuffer> {
        self.inner.lock().await
    }

    pub async fn merge(&self, delta: &Delta) -> MergeOutcome {
        self.inner.lock().await.merge(delta)
    }

    pub async fn document(&self) -> String {
        self.inner.lock().await.document()
    }

    pub async fn snapshot(&self) -> Delta {
        self.inner.lock().await.snapshot()
    }

    /// Text and snapshot taken under one lock.
    pub async fn state(&self) -> (String, Delta) {
        let buffer = self.inner.lock().await;
        (buffer.document(), buffer.snapshot())
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }

    pub fn ptr_eq(&self, other: &SharedBuffer) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}
