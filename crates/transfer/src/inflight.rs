//! At most one running transfer per key.
//!
//! The first caller for a key runs the transfer; callers arriving while it
//! runs wait on a watch channel and receive a clone of its outcome. If the
//! running caller is dropped before finishing, a waiting caller takes over.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tracing::debug;

use crate::TransferError;

type Outcome<T> = Option<Result<T, Arc<TransferError>>>;

enum Claim<T> {
    Lead(watch::Sender<Outcome<T>>),
    Follow(watch::Receiver<Outcome<T>>),
}

/// Registry of running transfers keyed by an opaque string.
pub struct InflightRegistry<T> {
    slots: Arc<Mutex<HashMap<String, watch::Receiver<Outcome<T>>>>>,
}

impl<T> Default for InflightRegistry<T> {
    fn default() -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> InflightRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently running.
    pub fn len(&self) -> usize {
        self.slots.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs `f` unless a run for `key` is already in flight, in which case
    /// its outcome is awaited instead. The runner gets its own error back;
    /// joiners get a copy wrapped in [`TransferError::Shared`].
    pub async fn run<F, Fut>(&self, key: &str, f: F) -> Result<T, TransferError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, TransferError>>,
    {
        let tx = loop {
            match self.claim(key) {
                Claim::Lead(tx) => break tx,
                Claim::Follow(mut rx) => {
                    debug!(key, "joining in-flight transfer");
                    let outcome = match rx.wait_for(Option::is_some).await {
                        Ok(value) => value.clone(),
                        Err(_) => None,
                    };
                    match outcome {
                        Some(Ok(v)) => return Ok(v),
                        Some(Err(e)) => return Err(TransferError::Shared(e)),
                        // The runner went away without an outcome.
                        None => continue,
                    }
                }
            }
        };

        let guard = LeadGuard {
            slots: Arc::clone(&self.slots),
            key: key.to_string(),
            tx: Some(tx),
        };
        let result = f().await;
        guard.finish(result)
    }

    fn claim(&self, key: &str) -> Claim<T> {
        let mut slots = self.slots.lock().unwrap();
        if let Some(rx) = slots.get(key) {
            return Claim::Follow(rx.clone());
        }
        let (tx, rx) = watch::channel(None);
        slots.insert(key.to_string(), rx);
        Claim::Lead(tx)
    }
}

struct LeadGuard<T> {
    slots: Arc<Mutex<HashMap<String, watch::Receiver<Outcome<T>>>>>,
    key: String,
    tx: Option<watch::Sender<Outcome<T>>>,
}

impl<T: Clone> LeadGuard<T> {
    fn finish(mut self, result: Result<T, TransferError>) -> Result<T, TransferError> {
        self.slots.lock().unwrap().remove(&self.key);
        let Some(tx) = self.tx.take() else {
            return result;
        };
        // Once the key is gone no new joiner can subscribe.
        if tx.receiver_count() == 0 {
            return result;
        }
        match result {
            Ok(v) => {
                let _ = tx.send(Some(Ok(v.clone())));
                Ok(v)
            }
            Err(e) => {
                let _ = tx.send(Some(Err(Arc::new(e.duplicate()))));
                Err(e)
            }
        }
    }
}

impl<T> Drop for LeadGuard<T> {
    fn drop(&mut self) {
        if self.tx.is_some() {
            self.slots.lock().unwrap().remove(&self.key);
        }
    }
}
