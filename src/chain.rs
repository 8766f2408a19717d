//! The call registry: correlation keys mapped to one-shot delivery slots.
//!
//! A caller inserts a slot right before sending its call frame; the read
//! loop's dispatch task takes the slot when the matching call-return frame
//! arrives. Removal is idempotent, so the caller's cleanup (on reply,
//! timeout or close) never races with delivery.

use std::collections::HashMap;

use bytes::Bytes;
use parking_lot::Mutex;
use rand::distr::Alphanumeric;
use rand::Rng;
use tokio::sync::oneshot;

const KEY_LENGTH: usize = 10;

/// What a call-return frame delivers to the waiting caller.
#[derive(Debug)]
pub(crate) struct ChainData {
    /// Still-encoded reply payload.
    pub data: Bytes,
    /// The peer's error text, if its handler failed.
    pub err: Option<String>,
}

#[derive(Default)]
pub(crate) struct Chain {
    slots: Mutex<HashMap<String, oneshot::Sender<ChainData>>>,
}

impl Chain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint a fresh correlation key and insert its delivery slot. The key
    /// is regenerated until it is unique within the registry.
    pub fn create(&self) -> (String, oneshot::Receiver<ChainData>) {
        let (tx, rx) = oneshot::channel();
        let mut slots = self.slots.lock();
        let key = loop {
            let key = random_string(KEY_LENGTH);
            if !slots.contains_key(&key) {
                break key;
            }
        };
        slots.insert(key.clone(), tx);
        (key, rx)
    }

    /// Remove and return the slot for `key`, if a caller is still waiting.
    pub fn take(&self, key: &str) -> Option<oneshot::Sender<ChainData>> {
        self.slots.lock().remove(key)
    }

    /// Drop the slot for `key`. Safe to call after `take`.
    pub fn remove(&self, key: &str) {
        self.slots.lock().remove(key);
    }
}

/// Random alphanumeric string, used for correlation keys and socket ids.
pub(crate) fn random_string(len: usize) -> String {
    rand::rng()
        .sample_iter(Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}
