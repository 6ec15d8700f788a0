use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tokio_util::sync::CancellationToken;

/// Cancellation tokens for in-flight completions, addressable by the ask id of
/// a turn or by an individual assistant message id.
#[derive(Default)]
pub struct AbortRegistry {
    tokens: Mutex<HashMap<String, Vec<(u64, CancellationToken)>>>,
    next_ticket: AtomicU64,
}

impl AbortRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Files one token under every key given. The returned ticket releases it.
    pub fn register(&self, keys: &[&str], token: &CancellationToken) -> u64 {
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let mut tokens = self.tokens.lock().unwrap_or_else(|e| e.into_inner());
        for key in keys {
            tokens
                .entry(key.to_string())
                .or_default()
                .push((ticket, token.clone()));
        }
        ticket
    }

    /// Cancels everything filed under `key`. Returns whether anything was found.
    pub fn abort(&self, key: &str) -> bool {
        let found = self
            .tokens
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
        match found {
            Some(tokens) => {
                tracing::debug!("Aborting {} completion(s) for {}", tokens.len(), key);
                for (_, token) in tokens {
                    token.cancel();
                }
                true
            }
            None => false,
        }
    }

    pub fn release(&self, keys: &[&str], ticket: u64) {
        let mut tokens = self.tokens.lock().unwrap_or_else(|e| e.into_inner());
        for key in keys {
            if let Some(list) = tokens.get_mut(*key) {
                list.retain(|(t, _)| *t != ticket);
                if list.is_empty() {
                    tokens.remove(*key);
                }
            }
        }
    }

    pub fn is_registered(&self, key: &str) -> bool {
        self.tokens
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(key)
    }
}
