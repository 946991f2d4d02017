//! # Sink / Publisher
//! Write contract against the external storage collaborators.
//!
//! `publish` must be idempotent under `listing_id`: republishing identical
//! content is a no-op success. That is what makes the pipeline
//! at-least-once-safe end-to-end — duplicates that bypass the dedup layer
//! (fingerprint TTL expiry racing a retry) are absorbed here instead of
//! corrupting downstream stores.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use metrics::counter;

use crate::types::NormalizedListing;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishResult {
    Stored,
    AlreadyStored,
    /// Terminal for this record; the reason is reported, not retried.
    Rejected(String),
}

/// Storage sink capability. Production wires the relational store and
/// full-text index behind this; tests use [`MemorySink`].
#[async_trait]
pub trait Sink: Send + Sync {
    async fn publish(&self, listing: &NormalizedListing) -> Result<PublishResult>;
}

/// In-memory idempotent sink keyed by `listing_id`.
#[derive(Debug, Default)]
pub struct MemorySink {
    inner: Mutex<HashMap<String, NormalizedListing>>,
    publish_calls: Mutex<u64>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("sink mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, listing_id: &str) -> Option<NormalizedListing> {
        self.inner
            .lock()
            .expect("sink mutex poisoned")
            .get(listing_id)
            .cloned()
    }

    /// Total `publish` invocations, including duplicates and rejections.
    pub fn publish_calls(&self) -> u64 {
        *self.publish_calls.lock().expect("sink mutex poisoned")
    }
}

#[async_trait]
impl Sink for MemorySink {
    async fn publish(&self, listing: &NormalizedListing) -> Result<PublishResult> {
        *self.publish_calls.lock().expect("sink mutex poisoned") += 1;

        let mut map = self.inner.lock().expect("sink mutex poisoned");
        let result = match map.get(&listing.listing_id) {
            None => {
                map.insert(listing.listing_id.clone(), listing.clone());
                PublishResult::Stored
            }
            Some(existing) if existing.content_eq(listing) => PublishResult::AlreadyStored,
            Some(_) => PublishResult::Rejected(format!(
                "listing {} already stored with different content",
                listing.listing_id
            )),
        };

        let label = match &result {
            PublishResult::Stored => "stored",
            PublishResult::AlreadyStored => "already_stored",
            PublishResult::Rejected(_) => "rejected",
        };
        counter!("harvester_publish_total", "result" => label).increment(1);
        Ok(result)
    }
}
