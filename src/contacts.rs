//! Contacts lookups used by the safety rails
//!
//! `ContactList` is a JSON file of known senders (exact addresses or
//! `*@domain` wildcards) with optional open rates. `CachedContacts` puts an
//! LRU with a TTL in front of any provider.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::error::{Result, TriageError};

#[async_trait]
pub trait ContactsProvider: Send + Sync {
    async fn is_known_contact(&self, address: &str) -> Result<bool>;

    /// Fraction of this sender's messages the user opens, when known
    async fn sender_open_rate(&self, address: &str) -> Result<Option<f64>>;
}

/// A known sender
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Contact {
    /// Address, or "*@domain.com" for a whole domain
    pub address: String,
    #[serde(default)]
    pub open_rate: Option<f64>,
    pub added_at: DateTime<Utc>,
}

/// File-backed contact list
#[derive(Debug, Default, Clone)]
pub struct ContactList {
    by_key: HashMap<String, usize>,
    contacts: Vec<Contact>,
}

impl ContactList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load contacts from a JSON file; a missing file is an empty list
    pub async fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }

        let json = tokio::fs::read_to_string(path).await?;
        let contacts: Vec<Contact> = serde_json::from_str(&json).map_err(|e| {
            TriageError::ConfigError(format!("Failed to parse contacts file: {}", e))
        })?;

        let mut list = Self::new();
        for contact in contacts {
            list.insert(contact);
        }
        Ok(list)
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let json = serde_json::to_string_pretty(&self.contacts)?;
        tokio::fs::write(path, json).await?;
        Ok(())
    }

    pub fn add(&mut self, address: &str, open_rate: Option<f64>) {
        self.insert(Contact {
            address: address.to_string(),
            open_rate,
            added_at: Utc::now(),
        });
    }

    fn insert(&mut self, mut contact: Contact) {
        contact.address = contact.address.trim().to_lowercase();
        match self.by_key.get(&contact.address) {
            Some(&idx) => self.contacts[idx] = contact,
            None => {
                self.by_key.insert(contact.address.clone(), self.contacts.len());
                self.contacts.push(contact);
            }
        }
    }

    fn lookup(&self, address: &str) -> Option<&Contact> {
        let address = address.trim().to_lowercase();
        if let Some(&idx) = self.by_key.get(&address) {
            return Some(&self.contacts[idx]);
        }
        let (_, domain) = address.rsplit_once('@')?;
        self.by_key
            .get(&format!("*@{}", domain))
            .map(|&idx| &self.contacts[idx])
    }

    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }
}

#[async_trait]
impl ContactsProvider for ContactList {
    async fn is_known_contact(&self, address: &str) -> Result<bool> {
        Ok(self.lookup(address).is_some())
    }

    async fn sender_open_rate(&self, address: &str) -> Result<Option<f64>> {
        Ok(self.lookup(address).and_then(|c| c.open_rate))
    }
}

#[derive(Debug, Clone, Copy)]
struct CachedEntry {
    fetched: Instant,
    known: bool,
    open_rate: Option<f64>,
}

/// LRU + TTL cache in front of another provider
pub struct CachedContacts {
    inner: Arc<dyn ContactsProvider>,
    cache: Mutex<LruCache<String, CachedEntry>>,
    ttl: Duration,
}

impl CachedContacts {
    pub fn new(inner: Arc<dyn ContactsProvider>, capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner,
            cache: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    fn cached(&self, key: &str) -> Option<CachedEntry> {
        let mut cache = self.cache.lock().unwrap_or_else(|p| p.into_inner());
        match cache.get(key) {
            Some(entry) if entry.fetched.elapsed() < self.ttl => Some(*entry),
            Some(_) => {
                cache.pop(key);
                None
            }
            None => None,
        }
    }

    async fn entry(&self, address: &str) -> Result<CachedEntry> {
        let key = address.trim().to_lowercase();
        if let Some(entry) = self.cached(&key) {
            return Ok(entry);
        }

        debug!(address = %key, "Contacts cache miss");
        let entry = CachedEntry {
            fetched: Instant::now(),
            known: self.inner.is_known_contact(&key).await?,
            open_rate: self.inner.sender_open_rate(&key).await?,
        };
        self.cache
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .put(key, entry);
        Ok(entry)
    }
}

#[async_trait]
impl ContactsProvider for CachedContacts {
    async fn is_known_contact(&self, address: &str) -> Result<bool> {
        Ok(self.entry(address).await?.known)
    }

    async fn sender_open_rate(&self, address: &str) -> Result<Option<f64>> {
        Ok(self.entry(address).await?.open_rate)
    }
}
