//! Listing store abstraction, the in-memory backend and the batch upsert writer.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use estate_core::{IdentityKey, Listing, PropertyType, StoredListing, WriteStats};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

pub const DEFAULT_QUERY_LIMIT: usize = 50;
pub const MAX_QUERY_LIMIT: usize = 500;
pub const DEFAULT_OVERVIEW_DAYS: u32 = 7;

#[derive(Debug, Error)]
pub enum StorageError {
    /// No connection could be acquired. Fatal for the batch being written.
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("listing {key} is not persistable: missing `{field}`")]
    Malformed { key: String, field: &'static str },
    #[error("storage query failed: {0}")]
    Query(String),
}

impl StorageError {
    pub fn is_connection_level(&self) -> bool {
        matches!(self, StorageError::Unavailable(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

/// A connection held for the duration of one batch. Dropping it releases the connection.
#[async_trait]
pub trait BatchSession: Send {
    async fn upsert(&mut self, listing: &Listing) -> Result<UpsertOutcome, StorageError>;
}

/// Search filters over stored listings. Bounds are inclusive; a bound excludes rows
/// lacking the bounded value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListingQuery {
    pub city: Option<String>,
    pub source: Option<String>,
    pub min_price: Option<f64>,
    pub max_price: Option<f64>,
    pub min_size: Option<f64>,
    pub max_size: Option<f64>,
    pub property_type: Option<PropertyType>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl ListingQuery {
    pub fn effective_limit(&self) -> usize {
        self.limit
            .unwrap_or(DEFAULT_QUERY_LIMIT)
            .clamp(1, MAX_QUERY_LIMIT)
    }

    pub fn effective_offset(&self) -> usize {
        self.offset.unwrap_or(0)
    }

    pub fn matches(&self, listing: &Listing) -> bool {
        city_matches(listing, self.city.as_deref())
            && self
                .source
                .as_deref()
                .map_or(true, |source| listing.source == source)
            && within(listing.price, self.min_price, self.max_price)
            && within(listing.size_m2, self.min_size, self.max_size)
            && self
                .property_type
                .map_or(true, |wanted| listing.property_type == wanted)
    }
}

fn within(value: Option<f64>, min: Option<f64>, max: Option<f64>) -> bool {
    if min.is_none() && max.is_none() {
        return true;
    }
    value.is_some_and(|v| min.map_or(true, |lo| v >= lo) && max.map_or(true, |hi| v <= hi))
}

/// Removes whitespace and uppercases, matching how postal codes are stored.
pub fn compact_postal_code(value: &str) -> String {
    value
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_uppercase()
}

/// Scope of a market overview. The city takes precedence over the postal code.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketFilter {
    pub city: Option<String>,
    pub postal_code: Option<String>,
    /// Only listings scraped at or after this instant count.
    pub since: Option<DateTime<Utc>>,
}

impl MarketFilter {
    /// Location filter over the last `days` days; zero days means no time window.
    pub fn recent(
        city: Option<String>,
        postal_code: Option<String>,
        days: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            city,
            postal_code,
            since: (days > 0).then(|| now - chrono::Duration::days(i64::from(days))),
        }
    }

    pub fn postal_key(&self) -> Option<String> {
        if self.city.is_some() {
            return None;
        }
        self.postal_code
            .as_deref()
            .map(compact_postal_code)
            .filter(|p| !p.is_empty())
    }

    pub fn matches(&self, listing: &Listing) -> bool {
        city_matches(listing, self.city.as_deref())
            && self
                .postal_key()
                .map_or(true, |key| listing.postal_code.as_deref() == Some(key.as_str()))
            && self.since.map_or(true, |since| listing.scraped_at >= since)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MarketOverview {
    pub city: Option<String>,
    pub postal_code: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub total_listings: u64,
    pub avg_price: Option<f64>,
    pub min_price: Option<f64>,
    pub max_price: Option<f64>,
    pub avg_price_per_m2: Option<f64>,
}

#[async_trait]
pub trait ListingStore: Send + Sync {
    /// Acquires a session for one batch. An error here is connection-level.
    async fn begin_batch(&self) -> Result<Box<dyn BatchSession>, StorageError>;

    async fn get(&self, key: &IdentityKey) -> Result<Option<StoredListing>, StorageError>;

    async fn count(&self) -> Result<u64, StorageError>;

    /// Listings matching `query`, most recently scraped first.
    async fn recent(&self, query: &ListingQuery) -> Result<Vec<StoredListing>, StorageError>;

    /// Price statistics over listings matching `filter`; rows without a price are
    /// counted but not averaged.
    async fn market_overview(&self, filter: &MarketFilter)
        -> Result<MarketOverview, StorageError>;
}

fn require_identity(listing: &Listing) -> Result<IdentityKey, StorageError> {
    let key = || {
        format!(
            "{}:{}",
            listing.source,
            listing.source_id.as_deref().unwrap_or("<none>")
        )
    };
    if let Some(field) = listing.missing_required_field() {
        return Err(StorageError::Malformed { key: key(), field });
    }
    listing.identity().ok_or_else(|| StorageError::Malformed {
        key: key(),
        field: "source_id",
    })
}

/// Writes batches with at-most-one-row-per-identity semantics.
#[derive(Clone)]
pub struct UpsertWriter {
    store: Arc<dyn ListingStore>,
}

impl UpsertWriter {
    pub fn new(store: Arc<dyn ListingStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn ListingStore> {
        &self.store
    }

    /// Upserts every listing of `batch`, counting per-row failures instead of aborting.
    ///
    /// Connection-level failures, on acquiring the session or mid-batch, end the batch
    /// and are returned as an error. Rows already upserted before that point stay written.
    pub async fn write(&self, batch: &[Listing]) -> Result<WriteStats, StorageError> {
        let mut stats = WriteStats::default();
        if batch.is_empty() {
            return Ok(stats);
        }

        let mut session = self.store.begin_batch().await?;
        for listing in batch {
            if let Err(err) = require_identity(listing) {
                warn!(source = %listing.source, "skipping row: {err}");
                stats.errors += 1;
                continue;
            }
            match session.upsert(listing).await {
                Ok(UpsertOutcome::Inserted) => stats.inserted += 1,
                Ok(UpsertOutcome::Updated) => stats.updated += 1,
                Err(err) if err.is_connection_level() => {
                    warn!(
                        source = %listing.source,
                        written = stats.inserted + stats.updated,
                        "connection lost mid-batch: {err}"
                    );
                    return Err(err);
                }
                Err(err) => {
                    warn!(
                        source = %listing.source,
                        source_id = listing.source_id.as_deref().unwrap_or_default(),
                        "row upsert failed: {err}"
                    );
                    stats.errors += 1;
                }
            }
        }
        drop(session);

        debug!(
            rows = batch.len(),
            inserted = stats.inserted,
            updated = stats.updated,
            errors = stats.errors,
            "batch written"
        );
        Ok(stats)
    }
}

#[derive(Debug)]
struct MemoryInner {
    rows: Mutex<BTreeMap<IdentityKey, StoredListing>>,
    unavailable: AtomicBool,
    /// Row upserts a session accepts before its connection drops.
    upserts_before_drop: AtomicUsize,
    open_sessions: AtomicUsize,
    sessions_opened: AtomicUsize,
}

impl Default for MemoryInner {
    fn default() -> Self {
        Self {
            rows: Mutex::default(),
            unavailable: AtomicBool::new(false),
            upserts_before_drop: AtomicUsize::new(usize::MAX),
            open_sessions: AtomicUsize::new(0),
            sessions_opened: AtomicUsize::new(0),
        }
    }
}

/// Process-local store with the same upsert contract as the Postgres backend.
#[derive(Debug, Clone, Default)]
pub struct MemoryListingStore {
    inner: Arc<MemoryInner>,
}

impl MemoryListingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates a total outage: new sessions fail until made available again.
    pub fn set_available(&self, available: bool) {
        self.inner.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Simulates a connection lost mid-batch: each session accepts `rows` upserts,
    /// then every further upsert on it fails as unavailable.
    pub fn drop_connection_after(&self, rows: usize) {
        self.inner.upserts_before_drop.store(rows, Ordering::SeqCst);
    }

    pub fn open_sessions(&self) -> usize {
        self.inner.open_sessions.load(Ordering::SeqCst)
    }

    pub fn sessions_opened(&self) -> usize {
        self.inner.sessions_opened.load(Ordering::SeqCst)
    }

    pub async fn all(&self) -> Vec<StoredListing> {
        self.inner.rows.lock().await.values().cloned().collect()
    }
}

struct MemorySession {
    inner: Arc<MemoryInner>,
    upserts: usize,
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        self.inner.open_sessions.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl BatchSession for MemorySession {
    async fn upsert(&mut self, listing: &Listing) -> Result<UpsertOutcome, StorageError> {
        if self.upserts >= self.inner.upserts_before_drop.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("in-memory connection dropped".into()));
        }
        self.upserts += 1;
        let key = require_identity(listing)?;
        let mut rows = self.inner.rows.lock().await;
        match rows.entry(key) {
            Entry::Vacant(slot) => {
                let id = slot.key().stable_id();
                slot.insert(StoredListing {
                    id,
                    listing: listing.clone(),
                    first_seen_at: listing.scraped_at,
                    updated_at: Utc::now(),
                });
                Ok(UpsertOutcome::Inserted)
            }
            Entry::Occupied(mut slot) => {
                let existing = slot.get_mut();
                if existing.listing != *listing {
                    existing.listing = listing.clone();
                    existing.updated_at = Utc::now();
                }
                Ok(UpsertOutcome::Updated)
            }
        }
    }
}

fn city_matches(listing: &Listing, city: Option<&str>) -> bool {
    match city {
        None => true,
        Some(city) => listing
            .city
            .as_deref()
            .is_some_and(|c| c.eq_ignore_ascii_case(city.trim())),
    }
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

#[async_trait]
impl ListingStore for MemoryListingStore {
    async fn begin_batch(&self) -> Result<Box<dyn BatchSession>, StorageError> {
        if self.inner.unavailable.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable(
                "in-memory store marked unavailable".into(),
            ));
        }
        self.inner.open_sessions.fetch_add(1, Ordering::SeqCst);
        self.inner.sessions_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemorySession {
            inner: Arc::clone(&self.inner),
            upserts: 0,
        }))
    }

    async fn get(&self, key: &IdentityKey) -> Result<Option<StoredListing>, StorageError> {
        Ok(self.inner.rows.lock().await.get(key).cloned())
    }

    async fn count(&self) -> Result<u64, StorageError> {
        Ok(self.inner.rows.lock().await.len() as u64)
    }

    async fn recent(&self, query: &ListingQuery) -> Result<Vec<StoredListing>, StorageError> {
        let rows = self.inner.rows.lock().await;
        let mut out = rows
            .values()
            .filter(|row| query.matches(&row.listing))
            .cloned()
            .collect::<Vec<_>>();
        out.sort_by(|a, b| b.listing.scraped_at.cmp(&a.listing.scraped_at));
        Ok(out
            .into_iter()
            .skip(query.effective_offset())
            .take(query.effective_limit())
            .collect())
    }

    async fn market_overview(
        &self,
        filter: &MarketFilter,
    ) -> Result<MarketOverview, StorageError> {
        let rows = self.inner.rows.lock().await;
        let matching = rows
            .values()
            .filter(|row| filter.matches(&row.listing))
            .collect::<Vec<_>>();
        let prices = matching
            .iter()
            .filter_map(|row| row.listing.price)
            .collect::<Vec<_>>();
        let per_m2 = matching
            .iter()
            .filter_map(|row| row.listing.price_per_m2())
            .collect::<Vec<_>>();

        Ok(MarketOverview {
            city: filter.city.clone(),
            postal_code: filter.postal_key(),
            since: filter.since,
            total_listings: matching.len() as u64,
            avg_price: mean(&prices),
            min_price: prices.iter().copied().reduce(f64::min),
            max_price: prices.iter().copied().reduce(f64::max),
            avg_price_per_m2: mean(&per_m2),
        })
    }
}
