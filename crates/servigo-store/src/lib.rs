//! Hosted-store access: REST query client, in-memory fixtures, change feed.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info_span, warn};
use uuid::Uuid;

use servigo_core::{Category, Listing, Profile, Provider, Review, ServiceImage};

pub const CRATE_NAME: &str = "servigo-store";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("decoding {table} rows: {source}")]
    Decode {
        table: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("{0}")]
    Message(String),
}

/// Query surface the marketplace consumes from the hosted backend. Point
/// lookups report a clean miss as `Ok(None)`.
#[async_trait]
pub trait MarketStore: Send + Sync {
    /// Active listings, newest first.
    async fn active_listings(&self) -> Result<Vec<Listing>, StoreError>;

    async fn categories(&self) -> Result<Vec<Category>, StoreError>;

    async fn profile(&self, user_id: Uuid) -> Result<Option<Profile>, StoreError>;

    async fn primary_image(&self, listing_id: Uuid) -> Result<Option<ServiceImage>, StoreError>;

    async fn provider(&self, provider_id: Uuid) -> Result<Option<Provider>, StoreError>;

    /// Active listings owned by one provider, newest first.
    async fn provider_listings(&self, provider_id: Uuid) -> Result<Vec<Listing>, StoreError>;

    /// Reviews for one provider, newest first.
    async fn reviews(&self, provider_id: Uuid) -> Result<Vec<Review>, StoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub base_url: String,
    pub api_key: String,
    pub timeout: Duration,
    pub max_concurrent_requests: usize,
    pub backoff: BackoffPolicy,
}

impl StoreConfig {
    pub fn from_env() -> Self {
        Self {
            base_url: std::env::var("SERVIGO_API_URL")
                .unwrap_or_else(|_| "http://localhost:54321".to_string()),
            api_key: std::env::var("SERVIGO_API_KEY").unwrap_or_default(),
            timeout: Duration::from_secs(
                std::env::var("SERVIGO_HTTP_TIMEOUT_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(20),
            ),
            max_concurrent_requests: 16,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// REST client for the hosted relational store. Filters and ordering travel
/// as query parameters; transient failures retry under [`BackoffPolicy`].
#[derive(Debug)]
pub struct RestMarketStore {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    limit: Arc<Semaphore>,
    backoff: BackoffPolicy,
}

impl RestMarketStore {
    pub fn new(config: StoreConfig) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key,
            limit: Arc::new(Semaphore::new(config.max_concurrent_requests.max(1))),
            backoff: config.backoff,
        })
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    async fn fetch_rows<T: DeserializeOwned>(
        &self,
        table: &'static str,
        query: &[(&str, String)],
    ) -> Result<Vec<T>, StoreError> {
        let _permit = self.limit.acquire().await.expect("semaphore not closed");
        let url = self.table_url(table);
        let span = info_span!("store_query", table, url);
        let _guard = span.enter();

        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            let resp_result = self
                .client
                .get(&url)
                .query(query)
                .header("apikey", &self.api_key)
                .bearer_auth(&self.api_key)
                .send()
                .await;

            match resp_result {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?;
                        return serde_json::from_slice(&body)
                            .map_err(|source| StoreError::Decode { table, source });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    return Err(StoreError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(StoreError::Request(err));
                }
            }
        }

        Err(StoreError::Request(
            last_request_error.expect("retry loop should capture a request error"),
        ))
    }

    async fn fetch_one<T: DeserializeOwned>(
        &self,
        table: &'static str,
        mut query: Vec<(&str, String)>,
    ) -> Result<Option<T>, StoreError> {
        query.push(("limit", "1".to_string()));
        let mut rows: Vec<T> = self.fetch_rows(table, &query).await?;
        Ok(rows.pop())
    }
}

/// Wire shape of a review row with its embedded reviewer profile.
#[derive(Debug, Deserialize)]
struct ReviewRow {
    id: Uuid,
    service_provider_id: Uuid,
    rating: i32,
    comment: Option<String>,
    created_at: DateTime<Utc>,
    profiles: Option<ReviewerRow>,
}

#[derive(Debug, Deserialize)]
struct ReviewerRow {
    first_name: Option<String>,
    last_name: Option<String>,
}

impl From<ReviewRow> for Review {
    fn from(row: ReviewRow) -> Self {
        let reviewer_name = row.profiles.and_then(|p| {
            let first = p.first_name.unwrap_or_default();
            let last = p.last_name.unwrap_or_default();
            let joined = format!("{first} {last}");
            let joined = joined.trim();
            if joined.is_empty() {
                None
            } else {
                Some(joined.to_string())
            }
        });
        Review {
            id: row.id,
            provider_id: row.service_provider_id,
            rating: row.rating,
            comment: row.comment,
            reviewer_name,
            created_at: row.created_at,
        }
    }
}

#[async_trait]
impl MarketStore for RestMarketStore {
    async fn active_listings(&self) -> Result<Vec<Listing>, StoreError> {
        self.fetch_rows(
            "services",
            &[
                ("select", "*".to_string()),
                ("is_active", "eq.true".to_string()),
                ("order", "created_at.desc".to_string()),
            ],
        )
        .await
    }

    async fn categories(&self) -> Result<Vec<Category>, StoreError> {
        self.fetch_rows("job_categories", &[("select", "*".to_string())])
            .await
    }

    async fn profile(&self, user_id: Uuid) -> Result<Option<Profile>, StoreError> {
        self.fetch_one(
            "profiles",
            vec![
                (
                    "select",
                    "id,first_name,last_name,profile_photo_url".to_string(),
                ),
                ("id", format!("eq.{user_id}")),
            ],
        )
        .await
    }

    async fn primary_image(&self, listing_id: Uuid) -> Result<Option<ServiceImage>, StoreError> {
        self.fetch_one(
            "service_images",
            vec![
                ("select", "service_id,image_url,is_primary".to_string()),
                ("service_id", format!("eq.{listing_id}")),
                ("is_primary", "eq.true".to_string()),
            ],
        )
        .await
    }

    async fn provider(&self, provider_id: Uuid) -> Result<Option<Provider>, StoreError> {
        self.fetch_one(
            "service_providers",
            vec![
                ("select", "*".to_string()),
                ("id", format!("eq.{provider_id}")),
            ],
        )
        .await
    }

    async fn provider_listings(&self, provider_id: Uuid) -> Result<Vec<Listing>, StoreError> {
        self.fetch_rows(
            "services",
            &[
                ("select", "*".to_string()),
                ("service_provider_id", format!("eq.{provider_id}")),
                ("is_active", "eq.true".to_string()),
                ("order", "created_at.desc".to_string()),
            ],
        )
        .await
    }

    async fn reviews(&self, provider_id: Uuid) -> Result<Vec<Review>, StoreError> {
        let rows: Vec<ReviewRow> = self
            .fetch_rows(
                "reviews",
                &[
                    ("select", "*,profiles(first_name,last_name)".to_string()),
                    ("service_provider_id", format!("eq.{provider_id}")),
                    ("order", "created_at.desc".to_string()),
                ],
            )
            .await?;
        Ok(rows.into_iter().map(Review::from).collect())
    }
}

/// Fixture-first in-memory store for tests and offline development. Seeded
/// builder-style; per-table fail switches simulate outages.
#[derive(Default)]
pub struct MemoryMarketStore {
    listings: RwLock<Vec<Listing>>,
    categories: Vec<Category>,
    profiles: Vec<Profile>,
    providers: Vec<Provider>,
    images: Vec<ServiceImage>,
    reviews: Vec<Review>,
    fail_listings: bool,
    fail_profiles: bool,
    fail_images: bool,
    fail_providers: bool,
}

impl MemoryMarketStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_listings(self, listings: Vec<Listing>) -> Self {
        *self.listings.write().expect("listings lock") = listings;
        self
    }

    pub fn with_categories(mut self, categories: Vec<Category>) -> Self {
        self.categories = categories;
        self
    }

    pub fn with_profiles(mut self, profiles: Vec<Profile>) -> Self {
        self.profiles = profiles;
        self
    }

    pub fn with_providers(mut self, providers: Vec<Provider>) -> Self {
        self.providers = providers;
        self
    }

    pub fn with_images(mut self, images: Vec<ServiceImage>) -> Self {
        self.images = images;
        self
    }

    pub fn with_reviews(mut self, reviews: Vec<Review>) -> Self {
        self.reviews = reviews;
        self
    }

    pub fn failing_listings(mut self) -> Self {
        self.fail_listings = true;
        self
    }

    pub fn failing_profiles(mut self) -> Self {
        self.fail_profiles = true;
        self
    }

    pub fn failing_images(mut self) -> Self {
        self.fail_images = true;
        self
    }

    pub fn failing_providers(mut self) -> Self {
        self.fail_providers = true;
        self
    }

    /// Append a listing after construction, for change-feed scenarios.
    pub fn push_listing(&self, listing: Listing) {
        self.listings.write().expect("listings lock").push(listing);
    }

    fn sorted_active(&self, mut rows: Vec<Listing>) -> Vec<Listing> {
        rows.retain(|l| l.is_active);
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        rows
    }
}

#[async_trait]
impl MarketStore for MemoryMarketStore {
    async fn active_listings(&self) -> Result<Vec<Listing>, StoreError> {
        if self.fail_listings {
            return Err(StoreError::Message("listings query unavailable".into()));
        }
        let rows = self.listings.read().expect("listings lock").clone();
        Ok(self.sorted_active(rows))
    }

    async fn categories(&self) -> Result<Vec<Category>, StoreError> {
        Ok(self.categories.clone())
    }

    async fn profile(&self, user_id: Uuid) -> Result<Option<Profile>, StoreError> {
        if self.fail_profiles {
            return Err(StoreError::Message("profiles query unavailable".into()));
        }
        Ok(self.profiles.iter().find(|p| p.id == user_id).cloned())
    }

    async fn primary_image(&self, listing_id: Uuid) -> Result<Option<ServiceImage>, StoreError> {
        if self.fail_images {
            return Err(StoreError::Message("images query unavailable".into()));
        }
        Ok(self
            .images
            .iter()
            .find(|i| i.listing_id == listing_id && i.is_primary)
            .cloned())
    }

    async fn provider(&self, provider_id: Uuid) -> Result<Option<Provider>, StoreError> {
        if self.fail_providers {
            return Err(StoreError::Message("providers query unavailable".into()));
        }
        Ok(self
            .providers
            .iter()
            .find(|p| p.id == Some(provider_id))
            .cloned())
    }

    async fn provider_listings(&self, provider_id: Uuid) -> Result<Vec<Listing>, StoreError> {
        let rows = self
            .listings
            .read()
            .expect("listings lock")
            .iter()
            .filter(|l| l.provider_id == Some(provider_id))
            .cloned()
            .collect();
        Ok(self.sorted_active(rows))
    }

    async fn reviews(&self, provider_id: Uuid) -> Result<Vec<Review>, StoreError> {
        let mut rows: Vec<Review> = self
            .reviews
            .iter()
            .filter(|r| r.provider_id == provider_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rows)
    }
}

/// A change to the listings table. Payload-free: every subscriber reacts by
/// re-running its full load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListingChange {
    Inserted,
    Updated,
    Deleted,
}

/// Broadcast channel carrying listing-table change notifications. Cloneable;
/// anything holding a handle may fire it (the posting form's success
/// callback does).
#[derive(Debug, Clone)]
pub struct ListingChangeFeed {
    tx: broadcast::Sender<ListingChange>,
}

impl Default for ListingChangeFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl ListingChangeFeed {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(16);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ListingChange> {
        self.tx.subscribe()
    }

    /// Fire a notification. A send with no live subscribers is not an error.
    pub fn notify(&self, change: ListingChange) {
        let _ = self.tx.send(change);
    }
}

/// Order-insensitive fingerprint of the active listing set, used to detect
/// drift between polls.
pub fn listings_fingerprint(listings: &[Listing]) -> u64 {
    let mut ids: Vec<(Uuid, i64)> = listings
        .iter()
        .map(|l| (l.id, l.created_at.timestamp_millis()))
        .collect();
    ids.sort();
    let mut hasher = DefaultHasher::new();
    ids.hash(&mut hasher);
    hasher.finish()
}

/// Drives a [`ListingChangeFeed`] by polling the listings table and emitting
/// an event whenever the fingerprint moves.
pub struct PollingChangeWatcher {
    store: Arc<dyn MarketStore>,
    feed: ListingChangeFeed,
    interval: Duration,
}

impl PollingChangeWatcher {
    pub fn new(store: Arc<dyn MarketStore>, feed: ListingChangeFeed, interval: Duration) -> Self {
        Self {
            store,
            feed,
            interval,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut last: Option<u64> = None;
            loop {
                tokio::time::sleep(self.interval).await;
                match self.store.active_listings().await {
                    Ok(listings) => {
                        let current = listings_fingerprint(&listings);
                        if let Some(previous) = last {
                            if previous != current {
                                debug!("listing set changed; notifying subscribers");
                                self.feed.notify(ListingChange::Updated);
                            }
                        }
                        last = Some(current);
                    }
                    Err(err) => {
                        warn!("change poll failed, skipping tick: {err}");
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn listing_at(ts: i64) -> Listing {
        Listing {
            id: Uuid::new_v4(),
            provider_id: None,
            user_id: None,
            category_id: None,
            description: None,
            location: Some("Sousse".into()),
            hourly_rate: None,
            business_name: None,
            is_active: true,
            created_at: Utc.timestamp_opt(ts, 0).unwrap(),
        }
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn status_classification_retries_server_side_failures_only() {
        assert_eq!(
            classify_status(StatusCode::INTERNAL_SERVER_ERROR),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
        assert_eq!(
            classify_status(StatusCode::UNAUTHORIZED),
            RetryDisposition::NonRetryable
        );
    }

    #[tokio::test]
    async fn memory_store_orders_and_filters_listings() {
        let mut inactive = listing_at(300);
        inactive.is_active = false;
        let store = MemoryMarketStore::new().with_listings(vec![
            listing_at(100),
            listing_at(200),
            inactive.clone(),
        ]);

        let rows = store.active_listings().await.expect("listings");
        assert_eq!(rows.len(), 2);
        assert!(rows[0].created_at > rows[1].created_at);
        assert!(rows.iter().all(|l| l.id != inactive.id));
    }

    #[tokio::test]
    async fn memory_store_fail_switch_surfaces_error() {
        let store = MemoryMarketStore::new().failing_listings();
        assert!(store.active_listings().await.is_err());
    }

    #[test]
    fn fingerprint_moves_on_insert_and_ignores_order() {
        let a = listing_at(100);
        let b = listing_at(200);
        let before = listings_fingerprint(&[a.clone(), b.clone()]);
        let reordered = listings_fingerprint(&[b.clone(), a.clone()]);
        assert_eq!(before, reordered);

        let after = listings_fingerprint(&[a, b, listing_at(300)]);
        assert_ne!(before, after);
    }

    #[tokio::test]
    async fn change_feed_delivers_to_subscribers() {
        let feed = ListingChangeFeed::new();
        let mut rx = feed.subscribe();
        feed.notify(ListingChange::Inserted);
        assert_eq!(rx.recv().await.unwrap(), ListingChange::Inserted);
    }
}
