//! Listing pipeline: load, enrich, publish, filter, partition.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, warn};

use servigo_core::{
    service_kind_for_name, Category, EnrichedListing, FilterCriteria, Listing, Provider,
    ServiceKind,
};
use servigo_store::{ListingChangeFeed, MarketStore, StoreError};

pub const CRATE_NAME: &str = "servigo-catalog";

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("loading listings: {0}")]
    Store(#[from] StoreError),
}

/// One atomically-published view of the enriched listing set. Readers never
/// observe a partially-enriched set.
#[derive(Debug, Clone)]
pub struct CatalogSnapshot {
    pub listings: Arc<Vec<EnrichedListing>>,
    pub categories: Arc<Vec<Category>>,
    pub generation: u64,
    pub loaded_at: Option<DateTime<Utc>>,
}

impl Default for CatalogSnapshot {
    fn default() -> Self {
        Self {
            listings: Arc::new(Vec::new()),
            categories: Arc::new(Vec::new()),
            generation: 0,
            loaded_at: None,
        }
    }
}

/// Owns the published listing snapshot for one UI session and re-derives it
/// from the store on demand or on change notifications.
pub struct ListingCatalog {
    store: Arc<dyn MarketStore>,
    snapshot_tx: watch::Sender<CatalogSnapshot>,
    load_seq: AtomicU64,
}

impl ListingCatalog {
    pub fn new(store: Arc<dyn MarketStore>) -> Arc<Self> {
        let (snapshot_tx, _rx) = watch::channel(CatalogSnapshot::default());
        Arc::new(Self {
            store,
            snapshot_tx,
            load_seq: AtomicU64::new(0),
        })
    }

    pub fn snapshot(&self) -> CatalogSnapshot {
        self.snapshot_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<CatalogSnapshot> {
        self.snapshot_tx.subscribe()
    }

    /// Full load: primary listing query, category query, then concurrent
    /// per-listing enrichment, published as one snapshot.
    ///
    /// Only the primary query can fail the load. Category-query failure
    /// degrades to the previously-published category set; every per-listing
    /// sub-lookup failure degrades to placeholder/absent values.
    pub async fn load(&self) -> Result<CatalogSnapshot, CatalogError> {
        let generation = self.load_seq.fetch_add(1, Ordering::SeqCst) + 1;

        let listings = self.store.active_listings().await?;

        let categories = match self.store.categories().await {
            Ok(rows) => Arc::new(rows),
            Err(err) => {
                warn!("category query failed, keeping previous set: {err}");
                Arc::clone(&self.snapshot_tx.borrow().categories)
            }
        };

        let mut join = JoinSet::new();
        for (idx, listing) in listings.into_iter().enumerate() {
            let store = Arc::clone(&self.store);
            join.spawn(async move { (idx, enrich_listing(store, listing).await) });
        }

        let mut indexed = Vec::with_capacity(join.len());
        while let Some(joined) = join.join_next().await {
            match joined {
                Ok(pair) => indexed.push(pair),
                Err(err) => warn!("enrichment task failed: {err}"),
            }
        }
        indexed.sort_by_key(|(idx, _)| *idx);

        let snapshot = CatalogSnapshot {
            listings: Arc::new(indexed.into_iter().map(|(_, e)| e).collect()),
            categories,
            generation,
            loaded_at: Some(Utc::now()),
        };

        // Loads may overlap when change notifications arrive mid-fetch; the
        // most recently *started* load wins and stale results are dropped.
        let published = snapshot.clone();
        self.snapshot_tx.send_if_modified(|current| {
            if generation < current.generation {
                debug!(
                    generation,
                    latest = current.generation,
                    "dropping superseded load"
                );
                false
            } else {
                *current = published;
                true
            }
        });

        Ok(snapshot)
    }

    /// Re-run [`Self::load`] on every change notification for as long as the
    /// returned handle lives. Abort the handle on teardown.
    pub fn watch_changes(self: &Arc<Self>, feed: &ListingChangeFeed) -> JoinHandle<()> {
        let catalog = Arc::clone(self);
        let mut rx = feed.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(change) => {
                        debug!(?change, "listings changed; reloading");
                        if let Err(err) = catalog.load().await {
                            warn!("reload after change notification failed: {err}");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "change feed lagged; reloading once");
                        if let Err(err) = catalog.load().await {
                            warn!("reload after lagged feed failed: {err}");
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

/// Total provider resolution: the placeholder stands in when the reference
/// is absent, the record is missing, or the lookup fails.
pub async fn resolve_provider(store: &dyn MarketStore, listing: &Listing) -> Provider {
    let Some(provider_id) = listing.provider_id else {
        return Provider::placeholder(listing);
    };
    match store.provider(provider_id).await {
        Ok(Some(provider)) => provider,
        Ok(None) => Provider::placeholder(listing),
        Err(err) => {
            warn!(%provider_id, "provider lookup failed: {err}");
            Provider::placeholder(listing)
        }
    }
}

async fn enrich_listing(store: Arc<dyn MarketStore>, listing: Listing) -> EnrichedListing {
    let profile_fut = async {
        match listing.user_id {
            Some(user_id) => match store.profile(user_id).await {
                Ok(profile) => profile,
                Err(err) => {
                    warn!(%user_id, "profile lookup failed: {err}");
                    None
                }
            },
            None => None,
        }
    };
    let photo_fut = async {
        match store.primary_image(listing.id).await {
            Ok(image) => image.map(|i| i.image_url),
            Err(err) => {
                warn!(listing_id = %listing.id, "photo lookup failed: {err}");
                None
            }
        }
    };
    let provider_fut = resolve_provider(&*store, &listing);

    let (profile, service_photo, provider) = tokio::join!(profile_fut, photo_fut, provider_fut);
    EnrichedListing::assemble(listing, provider, profile, service_photo)
}

/// Pure, order-preserving conjunction of the active criteria.
pub fn filter(listings: &[EnrichedListing], criteria: &FilterCriteria) -> Vec<EnrichedListing> {
    listings
        .iter()
        .filter(|l| matches_criteria(l, criteria))
        .cloned()
        .collect()
}

fn matches_criteria(listing: &EnrichedListing, criteria: &FilterCriteria) -> bool {
    let category_ok = match criteria.category {
        None => true,
        Some(wanted) => listing.resolved_category_id() == Some(wanted),
    };
    // Location is a literal match against a closed governorate vocabulary;
    // no case folding or normalization.
    let location_ok = match criteria.location.as_deref() {
        None => true,
        Some(wanted) => listing.listing.location.as_deref() == Some(wanted),
    };
    let availability_ok = criteria.availability.is_empty()
        || criteria
            .availability
            .iter()
            .any(|_tag| listing.provider.is_approved);
    category_ok && location_ok && availability_ok
}

/// Filtered listings split into the two browse tabs. Disjoint; both halves
/// preserve the input order.
#[derive(Debug, Clone, Default)]
pub struct Partitioned {
    pub on_site: Vec<EnrichedListing>,
    pub online: Vec<EnrichedListing>,
}

/// Classification precedence: explicit tag, then the static name mapping.
pub fn classify(category: &Category) -> Option<ServiceKind> {
    category
        .kind
        .or_else(|| service_kind_for_name(&category.name))
}

/// Split by each listing's own category reference. Listings whose category
/// is missing or classifies through neither path land in neither half.
pub fn partition(filtered: &[EnrichedListing], categories: &[Category]) -> Partitioned {
    let mut parts = Partitioned::default();
    for listing in filtered {
        let kind = listing
            .listing
            .category_id
            .and_then(|id| categories.iter().find(|c| c.id == id))
            .and_then(classify);
        match kind {
            Some(ServiceKind::OnSite) => parts.on_site.push(listing.clone()),
            Some(ServiceKind::Online) => parts.online.push(listing.clone()),
            None => {}
        }
    }
    parts
}

/// Unique location values in first-seen order, for filter-control population.
pub fn locations(listings: &[EnrichedListing]) -> Vec<String> {
    let mut seen = Vec::new();
    for listing in listings {
        if let Some(location) = listing.listing.location.as_deref() {
            if !seen.iter().any(|s| s == location) {
                seen.push(location.to_string());
            }
        }
    }
    seen
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use servigo_core::AvailabilityTag;
    use servigo_store::{ListingChange, MemoryMarketStore};
    use std::time::Duration;
    use uuid::Uuid;

    fn listing(id_seed: u8, location: &str, category_id: Option<Uuid>) -> Listing {
        Listing {
            id: Uuid::from_u128(id_seed as u128),
            provider_id: None,
            user_id: None,
            category_id,
            description: Some("test offering".into()),
            location: Some(location.into()),
            hourly_rate: None,
            business_name: None,
            is_active: true,
            created_at: Utc.timestamp_opt(1_000 + id_seed as i64, 0).unwrap(),
        }
    }

    fn enriched(id_seed: u8, location: &str, category_id: Option<Uuid>) -> EnrichedListing {
        let l = listing(id_seed, location, category_id);
        let p = Provider::placeholder(&l);
        EnrichedListing::assemble(l, p, None, None)
    }

    fn category(name: &str, kind: Option<ServiceKind>) -> Category {
        Category {
            id: Uuid::new_v4(),
            name: name.into(),
            description: None,
            kind,
        }
    }

    #[tokio::test]
    async fn load_excludes_inactive_listings() {
        let mut retired = listing(9, "Tunis", None);
        retired.is_active = false;
        let store = Arc::new(
            MemoryMarketStore::new().with_listings(vec![listing(1, "Tunis", None), retired]),
        );
        let catalog = ListingCatalog::new(store);

        let snapshot = catalog.load().await.expect("load");
        assert_eq!(snapshot.listings.len(), 1);
        assert!(snapshot.listings.iter().all(|e| e.listing.is_active));
    }

    #[tokio::test]
    async fn load_preserves_newest_first_order() {
        let store = Arc::new(MemoryMarketStore::new().with_listings(vec![
            listing(1, "Tunis", None),
            listing(2, "Sfax", None),
            listing(3, "Sousse", None),
        ]));
        let catalog = ListingCatalog::new(store);

        let snapshot = catalog.load().await.expect("load");
        let created: Vec<_> = snapshot
            .listings
            .iter()
            .map(|e| e.listing.created_at)
            .collect();
        let mut sorted = created.clone();
        sorted.sort_by(|a, b| b.cmp(a));
        assert_eq!(created, sorted);
    }

    #[tokio::test]
    async fn missing_provider_resolves_to_placeholder() {
        let mut orphan = listing(1, "Tunis", None);
        orphan.provider_id = Some(Uuid::new_v4());
        let store = Arc::new(MemoryMarketStore::new().with_listings(vec![orphan]));
        let catalog = ListingCatalog::new(store);

        let snapshot = catalog.load().await.expect("load");
        let provider = &snapshot.listings[0].provider;
        assert_eq!(provider.business_name, "Service Provider");
        assert_eq!(provider.rating, 0.0);
        assert!(!provider.is_approved);
    }

    #[tokio::test]
    async fn failing_sub_lookups_degrade_without_aborting() {
        let mut l = listing(1, "Tunis", None);
        l.user_id = Some(Uuid::new_v4());
        l.provider_id = Some(Uuid::new_v4());
        let store = Arc::new(
            MemoryMarketStore::new()
                .with_listings(vec![l])
                .failing_profiles()
                .failing_images()
                .failing_providers(),
        );
        let catalog = ListingCatalog::new(store);

        let snapshot = catalog.load().await.expect("load still succeeds");
        assert_eq!(snapshot.listings.len(), 1);
        let e = &snapshot.listings[0];
        assert_eq!(e.provider.business_name, "Service Provider");
        assert!(e.service_photo.is_none());
        assert!(e.provider_photo.is_none());
    }

    #[tokio::test]
    async fn primary_query_failure_aborts_the_load() {
        let store = Arc::new(MemoryMarketStore::new().failing_listings());
        let catalog = ListingCatalog::new(store);

        assert!(matches!(
            catalog.load().await,
            Err(CatalogError::Store(_))
        ));
        assert!(catalog.snapshot().loaded_at.is_none());
    }

    #[tokio::test]
    async fn generations_increase_across_loads() {
        let store = Arc::new(MemoryMarketStore::new().with_listings(vec![listing(1, "Kef", None)]));
        let catalog = ListingCatalog::new(store);
        let first = catalog.load().await.expect("first");
        let second = catalog.load().await.expect("second");
        assert!(second.generation > first.generation);
        assert_eq!(catalog.snapshot().generation, second.generation);
    }

    #[tokio::test]
    async fn change_notification_triggers_reload() {
        let store = Arc::new(MemoryMarketStore::new().with_listings(vec![listing(1, "Kef", None)]));
        let catalog = ListingCatalog::new(Arc::clone(&store) as Arc<dyn MarketStore>);
        catalog.load().await.expect("initial load");

        let feed = ListingChangeFeed::new();
        let handle = catalog.watch_changes(&feed);

        store.push_listing(listing(2, "Kef", None));
        feed.notify(ListingChange::Inserted);

        let mut rx = catalog.subscribe();
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if rx.borrow_and_update().listings.len() == 2 {
                    break;
                }
                rx.changed().await.expect("watch open");
            }
        })
        .await
        .expect("reload observed");
        handle.abort();
    }

    #[test]
    fn default_criteria_filter_is_identity() {
        let listings = vec![
            enriched(1, "Tunis", None),
            enriched(2, "Sfax", None),
            enriched(3, "Kef", None),
        ];
        let out = filter(&listings, &FilterCriteria::default());
        assert_eq!(out, listings);
    }

    #[test]
    fn filter_is_idempotent() {
        let listings = vec![enriched(1, "Tunis", None), enriched(2, "Sfax", None)];
        let criteria = FilterCriteria {
            location: Some("Tunis".into()),
            ..Default::default()
        };
        let once = filter(&listings, &criteria);
        let twice = filter(&once, &criteria);
        assert_eq!(once, twice);
    }

    #[test]
    fn location_filter_matches_exactly() {
        let listings = vec![enriched(1, "Tunis", None), enriched(2, "Sfax", None)];
        let criteria = FilterCriteria {
            location: Some("Tunis".into()),
            ..Default::default()
        };
        let out = filter(&listings, &criteria);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].listing.id, Uuid::from_u128(1));

        // Literal-match policy: case differences do not match.
        let lowercased = FilterCriteria {
            location: Some("tunis".into()),
            ..Default::default()
        };
        assert!(filter(&listings, &lowercased).is_empty());
    }

    #[test]
    fn category_filter_prefers_provider_category() {
        let listing_category = Uuid::new_v4();
        let provider_category = Uuid::new_v4();
        let mut a = enriched(1, "Tunis", Some(listing_category));
        a.provider.category_id = Some(provider_category);
        let b = enriched(2, "Tunis", Some(listing_category));

        let criteria = FilterCriteria {
            category: Some(provider_category),
            ..Default::default()
        };
        let out = filter(&[a.clone(), b], &criteria);
        assert_eq!(out, vec![a]);
    }

    #[test]
    fn availability_tags_both_require_approval() {
        let mut approved = enriched(1, "Tunis", None);
        approved.provider.is_approved = true;
        let unapproved = enriched(2, "Tunis", None);

        for tag in [AvailabilityTag::Verified, AvailabilityTag::Licensed] {
            let criteria = FilterCriteria {
                availability: vec![tag],
                ..Default::default()
            };
            let out = filter(&[approved.clone(), unapproved.clone()], &criteria);
            assert_eq!(out.len(), 1);
            assert!(out[0].provider.is_approved);
        }
    }

    #[test]
    fn partition_is_a_disjoint_cover_modulo_unclassifiable() {
        let onsite_cat = category("Plumbing", Some(ServiceKind::OnSite));
        let mapped_cat = category("Web Development", None);
        let unknown_cat = category("Falconry", None);
        let categories = vec![onsite_cat.clone(), mapped_cat.clone(), unknown_cat.clone()];

        let listings = vec![
            enriched(1, "Tunis", Some(onsite_cat.id)),
            enriched(2, "Tunis", Some(mapped_cat.id)),
            enriched(3, "Tunis", Some(unknown_cat.id)),
            enriched(4, "Tunis", None),
        ];

        let parts = partition(&listings, &categories);
        assert_eq!(parts.on_site.len(), 1);
        assert_eq!(parts.online.len(), 1);
        assert_eq!(parts.on_site[0].listing.id, Uuid::from_u128(1));
        assert_eq!(parts.online[0].listing.id, Uuid::from_u128(2));

        for l in &parts.on_site {
            assert!(!parts.online.iter().any(|o| o.listing.id == l.listing.id));
        }
    }

    #[test]
    fn explicit_category_kind_beats_name_mapping() {
        // Name says on-site, explicit tag says online; the tag wins.
        let cat = category("Plumbing", Some(ServiceKind::Online));
        assert_eq!(classify(&cat), Some(ServiceKind::Online));
    }

    #[test]
    fn locations_are_unique_and_first_seen_ordered() {
        let listings = vec![
            enriched(1, "Tunis", None),
            enriched(2, "Sfax", None),
            enriched(3, "Tunis", None),
        ];
        assert_eq!(locations(&listings), vec!["Tunis", "Sfax"]);
    }
}
