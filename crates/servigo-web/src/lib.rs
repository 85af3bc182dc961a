//! Axum + Askama web UI for the ServiGO marketplace.

use std::sync::Arc;

use askama::Template;
use axum::{
    extract::{Path as AxumPath, Query, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Redirect, Response},
    routing::get,
    Router,
};
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::warn;
use uuid::Uuid;

use servigo_catalog::{classify, filter, partition, CatalogSnapshot, ListingCatalog};
use servigo_core::{
    AvailabilityTag, Category, EnrichedListing, FilterCriteria, Listing, ServiceKind,
    PLACEHOLDER_PROVIDER_NAME,
};
use servigo_i18n::{Language, Localizer};
use servigo_store::MarketStore;

pub const CRATE_NAME: &str = "servigo-web";

const APP_CSS: &str = include_str!("../assets/app.css");

/// The 24 Tunisian governorates offered by the state picker and the
/// location filter.
pub const GOVERNORATES: [&str; 24] = [
    "Ariana",
    "Ben Arous",
    "Béja",
    "Bizerte",
    "Gabès",
    "Gafsa",
    "Jendouba",
    "Kairouan",
    "Kasserine",
    "Kebili",
    "Kef",
    "Mahdia",
    "Manouba",
    "Medenine",
    "Monastir",
    "Nabeul",
    "Sfax",
    "Sidi Bouzid",
    "Siliana",
    "Sousse",
    "Tataouine",
    "Tozeur",
    "Tunis",
    "Zaghouan",
];

#[derive(Clone)]
pub struct AppState {
    pub catalog: Arc<ListingCatalog>,
    pub store: Arc<dyn MarketStore>,
    pub locale: Arc<Localizer>,
}

impl AppState {
    pub fn new(
        catalog: Arc<ListingCatalog>,
        store: Arc<dyn MarketStore>,
        locale: Arc<Localizer>,
    ) -> Self {
        Self {
            catalog,
            store,
            locale,
        }
    }
}

/// Translation handle passed into every template.
#[derive(Clone)]
pub struct L10n {
    localizer: Arc<Localizer>,
}

impl L10n {
    pub fn t(&self, key: &str) -> String {
        self.localizer.translate(key)
    }

    pub fn lang(&self) -> &'static str {
        self.localizer.document_attrs().0
    }

    pub fn dir(&self) -> &'static str {
        self.localizer.document_attrs().1
    }

    pub fn options(&self) -> Vec<LangOption> {
        let active = self.localizer.language();
        Language::all()
            .into_iter()
            .map(|language| LangOption {
                tag: language.tag(),
                name: language.display_name(),
                active: language == active,
            })
            .collect()
    }
}

pub struct LangOption {
    pub tag: &'static str,
    pub name: &'static str,
    pub active: bool,
}

#[derive(Debug, Clone)]
struct StateLink {
    name: &'static str,
    href: String,
}

#[derive(Debug, Clone)]
struct SelectOption {
    id: String,
    name: String,
    selected: bool,
}

#[derive(Debug, Clone)]
struct LocationOption {
    name: &'static str,
    selected: bool,
}

#[derive(Debug, Clone)]
struct ListingCard {
    photo_url: String,
    title: String,
    rating_text: String,
    category_name: String,
    location: String,
    description: String,
    price_text: String,
    kind_label: String,
    provider_href: String,
}

#[derive(Debug, Clone)]
struct ServiceRow {
    photo_url: String,
    category_name: String,
    description: String,
    price_text: String,
}

#[derive(Debug, Clone)]
struct ReviewView {
    reviewer: String,
    rating: i32,
    comment: String,
    date: String,
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    l: L10n,
    listing_count: usize,
    governorates: Vec<StateLink>,
}

#[derive(Template)]
#[template(path = "listings.html")]
struct ListingsTemplate {
    l: L10n,
    load_error: bool,
    tab_param: &'static str,
    categories: Vec<SelectOption>,
    locations: Vec<LocationOption>,
    verified_checked: bool,
    licensed_checked: bool,
    total_found: usize,
    active_tab_onsite: bool,
    tab_onsite_href: String,
    tab_online_href: String,
    onsite_count: usize,
    online_count: usize,
    cards: Vec<ListingCard>,
}

#[derive(Template)]
#[template(path = "listings_grid.html")]
struct GridTemplate {
    l: L10n,
    cards: Vec<ListingCard>,
}

#[derive(Template)]
#[template(path = "provider.html")]
struct ProviderTemplate {
    l: L10n,
    name: String,
    photo_url: String,
    category_name: String,
    rating_text: String,
    review_count: i64,
    location: String,
    about: String,
    certificate_url: String,
    services: Vec<ServiceRow>,
    reviews: Vec<ReviewView>,
}

#[derive(Debug, Deserialize, Default)]
struct BrowseQuery {
    category: Option<String>,
    location: Option<String>,
    verified: Option<String>,
    licensed: Option<String>,
    tab: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct LanguageQuery {
    next: Option<String>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/listings", get(listings_page_handler))
        .route("/listings/grid", get(listings_grid_handler))
        .route("/providers/{id}", get(provider_detail_handler))
        .route("/language/{tag}", get(language_handler))
        .route("/assets/static/app.css", get(app_css_handler))
        .with_state(state)
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn index_handler(State(state): State<AppState>) -> Response {
    let (snapshot, _load_error) = current_snapshot(&state).await;
    let governorates = GOVERNORATES
        .iter()
        .map(|name| StateLink {
            name,
            href: format!("/listings?location={}", encode_query(name)),
        })
        .collect();
    render_html(IndexTemplate {
        l: l10n(&state),
        listing_count: snapshot.listings.len(),
        governorates,
    })
}

async fn listings_page_handler(
    State(state): State<AppState>,
    Query(query): Query<BrowseQuery>,
) -> Response {
    let (snapshot, load_error) = current_snapshot(&state).await;
    let view = browse_view(&state, &snapshot, &query, load_error);
    render_html(view)
}

async fn listings_grid_handler(
    State(state): State<AppState>,
    Query(query): Query<BrowseQuery>,
) -> Response {
    let (snapshot, _load_error) = current_snapshot(&state).await;
    let view = browse_view(&state, &snapshot, &query, false);
    let mut resp = render_html(GridTemplate {
        l: l10n(&state),
        cards: view.cards,
    });
    resp.headers_mut().insert(
        header::HeaderName::from_static("hx-trigger"),
        header::HeaderValue::from_static("listingsGridLoaded"),
    );
    resp
}

async fn provider_detail_handler(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<Uuid>,
) -> Response {
    let provider = match state.store.provider(id).await {
        Ok(Some(provider)) => provider,
        Ok(None) => {
            return (
                StatusCode::NOT_FOUND,
                Html("Provider not found".to_string()),
            )
                .into_response();
        }
        Err(err) => return server_error(anyhow::anyhow!(err)),
    };

    let profile = match provider.user_id {
        Some(user_id) => state.store.profile(user_id).await.unwrap_or_else(|err| {
            warn!(%user_id, "profile lookup failed: {err}");
            None
        }),
        None => None,
    };
    let services = state.store.provider_listings(id).await.unwrap_or_else(|err| {
        warn!(provider_id = %id, "provider listings lookup failed: {err}");
        Vec::new()
    });
    let reviews = state.store.reviews(id).await.unwrap_or_else(|err| {
        warn!(provider_id = %id, "reviews lookup failed: {err}");
        Vec::new()
    });

    let categories = state.catalog.snapshot().categories;
    let name = profile
        .as_ref()
        .and_then(servigo_core::Profile::full_name)
        .or_else(|| {
            if provider.business_name.is_empty() {
                None
            } else {
                Some(provider.business_name.clone())
            }
        })
        .unwrap_or_else(|| PLACEHOLDER_PROVIDER_NAME.to_string());
    let photo_url = profile
        .as_ref()
        .and_then(|p| p.profile_photo_url.clone())
        .or_else(|| provider.profile_photo_url.clone())
        .unwrap_or_default();
    let location = services
        .iter()
        .find_map(|listing| listing.location.clone())
        .unwrap_or_default();

    let service_rows = service_rows(&state, &services, &categories).await;
    let review_views = reviews
        .iter()
        .map(|review| ReviewView {
            reviewer: review
                .reviewer_name
                .clone()
                .unwrap_or_else(|| "Anonyme".to_string()),
            rating: review.rating,
            comment: review.comment.clone().unwrap_or_default(),
            date: review.created_at.format("%Y-%m-%d").to_string(),
        })
        .collect();

    render_html(ProviderTemplate {
        l: l10n(&state),
        name,
        photo_url,
        category_name: category_name(provider.category_id, &categories),
        rating_text: format!("{:.1}", provider.rating),
        review_count: provider.total_reviews,
        location,
        about: provider
            .business_description
            .clone()
            .unwrap_or_else(|| "Professional service provider.".to_string()),
        certificate_url: provider.certificate_url.clone().unwrap_or_default(),
        services: service_rows,
        reviews: review_views,
    })
}

async fn language_handler(
    State(state): State<AppState>,
    AxumPath(tag): AxumPath<String>,
    Query(query): Query<LanguageQuery>,
) -> Response {
    if let Some(language) = Language::from_tag(&tag) {
        state.locale.set_language(language);
    }
    let target = query
        .next
        .filter(|next| next.starts_with('/'))
        .unwrap_or_else(|| "/".to_string());
    Redirect::to(&target).into_response()
}

async fn app_css_handler() -> Response {
    ([(header::CONTENT_TYPE, "text/css; charset=utf-8")], APP_CSS).into_response()
}

fn l10n(state: &AppState) -> L10n {
    L10n {
        localizer: Arc::clone(&state.locale),
    }
}

/// Published snapshot, loading inline on the first request. A failed first
/// load renders the browse page's error state.
async fn current_snapshot(state: &AppState) -> (CatalogSnapshot, bool) {
    let snapshot = state.catalog.snapshot();
    if snapshot.loaded_at.is_some() {
        return (snapshot, false);
    }
    match state.catalog.load().await {
        Ok(fresh) => (fresh, false),
        Err(err) => {
            warn!("initial listing load failed: {err}");
            (snapshot, true)
        }
    }
}

fn active_tab(query: &BrowseQuery) -> ServiceKind {
    query
        .tab
        .as_deref()
        .and_then(ServiceKind::from_param)
        .unwrap_or(ServiceKind::OnSite)
}

fn checkbox_on(value: &Option<String>) -> bool {
    matches!(value.as_deref(), Some("1") | Some("on") | Some("true"))
}

fn criteria_from_query(query: &BrowseQuery) -> FilterCriteria {
    let category = query
        .category
        .as_deref()
        .filter(|value| !value.is_empty() && *value != "all")
        .and_then(|value| Uuid::parse_str(value).ok());
    let location = query
        .location
        .as_deref()
        .filter(|value| !value.is_empty() && *value != "all")
        .map(ToString::to_string);
    let mut availability = Vec::new();
    if checkbox_on(&query.verified) {
        availability.push(AvailabilityTag::Verified);
    }
    if checkbox_on(&query.licensed) {
        availability.push(AvailabilityTag::Licensed);
    }
    FilterCriteria {
        category,
        location,
        availability,
    }
}

fn browse_href(tab: ServiceKind, query: &BrowseQuery) -> String {
    let mut parts = vec![format!("tab={}", tab.as_param())];
    if let Some(category) = query
        .category
        .as_deref()
        .filter(|value| !value.is_empty() && *value != "all")
    {
        parts.push(format!("category={category}"));
    }
    if let Some(location) = query
        .location
        .as_deref()
        .filter(|value| !value.is_empty() && *value != "all")
    {
        parts.push(format!("location={}", encode_query(location)));
    }
    if checkbox_on(&query.verified) {
        parts.push("verified=1".to_string());
    }
    if checkbox_on(&query.licensed) {
        parts.push("licensed=1".to_string());
    }
    format!("/listings?{}", parts.join("&"))
}

fn browse_view(
    state: &AppState,
    snapshot: &CatalogSnapshot,
    query: &BrowseQuery,
    load_error: bool,
) -> ListingsTemplate {
    let l = l10n(state);
    let criteria = criteria_from_query(query);
    let tab = active_tab(query);

    let filtered = filter(&snapshot.listings, &criteria);
    let parts = partition(&filtered, &snapshot.categories);
    let active = match tab {
        ServiceKind::OnSite => &parts.on_site,
        ServiceKind::Online => &parts.online,
    };

    let cards = active
        .iter()
        .map(|listing| listing_card(listing, &snapshot.categories, tab, &l))
        .collect();

    let categories = snapshot
        .categories
        .iter()
        .filter(|category| classify(category) == Some(tab))
        .map(|category| SelectOption {
            id: category.id.to_string(),
            name: category.name.clone(),
            selected: criteria.category == Some(category.id),
        })
        .collect();

    let locations = GOVERNORATES
        .iter()
        .map(|name| LocationOption {
            name,
            selected: criteria.location.as_deref() == Some(*name),
        })
        .collect();

    ListingsTemplate {
        l,
        load_error,
        tab_param: tab.as_param(),
        categories,
        locations,
        verified_checked: checkbox_on(&query.verified),
        licensed_checked: checkbox_on(&query.licensed),
        total_found: filtered.len(),
        active_tab_onsite: tab == ServiceKind::OnSite,
        tab_onsite_href: browse_href(ServiceKind::OnSite, query),
        tab_online_href: browse_href(ServiceKind::Online, query),
        onsite_count: parts.on_site.len(),
        online_count: parts.online.len(),
        cards,
    }
}

fn listing_card(
    listing: &EnrichedListing,
    categories: &[Category],
    tab: ServiceKind,
    l: &L10n,
) -> ListingCard {
    let provider_href = listing
        .provider
        .id
        .or(listing.listing.provider_id)
        .map(|id| format!("/providers/{id}"))
        .unwrap_or_default();
    let kind_label = match tab {
        ServiceKind::OnSite => l.t("onSite"),
        ServiceKind::Online => l.t("online"),
    };
    ListingCard {
        photo_url: listing
            .provider_photo
            .clone()
            .or_else(|| listing.service_photo.clone())
            .unwrap_or_default(),
        title: listing.provider_name.clone(),
        rating_text: if listing.provider.rating > 0.0 {
            format!("{:.1}", listing.provider.rating)
        } else {
            String::new()
        },
        category_name: category_name(listing.listing.category_id, categories),
        location: listing.listing.location.clone().unwrap_or_default(),
        description: listing
            .listing
            .description
            .clone()
            .unwrap_or_else(|| "Professional service provider".to_string()),
        price_text: listing
            .listing
            .hourly_rate
            .map(|rate| format!("{rate} TND/hour"))
            .unwrap_or_default(),
        kind_label,
        provider_href,
    }
}

async fn service_rows(
    state: &AppState,
    services: &[Listing],
    categories: &[Category],
) -> Vec<ServiceRow> {
    let mut rows = Vec::with_capacity(services.len());
    for listing in services {
        let photo_url = match state.store.primary_image(listing.id).await {
            Ok(image) => image.map(|i| i.image_url).unwrap_or_default(),
            Err(err) => {
                warn!(listing_id = %listing.id, "photo lookup failed: {err}");
                String::new()
            }
        };
        rows.push(ServiceRow {
            photo_url,
            category_name: category_name(listing.category_id, categories),
            description: listing
                .description
                .clone()
                .unwrap_or_else(|| "Professional service".to_string()),
            price_text: listing
                .hourly_rate
                .map(|rate| format!("{rate} TND/hour"))
                .unwrap_or_default(),
        });
    }
    rows
}

fn category_name(category_id: Option<Uuid>, categories: &[Category]) -> String {
    category_id
        .and_then(|id| categories.iter().find(|c| c.id == id))
        .map(|c| c.name.clone())
        .unwrap_or_default()
}

fn encode_query(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Html(format!("Server error: {}", err)),
    )
        .into_response()
}
