//! Core domain model for the ServiGO marketplace.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "servigo-core";

/// Business name shown when a listing's real provider cannot be resolved.
pub const PLACEHOLDER_PROVIDER_NAME: &str = "Service Provider";

/// Where a service is delivered: at the customer's place or over the internet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    OnSite,
    Online,
}

impl ServiceKind {
    pub fn as_param(self) -> &'static str {
        match self {
            ServiceKind::OnSite => "onsite",
            ServiceKind::Online => "online",
        }
    }

    pub fn from_param(value: &str) -> Option<Self> {
        match value {
            "onsite" => Some(ServiceKind::OnSite),
            "online" => Some(ServiceKind::Online),
            _ => None,
        }
    }
}

/// A published service offering. Mutated only through the posting form;
/// retired via `is_active` rather than deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub id: Uuid,
    #[serde(rename = "service_provider_id")]
    pub provider_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
    #[serde(rename = "job_category_id")]
    pub category_id: Option<Uuid>,
    pub description: Option<String>,
    pub location: Option<String>,
    pub hourly_rate: Option<f64>,
    pub business_name: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

/// The professional/business entity behind one or more listings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provider {
    pub id: Option<Uuid>,
    pub user_id: Option<Uuid>,
    #[serde(default)]
    pub business_name: String,
    pub business_description: Option<String>,
    /// Aggregate rating 0-5; 0 means unrated.
    #[serde(default)]
    pub rating: f64,
    #[serde(default)]
    pub total_reviews: i64,
    pub profile_photo_url: Option<String>,
    #[serde(default)]
    pub is_approved: bool,
    #[serde(rename = "job_category_id")]
    pub category_id: Option<Uuid>,
    pub certificate_url: Option<String>,
}

impl Provider {
    /// Synthetic fallback substituted whenever a listing's provider record is
    /// unavailable. Total: downstream code never observes a missing provider.
    pub fn placeholder(listing: &Listing) -> Self {
        Self {
            id: listing.provider_id,
            user_id: listing.user_id,
            business_name: listing
                .business_name
                .clone()
                .unwrap_or_else(|| PLACEHOLDER_PROVIDER_NAME.to_string()),
            business_description: None,
            rating: 0.0,
            total_reviews: 0,
            profile_photo_url: None,
            is_approved: false,
            category_id: listing.category_id,
            certificate_url: None,
        }
    }
}

/// User profile fields the marketplace denormalizes onto listing cards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id: Uuid,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub profile_photo_url: Option<String>,
}

impl Profile {
    /// "First Last" with either half optional; `None` when both are absent.
    pub fn full_name(&self) -> Option<String> {
        let first = self.first_name.as_deref().unwrap_or("").trim();
        let last = self.last_name.as_deref().unwrap_or("").trim();
        let joined = format!("{first} {last}");
        let joined = joined.trim();
        if joined.is_empty() {
            None
        } else {
            Some(joined.to_string())
        }
    }
}

/// A job category. The explicit `kind` tag is optional; categories without
/// one classify through [`service_kind_for_name`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Category {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    #[serde(rename = "service_type")]
    pub kind: Option<ServiceKind>,
}

/// A photo attached to a listing; at most one per listing is primary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceImage {
    #[serde(rename = "service_id")]
    pub listing_id: Uuid,
    pub image_url: String,
    #[serde(default)]
    pub is_primary: bool,
}

/// A customer review left on a provider. The reviewer name is resolved at
/// the store boundary so the rest of the code never touches join shapes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Review {
    pub id: Uuid,
    pub provider_id: Uuid,
    pub rating: i32,
    pub comment: Option<String>,
    pub reviewer_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A listing joined with its denormalized provider/profile/photo data.
/// Computed per load, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedListing {
    pub listing: Listing,
    pub provider: Provider,
    pub provider_name: String,
    pub provider_photo: Option<String>,
    pub service_photo: Option<String>,
}

impl EnrichedListing {
    pub fn assemble(
        listing: Listing,
        provider: Provider,
        profile: Option<Profile>,
        service_photo: Option<String>,
    ) -> Self {
        let provider_name = profile
            .as_ref()
            .and_then(Profile::full_name)
            .or_else(|| {
                if provider.business_name.is_empty() {
                    None
                } else {
                    Some(provider.business_name.clone())
                }
            })
            .or_else(|| listing.business_name.clone())
            .unwrap_or_else(|| PLACEHOLDER_PROVIDER_NAME.to_string());
        let provider_photo = profile
            .as_ref()
            .and_then(|p| p.profile_photo_url.clone())
            .or_else(|| provider.profile_photo_url.clone());
        Self {
            listing,
            provider,
            provider_name,
            provider_photo,
            service_photo,
        }
    }

    /// Category used for filtering: the provider's, falling back to the
    /// listing's own reference.
    pub fn resolved_category_id(&self) -> Option<Uuid> {
        self.provider.category_id.or(self.listing.category_id)
    }
}

/// Availability facets offered by the browse filters. Both currently map to
/// the provider approval flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AvailabilityTag {
    Verified,
    Licensed,
}

impl AvailabilityTag {
    pub fn from_param(value: &str) -> Option<Self> {
        match value {
            "verified" => Some(AvailabilityTag::Verified),
            "licensed" => Some(AvailabilityTag::Licensed),
            _ => None,
        }
    }
}

/// Active browse criteria. `None` selectors mean "all"; the default value is
/// the reset state.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FilterCriteria {
    pub category: Option<Uuid>,
    pub location: Option<String>,
    pub availability: Vec<AvailabilityTag>,
}

const ON_SITE_CATEGORY_NAMES: &[&str] = &[
    "plumbing",
    "electrical",
    "cleaning",
    "painting",
    "carpentry",
    "gardening",
    "air conditioning",
    "moving",
    "handyman",
    "masonry",
];

const ONLINE_CATEGORY_NAMES: &[&str] = &[
    "web development",
    "graphic design",
    "translation",
    "tutoring",
    "digital marketing",
    "writing",
    "consulting",
    "accounting",
];

/// Static name-to-kind mapping used when a category record carries no
/// explicit tag. Unknown names resolve to `None`.
pub fn service_kind_for_name(name: &str) -> Option<ServiceKind> {
    let needle = name.trim().to_lowercase();
    if ON_SITE_CATEGORY_NAMES.contains(&needle.as_str()) {
        Some(ServiceKind::OnSite)
    } else if ONLINE_CATEGORY_NAMES.contains(&needle.as_str()) {
        Some(ServiceKind::Online)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listing(business_name: Option<&str>) -> Listing {
        Listing {
            id: Uuid::new_v4(),
            provider_id: Some(Uuid::new_v4()),
            user_id: Some(Uuid::new_v4()),
            category_id: Some(Uuid::new_v4()),
            description: Some("pipes fixed fast".into()),
            location: Some("Tunis".into()),
            hourly_rate: Some(45.0),
            business_name: business_name.map(Into::into),
            is_active: true,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn placeholder_provider_carries_fallback_values() {
        let l = listing(None);
        let p = Provider::placeholder(&l);
        assert_eq!(p.business_name, PLACEHOLDER_PROVIDER_NAME);
        assert_eq!(p.rating, 0.0);
        assert!(!p.is_approved);
        assert_eq!(p.id, l.provider_id);
        assert_eq!(p.category_id, l.category_id);
    }

    #[test]
    fn placeholder_provider_keeps_listing_business_name() {
        let l = listing(Some("Atelier Mongi"));
        assert_eq!(Provider::placeholder(&l).business_name, "Atelier Mongi");
    }

    #[test]
    fn provider_name_prefers_profile_then_business_names() {
        let l = listing(Some("Atelier Mongi"));
        let provider = Provider::placeholder(&l);
        let profile = Profile {
            id: Uuid::new_v4(),
            first_name: Some("Amine".into()),
            last_name: Some("Ben Salah".into()),
            profile_photo_url: None,
        };
        let with_profile =
            EnrichedListing::assemble(l.clone(), provider.clone(), Some(profile), None);
        assert_eq!(with_profile.provider_name, "Amine Ben Salah");

        let without_profile = EnrichedListing::assemble(l, provider, None, None);
        assert_eq!(without_profile.provider_name, "Atelier Mongi");
    }

    #[test]
    fn provider_name_handles_partial_profile() {
        let l = listing(None);
        let provider = Provider::placeholder(&l);
        let profile = Profile {
            id: Uuid::new_v4(),
            first_name: Some("Amine".into()),
            last_name: None,
            profile_photo_url: None,
        };
        let enriched = EnrichedListing::assemble(l, provider, Some(profile), None);
        assert_eq!(enriched.provider_name, "Amine");
    }

    #[test]
    fn resolved_category_prefers_provider_over_listing() {
        let l = listing(None);
        let mut provider = Provider::placeholder(&l);
        let provider_category = Uuid::new_v4();
        provider.category_id = Some(provider_category);
        let enriched = EnrichedListing::assemble(l.clone(), provider, None, None);
        assert_eq!(enriched.resolved_category_id(), Some(provider_category));

        let bare = EnrichedListing::assemble(l.clone(), Provider::placeholder(&l), None, None);
        assert_eq!(bare.resolved_category_id(), l.category_id);
    }

    #[test]
    fn name_mapping_classifies_known_categories_only() {
        assert_eq!(service_kind_for_name("Plumbing"), Some(ServiceKind::OnSite));
        assert_eq!(
            service_kind_for_name("  web development "),
            Some(ServiceKind::Online)
        );
        assert_eq!(service_kind_for_name("Falconry"), None);
    }

    #[test]
    fn service_kind_params_round_trip() {
        assert_eq!(ServiceKind::from_param("onsite"), Some(ServiceKind::OnSite));
        assert_eq!(ServiceKind::from_param("online"), Some(ServiceKind::Online));
        assert_eq!(ServiceKind::from_param("hybrid"), None);
        assert_eq!(ServiceKind::OnSite.as_param(), "onsite");
    }
}
