//! Core listing model, identity keys and run summaries for the ingestion pipeline.

use std::fmt;
use std::ops::AddAssign;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod validate;

pub use validate::{Rejection, ValidationPolicy, Validator};

pub const CRATE_NAME: &str = "estate-core";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyType {
    Apartment,
    House,
    Penthouse,
    Studio,
    #[default]
    Unknown,
}

impl PropertyType {
    pub const GENERATED: [PropertyType; 4] = [
        PropertyType::Apartment,
        PropertyType::House,
        PropertyType::Penthouse,
        PropertyType::Studio,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PropertyType::Apartment => "apartment",
            PropertyType::House => "house",
            PropertyType::Penthouse => "penthouse",
            PropertyType::Studio => "studio",
            PropertyType::Unknown => "unknown",
        }
    }

    /// Parses the stored lowercase form. Anything else is `None`.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "apartment" => Some(PropertyType::Apartment),
            "house" => Some(PropertyType::House),
            "penthouse" => Some(PropertyType::Penthouse),
            "studio" => Some(PropertyType::Studio),
            "unknown" => Some(PropertyType::Unknown),
            _ => None,
        }
    }
}

impl fmt::Display for PropertyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListingType {
    #[default]
    Sale,
    Rent,
}

impl ListingType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListingType::Sale => "sale",
            ListingType::Rent => "rent",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "sale" => Some(ListingType::Sale),
            "rent" => Some(ListingType::Rent),
            _ => None,
        }
    }
}

impl fmt::Display for ListingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The (`source`, `source_id`) pair identifying a listing's real-world origin.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdentityKey {
    pub source: String,
    pub source_id: String,
}

impl IdentityKey {
    pub fn new(source: impl Into<String>, source_id: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            source_id: source_id.into(),
        }
    }

    /// Deterministic row id, so every backend assigns the same id to the same identity.
    pub fn stable_id(&self) -> Uuid {
        let name = format!("listing:{}:{}", self.source, self.source_id);
        Uuid::new_v5(&Uuid::NAMESPACE_URL, name.as_bytes())
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source, self.source_id)
    }
}

/// Canonical listing produced by the normalizer.
///
/// Identity and location fields are optional here because a raw record may lack
/// them; the validator and the upsert writer refuse to persist such listings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub source: String,
    pub source_id: Option<String>,
    pub url: Option<String>,
    pub address: Option<String>,
    pub postal_code: Option<String>,
    pub city: Option<String>,
    pub price: Option<f64>,
    pub size_m2: Option<f64>,
    pub rooms: Option<u32>,
    pub property_type: PropertyType,
    pub listing_type: ListingType,
    pub build_year: Option<i32>,
    /// EU energy label, `A+++` through `G`.
    pub energy_label: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub has_garden: Option<bool>,
    pub has_parking: Option<bool>,
    pub scraped_at: DateTime<Utc>,
    /// The record this listing was normalized from, kept verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_data: Option<serde_json::Value>,
}

impl Listing {
    pub fn empty(source: impl Into<String>, scraped_at: DateTime<Utc>) -> Self {
        Self {
            source: source.into(),
            source_id: None,
            url: None,
            address: None,
            postal_code: None,
            city: None,
            price: None,
            size_m2: None,
            rooms: None,
            property_type: PropertyType::Unknown,
            listing_type: ListingType::Sale,
            build_year: None,
            energy_label: None,
            latitude: None,
            longitude: None,
            has_garden: None,
            has_parking: None,
            scraped_at,
            raw_data: None,
        }
    }

    /// Returns the identity key when both parts are present and non-blank.
    pub fn identity(&self) -> Option<IdentityKey> {
        let source_id = present(&self.source_id)?;
        if self.source.trim().is_empty() {
            return None;
        }
        Some(IdentityKey::new(self.source.clone(), source_id))
    }

    /// First required field that is absent or blank, in a fixed order.
    pub fn missing_required_field(&self) -> Option<&'static str> {
        if self.source.trim().is_empty() {
            return Some("source");
        }
        if present(&self.source_id).is_none() {
            return Some("source_id");
        }
        if present(&self.address).is_none() {
            return Some("address");
        }
        if present(&self.city).is_none() {
            return Some("city");
        }
        None
    }

    pub fn price_per_m2(&self) -> Option<f64> {
        match (self.price, self.size_m2) {
            (Some(price), Some(size)) if size > 0.0 => Some(price / size),
            _ => None,
        }
    }
}

fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// A persisted listing row with its storage metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredListing {
    pub id: Uuid,
    #[serde(flatten)]
    pub listing: Listing,
    pub first_seen_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Per-batch (or accumulated) write outcome counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WriteStats {
    pub inserted: usize,
    pub updated: usize,
    pub errors: usize,
}

impl WriteStats {
    pub fn written(&self) -> usize {
        self.inserted + self.updated
    }

    pub fn total(&self) -> usize {
        self.inserted + self.updated + self.errors
    }
}

impl AddAssign for WriteStats {
    fn add_assign(&mut self, rhs: Self) {
        self.inserted += rhs.inserted;
        self.updated += rhs.updated;
        self.errors += rhs.errors;
    }
}

/// Which path produced the listings of a collection run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceUsed {
    Real,
    Fallback,
}

impl SourceUsed {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceUsed::Real => "real",
            SourceUsed::Fallback => "fallback",
        }
    }
}

impl fmt::Display for SourceUsed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
