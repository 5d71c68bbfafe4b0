//! Raw record → [`Listing`] normalization.
//!
//! Every function here is total: malformed input yields `None` (or the type's
//! default), never an error. Validation happens later.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use estate_core::{Listing, ListingType, PropertyType};
use regex::Regex;
use serde_json::Value as JsonValue;

use crate::RawRecord;

const SOURCE_ID_KEYS: &[&str] = &["source_id", "id", "object_id", "global_id"];
const URL_KEYS: &[&str] = &["url", "link", "href"];
const ADDRESS_KEYS: &[&str] = &["address", "street", "street_address", "title"];
const POSTAL_KEYS: &[&str] = &["postal_code", "postcode", "zip"];
const CITY_KEYS: &[&str] = &["city", "place", "municipality"];
const PRICE_KEYS: &[&str] = &["price", "price_text", "asking_price"];
const SIZE_KEYS: &[&str] = &["size_m2", "size", "living_area", "area"];
const ROOM_KEYS: &[&str] = &["rooms", "room_count", "number_of_rooms"];
const TYPE_KEYS: &[&str] = &["property_type", "type", "kind"];
const LISTING_TYPE_KEYS: &[&str] = &["listing_type", "offer", "transaction"];
const TEXT_KEYS: &[&str] = &["description", "text", "features"];
const BUILD_YEAR_KEYS: &[&str] = &["build_year", "bouwjaar", "year_built"];
const ENERGY_LABEL_KEYS: &[&str] = &["energy_label", "energielabel"];
const LATITUDE_KEYS: &[&str] = &["latitude", "lat"];
const LONGITUDE_KEYS: &[&str] = &["longitude", "lon", "lng"];
const GARDEN_KEYS: &[&str] = &["has_garden", "garden", "tuin"];
const PARKING_KEYS: &[&str] = &["has_parking", "parking", "parkeren"];

const GARDEN_WORDS: &[&str] = &["tuin", "achtertuin", "voortuin", "garden"];
const PARKING_WORDS: &[&str] = &["parkeerplaats", "garage", "parking", "carport"];

static PRICE_TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d[\d.,]*").expect("valid regex"));

static SIZE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(\d+(?:[.,]\d+)?)\s*(?:m²|m2\b|vierkante\s+meter)").expect("valid regex")
});

static ROOMS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(\d+)\s*(?:kamers?|rooms?)\b").expect("valid regex"));

static BEDROOMS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(\d+)\s*(?:slaapkamers?|bedrooms?)\b").expect("valid regex")
});

static POSTAL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(\d{4})\s?([A-Za-z]{2})\b").expect("valid regex"));

static BUILD_YEAR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:bouwjaar|built\s+in|year\s+built)\D{0,3}(\d{4})").expect("valid regex")
});

static ENERGY_LABEL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:energielabel|energy\s+label)\s*:?\s*(a\+{0,4}|[b-g])(?:[^a-z+]|$)")
        .expect("valid regex")
});

static ENERGY_VALUE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:A\+{0,4}|[B-G])$").expect("valid regex"));

static WHITESPACE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("valid regex"));

const PENTHOUSE_WORDS: &[&str] = &["penthouse"];
const STUDIO_WORDS: &[&str] = &["studio"];
const APARTMENT_WORDS: &[&str] = &[
    "appartement",
    "apartment",
    "flat",
    "bovenwoning",
    "benedenwoning",
    "portiekwoning",
    "maisonnette",
];
const HOUSE_WORDS: &[&str] = &[
    "woonhuis", "woning", "huis", "villa", "bungalow", "house", "herenhuis",
];

/// Builds a [`Listing`] from whatever `raw` carries.
///
/// `default_scraped_at` is used unless the record has an RFC 3339 `scraped_at`.
pub fn normalize(source: &str, raw: &RawRecord, default_scraped_at: DateTime<Utc>) -> Listing {
    let scraped_at = raw
        .text(&["scraped_at"])
        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(default_scraped_at);

    let mut listing = Listing::empty(source, scraped_at);
    listing.source_id = raw.text(SOURCE_ID_KEYS);
    listing.url = raw.text(URL_KEYS);
    listing.address = raw.text(ADDRESS_KEYS).map(|a| collapse_whitespace(&a));
    listing.city = raw.text(CITY_KEYS).map(|c| collapse_whitespace(&c));

    let free_text = raw.text(TEXT_KEYS).unwrap_or_default();

    listing.postal_code = raw
        .text(POSTAL_KEYS)
        .and_then(|p| extract_postal_code(&p))
        .or_else(|| listing.address.as_deref().and_then(extract_postal_code));

    listing.price = raw.first_of(PRICE_KEYS).and_then(price_value);

    listing.size_m2 = raw
        .first_of(SIZE_KEYS)
        .and_then(size_value)
        .or_else(|| extract_size_m2(&free_text));

    listing.rooms = raw
        .first_of(ROOM_KEYS)
        .and_then(rooms_value)
        .or_else(|| extract_rooms(&free_text));

    let type_hint = raw.text(TYPE_KEYS).unwrap_or_default();
    listing.property_type = PropertyType::parse(&type_hint).unwrap_or_else(|| {
        let address = listing.address.as_deref().unwrap_or_default();
        classify_property_type(&[&type_hint, &free_text, address])
    });

    let price_text = raw.text(PRICE_KEYS).unwrap_or_default();
    listing.listing_type = parse_listing_type(
        raw.text(LISTING_TYPE_KEYS).as_deref().unwrap_or_default(),
        &price_text,
    );

    listing.build_year = raw
        .first_of(BUILD_YEAR_KEYS)
        .and_then(year_value)
        .or_else(|| extract_build_year(&free_text));

    listing.energy_label = raw
        .text(ENERGY_LABEL_KEYS)
        .and_then(|label| parse_energy_label(&label))
        .or_else(|| extract_energy_label(&free_text));

    listing.latitude = raw
        .first_of(LATITUDE_KEYS)
        .and_then(float_value)
        .filter(|lat| (-90.0..=90.0).contains(lat));
    listing.longitude = raw
        .first_of(LONGITUDE_KEYS)
        .and_then(float_value)
        .filter(|lon| (-180.0..=180.0).contains(lon));

    listing.has_garden = raw
        .first_of(GARDEN_KEYS)
        .and_then(flag_value)
        .or_else(|| mentions_any(&free_text, GARDEN_WORDS).then_some(true));
    listing.has_parking = raw
        .first_of(PARKING_KEYS)
        .and_then(flag_value)
        .or_else(|| mentions_any(&free_text, PARKING_WORDS).then_some(true));

    if !raw.is_empty() {
        listing.raw_data = Some(raw.to_json());
    }

    listing
}

fn collapse_whitespace(value: &str) -> String {
    WHITESPACE_RE.replace_all(value.trim(), " ").into_owned()
}

fn positive(value: f64) -> Option<f64> {
    (value.is_finite() && value > 0.0).then_some(value)
}

fn price_value(value: &JsonValue) -> Option<f64> {
    match value {
        JsonValue::Number(n) => n.as_f64().and_then(positive),
        JsonValue::String(s) => parse_price(s),
        _ => None,
    }
}

fn size_value(value: &JsonValue) -> Option<f64> {
    match value {
        JsonValue::Number(n) => n.as_f64().and_then(positive),
        JsonValue::String(s) => extract_size_m2(s)
            .or_else(|| s.trim().replace(',', ".").parse::<f64>().ok().and_then(positive)),
        _ => None,
    }
}

fn rooms_value(value: &JsonValue) -> Option<u32> {
    match value {
        JsonValue::Number(n) => n
            .as_u64()
            .and_then(|r| u32::try_from(r).ok())
            .filter(|r| *r > 0),
        JsonValue::String(s) => extract_rooms(s)
            .or_else(|| s.trim().parse::<u32>().ok().filter(|r| *r > 0)),
        _ => None,
    }
}

fn float_value(value: &JsonValue) -> Option<f64> {
    let parsed = match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().replace(',', ".").parse::<f64>().ok(),
        _ => None,
    };
    parsed.filter(|v| v.is_finite())
}

fn plausible_year(year: i64) -> Option<i32> {
    i32::try_from(year)
        .ok()
        .filter(|year| (1000..=2100).contains(year))
}

fn year_value(value: &JsonValue) -> Option<i32> {
    match value {
        JsonValue::Number(n) => n.as_i64().and_then(plausible_year),
        JsonValue::String(s) => s
            .trim()
            .parse::<i64>()
            .ok()
            .and_then(plausible_year)
            .or_else(|| extract_build_year(s)),
        _ => None,
    }
}

fn flag_value(value: &JsonValue) -> Option<bool> {
    match value {
        JsonValue::Bool(b) => Some(*b),
        JsonValue::Number(n) => n.as_i64().map(|n| n != 0),
        JsonValue::String(s) => match s.trim().to_lowercase().as_str() {
            "true" | "yes" | "ja" | "1" => Some(true),
            "false" | "no" | "nee" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn mentions_any(text: &str, words: &[&str]) -> bool {
    text.split(|c: char| !c.is_alphanumeric())
        .any(|token| words.iter().any(|w| token.eq_ignore_ascii_case(w)))
}

/// Four-digit year after `bouwjaar` or `built in`.
pub fn extract_build_year(text: &str) -> Option<i32> {
    let caps = BUILD_YEAR_RE.captures(text)?;
    caps[1].parse::<i64>().ok().and_then(plausible_year)
}

/// Canonical energy label (`A++`, `C`, ...) or `None` for anything else.
pub fn parse_energy_label(value: &str) -> Option<String> {
    let label = value.trim().to_ascii_uppercase();
    ENERGY_VALUE_RE.is_match(&label).then_some(label)
}

/// Energy label following `energielabel` or `energy label` in free text.
pub fn extract_energy_label(text: &str) -> Option<String> {
    let caps = ENERGY_LABEL_RE.captures(text)?;
    parse_energy_label(&caps[1])
}

/// Parses a free-form price such as `"€ 425.000 k.k."` or `"€ 1.250,50 p/mnd"`.
///
/// The final separator decides: `,` or `.` followed by at most two digits is a
/// decimal mark, anything else groups thousands.
pub fn parse_price(text: &str) -> Option<f64> {
    let token = PRICE_TOKEN_RE.find(text)?.as_str();
    let token = token.trim_end_matches(['.', ',']);

    let last_comma = token.rfind(',');
    let last_dot = token.rfind('.');

    let (int_part, frac_part) = match (last_comma, last_dot) {
        (Some(comma), dot) if dot.map_or(true, |d| d < comma) && token.len() - comma - 1 <= 2 => {
            (&token[..comma], &token[comma + 1..])
        }
        (_, Some(dot)) if token.len() - dot - 1 <= 2 && !token[dot + 1..].contains(',') => {
            (&token[..dot], &token[dot + 1..])
        }
        _ => (token, ""),
    };

    let digits: String = int_part.chars().filter(char::is_ascii_digit).collect();
    if digits.is_empty() {
        return None;
    }
    let number = if frac_part.is_empty() {
        digits
    } else {
        format!("{digits}.{frac_part}")
    };
    number.parse::<f64>().ok().and_then(positive)
}

/// Number immediately before `m²`, `m2` or `vierkante meter`.
pub fn extract_size_m2(text: &str) -> Option<f64> {
    let caps = SIZE_RE.captures(text)?;
    caps[1].replace(',', ".").parse::<f64>().ok().and_then(positive)
}

/// Integer before a room word; bedroom counts are used only when no room count is present.
pub fn extract_rooms(text: &str) -> Option<u32> {
    ROOMS_RE
        .captures(text)
        .or_else(|| BEDROOMS_RE.captures(text))
        .and_then(|caps| caps[1].parse::<u32>().ok())
        .filter(|rooms| *rooms > 0)
}

/// Dutch postal code anywhere in `text`, as `1234AB`.
pub fn extract_postal_code(text: &str) -> Option<String> {
    let caps = POSTAL_RE.captures(text)?;
    Some(format!("{}{}", &caps[1], caps[2].to_ascii_uppercase()))
}

pub fn classify_property_type(texts: &[&str]) -> PropertyType {
    let tokens = texts
        .iter()
        .flat_map(|text| text.split(|c: char| !c.is_alphanumeric()))
        .filter(|token| !token.is_empty())
        .map(str::to_lowercase)
        .collect::<Vec<_>>();
    let has_any = |words: &[&str]| tokens.iter().any(|t| words.contains(&t.as_str()));

    if has_any(PENTHOUSE_WORDS) {
        PropertyType::Penthouse
    } else if has_any(STUDIO_WORDS) {
        PropertyType::Studio
    } else if has_any(APARTMENT_WORDS) {
        PropertyType::Apartment
    } else if has_any(HOUSE_WORDS) {
        PropertyType::House
    } else {
        PropertyType::Unknown
    }
}

/// `rent`/`huur` (or a per-month price) means rent; everything else is a sale.
pub fn parse_listing_type(hint: &str, price_text: &str) -> ListingType {
    if let Some(explicit) = ListingType::parse(hint) {
        return explicit;
    }
    let hint = hint.to_lowercase();
    let price_text = price_text.to_lowercase();
    let rent = ["rent", "huur"].iter().any(|w| hint.contains(w))
        || ["/mnd", "per maand", "/month", "per month"]
            .iter()
            .any(|w| price_text.contains(w));
    if rent {
        ListingType::Rent
    } else {
        ListingType::Sale
    }
}
