//! Synthetic listing generator, used as the fallback source and for local runs.

use async_trait::async_trait;
use estate_core::{ListingType, PropertyType};
use rand::rngs::SmallRng;
use rand::seq::IndexedRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::{AdapterContext, ListingSource, RawRecord, SourceError};

pub const DEFAULT_MOCK_SOURCE: &str = "mock_generator";

const STREETS: &[&str] = &[
    "Damrak",
    "Herengracht",
    "Prinsengracht",
    "Kalverstraat",
    "Coolsingel",
    "Lijnbaan",
    "Witte de Withstraat",
    "Neude",
    "Oudegracht",
    "Nachtegaalstraat",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationProfile {
    pub city: String,
    /// Typical price of a 100 m² home.
    pub base_price: f64,
    pub price_multiplier: f64,
}

impl LocationProfile {
    pub fn new(city: &str, base_price: f64, price_multiplier: f64) -> Self {
        Self {
            city: city.to_string(),
            base_price,
            price_multiplier,
        }
    }

    pub fn price_per_m2(&self) -> f64 {
        self.base_price / 100.0 * self.price_multiplier
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratorConfig {
    pub source: String,
    pub locations: Vec<LocationProfile>,
    pub price_floor: f64,
    pub price_ceiling: f64,
    /// Number of records returned by [`ListingSource::fetch`].
    pub count: usize,
    /// Fixed seed for reproducible output; `None` draws fresh entropy per call.
    pub seed: Option<u64>,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            source: DEFAULT_MOCK_SOURCE.to_string(),
            locations: vec![
                LocationProfile::new("Amsterdam", 400_000.0, 1.4),
                LocationProfile::new("Rotterdam", 280_000.0, 0.9),
                LocationProfile::new("Utrecht", 350_000.0, 1.2),
                LocationProfile::new("Den Haag", 320_000.0, 1.1),
                LocationProfile::new("Eindhoven", 250_000.0, 0.8),
                LocationProfile::new("Groningen", 220_000.0, 0.7),
            ],
            price_floor: 60_000.0,
            price_ceiling: 4_500_000.0,
            count: 100,
            seed: None,
        }
    }
}

struct Shape {
    size_m2: (u32, u32),
    rooms: (u32, u32),
    price_factor: f64,
}

fn shape_of(property_type: PropertyType) -> Shape {
    match property_type {
        PropertyType::Studio => Shape {
            size_m2: (25, 60),
            rooms: (1, 1),
            price_factor: 0.9,
        },
        PropertyType::Penthouse => Shape {
            size_m2: (100, 300),
            rooms: (3, 6),
            price_factor: 1.5,
        },
        PropertyType::House => Shape {
            size_m2: (80, 250),
            rooms: (3, 6),
            price_factor: 1.1,
        },
        PropertyType::Apartment | PropertyType::Unknown => Shape {
            size_m2: (50, 150),
            rooms: (2, 4),
            price_factor: 1.0,
        },
    }
}

#[derive(Debug, Clone, Default)]
pub struct MockListingGenerator {
    config: GeneratorConfig,
}

impl MockListingGenerator {
    pub fn new(config: GeneratorConfig) -> Self {
        Self { config }
    }

    pub fn seeded(seed: u64) -> Self {
        Self::new(GeneratorConfig {
            seed: Some(seed),
            ..GeneratorConfig::default()
        })
    }

    pub fn config(&self) -> &GeneratorConfig {
        &self.config
    }

    fn rng(&self) -> SmallRng {
        match self.config.seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::from_rng(&mut rand::rng()),
        }
    }

    /// Produces `count` raw records with identities `mock_000000`, `mock_000001`, ...
    pub fn generate(&self, count: usize) -> Vec<RawRecord> {
        let mut rng = self.rng();
        let (floor, ceiling) = (
            self.config.price_floor.min(self.config.price_ceiling),
            self.config.price_ceiling.max(self.config.price_floor),
        );

        let mut out = Vec::with_capacity(count);
        for i in 0..count {
            let Some(location) = self.config.locations.choose(&mut rng) else {
                break;
            };
            let property_type = *PropertyType::GENERATED
                .choose(&mut rng)
                .unwrap_or(&PropertyType::Apartment);
            let shape = shape_of(property_type);

            let size_m2 = rng.random_range(shape.size_m2.0..=shape.size_m2.1);
            let rooms = rng.random_range(shape.rooms.0..=shape.rooms.1);
            let variation = rng.random_range(0.8..=1.2);
            let price = (location.price_per_m2() * f64::from(size_m2) * shape.price_factor
                * variation)
                .clamp(floor, ceiling)
                .round();

            let street = STREETS.choose(&mut rng).copied().unwrap_or("Damrak");
            let number = rng.random_range(1..=500);
            let postal_digits = rng.random_range(1000..=9999);
            let letters: String = (0..2)
                .map(|_| char::from(rng.random_range(b'A'..=b'Z')))
                .collect();

            let mut record = RawRecord::new()
                .with("source_id", format!("mock_{i:06}"))
                .with("address", format!("{street} {number}"))
                .with("postal_code", format!("{postal_digits}{letters}"))
                .with("city", location.city.clone())
                .with("price", price)
                .with("size_m2", size_m2)
                .with("rooms", rooms)
                .with("property_type", property_type.as_str())
                .with("listing_type", ListingType::Sale.as_str())
                .with("has_garden", rng.random_bool(0.4))
                .with("has_parking", rng.random_bool(0.6))
                .with("latitude", 52.0 + rng.random_range(-1.0..=1.0))
                .with("longitude", 5.0 + rng.random_range(-2.0..=2.0));
            if rng.random_bool(0.8) {
                record.insert("build_year", rng.random_range(1950..=2023));
            }
            out.push(record);
        }
        out
    }
}

#[async_trait]
impl ListingSource for MockListingGenerator {
    fn source(&self) -> &str {
        &self.config.source
    }

    async fn probe(&self) -> Result<(), SourceError> {
        Ok(())
    }

    async fn fetch(&self, ctx: &AdapterContext) -> Result<Vec<RawRecord>, SourceError> {
        let scraped_at = ctx.fetched_at.to_rfc3339();
        Ok(self
            .generate(self.config.count)
            .into_iter()
            .map(|record| record.with("scraped_at", scraped_at.clone()))
            .collect())
    }
}
