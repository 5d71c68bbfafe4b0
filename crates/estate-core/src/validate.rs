//! Plausibility checks applied before a listing is buffered for persistence.

use thiserror::Error;

use crate::Listing;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValidationPolicy {
    pub min_price: f64,
    pub max_price: f64,
    /// Optional living-area bounds in m². `None` disables the check.
    pub size_range: Option<(f64, f64)>,
}

impl Default for ValidationPolicy {
    fn default() -> Self {
        Self {
            min_price: 50_000.0,
            max_price: 5_000_000.0,
            size_range: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum Rejection {
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("price {price} outside plausible range {min}..={max}")]
    PriceOutOfRange { price: f64, min: f64, max: f64 },
    #[error("size {size_m2} m2 outside plausible range {min}..={max}")]
    SizeOutOfRange { size_m2: f64, min: f64, max: f64 },
}

#[derive(Debug, Clone, Default)]
pub struct Validator {
    policy: ValidationPolicy,
}

impl Validator {
    pub fn new(policy: ValidationPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &ValidationPolicy {
        &self.policy
    }

    pub fn validate(&self, listing: &Listing) -> bool {
        self.check(listing).is_ok()
    }

    /// Like [`Validator::validate`] but names the first failed rule.
    pub fn check(&self, listing: &Listing) -> Result<(), Rejection> {
        if let Some(field) = listing.missing_required_field() {
            return Err(Rejection::MissingField(field));
        }

        if let Some(price) = listing.price {
            let (min, max) = (self.policy.min_price, self.policy.max_price);
            if !(min..=max).contains(&price) {
                return Err(Rejection::PriceOutOfRange { price, min, max });
            }
        }

        if let (Some(size_m2), Some((min, max))) = (listing.size_m2, self.policy.size_range) {
            if !(min..=max).contains(&size_m2) {
                return Err(Rejection::SizeOutOfRange { size_m2, min, max });
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn complete(price: Option<f64>) -> Listing {
        let mut listing = Listing::empty("funda", Utc::now());
        listing.source_id = Some("4711".into());
        listing.address = Some("Herengracht 12".into());
        listing.city = Some("Amsterdam".into());
        listing.price = price;
        listing
    }

    #[test]
    fn rejects_each_missing_identity_field() {
        let validator = Validator::default();

        let mut no_id = complete(None);
        no_id.source_id = None;
        assert_eq!(validator.check(&no_id), Err(Rejection::MissingField("source_id")));

        let mut no_address = complete(None);
        no_address.address = Some(String::new());
        assert!(!validator.validate(&no_address));

        let mut no_city = complete(None);
        no_city.city = None;
        assert_eq!(validator.check(&no_city), Err(Rejection::MissingField("city")));
    }

    #[test]
    fn accepts_missing_optional_fields() {
        let validator = Validator::default();
        let listing = complete(None);
        assert!(listing.size_m2.is_none());
        assert!(validator.validate(&listing));
    }

    #[test]
    fn price_bounds_are_inclusive_at_default_thresholds() {
        let validator = Validator::default();
        assert!(validator.validate(&complete(Some(50_001.0))));
        assert!(validator.validate(&complete(Some(50_000.0))));
        assert!(validator.validate(&complete(Some(5_000_000.0))));
        assert!(!validator.validate(&complete(Some(49_999.0))));
        assert!(matches!(
            validator.check(&complete(Some(5_000_001.0))),
            Err(Rejection::PriceOutOfRange { .. })
        ));
    }

    #[test]
    fn thresholds_follow_the_configured_policy() {
        let validator = Validator::new(ValidationPolicy {
            min_price: 500.0,
            max_price: 10_000.0,
            size_range: Some((20.0, 1000.0)),
        });
        assert!(validator.validate(&complete(Some(1_850.0))));

        let mut tiny = complete(Some(1_850.0));
        tiny.size_m2 = Some(8.0);
        assert!(matches!(validator.check(&tiny), Err(Rejection::SizeOutOfRange { .. })));
    }
}
