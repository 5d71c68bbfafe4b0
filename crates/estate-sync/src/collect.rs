//! Probe, fetch, or fall back to synthetic data.

use std::sync::Arc;

use estate_adapters::{
    normalize, AdapterContext, ListingSource, MockListingGenerator, RawRecord, SourceError,
};
use estate_core::{Listing, SourceUsed};
use estate_storage::{retry_with_backoff, BackoffPolicy, Clock, RetryError};
use tracing::{error, info, info_span, warn, Instrument};

#[derive(Debug, Clone, PartialEq)]
pub struct Collection {
    pub listings: Vec<Listing>,
    pub source_used: SourceUsed,
    /// Probe attempts made against the real source.
    pub attempts: usize,
}

/// Collects from one source, substituting generated listings when the source is unreachable.
///
/// Transient failures never escape [`FallbackCollector::collect`]; permanent ones do, without
/// falling back.
pub struct FallbackCollector {
    source: Arc<dyn ListingSource>,
    fallback: MockListingGenerator,
    backoff: BackoffPolicy,
    clock: Arc<dyn Clock>,
}

impl FallbackCollector {
    pub fn new(
        source: Arc<dyn ListingSource>,
        fallback: MockListingGenerator,
        backoff: BackoffPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            source,
            fallback,
            backoff,
            clock,
        }
    }

    pub fn source_name(&self) -> &str {
        self.source.source()
    }

    pub async fn collect(&self, ctx: &AdapterContext) -> Result<Collection, SourceError> {
        let source = self.source.source().to_string();
        let span = info_span!("collect", run_id = %ctx.run_id, source = %source);
        self.collect_inner(ctx, &source).instrument(span).await
    }

    async fn collect_inner(
        &self,
        ctx: &AdapterContext,
        source: &str,
    ) -> Result<Collection, SourceError> {
        let mut attempts = 0usize;
        let probe = retry_with_backoff(&self.backoff, self.clock.as_ref(), source, |attempt| {
            attempts = attempt + 1;
            self.source.probe()
        })
        .await;

        match probe {
            Ok(()) => {}
            Err(RetryError::Permanent { error, .. }) => {
                error!(attempts, "source rejected probe: {error}");
                return Err(error);
            }
            Err(RetryError::Exhausted { error, .. }) => {
                warn!(attempts, "source unreachable, using fallback: {error}");
                return Ok(self.fall_back(ctx, attempts));
            }
        }

        match self.source.fetch(ctx).await {
            Ok(records) => {
                let listings = normalize_all(source, &records, ctx);
                info!(attempts, collected = listings.len(), "collected from source");
                Ok(Collection {
                    listings,
                    source_used: SourceUsed::Real,
                    attempts,
                })
            }
            Err(error @ SourceError::Transient(_)) => {
                warn!(attempts, "fetch failed, using fallback: {error}");
                Ok(self.fall_back(ctx, attempts))
            }
            Err(error) => {
                error!(attempts, "source changed shape: {error}");
                Err(error)
            }
        }
    }

    fn fall_back(&self, ctx: &AdapterContext, attempts: usize) -> Collection {
        let records = self.fallback.generate(self.fallback.config().count);
        let listings = normalize_all(self.fallback.source(), &records, ctx);
        info!(collected = listings.len(), "generated fallback listings");
        Collection {
            listings,
            source_used: SourceUsed::Fallback,
            attempts,
        }
    }
}

fn normalize_all(source: &str, records: &[RawRecord], ctx: &AdapterContext) -> Vec<Listing> {
    records
        .iter()
        .map(|record| normalize(source, record, ctx.fetched_at))
        .collect()
}
