//! Tick Translator - Raw Gateway Events to Domain Ticks
//!
//! Converts the unvalidated vendor payload into a `DomainTick`,
//! enforcing the domain invariants. A malformed message is logged,
//! counted, and discarded; it never halts the pipeline.

use std::sync::Arc;

use chrono::DateTime;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use tracing::warn;

use crate::adapters::metrics::MetricsRegistry;
use crate::domain::tick::{exchange_offset, now_exchange, DomainTick, Exchange, TickError};
use crate::ports::gateway::RawTick;

/// Validating translator at the gateway/pipeline boundary.
pub struct TickTranslator {
    metrics: Arc<MetricsRegistry>,
}

impl TickTranslator {
    pub fn new(metrics: Arc<MetricsRegistry>) -> Self {
        Self { metrics }
    }

    /// Translate one raw event.
    ///
    /// `None` means the event was rejected (already metered + logged);
    /// the caller simply moves on to the next event.
    pub fn translate(&self, raw: &RawTick) -> Option<DomainTick> {
        match self.try_translate(raw) {
            Ok(tick) => Some(tick),
            Err(e) => {
                self.metrics.error_count.inc();
                warn!(
                    symbol = %raw.symbol,
                    raw_timestamp = raw.timestamp.as_deref().unwrap_or(""),
                    error = %e,
                    "Rejected malformed gateway event"
                );
                None
            }
        }
    }

    fn try_translate(&self, raw: &RawTick) -> Result<DomainTick, TickError> {
        let exchange = Exchange::parse(&raw.exchange)?;

        // Missing or unparseable vendor timestamps fall back to arrival
        // time; the tick itself is still good data.
        let timestamp = raw
            .timestamp
            .as_deref()
            .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
            .map_or_else(now_exchange, |ts| ts.with_timezone(&exchange_offset()));

        let price = Decimal::from_f64(raw.price)
            .ok_or_else(|| TickError::NonPositivePrice(raw.price.to_string()))?;
        let volume = Decimal::from_f64(raw.volume)
            .ok_or_else(|| TickError::NegativeVolume(raw.volume.to_string()))?;

        DomainTick::new(
            &raw.symbol,
            exchange,
            timestamp,
            price,
            volume,
            raw.bid.and_then(Decimal::from_f64),
            raw.ask.and_then(Decimal::from_f64),
        )
    }
}
