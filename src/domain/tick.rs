//! Core market data domain types.
//!
//! Defines the canonical tick model and its validation rules. A
//! `DomainTick` can only be built through the validating constructor,
//! is immutable afterwards, and carries timestamps normalized to the
//! exchange session offset (+08:00).

use chrono::{DateTime, FixedOffset, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Exchange session offset: all tick and report timestamps are pinned
/// to China Standard Time regardless of the host timezone.
const EXCHANGE_UTC_OFFSET_SECS: i32 = 8 * 3600;

/// Fixed offset used to normalize every ingested timestamp.
pub fn exchange_offset() -> FixedOffset {
    // +08:00 is always within chrono's valid offset range.
    FixedOffset::east_opt(EXCHANGE_UTC_OFFSET_SECS).expect("valid fixed offset")
}

/// Current time in the exchange offset.
pub fn now_exchange() -> DateTime<FixedOffset> {
    Utc::now().with_timezone(&exchange_offset())
}

/// Maximum accepted symbol length (product code + contract month).
const MAX_SYMBOL_LEN: usize = 30;

/// Validation failure for a raw gateway event.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TickError {
    #[error("invalid symbol format: {0}")]
    InvalidSymbol(String),
    #[error("unknown exchange: {0}")]
    UnknownExchange(String),
    #[error("non-positive price: {0}")]
    NonPositivePrice(String),
    #[error("negative volume: {0}")]
    NegativeVolume(String),
}

/// Futures exchanges served by the gateway (closed enumeration).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Exchange {
    /// Shanghai Futures Exchange
    Shfe,
    /// Dalian Commodity Exchange
    Dce,
    /// Zhengzhou Commodity Exchange
    Czce,
    /// China Financial Futures Exchange
    Cffex,
    /// Shanghai International Energy Exchange
    Ine,
    /// Guangzhou Futures Exchange
    Gfex,
}

impl Exchange {
    /// Parse the exchange code carried by a vt-style symbol suffix.
    pub fn parse(code: &str) -> Result<Self, TickError> {
        match code.to_ascii_uppercase().as_str() {
            "SHFE" => Ok(Self::Shfe),
            "DCE" => Ok(Self::Dce),
            "CZCE" => Ok(Self::Czce),
            "CFFEX" => Ok(Self::Cffex),
            "INE" => Ok(Self::Ine),
            "GFEX" => Ok(Self::Gfex),
            other => Err(TickError::UnknownExchange(other.to_string())),
        }
    }

    /// Canonical uppercase code used in subjects and vt symbols.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Shfe => "SHFE",
            Self::Dce => "DCE",
            Self::Czce => "CZCE",
            Self::Cffex => "CFFEX",
            Self::Ine => "INE",
            Self::Gfex => "GFEX",
        }
    }
}

impl std::fmt::Display for Exchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Validate a trading symbol.
///
/// Accepts product code + contract month (rb2401, IF2312) and the other
/// common shapes the gateway emits: first char alphanumeric, then
/// letters, numbers, dots, dashes, or underscores, max 30 chars.
pub fn validate_symbol(raw: &str) -> Result<String, TickError> {
    let symbol = raw.trim();
    if symbol.is_empty() || symbol.len() > MAX_SYMBOL_LEN {
        return Err(TickError::InvalidSymbol(raw.to_string()));
    }
    let mut chars = symbol.chars();
    let first = chars.next().unwrap_or(' ');
    if !first.is_ascii_alphanumeric() {
        return Err(TickError::InvalidSymbol(raw.to_string()));
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_')) {
        return Err(TickError::InvalidSymbol(raw.to_string()));
    }
    Ok(symbol.to_string())
}

/// Wire serialization strategy for published ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerializationStrategy {
    /// Human-readable JSON (default, interoperable with any consumer).
    Json,
    /// Compact bincode framing for bandwidth-sensitive consumers.
    Bincode,
}

impl Default for SerializationStrategy {
    fn default() -> Self {
        Self::Json
    }
}

/// Immutable, validated market data tick.
///
/// Invariants: `price > 0` and `volume >= 0`. Violating input is
/// rejected by [`DomainTick::new`], never coerced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainTick {
    /// Trading symbol (validated, without exchange suffix).
    pub symbol: String,
    /// Exchange the symbol trades on.
    pub exchange: Exchange,
    /// Tick time, normalized to +08:00 at ingestion.
    pub timestamp: DateTime<FixedOffset>,
    /// Last trade price (strictly positive).
    #[serde(with = "rust_decimal::serde::str")]
    pub price: Decimal,
    /// Trade volume (non-negative).
    #[serde(with = "rust_decimal::serde::str")]
    pub volume: Decimal,
    /// Current best bid, when the gateway provides one.
    #[serde(with = "rust_decimal::serde::str_option")]
    pub bid: Option<Decimal>,
    /// Current best ask, when the gateway provides one.
    #[serde(with = "rust_decimal::serde::str_option")]
    pub ask: Option<Decimal>,
}

impl DomainTick {
    /// Build a validated tick; the only way to construct one.
    pub fn new(
        symbol: &str,
        exchange: Exchange,
        timestamp: DateTime<FixedOffset>,
        price: Decimal,
        volume: Decimal,
        bid: Option<Decimal>,
        ask: Option<Decimal>,
    ) -> Result<Self, TickError> {
        let symbol = validate_symbol(symbol)?;
        if price <= Decimal::ZERO {
            return Err(TickError::NonPositivePrice(price.to_string()));
        }
        if volume < Decimal::ZERO {
            return Err(TickError::NegativeVolume(volume.to_string()));
        }
        Ok(Self {
            symbol,
            exchange,
            timestamp: timestamp.with_timezone(&exchange_offset()),
            price,
            volume,
            bid,
            ask,
        })
    }

    /// vt-style identifier: `symbol.EXCHANGE`.
    pub fn vt_symbol(&self) -> String {
        format!("{}.{}", self.symbol, self.exchange.code())
    }

    /// Publish subject in the tick data plane hierarchy.
    pub fn subject(&self) -> String {
        format!("md.tick.{}.{}", self.exchange.code(), self.symbol)
    }
}

impl std::fmt::Display for DomainTick {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.vt_symbol(), self.price)
    }
}
