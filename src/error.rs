use std::time::Duration;
use thiserror::Error;

use crate::model::ListingStatus;

pub type Result<T> = std::result::Result<T, MarketError>;

#[derive(Error, Debug)]
pub enum MarketError {
    #[error("Discovery failed: {0}")]
    Discovery(String),

    #[error("Selection failed: {0}")]
    Selection(String),

    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    #[error("Listing {listing_id} is reserved by another session")]
    ConcurrentReservation { listing_id: String },

    #[error("Payment error: {0}")]
    Payment(String),

    /// Raised after a confirmed payment; the payment itself stands.
    #[error("Shipment failed after confirmed payment {transaction_ref}: {reason}")]
    Shipment {
        transaction_ref: String,
        reason: String,
    },

    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    #[error("Invalid transition for listing {listing_id}: {from} -> {to}")]
    InvalidTransition {
        listing_id: String,
        from: ListingStatus,
        to: ListingStatus,
    },

    #[error("Listing not found: {0}")]
    ListingNotFound(String),

    #[error("Listing {0} already exists with different fields")]
    ListingConflict(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Decision oracle error: {0}")]
    Oracle(String),

    #[error("Counterpart unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl MarketError {
    pub fn concurrent_reservation(listing_id: impl Into<String>) -> Self {
        MarketError::ConcurrentReservation {
            listing_id: listing_id.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        MarketError::Timeout {
            operation: operation.into(),
            after,
        }
    }

    pub fn is_transient(&self) -> bool {
        match self {
            MarketError::Timeout { .. } | MarketError::Unavailable(_) => true,
            MarketError::Network(err) => {
                err.is_timeout()
                    || err.is_connect()
                    || err.status().map(|s| s.is_server_error()).unwrap_or(false)
            }
            _ => false,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            MarketError::Discovery(_) => "discovery",
            MarketError::Selection(_) => "selection",
            MarketError::Negotiation(_) => "negotiation",
            MarketError::ConcurrentReservation { .. } => "concurrent_reservation",
            MarketError::Payment(_) => "payment",
            MarketError::Shipment { .. } => "shipment",
            MarketError::Timeout { .. } => "timeout",
            MarketError::InvalidTransition { .. } => "invalid_transition",
            MarketError::ListingNotFound(_) => "listing_not_found",
            MarketError::ListingConflict(_) => "listing_conflict",
            MarketError::Validation(_) => "validation",
            MarketError::Oracle(_) => "oracle",
            MarketError::Unavailable(_) => "unavailable",
            MarketError::Config(_) => "config",
            MarketError::Database(_) => "database",
            MarketError::Network(_) => "network",
            MarketError::Serialization(_) => "serialization",
            MarketError::Io(_) => "io",
        }
    }
}

impl From<serde_json::Error> for MarketError {
    fn from(err: serde_json::Error) -> Self {
        MarketError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for MarketError {
    fn from(err: serde_yaml::Error) -> Self {
        MarketError::Serialization(err.to_string())
    }
}

impl From<config::ConfigError> for MarketError {
    fn from(err: config::ConfigError) -> Self {
        MarketError::Config(err.to_string())
    }
}

impl From<async_openai::error::OpenAIError> for MarketError {
    fn from(err: async_openai::error::OpenAIError) -> Self {
        MarketError::Oracle(err.to_string())
    }
}

impl From<rust_decimal::Error> for MarketError {
    fn from(err: rust_decimal::Error) -> Self {
        MarketError::Validation(err.to_string())
    }
}

impl From<uuid::Error> for MarketError {
    fn from(err: uuid::Error) -> Self {
        MarketError::Validation(err.to_string())
    }
}

impl From<std::io::Error> for MarketError {
    fn from(err: std::io::Error) -> Self {
        MarketError::Io(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(MarketError::timeout("oracle", Duration::from_secs(1)).is_transient());
        assert!(MarketError::Unavailable("seller down".into()).is_transient());
        assert!(!MarketError::Payment("insufficient funds".into()).is_transient());
        assert!(!MarketError::concurrent_reservation("laptop-001").is_transient());
    }

    #[test]
    fn test_error_kind_tags() {
        assert_eq!(
            MarketError::concurrent_reservation("x").kind(),
            "concurrent_reservation"
        );
        assert_eq!(MarketError::Negotiation("cap".into()).kind(), "negotiation");
    }
}
