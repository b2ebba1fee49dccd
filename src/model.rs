use crate::{AgentIdentity, ListingId, MarketError, Result, TransactionRef};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::protocol::NegotiationReply;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ListingStatus {
    Draft,
    Active,
    Reserved,
    Sold,
    Cancelled,
}

impl ListingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListingStatus::Draft => "draft",
            ListingStatus::Active => "active",
            ListingStatus::Reserved => "reserved",
            ListingStatus::Sold => "sold",
            ListingStatus::Cancelled => "cancelled",
        }
    }

    /// The complete set of legal status edges. Sold and cancelled are terminal.
    pub fn can_transition_to(&self, next: ListingStatus) -> bool {
        use ListingStatus::*;
        matches!(
            (self, next),
            (Draft, Active)
                | (Active, Reserved)
                | (Reserved, Sold)
                | (Reserved, Active)
                | (Active, Cancelled)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ListingStatus::Sold | ListingStatus::Cancelled)
    }
}

impl fmt::Display for ListingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ListingStatus {
    type Err = MarketError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "draft" => Ok(ListingStatus::Draft),
            "active" => Ok(ListingStatus::Active),
            "reserved" => Ok(ListingStatus::Reserved),
            "sold" => Ok(ListingStatus::Sold),
            "cancelled" => Ok(ListingStatus::Cancelled),
            other => Err(MarketError::Validation(format!("Invalid listing status: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Reservation {
    pub holder: AgentIdentity,
    /// Set while a settlement is in flight; the sweep only reconciles locks past the settlement window.
    pub locked: bool,
    pub reserved_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewListing {
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub price: Decimal,
    pub currency: String,
    #[serde(default = "default_condition")]
    pub condition: String,
    pub category: String,
    #[serde(default)]
    pub seller: AgentIdentity,
}

fn default_condition() -> String {
    "new".to_string()
}

impl NewListing {
    pub fn validate(&self) -> Result<()> {
        if self.title.trim().is_empty() {
            return Err(MarketError::Validation("Title must not be empty".to_string()));
        }
        if self.price <= Decimal::ZERO {
            return Err(MarketError::Validation("Price must be greater than 0".to_string()));
        }
        validate_currency(&self.currency)?;
        if self.seller.trim().is_empty() {
            return Err(MarketError::Validation("Seller identity must not be empty".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListingUpdate {
    pub title: Option<String>,
    pub description: Option<String>,
    pub price: Option<Decimal>,
    pub condition: Option<String>,
    pub category: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListingFilter {
    pub status: Option<ListingStatus>,
    pub category: Option<String>,
    pub seller: Option<AgentIdentity>,
}

impl ListingFilter {
    pub fn matches(&self, listing: &Listing) -> bool {
        self.status.map_or(true, |s| listing.status == s)
            && self
                .category
                .as_ref()
                .map_or(true, |c| listing.category.eq_ignore_ascii_case(c))
            && self.seller.as_ref().map_or(true, |s| &listing.seller == s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Listing {
    pub id: ListingId,
    pub title: String,
    pub description: String,
    pub price: Decimal,
    pub currency: String,
    pub condition: String,
    pub category: String,
    pub status: ListingStatus,
    pub seller: AgentIdentity,
    pub reservation: Option<Reservation>,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Listing {
    pub fn from_draft(id: ListingId, draft: NewListing) -> Self {
        let now = Utc::now();
        Self {
            id,
            title: draft.title,
            description: draft.description,
            price: draft.price,
            currency: draft.currency,
            condition: draft.condition,
            category: draft.category,
            status: ListingStatus::Draft,
            seller: draft.seller,
            reservation: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn same_fields(&self, draft: &NewListing) -> bool {
        self.title == draft.title
            && self.description == draft.description
            && self.price == draft.price
            && self.currency == draft.currency
            && self.condition == draft.condition
            && self.category == draft.category
            && self.seller == draft.seller
    }

    pub fn reserved_by(&self) -> Option<&str> {
        self.reservation.as_ref().map(|r| r.holder.as_str())
    }

    fn transition(&mut self, next: ListingStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(MarketError::InvalidTransition {
                listing_id: self.id.clone(),
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.touch();
        Ok(())
    }

    fn touch(&mut self) {
        self.version += 1;
        self.updated_at = Utc::now();
    }

    pub fn apply_update(&mut self, update: ListingUpdate) -> Result<()> {
        if !matches!(self.status, ListingStatus::Draft | ListingStatus::Active) {
            return Err(MarketError::Validation(format!(
                "Listing {} cannot be edited while {}",
                self.id, self.status
            )));
        }
        if let Some(price) = update.price {
            if price <= Decimal::ZERO {
                return Err(MarketError::Validation("Price must be greater than 0".to_string()));
            }
            self.price = price;
        }
        if let Some(title) = update.title {
            self.title = title;
        }
        if let Some(description) = update.description {
            self.description = description;
        }
        if let Some(condition) = update.condition {
            self.condition = condition;
        }
        if let Some(category) = update.category {
            self.category = category;
        }
        self.touch();
        Ok(())
    }

    pub fn publish(&mut self) -> Result<()> {
        if self.status == ListingStatus::Active {
            return Ok(());
        }
        self.transition(ListingStatus::Active)
    }

    /// Compare-and-set active -> reserved. Re-reserving for the same holder is a no-op.
    pub fn reserve(&mut self, holder: &str) -> Result<()> {
        match self.status {
            ListingStatus::Reserved if self.reserved_by() == Some(holder) => Ok(()),
            ListingStatus::Reserved => Err(MarketError::concurrent_reservation(&self.id)),
            _ => {
                self.transition(ListingStatus::Reserved)?;
                self.reservation = Some(Reservation {
                    holder: holder.to_string(),
                    locked: false,
                    reserved_at: Utc::now(),
                });
                Ok(())
            }
        }
    }

    pub fn lock_for_settlement(&mut self, holder: &str) -> Result<()> {
        self.reserve(holder)?;
        if let Some(reservation) = self.reservation.as_mut() {
            if !reservation.locked {
                reservation.locked = true;
                self.touch();
            }
        }
        Ok(())
    }

    pub fn release(&mut self, holder: &str) -> Result<()> {
        match self.status {
            ListingStatus::Active => Ok(()),
            ListingStatus::Reserved if self.reserved_by() == Some(holder) => {
                self.transition(ListingStatus::Active)?;
                self.reservation = None;
                Ok(())
            }
            ListingStatus::Reserved => Err(MarketError::concurrent_reservation(&self.id)),
            _ => Err(MarketError::InvalidTransition {
                listing_id: self.id.clone(),
                from: self.status,
                to: ListingStatus::Active,
            }),
        }
    }

    pub fn mark_sold(&mut self, holder: &str) -> Result<()> {
        match self.status {
            ListingStatus::Sold if self.reserved_by() == Some(holder) => Ok(()),
            ListingStatus::Reserved if self.reserved_by() != Some(holder) => {
                Err(MarketError::concurrent_reservation(&self.id))
            }
            _ => self.transition(ListingStatus::Sold),
        }
    }

    pub fn cancel(&mut self) -> Result<()> {
        if self.status == ListingStatus::Cancelled {
            return Ok(());
        }
        self.transition(ListingStatus::Cancelled)
    }
}

pub fn validate_currency(code: &str) -> Result<()> {
    if code.len() == 3 && code.chars().all(|c| c.is_ascii_uppercase()) {
        Ok(())
    } else {
        Err(MarketError::Validation(format!("Invalid currency code: {:?}", code)))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Offer {
    pub listing_id: ListingId,
    pub proposer: AgentIdentity,
    pub price: Decimal,
    pub currency: String,
    pub rationale: String,
    pub created_at: DateTime<Utc>,
}

impl Offer {
    pub fn new(
        listing_id: ListingId,
        proposer: AgentIdentity,
        price: Decimal,
        currency: String,
        rationale: impl Into<String>,
    ) -> Result<Self> {
        let offer = Self {
            listing_id,
            proposer,
            price,
            currency,
            rationale: rationale.into(),
            created_at: Utc::now(),
        };
        offer.validate()?;
        Ok(offer)
    }

    pub fn validate(&self) -> Result<()> {
        if self.price <= Decimal::ZERO {
            return Err(MarketError::Validation("Offer price must be greater than 0".to_string()));
        }
        validate_currency(&self.currency)
    }

    pub fn validate_against(&self, listing: &Listing) -> Result<()> {
        self.validate()?;
        if self.currency != listing.currency {
            return Err(MarketError::Negotiation(format!(
                "Offer currency {} does not match listing currency {}",
                self.currency, listing.currency
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionKey {
    pub listing_id: ListingId,
    pub buyer: AgentIdentity,
}

impl SessionKey {
    pub fn new(listing_id: impl Into<String>, buyer: impl Into<String>) -> Self {
        Self {
            listing_id: listing_id.into(),
            buyer: buyer.into(),
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.listing_id, self.buyer)
    }
}

/// Idempotency key for payments: one effective payment per (listing, buyer).
pub type IdempotencyKey = SessionKey;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum SessionOutcome {
    Agreed { price: Decimal },
    Abandoned,
    Expired,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoundExchange {
    pub offer_price: Decimal,
    pub reply: NegotiationReply,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NegotiationSession {
    pub id: Uuid,
    pub key: SessionKey,
    pub offers: Vec<Offer>,
    pub replies: BTreeMap<u32, RoundExchange>,
    pub rounds: u32,
    pub outcome: Option<SessionOutcome>,
    pub opened_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl NegotiationSession {
    pub fn new(key: SessionKey) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            key,
            offers: Vec::new(),
            replies: BTreeMap::new(),
            rounds: 0,
            outcome: None,
            opened_at: now,
            updated_at: now,
        }
    }

    pub fn is_open(&self) -> bool {
        self.outcome.is_none()
    }

    pub fn agreed_price(&self) -> Option<Decimal> {
        match self.outcome {
            Some(SessionOutcome::Agreed { price }) => Some(price),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.outcome,
            Some(SessionOutcome::Abandoned) | Some(SessionOutcome::Expired)
        )
    }

    /// The reply already given to this exact offer in `round`.
    pub fn reply_for(&self, round: u32, offer_price: Decimal) -> Option<&NegotiationReply> {
        self.replies
            .get(&round)
            .filter(|exchange| exchange.offer_price == offer_price)
            .map(|exchange| &exchange.reply)
    }

    pub fn answered(&self, round: u32) -> bool {
        self.replies.contains_key(&round)
    }

    pub fn record_offer(&mut self, offer: Offer, round: u32) {
        self.offers.push(offer);
        self.rounds = self.rounds.max(round);
        self.updated_at = Utc::now();
    }

    pub fn record_reply(&mut self, round: u32, offer_price: Decimal, reply: NegotiationReply) {
        self.replies.insert(round, RoundExchange { offer_price, reply });
        self.updated_at = Utc::now();
    }

    pub fn close(&mut self, outcome: SessionOutcome) {
        self.outcome = Some(outcome);
        self.updated_at = Utc::now();
    }

    pub fn last_offer(&self) -> Option<&Offer> {
        self.offers.last()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Confirmed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PaymentRecord {
    pub key: IdempotencyKey,
    pub amount: Decimal,
    pub currency: String,
    pub transaction_ref: Option<TransactionRef>,
    pub status: PaymentStatus,
    pub failure_reason: Option<String>,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PaymentRecord {
    pub fn pending(key: IdempotencyKey, amount: Decimal, currency: String) -> Self {
        let now = Utc::now();
        Self {
            key,
            amount,
            currency,
            transaction_ref: None,
            status: PaymentStatus::Pending,
            failure_reason: None,
            attempts: 1,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CounterpartRef {
    pub agent_identity: AgentIdentity,
    pub endpoint: String,
    #[serde(default)]
    pub advertised_capabilities: Vec<String>,
}

impl CounterpartRef {
    pub fn advertises(&self, capability: &str) -> bool {
        self.advertised_capabilities.iter().any(|c| c == capability)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ShipmentConfirmation {
    pub listing_id: ListingId,
    pub buyer: AgentIdentity,
    pub transaction_ref: TransactionRef,
    pub tracking_reference: String,
    pub shipped_at: DateTime<Utc>,
}
