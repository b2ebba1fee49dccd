//! Negotiation protocol wire contract.
//!
//! Every exchange is a self-contained request/response pair of [`Envelope`]s.
//! The envelope carries a kind discriminator and one or more content parts;
//! the structured `data` part is decoded into the [`Message`] tagged union
//! and validated here, so nothing downstream handles untrusted payloads.

use crate::model::{validate_currency, Listing, PaymentStatus, SessionKey, ShipmentConfirmation};
use crate::{AgentIdentity, ListingId, MarketError, Result, TransactionRef};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Buyer,
    Agent,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    ListingQuery,
    ListingCatalog,
    PurchaseOffer,
    NegotiationReply,
    SettlementLock,
    LockGrant,
    PaymentNotice,
    FulfillmentUpdate,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::ListingQuery => "listing_query",
            MessageKind::ListingCatalog => "listing_catalog",
            MessageKind::PurchaseOffer => "purchase_offer",
            MessageKind::NegotiationReply => "negotiation_reply",
            MessageKind::SettlementLock => "settlement_lock",
            MessageKind::LockGrant => "lock_grant",
            MessageKind::PaymentNotice => "payment_notice",
            MessageKind::FulfillmentUpdate => "fulfillment_update",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Part {
    Text { text: String },
    Data { data: serde_json::Value },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    pub id: Uuid,
    pub kind: MessageKind,
    pub role: Role,
    pub parts: Vec<Part>,
    pub timestamp: DateTime<Utc>,
}

impl Envelope {
    pub fn text(&self) -> Option<&str> {
        self.parts.iter().find_map(|part| match part {
            Part::Text { text } => Some(text.as_str()),
            _ => None,
        })
    }

    fn data(&self) -> Result<&serde_json::Value> {
        self.parts
            .iter()
            .find_map(|part| match part {
                Part::Data { data } => Some(data),
                _ => None,
            })
            .ok_or_else(|| malformed(self.kind, "missing data part"))
    }

    pub fn open(&self) -> Result<Message> {
        if self.parts.is_empty() {
            return Err(malformed(self.kind, "envelope has no content parts"));
        }
        let data = self.data()?;
        let message = match self.kind {
            MessageKind::ListingQuery => Message::ListingQuery(decode(self.kind, data)?),
            MessageKind::ListingCatalog => Message::ListingCatalog(decode(self.kind, data)?),
            MessageKind::PurchaseOffer => Message::PurchaseOffer(decode(self.kind, data)?),
            MessageKind::NegotiationReply => Message::NegotiationReply(decode(self.kind, data)?),
            MessageKind::SettlementLock => Message::SettlementLock(decode(self.kind, data)?),
            MessageKind::LockGrant => Message::LockGrant(decode(self.kind, data)?),
            MessageKind::PaymentNotice => Message::PaymentNotice(decode(self.kind, data)?),
            MessageKind::FulfillmentUpdate => Message::FulfillmentUpdate(decode(self.kind, data)?),
        };
        message
            .validate()
            .map_err(|e| malformed(self.kind, &e.to_string()))?;
        Ok(message)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| MarketError::Negotiation(format!("malformed envelope: {}", e)))
    }
}

fn decode<T: DeserializeOwned>(kind: MessageKind, data: &serde_json::Value) -> Result<T> {
    serde_json::from_value(data.clone()).map_err(|e| malformed(kind, &e.to_string()))
}

fn malformed(kind: MessageKind, detail: &str) -> MarketError {
    MarketError::Negotiation(format!("malformed {} message: {}", kind, detail))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Message {
    ListingQuery(ListingQuery),
    ListingCatalog(ListingCatalog),
    PurchaseOffer(PurchaseOffer),
    NegotiationReply(NegotiationReply),
    SettlementLock(SettlementLock),
    LockGrant(LockGrant),
    PaymentNotice(PaymentNotice),
    FulfillmentUpdate(FulfillmentUpdate),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::ListingQuery(_) => MessageKind::ListingQuery,
            Message::ListingCatalog(_) => MessageKind::ListingCatalog,
            Message::PurchaseOffer(_) => MessageKind::PurchaseOffer,
            Message::NegotiationReply(_) => MessageKind::NegotiationReply,
            Message::SettlementLock(_) => MessageKind::SettlementLock,
            Message::LockGrant(_) => MessageKind::LockGrant,
            Message::PaymentNotice(_) => MessageKind::PaymentNotice,
            Message::FulfillmentUpdate(_) => MessageKind::FulfillmentUpdate,
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            Message::ListingQuery(_) | Message::ListingCatalog(_) | Message::FulfillmentUpdate(_) => Ok(()),
            Message::PurchaseOffer(offer) => offer.validate(),
            Message::NegotiationReply(reply) => reply.validate(),
            Message::SettlementLock(lock) => {
                require_identity(&lock.buyer_identity)?;
                require_positive(lock.amount, "amount")?;
                validate_currency(&lock.currency)
            }
            Message::LockGrant(grant) => require_identity(&grant.holder),
            Message::PaymentNotice(notice) => {
                require_identity(&notice.buyer_identity)?;
                require_positive(notice.amount, "amount")?;
                validate_currency(&notice.currency)?;
                if notice.status == PaymentStatus::Confirmed && notice.transaction_ref.is_none() {
                    return Err(MarketError::Validation(
                        "confirmed payment notice requires a transaction_ref".to_string(),
                    ));
                }
                Ok(())
            }
        }
    }

    fn summary(&self) -> String {
        match self {
            Message::ListingQuery(q) => format!(
                "Listing query{}",
                q.category.as_ref().map(|c| format!(" for {}", c)).unwrap_or_default()
            ),
            Message::ListingCatalog(c) => format!("{} listings available", c.listings.len()),
            Message::PurchaseOffer(o) => format!(
                "Offer {} {} for {} (round {})",
                o.offer_price, o.currency, o.listing_id, o.round
            ),
            Message::NegotiationReply(r) => match r.action {
                ReplyAction::Counter => format!(
                    "Counter at {} {}",
                    r.counter_price.unwrap_or_default(),
                    r.currency
                ),
                action => format!("{:?} on {}", action, r.listing_id),
            },
            Message::SettlementLock(l) => format!("Settlement lock for {}", l.listing_id),
            Message::LockGrant(g) => format!("Lock granted on {}", g.listing_id),
            Message::PaymentNotice(n) => format!("Payment {:?} for {}", n.status, n.listing_id),
            Message::FulfillmentUpdate(FulfillmentUpdate::Shipped(s)) => {
                format!("Shipped {} ({})", s.listing_id, s.tracking_reference)
            }
            Message::FulfillmentUpdate(FulfillmentUpdate::Released { listing_id }) => {
                format!("Released {}", listing_id)
            }
        }
    }

    pub fn into_envelope(self, role: Role) -> Result<Envelope> {
        let kind = self.kind();
        let text = self.summary();
        let data = match self {
            Message::ListingQuery(m) => serde_json::to_value(m)?,
            Message::ListingCatalog(m) => serde_json::to_value(m)?,
            Message::PurchaseOffer(m) => serde_json::to_value(m)?,
            Message::NegotiationReply(m) => serde_json::to_value(m)?,
            Message::SettlementLock(m) => serde_json::to_value(m)?,
            Message::LockGrant(m) => serde_json::to_value(m)?,
            Message::PaymentNotice(m) => serde_json::to_value(m)?,
            Message::FulfillmentUpdate(m) => serde_json::to_value(m)?,
        };
        Ok(Envelope {
            id: Uuid::new_v4(),
            kind,
            role,
            parts: vec![Part::Text { text }, Part::Data { data }],
            timestamp: Utc::now(),
        })
    }
}

fn require_identity(identity: &str) -> Result<()> {
    if identity.trim().is_empty() {
        return Err(MarketError::Validation("identity must not be empty".to_string()));
    }
    Ok(())
}

fn require_positive(value: Decimal, field: &str) -> Result<()> {
    if value <= Decimal::ZERO {
        return Err(MarketError::Validation(format!("{} must be greater than 0", field)));
    }
    Ok(())
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ListingQuery {
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub max_price: Option<Decimal>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ListingCatalog {
    pub seller: AgentIdentity,
    pub listings: Vec<Listing>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PurchaseOffer {
    pub listing_id: ListingId,
    pub offer_price: Decimal,
    pub currency: String,
    pub buyer_identity: AgentIdentity,
    pub round: u32,
    #[serde(default)]
    pub rationale: String,
}

impl PurchaseOffer {
    pub fn session_key(&self) -> SessionKey {
        SessionKey::new(&self.listing_id, &self.buyer_identity)
    }

    pub fn validate(&self) -> Result<()> {
        require_identity(&self.buyer_identity)?;
        require_positive(self.offer_price, "offer_price")?;
        validate_currency(&self.currency)?;
        if self.listing_id.trim().is_empty() {
            return Err(MarketError::Validation("listing_id must not be empty".to_string()));
        }
        if self.round == 0 {
            return Err(MarketError::Validation("round numbers start at 1".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReplyAction {
    Accept,
    Counter,
    Reject,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NegotiationReply {
    pub listing_id: ListingId,
    pub round: u32,
    pub accepted: bool,
    pub action: ReplyAction,
    #[serde(default)]
    pub counter_price: Option<Decimal>,
    pub currency: String,
    #[serde(default)]
    pub rationale: String,
}

impl NegotiationReply {
    pub fn accept(offer: &PurchaseOffer, rationale: impl Into<String>) -> Self {
        Self::build(offer, ReplyAction::Accept, None, rationale)
    }

    pub fn counter(offer: &PurchaseOffer, price: Decimal, rationale: impl Into<String>) -> Self {
        Self::build(offer, ReplyAction::Counter, Some(price), rationale)
    }

    pub fn reject(offer: &PurchaseOffer, rationale: impl Into<String>) -> Self {
        Self::build(offer, ReplyAction::Reject, None, rationale)
    }

    fn build(
        offer: &PurchaseOffer,
        action: ReplyAction,
        counter_price: Option<Decimal>,
        rationale: impl Into<String>,
    ) -> Self {
        Self {
            listing_id: offer.listing_id.clone(),
            round: offer.round,
            accepted: action == ReplyAction::Accept,
            action,
            counter_price,
            currency: offer.currency.clone(),
            rationale: rationale.into(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_currency(&self.currency)?;
        if self.accepted != (self.action == ReplyAction::Accept) {
            return Err(MarketError::Validation(
                "accepted flag disagrees with action".to_string(),
            ));
        }
        match (self.action, self.counter_price) {
            (ReplyAction::Counter, None) => Err(MarketError::Validation(
                "counter reply requires counter_price".to_string(),
            )),
            (ReplyAction::Counter, Some(price)) => require_positive(price, "counter_price"),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SettlementLock {
    pub listing_id: ListingId,
    pub buyer_identity: AgentIdentity,
    pub amount: Decimal,
    pub currency: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LockGrant {
    pub listing_id: ListingId,
    pub holder: AgentIdentity,
    pub recipient: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PaymentNotice {
    pub listing_id: ListingId,
    pub buyer_identity: AgentIdentity,
    pub status: PaymentStatus,
    #[serde(default)]
    pub transaction_ref: Option<TransactionRef>,
    pub amount: Decimal,
    pub currency: String,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FulfillmentUpdate {
    Shipped(ShipmentConfirmation),
    Released { listing_id: ListingId },
}
