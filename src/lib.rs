//! # agent-market - autonomous buyer/seller agents
//!
//! Two agents complete a purchase without human intervention: discover a
//! counterpart, agree on price, settle payment and confirm fulfillment.
//!
//! ## Architecture
//!
//! - **Buyer workflow**: discover -> select -> negotiate -> pay -> complete
//! - **Seller workflow**: list -> wait -> evaluate -> accept -> ship, behind a message handler
//! - **Negotiation protocol**: typed envelopes exchanged over HTTP or in-process
//! - **Settlement orchestration**: idempotent payment ledger, listing lock, notification
//! - **Collaborators**: listing store (memory / SQLite), discovery, decision oracle, settlement gateway

pub mod buyer;
pub mod config;
pub mod database;
pub mod discovery;
pub mod error;
pub mod http;
pub mod llm;
pub mod logging;
pub mod model;
pub mod oracle;
pub mod orchestration;
pub mod protocol;
pub mod registry;
pub mod retry;
pub mod seller;
pub mod settlement;
pub mod store;
pub mod transport;
pub mod workflow;

pub use buyer::{BuyerAgent, BuyerState, PurchaseIntent, PurchaseReceipt};
pub use config::AppConfig;
pub use discovery::{DiscoveryGateway, HttpDiscovery, InMemoryDirectory};
pub use error::{MarketError, Result};
pub use model::{Listing, ListingStatus, NewListing, PaymentRecord, PaymentStatus};
pub use oracle::{DecisionAdvisor, DecisionOracle, RuleOracle};
pub use orchestration::{PaymentLedger, SettlementOrchestrator};
pub use protocol::{Envelope, Message, MessageKind};
pub use registry::AgentRegistry;
pub use seller::SellerAgent;
pub use settlement::{LedgerGateway, SettlementGateway};
pub use store::{InMemoryListingStore, ListingStore};

pub type ListingId = String;
pub type AgentIdentity = String;
pub type TransactionRef = String;
