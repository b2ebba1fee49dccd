use crate::config::NegotiationConfig;
use crate::discovery::DiscoveryGateway;
use crate::model::{
    validate_currency, CounterpartRef, ListingStatus, NegotiationSession, Offer, PaymentRecord,
    SessionKey, SessionOutcome, ShipmentConfirmation,
};
use crate::oracle::{Candidate, DecisionAdvisor, SelectionPrompt};
use crate::orchestration::{SettlementOrchestrator, SettlementRequest};
use crate::protocol::{ListingQuery, Message, NegotiationReply, PurchaseOffer, ReplyAction, Role};
use crate::retry::{with_timeout, RetryPolicy};
use crate::transport::{send_message, MessageTransport};
use crate::workflow::{BuyerSignals, BuyerStep, BUYER_TRANSITIONS};
use crate::{AgentIdentity, ListingId, MarketError, Result, TransactionRef};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PurchaseIntent {
    pub description: String,
    #[serde(default)]
    pub category: Option<String>,
    pub budget: Decimal,
    pub currency: String,
    /// Price the opening offer is derived from; the asking price when absent.
    #[serde(default)]
    pub anchor_price: Option<Decimal>,
}

impl PurchaseIntent {
    pub fn validate(&self) -> Result<()> {
        if self.budget <= Decimal::ZERO {
            return Err(MarketError::Validation("Budget must be greater than 0".to_string()));
        }
        if matches!(self.anchor_price, Some(anchor) if anchor <= Decimal::ZERO) {
            return Err(MarketError::Validation("Anchor price must be greater than 0".to_string()));
        }
        validate_currency(&self.currency)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PurchaseReceipt {
    pub listing_id: ListingId,
    pub price: Decimal,
    pub transaction_ref: TransactionRef,
    pub shipment: ShipmentConfirmation,
}

#[derive(Debug)]
pub struct WorkflowFailure {
    pub step: BuyerStep,
    pub error: MarketError,
}

#[derive(Debug)]
pub struct BuyerState {
    pub step: BuyerStep,
    pub candidates: Vec<Candidate>,
    pub tried: Vec<ListingId>,
    pub selected: Option<Candidate>,
    pub round: u32,
    pub current_offer: Option<Decimal>,
    pub session: Option<NegotiationSession>,
    pub agreed_price: Option<Decimal>,
    pub payment: Option<PaymentRecord>,
    pub shipment: Option<ShipmentConfirmation>,
    pub failure: Option<WorkflowFailure>,
    pub completed: bool,
    pub trail: Vec<BuyerStep>,
    pub receipt: Option<PurchaseReceipt>,
}

impl BuyerState {
    fn new() -> Self {
        Self {
            step: BuyerStep::Discover,
            candidates: Vec::new(),
            tried: Vec::new(),
            selected: None,
            round: 0,
            current_offer: None,
            session: None,
            agreed_price: None,
            payment: None,
            shipment: None,
            failure: None,
            completed: false,
            trail: vec![BuyerStep::Discover],
            receipt: None,
        }
    }

    fn untried(&self) -> Vec<Candidate> {
        self.candidates
            .iter()
            .filter(|c| !self.tried.contains(&c.listing.id))
            .cloned()
            .collect()
    }

    fn enter(&mut self, step: BuyerStep) {
        self.step = step;
        self.trail.push(step);
    }

    fn fail(&mut self, step: BuyerStep, error: MarketError) {
        warn!(step = %step, kind = error.kind(), "purchase failed: {}", error);
        self.failure = Some(WorkflowFailure { step, error });
        self.enter(BuyerStep::Failed);
    }

    pub fn into_result(self) -> Result<PurchaseReceipt> {
        match (self.receipt, self.failure) {
            (Some(receipt), _) => Ok(receipt),
            (None, Some(failure)) => Err(failure.error),
            (None, None) => Err(MarketError::Negotiation("purchase did not finish".to_string())),
        }
    }
}

struct StepOutcome {
    signals: BuyerSignals,
    error: Option<MarketError>,
}

impl StepOutcome {
    fn ok(signals: BuyerSignals) -> Self {
        Self { signals, error: None }
    }

    fn err(signals: BuyerSignals, error: MarketError) -> Self {
        Self {
            signals,
            error: Some(error),
        }
    }
}

pub struct BuyerAgent {
    identity: AgentIdentity,
    discovery: Arc<dyn DiscoveryGateway>,
    transport: Arc<dyn MessageTransport>,
    advisor: DecisionAdvisor,
    orchestrator: Arc<SettlementOrchestrator>,
    capability: String,
    max_rounds: u32,
    anchor_ratio: Decimal,
    call_timeout: Duration,
    retry: RetryPolicy,
}

impl BuyerAgent {
    pub fn new(
        identity: impl Into<AgentIdentity>,
        discovery: Arc<dyn DiscoveryGateway>,
        transport: Arc<dyn MessageTransport>,
        advisor: DecisionAdvisor,
        orchestrator: Arc<SettlementOrchestrator>,
    ) -> Self {
        Self {
            identity: identity.into(),
            discovery,
            transport,
            advisor,
            orchestrator,
            capability: "marketplace_seller".to_string(),
            max_rounds: 3,
            anchor_ratio: Decimal::new(90, 2),
            call_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capability = capability.into();
        self
    }

    pub fn with_negotiation(mut self, config: &NegotiationConfig) -> Self {
        self.max_rounds = config.max_rounds.max(1);
        self.anchor_ratio = config.anchor_ratio;
        self.call_timeout = config.message_timeout();
        self
    }

    pub fn with_max_rounds(mut self, max_rounds: u32) -> Self {
        self.max_rounds = max_rounds.max(1);
        self
    }

    pub fn with_call_policy(mut self, call_timeout: Duration, retry: RetryPolicy) -> Self {
        self.call_timeout = call_timeout;
        self.retry = retry;
        self
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub async fn run(&self, intent: PurchaseIntent) -> BuyerState {
        let mut state = BuyerState::new();
        if let Err(e) = intent.validate() {
            state.fail(BuyerStep::Discover, e);
            return state;
        }
        info!(buyer = %self.identity, budget = %intent.budget, "purchase started: {}", intent.description);

        while !state.step.is_terminal() {
            let step = state.step;
            let outcome = match step {
                BuyerStep::Discover => self.discover(&intent, &mut state).await,
                BuyerStep::Select => self.select(&intent, &mut state).await,
                BuyerStep::Negotiate => self.negotiate(&intent, &mut state).await,
                BuyerStep::Pay => self.pay(&intent, &mut state).await,
                BuyerStep::Complete | BuyerStep::Failed => break,
            };

            match BUYER_TRANSITIONS.next(step, &outcome.signals) {
                Some(transition) if transition.to == BuyerStep::Failed => {
                    let error = outcome.error.unwrap_or_else(|| default_error(step));
                    debug!(from = %step, "{}", transition.label);
                    state.fail(step, error);
                }
                Some(transition) => {
                    if let Some(error) = outcome.error {
                        debug!(step = %step, "recovered from: {}", error);
                    }
                    info!(buyer = %self.identity, from = %step, to = %transition.to, "{}", transition.label);
                    state.enter(transition.to);
                }
                None => {
                    let error = outcome.error.unwrap_or_else(|| default_error(step));
                    state.fail(step, error);
                }
            }
        }

        if state.step == BuyerStep::Complete {
            state.completed = true;
        }
        state
    }

    async fn send(&self, endpoint: &str, message: Message) -> Result<Message> {
        send_message(
            self.transport.as_ref(),
            endpoint,
            message,
            Role::Buyer,
            self.call_timeout,
            &self.retry,
        )
        .await
    }

    async fn discover(&self, intent: &PurchaseIntent, state: &mut BuyerState) -> StepOutcome {
        let counterparts = self
            .retry
            .run("discovery.lookup", || {
                with_timeout("discovery.lookup", self.call_timeout, self.discovery.lookup(&self.capability))
            })
            .await;
        let counterparts = match counterparts {
            Ok(found) => found,
            Err(e @ MarketError::Timeout { .. }) => return StepOutcome::err(BuyerSignals::default(), e),
            Err(e) => {
                return StepOutcome::err(
                    BuyerSignals::default(),
                    MarketError::Discovery(format!("lookup of {} failed: {}", self.capability, e)),
                )
            }
        };

        let query = ListingQuery {
            category: intent.category.clone(),
            max_price: None,
        };
        for counterpart in counterparts.iter().filter(|c| c.advertises(&self.capability)) {
            match self.query_listings(counterpart, &query, &intent.currency).await {
                Ok(found) => state.candidates.extend(found),
                Err(e) => warn!(
                    counterpart = %counterpart.agent_identity,
                    endpoint = %counterpart.endpoint,
                    "skipping counterpart: {}",
                    e
                ),
            }
        }
        info!(
            counterparts = counterparts.len(),
            candidates = state.candidates.len(),
            "discovery finished"
        );

        let signals = BuyerSignals {
            candidates: state.candidates.len(),
            ..Default::default()
        };
        if state.candidates.is_empty() {
            let reason = if counterparts.is_empty() {
                format!("no counterpart advertises {}", self.capability)
            } else {
                "no counterpart offered a matching listing".to_string()
            };
            return StepOutcome::err(signals, MarketError::Discovery(reason));
        }
        StepOutcome::ok(signals)
    }

    async fn query_listings(
        &self,
        counterpart: &CounterpartRef,
        query: &ListingQuery,
        currency: &str,
    ) -> Result<Vec<Candidate>> {
        match self
            .send(&counterpart.endpoint, Message::ListingQuery(query.clone()))
            .await?
        {
            Message::ListingCatalog(catalog) => Ok(catalog
                .listings
                .into_iter()
                .filter(|l| l.status == ListingStatus::Active && l.currency == currency)
                .map(|listing| Candidate {
                    listing,
                    seller: counterpart.clone(),
                })
                .collect()),
            other => Err(MarketError::Negotiation(format!(
                "expected listing_catalog, got {}",
                other.kind()
            ))),
        }
    }

    async fn select(&self, intent: &PurchaseIntent, state: &mut BuyerState) -> StepOutcome {
        let prompt = SelectionPrompt {
            description: intent.description.clone(),
            category: intent.category.clone(),
            budget: intent.budget,
            currency: intent.currency.clone(),
            candidates: state.untried(),
        };
        let Some(choice) = self.advisor.select(&prompt).await else {
            return StepOutcome::err(
                BuyerSignals::default(),
                MarketError::Selection(format!("no viable candidate for {:?}", intent.description)),
            );
        };

        let opening = opening_offer(intent, choice.listing.price, self.anchor_ratio);
        info!(
            listing_id = %choice.listing.id,
            seller = %choice.seller.agent_identity,
            ask = %choice.listing.price,
            opening = %opening,
            "candidate selected"
        );
        state.tried.push(choice.listing.id.clone());
        state.session = Some(NegotiationSession::new(SessionKey::new(&choice.listing.id, &self.identity)));
        state.selected = Some(choice);
        state.round = 1;
        state.current_offer = Some(opening);
        state.agreed_price = None;
        StepOutcome::ok(BuyerSignals {
            selected: true,
            ..Default::default()
        })
    }

    async fn negotiate(&self, intent: &PurchaseIntent, state: &mut BuyerState) -> StepOutcome {
        let untried = state.untried().len();
        let lost = |error: MarketError| {
            StepOutcome::err(
                BuyerSignals {
                    untried_candidates: untried,
                    ..Default::default()
                },
                error,
            )
        };
        let (Some(candidate), Some(price)) = (state.selected.clone(), state.current_offer) else {
            return lost(MarketError::Negotiation("no candidate selected".to_string()));
        };
        let round = state.round;
        let offer = PurchaseOffer {
            listing_id: candidate.listing.id.clone(),
            offer_price: price,
            currency: intent.currency.clone(),
            buyer_identity: self.identity.clone(),
            round,
            rationale: format!("round {} offer for {}", round, intent.description),
        };

        if let Some(session) = state.session.as_mut() {
            match Offer::new(
                offer.listing_id.clone(),
                offer.buyer_identity.clone(),
                price,
                offer.currency.clone(),
                offer.rationale.clone(),
            ) {
                Ok(terms) => session.record_offer(terms, round),
                Err(e) => return lost(e),
            }
        }

        let reply = match self
            .send(&candidate.seller.endpoint, Message::PurchaseOffer(offer))
            .await
        {
            Ok(Message::NegotiationReply(reply)) if reply.listing_id == candidate.listing.id => reply,
            Ok(other) => {
                return lost(MarketError::Negotiation(format!(
                    "unexpected {} in reply to an offer",
                    other.kind()
                )))
            }
            Err(MarketError::ConcurrentReservation { listing_id }) => {
                info!(listing_id = %listing_id, "listing taken by another buyer");
                self.close_session(state, SessionOutcome::Abandoned);
                return StepOutcome::err(
                    BuyerSignals {
                        contended: true,
                        untried_candidates: untried,
                        ..Default::default()
                    },
                    MarketError::ConcurrentReservation { listing_id },
                );
            }
            Err(e) => {
                self.close_session(state, SessionOutcome::Abandoned);
                return lost(MarketError::Negotiation(format!(
                    "offer on {} failed: {}",
                    candidate.listing.id, e
                )));
            }
        };

        info!(
            listing_id = %reply.listing_id,
            round,
            offer = %price,
            action = ?reply.action,
            counter = ?reply.counter_price,
            "seller replied"
        );
        if let Some(session) = state.session.as_mut() {
            session.record_reply(round, price, reply.clone());
        }

        let rounds_exhausted = round >= self.max_rounds;
        let signals = BuyerSignals {
            reply: Some(reply.action),
            rounds_exhausted,
            untried_candidates: untried,
            ..Default::default()
        };
        match reply.action {
            ReplyAction::Accept => {
                state.agreed_price = Some(price);
                self.close_session(state, SessionOutcome::Agreed { price });
                StepOutcome::ok(signals)
            }
            ReplyAction::Counter if !rounds_exhausted => {
                let revised = revise_offer(price, &reply, intent.budget);
                state.current_offer = Some(revised);
                state.round += 1;
                StepOutcome::ok(signals)
            }
            ReplyAction::Counter => {
                self.close_session(state, SessionOutcome::Abandoned);
                StepOutcome::err(
                    signals,
                    MarketError::Negotiation(format!(
                        "no agreement on {} within {} rounds",
                        candidate.listing.id, self.max_rounds
                    )),
                )
            }
            ReplyAction::Reject => {
                self.close_session(state, SessionOutcome::Abandoned);
                StepOutcome::err(
                    signals,
                    MarketError::Negotiation(format!(
                        "seller rejected {} for {}: {}",
                        price, candidate.listing.id, reply.rationale
                    )),
                )
            }
        }
    }

    fn close_session(&self, state: &mut BuyerState, outcome: SessionOutcome) {
        if let Some(session) = state.session.as_mut() {
            session.close(outcome);
        }
    }

    async fn pay(&self, intent: &PurchaseIntent, state: &mut BuyerState) -> StepOutcome {
        let (Some(candidate), Some(amount)) = (state.selected.clone(), state.agreed_price) else {
            return StepOutcome::err(
                BuyerSignals::default(),
                MarketError::Payment("no agreed price to pay".to_string()),
            );
        };
        let request = SettlementRequest {
            listing_id: candidate.listing.id.clone(),
            buyer: self.identity.clone(),
            amount,
            currency: intent.currency.clone(),
            seller: candidate.seller.clone(),
            retry_failed: false,
        };

        match self.orchestrator.execute_settlement(request).await {
            Ok(receipt) => {
                let transaction_ref = receipt.record.transaction_ref.clone().unwrap_or_default();
                state.receipt = Some(PurchaseReceipt {
                    listing_id: candidate.listing.id.clone(),
                    price: amount,
                    transaction_ref,
                    shipment: receipt.shipment.clone(),
                });
                state.payment = Some(receipt.record);
                state.shipment = Some(receipt.shipment);
                StepOutcome::ok(BuyerSignals {
                    payment_confirmed: true,
                    ..Default::default()
                })
            }
            Err(e) => {
                state.payment = self
                    .orchestrator
                    .ledger()
                    .get(&SessionKey::new(&candidate.listing.id, &self.identity));
                StepOutcome::err(BuyerSignals::default(), e)
            }
        }
    }
}

pub fn opening_offer(intent: &PurchaseIntent, ask: Decimal, anchor_ratio: Decimal) -> Decimal {
    let anchor = intent.anchor_price.unwrap_or(ask);
    (anchor * anchor_ratio).round_dp(2).min(intent.budget)
}

pub fn revise_offer(previous: Decimal, reply: &NegotiationReply, budget: Decimal) -> Decimal {
    match reply.counter_price {
        Some(counter) => previous.max(counter.min(budget)),
        None => previous,
    }
}

fn default_error(step: BuyerStep) -> MarketError {
    match step {
        BuyerStep::Discover => MarketError::Discovery("no candidates found".to_string()),
        BuyerStep::Select => MarketError::Selection("no candidate selected".to_string()),
        BuyerStep::Pay => MarketError::Payment("payment not confirmed".to_string()),
        _ => MarketError::Negotiation("negotiation ended without agreement".to_string()),
    }
}
