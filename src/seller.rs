use crate::model::{
    Listing, ListingFilter, ListingStatus, NegotiationSession, NewListing, Offer, PaymentStatus,
    SessionKey, SessionOutcome, ShipmentConfirmation,
};
use crate::oracle::{DecisionAdvisor, EvaluationPrompt};
use crate::protocol::{
    Envelope, FulfillmentUpdate, ListingCatalog, ListingQuery, LockGrant, Message, NegotiationReply,
    PaymentNotice, PurchaseOffer, ReplyAction, Role, SettlementLock,
};
use crate::retry::{with_timeout, RetryPolicy};
use crate::settlement::SettlementGateway;
use crate::store::ListingStore;
use crate::transport::MessageHandler;
use crate::workflow::{SellerSignals, SellerStep, SELLER_TRANSITIONS};
use crate::{AgentIdentity, ListingId, MarketError, Result, TransactionRef};
use async_trait::async_trait;
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const ARCHIVED_SESSIONS: usize = 16;
const TRAIL_LIMIT: usize = 64;

/// Per-listing seller state. `sessions` holds live negotiations only.
#[derive(Debug, Clone)]
pub struct SellerWorkflow {
    pub listing_id: ListingId,
    pub step: SellerStep,
    pub sessions: HashMap<AgentIdentity, NegotiationSession>,
    pub archived: VecDeque<NegotiationSession>,
    pub shipment: Option<ShipmentConfirmation>,
    pub trail: Vec<SellerStep>,
}

impl SellerWorkflow {
    fn new(listing_id: &str) -> Self {
        Self {
            listing_id: listing_id.to_string(),
            step: SellerStep::List,
            sessions: HashMap::new(),
            archived: VecDeque::new(),
            shipment: None,
            trail: vec![SellerStep::List],
        }
    }

    fn advance(&mut self, signals: &SellerSignals) -> bool {
        match SELLER_TRANSITIONS.next(self.step, signals) {
            Some(transition) => {
                debug!(
                    listing_id = %self.listing_id,
                    from = %transition.from,
                    to = %transition.to,
                    "{}",
                    transition.label
                );
                self.step = transition.to;
                if self.trail.len() >= TRAIL_LIMIT {
                    self.trail.remove(0);
                }
                self.trail.push(transition.to);
                true
            }
            None => false,
        }
    }

    fn session(&mut self, key: SessionKey) -> &mut NegotiationSession {
        self.sessions
            .entry(key.buyer.clone())
            .or_insert_with(|| NegotiationSession::new(key))
    }

    /// Ends the buyer's live session; the next offer from them opens a new one.
    fn archive(&mut self, buyer: &str, outcome: SessionOutcome) {
        let Some(mut session) = self.sessions.remove(buyer) else {
            return;
        };
        if !session.is_terminal() {
            session.close(outcome);
        }
        debug!(listing_id = %self.listing_id, buyer, session = %session.id, "session archived");
        self.archived.push_back(session);
        while self.archived.len() > ARCHIVED_SESSIONS {
            self.archived.pop_front();
        }
    }

    fn retire(&mut self) {
        self.sessions.clear();
        self.archived.clear();
    }
}

pub struct SellerAgent {
    identity: AgentIdentity,
    store: Arc<dyn ListingStore>,
    advisor: DecisionAdvisor,
    gateway: Arc<dyn SettlementGateway>,
    max_rounds: u32,
    call_timeout: Duration,
    retry: RetryPolicy,
    settlement_ttl: Duration,
    workflows: parking_lot::Mutex<HashMap<ListingId, Arc<tokio::sync::Mutex<SellerWorkflow>>>>,
}

impl SellerAgent {
    pub fn new(
        identity: impl Into<AgentIdentity>,
        store: Arc<dyn ListingStore>,
        advisor: DecisionAdvisor,
        gateway: Arc<dyn SettlementGateway>,
    ) -> Self {
        Self {
            identity: identity.into(),
            store,
            advisor,
            gateway,
            max_rounds: 3,
            call_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
            settlement_ttl: Duration::from_secs(1_800),
            workflows: parking_lot::Mutex::new(HashMap::new()),
        }
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

    pub fn with_settlement_ttl(mut self, settlement_ttl: Duration) -> Self {
        self.settlement_ttl = settlement_ttl;
        self
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn store(&self) -> &Arc<dyn ListingStore> {
        &self.store
    }

    fn workflow(&self, listing_id: &str) -> Arc<tokio::sync::Mutex<SellerWorkflow>> {
        self.workflows
            .lock()
            .entry(listing_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(SellerWorkflow::new(listing_id))))
            .clone()
    }

    pub async fn workflow_state(&self, listing_id: &str) -> Option<SellerWorkflow> {
        let handle = self.workflows.lock().get(listing_id).cloned()?;
        let workflow = handle.lock().await;
        Some(workflow.clone())
    }

    pub async fn list(&self, listing_id: &str, mut draft: NewListing) -> Result<Listing> {
        draft.seller = self.identity.clone();
        let handle = self.workflow(listing_id);
        let mut workflow = handle.lock().await;

        self.store.create_with_id(listing_id, draft).await?;
        let listing = self.store.publish(listing_id).await?;
        if workflow.step == SellerStep::List {
            workflow.advance(&SellerSignals {
                published: true,
                ..Default::default()
            });
        }
        info!(listing_id, price = %listing.price, "listing published");
        Ok(listing)
    }

    pub async fn cancel_listing(&self, listing_id: &str) -> Result<Listing> {
        let handle = self.workflow(listing_id);
        let _workflow = handle.lock().await;
        let listing = self.store.cancel(listing_id).await?;
        self.workflows.lock().remove(listing_id);
        info!(listing_id, "listing cancelled");
        Ok(listing)
    }

    pub async fn handle_listing_query(&self, query: &ListingQuery) -> Result<ListingCatalog> {
        let listings = self
            .store
            .list(&ListingFilter {
                status: Some(ListingStatus::Active),
                category: query.category.clone(),
                seller: Some(self.identity.clone()),
            })
            .await?
            .into_iter()
            .filter(|l| query.max_price.map_or(true, |max| l.price <= max))
            .collect();
        Ok(ListingCatalog {
            seller: self.identity.clone(),
            listings,
        })
    }

    pub async fn handle_offer(&self, offer: PurchaseOffer) -> Result<NegotiationReply> {
        offer.validate()?;
        // Unknown and closed listings never get a workflow.
        let listing = self.store.get(&offer.listing_id).await?;
        if listing.status.is_terminal() {
            return closed_listing_reply(&offer, &listing);
        }

        let handle = self.workflow(&offer.listing_id);
        let mut workflow = handle.lock().await;

        if let Some(cached) = workflow
            .sessions
            .get(&offer.buyer_identity)
            .and_then(|s| s.reply_for(offer.round, offer.offer_price))
        {
            debug!(listing_id = %offer.listing_id, round = offer.round, "duplicate offer, replaying reply");
            return Ok(cached.clone());
        }

        let listing = self.store.get(&offer.listing_id).await?;
        match listing.status {
            ListingStatus::Reserved if listing.reserved_by() != Some(offer.buyer_identity.as_str()) => {
                return Err(MarketError::concurrent_reservation(&listing.id));
            }
            ListingStatus::Active | ListingStatus::Reserved => {}
            _ => return closed_listing_reply(&offer, &listing),
        }

        let terms = Offer::new(
            offer.listing_id.clone(),
            offer.buyer_identity.clone(),
            offer.offer_price,
            offer.currency.clone(),
            offer.rationale.clone(),
        )?;
        terms.validate_against(&listing)?;

        let max_rounds = self.max_rounds;
        let buyer = offer.buyer_identity.as_str();
        if offer.round > max_rounds {
            let reply = NegotiationReply::reject(&offer, format!("round cap of {} exceeded", max_rounds));
            workflow
                .session(offer.session_key())
                .record_reply(offer.round, offer.offer_price, reply.clone());
            workflow.archive(buyer, SessionOutcome::Expired);
            warn!(listing_id = %offer.listing_id, buyer, "offer beyond round cap");
            return Ok(reply);
        }

        // A fresh round-1 offer starts over; an agreement stays until paid or expired.
        let restarted = offer.round == 1
            && workflow
                .sessions
                .get(buyer)
                .map_or(false, |s| s.answered(1) && s.agreed_price().is_none());
        if restarted {
            info!(listing_id = %offer.listing_id, buyer, "buyer restarted negotiation");
            workflow.archive(buyer, SessionOutcome::Abandoned);
        }

        let session = workflow.session(offer.session_key());
        if let Some(price) = session.agreed_price() {
            return Ok(if price == offer.offer_price {
                NegotiationReply::accept(&offer, "already agreed")
            } else {
                NegotiationReply::reject(&offer, format!("already agreed at {}", price))
            });
        }
        if session.answered(offer.round) {
            return Err(MarketError::Negotiation(format!(
                "round {} on {} was already answered for a different offer",
                offer.round, offer.listing_id
            )));
        }
        session.record_offer(terms, offer.round);

        workflow.advance(&SellerSignals {
            offer_queued: true,
            ..Default::default()
        });

        let prompt = EvaluationPrompt {
            acceptance_price: self.advisor.policy().acceptance_price(listing.price),
            listing,
            buyer: offer.buyer_identity.clone(),
            offer_price: offer.offer_price,
            currency: offer.currency.clone(),
            round: offer.round,
            max_rounds,
        };
        let verdict = self.advisor.evaluate(&prompt).await;
        let acceptable = verdict.acceptable();

        let reply = if acceptable {
            // Reserve before replying so an accept always holds the listing.
            if let Err(e) = self.store.reserve(&offer.listing_id, buyer).await {
                workflow.advance(&SellerSignals::default());
                return Err(e);
            }
            workflow
                .session(offer.session_key())
                .close(SessionOutcome::Agreed {
                    price: offer.offer_price,
                });
            NegotiationReply::accept(&offer, verdict.rationale)
        } else {
            match verdict.counter_price {
                Some(price) => NegotiationReply::counter(&offer, price, verdict.rationale),
                None => NegotiationReply::reject(&offer, verdict.rationale),
            }
        };

        workflow.advance(&SellerSignals {
            verdict_acceptable: acceptable,
            ..Default::default()
        });
        if acceptable {
            workflow.advance(&SellerSignals::default());
        }

        info!(
            listing_id = %offer.listing_id,
            buyer,
            round = offer.round,
            offer = %offer.offer_price,
            action = ?reply.action,
            "offer answered"
        );
        workflow
            .session(offer.session_key())
            .record_reply(offer.round, offer.offer_price, reply.clone());
        let finished = match reply.action {
            ReplyAction::Reject => true,
            ReplyAction::Counter => offer.round >= max_rounds,
            ReplyAction::Accept => false,
        };
        if finished {
            workflow.archive(buyer, SessionOutcome::Abandoned);
        }
        Ok(reply)
    }

    pub async fn handle_settlement_lock(&self, lock: SettlementLock) -> Result<LockGrant> {
        let handle = self.workflow(&lock.listing_id);
        let workflow = handle.lock().await;

        let agreed = workflow
            .sessions
            .get(&lock.buyer_identity)
            .and_then(|s| s.agreed_price());
        match agreed {
            Some(price) if price == lock.amount => {}
            Some(price) => {
                return Err(MarketError::Negotiation(format!(
                    "lock amount {} differs from agreed price {}",
                    lock.amount, price
                )));
            }
            None => {
                return Err(MarketError::Negotiation(format!(
                    "no agreement with {} on {}",
                    lock.buyer_identity, lock.listing_id
                )));
            }
        }

        self.store
            .lock_for_settlement(&lock.listing_id, &lock.buyer_identity)
            .await?;
        info!(listing_id = %lock.listing_id, buyer = %lock.buyer_identity, "listing locked for settlement");
        Ok(LockGrant {
            listing_id: lock.listing_id,
            holder: lock.buyer_identity,
            recipient: self.identity.clone(),
        })
    }

    pub async fn handle_payment_notice(&self, notice: PaymentNotice) -> Result<FulfillmentUpdate> {
        let handle = self.workflow(&notice.listing_id);
        let mut workflow = handle.lock().await;

        match notice.status {
            PaymentStatus::Pending => {
                return Err(MarketError::Validation(format!(
                    "payment for {} is still pending",
                    notice.listing_id
                )));
            }
            PaymentStatus::Failed => {
                match self.store.release(&notice.listing_id, &notice.buyer_identity).await {
                    Ok(_) => info!(
                        listing_id = %notice.listing_id,
                        reason = ?notice.reason,
                        "payment failed, listing released"
                    ),
                    Err(e) => warn!(listing_id = %notice.listing_id, "release after failed payment: {}", e),
                }
                workflow.archive(&notice.buyer_identity, SessionOutcome::Abandoned);
                return Ok(FulfillmentUpdate::Released {
                    listing_id: notice.listing_id,
                });
            }
            PaymentStatus::Confirmed => {}
        }

        let transaction_ref = notice
            .transaction_ref
            .clone()
            .ok_or_else(|| MarketError::Payment("confirmed notice without transaction_ref".to_string()))?;

        if let Some(shipment) = &workflow.shipment {
            if shipment.transaction_ref == transaction_ref && shipment.buyer == notice.buyer_identity {
                return Ok(FulfillmentUpdate::Shipped(shipment.clone()));
            }
            return Err(MarketError::concurrent_reservation(&notice.listing_id));
        }

        let agreed = workflow
            .sessions
            .get(&notice.buyer_identity)
            .and_then(|s| s.agreed_price());
        if agreed != Some(notice.amount) {
            return Err(MarketError::Payment(format!(
                "paid {} {} does not match the agreed price {:?}",
                notice.amount, notice.currency, agreed
            )));
        }

        let shipment = self
            .ship(&mut workflow, &notice.buyer_identity, transaction_ref)
            .await?;
        Ok(FulfillmentUpdate::Shipped(shipment))
    }

    async fn ship(
        &self,
        workflow: &mut SellerWorkflow,
        buyer: &str,
        transaction_ref: TransactionRef,
    ) -> Result<ShipmentConfirmation> {
        let verified = self
            .retry
            .run("settlement.verify", || {
                with_timeout("settlement.verify", self.call_timeout, self.gateway.verify(&transaction_ref))
            })
            .await?;
        if !verified {
            return Err(MarketError::Payment(format!(
                "transaction {} could not be verified",
                transaction_ref
            )));
        }

        let listing_id = workflow.listing_id.clone();
        self.store.mark_sold(&listing_id, buyer).await?;

        let shipment = ShipmentConfirmation {
            tracking_reference: tracking_reference(&listing_id, buyer, &transaction_ref),
            listing_id,
            buyer: buyer.to_string(),
            transaction_ref,
            shipped_at: Utc::now(),
        };
        workflow.shipment = Some(shipment.clone());
        workflow.retire();
        workflow.advance(&SellerSignals {
            payment_confirmed: true,
            ..Default::default()
        });
        info!(
            listing_id = %shipment.listing_id,
            buyer = %shipment.buyer,
            tracking = %shipment.tracking_reference,
            "shipped"
        );
        Ok(shipment)
    }

    /// Returns reserved listings to `active` once their hold runs out: unlocked
    /// holds after `ttl`, settlement locks after the settlement ttl. A locked
    /// listing whose buyer did pay is shipped instead of released.
    pub async fn release_expired_reservations(&self, ttl: Duration) -> Result<Vec<ListingId>> {
        let now = Utc::now();
        let cutoff = now - chrono_duration(ttl)?;
        let settlement_cutoff = now - chrono_duration(self.settlement_ttl)?;
        let mut released = Vec::new();

        for stale in self.store.stale_reservations(cutoff.max(settlement_cutoff)).await? {
            let handle = self.workflow(&stale.id);
            let mut workflow = handle.lock().await;

            // Re-check under the listing lock; a settlement may have moved it meanwhile.
            let current = self.store.get(&stale.id).await?;
            let (holder, locked) = match &current.reservation {
                Some(r) if current.status == ListingStatus::Reserved => {
                    let limit = if r.locked { settlement_cutoff } else { cutoff };
                    if r.reserved_at >= limit {
                        continue;
                    }
                    (r.holder.clone(), r.locked)
                }
                _ => continue,
            };

            if locked {
                match self.reconcile_locked(&mut workflow, &holder).await {
                    Ok(true) => continue,
                    Ok(false) => {}
                    Err(e) => {
                        error!(listing_id = %current.id, holder = %holder, "settlement lock left in place: {}", e);
                        continue;
                    }
                }
            }

            self.store.release(&current.id, &holder).await?;
            workflow.archive(&holder, SessionOutcome::Expired);
            info!(listing_id = %current.id, holder = %holder, locked, "reservation expired");
            released.push(current.id);
        }
        Ok(released)
    }

    /// Looks for a payment made under the settlement key of a lock that outlived
    /// its window. Ships when one exists and matches; `Ok(false)` when none does.
    async fn reconcile_locked(&self, workflow: &mut SellerWorkflow, holder: &str) -> Result<bool> {
        let key = SessionKey::new(&workflow.listing_id, holder).to_string();
        let transfer = self
            .retry
            .run("settlement.find_payment", || {
                with_timeout("settlement.find_payment", self.call_timeout, self.gateway.find_payment(&key))
            })
            .await?;
        let Some(transfer) = transfer else {
            debug!(key = %key, "no payment under settlement key");
            return Ok(false);
        };

        let agreed = workflow.sessions.get(holder).and_then(|s| s.agreed_price());
        if agreed != Some(transfer.instruction.amount) || transfer.instruction.recipient != self.identity {
            return Err(MarketError::Payment(format!(
                "transfer {} under {} does not match the agreement",
                transfer.transaction_ref, key
            )));
        }
        warn!(key = %key, transaction_ref = %transfer.transaction_ref, "paid without notice, shipping");
        self.ship(workflow, holder, transfer.transaction_ref).await?;
        Ok(true)
    }
}

fn closed_listing_reply(offer: &PurchaseOffer, listing: &Listing) -> Result<NegotiationReply> {
    match listing.reserved_by() {
        Some(holder) if listing.status == ListingStatus::Sold && holder != offer.buyer_identity => {
            Err(MarketError::concurrent_reservation(&listing.id))
        }
        _ => Ok(NegotiationReply::reject(offer, format!("listing is {}", listing.status))),
    }
}

fn chrono_duration(ttl: Duration) -> Result<chrono::Duration> {
    chrono::Duration::from_std(ttl).map_err(|e| MarketError::Config(format!("ttl out of range: {}", e)))
}

fn tracking_reference(listing_id: &str, buyer: &str, transaction_ref: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(listing_id.as_bytes());
    hasher.update(b":");
    hasher.update(buyer.as_bytes());
    hasher.update(b":");
    hasher.update(transaction_ref.as_bytes());
    hex::encode(hasher.finalize())
}

#[async_trait]
impl MessageHandler for SellerAgent {
    async fn handle(&self, envelope: Envelope) -> Result<Envelope> {
        let reply = match envelope.open()? {
            Message::ListingQuery(query) => Message::ListingCatalog(self.handle_listing_query(&query).await?),
            Message::PurchaseOffer(offer) => Message::NegotiationReply(self.handle_offer(offer).await?),
            Message::SettlementLock(lock) => Message::LockGrant(self.handle_settlement_lock(lock).await?),
            Message::PaymentNotice(notice) => {
                Message::FulfillmentUpdate(self.handle_payment_notice(notice).await?)
            }
            other => {
                return Err(MarketError::Negotiation(format!(
                    "seller does not accept {} messages",
                    other.kind()
                )));
            }
        };
        reply.into_envelope(Role::Agent)
    }
}
