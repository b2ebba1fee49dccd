use crate::model::{
    CounterpartRef, IdempotencyKey, PaymentRecord, PaymentStatus, SessionKey, ShipmentConfirmation,
};
use crate::protocol::{FulfillmentUpdate, LockGrant, Message, PaymentNotice, Role, SettlementLock};
use crate::retry::{with_timeout, RetryPolicy};
use crate::settlement::{PaymentInstruction, SettlementGateway};
use crate::transport::{send_message, MessageTransport};
use crate::{AgentIdentity, ListingId, MarketError, Result, TransactionRef};
use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum LedgerEntry {
    Fresh(PaymentRecord),
    Settled(PaymentRecord),
}

#[derive(Default)]
pub struct PaymentLedger {
    records: Mutex<HashMap<IdempotencyKey, PaymentRecord>>,
    retention: Option<Duration>,
}

impl PaymentLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Settled and failed records older than `retention` are dropped; pending ones are kept.
    pub fn with_retention(retention: Duration) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            retention: Some(retention),
        }
    }

    fn prune_locked(&self, records: &mut HashMap<IdempotencyKey, PaymentRecord>) -> usize {
        let Some(retention) = self.retention else {
            return 0;
        };
        let Ok(retention) = chrono::Duration::from_std(retention) else {
            return 0;
        };
        let cutoff = Utc::now() - retention;
        let before = records.len();
        records.retain(|_, r| r.status == PaymentStatus::Pending || r.updated_at >= cutoff);
        before - records.len()
    }

    pub fn prune(&self) -> usize {
        let mut records = self.records.lock();
        self.prune_locked(&mut records)
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn begin(
        &self,
        key: &IdempotencyKey,
        amount: Decimal,
        currency: &str,
        retry_failed: bool,
    ) -> Result<LedgerEntry> {
        let mut records = self.records.lock();
        let pruned = self.prune_locked(&mut records);
        if pruned > 0 {
            debug!(pruned, "dropped expired payment records");
        }

        let sold_to_other = records.values().any(|r| {
            r.key.listing_id == key.listing_id && r.key.buyer != key.buyer && r.status == PaymentStatus::Confirmed
        });
        if sold_to_other {
            return Err(MarketError::concurrent_reservation(&key.listing_id));
        }

        match records.get_mut(key) {
            Some(record) => match record.status {
                PaymentStatus::Confirmed => Ok(LedgerEntry::Settled(record.clone())),
                PaymentStatus::Pending => Err(MarketError::concurrent_reservation(&key.listing_id)),
                PaymentStatus::Failed if retry_failed => {
                    record.status = PaymentStatus::Pending;
                    record.amount = amount;
                    record.failure_reason = None;
                    record.attempts += 1;
                    record.updated_at = Utc::now();
                    Ok(LedgerEntry::Fresh(record.clone()))
                }
                PaymentStatus::Failed => Err(MarketError::Payment(format!(
                    "previous payment for {} failed: {}",
                    key,
                    record.failure_reason.as_deref().unwrap_or("unknown reason")
                ))),
            },
            None => {
                let record = PaymentRecord::pending(key.clone(), amount, currency.to_string());
                records.insert(key.clone(), record.clone());
                Ok(LedgerEntry::Fresh(record))
            }
        }
    }

    pub fn confirm(&self, key: &IdempotencyKey, transaction_ref: &str) -> Result<PaymentRecord> {
        let mut records = self.records.lock();
        let clash = records.values().any(|r| {
            r.key.listing_id == key.listing_id && r.key != *key && r.status == PaymentStatus::Confirmed
        });
        if clash {
            error!(key = %key, "second confirmed payment for one listing");
            return Err(MarketError::concurrent_reservation(&key.listing_id));
        }
        let record = records
            .get_mut(key)
            .ok_or_else(|| MarketError::Payment(format!("no payment record for {}", key)))?;
        record.status = PaymentStatus::Confirmed;
        record.transaction_ref = Some(transaction_ref.to_string());
        record.updated_at = Utc::now();
        Ok(record.clone())
    }

    pub fn fail(&self, key: &IdempotencyKey, reason: &str) -> Option<PaymentRecord> {
        let mut records = self.records.lock();
        let record = records.get_mut(key)?;
        if record.status == PaymentStatus::Confirmed {
            return Some(record.clone());
        }
        record.status = PaymentStatus::Failed;
        record.failure_reason = Some(reason.to_string());
        record.updated_at = Utc::now();
        Some(record.clone())
    }

    /// Drops a pending record that never reached the gateway.
    pub fn discard(&self, key: &IdempotencyKey) {
        let mut records = self.records.lock();
        if records.get(key).map_or(false, |r| r.status == PaymentStatus::Pending) {
            records.remove(key);
        }
    }

    pub fn get(&self, key: &IdempotencyKey) -> Option<PaymentRecord> {
        self.records.lock().get(key).cloned()
    }

    pub fn confirmed_for(&self, listing_id: &str) -> Vec<PaymentRecord> {
        self.records
            .lock()
            .values()
            .filter(|r| r.key.listing_id == listing_id && r.status == PaymentStatus::Confirmed)
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct SettlementRequest {
    pub listing_id: ListingId,
    pub buyer: AgentIdentity,
    pub amount: Decimal,
    pub currency: String,
    pub seller: CounterpartRef,
    pub retry_failed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SettlementReceipt {
    pub record: PaymentRecord,
    pub shipment: ShipmentConfirmation,
}

pub struct SettlementOrchestrator {
    transport: Arc<dyn MessageTransport>,
    gateway: Arc<dyn SettlementGateway>,
    ledger: Arc<PaymentLedger>,
    call_timeout: Duration,
    retry: RetryPolicy,
}

impl SettlementOrchestrator {
    pub fn new(
        transport: Arc<dyn MessageTransport>,
        gateway: Arc<dyn SettlementGateway>,
        ledger: Arc<PaymentLedger>,
    ) -> Self {
        Self {
            transport,
            gateway,
            ledger,
            call_timeout: Duration::from_secs(15),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_call_policy(mut self, call_timeout: Duration, retry: RetryPolicy) -> Self {
        self.call_timeout = call_timeout;
        self.retry = retry;
        self
    }

    pub fn ledger(&self) -> &Arc<PaymentLedger> {
        &self.ledger
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

    async fn lock(&self, request: &SettlementRequest) -> Result<LockGrant> {
        let reply = self
            .send(
                &request.seller.endpoint,
                Message::SettlementLock(SettlementLock {
                    listing_id: request.listing_id.clone(),
                    buyer_identity: request.buyer.clone(),
                    amount: request.amount,
                    currency: request.currency.clone(),
                }),
            )
            .await?;
        match reply {
            Message::LockGrant(grant) if grant.holder == request.buyer => Ok(grant),
            Message::LockGrant(grant) => Err(MarketError::concurrent_reservation(grant.listing_id)),
            other => Err(MarketError::Negotiation(format!(
                "expected lock_grant, got {}",
                other.kind()
            ))),
        }
    }

    async fn transfer(&self, instruction: &PaymentInstruction) -> Result<TransactionRef> {
        let transaction_ref = self
            .retry
            .run("settlement.pay", || {
                with_timeout("settlement.pay", self.call_timeout, self.gateway.pay(instruction))
            })
            .await?;
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
        Ok(transaction_ref)
    }

    async fn notify(&self, request: &SettlementRequest, record: &PaymentRecord) -> Result<FulfillmentUpdate> {
        let reply = self
            .send(
                &request.seller.endpoint,
                Message::PaymentNotice(PaymentNotice {
                    listing_id: request.listing_id.clone(),
                    buyer_identity: request.buyer.clone(),
                    status: record.status,
                    transaction_ref: record.transaction_ref.clone(),
                    amount: record.amount,
                    currency: record.currency.clone(),
                    reason: record.failure_reason.clone(),
                }),
            )
            .await?;
        match reply {
            Message::FulfillmentUpdate(update) => Ok(update),
            other => Err(MarketError::Negotiation(format!(
                "expected fulfillment_update, got {}",
                other.kind()
            ))),
        }
    }

    async fn ship(&self, request: &SettlementRequest, record: PaymentRecord) -> Result<SettlementReceipt> {
        let transaction_ref = record.transaction_ref.clone().unwrap_or_default();
        let shipment_error = |reason: String| MarketError::Shipment {
            transaction_ref: transaction_ref.clone(),
            reason,
        };
        match self.notify(request, &record).await {
            Ok(FulfillmentUpdate::Shipped(shipment)) => {
                info!(
                    listing_id = %request.listing_id,
                    transaction_ref = %transaction_ref,
                    tracking = %shipment.tracking_reference,
                    "settlement complete"
                );
                Ok(SettlementReceipt { record, shipment })
            }
            Ok(FulfillmentUpdate::Released { .. }) => {
                Err(shipment_error("seller released the listing after payment".to_string()))
            }
            Err(e) => {
                error!(listing_id = %request.listing_id, transaction_ref = %transaction_ref, "shipment failed: {}", e);
                Err(shipment_error(e.to_string()))
            }
        }
    }

    pub async fn execute_settlement(&self, request: SettlementRequest) -> Result<SettlementReceipt> {
        let key = SessionKey::new(&request.listing_id, &request.buyer);
        match self
            .ledger
            .begin(&key, request.amount, &request.currency, request.retry_failed)?
        {
            LedgerEntry::Settled(record) => {
                info!(key = %key, "payment already confirmed, requesting shipment");
                return self.ship(&request, record).await;
            }
            LedgerEntry::Fresh(record) => {
                info!(key = %key, amount = %request.amount, attempt = record.attempts, "settlement started");
            }
        }

        let grant = match self.lock(&request).await {
            Ok(grant) => grant,
            Err(e) => {
                warn!(key = %key, "seller refused settlement lock: {}", e);
                self.ledger.discard(&key);
                return Err(e);
            }
        };

        let instruction = PaymentInstruction {
            payer: request.buyer.clone(),
            recipient: grant.recipient.clone(),
            amount: request.amount,
            currency: request.currency.clone(),
            memo: format!("purchase of {}", request.listing_id),
            idempotency_key: key.to_string(),
        };

        match self.transfer(&instruction).await {
            Ok(transaction_ref) => self.settle(&request, &key, &transaction_ref).await,
            Err(e) if e.is_transient() => match self.find_transfer(&instruction).await {
                Ok(Some(transaction_ref)) => {
                    info!(key = %key, transaction_ref = %transaction_ref, "payment found after {}", e);
                    self.settle(&request, &key, &transaction_ref).await
                }
                Ok(None) => self.abort(&request, &key, e).await,
                Err(lookup_err) => {
                    // Outcome unknown: the seller keeps the lock until its settlement window closes.
                    let reason = format!("{}; payment lookup failed: {}", e, lookup_err);
                    error!(key = %key, "payment outcome unknown: {}", reason);
                    self.ledger.fail(&key, &reason);
                    Err(payment_error(e))
                }
            },
            Err(e) => self.abort(&request, &key, e).await,
        }
    }

    async fn settle(
        &self,
        request: &SettlementRequest,
        key: &IdempotencyKey,
        transaction_ref: &str,
    ) -> Result<SettlementReceipt> {
        let record = self.ledger.confirm(key, transaction_ref)?;
        info!(key = %key, transaction_ref = %transaction_ref, "payment confirmed");
        self.ship(request, record).await
    }

    async fn find_transfer(&self, instruction: &PaymentInstruction) -> Result<Option<TransactionRef>> {
        let found = self
            .retry
            .run("settlement.find_payment", || {
                with_timeout(
                    "settlement.find_payment",
                    self.call_timeout,
                    self.gateway.find_payment(&instruction.idempotency_key),
                )
            })
            .await?;
        Ok(found
            .filter(|t| {
                t.instruction.amount == instruction.amount && t.instruction.recipient == instruction.recipient
            })
            .map(|t| t.transaction_ref))
    }

    async fn abort(
        &self,
        request: &SettlementRequest,
        key: &IdempotencyKey,
        e: MarketError,
    ) -> Result<SettlementReceipt> {
        let reason = e.to_string();
        warn!(key = %key, "payment failed: {}", reason);
        let Some(record) = self.ledger.fail(key, &reason) else {
            return Err(payment_error(e));
        };
        match self.notify(request, &record).await {
            Ok(FulfillmentUpdate::Released { .. }) => Err(payment_error(e)),
            Ok(other) => {
                warn!(key = %key, "unexpected reply to failed payment: {:?}", other);
                Err(payment_error(e))
            }
            Err(notify_err) => {
                error!(
                    key = %key,
                    listing_id = %request.listing_id,
                    "seller was not told about failed payment: {}",
                    notify_err
                );
                Err(MarketError::Payment(format!(
                    "{}; seller did not confirm release of {}: {}",
                    reason, request.listing_id, notify_err
                )))
            }
        }
    }
}

fn payment_error(e: MarketError) -> MarketError {
    match e {
        MarketError::Timeout { .. } | MarketError::Payment(_) => e,
        other => MarketError::Payment(other.to_string()),
    }
}
