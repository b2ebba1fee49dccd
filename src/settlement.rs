use crate::{
    error::{MarketError, Result},
    model::validate_currency,
    TransactionRef,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PaymentInstruction {
    pub payer: String,
    pub recipient: String,
    pub amount: Decimal,
    pub currency: String,
    pub memo: String,
    /// Repeating an instruction with the same key never moves funds twice.
    pub idempotency_key: String,
}

impl PaymentInstruction {
    pub fn validate(&self) -> Result<()> {
        if self.amount <= Decimal::ZERO {
            return Err(MarketError::Payment("amount must be greater than 0".to_string()));
        }
        validate_currency(&self.currency)?;
        if self.payer.is_empty() || self.recipient.is_empty() {
            return Err(MarketError::Payment("payer and recipient are required".to_string()));
        }
        if self.payer == self.recipient {
            return Err(MarketError::Payment("payer and recipient must differ".to_string()));
        }
        if self.idempotency_key.is_empty() {
            return Err(MarketError::Payment("idempotency_key is required".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Transfer {
    pub transaction_ref: TransactionRef,
    pub instruction: PaymentInstruction,
    pub executed_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PaymentResponse {
    pub transaction_ref: TransactionRef,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct VerifyResponse {
    pub transaction_ref: TransactionRef,
    pub verified: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PaymentLookup {
    pub idempotency_key: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FundRequest {
    pub currency: String,
    pub amount: Decimal,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BalanceResponse {
    pub account: String,
    pub currency: String,
    pub balance: Decimal,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SettlementGateway: Send + Sync {
    async fn pay(&self, instruction: &PaymentInstruction) -> Result<TransactionRef>;

    async fn verify(&self, transaction_ref: &str) -> Result<bool>;

    /// The transfer executed under `idempotency_key`, if any.
    async fn find_payment(&self, idempotency_key: &str) -> Result<Option<Transfer>>;
}

#[derive(Default)]
struct LedgerState {
    balances: HashMap<(String, String), Decimal>,
    transfers: HashMap<TransactionRef, Transfer>,
    by_key: HashMap<String, TransactionRef>,
}

#[derive(Default)]
pub struct LedgerGateway {
    state: Mutex<LedgerState>,
    opening_balance: Decimal,
}

impl LedgerGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_opening_balance(opening_balance: Decimal) -> Self {
        Self {
            state: Mutex::new(LedgerState::default()),
            opening_balance,
        }
    }

    pub fn fund(&self, account: &str, currency: &str, amount: Decimal) -> Result<Decimal> {
        validate_currency(currency)?;
        if amount <= Decimal::ZERO {
            return Err(MarketError::Validation("amount must be greater than 0".to_string()));
        }
        let mut state = self.state.lock();
        let balance = state
            .balances
            .entry((account.to_string(), currency.to_string()))
            .or_insert(self.opening_balance);
        *balance += amount;
        Ok(*balance)
    }

    pub fn balance(&self, account: &str, currency: &str) -> Decimal {
        self.state
            .lock()
            .balances
            .get(&(account.to_string(), currency.to_string()))
            .copied()
            .unwrap_or(self.opening_balance)
    }

    pub fn transfer(&self, transaction_ref: &str) -> Option<Transfer> {
        self.state.lock().transfers.get(transaction_ref).cloned()
    }

    pub fn transfer_count(&self) -> usize {
        self.state.lock().transfers.len()
    }
}

#[async_trait]
impl SettlementGateway for LedgerGateway {
    async fn pay(&self, instruction: &PaymentInstruction) -> Result<TransactionRef> {
        instruction.validate()?;
        let mut state = self.state.lock();

        if let Some(existing) = state.by_key.get(&instruction.idempotency_key) {
            let transfer = &state.transfers[existing];
            if transfer.instruction.amount != instruction.amount
                || transfer.instruction.recipient != instruction.recipient
            {
                return Err(MarketError::Payment(format!(
                    "idempotency key {} reused with different terms",
                    instruction.idempotency_key
                )));
            }
            return Ok(existing.clone());
        }

        let payer_key = (instruction.payer.clone(), instruction.currency.clone());
        let available = state
            .balances
            .get(&payer_key)
            .copied()
            .unwrap_or(self.opening_balance);
        if available < instruction.amount {
            warn!(
                payer = %instruction.payer,
                requested = %instruction.amount,
                available = %available,
                "insufficient funds"
            );
            return Err(MarketError::Payment(format!(
                "insufficient funds: requested {} {}, available {}",
                instruction.amount, instruction.currency, available
            )));
        }

        state.balances.insert(payer_key, available - instruction.amount);
        *state
            .balances
            .entry((instruction.recipient.clone(), instruction.currency.clone()))
            .or_insert(self.opening_balance) += instruction.amount;

        let transaction_ref = format!("txn-{}", Uuid::new_v4().simple());
        state.transfers.insert(
            transaction_ref.clone(),
            Transfer {
                transaction_ref: transaction_ref.clone(),
                instruction: instruction.clone(),
                executed_at: Utc::now(),
            },
        );
        state
            .by_key
            .insert(instruction.idempotency_key.clone(), transaction_ref.clone());

        info!(
            transaction_ref = %transaction_ref,
            "Settlement executed: {} {} from {} to {}",
            instruction.amount, instruction.currency, instruction.payer, instruction.recipient
        );
        Ok(transaction_ref)
    }

    async fn verify(&self, transaction_ref: &str) -> Result<bool> {
        Ok(self.state.lock().transfers.contains_key(transaction_ref))
    }

    async fn find_payment(&self, idempotency_key: &str) -> Result<Option<Transfer>> {
        let state = self.state.lock();
        Ok(state
            .by_key
            .get(idempotency_key)
            .and_then(|reference| state.transfers.get(reference))
            .cloned())
    }
}

pub struct HttpSettlementGateway {
    endpoint: String,
    client: Client,
}

impl HttpSettlementGateway {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    pub async fn fund(&self, account: &str, currency: &str, amount: Decimal) -> Result<Decimal> {
        let response = self
            .client
            .post(format!("{}/accounts/{}/fund", self.endpoint, account))
            .json(&FundRequest {
                currency: currency.to_string(),
                amount,
            })
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(status_error(status, response.text().await.unwrap_or_default()));
        }
        let body: BalanceResponse = response.json().await?;
        Ok(body.balance)
    }
}

fn status_error(status: StatusCode, body: String) -> MarketError {
    if status.is_server_error() {
        MarketError::Unavailable(format!("settlement service returned {}: {}", status, body))
    } else {
        MarketError::Payment(format!("settlement service returned {}: {}", status, body))
    }
}

#[async_trait]
impl SettlementGateway for HttpSettlementGateway {
    async fn pay(&self, instruction: &PaymentInstruction) -> Result<TransactionRef> {
        let response = self
            .client
            .post(format!("{}/payments", self.endpoint))
            .json(instruction)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(status_error(status, response.text().await.unwrap_or_default()));
        }
        let body: PaymentResponse = response.json().await?;
        Ok(body.transaction_ref)
    }

    async fn verify(&self, transaction_ref: &str) -> Result<bool> {
        let response = self
            .client
            .get(format!("{}/payments/{}/verify", self.endpoint, transaction_ref))
            .send()
            .await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => {
                let body: VerifyResponse = response.json().await?;
                Ok(body.verified)
            }
            status => Err(status_error(status, response.text().await.unwrap_or_default())),
        }
    }

    async fn find_payment(&self, idempotency_key: &str) -> Result<Option<Transfer>> {
        let response = self
            .client
            .get(format!("{}/payments", self.endpoint))
            .query(&PaymentLookup {
                idempotency_key: idempotency_key.to_string(),
            })
            .send()
            .await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(response.json().await?)),
            status => Err(status_error(status, response.text().await.unwrap_or_default())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn instruction(key: &str, amount: Decimal) -> PaymentInstruction {
        PaymentInstruction {
            payer: "buyer-1".to_string(),
            recipient: "seller-1".to_string(),
            amount,
            currency: "USD".to_string(),
            memo: "laptop-001".to_string(),
            idempotency_key: key.to_string(),
        }
    }

    #[tokio::test]
    async fn test_pay_moves_funds_once_per_key() {
        let ledger = LedgerGateway::new();
        ledger.fund("buyer-1", "USD", dec!(2000)).unwrap();

        let first = ledger.pay(&instruction("k1", dec!(1350))).await.unwrap();
        let again = ledger.pay(&instruction("k1", dec!(1350))).await.unwrap();
        assert_eq!(first, again);
        assert_eq!(ledger.transfer_count(), 1);
        assert_eq!(ledger.balance("buyer-1", "USD"), dec!(650));
        assert_eq!(ledger.balance("seller-1", "USD"), dec!(1350));
        assert!(ledger.verify(&first).await.unwrap());
        assert!(!ledger.verify("txn-unknown").await.unwrap());
    }

    #[tokio::test]
    async fn test_find_payment_by_key() {
        let ledger = LedgerGateway::with_opening_balance(dec!(5000));
        assert!(ledger.find_payment("k1").await.unwrap().is_none());

        let reference = ledger.pay(&instruction("k1", dec!(1350))).await.unwrap();
        let transfer = ledger.find_payment("k1").await.unwrap().unwrap();
        assert_eq!(transfer.transaction_ref, reference);
        assert_eq!(transfer.instruction.amount, dec!(1350));
        assert!(ledger.find_payment("k2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_insufficient_funds() {
        let ledger = LedgerGateway::new();
        ledger.fund("buyer-1", "USD", dec!(100)).unwrap();
        let result = ledger.pay(&instruction("k1", dec!(1350))).await;
        assert!(matches!(result, Err(MarketError::Payment(_))));
        assert_eq!(ledger.balance("buyer-1", "USD"), dec!(100));
        assert_eq!(ledger.transfer_count(), 0);
    }

    #[tokio::test]
    async fn test_reused_key_with_different_amount_fails() {
        let ledger = LedgerGateway::with_opening_balance(dec!(5000));
        ledger.pay(&instruction("k1", dec!(100))).await.unwrap();
        assert!(ledger.pay(&instruction("k1", dec!(200))).await.is_err());
    }

    #[tokio::test]
    async fn test_instruction_validation() {
        let ledger = LedgerGateway::with_opening_balance(dec!(5000));
        let mut bad = instruction("k1", dec!(100));
        bad.recipient = "buyer-1".to_string();
        assert!(ledger.pay(&bad).await.is_err());
        assert!(ledger.pay(&instruction("", dec!(100))).await.is_err());
    }
}
