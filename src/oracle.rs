use crate::config::NegotiationConfig;
use crate::model::{CounterpartRef, Listing};
use crate::protocol::ReplyAction;
use crate::retry::{with_timeout, RetryPolicy};
use crate::{MarketError, Result};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Candidate {
    pub listing: Listing,
    pub seller: CounterpartRef,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectionPrompt {
    pub description: String,
    pub category: Option<String>,
    pub budget: Decimal,
    pub currency: String,
    pub candidates: Vec<Candidate>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationPrompt {
    pub listing: Listing,
    pub buyer: String,
    pub offer_price: Decimal,
    pub currency: String,
    pub round: u32,
    pub max_rounds: u32,
    /// Price at or above which the offer is accepted regardless of the oracle.
    pub acceptance_price: Decimal,
}

#[async_trait]
pub trait DecisionOracle: Send + Sync {
    fn name(&self) -> &str;

    async fn select_best(&self, prompt: &SelectionPrompt) -> Result<String>;

    async fn evaluate_offer(&self, prompt: &EvaluationPrompt) -> Result<String>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvaluationPolicy {
    pub acceptance_threshold: Decimal,
    pub counter_floor: Decimal,
    pub min_acceptable_ratio: Decimal,
}

impl Default for EvaluationPolicy {
    fn default() -> Self {
        Self::from(&NegotiationConfig::default())
    }
}

impl From<&NegotiationConfig> for EvaluationPolicy {
    fn from(config: &NegotiationConfig) -> Self {
        Self {
            acceptance_threshold: config.acceptance_threshold,
            counter_floor: config.counter_floor,
            min_acceptable_ratio: config.min_acceptable_ratio,
        }
    }
}

impl EvaluationPolicy {
    pub fn acceptance_price(&self, ask: Decimal) -> Decimal {
        (ask * self.acceptance_threshold).round_dp(2)
    }

    fn floor_price(&self, ask: Decimal) -> Decimal {
        ask * self.counter_floor
    }

    fn min_acceptable_price(&self, ask: Decimal) -> Decimal {
        ask * self.min_acceptable_ratio
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Verdict {
    pub action: ReplyAction,
    pub counter_price: Option<Decimal>,
    pub rationale: String,
}

impl Verdict {
    pub fn accept(rationale: impl Into<String>) -> Self {
        Self {
            action: ReplyAction::Accept,
            counter_price: None,
            rationale: rationale.into(),
        }
    }

    pub fn counter(price: Decimal, rationale: impl Into<String>) -> Self {
        Self {
            action: ReplyAction::Counter,
            counter_price: Some(price),
            rationale: rationale.into(),
        }
    }

    pub fn reject(rationale: impl Into<String>) -> Self {
        Self {
            action: ReplyAction::Reject,
            counter_price: None,
            rationale: rationale.into(),
        }
    }

    pub fn acceptable(&self) -> bool {
        self.action == ReplyAction::Accept
    }
}

pub fn rule_select(prompt: &SelectionPrompt) -> Option<&Candidate> {
    prompt.candidates.iter().min_by(|a, b| {
        a.listing
            .price
            .cmp(&b.listing.price)
            .then_with(|| a.listing.id.cmp(&b.listing.id))
    })
}

pub fn rule_evaluate(prompt: &EvaluationPrompt, policy: &EvaluationPolicy) -> Verdict {
    let ask = prompt.listing.price;
    let acceptance_price = policy.acceptance_price(ask);
    if prompt.offer_price >= acceptance_price {
        Verdict::accept(format!(
            "offer {} meets the acceptance price {}",
            prompt.offer_price, acceptance_price
        ))
    } else if prompt.offer_price >= policy.floor_price(ask) {
        Verdict::counter(
            acceptance_price,
            format!("offer {} is close; can do {}", prompt.offer_price, acceptance_price),
        )
    } else {
        Verdict::reject(format!(
            "offer {} is too far below the asking price {}",
            prompt.offer_price, ask
        ))
    }
}

#[derive(Debug, Clone, Default)]
pub struct RuleOracle {
    policy: EvaluationPolicy,
}

impl RuleOracle {
    pub fn new(policy: EvaluationPolicy) -> Self {
        Self { policy }
    }
}

#[async_trait]
impl DecisionOracle for RuleOracle {
    fn name(&self) -> &str {
        "rule"
    }

    async fn select_best(&self, prompt: &SelectionPrompt) -> Result<String> {
        let raw = match rule_select(prompt) {
            Some(candidate) => serde_json::json!({
                "listing_id": candidate.listing.id,
                "reason": "lowest price",
            }),
            None => serde_json::json!({ "listing_id": null, "reason": "no candidates" }),
        };
        Ok(raw.to_string())
    }

    async fn evaluate_offer(&self, prompt: &EvaluationPrompt) -> Result<String> {
        let verdict = rule_evaluate(prompt, &self.policy);
        Ok(serde_json::json!({
            "action": verdict.action,
            "accepted": verdict.acceptable(),
            "counter_price": verdict.counter_price,
            "rationale": verdict.rationale,
        })
        .to_string())
    }
}

#[derive(Debug, Deserialize)]
struct SelectionAnswer {
    listing_id: Option<String>,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EvaluationAnswer {
    action: ReplyAction,
    accepted: bool,
    #[serde(default)]
    counter_price: Option<Decimal>,
    #[serde(default)]
    rationale: String,
}

pub fn extract_json_block(response: &str) -> &str {
    let response = response.trim();
    if let Some(start) = response.find("```") {
        let fenced = &response[start + 3..];
        let fenced = fenced.strip_prefix("json").unwrap_or(fenced);
        let body = fenced.find("```").map(|end| &fenced[..end]).unwrap_or(fenced);
        if let (Some(open), Some(close)) = (body.find('{'), body.rfind('}')) {
            if open < close {
                return &body[open..=close];
            }
        }
    }
    match (response.find('{'), response.rfind('}')) {
        (Some(open), Some(close)) if open < close => &response[open..=close],
        _ => response,
    }
}

fn parse_selection<'a>(raw: &str, prompt: &'a SelectionPrompt) -> Result<Option<&'a Candidate>> {
    let answer: SelectionAnswer = serde_json::from_str(extract_json_block(raw))
        .map_err(|e| MarketError::Oracle(format!("unparseable selection: {}", e)))?;
    match answer.listing_id {
        None => Ok(None),
        Some(id) => {
            let candidate = prompt
                .candidates
                .iter()
                .find(|c| c.listing.id == id)
                .ok_or_else(|| MarketError::Oracle(format!("selected unknown listing {}", id)))?;
            debug!(listing_id = %id, reason = ?answer.reason, "oracle selection");
            Ok(Some(candidate))
        }
    }
}

fn parse_evaluation(raw: &str, prompt: &EvaluationPrompt) -> Result<Verdict> {
    let answer: EvaluationAnswer = serde_json::from_str(extract_json_block(raw))
        .map_err(|e| MarketError::Oracle(format!("unparseable evaluation: {}", e)))?;

    if answer.accepted != (answer.action == ReplyAction::Accept) {
        return Err(MarketError::Oracle(
            "accepted flag contradicts action".to_string(),
        ));
    }

    match answer.action {
        ReplyAction::Accept => Ok(Verdict::accept(answer.rationale)),
        ReplyAction::Reject => Ok(Verdict::reject(answer.rationale)),
        ReplyAction::Counter => {
            let price = answer
                .counter_price
                .ok_or_else(|| MarketError::Oracle("counter without counter_price".to_string()))?;
            if price <= prompt.offer_price {
                return Err(MarketError::Oracle(format!(
                    "counter {} does not improve on offer {}",
                    price, prompt.offer_price
                )));
            }
            let clamped = price.min(prompt.listing.price).round_dp(2);
            Ok(Verdict::counter(clamped, answer.rationale))
        }
    }
}

/// Wraps an oracle with timeouts, retry, output validation and policy.
pub struct DecisionAdvisor {
    oracle: Arc<dyn DecisionOracle>,
    policy: EvaluationPolicy,
    timeout: Duration,
    retry: RetryPolicy,
}

impl DecisionAdvisor {
    pub fn new(
        oracle: Arc<dyn DecisionOracle>,
        policy: EvaluationPolicy,
        timeout: Duration,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            oracle,
            policy,
            timeout,
            retry,
        }
    }

    pub fn deterministic() -> Self {
        let policy = EvaluationPolicy::default();
        Self::new(
            Arc::new(RuleOracle::new(policy)),
            policy,
            Duration::from_secs(5),
            RetryPolicy::none(),
        )
    }

    pub fn policy(&self) -> &EvaluationPolicy {
        &self.policy
    }

    pub async fn select(&self, prompt: &SelectionPrompt) -> Option<Candidate> {
        if prompt.candidates.is_empty() {
            return None;
        }
        let raw = self
            .retry
            .run("oracle.select_best", || {
                with_timeout("oracle.select_best", self.timeout, self.oracle.select_best(prompt))
            })
            .await;

        let chosen = raw.and_then(|raw| parse_selection(&raw, prompt));
        match chosen {
            Ok(Some(candidate)) => Some(candidate.clone()),
            Ok(None) => {
                warn!(oracle = self.oracle.name(), "oracle declined to select; using cheapest candidate");
                rule_select(prompt).cloned()
            }
            Err(e) => {
                warn!(oracle = self.oracle.name(), "selection fallback: {}", e);
                rule_select(prompt).cloned()
            }
        }
    }

    pub async fn evaluate(&self, prompt: &EvaluationPrompt) -> Verdict {
        let ask = prompt.listing.price;
        let acceptance_price = self.policy.acceptance_price(ask);
        if prompt.offer_price >= acceptance_price {
            return Verdict::accept(format!(
                "offer {} meets the acceptance price {}",
                prompt.offer_price, acceptance_price
            ));
        }

        let raw = self
            .retry
            .run("oracle.evaluate_offer", || {
                with_timeout("oracle.evaluate_offer", self.timeout, self.oracle.evaluate_offer(prompt))
            })
            .await;

        let verdict = match raw.and_then(|raw| parse_evaluation(&raw, prompt)) {
            Ok(verdict) => verdict,
            Err(e) => {
                warn!(oracle = self.oracle.name(), "evaluation fallback: {}", e);
                return rule_evaluate(prompt, &self.policy);
            }
        };

        if verdict.acceptable() && prompt.offer_price < self.policy.min_acceptable_price(ask) {
            debug!(
                offer = %prompt.offer_price,
                "oracle accepted below the minimum ratio; countering instead"
            );
            return Verdict::counter(
                acceptance_price,
                format!("cannot go below {}", acceptance_price),
            );
        }
        verdict
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NewListing;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn listing(id: &str, price: Decimal) -> Listing {
        let mut listing = Listing::from_draft(
            id.to_string(),
            NewListing {
                title: "Gaming Laptop".to_string(),
                description: String::new(),
                price,
                currency: "USD".to_string(),
                condition: "used".to_string(),
                category: "electronics".to_string(),
                seller: "seller-1".to_string(),
            },
        );
        listing.publish().unwrap();
        listing
    }

    fn candidate(id: &str, price: Decimal) -> Candidate {
        Candidate {
            listing: listing(id, price),
            seller: CounterpartRef {
                agent_identity: "seller-1".to_string(),
                endpoint: "local://seller-1".to_string(),
                advertised_capabilities: vec!["marketplace_seller".to_string()],
            },
        }
    }

    fn evaluation(offer: Decimal) -> EvaluationPrompt {
        EvaluationPrompt {
            listing: listing("laptop-001", dec!(1500)),
            buyer: "buyer-1".to_string(),
            offer_price: offer,
            currency: "USD".to_string(),
            round: 1,
            max_rounds: 3,
            acceptance_price: dec!(1350),
        }
    }

    struct Scripted {
        answer: Result<String>,
        calls: AtomicU32,
    }

    impl Scripted {
        fn new(answer: Result<String>) -> Arc<Self> {
            Arc::new(Self {
                answer,
                calls: AtomicU32::new(0),
            })
        }

        fn reply(&self) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.answer {
                Ok(s) => Ok(s.clone()),
                Err(e) => Err(MarketError::Oracle(e.to_string())),
            }
        }
    }

    #[async_trait]
    impl DecisionOracle for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn select_best(&self, _prompt: &SelectionPrompt) -> Result<String> {
            self.reply()
        }

        async fn evaluate_offer(&self, _prompt: &EvaluationPrompt) -> Result<String> {
            self.reply()
        }
    }

    fn advisor(oracle: Arc<dyn DecisionOracle>) -> DecisionAdvisor {
        DecisionAdvisor::new(
            oracle,
            EvaluationPolicy::default(),
            Duration::from_secs(1),
            RetryPolicy::none(),
        )
    }

    #[test]
    fn test_rule_evaluation_bands() {
        let policy = EvaluationPolicy::default();
        assert!(rule_evaluate(&evaluation(dec!(1350)), &policy).acceptable());
        let counter = rule_evaluate(&evaluation(dec!(1200)), &policy);
        assert_eq!(counter.action, ReplyAction::Counter);
        assert_eq!(counter.counter_price, Some(dec!(1350.00)));
        assert_eq!(
            rule_evaluate(&evaluation(dec!(1000)), &policy).action,
            ReplyAction::Reject
        );
    }

    #[test]
    fn test_rule_select_cheapest_then_id() {
        let prompt = SelectionPrompt {
            description: "laptop".to_string(),
            category: None,
            budget: dec!(100),
            currency: "USD".to_string(),
            candidates: vec![
                candidate("b", dec!(900)),
                candidate("a", dec!(900)),
                candidate("c", dec!(1200)),
            ],
        };
        assert_eq!(rule_select(&prompt).unwrap().listing.id, "a");
    }

    #[test]
    fn test_extract_json_block() {
        assert_eq!(extract_json_block("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(extract_json_block("Sure! {\"a\":1} hope that helps"), "{\"a\":1}");
        assert_eq!(extract_json_block("```\n{\"a\":{\"b\":2}}\n```"), "{\"a\":{\"b\":2}}");
        assert_eq!(extract_json_block("no json"), "no json");
    }

    #[tokio::test]
    async fn test_fenced_counter_is_clamped_to_ask() {
        let oracle = Scripted::new(Ok(
            "```json\n{\"action\":\"counter\",\"accepted\":false,\"counter_price\":\"1800\",\"rationale\":\"x\"}\n```"
                .to_string(),
        ));
        let verdict = advisor(oracle).evaluate(&evaluation(dec!(1200))).await;
        assert_eq!(verdict.action, ReplyAction::Counter);
        assert_eq!(verdict.counter_price, Some(dec!(1500)));
    }

    #[tokio::test]
    async fn test_inconsistent_answer_falls_back() {
        let oracle = Scripted::new(Ok(
            "{\"action\":\"accept\",\"accepted\":false,\"rationale\":\"?\"}".to_string(),
        ));
        let verdict = advisor(oracle).evaluate(&evaluation(dec!(1000))).await;
        assert_eq!(verdict.action, ReplyAction::Reject);
    }

    #[tokio::test]
    async fn test_accept_below_minimum_becomes_counter() {
        let oracle = Scripted::new(Ok(
            "{\"action\":\"accept\",\"accepted\":true,\"rationale\":\"sure\"}".to_string(),
        ));
        let verdict = advisor(oracle).evaluate(&evaluation(dec!(1100))).await;
        assert_eq!(verdict.action, ReplyAction::Counter);
        assert_eq!(verdict.counter_price, Some(dec!(1350.00)));
    }

    #[tokio::test]
    async fn test_high_offer_accepted_without_consulting_oracle() {
        let oracle = Scripted::new(Ok("{\"action\":\"reject\",\"accepted\":false}".to_string()));
        let verdict = advisor(oracle.clone()).evaluate(&evaluation(dec!(1400))).await;
        assert!(verdict.acceptable());
        assert_eq!(oracle.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failing_oracle_selection_falls_back() {
        let oracle = Scripted::new(Err(MarketError::Oracle("rate limited".into())));
        let prompt = SelectionPrompt {
            description: "laptop".to_string(),
            category: None,
            budget: dec!(2000),
            currency: "USD".to_string(),
            candidates: vec![candidate("x", dec!(1500)), candidate("y", dec!(1400))],
        };
        let chosen = advisor(oracle).select(&prompt).await.unwrap();
        assert_eq!(chosen.listing.id, "y");
    }

    #[tokio::test]
    async fn test_unknown_selection_falls_back() {
        let oracle = Scripted::new(Ok("{\"listing_id\":\"ghost\"}".to_string()));
        let prompt = SelectionPrompt {
            description: "laptop".to_string(),
            category: None,
            budget: dec!(2000),
            currency: "USD".to_string(),
            candidates: vec![candidate("x", dec!(1500))],
        };
        assert_eq!(advisor(oracle).select(&prompt).await.unwrap().listing.id, "x");
    }

    #[tokio::test]
    async fn test_rule_oracle_output_parses() {
        let advisor = DecisionAdvisor::deterministic();
        let verdict = advisor.evaluate(&evaluation(dec!(1200))).await;
        assert_eq!(verdict.action, ReplyAction::Counter);
    }
}
