use crate::config::{AppConfig, OracleConfig, OracleProvider};
use crate::oracle::{
    DecisionAdvisor, DecisionOracle, EvaluationPolicy, EvaluationPrompt, RuleOracle, SelectionPrompt,
};
use crate::{MarketError, Result};
use async_openai::{
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
        CreateChatCompletionRequestArgs,
    },
    Client,
};
use async_trait::async_trait;
use std::fmt::Write;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

const SELECTION_SYSTEM: &str = r#"You are a purchasing agent choosing one listing for a buyer. Output valid JSON only.

Schema:
{
  "listing_id": "id of the chosen listing, or null if none fits",
  "reason": "short justification"
}

Rules:
- listing_id must be one of the listed ids
- prefer listings within budget that match the description"#;

const EVALUATION_SYSTEM: &str = r#"You are a seller agent answering a purchase offer. Output valid JSON only.

Schema:
{
  "action": "accept" | "counter" | "reject",
  "accepted": true only when action is "accept",
  "counter_price": "decimal string, required for counter",
  "rationale": "short justification"
}

Rules:
- counter_price must be above the offer and not above the asking price
- be concise in rationale"#;

pub struct OpenAiOracle {
    client: Client<OpenAIConfig>,
    model: String,
    max_tokens: u32,
    temperature: f32,
}

impl OpenAiOracle {
    pub fn new(config: &OracleConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| MarketError::Config("oracle.api_key is required for the openai provider".to_string()))?;
        let mut openai = OpenAIConfig::new().with_api_key(api_key);
        if let Some(base) = &config.api_base {
            openai = openai.with_api_base(base);
        }
        Ok(Self {
            client: Client::with_config(openai),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
        })
    }

    async fn complete(&self, system: &str, user: String) -> Result<String> {
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .max_tokens(self.max_tokens)
            .temperature(self.temperature)
            .messages([
                ChatCompletionRequestSystemMessageArgs::default()
                    .content(system)
                    .build()?
                    .into(),
                ChatCompletionRequestUserMessageArgs::default()
                    .content(user)
                    .build()?
                    .into(),
            ])
            .build()?;

        let response = self.client.chat().create(request).await?;
        let content = response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| MarketError::Oracle("empty completion".to_string()))?;
        debug!(model = %self.model, chars = content.len(), "oracle completion");
        Ok(content)
    }
}

pub fn render_selection(prompt: &SelectionPrompt) -> String {
    let mut out = format!(
        "Buyer wants: {}\nBudget: {} {}\n",
        prompt.description, prompt.budget, prompt.currency
    );
    if let Some(category) = &prompt.category {
        let _ = writeln!(out, "Category: {}", category);
    }
    out.push_str("\nListings:\n");
    for c in &prompt.candidates {
        let _ = writeln!(
            out,
            "- id={} title={:?} price={} {} condition={} seller={}",
            c.listing.id,
            c.listing.title,
            c.listing.price,
            c.listing.currency,
            c.listing.condition,
            c.seller.agent_identity
        );
    }
    out.push_str("\nChoose the best listing.");
    out
}

pub fn render_evaluation(prompt: &EvaluationPrompt) -> String {
    format!(
        "Listing: {} ({:?})\nAsking price: {} {}\nBuyer {} offers: {} {}\nRound {} of {}\n\
         Offers at or above {} are accepted automatically.\n\nAnswer the offer.",
        prompt.listing.id,
        prompt.listing.title,
        prompt.listing.price,
        prompt.listing.currency,
        prompt.buyer,
        prompt.offer_price,
        prompt.currency,
        prompt.round,
        prompt.max_rounds,
        prompt.acceptance_price
    )
}

#[async_trait]
impl DecisionOracle for OpenAiOracle {
    fn name(&self) -> &str {
        &self.model
    }

    async fn select_best(&self, prompt: &SelectionPrompt) -> Result<String> {
        self.complete(SELECTION_SYSTEM, render_selection(prompt)).await
    }

    async fn evaluate_offer(&self, prompt: &EvaluationPrompt) -> Result<String> {
        self.complete(EVALUATION_SYSTEM, render_evaluation(prompt)).await
    }
}

pub fn advisor_from_config(config: &AppConfig) -> Result<DecisionAdvisor> {
    let policy = EvaluationPolicy::from(&config.negotiation);
    let oracle: Arc<dyn DecisionOracle> = match config.oracle.provider {
        OracleProvider::Rule => Arc::new(RuleOracle::new(policy)),
        OracleProvider::OpenAi => Arc::new(OpenAiOracle::new(&config.oracle)?),
    };
    info!(oracle = oracle.name(), "decision oracle ready");
    Ok(DecisionAdvisor::new(
        oracle,
        policy,
        Duration::from_secs(config.oracle.timeout_seconds),
        config.retry.policy(),
    ))
}
