use crate::{
    error::{MarketError, Result},
    model::CounterpartRef,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegisterRequest {
    pub agent_identity: String,
    pub endpoint: String,
    pub capabilities: Vec<String>,
}

impl RegisterRequest {
    pub fn validate(&self) -> Result<()> {
        if self.agent_identity.trim().is_empty() {
            return Err(MarketError::Validation("agent_identity must not be empty".to_string()));
        }
        if self.endpoint.trim().is_empty() {
            return Err(MarketError::Validation("endpoint must not be empty".to_string()));
        }
        if self.capabilities.is_empty() {
            return Err(MarketError::Validation(
                "at least one capability must be advertised".to_string(),
            ));
        }
        Ok(())
    }

    fn into_counterpart(self) -> CounterpartRef {
        CounterpartRef {
            agent_identity: self.agent_identity,
            endpoint: self.endpoint.trim_end_matches('/').to_string(),
            advertised_capabilities: self.capabilities,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LookupResponse {
    pub capability: String,
    pub agents: Vec<CounterpartRef>,
}

#[async_trait]
pub trait DiscoveryGateway: Send + Sync {
    async fn lookup(&self, capability: &str) -> Result<Vec<CounterpartRef>>;

    async fn register(&self, request: RegisterRequest) -> Result<CounterpartRef>;

    async fn deregister(&self, agent_identity: &str) -> Result<()>;
}

struct DirectoryEntry {
    counterpart: CounterpartRef,
    registered_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct InMemoryDirectory {
    entries: RwLock<HashMap<String, DirectoryEntry>>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[async_trait]
impl DiscoveryGateway for InMemoryDirectory {
    async fn lookup(&self, capability: &str) -> Result<Vec<CounterpartRef>> {
        let entries = self.entries.read();
        let mut matches: Vec<&DirectoryEntry> = entries
            .values()
            .filter(|e| e.counterpart.advertises(capability))
            .collect();
        // Registration order keeps lookups stable for callers that iterate.
        matches.sort_by(|a, b| {
            a.registered_at
                .cmp(&b.registered_at)
                .then_with(|| a.counterpart.agent_identity.cmp(&b.counterpart.agent_identity))
        });
        Ok(matches.into_iter().map(|e| e.counterpart.clone()).collect())
    }

    async fn register(&self, request: RegisterRequest) -> Result<CounterpartRef> {
        request.validate()?;
        let counterpart = request.into_counterpart();
        let mut entries = self.entries.write();
        let registered_at = entries
            .get(&counterpart.agent_identity)
            .map(|e| e.registered_at)
            .unwrap_or_else(Utc::now);
        info!(
            agent = %counterpart.agent_identity,
            endpoint = %counterpart.endpoint,
            "agent registered"
        );
        entries.insert(
            counterpart.agent_identity.clone(),
            DirectoryEntry {
                counterpart: counterpart.clone(),
                registered_at,
            },
        );
        Ok(counterpart)
    }

    async fn deregister(&self, agent_identity: &str) -> Result<()> {
        if self.entries.write().remove(agent_identity).is_none() {
            return Err(MarketError::Discovery(format!(
                "agent {} is not registered",
                agent_identity
            )));
        }
        info!(agent = agent_identity, "agent removed from discovery");
        Ok(())
    }
}

pub struct HttpDiscovery {
    endpoint: String,
    client: Client,
}

impl HttpDiscovery {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

fn unavailable(endpoint: &str, status: StatusCode) -> MarketError {
    if status.is_server_error() {
        MarketError::Unavailable(format!("discovery at {} returned {}", endpoint, status))
    } else {
        MarketError::Discovery(format!("discovery at {} returned {}", endpoint, status))
    }
}

#[async_trait]
impl DiscoveryGateway for HttpDiscovery {
    async fn lookup(&self, capability: &str) -> Result<Vec<CounterpartRef>> {
        let response = self
            .client
            .get(format!("{}/lookup/{}", self.endpoint, capability))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(unavailable(&self.endpoint, response.status()));
        }
        let body: LookupResponse = response.json().await?;
        Ok(body.agents)
    }

    async fn register(&self, request: RegisterRequest) -> Result<CounterpartRef> {
        let response = self
            .client
            .post(format!("{}/register", self.endpoint))
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(unavailable(&self.endpoint, response.status()));
        }
        Ok(response.json().await?)
    }

    async fn deregister(&self, agent_identity: &str) -> Result<()> {
        let response = self
            .client
            .delete(format!("{}/agents/{}", self.endpoint, agent_identity))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(unavailable(&self.endpoint, response.status()));
        }
        Ok(())
    }
}
