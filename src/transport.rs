use crate::error::{MarketError, Result};
use crate::protocol::{Envelope, Message, Role};
use crate::registry::AgentRegistry;
use crate::retry::{with_timeout, RetryPolicy};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, envelope: Envelope) -> Result<Envelope>;
}

#[async_trait]
pub trait MessageTransport: Send + Sync {
    async fn exchange(&self, endpoint: &str, envelope: Envelope) -> Result<Envelope>;
}

/// Wraps `message`, exchanges it under timeout and retry, and opens the reply.
/// Every protocol request is idempotent on the receiving side, so resending
/// after a transient failure is safe.
pub async fn send_message(
    transport: &dyn MessageTransport,
    endpoint: &str,
    message: Message,
    role: Role,
    timeout: Duration,
    retry: &RetryPolicy,
) -> Result<Message> {
    let envelope = message.into_envelope(role)?;
    let operation = format!("{} to {}", envelope.kind, endpoint);
    let reply = retry
        .run(&operation, || {
            with_timeout(&operation, timeout, transport.exchange(endpoint, envelope.clone()))
        })
        .await?;
    reply.open()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
    #[serde(default)]
    pub listing_id: Option<String>,
}

pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: Client::builder().timeout(timeout).build()?,
        })
    }
}

fn error_from_status(endpoint: &str, status: StatusCode, body: Option<ErrorBody>) -> MarketError {
    let message = body
        .as_ref()
        .map(|b| b.message.clone())
        .unwrap_or_else(|| format!("{} answered {}", endpoint, status));
    match status {
        StatusCode::CONFLICT => MarketError::concurrent_reservation(
            body.and_then(|b| b.listing_id).unwrap_or_default(),
        ),
        StatusCode::UNPROCESSABLE_ENTITY | StatusCode::BAD_REQUEST => MarketError::Negotiation(message),
        StatusCode::NOT_FOUND => MarketError::ListingNotFound(message),
        StatusCode::PAYMENT_REQUIRED => MarketError::Payment(message),
        s if s.is_server_error() => MarketError::Unavailable(message),
        _ => MarketError::Negotiation(message),
    }
}

#[async_trait]
impl MessageTransport for HttpTransport {
    async fn exchange(&self, endpoint: &str, envelope: Envelope) -> Result<Envelope> {
        let url = format!("{}/messages", endpoint.trim_end_matches('/'));
        debug!(url = %url, kind = %envelope.kind, id = %envelope.id, "sending envelope");
        let response = self.client.post(&url).json(&envelope).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.json::<ErrorBody>().await.ok();
            return Err(error_from_status(endpoint, status, body));
        }
        let bytes = response.bytes().await?;
        Envelope::from_bytes(&bytes)
    }
}

/// Delivers envelopes to handlers registered in an [`AgentRegistry`].
/// Envelopes pass through their byte encoding so both sides see exactly
/// what an HTTP peer would.
pub struct InProcessTransport {
    registry: Arc<AgentRegistry>,
    timeout: Duration,
    duplicate_delivery: bool,
    delivered: AtomicU64,
}

impl InProcessTransport {
    pub fn new(registry: Arc<AgentRegistry>, timeout: Duration) -> Self {
        Self {
            registry,
            timeout,
            duplicate_delivery: false,
            delivered: AtomicU64::new(0),
        }
    }

    pub fn with_duplicate_delivery(mut self) -> Self {
        self.duplicate_delivery = true;
        self
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    async fn deliver(&self, endpoint: &str, bytes: &[u8]) -> Result<Envelope> {
        let handler = self
            .registry
            .resolve(endpoint)
            .ok_or_else(|| MarketError::Unavailable(format!("no agent at {}", endpoint)))?;
        let request = Envelope::from_bytes(bytes)?;
        self.delivered.fetch_add(1, Ordering::Relaxed);
        let reply = with_timeout("message exchange", self.timeout, handler.handle(request)).await?;
        Envelope::from_bytes(&reply.to_bytes()?)
    }
}

#[async_trait]
impl MessageTransport for InProcessTransport {
    async fn exchange(&self, endpoint: &str, envelope: Envelope) -> Result<Envelope> {
        let bytes = envelope.to_bytes()?;
        if self.duplicate_delivery {
            match self.deliver(endpoint, &bytes).await {
                Ok(first) => debug!(kind = %first.kind, "first delivery answered"),
                Err(e) => warn!("first delivery failed: {}", e),
            }
        }
        self.deliver(endpoint, &bytes).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ListingQuery;
    use crate::registry::local_endpoint;
    use std::sync::atomic::AtomicU32;

    struct Counting {
        calls: AtomicU32,
    }

    #[async_trait]
    impl MessageHandler for Counting {
        async fn handle(&self, envelope: Envelope) -> Result<Envelope> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(envelope)
        }
    }

    struct Slow;

    #[async_trait]
    impl MessageHandler for Slow {
        async fn handle(&self, envelope: Envelope) -> Result<Envelope> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(envelope)
        }
    }

    fn query() -> Envelope {
        Message::ListingQuery(ListingQuery::default())
            .into_envelope(Role::Buyer)
            .unwrap()
    }

    #[tokio::test]
    async fn test_in_process_exchange_and_duplicates() {
        let registry = Arc::new(AgentRegistry::new());
        let handler = Arc::new(Counting {
            calls: AtomicU32::new(0),
        });
        registry.register(local_endpoint("seller"), handler.clone());

        let transport = InProcessTransport::new(registry.clone(), Duration::from_secs(1));
        let reply = transport.exchange("local://seller", query()).await.unwrap();
        assert_eq!(reply.kind, crate::protocol::MessageKind::ListingQuery);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);

        let duplicating =
            InProcessTransport::new(registry, Duration::from_secs(1)).with_duplicate_delivery();
        duplicating.exchange("local://seller", query()).await.unwrap();
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        assert_eq!(duplicating.delivered(), 2);
    }

    #[tokio::test]
    async fn test_unknown_endpoint_is_unavailable() {
        let transport = InProcessTransport::new(Arc::new(AgentRegistry::new()), Duration::from_secs(1));
        let result = transport.exchange("local://nobody", query()).await;
        assert!(matches!(result, Err(MarketError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_slow_handler_times_out() {
        let registry = Arc::new(AgentRegistry::new());
        registry.register(local_endpoint("slow"), Arc::new(Slow));
        let transport = InProcessTransport::new(registry, Duration::from_millis(10));
        let result = transport.exchange("local://slow", query()).await;
        assert!(matches!(result, Err(MarketError::Timeout { .. })));
    }

    #[test]
    fn test_status_mapping() {
        let conflict = error_from_status(
            "http://seller",
            StatusCode::CONFLICT,
            Some(ErrorBody {
                error: "concurrent_reservation".to_string(),
                message: "taken".to_string(),
                listing_id: Some("laptop-001".to_string()),
            }),
        );
        assert!(matches!(
            conflict,
            MarketError::ConcurrentReservation { ref listing_id } if listing_id == "laptop-001"
        ));
        assert!(error_from_status("x", StatusCode::SERVICE_UNAVAILABLE, None).is_transient());
        assert!(matches!(
            error_from_status("x", StatusCode::UNPROCESSABLE_ENTITY, None),
            MarketError::Negotiation(_)
        ));
    }
}
