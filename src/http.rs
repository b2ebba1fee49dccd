use crate::discovery::{DiscoveryGateway, LookupResponse, RegisterRequest};
use crate::model::CounterpartRef;
use crate::protocol::{Envelope, ListingCatalog, ListingQuery};
use crate::seller::SellerAgent;
use crate::settlement::{
    BalanceResponse, FundRequest, LedgerGateway, PaymentInstruction, PaymentLookup, PaymentResponse,
    SettlementGateway, VerifyResponse,
};
use crate::transport::{ErrorBody, MessageHandler};
use crate::MarketError;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::error;

impl MarketError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            MarketError::ConcurrentReservation { .. } | MarketError::ListingConflict(_) => StatusCode::CONFLICT,
            MarketError::Negotiation(_)
            | MarketError::Validation(_)
            | MarketError::Selection(_)
            | MarketError::InvalidTransition { .. }
            | MarketError::Serialization(_) => StatusCode::UNPROCESSABLE_ENTITY,
            MarketError::ListingNotFound(_) | MarketError::Discovery(_) => StatusCode::NOT_FOUND,
            MarketError::Payment(_) => StatusCode::PAYMENT_REQUIRED,
            e if e.is_transient() => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for MarketError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(kind = self.kind(), "request failed: {}", self);
        }
        let listing_id = match &self {
            MarketError::ConcurrentReservation { listing_id } | MarketError::InvalidTransition { listing_id, .. } => {
                Some(listing_id.clone())
            }
            _ => None,
        };
        let body = ErrorBody {
            error: self.kind().to_string(),
            message: self.to_string(),
            listing_id,
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<T>, MarketError>;

async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "healthy"}))
}

fn with_layers(router: Router) -> Router {
    router
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

pub fn seller_router(seller: Arc<SellerAgent>) -> Router {
    let router = Router::new()
        .route("/messages", post(handle_message))
        .route("/listings", get(list_listings))
        .route("/health", get(health_check))
        .with_state(seller);
    with_layers(router)
}

async fn handle_message(State(seller): State<Arc<SellerAgent>>, Json(envelope): Json<Envelope>) -> ApiResult<Envelope> {
    Ok(Json(seller.handle(envelope).await?))
}

async fn list_listings(
    State(seller): State<Arc<SellerAgent>>,
    Query(query): Query<ListingQuery>,
) -> ApiResult<ListingCatalog> {
    Ok(Json(seller.handle_listing_query(&query).await?))
}

pub fn discovery_router(directory: Arc<dyn DiscoveryGateway>) -> Router {
    let router = Router::new()
        .route("/register", post(register_agent))
        .route("/lookup/:capability", get(lookup_agents))
        .route("/agents/:identity", delete(deregister_agent))
        .route("/health", get(health_check))
        .with_state(directory);
    with_layers(router)
}

async fn register_agent(
    State(directory): State<Arc<dyn DiscoveryGateway>>,
    Json(request): Json<RegisterRequest>,
) -> ApiResult<CounterpartRef> {
    Ok(Json(directory.register(request).await?))
}

async fn lookup_agents(
    State(directory): State<Arc<dyn DiscoveryGateway>>,
    Path(capability): Path<String>,
) -> ApiResult<LookupResponse> {
    let agents = directory.lookup(&capability).await?;
    Ok(Json(LookupResponse { capability, agents }))
}

async fn deregister_agent(
    State(directory): State<Arc<dyn DiscoveryGateway>>,
    Path(identity): Path<String>,
) -> std::result::Result<StatusCode, MarketError> {
    directory.deregister(&identity).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub fn settlement_router(ledger: Arc<LedgerGateway>) -> Router {
    let router = Router::new()
        .route("/payments", post(create_payment).get(find_payment))
        .route("/payments/:reference/verify", get(verify_payment))
        .route("/accounts/:account/fund", post(fund_account))
        .route("/health", get(health_check))
        .with_state(ledger);
    with_layers(router)
}

async fn create_payment(
    State(ledger): State<Arc<LedgerGateway>>,
    Json(instruction): Json<PaymentInstruction>,
) -> ApiResult<PaymentResponse> {
    let transaction_ref = ledger.pay(&instruction).await?;
    Ok(Json(PaymentResponse { transaction_ref }))
}

async fn find_payment(
    State(ledger): State<Arc<LedgerGateway>>,
    Query(lookup): Query<PaymentLookup>,
) -> std::result::Result<Response, MarketError> {
    Ok(match ledger.find_payment(&lookup.idempotency_key).await? {
        Some(transfer) => Json(transfer).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    })
}

async fn verify_payment(
    State(ledger): State<Arc<LedgerGateway>>,
    Path(reference): Path<String>,
) -> ApiResult<VerifyResponse> {
    let verified = ledger.verify(&reference).await?;
    Ok(Json(VerifyResponse {
        transaction_ref: reference,
        verified,
    }))
}

async fn fund_account(
    State(ledger): State<Arc<LedgerGateway>>,
    Path(account): Path<String>,
    Json(request): Json<FundRequest>,
) -> ApiResult<BalanceResponse> {
    let balance = ledger.fund(&account, &request.currency, request.amount)?;
    Ok(Json(BalanceResponse {
        account,
        currency: request.currency,
        balance,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::InMemoryDirectory;
    use crate::model::NewListing;
    use crate::oracle::DecisionAdvisor;
    use crate::protocol::{Message, PurchaseOffer, ReplyAction, Role};
    use crate::settlement::Transfer;
    use crate::store::InMemoryListingStore;
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Method, Request};
    use rust_decimal_macros::dec;
    use serde::de::DeserializeOwned;
    use tower::ServiceExt;

    async fn call<T: DeserializeOwned>(
        router: Router,
        method: Method,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, T) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(body.map_or_else(Body::empty, |b| Body::from(b.to_string())))
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    async fn seller() -> Arc<SellerAgent> {
        let seller = Arc::new(SellerAgent::new(
            "seller-1",
            Arc::new(InMemoryListingStore::new()),
            DecisionAdvisor::deterministic(),
            Arc::new(LedgerGateway::new()),
        ));
        seller
            .list(
                "laptop-001",
                NewListing {
                    title: "Gaming Laptop".to_string(),
                    description: String::new(),
                    price: dec!(1500),
                    currency: "USD".to_string(),
                    condition: "used".to_string(),
                    category: "electronics".to_string(),
                    seller: String::new(),
                },
            )
            .await
            .unwrap();
        seller
    }

    fn offer(buyer: &str, price: rust_decimal::Decimal) -> serde_json::Value {
        let envelope = Message::PurchaseOffer(PurchaseOffer {
            listing_id: "laptop-001".to_string(),
            offer_price: price,
            currency: "USD".to_string(),
            buyer_identity: buyer.to_string(),
            round: 1,
            rationale: String::new(),
        })
        .into_envelope(Role::Buyer)
        .unwrap();
        serde_json::to_value(envelope).unwrap()
    }

    #[tokio::test]
    async fn test_seller_messages_round_trip() {
        let router = seller_router(seller().await);

        let (status, reply): (_, Envelope) =
            call(router.clone(), Method::POST, "/messages", Some(offer("buyer-1", dec!(1350)))).await;
        assert_eq!(status, StatusCode::OK);
        match reply.open().unwrap() {
            Message::NegotiationReply(reply) => assert_eq!(reply.action, ReplyAction::Accept),
            other => panic!("unexpected {:?}", other.kind()),
        }

        let (status, body): (_, ErrorBody) =
            call(router.clone(), Method::POST, "/messages", Some(offer("buyer-2", dec!(1400)))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body.error, "concurrent_reservation");
        assert_eq!(body.listing_id.as_deref(), Some("laptop-001"));

        let (status, catalog): (_, ListingCatalog) = call(router, Method::GET, "/listings", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(catalog.listings.is_empty());
    }

    #[tokio::test]
    async fn test_discovery_routes() {
        let router = discovery_router(Arc::new(InMemoryDirectory::new()));
        let (status, _): (_, CounterpartRef) = call(
            router.clone(),
            Method::POST,
            "/register",
            Some(serde_json::json!({
                "agent_identity": "seller-1",
                "endpoint": "http://localhost:8001/",
                "capabilities": ["marketplace_seller"]
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (_, found): (_, LookupResponse) =
            call(router.clone(), Method::GET, "/lookup/marketplace_seller", None).await;
        assert_eq!(found.agents.len(), 1);
        assert_eq!(found.agents[0].endpoint, "http://localhost:8001");

        let (status, body): (_, ErrorBody) = call(router, Method::DELETE, "/agents/nobody", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body.error, "discovery");
    }

    #[tokio::test]
    async fn test_settlement_routes() {
        let router = settlement_router(Arc::new(LedgerGateway::new()));
        let (status, balance): (_, BalanceResponse) = call(
            router.clone(),
            Method::POST,
            "/accounts/buyer-1/fund",
            Some(serde_json::json!({"currency": "USD", "amount": "100"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(balance.balance, dec!(100));

        let (status, body): (_, ErrorBody) = call(
            router.clone(),
            Method::POST,
            "/payments",
            Some(serde_json::json!({
                "payer": "buyer-1",
                "recipient": "seller-1",
                "amount": "150",
                "currency": "USD",
                "memo": "laptop-001",
                "idempotency_key": "laptop-001/buyer-1"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
        assert_eq!(body.error, "payment");

        let (_, verified): (_, VerifyResponse) =
            call(router, Method::GET, "/payments/txn-missing/verify", None).await;
        assert!(!verified.verified);
    }

    #[tokio::test]
    async fn test_payment_lookup_by_key() {
        let ledger = Arc::new(LedgerGateway::with_opening_balance(dec!(500)));
        let router = settlement_router(ledger.clone());
        let uri = "/payments?idempotency_key=laptop-001%2Fbuyer-1";

        let response = router
            .clone()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let (status, paid): (_, PaymentResponse) = call(
            router.clone(),
            Method::POST,
            "/payments",
            Some(serde_json::json!({
                "payer": "buyer-1",
                "recipient": "seller-1",
                "amount": "150",
                "currency": "USD",
                "memo": "laptop-001",
                "idempotency_key": "laptop-001/buyer-1"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, transfer): (_, Transfer) = call(router, Method::GET, uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(transfer.transaction_ref, paid.transaction_ref);
        assert_eq!(transfer.instruction.amount, dec!(150));
    }
}
