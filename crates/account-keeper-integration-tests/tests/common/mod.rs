//! Common test utilities for account-keeper-api integration tests
//!
//! This module provides:
//! - A router wired to in-memory adapters
//! - Signed request builders for both webhook providers
//! - Payload builders for the provider event vocabularies
//! - Store wrappers counting every call or delaying it

#![allow(dead_code)]

use account_keeper_api::{create_router, AppState, DeadLetterConfig, ServiceConfig};
use account_keeper_core::{
    AccountStore, AuthUserId, BillingCustomerId, Commit, CommitResult, DeadLetterSink,
    EmailAddress, EventId, InMemoryAccountStore, InMemoryDeadLetterSink, ProviderKind,
    StoreError, Timestamp, UserAccount,
};
use async_trait::async_trait;
use axum::{
    body::Body,
    http::Request,
    response::Response,
    Router,
};
use serde_json::{json, Value};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use std::time::Duration;
use tower::ServiceExt;

pub const AUTH_SECRET: &str = "whsec_dGVzdC1zaWduaW5nLXNlY3JldA==";
pub const BILLING_SECRET: &str = "whsec_billing_integration";

// ============================================================================
// Application fixture
// ============================================================================

pub fn test_config() -> ServiceConfig {
    let mut config = ServiceConfig::default();
    config.auth_provider.signing_secret = AUTH_SECRET.to_string();
    config.billing_provider.signing_secret = BILLING_SECRET.to_string();
    config.dead_letter = DeadLetterConfig::Memory;
    config
}

/// Router plus handles on the adapters behind it
pub struct TestApp {
    pub router: Router,
    pub state: AppState,
    pub store: Arc<InMemoryAccountStore>,
    pub dead_letters: Arc<InMemoryDeadLetterSink>,
}

impl TestApp {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: ServiceConfig) -> Self {
        let store = Arc::new(InMemoryAccountStore::new());
        let dead_letters = Arc::new(InMemoryDeadLetterSink::new());
        let state = AppState::from_config(config, store.clone(), dead_letters.clone())
            .expect("test configuration is valid");

        Self {
            router: create_router(state.clone()),
            state,
            store,
            dead_letters,
        }
    }

    pub async fn send(&self, request: Request<Body>) -> Response {
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router is infallible")
    }

    pub async fn account(&self, auth_id: &str) -> Option<UserAccount> {
        let id = AuthUserId::new(auth_id).expect("valid auth id");
        self.store.find_by_auth_id(&id).await.expect("store available")
    }
}

/// Build a router over arbitrary store and sink implementations
pub fn router_with(
    config: ServiceConfig,
    store: Arc<dyn AccountStore>,
    dead_letters: Arc<dyn DeadLetterSink>,
) -> Router {
    let state =
        AppState::from_config(config, store, dead_letters).expect("test configuration is valid");
    create_router(state)
}

// ============================================================================
// Signed requests
// ============================================================================

pub fn now_seconds() -> i64 {
    Timestamp::now().unix_seconds()
}

/// Auth provider webhook signed at the current time
pub fn auth_webhook(message_id: &str, body: &Value) -> Request<Body> {
    auth_webhook_at(message_id, now_seconds(), body)
}

pub fn auth_webhook_at(message_id: &str, timestamp: i64, body: &Value) -> Request<Body> {
    let body = body.to_string();
    let provider = test_config()
        .build_auth_provider()
        .expect("valid auth secret");
    Request::builder()
        .method("POST")
        .uri("/webhooks/auth")
        .header("content-type", "application/json")
        .header("svix-id", message_id)
        .header("svix-timestamp", timestamp.to_string())
        .header(
            "svix-signature",
            provider.sign(message_id, timestamp, body.as_bytes()),
        )
        .body(Body::from(body))
        .expect("valid request")
}

/// Billing provider webhook signed at the current time
pub fn billing_webhook(body: &Value) -> Request<Body> {
    billing_webhook_at(now_seconds(), body)
}

pub fn billing_webhook_at(timestamp: i64, body: &Value) -> Request<Body> {
    let body = body.to_string();
    let provider = test_config()
        .build_billing_provider()
        .expect("valid billing secret");
    Request::builder()
        .method("POST")
        .uri("/webhooks/billing")
        .header("content-type", "application/json")
        .header("stripe-signature", provider.sign(timestamp, body.as_bytes()))
        .body(Body::from(body))
        .expect("valid request")
}

pub fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .body(Body::empty())
        .expect("valid request")
}

pub async fn read_json(response: Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("readable body");
    serde_json::from_slice(&bytes).expect("JSON body")
}

pub async fn read_text(response: Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("readable body");
    String::from_utf8(bytes.to_vec()).expect("UTF-8 body")
}

// ============================================================================
// Payload builders
// ============================================================================

pub fn user_event(event_type: &str, user_id: &str, email: &str, version_ms: i64) -> Value {
    json!({
        "type": event_type,
        "object": "event",
        "timestamp": version_ms,
        "data": {
            "id": user_id,
            "username": user_id.trim_start_matches("user_"),
            "first_name": "Ada",
            "last_name": "Lovelace",
            "primary_email_address_id": "idn_primary",
            "email_addresses": [{"id": "idn_primary", "email_address": email}]
        }
    })
}

pub fn user_created(user_id: &str, email: &str) -> Value {
    user_event("user.created", user_id, email, now_seconds() * 1000)
}

pub fn user_deleted(user_id: &str) -> Value {
    json!({
        "type": "user.deleted",
        "object": "event",
        "timestamp": now_seconds() * 1000,
        "data": { "id": user_id, "deleted": true }
    })
}

pub fn customer_created(event_id: &str, customer_id: &str, email: &str) -> Value {
    json!({
        "id": event_id,
        "object": "event",
        "type": "customer.created",
        "created": now_seconds(),
        "data": { "object": { "id": customer_id, "object": "customer", "email": email } }
    })
}

pub fn subscription_event(
    event_id: &str,
    event_type: &str,
    customer_id: &str,
    status: &str,
    created: i64,
) -> Value {
    json!({
        "id": event_id,
        "object": "event",
        "type": event_type,
        "created": created,
        "data": { "object": {
            "id": "sub_1",
            "object": "subscription",
            "customer": customer_id,
            "status": status,
            "items": { "data": [{ "price": { "id": "price_pro_monthly" } }] }
        }}
    })
}

// ============================================================================
// Counting store
// ============================================================================

/// In-memory store that counts every trait call
#[derive(Default)]
pub struct CountingStore {
    pub inner: InMemoryAccountStore,
    calls: AtomicUsize,
}

impl CountingStore {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn hit(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl AccountStore for CountingStore {
    async fn find_by_auth_id(&self, id: &AuthUserId) -> Result<Option<UserAccount>, StoreError> {
        self.hit();
        self.inner.find_by_auth_id(id).await
    }

    async fn find_by_billing_id(
        &self,
        id: &BillingCustomerId,
    ) -> Result<Option<UserAccount>, StoreError> {
        self.hit();
        self.inner.find_by_billing_id(id).await
    }

    async fn find_by_email(&self, email: &EmailAddress) -> Result<Vec<UserAccount>, StoreError> {
        self.hit();
        self.inner.find_by_email(email).await
    }

    async fn is_applied(&self, provider: ProviderKind, event_id: &EventId) -> Result<bool, StoreError> {
        self.hit();
        self.inner.is_applied(provider, event_id).await
    }

    async fn commit(&self, commit: Commit) -> Result<CommitResult, StoreError> {
        self.hit();
        self.inner.commit(commit).await
    }
}

// ============================================================================
// Slow store
// ============================================================================

/// In-memory store that sleeps before answering every call
pub struct SlowStore {
    pub inner: InMemoryAccountStore,
    pub delay: Duration,
}

#[async_trait]
impl AccountStore for SlowStore {
    async fn find_by_auth_id(&self, id: &AuthUserId) -> Result<Option<UserAccount>, StoreError> {
        tokio::time::sleep(self.delay).await;
        self.inner.find_by_auth_id(id).await
    }

    async fn find_by_billing_id(
        &self,
        id: &BillingCustomerId,
    ) -> Result<Option<UserAccount>, StoreError> {
        tokio::time::sleep(self.delay).await;
        self.inner.find_by_billing_id(id).await
    }

    async fn find_by_email(&self, email: &EmailAddress) -> Result<Vec<UserAccount>, StoreError> {
        tokio::time::sleep(self.delay).await;
        self.inner.find_by_email(email).await
    }

    async fn is_applied(&self, provider: ProviderKind, event_id: &EventId) -> Result<bool, StoreError> {
        tokio::time::sleep(self.delay).await;
        self.inner.is_applied(provider, event_id).await
    }

    async fn commit(&self, commit: Commit) -> Result<CommitResult, StoreError> {
        tokio::time::sleep(self.delay).await;
        self.inner.commit(commit).await
    }
}
