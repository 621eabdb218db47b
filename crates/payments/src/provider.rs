//! External payment provider seam.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use common::{Money, UserId};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    #[error("provider request failed: {0}")]
    Transport(String),

    #[error("provider did not answer within {0:?}")]
    Timeout(Duration),
}

/// Checkout order handed to the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderRequest {
    pub user_id: UserId,
    pub amount: Money,
    pub currency: String,
    pub return_url: String,
    pub cancel_url: String,
}

impl OrderRequest {
    /// Body of a PayPal v2 `POST /checkout/orders` call.
    pub fn to_checkout_body(&self) -> serde_json::Value {
        json!({
            "intent": "CAPTURE",
            "purchase_units": [{
                "amount": {
                    "currency_code": self.currency,
                    "value": self.amount.to_string(),
                },
            }],
            "application_context": {
                "return_url": self.return_url,
                "cancel_url": self.cancel_url,
                "brand_name": "Karate Management",
                "landing_page": "LOGIN",
                "user_action": "PAY_NOW",
            },
        })
    }
}

/// Creates and captures checkout orders.
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    /// Registers a checkout order and returns the provider's order id.
    async fn create_order(&self, request: &OrderRequest) -> Result<String, ProviderError>;

    /// Captures an approved order. `Ok(false)` means the provider declined.
    async fn capture_order(&self, provider_order_id: &str) -> Result<bool, ProviderError>;

    /// Where the payer approves the order.
    fn approval_url(&self, provider_order_id: &str) -> String {
        format!("https://www.sandbox.paypal.com/checkoutnow?token={provider_order_id}")
    }
}

#[derive(Debug, Default)]
struct SandboxState {
    orders: HashMap<String, SandboxOrder>,
    next_id: u32,
    fail_on_create: bool,
    fail_on_capture: bool,
    decline_capture: bool,
    capture_latency: Option<Duration>,
    capture_calls: usize,
}

#[derive(Debug, Clone)]
struct SandboxOrder {
    body: serde_json::Value,
    captured: bool,
}

/// In-memory provider standing in for the PayPal sandbox.
#[derive(Debug, Clone, Default)]
pub struct SandboxPaymentProvider {
    state: Arc<RwLock<SandboxState>>,
}

impl SandboxPaymentProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes order creation fail with a transport error.
    pub fn set_fail_on_create(&self, fail: bool) {
        self.write().fail_on_create = fail;
    }

    /// Makes capture fail with a transport error.
    pub fn set_fail_on_capture(&self, fail: bool) {
        self.write().fail_on_capture = fail;
    }

    /// Makes capture answer "not completed".
    pub fn set_decline_capture(&self, decline: bool) {
        self.write().decline_capture = decline;
    }

    pub fn set_capture_latency(&self, latency: Option<Duration>) {
        self.write().capture_latency = latency;
    }

    pub fn order_count(&self) -> usize {
        self.read().orders.len()
    }

    /// Number of capture calls received, successful or not.
    pub fn capture_calls(&self) -> usize {
        self.read().capture_calls
    }

    pub fn is_captured(&self, provider_order_id: &str) -> bool {
        self.read()
            .orders
            .get(provider_order_id)
            .is_some_and(|o| o.captured)
    }

    /// The checkout body the order was created with.
    pub fn order_body(&self, provider_order_id: &str) -> Option<serde_json::Value> {
        self.read()
            .orders
            .get(provider_order_id)
            .map(|o| o.body.clone())
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, SandboxState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, SandboxState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl PaymentProvider for SandboxPaymentProvider {
    async fn create_order(&self, request: &OrderRequest) -> Result<String, ProviderError> {
        let mut state = self.write();
        if state.fail_on_create {
            return Err(ProviderError::Transport("connection refused".into()));
        }
        state.next_id += 1;
        let order_id = format!("SANDBOX-{:06}", state.next_id);
        state.orders.insert(
            order_id.clone(),
            SandboxOrder {
                body: request.to_checkout_body(),
                captured: false,
            },
        );
        tracing::debug!(%order_id, user_id = %request.user_id, "sandbox order created");
        Ok(order_id)
    }

    async fn capture_order(&self, provider_order_id: &str) -> Result<bool, ProviderError> {
        let latency = {
            let mut state = self.write();
            state.capture_calls += 1;
            state.capture_latency
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.write();
        if state.fail_on_capture {
            return Err(ProviderError::Transport("connection reset".into()));
        }
        if state.decline_capture {
            return Ok(false);
        }
        match state.orders.get_mut(provider_order_id) {
            Some(order) => {
                order.captured = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
