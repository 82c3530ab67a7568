//! Remote marketplace gateway: the only component that talks to the network.
//!
//! The contract is "one attempt, one outcome". Implementations never retry
//! and never touch the operation log; retry policy lives in
//! [`crate::retry::RetryScheduler`] and the coordinator.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::payload::{CreateListing, FetchOrders, OperationPayload, UpdateInventory, UpdatePrice};

pub mod sandbox;
pub mod timeout;

pub use sandbox::SandboxGateway;
pub use timeout::TimeoutGateway;

/// Successful outcome of a single remote call.
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayReceipt {
    /// Identifier assigned by the marketplace (listing id, feed id, ...).
    pub external_ref: Option<String>,
    /// Response body; stored as the record's `response_payload`.
    pub body: JsonValue,
}

impl GatewayReceipt {
    pub fn new(external_ref: Option<String>, body: JsonValue) -> Self {
        Self { external_ref, body }
    }
}

/// Failed outcome of a single remote call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    #[error("network error: {0}")]
    Network(String),

    /// The marketplace refused the payload itself.
    #[error("rejected by marketplace: {0}")]
    Rejected(String),

    #[error("rate limited by marketplace")]
    RateLimited { retry_after: Option<Duration> },

    /// No outcome within the deadline. Never assumed to have succeeded.
    #[error("gateway call timed out after {0:?}")]
    Timeout(Duration),

    #[error("unknown gateway failure: {0}")]
    Unknown(String),
}

/// How the pipeline reacts to a gateway failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Retrying cannot help; exhaust immediately.
    Validation,
    /// Drives the retry path.
    Transient,
}

impl GatewayError {
    /// Everything is transient unless the marketplace explicitly rejected
    /// the payload.
    pub fn class(&self) -> FailureClass {
        match self {
            GatewayError::Rejected(_) => FailureClass::Validation,
            GatewayError::Network(_)
            | GatewayError::RateLimited { .. }
            | GatewayError::Timeout(_)
            | GatewayError::Unknown(_) => FailureClass::Transient,
        }
    }
}

/// Marketplace capability injected into the coordinator.
#[async_trait]
pub trait MarketplaceGateway: Send + Sync {
    async fn create_listing(&self, request: &CreateListing) -> Result<GatewayReceipt, GatewayError>;

    async fn update_inventory(
        &self,
        request: &UpdateInventory,
    ) -> Result<GatewayReceipt, GatewayError>;

    async fn update_price(&self, request: &UpdatePrice) -> Result<GatewayReceipt, GatewayError>;

    async fn fetch_orders(&self, request: &FetchOrders) -> Result<GatewayReceipt, GatewayError>;
}

/// Route a payload to the gateway method matching its kind.
pub async fn dispatch(
    gateway: &dyn MarketplaceGateway,
    payload: &OperationPayload,
) -> Result<GatewayReceipt, GatewayError> {
    match payload {
        OperationPayload::CreateListing(p) => gateway.create_listing(p).await,
        OperationPayload::UpdateInventory(p) => gateway.update_inventory(p).await,
        OperationPayload::UpdatePrice(p) => gateway.update_price(p).await,
        OperationPayload::FetchOrders(p) => gateway.fetch_orders(p).await,
    }
}
