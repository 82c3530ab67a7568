//! Per-call deadline for any gateway.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use crate::payload::{CreateListing, FetchOrders, UpdateInventory, UpdatePrice};

use super::{GatewayError, GatewayReceipt, MarketplaceGateway};

/// Wraps a gateway so that a call without an outcome after `limit` becomes
/// [`GatewayError::Timeout`].
#[derive(Debug)]
pub struct TimeoutGateway<G> {
    inner: G,
    limit: Duration,
}

impl<G> TimeoutGateway<G> {
    pub fn new(inner: G, limit: Duration) -> Self {
        Self { inner, limit }
    }

    pub fn inner(&self) -> &G {
        &self.inner
    }

    async fn guarded<F>(&self, op: &'static str, call: F) -> Result<GatewayReceipt, GatewayError>
    where
        F: Future<Output = Result<GatewayReceipt, GatewayError>>,
    {
        match tokio::time::timeout(self.limit, call).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(op, limit_ms = self.limit.as_millis() as u64, "gateway call timed out");
                Err(GatewayError::Timeout(self.limit))
            }
        }
    }
}

#[async_trait]
impl<G: MarketplaceGateway> MarketplaceGateway for TimeoutGateway<G> {
    async fn create_listing(&self, request: &CreateListing) -> Result<GatewayReceipt, GatewayError> {
        self.guarded("create_listing", self.inner.create_listing(request)).await
    }

    async fn update_inventory(
        &self,
        request: &UpdateInventory,
    ) -> Result<GatewayReceipt, GatewayError> {
        self.guarded("update_inventory", self.inner.update_inventory(request)).await
    }

    async fn update_price(&self, request: &UpdatePrice) -> Result<GatewayReceipt, GatewayError> {
        self.guarded("update_price", self.inner.update_price(request)).await
    }

    async fn fetch_orders(&self, request: &FetchOrders) -> Result<GatewayReceipt, GatewayError> {
        self.guarded("fetch_orders", self.inner.fetch_orders(request)).await
    }
}
