//! In-process marketplace stand-in.
//!
//! Listings live in a map keyed by their synthetic external id. For listings
//! that id is the SKU (caller-supplied or derived as `SKU-<subject prefix>`),
//! which `create_listing` returns as `external_ref`; inventory and price
//! updates address the same key. Feed ids (`FEED_…`, `INV_FEED_…`,
//! `PRICE_FEED_…`) are generated per call and only reported back.
//!
//! Every call sleeps a random latency before answering, and tests can script
//! failures ahead of time.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use serde_json::json;
use tracing::{debug, info};

use crate::payload::{CreateListing, FetchOrders, UpdateInventory, UpdatePrice};

use super::{GatewayError, GatewayReceipt, MarketplaceGateway};

/// Listing as the sandbox marketplace sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxListing {
    pub sku: String,
    pub title: String,
    pub price_cents: u64,
    pub quantity: u32,
}

#[derive(Debug, Default)]
struct Script {
    queued: VecDeque<GatewayError>,
    always: Option<GatewayError>,
}

#[derive(Debug)]
pub struct SandboxGateway {
    min_latency: Duration,
    max_latency: Duration,
    listings: Mutex<HashMap<String, SandboxListing>>,
    script: Mutex<Script>,
    calls: AtomicU64,
}

impl Default for SandboxGateway {
    fn default() -> Self {
        Self::new(Duration::from_millis(100), Duration::from_millis(500))
    }
}

impl SandboxGateway {
    /// A `min_latency` above `max_latency` is clamped down to it.
    pub fn new(min_latency: Duration, max_latency: Duration) -> Self {
        Self {
            min_latency: min_latency.min(max_latency),
            max_latency,
            listings: Mutex::new(HashMap::new()),
            script: Mutex::new(Script::default()),
            calls: AtomicU64::new(0),
        }
    }

    /// No simulated latency.
    pub fn instant() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO)
    }

    /// Fail the next call with `err`. Queued failures are consumed in order.
    pub fn inject_failure(&self, err: GatewayError) {
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .queued
            .push_back(err);
    }

    /// Fail every call with `err` until cleared with `None`.
    pub fn fail_always(&self, err: Option<GatewayError>) {
        self.script.lock().unwrap_or_else(PoisonError::into_inner).always = err;
    }

    /// Seed a listing without going through `create_listing`.
    pub fn seed_listing(&self, listing: SandboxListing) {
        self.listings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(listing.sku.clone(), listing);
    }

    pub fn listing(&self, sku: &str) -> Option<SandboxListing> {
        self.listings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(sku)
            .cloned()
    }

    /// Calls received so far, including failed ones.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    /// Count the call, wait out the simulated latency, then apply any
    /// scripted failure.
    async fn begin_call(&self, op: &'static str) -> Result<(), GatewayError> {
        self.calls.fetch_add(1, Ordering::Relaxed);

        let latency = if self.max_latency.is_zero() {
            Duration::ZERO
        } else {
            let min = self.min_latency.as_millis() as u64;
            let max = self.max_latency.as_millis() as u64;
            Duration::from_millis(rand::thread_rng().gen_range(min..=max))
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut script = self.script.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(err) = script.queued.pop_front().or_else(|| script.always.clone()) {
            debug!(op, error = %err, "sandbox: scripted failure");
            return Err(err);
        }
        Ok(())
    }

    fn with_listing<F>(&self, sku: &str, f: F) -> Result<SandboxListing, GatewayError>
    where
        F: FnOnce(&mut SandboxListing),
    {
        let mut listings = self.listings.lock().unwrap_or_else(PoisonError::into_inner);
        let listing = listings
            .get_mut(sku)
            .ok_or_else(|| GatewayError::Rejected(format!("unknown sku: {sku}")))?;
        f(listing);
        Ok(listing.clone())
    }
}

/// `<prefix>_<unix seconds>_<6 random digits>`.
pub fn sandbox_id(prefix: &str) -> String {
    let suffix: u32 = rand::thread_rng().gen_range(0..1_000_000);
    format!("{prefix}_{}_{suffix:06}", Utc::now().timestamp())
}

#[async_trait]
impl MarketplaceGateway for SandboxGateway {
    async fn create_listing(&self, request: &CreateListing) -> Result<GatewayReceipt, GatewayError> {
        self.begin_call("create_listing").await?;

        let sku = request
            .sku
            .clone()
            .ok_or_else(|| GatewayError::Rejected("listing has no sku".to_string()))?;
        let feed_id = sandbox_id("FEED");

        self.seed_listing(SandboxListing {
            sku: sku.clone(),
            title: request.title.clone(),
            price_cents: request.price_cents,
            quantity: request.quantity,
        });

        info!(sku = %sku, feed_id = %feed_id, "sandbox: listing created");
        Ok(GatewayReceipt::new(
            Some(sku.clone()),
            json!({
                "listing_id": sku,
                "feed_id": feed_id,
                "status": "processing",
                "sandbox_mode": true,
            }),
        ))
    }

    async fn update_inventory(
        &self,
        request: &UpdateInventory,
    ) -> Result<GatewayReceipt, GatewayError> {
        self.begin_call("update_inventory").await?;

        self.with_listing(&request.sku, |l| l.quantity = request.quantity)?;
        let feed_id = sandbox_id("INV_FEED");

        info!(sku = %request.sku, quantity = request.quantity, "sandbox: inventory updated");
        Ok(GatewayReceipt::new(
            Some(feed_id.clone()),
            json!({
                "sku": request.sku,
                "quantity": request.quantity,
                "feed_id": feed_id,
                "sandbox_mode": true,
            }),
        ))
    }

    async fn update_price(&self, request: &UpdatePrice) -> Result<GatewayReceipt, GatewayError> {
        self.begin_call("update_price").await?;

        self.with_listing(&request.sku, |l| l.price_cents = request.price_cents)?;
        let feed_id = sandbox_id("PRICE_FEED");

        info!(sku = %request.sku, price_cents = request.price_cents, "sandbox: price updated");
        Ok(GatewayReceipt::new(
            Some(feed_id.clone()),
            json!({
                "sku": request.sku,
                "price_cents": request.price_cents,
                "feed_id": feed_id,
                "sandbox_mode": true,
            }),
        ))
    }

    async fn fetch_orders(&self, request: &FetchOrders) -> Result<GatewayReceipt, GatewayError> {
        self.begin_call("fetch_orders").await?;

        let orders = vec![json!({
            "order_id": sandbox_id("ORDER"),
            "purchase_date": Utc::now(),
            "order_status": "Shipped",
            "order_total": {"amount_cents": 9999, "currency_code": "USD"},
            "items": [{
                "sku": "SKU-12345",
                "title": "Sample Product",
                "quantity": 1,
                "item_price": {"amount_cents": 9999, "currency_code": "USD"},
            }],
        })];

        info!(count = orders.len(), "sandbox: orders fetched");
        Ok(GatewayReceipt::new(
            None,
            json!({
                "orders": orders,
                "count": orders.len(),
                "created_after": request.created_after,
                "sandbox_mode": true,
            }),
        ))
    }
}
