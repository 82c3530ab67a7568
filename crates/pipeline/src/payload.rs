//! Kind-specific request payloads.
//!
//! The payload enum is the only way to describe work for the pipeline, so the
//! operation kind always follows from the variant.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use marketsync_core::{DomainError, DomainResult};

use crate::operation::OperationKind;

const MAX_TITLE_LEN: usize = 200;
const MAX_SKU_LEN: usize = 40;

/// Publish a new product listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateListing {
    pub title: String,
    /// Price in smallest currency unit (cents).
    pub price_cents: u64,
    pub quantity: u32,
    pub category: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brand: Option<String>,
    /// Seller-chosen SKU. Derived from the subject reference when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sku: Option<String>,
}

/// Set the available quantity of an existing listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateInventory {
    pub sku: String,
    pub quantity: u32,
}

/// Change the price of an existing listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdatePrice {
    pub sku: String,
    pub price_cents: u64,
}

/// Pull marketplace orders.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchOrders {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_after: Option<DateTime<Utc>>,
}

/// Typed request payload; one variant per [`OperationKind`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OperationPayload {
    CreateListing(CreateListing),
    UpdateInventory(UpdateInventory),
    UpdatePrice(UpdatePrice),
    FetchOrders(FetchOrders),
}

impl OperationPayload {
    pub fn kind(&self) -> OperationKind {
        match self {
            OperationPayload::CreateListing(_) => OperationKind::CreateListing,
            OperationPayload::UpdateInventory(_) => OperationKind::UpdateInventory,
            OperationPayload::UpdatePrice(_) => OperationKind::UpdatePrice,
            OperationPayload::FetchOrders(_) => OperationKind::FetchOrders,
        }
    }

    /// Reject malformed payloads before anything is recorded or dispatched.
    pub fn validate(&self) -> DomainResult<()> {
        match self {
            OperationPayload::CreateListing(p) => {
                non_empty("title", &p.title, MAX_TITLE_LEN)?;
                non_empty("category", &p.category, MAX_TITLE_LEN)?;
                if p.price_cents == 0 {
                    return Err(DomainError::field("price_cents", "must be positive"));
                }
                if let Some(sku) = &p.sku {
                    non_empty("sku", sku, MAX_SKU_LEN)?;
                }
                Ok(())
            }
            OperationPayload::UpdateInventory(p) => non_empty("sku", &p.sku, MAX_SKU_LEN),
            OperationPayload::UpdatePrice(p) => {
                non_empty("sku", &p.sku, MAX_SKU_LEN)?;
                if p.price_cents == 0 {
                    return Err(DomainError::field("price_cents", "must be positive"));
                }
                Ok(())
            }
            OperationPayload::FetchOrders(_) => Ok(()),
        }
    }

    pub fn to_value(&self) -> DomainResult<JsonValue> {
        serde_json::to_value(self)
            .map_err(|e| DomainError::validation(format!("payload is not serializable: {e}")))
    }

    pub fn from_value(value: &JsonValue) -> DomainResult<Self> {
        serde_json::from_value(value.clone())
            .map_err(|e| DomainError::validation(format!("stored payload is malformed: {e}")))
    }
}

/// Caller input to `submit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitRequest {
    #[serde(default)]
    pub subject_ref: Option<String>,
    pub payload: OperationPayload,
}

impl SubmitRequest {
    pub fn new(subject_ref: Option<String>, payload: OperationPayload) -> Self {
        Self {
            subject_ref,
            payload,
        }
    }

    /// Validate and fill in derived fields. The result is what gets stored as
    /// the record's request payload.
    pub fn normalize(mut self) -> DomainResult<Self> {
        if let OperationPayload::CreateListing(listing) = &mut self.payload {
            if listing.sku.is_none() {
                let subject = self.subject_ref.as_deref().ok_or_else(|| {
                    DomainError::validation("create_listing needs a sku or a subject_ref")
                })?;
                listing.sku = Some(derive_sku(subject));
            }
        }
        self.payload.validate()?;
        Ok(self)
    }
}

/// `SKU-` followed by the first eight characters of the subject reference.
pub fn derive_sku(subject_ref: &str) -> String {
    let prefix: String = subject_ref.chars().take(8).collect();
    format!("SKU-{prefix}")
}

fn non_empty(field: &str, value: &str, max_len: usize) -> DomainResult<()> {
    if value.trim().is_empty() {
        return Err(DomainError::field(field, "must not be empty"));
    }
    if value.chars().count() > max_len {
        return Err(DomainError::field(
            field,
            format_args!("must be at most {max_len} characters"),
        ));
    }
    Ok(())
}
