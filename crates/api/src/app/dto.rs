use serde::Deserialize;

use marketsync_pipeline::{
    EarlyRetry, OperationFilter, OperationKind, OperationState, Pagination,
};

use crate::app::errors;

// -------------------------
// Query DTOs
// -------------------------

#[derive(Debug, Default, Deserialize)]
pub struct ListOperationsQuery {
    pub state: Option<String>,
    pub kind: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

impl ListOperationsQuery {
    pub fn filter(&self) -> Result<OperationFilter, axum::response::Response> {
        Ok(OperationFilter {
            state: self
                .state
                .as_deref()
                .map(str::parse::<OperationState>)
                .transpose()
                .map_err(|e| errors::json_error(axum::http::StatusCode::BAD_REQUEST, "invalid_state", e.to_string()))?,
            kind: self
                .kind
                .as_deref()
                .map(str::parse::<OperationKind>)
                .transpose()
                .map_err(|e| errors::json_error(axum::http::StatusCode::BAD_REQUEST, "invalid_kind", e.to_string()))?,
        })
    }

    pub fn pagination(&self) -> Pagination {
        Pagination::new(self.limit, self.offset)
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct PageQuery {
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

impl PageQuery {
    pub fn pagination(&self) -> Pagination {
        Pagination::new(self.limit, self.offset)
    }
}

/// `?early=defer` overrides the configured early-retry policy.
#[derive(Debug, Default, Deserialize)]
pub struct RetryQuery {
    pub early: Option<EarlyRetry>,
}
