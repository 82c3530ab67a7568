//! `marketsync-pipeline`: delivery pipeline for marketplace operations.
//!
//! Operations are recorded in an [`OperationLog`], dispatched through a
//! [`MarketplaceGateway`], retried with exponential backoff by the
//! [`RetryScheduler`], and quarantined in a [`DeadLetterStore`] once their
//! retry budget is spent. [`PipelineCoordinator`] ties these together.

pub mod config;
pub mod coordinator;
pub mod dead_letter;
pub mod error;
pub mod gateway;
pub mod log;
pub mod operation;
pub mod payload;
pub mod retry;
pub mod stats;
pub mod sweeper;


pub use config::{GatewayConfig, PipelineConfig};
pub use coordinator::{EarlyRetry, PipelineCoordinator, STUCK_ATTEMPT_DETAIL};
pub use dead_letter::{DeadLetterEntry, DeadLetterStore, InMemoryDeadLetterStore, PostgresDeadLetterStore};
pub use error::{PipelineError, StoreError};
pub use gateway::{
    FailureClass, GatewayError, GatewayReceipt, MarketplaceGateway, SandboxGateway, TimeoutGateway,
};
pub use log::{InMemoryOperationLog, OperationLog, PostgresOperationLog};
pub use operation::{OperationFilter, OperationKind, OperationRecord, OperationState, Pagination};
pub use payload::{CreateListing, FetchOrders, OperationPayload, SubmitRequest, UpdateInventory, UpdatePrice};
pub use retry::{RetryDecision, RetryScheduler};
pub use stats::{PipelineStats, WindowStats};
pub use sweeper::{RetrySweeper, SweepReport, SweepStats, SweeperConfig, SweeperHandle};

pub use marketsync_core::{DeadLetterId, OperationId};
