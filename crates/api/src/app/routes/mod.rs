use axum::{
    routing::{get, post},
    Router,
};

pub mod dead_letters;
pub mod operations;
pub mod system;

/// Router for the `/sync` endpoints.
pub fn router() -> Router {
    Router::new()
        .nest("/operations", operations::router())
        .nest("/dead-letters", dead_letters::router())
        .route("/stats", get(system::stats))
        .route("/sweep", post(system::sweep))
}
