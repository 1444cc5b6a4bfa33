use super::handlers;
use crate::server::state::AppState;
use axum::{routing::post, Router};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/webhook-v1-pod", post(handlers::mutate_pod))
        .route("/mutate", post(handlers::mutate_pod))
}
