use crate::server::error::ServerError;
use crate::server::state::AppState;
use axum::{body::Bytes, extract::State, Json};
use kube::core::{admission::AdmissionReview, DynamicObject};

/// Mutate a pod admission request
///
/// The body is parsed by hand so that malformed reviews get a JSON error body
/// instead of axum's plain-text rejection.
pub async fn mutate_pod(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<AdmissionReview<DynamicObject>>, ServerError> {
    let review: AdmissionReview<DynamicObject> = serde_json::from_slice(&body).map_err(|e| {
        ServerError::bad_request(format!("Invalid AdmissionReview: {}", e))
            .with_context("body_len", body.len().to_string())
    })?;

    let response = state.admission.review(review).await?;
    Ok(Json(response))
}
