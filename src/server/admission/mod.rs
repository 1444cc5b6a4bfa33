pub mod handlers;
pub mod routes;

use json_patch::{Patch, PatchOperation, ReplaceOperation};
use k8s_openapi::api::core::v1::Pod;
use kube::core::{
    admission::{AdmissionRequest, AdmissionResponse, AdmissionReview},
    DynamicObject,
};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::server::error::ServerError;
use crate::server::metrics::WebhookMetrics;
use crate::server::mutation::{self, ContainerEdit};
use crate::server::settings::DecodeFailurePolicy;
use crate::server::transform::ContainerTransformer;

/// AdmissionReview versions the webhook answers
pub const SUPPORTED_VERSIONS: [&str; 2] = ["admission.k8s.io/v1", "admission.k8s.io/v1beta1"];

/// Result of admitting one request, before it is wrapped in a review
#[derive(Debug, Clone, PartialEq)]
pub struct AdmissionOutcome {
    pub allowed: bool,
    /// Present only when at least one image changes
    pub patch: Option<Patch>,
    pub message: Option<String>,
}

impl AdmissionOutcome {
    /// Admit without changes
    pub fn allow() -> Self {
        Self {
            allowed: true,
            patch: None,
            message: None,
        }
    }

    /// Reject with a human-readable reason
    pub fn deny(message: impl Into<String>) -> Self {
        Self {
            allowed: false,
            patch: None,
            message: Some(message.into()),
        }
    }

    /// Admit with image replacements, in edit order
    ///
    /// An empty edit list yields no patch at all.
    pub fn patched(edits: &[ContainerEdit]) -> Self {
        if edits.is_empty() {
            return Self::allow();
        }
        let operations = edits
            .iter()
            .map(|edit| {
                PatchOperation::Replace(ReplaceOperation {
                    path: edit.path(),
                    value: Value::String(edit.image.clone()),
                })
            })
            .collect();
        Self {
            allowed: true,
            patch: Some(Patch(operations)),
            message: None,
        }
    }

    /// Label used when counting answered requests
    pub fn decision(&self) -> &'static str {
        match (self.allowed, &self.patch) {
            (false, _) => "denied",
            (true, Some(_)) => "patched",
            (true, None) => "allowed",
        }
    }

    /// Encode the outcome as the response to `request`
    pub fn into_response(self, request: &AdmissionRequest<DynamicObject>) -> AdmissionResponse {
        let response = AdmissionResponse::from(request);
        if !self.allowed {
            return response.deny(self.message.unwrap_or_default());
        }
        match self.patch {
            Some(patch) => response.with_patch(patch).unwrap_or_else(|e| {
                AdmissionResponse::from(request).deny(format!("failed to encode patch: {}", e))
            }),
            None => response,
        }
    }
}

/// Admission adapter binding the mutation handler to the process-wide transformer
pub struct AdmissionHandler {
    transformer: Arc<dyn ContainerTransformer>,
    decode_failure: DecodeFailurePolicy,
    metrics: Arc<WebhookMetrics>,
}

impl AdmissionHandler {
    pub fn new(
        transformer: Arc<dyn ContainerTransformer>,
        decode_failure: DecodeFailurePolicy,
        metrics: Arc<WebhookMetrics>,
    ) -> Self {
        Self {
            transformer,
            decode_failure,
            metrics,
        }
    }

    /// Answer an AdmissionReview, echoing its apiVersion and request UID
    pub async fn review(
        &self,
        review: AdmissionReview<DynamicObject>,
    ) -> Result<AdmissionReview<DynamicObject>, ServerError> {
        let api_version = review.types.api_version.clone();
        let request: AdmissionRequest<DynamicObject> = review.try_into().map_err(|e| {
            ServerError::bad_request(format!("Invalid AdmissionReview: {}", e))
                .with_context("api_version", api_version.clone())
        })?;

        let outcome = if SUPPORTED_VERSIONS.contains(&api_version.as_str()) {
            self.admit(&request).await
        } else {
            AdmissionOutcome::deny(format!(
                "unsupported AdmissionReview version {:?}, expected one of {:?}",
                api_version, SUPPORTED_VERSIONS
            ))
        };

        self.metrics.record_admission(outcome.decision());
        Ok(outcome.into_response(&request).into_review())
    }

    /// Decide the outcome for a single admission request
    pub async fn admit(&self, request: &AdmissionRequest<DynamicObject>) -> AdmissionOutcome {
        let namespace = request.namespace.as_deref().unwrap_or_default();
        let name = request.name.as_str();

        if request.kind.kind != "Pod" {
            debug!(
                uid = %request.uid,
                kind = %request.kind.kind,
                "Ignoring admission request for non-Pod resource"
            );
            return AdmissionOutcome::allow();
        }

        let pod = match &request.object {
            Some(object) => serde_json::to_value(object)
                .and_then(serde_json::from_value::<Pod>)
                .map_err(|e| format!("failed to decode pod: {}", e)),
            None => Err("admission request carries no object".to_string()),
        };
        let pod = match pod {
            Ok(pod) => pod,
            Err(reason) => return self.decode_failure(request, reason),
        };

        match mutation::mutate(&pod, self.transformer.as_ref()).await {
            Ok(edits) => {
                info!(
                    uid = %request.uid,
                    namespace,
                    name,
                    operation = ?request.operation,
                    edits = edits.len(),
                    "Admitted pod"
                );
                for edit in &edits {
                    debug!(
                        uid = %request.uid,
                        container = %edit.container,
                        path = %edit.path(),
                        image = %edit.image,
                        "Replacing container image"
                    );
                }
                self.metrics.record_rewrites(edits.len());
                AdmissionOutcome::patched(&edits)
            }
            Err(e) => {
                warn!(
                    uid = %request.uid,
                    namespace,
                    name,
                    error = %e,
                    "Denied pod with invalid image"
                );
                AdmissionOutcome::deny(e.to_string())
            }
        }
    }

    fn decode_failure(
        &self,
        request: &AdmissionRequest<DynamicObject>,
        reason: String,
    ) -> AdmissionOutcome {
        warn!(
            uid = %request.uid,
            policy = ?self.decode_failure,
            reason = %reason,
            "Could not decode admission request"
        );
        match self.decode_failure {
            DecodeFailurePolicy::Deny => AdmissionOutcome::deny(reason),
            DecodeFailurePolicy::Allow => AdmissionOutcome::allow(),
        }
    }
}
