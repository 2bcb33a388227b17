//! AdmissionReview handlers for EmqxCluster
//!
//! Reviews arrive as `DynamicObject` so a malformed spec becomes a denial
//! with a readable message instead of a rejected HTTP body.

use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use kube::{
    api::DynamicObject,
    core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation},
};
use tracing::{debug, error, info, warn};

use emqx_common::crd::EmqxCluster;

use super::defaults::apply_defaults;
use super::validation::validate_admission;

/// Error type for webhook operations
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    /// The admission review body could not be decoded
    #[error("invalid admission review: {0}")]
    InvalidReview(String),
}

impl From<JsonRejection> for WebhookError {
    fn from(rejection: JsonRejection) -> Self {
        WebhookError::InvalidReview(rejection.body_text())
    }
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        let status = match &self {
            WebhookError::InvalidReview(_) => StatusCode::BAD_REQUEST,
        };
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

type ReviewResult = Result<Json<AdmissionReview<DynamicObject>>, WebhookError>;

/// Handle mutating admission reviews
pub async fn mutate_handler(
    body: Result<Json<AdmissionReview<DynamicObject>>, JsonRejection>,
) -> ReviewResult {
    let Json(review) = body?;
    let request: AdmissionRequest<DynamicObject> = match review.try_into() {
        Ok(request) => request,
        Err(e) => {
            error!(error = %e, "failed to parse admission request");
            return Ok(Json(AdmissionResponse::invalid(e.to_string()).into_review()));
        }
    };
    Ok(Json(mutate(&request).into_review()))
}

/// Handle validating admission reviews
pub async fn validate_handler(
    body: Result<Json<AdmissionReview<DynamicObject>>, JsonRejection>,
) -> ReviewResult {
    let Json(review) = body?;
    let request: AdmissionRequest<DynamicObject> = match review.try_into() {
        Ok(request) => request,
        Err(e) => {
            error!(error = %e, "failed to parse admission request");
            return Ok(Json(AdmissionResponse::invalid(e.to_string()).into_review()));
        }
    };
    Ok(Json(validate(&request).into_review()))
}

fn typed(object: &DynamicObject) -> Result<(serde_json::Value, EmqxCluster), serde_json::Error> {
    let raw = serde_json::to_value(object)?;
    let cluster = serde_json::from_value(raw.clone())?;
    Ok((raw, cluster))
}

/// Default an EmqxCluster, answering with a JSON patch
///
/// Defaulting never rejects: any failure is logged and the object is let
/// through unchanged for validation to judge.
pub fn mutate(request: &AdmissionRequest<DynamicObject>) -> AdmissionResponse {
    let response = AdmissionResponse::from(request);
    let Some(object) = &request.object else {
        debug!(uid = %request.uid, "no object in request, allowing unchanged");
        return response;
    };

    let (original, mut cluster) = match typed(object) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!(uid = %request.uid, error = %e, "object is not an EmqxCluster, allowing unchanged");
            return response;
        }
    };

    let creating = matches!(request.operation, Operation::Create);
    if let Err(e) = apply_defaults(&mut cluster, creating) {
        warn!(
            uid = %request.uid,
            cluster = %request.name,
            error = %e,
            "defaulting failed, allowing unchanged"
        );
        return response;
    }

    let mutated = match serde_json::to_value(&cluster) {
        Ok(value) => value,
        Err(e) => {
            error!(uid = %request.uid, error = %e, "failed to serialize defaulted cluster");
            return response;
        }
    };
    let patch = json_patch::diff(&original, &mutated);
    if patch.0.is_empty() {
        return response;
    }

    info!(
        uid = %request.uid,
        cluster = %request.name,
        ops = patch.0.len(),
        "defaulting cluster"
    );
    match response.with_patch(patch) {
        Ok(patched) => patched,
        Err(e) => {
            error!(uid = %request.uid, error = %e, "failed to serialize patch");
            AdmissionResponse::from(request)
        }
    }
}

/// Validate an EmqxCluster admission
pub fn validate(request: &AdmissionRequest<DynamicObject>) -> AdmissionResponse {
    let response = AdmissionResponse::from(request);
    if matches!(request.operation, Operation::Delete) {
        return response;
    }

    let decode = |object: &Option<DynamicObject>| {
        object
            .as_ref()
            .map(|o| typed(o).map(|(_, cluster)| cluster))
            .transpose()
    };
    let (new, old) = match (decode(&request.object), decode(&request.old_object)) {
        (Ok(new), Ok(old)) => (new, old),
        (Err(e), _) | (_, Err(e)) => {
            return response.deny(format!("invalid EmqxCluster: {e}"));
        }
    };

    match validate_admission(&request.operation, old.as_ref(), new.as_ref()) {
        Ok(()) => response,
        Err(e) => {
            info!(uid = %request.uid, cluster = %request.name, error = %e, "admission denied");
            response.deny(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use emqx_common::hocon::ConfigDocument;
    use serde_json::{json, Value};

    fn object(bootstrap: &str, replicas: i32) -> Value {
        json!({
            "apiVersion": "apps.emqx.io/v2alpha1",
            "kind": "EmqxCluster",
            "metadata": { "name": "broker", "namespace": "brokers" },
            "spec": {
                "image": "emqx/emqx:5.1.0",
                "bootstrapConfig": bootstrap,
                "coreTemplate": { "replicas": replicas }
            }
        })
    }

    fn review(operation: &str, object: Option<Value>, old: Option<Value>) -> AdmissionReview<DynamicObject> {
        serde_json::from_value(json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "7f0c5a2e-0000-4000-8000-000000000001",
                "kind": { "group": "apps.emqx.io", "version": "v2alpha1", "kind": "EmqxCluster" },
                "resource": { "group": "apps.emqx.io", "version": "v2alpha1", "resource": "emqxclusters" },
                "name": "broker",
                "namespace": "brokers",
                "operation": operation,
                "userInfo": {},
                "object": object,
                "oldObject": old,
                "dryRun": false
            }
        }))
        .unwrap()
    }

    fn request(operation: &str, object: Option<Value>, old: Option<Value>) -> AdmissionRequest<DynamicObject> {
        review(operation, object, old).try_into().unwrap()
    }

    fn apply_patch(original: &Value, response: &AdmissionResponse) -> Value {
        let patch: json_patch::Patch =
            serde_json::from_slice(response.patch.as_ref().expect("patch present")).unwrap();
        let mut doc = original.clone();
        json_patch::patch(&mut doc, &patch.0).unwrap();
        doc
    }

    mod mutation {
        use super::*;

        /// Story: a cluster is created without any cookie in its bootstrap text
        #[test]
        fn story_create_without_cookie_stores_parseable_config_with_cookie() {
            let original = object("", 3);
            let response = mutate(&request("CREATE", Some(original.clone()), None));

            assert!(response.allowed);
            let stored: EmqxCluster = serde_json::from_value(apply_patch(&original, &response)).unwrap();
            let doc = ConfigDocument::parse(&stored.spec.bootstrap_config).unwrap();
            assert!(doc.get_str("node.cookie").unwrap().len() >= 64);
            assert_eq!(stored.spec.replicant_template.replicas, Some(0));
            assert_eq!(
                stored.spec.core_template.labels.get("apps.emqx.io/db-role").map(String::as_str),
                Some("core")
            );
        }

        #[test]
        fn update_only_stamps_labels() {
            let original = object("", 3);
            let response = mutate(&request("UPDATE", Some(original.clone()), Some(original.clone())));

            let stored: EmqxCluster = serde_json::from_value(apply_patch(&original, &response)).unwrap();
            assert_eq!(stored.spec.bootstrap_config, "");
            assert_eq!(
                stored.metadata.labels.unwrap().get("apps.emqx.io/instance").map(String::as_str),
                Some("broker")
            );
        }

        #[test]
        fn unparseable_bootstrap_is_let_through_unchanged() {
            let response = mutate(&request("CREATE", Some(object("node {", 3)), None));
            assert!(response.allowed);
            assert!(response.patch.is_none());
        }

        #[test]
        fn foreign_object_is_let_through_unchanged() {
            let response = mutate(&request("CREATE", Some(json!({ "metadata": { "name": "x" } })), None));
            assert!(response.allowed);
            assert!(response.patch.is_none());
        }
    }

    mod validating {
        use super::*;

        const BOOTSTRAP: &str = "node {\n  cookie = \"c00kie\"\n}\n";

        /// Story: scaling is accepted, editing one character of bootstrap text is not
        #[test]
        fn story_update_scaling_versus_bootstrap_edit() {
            let old = object(BOOTSTRAP, 3);

            let scaled = validate(&request("UPDATE", Some(object(BOOTSTRAP, 5)), Some(old.clone())));
            assert!(scaled.allowed);

            let edited = BOOTSTRAP.replace("c00kie", "c00kiE");
            let denied = validate(&request("UPDATE", Some(object(&edited, 3)), Some(old)));
            assert!(!denied.allowed);
            assert!(denied.result.message.contains("bootstrap config cannot be updated"));
        }

        #[test]
        fn create_with_bad_bootstrap_is_denied() {
            let response = validate(&request("CREATE", Some(object("node {", 3)), None));
            assert!(!response.allowed);
            assert!(response.result.message.contains("failed to parse bootstrap config"));
        }

        #[test]
        fn delete_is_always_allowed() {
            let response = validate(&request("DELETE", None, Some(object("node {", 3))));
            assert!(response.allowed);
        }

        #[test]
        fn malformed_spec_is_denied() {
            let broken = json!({
                "apiVersion": "apps.emqx.io/v2alpha1",
                "kind": "EmqxCluster",
                "metadata": { "name": "broker" },
                "spec": { "image": 42 }
            });
            let response = validate(&request("CREATE", Some(broken), None));
            assert!(!response.allowed);
            assert!(response.result.message.contains("invalid EmqxCluster"));
        }
    }

    mod endpoints {
        use super::*;

        const BOOTSTRAP_WITH_COOKIE: &str = "node { cookie = \"abc\" }";

        #[tokio::test]
        async fn handler_wraps_response_in_review() {
            let body = review("CREATE", Some(object(BOOTSTRAP_WITH_COOKIE, 3)), None);
            let Json(out) = validate_handler(Ok(Json(body))).await.unwrap();
            let response = out.response.expect("response present");
            assert!(response.allowed);
        }

        #[test]
        fn invalid_review_maps_to_bad_request() {
            let response = WebhookError::InvalidReview("not json".to_string()).into_response();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        }
    }
}
