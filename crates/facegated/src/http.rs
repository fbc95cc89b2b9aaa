//! HTTP surface: thin JSON/base64 plumbing over the engine.
//!
//! Soft pipeline outcomes all answer 200 with a distinguishing status and
//! message; only malformed requests (400) and genuine system faults (500,
//! generic message) use error codes. Registration answers 201 on success.

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine as _;
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use facegate_core::matcher;
use facegate_gallery::{Gallery, RepresentationCache};

use crate::engine::{EngineHandle, RegisterOutcome, RegisterRejection, VerifyOutcome};

/// Shared state behind every route.
pub struct AppState {
    pub engine: EngineHandle,
    pub gallery: Arc<dyn Gallery>,
    pub cache: Arc<RepresentationCache>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/register", post(register))
        .route("/verify", post(verify))
        .route("/identities", get(identities))
        .route("/health", get(health))
        .with_state(state)
}

#[derive(Deserialize)]
struct RegisterRequest {
    name: String,
    /// Base64-encoded JPEG or PNG bytes.
    image: String,
}

#[derive(Deserialize)]
struct VerifyRequest {
    image: String,
}

#[derive(Serialize)]
struct StatusResponse {
    status: &'static str,
    message: String,
}

#[derive(Serialize)]
struct VerifyResponse {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    similarity: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

/// Decode a base64 image payload into RGB pixels.
fn decode_image(payload: &str) -> Result<RgbImage, String> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(payload)
        .map_err(|e| format!("invalid base64 image data: {e}"))?;
    let decoded =
        image::load_from_memory(&bytes).map_err(|e| format!("undecodable image: {e}"))?;
    Ok(decoded.to_rgb8())
}

fn bad_request(message: String) -> (StatusCode, Json<StatusResponse>) {
    (
        StatusCode::BAD_REQUEST,
        Json(StatusResponse { status: "Error", message }),
    )
}

fn internal_error() -> (StatusCode, Json<StatusResponse>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(StatusResponse {
            status: "Error",
            message: "an internal server error occurred".to_string(),
        }),
    )
}

async fn register(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<RegisterRequest>, JsonRejection>,
) -> (StatusCode, Json<StatusResponse>) {
    let Json(request) = match payload {
        Ok(json) => json,
        Err(rejection) => return bad_request(format!("malformed request: {rejection}")),
    };

    let image = match decode_image(&request.image) {
        Ok(image) => image,
        Err(message) => return bad_request(message),
    };

    match state.engine.register(request.name.clone(), image).await {
        Ok(RegisterOutcome::Registered { name }) => (
            StatusCode::CREATED,
            Json(StatusResponse {
                status: "Success",
                message: format!("identity '{name}' registered"),
            }),
        ),
        Ok(RegisterOutcome::Rejected(RegisterRejection::InvalidName)) => bad_request(
            "invalid name: use only letters, numbers, underscores or hyphens".to_string(),
        ),
        Ok(RegisterOutcome::Rejected(RegisterRejection::AlreadyExists)) => {
            bad_request(format!("identity '{}' already exists", request.name))
        }
        // Soft rejection: the request was well-formed, the image just did
        // not contain an enrollable face.
        Ok(RegisterOutcome::Rejected(RegisterRejection::NoClearFace)) => (
            StatusCode::OK,
            Json(StatusResponse {
                status: "Error",
                message: "no clear face detected; please provide a better image"
                    .to_string(),
            }),
        ),
        Err(e) => {
            tracing::error!(error = %e, identity = %request.name, "registration failed");
            internal_error()
        }
    }
}

async fn verify(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<VerifyRequest>, JsonRejection>,
) -> (StatusCode, Json<VerifyResponse>) {
    let Json(request) = match payload {
        Ok(json) => json,
        Err(rejection) => {
            return (
                StatusCode::BAD_REQUEST,
                error_verify(format!("malformed request: {rejection}")),
            )
        }
    };

    let image = match decode_image(&request.image) {
        Ok(image) => image,
        Err(message) => return (StatusCode::BAD_REQUEST, error_verify(message)),
    };

    match state.engine.verify(image).await {
        Ok(outcome) => (StatusCode::OK, verify_response(outcome)),
        Err(e) => {
            tracing::error!(error = %e, "verification failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                error_verify("an internal server error occurred".to_string()),
            )
        }
    }
}

fn error_verify(message: String) -> Json<VerifyResponse> {
    Json(VerifyResponse {
        status: "Error",
        id: None,
        similarity: None,
        message: Some(message),
    })
}

fn verify_response(outcome: VerifyOutcome) -> Json<VerifyResponse> {
    let response = match outcome {
        VerifyOutcome::Verified { identity, similarity_percent } => VerifyResponse {
            status: "Verified",
            id: Some(identity),
            similarity: Some(matcher::format_similarity(similarity_percent)),
            message: None,
        },
        VerifyOutcome::Unverified { similarity_percent } => VerifyResponse {
            status: "Unverified",
            id: None,
            similarity: Some(matcher::format_similarity(similarity_percent)),
            message: Some(format!(
                "similarity {} is below the {}% threshold",
                matcher::format_similarity(similarity_percent),
                matcher::SIMILARITY_THRESHOLD_PERCENT
            )),
        },
        VerifyOutcome::UnknownFace => VerifyResponse {
            status: "Unverified",
            id: None,
            similarity: None,
            message: Some("unknown person".to_string()),
        },
        VerifyOutcome::SpoofDetected => VerifyResponse {
            status: "Failed",
            id: None,
            similarity: None,
            message: Some("spoof attempt detected".to_string()),
        },
        VerifyOutcome::NoFace => VerifyResponse {
            status: "Unverified",
            id: None,
            similarity: None,
            message: Some("no face detected".to_string()),
        },
        VerifyOutcome::EmptyGallery => VerifyResponse {
            status: "Unverified",
            id: None,
            similarity: None,
            message: Some("empty database; register an identity first".to_string()),
        },
    };
    Json(response)
}

#[derive(Serialize)]
struct IdentitiesResponse {
    identities: Vec<String>,
    count: usize,
}

async fn identities(
    State(state): State<Arc<AppState>>,
) -> Result<Json<IdentitiesResponse>, (StatusCode, Json<StatusResponse>)> {
    match state.gallery.list_identities() {
        Ok(identities) => {
            let count = identities.len();
            Ok(Json(IdentitiesResponse { identities, count }))
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to list identities");
            Err(internal_error())
        }
    }
}

async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let identities = state.gallery.list_identities().map(|i| i.len()).ok();
    let cache = match state.cache.snapshot() {
        Some(snapshot) => serde_json::json!({
            "state": "ready",
            "references": snapshot.entries.len(),
        }),
        None => serde_json::json!({ "state": "cold" }),
    };

    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "gallery_identities": identities,
        "cache": cache,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testutil::{blue_image, red_image, MockDetector, MockEmbedder};
    use crate::engine::spawn_engine;
    use axum::body::Body;
    use axum::http::Request;
    use facegate_core::Metric;
    use facegate_gallery::DirGallery;
    use http_body_util::BodyExt;
    use std::io::Cursor;
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn encode_png(image: &RgbImage) -> String {
        let mut bytes = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();
        base64::engine::general_purpose::STANDARD.encode(bytes)
    }

    fn test_router(detector: MockDetector) -> (TempDir, Router) {
        let dir = TempDir::new().unwrap();
        let gallery: Arc<dyn Gallery> = Arc::new(DirGallery::new(dir.path()));
        let cache = Arc::new(RepresentationCache::new(
            dir.path(),
            "mock_embedder",
            Metric::Cosine,
        ));
        let engine = spawn_engine(
            Box::new(detector),
            Box::new(MockEmbedder::new()),
            gallery.clone(),
            cache.clone(),
            1024,
        );
        let state = Arc::new(AppState { engine, gallery, cache });
        (dir, router(state))
    }

    async fn send(
        router: &Router,
        method: &str,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                builder = builder.header("content-type", "application/json");
                Body::from(serde_json::to_vec(&json).unwrap())
            }
            None => Body::empty(),
        };
        let response = router
            .clone()
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    #[tokio::test]
    async fn test_register_success_created() {
        let (_dir, router) = test_router(MockDetector::with_face(0.99, Some(true)));
        let (status, body) = send(
            &router,
            "POST",
            "/register",
            Some(serde_json::json!({"name": "alice", "image": encode_png(&red_image())})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["status"], "Success");
    }

    #[tokio::test]
    async fn test_register_invalid_name_bad_request() {
        let (_dir, router) = test_router(MockDetector::with_face(0.99, None));
        let (status, body) = send(
            &router,
            "POST",
            "/register",
            Some(serde_json::json!({"name": "bad name!", "image": encode_png(&red_image())})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["status"], "Error");
    }

    #[tokio::test]
    async fn test_register_duplicate_bad_request() {
        let (_dir, router) = test_router(MockDetector::with_face(0.99, None));
        let payload =
            serde_json::json!({"name": "alice", "image": encode_png(&red_image())});
        let (first, _) = send(&router, "POST", "/register", Some(payload.clone())).await;
        assert_eq!(first, StatusCode::CREATED);

        let (second, body) = send(&router, "POST", "/register", Some(payload)).await;
        assert_eq!(second, StatusCode::BAD_REQUEST);
        assert!(body["message"].as_str().unwrap().contains("already exists"));
    }

    #[tokio::test]
    async fn test_register_no_clear_face_soft_ok() {
        let (_dir, router) = test_router(MockDetector::with_face(0.90, None));
        let (status, body) = send(
            &router,
            "POST",
            "/register",
            Some(serde_json::json!({"name": "alice", "image": encode_png(&red_image())})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "Error");
        assert!(body["message"].as_str().unwrap().contains("no clear face"));
    }

    #[tokio::test]
    async fn test_register_bad_base64_bad_request() {
        let (_dir, router) = test_router(MockDetector::with_face(0.99, None));
        let (status, _) = send(
            &router,
            "POST",
            "/register",
            Some(serde_json::json!({"name": "alice", "image": "@@not-base64@@"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_register_missing_field_bad_request() {
        let (_dir, router) = test_router(MockDetector::with_face(0.99, None));
        let (status, _) = send(
            &router,
            "POST",
            "/register",
            Some(serde_json::json!({"name": "alice"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_verify_empty_gallery_unverified() {
        let (_dir, router) = test_router(MockDetector::with_face(0.99, Some(true)));
        let (status, body) = send(
            &router,
            "POST",
            "/verify",
            Some(serde_json::json!({"image": encode_png(&red_image())})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "Unverified");
        assert!(body["message"].as_str().unwrap().contains("empty database"));
    }

    #[tokio::test]
    async fn test_verify_match_reports_identity_and_similarity() {
        let (_dir, router) = test_router(MockDetector::with_face(0.99, Some(true)));
        send(
            &router,
            "POST",
            "/register",
            Some(serde_json::json!({"name": "alice", "image": encode_png(&red_image())})),
        )
        .await;

        let (status, body) = send(
            &router,
            "POST",
            "/verify",
            Some(serde_json::json!({"image": encode_png(&red_image())})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "Verified");
        assert_eq!(body["id"], "alice");
        assert_eq!(body["similarity"], "100.00%");
    }

    #[tokio::test]
    async fn test_verify_below_threshold_keeps_similarity() {
        let (_dir, router) = test_router(MockDetector::with_face(0.99, Some(true)));
        send(
            &router,
            "POST",
            "/register",
            Some(serde_json::json!({"name": "alice", "image": encode_png(&red_image())})),
        )
        .await;

        let (status, body) = send(
            &router,
            "POST",
            "/verify",
            Some(serde_json::json!({"image": encode_png(&blue_image())})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "Unverified");
        assert_eq!(body["similarity"], "0.00%");
    }

    #[tokio::test]
    async fn test_verify_spoof_is_failed_status() {
        let (_dir, router) = test_router(MockDetector::with_face(0.99, Some(false)));
        send(
            &router,
            "POST",
            "/register",
            Some(serde_json::json!({"name": "alice", "image": encode_png(&red_image())})),
        )
        .await;

        let (status, body) = send(
            &router,
            "POST",
            "/verify",
            Some(serde_json::json!({"image": encode_png(&red_image())})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "Failed");
        assert!(body["message"].as_str().unwrap().contains("spoof"));
    }

    #[tokio::test]
    async fn test_verify_no_face_message() {
        let (dir, router) = test_router(MockDetector::empty());
        // Seed an identity directly so the empty-gallery short circuit does
        // not mask the no-face path.
        std::fs::create_dir(dir.path().join("alice")).unwrap();

        let (status, body) = send(
            &router,
            "POST",
            "/verify",
            Some(serde_json::json!({"image": encode_png(&red_image())})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "Unverified");
        assert!(body["message"].as_str().unwrap().contains("no face"));
    }

    #[tokio::test]
    async fn test_verify_malformed_json_bad_request() {
        let (_dir, router) = test_router(MockDetector::with_face(0.99, Some(true)));
        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/verify")
                    .header("content-type", "application/json")
                    .body(Body::from("{not json"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_identities_listing() {
        let (_dir, router) = test_router(MockDetector::with_face(0.99, None));
        send(
            &router,
            "POST",
            "/register",
            Some(serde_json::json!({"name": "alice", "image": encode_png(&red_image())})),
        )
        .await;

        let (status, body) = send(&router, "GET", "/identities", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 1);
        assert_eq!(body["identities"][0], "alice");
    }

    #[tokio::test]
    async fn test_health_reports_cache_state() {
        let (_dir, router) = test_router(MockDetector::with_face(0.99, Some(true)));
        let (status, body) = send(&router, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["cache"]["state"], "cold");
    }
}
