//! Upload API Server

use crate::staging::StagingError;
use crate::{GateError, StagedFile, UploadGate};
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Multipart field carrying the upload
pub const FILE_FIELD: &str = "file";

/// Multipart framing allowance on top of the upload limit
const MULTIPART_OVERHEAD: u64 = 64 * 1024;

/// Start the API server
pub async fn start_server(gate: Arc<UploadGate>) -> Result<(), GateError> {
    let addr = gate.config().listen_addr.clone();
    let app = router(gate);

    tracing::info!("Upload API listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| GateError::Network(e.to_string()))?;

    axum::serve(listener, app)
        .await
        .map_err(|e| GateError::Network(e.to_string()))
}

/// Build the API router
pub fn router(gate: Arc<UploadGate>) -> Router {
    let body_limit = gate.config().max_upload_bytes.saturating_add(MULTIPART_OVERHEAD);

    Router::new()
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/upload", post(upload))
        .layer(DefaultBodyLimit::max(usize::try_from(body_limit).unwrap_or(usize::MAX)))
        .layer(TraceLayer::new_for_http())
        .with_state(gate)
}

/// Upload result returned to clients
#[derive(Debug, Serialize, Deserialize)]
pub struct UploadResponse {
    /// Client-safe message
    pub message: String,
    /// Machine-readable reason, omitted on success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    timestamp: String,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".into(),
        version: env!("CARGO_PKG_VERSION").into(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

async fn stats(State(gate): State<Arc<UploadGate>>) -> impl IntoResponse {
    Json(gate.stats())
}

async fn upload(State(gate): State<Arc<UploadGate>>, multipart: Multipart) -> Response {
    let staged = match receive_upload(&gate, multipart).await {
        Ok(staged) => staged,
        Err(e) => return e.into_response(),
    };

    match gate.admit(staged).await {
        Ok(admission) if admission.verdict.is_accepted() => reply(StatusCode::OK, admission.verdict.message, None),
        Ok(admission) => {
            let reason = admission.verdict.reason.map(|r| r.as_str().to_string());
            reply(StatusCode::FORBIDDEN, admission.verdict.message, reason)
        }
        Err(e) => ApiError::from(e).into_response(),
    }
}

/// Stream the `file` field into the staging area.
///
/// Returns only once the whole upload was received; a truncated or aborted
/// upload leaves nothing behind.
async fn receive_upload(gate: &UploadGate, mut multipart: Multipart) -> Result<StagedFile, ApiError> {
    while let Some(mut field) = multipart.next_field().await.map_err(ApiError::multipart)? {
        if field.name() != Some(FILE_FIELD) {
            continue;
        }

        let filename = field
            .file_name()
            .map(str::to_string)
            .ok_or_else(|| GateError::Request("file field has no filename".into()))?;

        let mut writer = gate.staging().begin(&filename).await.map_err(GateError::from)?;
        while let Some(chunk) = field.chunk().await.map_err(ApiError::multipart)? {
            writer.write_chunk(&chunk).await.map_err(GateError::from)?;
        }
        let staged = writer.finish().await.map_err(GateError::from)?;

        tracing::info!(file = %staged.original_filename(), size = staged.size_bytes(), "Upload received");
        return Ok(staged);
    }

    Err(GateError::Request("missing file field".into()).into())
}

fn reply(status: StatusCode, message: impl Into<String>, reason: Option<String>) -> Response {
    (status, Json(UploadResponse { message: message.into(), reason })).into_response()
}

/// Error reply; carries only client-safe text
#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
    reason: Option<String>,
}

impl ApiError {
    fn multipart(e: axum::extract::multipart::MultipartError) -> Self {
        tracing::warn!("Upload aborted: {}", e);
        let status = e.status();
        let (message, reason) = if status == StatusCode::PAYLOAD_TOO_LARGE {
            ("File is too large", "too_large")
        } else {
            ("Upload was not fully received", "bad_request")
        };
        Self {
            status,
            message: message.into(),
            reason: Some(reason.into()),
        }
    }
}

impl From<GateError> for ApiError {
    fn from(e: GateError) -> Self {
        let (status, message, reason) = match &e {
            GateError::Config(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Upload policy is unavailable",
                "config_error",
            ),
            GateError::Request(_) => (StatusCode::BAD_REQUEST, "Malformed upload request", "bad_request"),
            GateError::Network(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error", "internal"),
            GateError::Staging(StagingError::InvalidFilename(_)) => {
                (StatusCode::BAD_REQUEST, "Invalid filename", "bad_request")
            }
            GateError::Staging(StagingError::TooLarge { .. }) => {
                (StatusCode::PAYLOAD_TOO_LARGE, "File is too large", "too_large")
            }
            GateError::Staging(StagingError::DestinationExists(_)) => {
                (StatusCode::CONFLICT, "A file with this name already exists", "conflict")
            }
            GateError::Staging(StagingError::Io(_)) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal storage error", "io_error")
            }
        };

        if status.is_server_error() {
            tracing::error!("Upload failed: {}", e);
        } else {
            tracing::warn!("Upload refused: {}", e);
        }

        Self {
            status,
            message: message.into(),
            reason: Some(reason.into()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        reply(self.status, self.message, self.reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GateConfig;
    use crate::inspect::fake::{FakeInspector, FakeSet};
    use crate::inspect::StageKind;
    use axum_test::multipart::{MultipartForm, Part};
    use axum_test::TestServer;
    use std::path::Path;

    const RULES: &str = r#"{
        "allowed_files": [
            { "extension": ".pdf", "description": "PDF document", "strings": ["/Catalog"] },
            { "extension": ".png", "description": "PNG image", "strings": [] }
        ],
        "forbidden_keywords": ["ELF executable", "Zip archive"]
    }"#;

    struct Harness {
        dir: tempfile::TempDir,
        server: TestServer,
    }

    impl Harness {
        async fn new(fakes: &FakeSet, rules: Option<&str>) -> Self {
            Self::with_limit(fakes, rules, 1024 * 1024).await
        }

        async fn with_limit(fakes: &FakeSet, rules: Option<&str>, max_upload_bytes: u64) -> Self {
            let dir = tempfile::tempdir().unwrap();
            if let Some(rules) = rules {
                std::fs::write(dir.path().join("rules.json"), rules).unwrap();
            }

            let config = GateConfig {
                policy_path: dir.path().join("rules.json"),
                staging_dir: dir.path().join("staging"),
                destination_dir: dir.path().join("files"),
                max_upload_bytes,
                ..GateConfig::default()
            };
            let gate = UploadGate::with_capabilities(config, fakes.capabilities());
            gate.init().await.unwrap();

            let server = TestServer::new(router(Arc::new(gate))).unwrap();
            Self { dir, server }
        }

        fn files(&self, sub: &str) -> Vec<String> {
            let mut names: Vec<_> = std::fs::read_dir(self.dir.path().join(sub))
                .unwrap()
                .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
                .collect();
            names.sort();
            names
        }

        fn root(&self) -> &Path {
            self.dir.path()
        }

        async fn upload(&self, name: &str, data: &[u8]) -> (StatusCode, UploadResponse) {
            let form = MultipartForm::new().add_part(FILE_FIELD, Part::bytes(data.to_vec()).file_name(name));
            let response = self.server.post("/upload").multipart(form).await;
            (response.status_code(), response.json::<UploadResponse>())
        }
    }

    fn png_fakes() -> FakeSet {
        let mut fakes = FakeSet::clean_pdf();
        fakes.content = FakeInspector::output(StageKind::ContentCheck, "PNG image data, 800 x 600, 8-bit/color RGBA");
        fakes
    }

    #[tokio::test]
    async fn test_accepted_upload_is_stored() {
        let harness = Harness::new(&FakeSet::clean_pdf(), Some(RULES)).await;

        let (status, body) = harness.upload("report.pdf", b"%PDF-1.4 /Catalog").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.message, "File uploaded successfully");
        assert!(body.reason.is_none());

        assert_eq!(harness.files("files"), vec!["report.pdf".to_string()]);
        assert_eq!(
            std::fs::read(harness.root().join("files/report.pdf")).unwrap(),
            b"%PDF-1.4 /Catalog"
        );
        assert!(harness.files("staging").is_empty());
    }

    #[tokio::test]
    async fn test_forbidden_extension() {
        let fakes = FakeSet::clean_pdf();
        let harness = Harness::new(&fakes, Some(RULES)).await;

        let (status, body) = harness.upload("payload.exe", b"%PDF-1.4").await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body.message, "File extension is not allowed");
        assert_eq!(body.reason.as_deref(), Some("extension_not_allowed"));
        assert!(harness.files("files").is_empty());
        assert!(harness.files("staging").is_empty());
        assert_eq!(fakes.content.calls(), 0);
    }

    #[tokio::test]
    async fn test_hidden_elf_in_png_rejected() {
        let mut fakes = png_fakes();
        fakes.embedded = FakeInspector::output(
            StageKind::MetadataCheck,
            "0 0x0 PNG image\n2048 0x800 ELF executable, 64-bit LSB",
        );
        let harness = Harness::new(&fakes, Some(RULES)).await;

        let (status, body) = harness.upload("image.png", b"\x89PNG").await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body.reason.as_deref(), Some("forbidden_content_detected"));
        assert!(!body.message.contains("ELF"));
        assert!(harness.files("files").is_empty());
        assert!(harness.files("staging").is_empty());
    }

    #[tokio::test]
    async fn test_scanner_failure_is_rejection() {
        let mut fakes = FakeSet::clean_pdf();
        fakes.antivirus = FakeInspector::erroring(StageKind::AntivirusCheck);
        let harness = Harness::new(&fakes, Some(RULES)).await;

        let (status, body) = harness.upload("report.pdf", b"%PDF").await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body.reason.as_deref(), Some("scan_error"));
        assert!(harness.files("files").is_empty());
    }

    #[tokio::test]
    async fn test_missing_policy_fails_closed() {
        let fakes = FakeSet::clean_pdf();
        let harness = Harness::new(&fakes, None).await;

        let (status, body) = harness.upload("report.pdf", b"%PDF").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body.reason.as_deref(), Some("config_error"));
        assert!(harness.files("files").is_empty());
        assert!(harness.files("staging").is_empty());
        assert_eq!(fakes.content.calls(), 0);
    }

    #[tokio::test]
    async fn test_missing_file_field() {
        let harness = Harness::new(&FakeSet::clean_pdf(), Some(RULES)).await;

        let form = MultipartForm::new().add_text("comment", "no file here");
        let response = harness.server.post("/upload").multipart(form).await;
        assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_path_in_filename_is_stripped() {
        let harness = Harness::new(&FakeSet::clean_pdf(), Some(RULES)).await;

        let (status, _) = harness.upload("../../outside.pdf", b"%PDF").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(harness.files("files"), vec!["outside.pdf".to_string()]);
    }

    #[tokio::test]
    async fn test_name_collision_rejected_by_default() {
        let harness = Harness::new(&FakeSet::clean_pdf(), Some(RULES)).await;

        let (status, _) = harness.upload("report.pdf", b"first").await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = harness.upload("report.pdf", b"second").await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body.reason.as_deref(), Some("conflict"));
        assert_eq!(std::fs::read(harness.root().join("files/report.pdf")).unwrap(), b"first");
        assert!(harness.files("staging").is_empty());
    }

    #[tokio::test]
    async fn test_oversize_upload() {
        let harness = Harness::with_limit(&FakeSet::clean_pdf(), Some(RULES), 16).await;

        let (status, body) = harness.upload("report.pdf", &[b'A'; 64]).await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(body.reason.as_deref(), Some("too_large"));
        assert!(harness.files("staging").is_empty());
    }

    #[tokio::test]
    async fn test_body_over_transport_limit() {
        let harness = Harness::with_limit(&FakeSet::clean_pdf(), Some(RULES), 16).await;

        // The file itself is small; a preceding field pushes the body over
        let padding = "A".repeat(MULTIPART_OVERHEAD as usize + 1024);
        let form = MultipartForm::new()
            .add_text("comment", padding)
            .add_part(FILE_FIELD, Part::bytes(b"%PDF".to_vec()).file_name("report.pdf"));
        let response = harness.server.post("/upload").multipart(form).await;
        let status = response.status_code();
        let body = response.json::<UploadResponse>();
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(body.message, "File is too large");
        assert_eq!(body.reason.as_deref(), Some("too_large"));
        assert!(harness.files("staging").is_empty());
        assert!(harness.files("files").is_empty());
    }

    #[tokio::test]
    async fn test_stats_and_health() {
        let harness = Harness::new(&FakeSet::clean_pdf(), Some(RULES)).await;
        harness.upload("report.pdf", b"%PDF").await;
        harness.upload("script.sh", b"#!/bin/sh").await;

        let stats: serde_json::Value = harness.server.get("/stats").await.json();
        assert_eq!(stats["processed"], 2);
        assert_eq!(stats["accepted"], 1);
        assert_eq!(stats["rejected"]["extension_not_allowed"], 1);

        let health = harness.server.get("/health").await;
        assert_eq!(health.status_code(), StatusCode::OK);
    }
}
