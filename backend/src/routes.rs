use actix_multipart::Multipart;
use actix_web::http::StatusCode;
use actix_web::{HttpRequest, HttpResponse, ResponseError, web};
use futures::TryStreamExt;
use log::{error, info, warn};
use serde::Deserialize;
use shared::{CategoriesResponse, ErrorResponse, HealthResponse, HistoryResponse};

use crate::inference::classifier::{ClassifyError, Classifier};
use crate::inference::model::ModelHandle;
use crate::storage::history_store::{HistoryError, HistoryStore};
use crate::storage::uploads::{UploadStore, allowed_file, secure_filename};

const IMAGE_FIELD: &str = "image";
const DEFAULT_PAGE_SIZE: usize = 20;
const MAX_PAGE_SIZE: usize = 100;

/// Shared, read-only after startup.
pub struct AppState {
    pub model: ModelHandle,
    pub classifier: Classifier,
    pub uploads: UploadStore,
    pub history: HistoryStore,
    pub max_upload_bytes: usize,
    pub history_pagination: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("No image part")]
    NoFile,
    #[error("No selected file")]
    EmptyFilename,
    #[error("File type not allowed")]
    DisallowedExtension,
    #[error("Model not loaded")]
    ModelUnavailable,
    #[error("Classification failed")]
    ClassificationFailed,
    #[error("Error processing image: {0}")]
    Processing(String),
    #[error("Error retrieving history: {0}")]
    HistoryReadFailed(String),
    #[error("{0}")]
    BadQuery(String),
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::NoFile
            | ApiError::EmptyFilename
            | ApiError::DisallowedExtension
            | ApiError::BadQuery(_) => StatusCode::BAD_REQUEST,
            ApiError::ModelUnavailable
            | ApiError::ClassificationFailed
            | ApiError::Processing(_)
            | ApiError::HistoryReadFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(ErrorResponse {
            error: self.to_string(),
        })
    }
}

impl From<ClassifyError> for ApiError {
    fn from(err: ClassifyError) -> Self {
        match err {
            ClassifyError::ModelUnavailable => ApiError::ModelUnavailable,
            ClassifyError::Preprocess(e) => {
                warn!("Rejected undecodable upload: {}", e);
                ApiError::ClassificationFailed
            }
            other => {
                error!("Error during classification: {}", other);
                ApiError::ClassificationFailed
            }
        }
    }
}

impl From<HistoryError> for ApiError {
    fn from(err: HistoryError) -> Self {
        error!("Failed to read history: {}", err);
        ApiError::HistoryReadFailed(err.to_string())
    }
}

pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/api/classify").route(web::post().to(classify)))
        .service(web::resource("/api/history").route(web::get().to(history)))
        .service(web::resource("/api/categories").route(web::get().to(categories)))
        .service(web::resource("/api/health").route(web::get().to(health)));
}

struct ImageUpload {
    filename: String,
    data: Vec<u8>,
}

/// Finds the first file part named `image`, skipping everything else.
/// A `limit` of zero accepts any size.
async fn read_image_field(payload: &mut Multipart, limit: usize) -> Result<ImageUpload, ApiError> {
    loop {
        let mut field = match payload.try_next().await {
            Ok(Some(field)) => field,
            Ok(None) => return Err(ApiError::NoFile),
            Err(e) => {
                warn!("Unreadable multipart body: {}", e);
                return Err(ApiError::NoFile);
            }
        };

        let disposition = field.content_disposition();
        let name = disposition.and_then(|cd| cd.get_name()).map(str::to_owned);
        let filename = disposition
            .and_then(|cd| cd.get_filename())
            .map(str::to_owned);

        let filename = match (name.as_deref(), filename) {
            (Some(IMAGE_FIELD), Some(filename)) => filename,
            _ => {
                while field
                    .try_next()
                    .await
                    .map_err(|e| ApiError::Processing(e.to_string()))?
                    .is_some()
                {}
                continue;
            }
        };

        let mut data = Vec::new();
        while let Some(chunk) = field
            .try_next()
            .await
            .map_err(|e| ApiError::Processing(e.to_string()))?
        {
            if limit != 0 && data.len() + chunk.len() > limit {
                return Err(ApiError::Processing(format!(
                    "upload exceeds {} bytes",
                    limit
                )));
            }
            data.extend_from_slice(&chunk);
        }
        return Ok(ImageUpload { filename, data });
    }
}

async fn classify(
    state: web::Data<AppState>,
    mut payload: Multipart,
) -> Result<HttpResponse, ApiError> {
    let upload = read_image_field(&mut payload, state.max_upload_bytes).await?;

    if upload.filename.is_empty() {
        warn!("Upload rejected: empty filename");
        return Err(ApiError::EmptyFilename);
    }
    if !allowed_file(&upload.filename) {
        warn!("Upload rejected: {} has a disallowed type", upload.filename);
        return Err(ApiError::DisallowedExtension);
    }
    let filename = secure_filename(&upload.filename);
    if filename.is_empty() {
        warn!("Upload rejected: {:?} sanitizes to nothing", upload.filename);
        return Err(ApiError::EmptyFilename);
    }
    if !allowed_file(&filename) {
        warn!("Upload rejected: {:?} loses its extension when sanitized", upload.filename);
        return Err(ApiError::DisallowedExtension);
    }

    let upload_path = state
        .uploads
        .save(&filename, &upload.data)
        .map_err(|e| {
            error!("Failed to save upload {}: {}", filename, e);
            ApiError::Processing(e.to_string())
        })?;

    if !state.model.is_loaded() {
        error!("Classification requested but the model is not loaded");
        return Err(ApiError::ModelUnavailable);
    }

    let result =
        state
            .classifier
            .classify_file(&state.model, &upload_path, &filename, &state.history)?;

    info!(
        "Classified {} as {} ({:.4})",
        result.filename, result.top_category, result.confidence
    );
    Ok(HttpResponse::Ok().json(result))
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    offset: Option<usize>,
    limit: Option<usize>,
}

async fn history(state: web::Data<AppState>, req: HttpRequest) -> Result<HttpResponse, ApiError> {
    if !state.history_pagination {
        let history = state.history.list_history()?;
        return Ok(HttpResponse::Ok().json(HistoryResponse {
            history,
            total: None,
        }));
    }

    let query = web::Query::<HistoryQuery>::from_query(req.query_string())
        .map_err(|e| ApiError::BadQuery(e.to_string()))?;
    let offset = query.offset.unwrap_or(0);
    let limit = query.limit.unwrap_or(DEFAULT_PAGE_SIZE);
    if !(1..=MAX_PAGE_SIZE).contains(&limit) {
        return Err(ApiError::BadQuery(format!(
            "limit must be between 1 and {}",
            MAX_PAGE_SIZE
        )));
    }

    let page = state.history.list_page(offset, limit)?;
    Ok(HttpResponse::Ok().json(HistoryResponse {
        history: page.entries,
        total: Some(page.total),
    }))
}

async fn categories() -> HttpResponse {
    HttpResponse::Ok().json(CategoriesResponse::all())
}

async fn health(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(HealthResponse {
        status: "ok".to_string(),
        model_loaded: state.model.is_loaded(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HeadMode;
    use crate::inference::preprocess::Normalization;
    use crate::inference::model::testing::{StubEmbedder, stub_handle};
    use actix_web::http::header;
    use actix_web::{App, test};
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use image::{ImageFormat, Rgb, RgbImage};
    use serde_json::Value;
    use std::io::Cursor;

    const BOUNDARY: &str = "----wastetestboundary";

    struct Harness {
        _dir: tempfile::TempDir,
        state: web::Data<AppState>,
    }

    fn harness(model: ModelHandle, history_pagination: bool) -> Harness {
        harness_with_limit(model, history_pagination, 1024 * 1024)
    }

    fn harness_with_limit(
        model: ModelHandle,
        history_pagination: bool,
        max_upload_bytes: usize,
    ) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let uploads = UploadStore::new(dir.path().join("uploads"));
        let history = HistoryStore::new(dir.path().join("history"));
        uploads.ensure_folder().unwrap();
        history.ensure_folder().unwrap();
        let state = web::Data::new(AppState {
            model,
            classifier: Classifier::new(HeadMode::Ephemeral, Normalization::None),
            uploads,
            history,
            max_upload_bytes,
            history_pagination,
        });
        Harness { _dir: dir, state }
    }

    fn png_bytes() -> Vec<u8> {
        let img = RgbImage::from_fn(40, 30, |x, y| Rgb([(x * 6) as u8, (y * 8) as u8, 90]));
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, ImageFormat::Png).unwrap();
        buf.into_inner()
    }

    fn multipart_body(field: &str, filename: Option<&str>, data: &[u8]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
        match filename {
            Some(filename) => body.extend_from_slice(
                format!(
                    "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\nContent-Type: application/octet-stream\r\n\r\n",
                    field, filename
                )
                .as_bytes(),
            ),
            None => body.extend_from_slice(
                format!("Content-Disposition: form-data; name=\"{}\"\r\n\r\n", field).as_bytes(),
            ),
        }
        body.extend_from_slice(data);
        body.extend_from_slice(format!("\r\n--{}--\r\n", BOUNDARY).as_bytes());
        body
    }

    fn classify_request(body: Vec<u8>) -> test::TestRequest {
        test::TestRequest::post()
            .uri("/api/classify")
            .insert_header((
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={}", BOUNDARY),
            ))
            .set_payload(body)
    }

    macro_rules! init {
        ($harness:expr) => {
            test::init_service(
                App::new()
                    .app_data($harness.state.clone())
                    .configure(configure_routes),
            )
            .await
        };
    }

    #[actix_web::test]
    async fn categories_lists_five_entries() {
        let h = harness(ModelHandle::Unavailable, false);
        let app = init!(h);
        let req = test::TestRequest::get().uri("/api/categories").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        let categories = body["categories"].as_array().unwrap();
        assert_eq!(categories.len(), 5);
        assert_eq!(categories[2]["name"], "Sharps");
        assert!(categories[2]["description"].as_str().unwrap().contains("Needles"));
    }

    #[actix_web::test]
    async fn empty_history_is_an_empty_list() {
        let h = harness(ModelHandle::Unavailable, false);
        let app = init!(h);
        let req = test::TestRequest::get().uri("/api/history").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body, serde_json::json!({ "history": [] }));
    }

    #[actix_web::test]
    async fn missing_history_folder_is_a_server_error() {
        let h = harness(ModelHandle::Unavailable, false);
        std::fs::remove_dir_all(h.state.history.folder()).unwrap();
        let app = init!(h);
        let req = test::TestRequest::get().uri("/api/history").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body: Value = test::read_body_json(resp).await;
        assert!(body["error"].as_str().unwrap().starts_with("Error retrieving history"));
    }

    #[actix_web::test]
    async fn gif_upload_is_rejected() {
        let h = harness(stub_handle(StubEmbedder::Random), false);
        let app = init!(h);
        let req = classify_request(multipart_body("image", Some("anim.gif"), b"GIF89a")).to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["error"], "File type not allowed");
    }

    #[actix_web::test]
    async fn missing_image_field_is_rejected() {
        let h = harness(stub_handle(StubEmbedder::Random), false);
        let app = init!(h);
        let req = classify_request(multipart_body("photo", Some("scan.png"), &png_bytes())).to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["error"], "No image part");
    }

    #[actix_web::test]
    async fn non_file_image_field_counts_as_missing() {
        let h = harness(stub_handle(StubEmbedder::Random), false);
        let app = init!(h);
        let req = classify_request(multipart_body("image", None, b"text value")).to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["error"], "No image part");
    }

    #[actix_web::test]
    async fn non_multipart_request_is_rejected() {
        let h = harness(stub_handle(StubEmbedder::Random), false);
        let app = init!(h);
        let req = test::TestRequest::post()
            .uri("/api/classify")
            .insert_header((header::CONTENT_TYPE, "application/json"))
            .set_payload("{}")
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[actix_web::test]
    async fn empty_filename_is_rejected() {
        let h = harness(stub_handle(StubEmbedder::Random), false);
        let app = init!(h);
        let req = classify_request(multipart_body("image", Some(""), &png_bytes())).to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["error"], "No selected file");
    }

    #[actix_web::test]
    async fn unloaded_model_is_a_server_error() {
        let h = harness(ModelHandle::Unavailable, false);
        let app = init!(h);
        let req = classify_request(multipart_body("image", Some("scan.png"), &png_bytes())).to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["error"], "Model not loaded");
    }

    #[actix_web::test]
    async fn undecodable_image_is_a_classification_failure() {
        let h = harness(stub_handle(StubEmbedder::Random), false);
        let app = init!(h);
        let req = classify_request(multipart_body("image", Some("scan.png"), b"garbage")).to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["error"], "Classification failed");
    }

    #[actix_web::test]
    async fn oversized_upload_is_refused() {
        let h = harness(stub_handle(StubEmbedder::Random), false);
        let app = init!(h);
        let big = vec![0u8; 2 * 1024 * 1024];
        let req = classify_request(multipart_body("image", Some("big.png"), &big)).to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body: Value = test::read_body_json(resp).await;
        assert!(body["error"].as_str().unwrap().contains("exceeds"));
    }

    #[actix_web::test]
    async fn zero_limit_accepts_large_uploads() {
        let h = harness_with_limit(stub_handle(StubEmbedder::Random), false, 0);
        let app = init!(h);
        let big = vec![0u8; 2 * 1024 * 1024];
        let req = classify_request(multipart_body("image", Some("big.png"), &big)).to_request();
        let resp = test::call_service(&app, req).await;
        // The whole body is read and reaches the decoder, which rejects the zeros.
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["error"], "Classification failed");
        let saved = std::fs::read(h.state.uploads.folder().join("big.png")).unwrap();
        assert_eq!(saved.len(), 2 * 1024 * 1024);
    }

    #[actix_web::test]
    async fn classify_returns_ranked_distribution_and_archives() {
        let h = harness(stub_handle(StubEmbedder::Random), false);
        let app = init!(h);
        let req = classify_request(multipart_body("image", Some("my scan.png"), &png_bytes())).to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body: Value = test::read_body_json(resp).await;

        let predictions = body["all_predictions"].as_array().unwrap();
        assert_eq!(predictions.len(), 5);
        let confidences: Vec<f64> = predictions
            .iter()
            .map(|p| p["confidence"].as_f64().unwrap())
            .collect();
        assert!(confidences.iter().all(|c| (0.0..=1.0).contains(c)));
        assert!((confidences.iter().sum::<f64>() - 1.0).abs() < 1e-6);
        assert!(confidences.windows(2).all(|w| w[0] >= w[1]));
        assert_eq!(body["top_category"], predictions[0]["category"]);
        assert_eq!(body["confidence"], predictions[0]["confidence"]);
        assert_eq!(body["filename"], "my_scan.png");
        assert!(body["timestamp"].as_f64().unwrap() > 0.0);
        assert!(body["image_path"].as_str().unwrap().ends_with("_my_scan.png"));

        assert!(h.state.uploads.folder().join("my_scan.png").exists());

        let req = test::TestRequest::get().uri("/api/history").to_request();
        let history: Value = test::call_and_read_body_json(&app, req).await;
        let entries = history["history"].as_array().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["filename"], "my_scan.png");
        let bytes = STANDARD.decode(entries[0]["image"].as_str().unwrap()).unwrap();
        let restored = image::load_from_memory(&bytes).unwrap();
        assert_eq!((restored.width(), restored.height()), (40, 30));
    }

    #[actix_web::test]
    async fn repeated_classification_stays_normalized() {
        let h = harness(stub_handle(StubEmbedder::Constant), false);
        let app = init!(h);
        for _ in 0..2 {
            let req = classify_request(multipart_body("image", Some("scan.jpg"), &png_bytes())).to_request();
            let body: Value = test::call_and_read_body_json(&app, req).await;
            let sum: f64 = body["all_predictions"]
                .as_array()
                .unwrap()
                .iter()
                .map(|p| p["confidence"].as_f64().unwrap())
                .sum();
            assert!((sum - 1.0).abs() < 1e-6);
        }
    }

    #[actix_web::test]
    async fn pagination_is_ignored_unless_enabled() {
        let h = harness(ModelHandle::Unavailable, false);
        for ts in 1..=3 {
            std::fs::write(h.state.history.folder().join(format!("{}_s.png", ts)), b"x").unwrap();
        }
        let app = init!(h);
        let req = test::TestRequest::get().uri("/api/history?limit=abc").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["history"].as_array().unwrap().len(), 3);
        assert!(body.get("total").is_none());
    }

    #[actix_web::test]
    async fn paginated_history_slices_and_reports_total() {
        let h = harness(ModelHandle::Unavailable, true);
        for ts in 1700000001..=1700000005 {
            std::fs::write(h.state.history.folder().join(format!("{}_s.png", ts)), b"x").unwrap();
        }
        let app = init!(h);
        let req = test::TestRequest::get()
            .uri("/api/history?offset=1&limit=2")
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["total"], 5);
        let stamps: Vec<i64> = body["history"]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["timestamp"].as_i64().unwrap())
            .collect();
        assert_eq!(stamps, vec![1700000004, 1700000003]);

        let req = test::TestRequest::get().uri("/api/history?limit=0").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[actix_web::test]
    async fn health_reports_model_state() {
        let h = harness(ModelHandle::Unavailable, false);
        let app = init!(h);
        let req = test::TestRequest::get().uri("/api/health").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["model_loaded"], false);
    }
}
