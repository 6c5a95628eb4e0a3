use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    Json, Router,
    body::{Body, Bytes},
    extract::{DefaultBodyLimit, Multipart, Path, Query, State, multipart::Field},
    http::{HeaderMap, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, patch, post, put},
};
use http_body_util::{BodyExt, LengthLimitError, Limited};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::{DefaultMakeSpan, DefaultOnFailure, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::{Level, instrument};

use crate::config::{self, UploadLimits};
use crate::jobs::{ImageStore, ImageSummary, JobError};
use crate::palette::{self, PICO8};
use crate::pipeline::{self, ConversionError};

#[derive(Clone)]
pub struct AppState {
    pub cfg: config::SharedConfig,
    pub store: Arc<ImageStore>,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("upload exceeds the {max} byte limit")]
    TooLarge { max: usize },

    #[error("unsupported content type '{0}'")]
    UnsupportedMediaType(String),

    #[error("image '{0}' not found")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error(transparent)]
    Conversion(#[from] ConversionError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<JobError> for ApiError {
    fn from(e: JobError) -> Self {
        match e {
            JobError::NotFound(id) => ApiError::NotFound(id),
            other => ApiError::Conflict(other.to_string()),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        ApiError::Internal(format!("{e:#}"))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::UnsupportedMediaType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Conversion(ConversionError::EncodeFailure(_)) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ApiError::Conversion(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(json!({
            "status": status.as_u16(),
            "error": self.to_string(),
        }));
        (status, body).into_response()
    }
}

// Logs all 4xx/5xx responses with method, URI, status and latency.
async fn log_error_responses(req: axum::extract::Request, next: Next) -> Response {
    let method = req.method().clone();
    let uri = req.uri().clone();
    let start = Instant::now();
    let res = next.run(req).await;
    let status = res.status();
    if status.is_server_error() {
        tracing::error!(%method, %uri, %status, elapsed_ms = start.elapsed().as_millis(), "http 5xx");
    } else if status.is_client_error() {
        tracing::warn!(%method, %uri, %status, elapsed_ms = start.elapsed().as_millis(), "http 4xx");
    }
    res
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let trace = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_request(DefaultOnRequest::new().level(Level::INFO))
        .on_response(DefaultOnResponse::new().level(Level::INFO))
        .on_failure(DefaultOnFailure::new().level(Level::ERROR));

    // Upload size is enforced against the live config while the body is read.
    let api = Router::new()
        .route("/config", get(get_config))
        .route("/config/uploads", patch(patch_uploads))
        .route("/palette", get(get_palette))
        .route("/convert", post(convert_once))
        .route(
            "/images",
            get(list_images)
                .post(upload_image)
                .layer(DefaultBodyLimit::disable()),
        )
        .route("/images/uploads", post(create_upload))
        .route("/images/{id}", get(get_image).delete(delete_image))
        .route(
            "/images/{id}/original",
            put(put_original).get(get_original),
        )
        .route("/images/{id}/pixel-art", get(get_pixel_art))
        .with_state(state)
        .layer(cors)
        .layer(trace)
        .layer(middleware::from_fn(log_error_responses));

    Router::new().nest("/api", api)
}

/// Serve the HTTP API. If `bind` is Some it is parsed as a socket address, otherwise
/// defaults to 0.0.0.0:8080.
pub async fn serve(app: Router, bind: Option<String>) -> anyhow::Result<()> {
    let bind_addr = bind.unwrap_or_else(|| "0.0.0.0:8080".to_string());
    let addr: SocketAddr = bind_addr.parse()?;
    tracing::info!(addr=%addr, "starting http server");
    axum::serve(tokio::net::TcpListener::bind(addr).await?, app).await?;
    Ok(())
}

async fn limits(state: &AppState) -> Result<UploadLimits, ApiError> {
    Ok(config::ConfigManager::to_struct(&state.cfg)
        .await?
        .upload_limits())
}

fn check_not_empty(len: usize) -> Result<(), ApiError> {
    if len == 0 {
        return Err(ApiError::BadRequest("empty upload".into()));
    }
    Ok(())
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

/// Buffer a raw request body, failing as soon as it grows past `max_bytes`.
async fn read_limited(
    body: Body,
    headers: &HeaderMap,
    limits: &UploadLimits,
) -> Result<Bytes, ApiError> {
    let max = limits.max_bytes;
    if content_length(headers).is_some_and(|len| len > max as u64) {
        return Err(ApiError::TooLarge { max });
    }
    let collected = Limited::new(body, max).collect().await.map_err(|e| {
        if e.downcast_ref::<LengthLimitError>().is_some() {
            ApiError::TooLarge { max }
        } else {
            ApiError::BadRequest(format!("reading request body: {e}"))
        }
    })?;
    let bytes = collected.to_bytes();
    check_not_empty(bytes.len())?;
    Ok(bytes)
}

/// Read one multipart field chunk by chunk; `total` counts every field of the request.
async fn read_field(
    mut field: Field<'_>,
    total: &mut usize,
    max: usize,
) -> Result<Vec<u8>, ApiError> {
    let mut buf = Vec::new();
    while let Some(chunk) = field
        .chunk()
        .await
        .map_err(|e| ApiError::BadRequest(e.to_string()))?
    {
        *total += chunk.len();
        if *total > max {
            return Err(ApiError::TooLarge { max });
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(buf)
}

async fn read_text_field(
    field: Field<'_>,
    total: &mut usize,
    max: usize,
) -> Result<String, ApiError> {
    let bytes = read_field(field, total, max).await?;
    String::from_utf8(bytes).map_err(|e| ApiError::BadRequest(e.to_string()))
}

/// Accepts `image/*`, a generic byte stream, or no declared type at all.
fn check_content_type(ct: Option<&str>) -> Result<(), ApiError> {
    let Some(ct) = ct else { return Ok(()) };
    let essence = ct.split(';').next().unwrap_or("").trim().to_ascii_lowercase();
    if essence.starts_with("image/") || essence == "application/octet-stream" {
        Ok(())
    } else {
        Err(ApiError::UnsupportedMediaType(ct.to_string()))
    }
}

fn check_pixel_size(size: u32, limits: &UploadLimits) -> Result<(), ApiError> {
    if limits.accepts_pixel_size(size) {
        Ok(())
    } else {
        Err(ApiError::BadRequest(format!(
            "pixel size {size} must be within {}..={} in steps of {}",
            limits.min_pixel_size, limits.max_pixel_size, limits.pixel_size_step
        )))
    }
}

fn header_content_type(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn png_response(bytes: Vec<u8>) -> Response {
    ([(header::CONTENT_TYPE, "image/png")], bytes).into_response()
}

pub async fn get_config(State(state): State<AppState>) -> Result<Json<config::Config>, ApiError> {
    Ok(Json(config::ConfigManager::to_struct(&state.cfg).await?))
}

#[instrument(err, skip_all)]
pub async fn patch_uploads(
    State(state): State<AppState>,
    Json(payload): Json<config::Uploads>,
) -> Result<Json<UploadLimits>, ApiError> {
    let limits = config::ConfigManager::update_uploads(&state.cfg, &payload)
        .await
        .map_err(|e| ApiError::BadRequest(format!("{e:#}")))?;
    config::ConfigManager::save(&state.cfg).await?;
    Ok(Json(limits))
}

#[derive(Serialize)]
pub struct PaletteEntry {
    pub index: usize,
    pub hex: String,
    pub rgb: [u8; 3],
}

pub async fn get_palette() -> Json<Vec<PaletteEntry>> {
    Json(
        PICO8
            .iter()
            .enumerate()
            .map(|(index, &rgb)| PaletteEntry {
                index,
                hex: palette::hex(rgb),
                rgb,
            })
            .collect(),
    )
}

#[derive(Deserialize)]
pub struct ConvertQuery {
    pub pixel_size: Option<u32>,
}

/// Convert the request body directly and answer with the PNG.
///
/// Accepts any pixel size >= 1; the upload grid only applies to stored images.
pub async fn convert_once(
    State(state): State<AppState>,
    Query(q): Query<ConvertQuery>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, ApiError> {
    let limits = limits(&state).await?;
    check_content_type(header_content_type(&headers).as_deref())?;
    let body = read_limited(body, &headers, &limits).await?;
    let pixel_size = q.pixel_size.unwrap_or(limits.default_pixel_size);
    let png = tokio::task::spawn_blocking(move || pipeline::convert(&body, pixel_size))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))??;
    Ok(png_response(png))
}

pub async fn list_images(State(state): State<AppState>) -> Json<Vec<ImageSummary>> {
    Json(state.store.list())
}

pub async fn get_image(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<ImageSummary>, ApiError> {
    state
        .store
        .get(&id)
        .map(|r| Json(r.summary()))
        .ok_or(ApiError::NotFound(id))
}

pub async fn delete_image(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Result<StatusCode, ApiError> {
    state.store.remove(&id)?;
    tracing::info!(image=%id, "removed image");
    Ok(StatusCode::NO_CONTENT)
}

/// Multipart upload: a `file` part plus optional `pixel_size` and `filename` fields.
pub async fn upload_image(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<ImageSummary>), ApiError> {
    let limits = limits(&state).await?;
    let mut total = 0usize;
    let mut data: Option<(Vec<u8>, Option<String>, Option<String>)> = None;
    let mut pixel_size: Option<u32> = None;
    let mut filename: Option<String> = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(e.to_string()))?
    {
        let name = field.name().map(|s| s.to_string());
        match name.as_deref() {
            Some("file") => {
                let ct = field.content_type().map(str::to_string);
                let name = field.file_name().map(str::to_string);
                check_content_type(ct.as_deref())?;
                let bytes = read_field(field, &mut total, limits.max_bytes).await?;
                data = Some((bytes, ct, name));
            }
            Some("pixel_size") => {
                let text = read_text_field(field, &mut total, limits.max_bytes).await?;
                pixel_size = Some(text.trim().parse().map_err(|_| {
                    ApiError::BadRequest(format!("invalid pixel_size '{}'", text.trim()))
                })?);
            }
            Some("filename") => {
                filename = Some(read_text_field(field, &mut total, limits.max_bytes).await?);
            }
            _ => {
                read_field(field, &mut total, limits.max_bytes).await?;
            }
        }
    }
    let (bytes, content_type, part_name) =
        data.ok_or_else(|| ApiError::BadRequest("missing 'file' part".into()))?;
    check_not_empty(bytes.len())?;
    let pixel_size = pixel_size.unwrap_or(limits.default_pixel_size);
    check_pixel_size(pixel_size, &limits)?;
    let filename = filename
        .or(part_name)
        .unwrap_or_else(|| "upload".to_string());

    let summary = state
        .store
        .save_image(&filename, pixel_size, bytes, content_type);
    tracing::info!(image=%summary.id, filename=%filename, pixel_size, "image uploaded; conversion scheduled");
    state.store.schedule(summary.id.clone());
    Ok((StatusCode::ACCEPTED, Json(summary)))
}

#[derive(Deserialize)]
pub struct CreateUpload {
    pub filename: String,
    pub pixel_size: Option<u32>,
}

/// Reserve a record in `uploading`; bytes follow with `PUT /images/{id}/original`.
pub async fn create_upload(
    State(state): State<AppState>,
    Json(payload): Json<CreateUpload>,
) -> Result<(StatusCode, Json<ImageSummary>), ApiError> {
    let limits = limits(&state).await?;
    let pixel_size = payload.pixel_size.unwrap_or(limits.default_pixel_size);
    check_pixel_size(pixel_size, &limits)?;
    let summary = state.store.create_upload(&payload.filename, pixel_size);
    Ok((StatusCode::CREATED, Json(summary)))
}

pub async fn put_original(
    Path(id): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Body,
) -> Result<(StatusCode, Json<ImageSummary>), ApiError> {
    let limits = limits(&state).await?;
    let content_type = header_content_type(&headers);
    check_content_type(content_type.as_deref())?;
    let body = read_limited(body, &headers, &limits).await?;
    let summary = state
        .store
        .attach_original(&id, body.to_vec(), content_type)?;
    tracing::info!(image=%id, bytes = body.len(), "original received; conversion scheduled");
    state.store.schedule(summary.id.clone());
    Ok((StatusCode::ACCEPTED, Json(summary)))
}

pub async fn get_original(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Result<Response, ApiError> {
    let rec = state
        .store
        .get(&id)
        .ok_or_else(|| ApiError::NotFound(id.clone()))?;
    let bytes = rec.original.ok_or(ApiError::NotFound(id))?;
    let content_type = rec.content_type.unwrap_or_else(|| {
        mime_guess::from_path(&rec.filename)
            .first_or_octet_stream()
            .essence_str()
            .to_string()
    });
    Ok(([(header::CONTENT_TYPE, content_type)], bytes.to_vec()).into_response())
}

pub async fn get_pixel_art(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Result<Response, ApiError> {
    let rec = state
        .store
        .get(&id)
        .ok_or_else(|| ApiError::NotFound(id.clone()))?;
    match rec.pixel_art {
        Some(bytes) => {
            let disposition = format!(
                "attachment; filename=\"{}\"",
                download_name(&rec.filename)
            );
            let mut resp = png_response(bytes.to_vec());
            let value = header::HeaderValue::from_str(&disposition)
                .map_err(|e| ApiError::Internal(e.to_string()))?;
            resp.headers_mut().insert(header::CONTENT_DISPOSITION, value);
            Ok(resp)
        }
        None => {
            tracing::debug!(image=%id, status=%rec.status, "pixel art requested before completion");
            Err(ApiError::NotFound(id))
        }
    }
}

/// Download name for a converted image, reduced to characters safe in a quoted header value.
fn download_name(filename: &str) -> String {
    let clean: String = filename
        .chars()
        .map(|c| match c {
            '"' | '\\' => '_',
            c if c == ' ' || c.is_ascii_graphic() => c,
            _ => '_',
        })
        .collect();
    format!("pixelart_{clean}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::ConversionStatus;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use futures_util::stream::{self, StreamExt};
    use image::{ImageFormat, RgbImage};
    use std::io::Cursor;
    use tower::ServiceExt;

    const CFG: &str = "[uploads]\nmax_bytes = 4096\n";

    fn state() -> AppState {
        let dir = std::env::temp_dir().join("pixelart-http-tests.toml");
        AppState {
            cfg: config::ConfigManager::parse(&dir, CFG).unwrap(),
            store: Arc::new(ImageStore::new()),
        }
    }

    fn png(w: u32, h: u32) -> Vec<u8> {
        let img = RgbImage::from_fn(w, h, |x, y| image::Rgb([(x * 7) as u8, (y * 3) as u8, 200]));
        let mut bytes = Vec::new();
        img.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        bytes
    }

    async fn body_bytes(resp: Response) -> Vec<u8> {
        to_bytes(resp.into_body(), usize::MAX).await.unwrap().to_vec()
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        serde_json::from_slice(&body_bytes(resp).await).unwrap()
    }

    fn multipart(parts: &[(&str, Option<(&str, &str)>, &[u8])]) -> (String, Vec<u8>) {
        let boundary = "pixelartboundary";
        let mut body = Vec::new();
        for (name, file, data) in parts {
            body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
            match file {
                Some((filename, ct)) => body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{name}\"; filename=\"{filename}\"\r\nContent-Type: {ct}\r\n\r\n"
                    )
                    .as_bytes(),
                ),
                None => body.extend_from_slice(
                    format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n").as_bytes(),
                ),
            }
            body.extend_from_slice(data);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());
        (format!("multipart/form-data; boundary={boundary}"), body)
    }

    /// A body that sends `head` and then zero bytes forever.
    fn endless_body(head: Vec<u8>) -> Body {
        let zeros = stream::repeat_with(|| Ok::<_, std::io::Error>(Bytes::from(vec![0u8; 1000])));
        Body::from_stream(stream::iter([Ok(Bytes::from(head))]).chain(zeros))
    }

    async fn send_with_deadline(app: Router, req: Request<Body>) -> Response {
        tokio::time::timeout(std::time::Duration::from_secs(5), app.oneshot(req))
            .await
            .expect("no response while the body was still streaming")
            .unwrap()
    }

    async fn wait_for_terminal(store: &ImageStore, id: &str) -> ConversionStatus {
        for _ in 0..500 {
            let status = store.get(id).unwrap().status;
            if status.is_terminal() {
                return status;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("conversion of {id} did not finish");
    }

    #[tokio::test]
    async fn convert_returns_png_of_same_size() {
        let app = router(state());
        let req = Request::post("/api/convert?pixel_size=3")
            .header(header::CONTENT_TYPE, "image/png")
            .body(Body::from(png(30, 20)))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_TYPE], "image/png");
        let out = image::load_from_memory(&body_bytes(resp).await).unwrap();
        assert_eq!((out.width(), out.height()), (30, 20));
    }

    #[tokio::test]
    async fn convert_reports_degenerate_scale() {
        let app = router(state());
        let req = Request::post("/api/convert?pixel_size=32")
            .body(Body::from(png(10, 10)))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let v = body_json(resp).await;
        assert_eq!(v["status"], 422);
        assert!(v["error"].as_str().unwrap().contains("too large"));
    }

    #[tokio::test]
    async fn convert_enforces_limits() {
        let app = router(state());
        let req = Request::post("/api/convert")
            .body(Body::from(vec![0u8; 5000]))
            .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);

        let req = Request::post("/api/convert")
            .header(header::CONTENT_TYPE, "text/plain")
            .body(Body::from(png(8, 8)))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    }

    #[tokio::test]
    async fn convert_stops_reading_past_limit() {
        let app = router(state());
        let req = Request::post("/api/convert")
            .header(header::CONTENT_TYPE, "image/png")
            .body(endless_body(Vec::new()))
            .unwrap();
        let resp = send_with_deadline(app.clone(), req).await;
        assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
        let v = body_json(resp).await;
        assert_eq!(v["status"], 413);
        assert!(v["error"].as_str().unwrap().contains("4096"));

        // a declared length over the limit is refused before reading
        let req = Request::post("/api/convert")
            .header(header::CONTENT_LENGTH, "5000")
            .body(endless_body(Vec::new()))
            .unwrap();
        let resp = send_with_deadline(app, req).await;
        assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn put_original_stops_reading_past_limit() {
        let st = state();
        let rec = st.store.create_upload("big.png", 8);
        let app = router(st.clone());
        let req = Request::put(format!("/api/images/{}/original", rec.id))
            .body(endless_body(Vec::new()))
            .unwrap();
        let resp = send_with_deadline(app, req).await;
        assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(
            st.store.get(&rec.id).unwrap().status,
            ConversionStatus::Uploading
        );
    }

    #[tokio::test]
    async fn multipart_stops_reading_past_limit() {
        let st = state();
        let app = router(st.clone());
        let boundary = "pixelartboundary";
        let head = format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"big.png\"\r\nContent-Type: image/png\r\n\r\n"
        );
        let req = Request::post("/api/images")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={boundary}"),
            )
            .body(endless_body(head.into_bytes()))
            .unwrap();
        let resp = send_with_deadline(app, req).await;
        assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert!(st.store.list().is_empty());
    }

    #[tokio::test]
    async fn palette_lists_sixteen_colours() {
        let app = router(state());
        let resp = app
            .oneshot(Request::get("/api/palette").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let v = body_json(resp).await;
        let entries = v.as_array().unwrap();
        assert_eq!(entries.len(), 16);
        assert_eq!(entries[8]["hex"], "#ff004d");
    }

    #[tokio::test]
    async fn multipart_upload_runs_to_completion() {
        let st = state();
        let app = router(st.clone());
        let data = png(24, 24);
        let (ct, body) = multipart(&[
            ("file", Some(("sprite.png", "image/png")), data.as_slice()),
            ("pixel_size", None, &b"6"[..]),
        ]);
        let req = Request::post("/api/images")
            .header(header::CONTENT_TYPE, ct)
            .body(Body::from(body))
            .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        let v = body_json(resp).await;
        assert_eq!(v["status"], "processing");
        assert_eq!(v["filename"], "sprite.png");
        let id = v["id"].as_str().unwrap().to_string();

        assert_eq!(
            wait_for_terminal(&st.store, &id).await,
            ConversionStatus::Completed
        );
        let resp = app
            .clone()
            .oneshot(
                Request::get(format!("/api/images/{id}/pixel-art"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()[header::CONTENT_DISPOSITION],
            "attachment; filename=\"pixelart_sprite.png\""
        );
        let out = image::load_from_memory(&body_bytes(resp).await).unwrap();
        assert_eq!((out.width(), out.height()), (24, 24));

        let resp = app
            .clone()
            .oneshot(
                Request::get(format!("/api/images/{id}/original"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.headers()[header::CONTENT_TYPE], "image/png");
        assert_eq!(body_bytes(resp).await, data);
    }

    #[tokio::test]
    async fn upload_rejects_off_grid_pixel_size() {
        let app = router(state());
        let data = png(16, 16);
        let (ct, body) = multipart(&[
            ("file", Some(("a.png", "image/png")), data.as_slice()),
            ("pixel_size", None, &b"5"[..]),
        ]);
        let req = Request::post("/api/images")
            .header(header::CONTENT_TYPE, ct)
            .body(Body::from(body))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn two_step_upload_and_failure_state() {
        let st = state();
        let app = router(st.clone());
        let req = Request::post("/api/images/uploads")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"filename":"small.png","pixel_size":32}"#))
            .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let v = body_json(resp).await;
        assert_eq!(v["status"], "uploading");
        let id = v["id"].as_str().unwrap().to_string();

        // pixel art not available before conversion
        let resp = app
            .clone()
            .oneshot(
                Request::get(format!("/api/images/{id}/pixel-art"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let req = Request::put(format!("/api/images/{id}/original"))
            .header(header::CONTENT_TYPE, "image/png")
            .body(Body::from(png(10, 10)))
            .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        assert_eq!(
            wait_for_terminal(&st.store, &id).await,
            ConversionStatus::Error
        );

        // the record is terminal: no second upload
        let req = Request::put(format!("/api/images/{id}/original"))
            .body(Body::from(png(12, 12)))
            .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        let resp = app
            .clone()
            .oneshot(
                Request::get(format!("/api/images/{id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let v = body_json(resp).await;
        assert_eq!(v["status"], "error");
        assert!(v["error"].is_string());
    }

    #[test]
    fn download_name_is_header_safe() {
        assert_eq!(download_name("cat.jpg"), "pixelart_cat.jpg");
        assert_eq!(download_name("my \"cat\".png"), "pixelart_my _cat_.png");
        assert_eq!(download_name("café\n.png"), "pixelart_caf__.png");
    }

    #[tokio::test]
    async fn list_and_delete() {
        let st = state();
        let first = st.store.create_upload("one.png", 4);
        let second = st.store.create_upload("two.png", 4);
        let app = router(st.clone());
        let resp = app
            .clone()
            .oneshot(Request::get("/api/images").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let v = body_json(resp).await;
        assert_eq!(v[0]["id"], second.id.as_str());
        assert_eq!(v[1]["id"], first.id.as_str());

        let req = Request::delete(format!("/api/images/{}", first.id))
            .body(Body::empty())
            .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        let req = Request::delete(format!("/api/images/{}", first.id))
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(st.store.list().len(), 1);
    }

    #[tokio::test]
    async fn patch_uploads_validates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pixelart.toml");
        std::fs::write(&path, CFG).unwrap();
        let st = AppState {
            cfg: config::ConfigManager::load(Some(path.clone())).await.unwrap(),
            store: Arc::new(ImageStore::new()),
        };
        let app = router(st);
        let req = Request::patch("/api/config/uploads")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"max_pixel_size":16,"default_pixel_size":10}"#))
            .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let v = body_json(resp).await;
        assert_eq!(v["max_pixel_size"], 16);
        assert!(std::fs::read_to_string(&path).unwrap().contains("max_pixel_size = 16"));

        let req = Request::patch("/api/config/uploads")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"default_pixel_size":7}"#))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
