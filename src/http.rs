// HTTP routes over the blocking core. Every storage call runs on the blocking
// thread pool; layer bodies cross over through bounded channels so neither
// direction holds a whole layer in memory.
use std::io::{self, Read};
use std::sync::Arc;
use std::time::Duration;

use actix_files::NamedFile;
use actix_web::http::header::{self, HeaderValue};
use actix_web::http::StatusCode;
use actix_web::middleware::Logger;
use actix_web::web::{self, Bytes};
use actix_web::{App, HttpRequest, HttpResponse, HttpServer, ResponseError};
use chrono::Utc;
use futures_util::StreamExt;
use log::info;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::images::Images;
use crate::storage::Storage;
use crate::upload::UploadTransaction;

/// Chunks in flight between the network and the blocking side.
const CHANNEL_DEPTH: usize = 16;

const CHECKSUM_HEADER: &str = "X-Docker-Checksum";
const SIZE_HEADER: &str = "X-Docker-Size";

// completed images never change, so they are cached for a year
const CACHE_TTL_SECS: i64 = 31_536_000;
const CACHE_CONTROL: &str = "public, max-age=31536000";
const EPOCH: &str = "Thu, 01 Jan 1970 00:00:00 GMT";
const HTTP_DATE: &str = "%a, %d %b %Y %H:%M:%S GMT";

pub struct AppState {
    pub uploads: UploadTransaction,
    pub images: Images,
}

impl AppState {
    pub fn new(store: Arc<dyn Storage>, pending_ttl: Duration) -> AppState {
        AppState {
            uploads: UploadTransaction::new(store.clone(), pending_ttl),
            images: Images::new(store),
        }
    }
}

type State = web::Data<AppState>;

impl ResponseError for Error {
    fn status_code(&self) -> StatusCode {
        match self {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::AlreadyExists(_) => StatusCode::CONFLICT,
            Error::ChecksumMismatch { .. }
            | Error::InvalidRequest(_)
            | Error::ArchiveFormat(_)
            | Error::UploadInProgress(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();
        let message = if status.is_server_error() {
            format!("{}, please retry", self)
        } else {
            self.to_string()
        };
        HttpResponse::build(status).json(serde_json::json!({ "error": message }))
    }
}

/// Blocking reader over chunks sent from the async side. A closed channel
/// is the end of the stream.
pub struct ChannelReader {
    rx: mpsc::Receiver<io::Result<Bytes>>,
    current: Bytes,
}

impl ChannelReader {
    pub fn new(rx: mpsc::Receiver<io::Result<Bytes>>) -> ChannelReader {
        ChannelReader {
            rx,
            current: Bytes::new(),
        }
    }
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        while self.current.is_empty() {
            match self.rx.blocking_recv() {
                Some(Ok(chunk)) => self.current = chunk,
                Some(Err(e)) => return Err(e),
                None => return Ok(0),
            }
        }
        let n = buf.len().min(self.current.len());
        buf[..n].copy_from_slice(&self.current.split_to(n));
        Ok(n)
    }
}

async fn blocking<T, F>(f: F) -> actix_web::Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    Ok(web::block(f).await??)
}

fn header_value(req: &HttpRequest, name: &str) -> Option<String> {
    req.headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
}

fn with_cache_headers(mut response: HttpResponse) -> HttpResponse {
    let expires = (Utc::now() + chrono::Duration::seconds(CACHE_TTL_SECS))
        .format(HTTP_DATE)
        .to_string();
    let headers = response.headers_mut();
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static(CACHE_CONTROL));
    if let Ok(expires) = HeaderValue::from_str(&expires) {
        headers.insert(header::EXPIRES, expires);
    }
    headers.insert(header::LAST_MODIFIED, HeaderValue::from_static(EPOCH));
    response
}

/// 304 for a conditional request on a completed image.
async fn not_modified(
    state: &State,
    image_id: &str,
    req: &HttpRequest,
) -> actix_web::Result<Option<HttpResponse>> {
    if !req.headers().contains_key(header::IF_MODIFIED_SINCE) {
        return Ok(None);
    }
    let state = state.clone();
    let id = image_id.to_string();
    if !blocking(move || state.images.is_ready(&id)).await? {
        return Ok(None);
    }
    Ok(Some(with_cache_headers(HttpResponse::NotModified().finish())))
}

async fn ping() -> HttpResponse {
    HttpResponse::Ok().json(true)
}

async fn get_json(
    state: State,
    image_id: web::Path<String>,
    req: HttpRequest,
) -> actix_web::Result<HttpResponse> {
    let image_id = image_id.into_inner();
    if let Some(response) = not_modified(&state, &image_id, &req).await? {
        return Ok(response);
    }
    let json = blocking(move || state.images.get_json(&image_id)).await?;
    let mut response = HttpResponse::Ok();
    response.content_type("application/json");
    if let Some(size) = json.layer_size {
        response.insert_header((SIZE_HEADER, size.to_string()));
    }
    if let Some(checksum) = json.checksum {
        response.insert_header((CHECKSUM_HEADER, checksum));
    }
    Ok(with_cache_headers(response.body(json.data)))
}

async fn put_json(
    state: State,
    image_id: web::Path<String>,
    req: HttpRequest,
    body: Bytes,
) -> actix_web::Result<HttpResponse> {
    let image_id = image_id.into_inner();
    let claimed = header_value(&req, CHECKSUM_HEADER);
    blocking(move || state.uploads.put_json(&image_id, &body, claimed.as_deref())).await?;
    Ok(HttpResponse::Ok().json(true))
}

async fn put_layer(
    state: State,
    image_id: web::Path<String>,
    mut payload: web::Payload,
) -> actix_web::Result<HttpResponse> {
    let image_id = image_id.into_inner();
    let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
    let upload = web::block(move || {
        let mut reader = ChannelReader::new(rx);
        state.uploads.put_layer(&image_id, &mut reader)
    });
    let pump = async move {
        while let Some(chunk) = payload.next().await {
            let chunk = chunk.map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()));
            let failed = chunk.is_err();
            // a closed channel means the upload side gave up already
            if tx.send(chunk).await.is_err() || failed {
                break;
            }
        }
    };
    let (outcome, ()) = futures_util::future::join(upload, pump).await;
    outcome??;
    Ok(HttpResponse::Ok().json(true))
}

async fn get_layer(
    state: State,
    image_id: web::Path<String>,
    req: HttpRequest,
) -> actix_web::Result<HttpResponse> {
    let image_id = image_id.into_inner();
    if let Some(response) = not_modified(&state, &image_id, &req).await? {
        return Ok(response);
    }
    let lookup = state.clone();
    let id = image_id.clone();
    if let Some(path) = blocking(move || lookup.images.layer_file(&id)).await? {
        let file = NamedFile::open(path)?.use_last_modified(false);
        return Ok(with_cache_headers(file.into_response(&req)));
    }

    let chunks = blocking(move || state.images.stream_layer(&image_id)).await?;
    let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
    actix_web::rt::task::spawn_blocking(move || {
        for chunk in chunks {
            let failed = chunk.is_err();
            if tx.blocking_send(chunk.map(Bytes::from)).is_err() || failed {
                break;
            }
        }
    });
    let body = futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|chunk: Result<Bytes>| (chunk, rx))
    });
    Ok(with_cache_headers(
        HttpResponse::Ok()
            .content_type("application/octet-stream")
            .streaming(body),
    ))
}

async fn put_checksum(
    state: State,
    image_id: web::Path<String>,
    req: HttpRequest,
) -> actix_web::Result<HttpResponse> {
    let image_id = image_id.into_inner();
    let claimed = header_value(&req, CHECKSUM_HEADER)
        .ok_or_else(|| Error::InvalidRequest("missing image checksum".to_string()))?;
    blocking(move || state.uploads.put_checksum(&image_id, &claimed)).await?;
    Ok(HttpResponse::Ok().json(true))
}

async fn get_ancestry(
    state: State,
    image_id: web::Path<String>,
    req: HttpRequest,
) -> actix_web::Result<HttpResponse> {
    let image_id = image_id.into_inner();
    if let Some(response) = not_modified(&state, &image_id, &req).await? {
        return Ok(response);
    }
    let ancestry = blocking(move || state.images.get_ancestry(&image_id)).await?;
    Ok(with_cache_headers(HttpResponse::Ok().json(ancestry)))
}

async fn get_files(
    state: State,
    image_id: web::Path<String>,
    req: HttpRequest,
) -> actix_web::Result<HttpResponse> {
    let image_id = image_id.into_inner();
    if let Some(response) = not_modified(&state, &image_id, &req).await? {
        return Ok(response);
    }
    let files = blocking(move || state.images.get_files(&image_id)).await?;
    Ok(with_cache_headers(
        HttpResponse::Ok()
            .content_type("application/json")
            .body(files),
    ))
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/v1")
            .route("/_ping", web::get().to(ping))
            .service(
                web::resource("/images/{image_id}/json")
                    .route(web::get().to(get_json))
                    .route(web::put().to(put_json)),
            )
            .service(
                web::resource("/images/{image_id}/layer")
                    .route(web::get().to(get_layer))
                    .route(web::put().to(put_layer)),
            )
            .route("/images/{image_id}/checksum", web::put().to(put_checksum))
            .route("/images/{image_id}/ancestry", web::get().to(get_ancestry))
            .route("/images/{image_id}/files", web::get().to(get_files)),
    );
}

pub async fn serve(state: AppState, bind: &str) -> io::Result<()> {
    let state = web::Data::new(state);
    info!("listening on {}", bind);
    HttpServer::new(move || {
        App::new()
            .wrap(Logger::default())
            .app_data(state.clone())
            .configure(configure)
    })
    .bind(bind)?
    .run()
    .await
}
