//! HTTP surface for the attendance kiosk.
//!
//! Hand-rolled HTTP/1.1 over `TcpListener`. The accept loop is non-blocking
//! and polls a shutdown flag; each accepted connection gets its own thread
//! because `/video_feed` never completes on its own.
//!
//! Routes:
//! - `GET  /api/status`     current detections and status
//! - `GET  /video_feed`     annotated MJPEG stream
//! - `POST /api/save_face`  persist the current best face
//! - `GET  /api/attendance` most recent attendance records
//! - `GET  /health`         liveness plus camera connection state

use anyhow::{anyhow, Context, Result};
use chrono::Local;
use serde::Serialize;
use serde_json::json;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::attendance::save_attendance;
use crate::detect::DetectionBatch;
use crate::error::AttendanceError;
use crate::policy::ApprovalPolicy;
use crate::state::SharedDetectionState;
use crate::storage::AttendanceRecorder;
use crate::streamer::{FrameStreamer, CONTENT_TYPE, DEFAULT_STREAM_IDLE};

const MAX_REQUEST_BYTES: usize = 8192;
const DEFAULT_HISTORY_LIMIT: usize = 10;

pub type SharedRecorder = Arc<Mutex<Box<dyn AttendanceRecorder>>>;

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
    pub history_limit: usize,
    pub stream_idle: Duration,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:5000".to_string(),
            history_limit: DEFAULT_HISTORY_LIMIT,
            stream_idle: DEFAULT_STREAM_IDLE,
        }
    }
}

/// Everything a request handler may touch.
#[derive(Clone)]
pub struct ApiContext {
    pub shared: Arc<SharedDetectionState>,
    pub recorder: SharedRecorder,
    pub policy: ApprovalPolicy,
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    /// Stop accepting, end open video streams, and join the accept loop.
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("api server thread panicked"))?;
        }
        Ok(())
    }
}

pub struct ApiServer {
    cfg: ApiConfig,
    ctx: ApiContext,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, ctx: ApiContext) -> Self {
        Self { cfg, ctx }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self
            .cfg
            .addr
            .parse()
            .with_context(|| format!("parse api address '{}'", self.cfg.addr))?;
        let listener = TcpListener::bind(configured_addr)
            .with_context(|| format!("bind api address {}", configured_addr))?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;
        log::info!("attendance api listening on http://{}", addr);

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let join = std::thread::Builder::new()
            .name("attendance-api".to_string())
            .spawn(move || {
                if let Err(err) = run_api(listener, self.cfg, self.ctx, shutdown_thread) {
                    log::error!("attendance api stopped: {}", err);
                }
            })?;

        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(
    listener: TcpListener,
    cfg: ApiConfig,
    ctx: ApiContext,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                let cfg = cfg.clone();
                let ctx = ctx.clone();
                let shutdown = shutdown.clone();
                let spawned = std::thread::Builder::new()
                    .name("attendance-api-conn".to_string())
                    .spawn(move || {
                        if let Err(err) = handle_connection(stream, &cfg, &ctx, shutdown) {
                            log::warn!("api request from {} rejected: {:#}", peer, err);
                        }
                    });
                if let Err(err) = spawned {
                    log::error!("api connection thread not started: {}", err);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Status,
    VideoFeed,
    SaveFace,
    Attendance,
    Health,
}

impl Route {
    fn resolve(path: &str) -> Option<Self> {
        match path {
            "/api/status" => Some(Route::Status),
            "/video_feed" => Some(Route::VideoFeed),
            "/api/save_face" => Some(Route::SaveFace),
            "/api/attendance" => Some(Route::Attendance),
            "/health" => Some(Route::Health),
            _ => None,
        }
    }

    fn method(self) -> &'static str {
        match self {
            Route::SaveFace => "POST",
            _ => "GET",
        }
    }
}

fn handle_connection(
    mut stream: TcpStream,
    cfg: &ApiConfig,
    ctx: &ApiContext,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    // Some platforms hand out accepted sockets in the listener's mode.
    stream.set_nonblocking(false)?;
    let request = read_request(&mut stream)?;

    let Some(route) = Route::resolve(&request.path) else {
        write_json_response(&mut stream, 404, &json!({"error": "not_found"}))?;
        return Ok(());
    };
    if request.method != route.method() {
        write_json_response(&mut stream, 405, &json!({"error": "method_not_allowed"}))?;
        return Ok(());
    }

    match route {
        Route::Status => handle_status(&mut stream, ctx),
        Route::VideoFeed => handle_video_feed(stream, cfg, ctx, shutdown),
        Route::SaveFace => handle_save_face(&mut stream, ctx),
        Route::Attendance => handle_attendance(&mut stream, cfg, ctx),
        Route::Health => {
            let connection = ctx.shared.connection_state()?;
            write_json_response(
                &mut stream,
                200,
                &json!({"status": "ok", "connection": connection}),
            )
        }
    }
}

#[derive(Serialize)]
struct StatusResponse<'a> {
    status: String,
    detections: &'a DetectionBatch,
    count: usize,
    timestamp: String,
}

fn handle_status(stream: &mut TcpStream, ctx: &ApiContext) -> Result<()> {
    let snapshot = ctx.shared.read_snapshot()?;
    let body = StatusResponse {
        status: snapshot.status.message(),
        detections: &snapshot.batch,
        count: snapshot.batch.len(),
        timestamp: Local::now().to_rfc3339(),
    };
    write_json_response(stream, 200, &body)
}

fn handle_video_feed(
    mut stream: TcpStream,
    cfg: &ApiConfig,
    ctx: &ApiContext,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        CONTENT_TYPE
    );
    stream.write_all(header.as_bytes())?;

    let streamer =
        FrameStreamer::new(ctx.shared.clone(), cfg.stream_idle).with_shutdown(shutdown);
    for part in streamer {
        if let Err(err) = stream.write_all(&part).and_then(|_| stream.flush()) {
            log::debug!("video feed client went away: {}", err);
            break;
        }
    }
    Ok(())
}

fn handle_save_face(stream: &mut TcpStream, ctx: &ApiContext) -> Result<()> {
    let outcome = ctx
        .recorder
        .lock()
        .map_err(|_| AttendanceError::LockPoisoned)
        .and_then(|mut recorder| save_attendance(&ctx.shared, &mut **recorder, &ctx.policy));

    match outcome {
        Ok(record) => write_json_response(
            stream,
            200,
            &json!({
                "status": "success",
                "confidence": record.confidence,
                "message": "Face saved successfully",
            }),
        ),
        Err(AttendanceError::NoDetectionAvailable) => write_json_response(
            stream,
            400,
            &json!({"status": "error", "message": "No face detected"}),
        ),
        Err(err) => {
            log::error!("save action failed ({}): {}", err.kind(), err);
            write_json_response(
                stream,
                500,
                &json!({"status": "error", "message": err.to_string()}),
            )
        }
    }
}

fn handle_attendance(stream: &mut TcpStream, cfg: &ApiConfig, ctx: &ApiContext) -> Result<()> {
    let records = ctx
        .recorder
        .lock()
        .map_err(|_| AttendanceError::LockPoisoned)?
        .recent(cfg.history_limit)?;
    write_json_response(stream, 200, &json!({"attendance": records}))
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
        if data.len() > MAX_REQUEST_BYTES {
            return Err(anyhow!("request too large"));
        }
        if data.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    let text = String::from_utf8_lossy(&data);
    let request_line = text.split("\r\n").next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();
    Ok(HttpRequest {
        method: method.to_string(),
        path,
    })
}

fn write_json_response<T: Serialize + ?Sized>(
    stream: &mut TcpStream,
    status: u16,
    body: &T,
) -> Result<()> {
    let payload = serde_json::to_vec(body)?;
    write_response(stream, status, "application/json", &payload)
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        400 => "HTTP/1.1 400 Bad Request",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        status_line = status_line,
        content_type = content_type,
        len = body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    Ok(())
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routes_resolve_with_methods() {
        assert_eq!(Route::resolve("/api/status"), Some(Route::Status));
        assert_eq!(Route::resolve("/api/save_face").map(Route::method), Some("POST"));
        assert_eq!(Route::resolve("/video_feed").map(Route::method), Some("GET"));
        assert_eq!(Route::resolve("/api/unknown"), None);
    }
}
