//! Loopback HTTP boundary: status, history, camera control and the live feed.
//!
//! Read endpoints are open to local callers. Camera control requires the
//! capability token minted at startup (`Authorization: Bearer <hex>`).
//! Peers that are not loopback are refused on a loopback listener.

use crate::control::{Control, SwitchOutcome};
use crate::storage::{SessionStore, SqliteSessionStore};
use crate::{now_ms, EpochMillis};
use anyhow::{anyhow, Result};
use rand::RngCore;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

const MAX_REQUEST_BYTES: usize = 8192;
const MAX_LIVE_STREAMS: usize = 8;
const MAX_PENDING_SWITCHES: usize = 4;
const STREAM_BOUNDARY: &str = "frame";

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
    pub token_path: Option<PathBuf>,
    pub db_path: String,
    /// How long a camera control request waits for the pipeline to apply it.
    pub ack_timeout: Duration,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8810".to_string(),
            token_path: None,
            db_path: "occupancy.db".to_string(),
            ack_timeout: Duration::from_secs(3),
        }
    }
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    pub token: String,
    pub token_path: Option<PathBuf>,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("api server thread panicked"))?;
        }
        Ok(())
    }
}

/// Random 32-byte bearer token, fixed for the lifetime of the server.
#[derive(Clone, Debug)]
pub struct CapabilityToken {
    token: [u8; 32],
}

impl CapabilityToken {
    pub fn generate() -> Self {
        let mut token = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut token);
        Self { token }
    }

    pub fn token_hex(&self) -> String {
        hex::encode(self.token)
    }

    pub fn validate(&self, presented: &str) -> Result<()> {
        let presented = parse_hex32(presented)?;
        if presented != self.token {
            return Err(anyhow!("capability token invalid"));
        }
        Ok(())
    }
}

pub struct ApiServer {
    cfg: ApiConfig,
    control: Arc<Control>,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, control: Arc<Control>) -> Self {
        Self { cfg, control }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self.cfg.addr.parse()?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        if configured_addr.ip().is_loopback() && !addr.ip().is_loopback() {
            return Err(anyhow!(
                "api configured for loopback address '{}', but bound to non-loopback address '{}'",
                configured_addr,
                addr
            ));
        }
        listener.set_nonblocking(true)?;

        let store = SqliteSessionStore::open(&self.cfg.db_path)?;
        let capability = CapabilityToken::generate();
        let token = capability.token_hex();
        if let Some(path) = &self.cfg.token_path {
            write_token_file(path, &token)?;
        }

        let shutdown = Arc::new(AtomicBool::new(false));
        let mut ctx = ApiContext {
            store: Box::new(store),
            control: self.control,
            capability,
            ack_timeout: self.cfg.ack_timeout,
            shutdown: shutdown.clone(),
            live_streams: Arc::new(AtomicUsize::new(0)),
            pending_switches: Arc::new(AtomicUsize::new(0)),
        };
        let join = std::thread::Builder::new()
            .name("occupancy-api".to_string())
            .spawn(move || {
                if let Err(err) = run_api(listener, &mut ctx) {
                    log::error!("occupancy api stopped: {}", err);
                }
            })?;
        log::info!("occupancy api listening on {}", addr);

        Ok(ApiHandle {
            addr,
            token,
            token_path: self.cfg.token_path,
            shutdown,
            join: Some(join),
        })
    }
}

struct ApiContext {
    store: Box<dyn SessionStore>,
    control: Arc<Control>,
    capability: CapabilityToken,
    ack_timeout: Duration,
    shutdown: Arc<AtomicBool>,
    live_streams: Arc<AtomicUsize>,
    /// Camera control requests waiting on the pipeline's acknowledgement.
    pending_switches: Arc<AtomicUsize>,
}

fn run_api(listener: TcpListener, ctx: &mut ApiContext) -> Result<()> {
    loop {
        if ctx.shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                if let Err(err) = handle_connection(stream, ctx) {
                    log::warn!("occupancy api request rejected: {}", err);
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

fn handle_connection(mut stream: TcpStream, ctx: &mut ApiContext) -> Result<()> {
    let peer = stream.peer_addr()?;
    let local = stream.local_addr()?;
    if local.ip().is_loopback() && !peer.ip().is_loopback() {
        write_json_response(&mut stream, 403, r#"{"error":"forbidden"}"#)?;
        return Ok(());
    }

    let request = read_request(&mut stream)?;
    match (request.method.as_str(), request.path.as_str()) {
        ("GET", "/health") => write_json_response(&mut stream, 200, r#"{"status":"ok"}"#),
        ("GET", "/status") => respond(&mut stream, ctx.control.status()),
        ("GET", "/stats") => respond(&mut stream, ctx.store.occupancy_counts()),
        ("GET", "/durations") => {
            let durations = now_ms().and_then(|now| ctx.store.durations(now));
            respond(&mut stream, durations)
        }
        ("GET", "/events") => {
            let Some((since, until)) = request.time_range() else {
                return write_json_response(&mut stream, 400, r#"{"error":"invalid_range"}"#);
            };
            respond(&mut stream, ctx.store.events_between(since, until))
        }
        ("GET", "/video_feed") => start_live_stream(stream, ctx),
        ("POST", "/camera/activate" | "/camera/deactivate" | "/camera/toggle") => {
            handle_camera_control(stream, &request, ctx)
        }
        (
            _,
            "/health" | "/status" | "/stats" | "/durations" | "/events" | "/video_feed"
            | "/camera/activate" | "/camera/deactivate" | "/camera/toggle",
        ) => write_json_response(&mut stream, 405, r#"{"error":"method_not_allowed"}"#),
        _ => write_json_response(&mut stream, 404, r#"{"error":"not_found"}"#),
    }
}

/// Write `value` as a 200, or a 500 if producing it failed.
fn respond<T: serde::Serialize>(stream: &mut TcpStream, value: Result<T>) -> Result<()> {
    match value {
        Ok(value) => write_json(stream, 200, &value),
        Err(err) => {
            write_json_response(stream, 500, r#"{"error":"internal"}"#)?;
            Err(err)
        }
    }
}

#[derive(Clone, Copy, Debug)]
enum SwitchRequest {
    Activate,
    Deactivate,
    Toggle,
}

impl SwitchRequest {
    fn apply(self, control: &Control, ack_timeout: Duration) -> Result<SwitchOutcome> {
        match self {
            SwitchRequest::Activate => control.set_active(true, ack_timeout),
            SwitchRequest::Deactivate => control.set_active(false, ack_timeout),
            SwitchRequest::Toggle => control.toggle(ack_timeout),
        }
    }
}

fn handle_camera_control(
    mut stream: TcpStream,
    request: &HttpRequest,
    ctx: &ApiContext,
) -> Result<()> {
    if request.has_query_token() {
        return write_json_response(
            &mut stream,
            400,
            r#"{"error":"token_query_param_not_allowed"}"#,
        );
    }
    let token = match request.bearer_token() {
        Some(token) => token,
        None => return write_json_response(&mut stream, 401, r#"{"error":"missing_token"}"#),
    };
    if let Err(err) = ctx.capability.validate(&token) {
        write_json_response(&mut stream, 401, r#"{"error":"invalid_token"}"#)?;
        return Err(err);
    }

    let switch = match request.path.as_str() {
        "/camera/activate" => SwitchRequest::Activate,
        "/camera/deactivate" => SwitchRequest::Deactivate,
        _ => SwitchRequest::Toggle,
    };
    // The acknowledgement wait runs off the accept loop so reads keep flowing.
    let control = ctx.control.clone();
    let ack_timeout = ctx.ack_timeout;
    spawn_bounded(
        stream,
        &ctx.pending_switches,
        MAX_PENDING_SWITCHES,
        "occupancy-switch",
        move |stream| {
            let outcome = match switch.apply(&control, ack_timeout) {
                Ok(outcome) => outcome,
                Err(err) => {
                    write_json_response(stream, 500, r#"{"error":"internal"}"#)?;
                    return Err(err);
                }
            };
            log::info!(
                "camera {} requested via api (acknowledged: {})",
                if outcome.active { "activation" } else { "deactivation" },
                outcome.acknowledged
            );
            let status = if outcome.acknowledged { 200 } else { 202 };
            write_json(stream, status, &outcome)
        },
    )
}

fn start_live_stream(stream: TcpStream, ctx: &ApiContext) -> Result<()> {
    let control = ctx.control.clone();
    let shutdown = ctx.shutdown.clone();
    spawn_bounded(
        stream,
        &ctx.live_streams,
        MAX_LIVE_STREAMS,
        "occupancy-feed",
        move |stream| stream_frames(stream, &control, &shutdown),
    )
}

/// Serve `stream` on its own thread, answering 503 once `limit` workers of
/// this kind are already busy.
fn spawn_bounded<F>(
    mut stream: TcpStream,
    busy: &Arc<AtomicUsize>,
    limit: usize,
    name: &str,
    work: F,
) -> Result<()>
where
    F: FnOnce(&mut TcpStream) -> Result<()> + Send + 'static,
{
    if busy.fetch_add(1, Ordering::SeqCst) >= limit {
        busy.fetch_sub(1, Ordering::SeqCst);
        return write_json_response(&mut stream, 503, r#"{"error":"busy"}"#);
    }
    let counter = busy.clone();
    let worker = name.to_string();
    let spawned = std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            if let Err(err) = work(&mut stream) {
                log::debug!("{} worker ended: {}", worker, err);
            }
            counter.fetch_sub(1, Ordering::SeqCst);
        });
    if let Err(err) = spawned {
        busy.fetch_sub(1, Ordering::SeqCst);
        return Err(err.into());
    }
    Ok(())
}

fn stream_frames(stream: &mut TcpStream, control: &Control, shutdown: &AtomicBool) -> Result<()> {
    stream.set_write_timeout(Some(Duration::from_secs(5)))?;
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: multipart/x-mixed-replace; boundary={}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        STREAM_BOUNDARY
    );
    stream.write_all(header.as_bytes())?;

    let mut last_seq = 0;
    while !shutdown.load(Ordering::SeqCst) {
        let Some((seq, jpeg)) = control.wait_frame(last_seq, Duration::from_millis(500))? else {
            continue;
        };
        last_seq = seq;
        let part = format!(
            "--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
            STREAM_BOUNDARY,
            jpeg.len()
        );
        stream.write_all(part.as_bytes())?;
        stream.write_all(&jpeg)?;
        stream.write_all(b"\r\n")?;
        stream.flush()?;
    }
    Ok(())
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
    let mut lines = text.split("\r\n");
    let request_line = lines.next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_lowercase(), v.trim().to_string());
        }
    }
    let (path, query) = match raw_path.split_once('?') {
        Some((path, query)) => (path, parse_query(query)),
        None => (raw_path, HashMap::new()),
    };
    Ok(HttpRequest {
        method: method.to_string(),
        path: path.to_string(),
        headers,
        query,
    })
}

fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn write_json<T: serde::Serialize>(stream: &mut TcpStream, status: u16, value: &T) -> Result<()> {
    let payload = serde_json::to_vec(value)?;
    write_response(stream, status, "application/json", &payload)
}

fn write_json_response(stream: &mut TcpStream, status: u16, body: &str) -> Result<()> {
    write_response(stream, status, "application/json", body.as_bytes())
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        202 => "HTTP/1.1 202 Accepted",
        400 => "HTTP/1.1 400 Bad Request",
        401 => "HTTP/1.1 401 Unauthorized",
        403 => "HTTP/1.1 403 Forbidden",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        503 => "HTTP/1.1 503 Service Unavailable",
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
    headers: HashMap<String, String>,
    query: HashMap<String, String>,
}

impl HttpRequest {
    fn bearer_token(&self) -> Option<String> {
        if let Some(value) = self.headers.get("authorization") {
            let parts: Vec<&str> = value.split_whitespace().collect();
            if parts.len() == 2 && parts[0].eq_ignore_ascii_case("bearer") {
                return Some(parts[1].to_string());
            }
        }
        None
    }

    fn has_query_token(&self) -> bool {
        self.query.contains_key("token")
    }

    /// `since`/`until` in epoch ms; either may be omitted. `None` if malformed
    /// or inverted.
    fn time_range(&self) -> Option<(EpochMillis, EpochMillis)> {
        let bound = |key: &str, default: EpochMillis| match self.query.get(key) {
            Some(value) => value.parse::<EpochMillis>().ok(),
            None => Some(default),
        };
        let since = bound("since", 0)?;
        let until = bound("until", EpochMillis::MAX)?;
        (since <= until).then_some((since, until))
    }
}

fn write_token_file(path: &Path, token: &str) -> Result<()> {
    std::fs::write(path, format!("{token}\n"))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(path, perms)?;
    }
    Ok(())
}

fn parse_hex32(value: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(value)?;
    if bytes.len() != 32 {
        return Err(anyhow!("token must be 32 bytes"));
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Ok(out)
}
