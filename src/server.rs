use std::collections::HashMap;
use std::future::Future;
use std::io::Cursor;
use std::str;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::{json, Map, Value};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::time::{timeout, Duration};
use tracing::{debug, error, info, warn};

use crate::config::AppConfig;
use crate::controller::{Capabilities, StartOutcome, WorkloadController};
use crate::errors::ControlError;
use crate::orchestrator::{ConfigOutcome, PendingRestart};
use crate::settings::WorkloadSettings;
use crate::transcode::ScriptVariant;

const MAX_HEADER_BYTES: usize = 16 * 1024;
const MAX_FORM_BYTES: u64 = 64 * 1024;
const HEADER_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn run_foreground(config: AppConfig) -> Result<()> {
    config.ensure_layout()?;
    let capabilities = Capabilities::system(&config)?;
    let controller = Arc::new(WorkloadController::new(&config, capabilities));
    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("failed to bind control API on {}", config.listen_addr))?;

    info!(
        "radarctl control API started at {} (artifact {})",
        listener.local_addr()?,
        config.artifact_path.display()
    );

    serve(listener, controller, async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!("failed to wait for CTRL-C signal: {err}");
        }
    })
    .await
}

/// Accepts connections until `shutdown` resolves. Each connection is handled
/// on its own task.
pub async fn serve<F>(
    listener: TcpListener,
    controller: Arc<WorkloadController>,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            incoming = listener.accept() => {
                match incoming {
                    Ok((stream, peer)) => {
                        let controller = Arc::clone(&controller);
                        tokio::spawn(async move {
                            if let Err(err) = handle_connection(stream, controller).await {
                                warn!("failed to handle API client {peer}: {err:#}");
                            }
                        });
                    }
                    Err(err) => error!("control API accept failed: {err}"),
                }
            }
            _ = &mut shutdown => {
                info!("received shutdown signal; control API stopped");
                break;
            }
        }
    }
    Ok(())
}

/// One request per connection. The handler runs on its own task holding the
/// read half; the write half stays here so a panicking handler still gets a
/// 500. A pending restart is only fired after the response is flushed and the
/// write side is shut down.
async fn handle_connection<S>(stream: S, controller: Arc<WorkloadController>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(stream);

    let request = match read_http_request(&mut reader).await {
        Ok(request) => request,
        Err(err) => {
            let response = HttpResponse::error(400, format!("{err:#}"));
            write_http_response(&mut writer, response.status_code, &response.body).await?;
            return Err(err);
        }
    };
    debug!("{} {}", request.method, request.path);

    let handler = tokio::spawn(async move { route(request, reader, &controller).await });
    let Routed { response, restart } = match handler.await {
        Ok(routed) => routed,
        Err(err) => {
            error!("request handler failed: {err}");
            Routed::from(HttpResponse::error(500, "internal error"))
        }
    };

    write_http_response(&mut writer, response.status_code, &response.body).await?;
    if let Err(err) = writer.shutdown().await {
        debug!("failed to shut down API connection: {err}");
    }

    if let Some(pending) = restart {
        pending.spawn();
    }
    Ok(())
}

async fn route<R>(request: HttpRequest, reader: R, controller: &WorkloadController) -> Routed
where
    R: AsyncRead + Unpin,
{
    let Some(action) = request.path.strip_prefix("/radar/").map(str::to_string) else {
        return HttpResponse::error(404, "not found").into();
    };
    let method = request.method.clone();

    match action.as_str() {
        "start" if method == "POST" => match controller.start().await {
            Ok(StartOutcome::Launched) => {
                HttpResponse::ok("radar started").with("outcome", json!(StartOutcome::Launched))
            }
            Ok(StartOutcome::AlreadyRunning) => HttpResponse::ok("radar is already running")
                .with("outcome", json!(StartOutcome::AlreadyRunning)),
            Err(err) => error_response(&err),
        }
        .into(),
        "stop" if method == "POST" => match controller.stop().await {
            Ok(terminated) => HttpResponse::ok("radar stopped").with("terminated", json!(terminated)),
            Err(err) => error_response(&err),
        }
        .into(),
        "status" if method == "POST" || method == "GET" => match controller.status().await {
            Ok(state) => HttpResponse::ok(state.to_string()).with("state", json!(state)),
            Err(err) => error_response(&err),
        }
        .into(),
        "log" if method == "GET" => read_log(&request, controller).into(),
        "artifact" if method == "GET" => HttpResponse::ok("artifact info")
            .with("artifact", json!(controller.artifact_info()))
            .into(),
        "artifact" if method == "PUT" || method == "POST" => {
            upload(request, reader, controller).await.into()
        }
        "artifact" if method == "DELETE" => match controller.delete().await {
            Ok(()) => HttpResponse::ok("artifact deleted"),
            Err(err) => error_response(&err),
        }
        .into(),
        "restart" if method == "POST" => Routed {
            response: HttpResponse::ok("service restart scheduled"),
            restart: Some(controller.request_restart()),
        },
        "config" if method == "GET" => {
            let settings = controller.config().await.redacted_for_transport();
            HttpResponse::ok("current configuration")
                .with("config", json!(settings))
                .into()
        }
        "config" if method == "POST" => save_config(request, reader, controller).await,
        "start" | "stop" | "status" | "log" | "artifact" | "restart" | "config" => {
            HttpResponse::error(405, "method not allowed").into()
        }
        _ => HttpResponse::error(404, "unknown action").into(),
    }
}

fn read_log(request: &HttpRequest, controller: &WorkloadController) -> HttpResponse {
    let variant = match request.query.get("lang") {
        Some(value) => match value.parse::<ScriptVariant>() {
            Ok(variant) => variant,
            Err(err) => return HttpResponse::error(400, err.to_string()),
        },
        None => ScriptVariant::default(),
    };
    let tail = match request.query.get("lines") {
        Some(value) => match value.trim().parse::<usize>() {
            Ok(lines) if lines > 0 => Some(lines),
            _ => return HttpResponse::error(400, "lines must be a positive integer"),
        },
        None => None,
    };

    match controller.read_log(variant, tail) {
        Ok(text) => HttpResponse::ok("log read")
            .with("available", json!(true))
            .with("lang", json!(variant))
            .with("log", json!(text)),
        Err(err) => match err.downcast_ref::<ControlError>() {
            Some(ControlError::LogUnavailable(_)) => {
                HttpResponse::ok("log not yet created").with("available", json!(false))
            }
            _ => error_response(&err),
        },
    }
}

async fn upload<R>(request: HttpRequest, reader: R, controller: &WorkloadController) -> HttpResponse
where
    R: AsyncRead + Unpin,
{
    let Some(length) = request.content_length else {
        return HttpResponse::error(411, "upload requires a Content-Length header");
    };
    let mut body = request_body(request.body_prefix, reader, length);
    match controller.upload(&mut body, Some(length)).await {
        Ok(info) => HttpResponse::ok("artifact uploaded").with("artifact", json!(info)),
        Err(err) => error_response(&err),
    }
}

async fn save_config<R>(request: HttpRequest, reader: R, controller: &WorkloadController) -> Routed
where
    R: AsyncRead + Unpin,
{
    let length = request.content_length.unwrap_or(0);
    if length > MAX_FORM_BYTES {
        return HttpResponse::error(413, "configuration body too large").into();
    }
    let mut raw = Vec::with_capacity(length as usize);
    let read = request_body(request.body_prefix, reader, length)
        .read_to_end(&mut raw)
        .await;
    if let Err(err) = read {
        return HttpResponse::error(400, format!("failed to read request body: {err}")).into();
    }

    let candidate = match parse_settings(request.headers.get("content-type"), &raw) {
        Ok(candidate) => candidate,
        Err(err) => return HttpResponse::error(400, format!("{err:#}")).into(),
    };

    match controller.save_config(candidate).await {
        Ok(ConfigOutcome::Restarting(pending)) => Routed {
            response: HttpResponse::ok("configuration saved; restarting service")
                .with("restarting", json!(true)),
            restart: Some(pending),
        },
        Ok(ConfigOutcome::AppliesNextLaunch) => {
            HttpResponse::ok("configuration saved; applies on next start")
                .with("restarting", json!(false))
                .into()
        }
        Err(err) => error_response(&err).into(),
    }
}

/// Accepts a JSON object or an urlencoded form with `credential` and `port`.
fn parse_settings(content_type: Option<&String>, raw: &[u8]) -> Result<WorkloadSettings> {
    let is_json = match content_type {
        Some(value) => value.to_ascii_lowercase().contains("json"),
        None => raw.iter().find(|b| !b.is_ascii_whitespace()) == Some(&b'{'),
    };
    if is_json {
        return serde_json::from_slice(raw).context("invalid JSON configuration body");
    }

    let mut settings = WorkloadSettings {
        credential: String::new(),
        port: String::new(),
    };
    for (key, value) in url::form_urlencoded::parse(raw) {
        match key.as_ref() {
            "credential" => settings.credential = value.into_owned(),
            "port" => settings.port = value.trim().to_string(),
            other => debug!("ignoring unknown configuration field {other:?}"),
        }
    }
    Ok(settings)
}

fn request_body<R>(prefix: Vec<u8>, reader: R, length: u64) -> impl AsyncRead + Unpin
where
    R: AsyncRead + Unpin,
{
    Cursor::new(prefix).chain(reader).take(length)
}

fn error_response(err: &anyhow::Error) -> HttpResponse {
    let status_code = match err.downcast_ref::<ControlError>() {
        Some(ControlError::ArtifactNotFound(_)) | Some(ControlError::LogUnavailable(_)) => 404,
        Some(ControlError::ConfigValidation(_)) => 400,
        Some(ControlError::UploadTooLarge { .. }) => 413,
        Some(ControlError::UploadStalled { .. }) => 408,
        _ => 500,
    };
    if status_code == 500 {
        warn!("control request failed: {err:#}");
    }
    HttpResponse::error(status_code, format!("{err:#}"))
}

async fn read_http_request<R>(stream: &mut R) -> Result<HttpRequest>
where
    R: AsyncRead + Unpin,
{
    let mut buffer = Vec::with_capacity(1024);
    let mut chunk = [0_u8; 1024];

    let header_end = loop {
        let read = timeout(HEADER_TIMEOUT, stream.read(&mut chunk))
            .await
            .context("timed out while reading request headers")?
            .context("failed to read request")?;

        if read == 0 {
            anyhow::bail!("connection closed before request headers were complete");
        }
        buffer.extend_from_slice(&chunk[..read]);

        if let Some(position) = buffer.windows(4).position(|window| window == b"\r\n\r\n") {
            break position;
        }
        if buffer.len() > MAX_HEADER_BYTES {
            anyhow::bail!("request headers exceed maximum size");
        }
    };

    let head = str::from_utf8(&buffer[..header_end]).context("request head is not valid UTF-8")?;
    let mut lines = head.split("\r\n");
    let request_line = lines.next().context("missing request line")?.trim();
    let mut request_parts = request_line.split_whitespace();
    let method = request_parts
        .next()
        .context("missing request method")?
        .to_ascii_uppercase();
    let target = request_parts.next().context("missing request path")?;

    let (path, query) = match target.split_once('?') {
        Some((path, query)) => (path.to_string(), parse_query(query)),
        None => (target.to_string(), HashMap::new()),
    };

    let mut headers = HashMap::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }
    let content_length = match headers.get("content-length") {
        Some(value) => Some(
            value
                .parse::<u64>()
                .with_context(|| format!("invalid Content-Length {value:?}"))?,
        ),
        None => None,
    };

    Ok(HttpRequest {
        method,
        path,
        query,
        headers,
        content_length,
        body_prefix: buffer[header_end + 4..].to_vec(),
    })
}

fn parse_query(query: &str) -> HashMap<String, String> {
    url::form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect()
}

async fn write_http_response<W>(stream: &mut W, status_code: u16, body: &Value) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let reason = match status_code {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        411 => "Length Required",
        413 => "Payload Too Large",
        500 => "Internal Server Error",
        _ => "OK",
    };
    let body_text = serde_json::to_string(body).context("failed to encode API response")?;
    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: application/json; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status_code,
        reason,
        body_text.len(),
        body_text
    );

    stream
        .write_all(response.as_bytes())
        .await
        .context("failed to write API response")?;
    stream.flush().await.context("failed to flush API response")
}

struct HttpRequest {
    method: String,
    path: String,
    query: HashMap<String, String>,
    headers: HashMap<String, String>,
    content_length: Option<u64>,
    /// Body bytes that arrived together with the headers.
    body_prefix: Vec<u8>,
}

struct HttpResponse {
    status_code: u16,
    body: Value,
}

impl HttpResponse {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            status_code: 200,
            body: json!({
                "ok": true,
                "message": message.into()
            }),
        }
    }

    fn error(status_code: u16, message: impl Into<String>) -> Self {
        Self {
            status_code,
            body: json!({
                "ok": false,
                "message": message.into()
            }),
        }
    }

    fn with(mut self, key: &str, value: Value) -> Self {
        if let Value::Object(map) = &mut self.body {
            map.insert(key.to_string(), value);
        } else {
            let mut map = Map::new();
            map.insert(key.to_string(), value);
            self.body = Value::Object(map);
        }
        self
    }
}

struct Routed {
    response: HttpResponse,
    restart: Option<PendingRestart>,
}

impl From<HttpResponse> for Routed {
    fn from(response: HttpResponse) -> Self {
        Self {
            response,
            restart: None,
        }
    }
}
