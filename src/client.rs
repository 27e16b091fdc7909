use std::path::PathBuf;

use anyhow::{Context, Result};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

/// Request payloads the CLI sends to the control API.
#[derive(Debug, Clone)]
pub enum RequestBody {
    Json(Value),
    /// Streamed from disk as a raw body.
    File(PathBuf),
}

#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Value,
}

impl ApiResponse {
    pub fn ok(&self) -> bool {
        self.body["ok"].as_bool().unwrap_or(false) && (200..300).contains(&self.status)
    }

    pub fn message(&self) -> &str {
        self.body["message"].as_str().unwrap_or("")
    }
}

pub async fn send_request(
    api_addr: &str,
    method: &str,
    path: &str,
    body: Option<RequestBody>,
) -> Result<ApiResponse> {
    let mut stream = TcpStream::connect(api_addr)
        .await
        .with_context(|| {
            format!("failed to connect to radarctl at {api_addr} (is `radarctl serve` running?)")
        })?;
    write_request(&mut stream, api_addr, method, path, body).await?;
    read_response(&mut stream).await
}

async fn write_request<S>(
    stream: &mut S,
    host: &str,
    method: &str,
    path: &str,
    body: Option<RequestBody>,
) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let head = |content_type: &str, length: u64| {
        format!(
            "{method} {path} HTTP/1.1\r\nHost: {host}\r\nContent-Type: {content_type}\r\nContent-Length: {length}\r\nConnection: close\r\n\r\n"
        )
    };

    match body {
        None => {
            let request =
                format!("{method} {path} HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\n\r\n");
            stream
                .write_all(request.as_bytes())
                .await
                .context("failed to write API request")?;
        }
        Some(RequestBody::Json(value)) => {
            let payload = serde_json::to_vec(&value)?;
            stream
                .write_all(head("application/json", payload.len() as u64).as_bytes())
                .await
                .context("failed to write API request")?;
            stream
                .write_all(&payload)
                .await
                .context("failed to write API request body")?;
        }
        Some(RequestBody::File(path)) => {
            let mut file = tokio::fs::File::open(&path)
                .await
                .with_context(|| format!("failed to open {}", path.display()))?;
            let length = file
                .metadata()
                .await
                .with_context(|| format!("failed to stat {}", path.display()))?
                .len();
            stream
                .write_all(head("application/octet-stream", length).as_bytes())
                .await
                .context("failed to write API request")?;
            tokio::io::copy(&mut file, stream)
                .await
                .with_context(|| format!("failed to stream {}", path.display()))?;
        }
    }

    stream.flush().await.context("failed to flush API request")
}

async fn read_response<S>(stream: &mut S) -> Result<ApiResponse>
where
    S: AsyncRead + Unpin,
{
    let mut raw = Vec::new();
    stream
        .read_to_end(&mut raw)
        .await
        .context("failed to read API response")?;
    if raw.is_empty() {
        anyhow::bail!("radarctl closed the connection without a response");
    }

    let header_end = raw
        .windows(4)
        .position(|window| window == b"\r\n\r\n")
        .context("malformed API response")?;
    let head = String::from_utf8_lossy(&raw[..header_end]);
    let status = head
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse::<u16>().ok())
        .context("API response is missing a status code")?;
    let body = serde_json::from_slice(&raw[header_end + 4..])
        .with_context(|| format!("failed to decode API response (HTTP {status})"))?;

    Ok(ApiResponse { status, body })
}
