mod artifact;
mod cli;
mod client;
mod config;
mod controller;
mod errors;
mod launcher;
mod logging;
mod orchestrator;
mod process;
mod server;
mod settings;
mod storage;
mod supervisor;
mod transcode;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::json;
use tracing_subscriber::EnvFilter;

use crate::artifact::ArtifactInfo;
use crate::cli::{Cli, Commands, ConfigCommand};
use crate::client::{send_request, ApiResponse, RequestBody};
use crate::config::AppConfig;
use crate::transcode::ScriptVariant;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let mut config = AppConfig::load()?;
    if let Some(addr) = cli.addr {
        config.listen_addr = addr;
    }

    match cli.command {
        Commands::Serve => server::run_foreground(config).await,
        command => run_cli_command(command, &config.listen_addr).await,
    }
}

async fn run_cli_command(command: Commands, addr: &str) -> Result<()> {
    match command {
        Commands::Serve => anyhow::bail!("serve runs the API itself and is not a client command"),
        Commands::Start => {
            let response = call(addr, "POST", "/radar/start", None).await?;
            println!("{}", response.message());
        }
        Commands::Stop => {
            let response = call(addr, "POST", "/radar/stop", None).await?;
            println!(
                "{} ({} process(es) signalled)",
                response.message(),
                response.body["terminated"].as_u64().unwrap_or(0)
            );
        }
        Commands::Status => {
            let response = call(addr, "GET", "/radar/status", None).await?;
            println!("radar: {}", response.message());
        }
        Commands::Logs { lang, lines } => {
            let response = call(addr, "GET", &log_path(lang, lines), None).await?;
            if response.body["available"].as_bool().unwrap_or(false) {
                let text = response.body["log"].as_str().unwrap_or_default();
                println!("{}", text.trim_end());
            } else {
                println!("{}", response.message());
            }
        }
        Commands::Upload { file, relaunch } => {
            let response = call(
                addr,
                "PUT",
                "/radar/artifact",
                Some(RequestBody::File(file.clone())),
            )
            .await?;
            let info = artifact_from(&response)?;
            println!("uploaded {}", file.display());
            println!("{}", render_artifact(&info));

            if relaunch {
                let stopped = call(addr, "POST", "/radar/stop", None).await?;
                println!("{}", stopped.message());
                let started = call(addr, "POST", "/radar/start", None).await?;
                println!("{}", started.message());
            }
        }
        Commands::Delete => {
            let response = call(addr, "DELETE", "/radar/artifact", None).await?;
            println!("{}", response.message());
        }
        Commands::Restart => {
            let response = call(addr, "POST", "/radar/restart", None).await?;
            println!("{}", response.message());
        }
        Commands::Artifact => {
            let response = call(addr, "GET", "/radar/artifact", None).await?;
            println!("{}", render_artifact(&artifact_from(&response)?));
        }
        Commands::Config { command } => match command {
            ConfigCommand::Show => {
                let response = call(addr, "GET", "/radar/config", None).await?;
                let config = &response.body["config"];
                println!(
                    "credential: {}",
                    config["credential"].as_str().unwrap_or("-")
                );
                println!("port:       {}", config["port"].as_str().unwrap_or("-"));
            }
            ConfigCommand::Set { credential, port } => {
                let body = json!({ "credential": credential, "port": port });
                let response =
                    call(addr, "POST", "/radar/config", Some(RequestBody::Json(body))).await?;
                println!("{}", response.message());
            }
        },
    }

    Ok(())
}

async fn call(
    addr: &str,
    method: &str,
    path: &str,
    body: Option<RequestBody>,
) -> Result<ApiResponse> {
    let response = send_request(addr, method, path, body).await?;
    expect_ok(response)
}

fn expect_ok(response: ApiResponse) -> Result<ApiResponse> {
    if response.ok() {
        Ok(response)
    } else {
        anyhow::bail!("{} (HTTP {})", response.message(), response.status)
    }
}

fn log_path(lang: ScriptVariant, lines: Option<u64>) -> String {
    match lines {
        Some(lines) => format!("/radar/log?lang={lang}&lines={lines}"),
        None => format!("/radar/log?lang={lang}"),
    }
}

fn artifact_from(response: &ApiResponse) -> Result<ArtifactInfo> {
    serde_json::from_value(response.body["artifact"].clone())
        .context("server returned malformed artifact details")
}

fn render_artifact(info: &ArtifactInfo) -> String {
    if !info.exists {
        return format!("artifact: {} (absent)", info.path.display());
    }

    let mut lines = vec![
        format!("artifact: {}", info.path.display()),
        format!("size:     {}", format_size(info.size)),
    ];
    if let Some(modified) = info.modified {
        lines.push(format!("modified: {modified} (unix seconds)"));
    }
    if let Some(sha256) = &info.sha256 {
        lines.push(format!("sha256:   {sha256}"));
    }
    lines.join("\n")
}

fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();
}
