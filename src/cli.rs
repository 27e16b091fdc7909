use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::transcode::ScriptVariant;

const BUILD_VERSION: &str = env!("RADARCTL_BUILD_VERSION");
const HELP_TEMPLATE: &str = "\
{before-help}{name} {version}
{about-with-newline}
USAGE:
  {usage}

COMMANDS:
{subcommands}

OPTIONS:
{options}
{after-help}
";
const HELP_AFTER: &str = "\
Quick Command Map
  Service:
    serve, restart
  Workload:
    start, stop, status, logs/log
  Artifact:
    artifact, upload, delete/rm
  Settings:
    config show, config set

Examples
  radarctl serve
  radarctl upload ./RAY_DELTA_RADAR.exe --relaunch
  radarctl log --lang zh-tw --lines 50
  radarctl config set --credential admin666 --port 8080
";

#[derive(Debug, Parser)]
#[command(
    name = "radarctl",
    version = BUILD_VERSION,
    about = "Control service for a single wine-hosted radar workload",
    help_template = HELP_TEMPLATE,
    after_help = HELP_AFTER
)]
pub struct Cli {
    /// Control API address; defaults to RADARCTL_ADDR.
    #[arg(long, global = true)]
    pub addr: Option<String>,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the control API in the foreground.
    Serve,
    Start,
    Stop,
    Status,
    #[command(visible_alias = "log")]
    Logs {
        #[arg(long, default_value_t = ScriptVariant::Simplified)]
        lang: ScriptVariant,
        #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
        lines: Option<u64>,
    },
    /// Replace the artifact with a local file.
    Upload {
        file: PathBuf,
        /// Stop and start the workload so it runs the new build. This does
        /// not restart the control service; see `restart`.
        #[arg(long)]
        relaunch: bool,
    },
    #[command(visible_alias = "rm")]
    Delete,
    /// Restart the control service through its supervisor.
    Restart,
    Artifact,
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    Show,
    Set {
        #[arg(long)]
        credential: String,
        #[arg(long)]
        port: String,
    },
}
