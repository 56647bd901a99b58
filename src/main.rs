use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::warn;

use watermark_mirror::{
    logging, Config, DriveClient, LocalTree, Orchestrator, ProgressReply, TaskStatus, TreeHandle,
};

#[derive(Parser)]
#[command(
    name = "watermark-mirror",
    about = "Mirror a folder tree, stamping every PDF with a semi-transparent logo"
)]
struct Args {
    /// Source folder: Drive id or URL, or a path relative to --local
    source: String,

    /// Watermark image (PNG or JPG)
    #[arg(long, default_value = "logo.png")]
    logo: PathBuf,

    /// Drive OAuth access token
    #[arg(long, env = "DRIVE_ACCESS_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Use this local directory as the tree instead of Drive
    #[arg(long, conflicts_with = "token")]
    local: Option<PathBuf>,

    /// JSON config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logo opacity in (0, 1]
    #[arg(long)]
    opacity: Option<f32>,

    /// Logo scale relative to its pixel size
    #[arg(long)]
    scale: Option<f32>,

    /// How often to poll progress, in milliseconds
    #[arg(long, default_value_t = 500)]
    poll_ms: u64,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    logging::init(args.verbose);

    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(opacity) = args.opacity {
        config.render.opacity = opacity;
    }
    if let Some(scale) = args.scale {
        config.render.scale = scale;
    }

    let client: TreeHandle = match (&args.local, &args.token) {
        (Some(dir), _) => Arc::new(LocalTree::new(dir)),
        (None, Some(token)) => Arc::new(DriveClient::new(token.as_str())),
        (None, None) => bail!("either --token (or DRIVE_ACCESS_TOKEN) or --local is required"),
    };
    let logo = std::fs::read(&args.logo)
        .with_context(|| format!("cannot read logo {}", args.logo.display()))?;

    let orchestrator = Orchestrator::new(config)?;
    let task_id = orchestrator.start(client, &args.source, &logo).await?;

    println!("  Source: {}", args.source);
    println!("  Logo:   {}", args.logo.display());
    println!("  Task:   {}", task_id);

    let poll = Duration::from_millis(args.poll_ms.max(10));
    let mut last_progress = None;
    let mut cancelling = false;
    loop {
        tokio::select! {
            _ = tokio::time::sleep(poll) => {}
            res = tokio::signal::ctrl_c(), if !cancelling => {
                if let Err(e) = res {
                    warn!("cannot listen for ctrl-c: {}", e);
                }
                println!("  Cancelling...");
                orchestrator.cancel(&task_id)?;
                cancelling = true;
            }
        }

        let snapshot = match orchestrator.progress(&task_id) {
            ProgressReply::Found(snapshot) => snapshot,
            ProgressReply::UnknownTask { task_id } => bail!("task {} disappeared", task_id),
        };

        if last_progress != Some(snapshot.progress) {
            println!(
                "  {:>3}%  {} uploaded, {} skipped",
                snapshot.progress, snapshot.uploaded, snapshot.skipped
            );
            last_progress = Some(snapshot.progress);
        }

        if snapshot.status.is_terminal() {
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
            match snapshot.status {
                TaskStatus::Failed => bail!(
                    "job failed: {}",
                    snapshot.error.as_deref().unwrap_or("unknown error")
                ),
                TaskStatus::Cancelled => println!("Cancelled."),
                _ => println!("Done."),
            }
            return Ok(());
        }
    }
}
