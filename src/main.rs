use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use ferry_bridge::{EventBridge, LogTail};
use ferry_config::{Config, UploadFailurePolicy};
use ferry_driver::RunLifecycleDriver;
use ferry_engine::{ChannelNotifier, HttpEngine};
use ferry_registry::RunRegistry;
use ferry_reporter::StatusReporter;
use ferry_server::AppState;
use ferry_streaming::{HttpTemplateSource, NoTemplates, SessionManager, TemplateSource};
use ferry_upload::UploadQueue;

/// Ferry - run tracker and artifact uploader for a node-graph engine
#[derive(Parser)]
#[command(name = "ferry")]
#[command(version, about, long_about = None)]
struct Cli {
  /// Path to a JSON config file
  #[arg(long, global = true, env = "FERRY_CONFIG")]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
  /// Start the worker
  Serve(ServeArgs),

  /// Print the effective configuration as JSON
  Config(ServeArgs),
}

/// Overrides applied on top of the config file.
#[derive(Args)]
struct ServeArgs {
  /// Address the HTTP server listens on
  #[arg(long, env = "FERRY_BIND")]
  bind: Option<SocketAddr>,

  /// Base URL of the engine's HTTP API
  #[arg(long, env = "FERRY_ENGINE_URL")]
  engine_url: Option<String>,

  /// Directory the engine writes outputs to
  #[arg(long, env = "FERRY_OUTPUT_DIR")]
  output_dir: Option<PathBuf>,

  /// Number of concurrent uploads
  #[arg(long, env = "FERRY_MAX_UPLOADS")]
  max_uploads: Option<usize>,

  /// Keep a run alive when one of its uploads fails
  #[arg(long)]
  best_effort_uploads: bool,

  /// Submit graphs with their seeds unchanged
  #[arg(long)]
  keep_seeds: bool,

  /// Relay every engine event to the status endpoint
  #[arg(long, env = "FERRY_FORWARD_ENGINE_EVENTS")]
  forward_engine_events: bool,

  /// Endpoint streaming sessions fetch workflow templates from
  #[arg(long, env = "FERRY_TEMPLATE_ENDPOINT")]
  template_endpoint: Option<String>,

  /// Engine log file streamed to event sessions
  #[arg(long, env = "FERRY_LOG_FILE")]
  log_file: Option<PathBuf>,
}

impl ServeArgs {
  fn apply(self, config: &mut Config) {
    if let Some(bind) = self.bind {
      config.server.bind = bind;
    }
    if let Some(url) = self.engine_url {
      config.engine.base_url = url;
    }
    if let Some(dir) = self.output_dir {
      config.upload.output_root = dir;
    }
    if let Some(max) = self.max_uploads {
      config.upload.max_concurrent = max;
    }
    if self.best_effort_uploads {
      config.upload.failure_policy = UploadFailurePolicy::BestEffort;
    }
    if self.keep_seeds {
      config.engine.randomize_seeds = false;
    }
    if self.forward_engine_events {
      config.engine.forward_engine_events = true;
    }
    if let Some(endpoint) = self.template_endpoint {
      config.streaming.template_endpoint = Some(endpoint);
    }
    if let Some(path) = self.log_file {
      config.logs.path = Some(path);
    }
  }
}

fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();

  let cli = Cli::parse();

  match cli.command {
    Some(Commands::Serve(args)) => {
      let config = load_config(cli.config, args)?;
      let rt = tokio::runtime::Runtime::new()?;
      rt.block_on(serve(config))?;
    }
    Some(Commands::Config(args)) => {
      let config = load_config(cli.config, args)?;
      println!("{}", serde_json::to_string_pretty(&config)?);
    }
    None => {
      println!("ferry - use --help to see available commands");
    }
  }

  Ok(())
}

fn load_config(path: Option<PathBuf>, args: ServeArgs) -> Result<Config> {
  let mut config = match path {
    Some(path) => Config::from_file(&path)
      .with_context(|| format!("failed to load config: {}", path.display()))?,
    None => Config::default(),
  };
  args.apply(&mut config);
  config.validate().context("invalid configuration")?;
  Ok(config)
}

async fn serve(config: Config) -> Result<()> {
  let cancel = CancellationToken::new();

  let reporter = Arc::new(StatusReporter::new(&config.reporter).context("failed to build http client")?);
  let bridge = Arc::new(EventBridge::new());
  let registry = Arc::new(RunRegistry::new(
    reporter.clone(),
    bridge.clone(),
    config.registry.retain_finished(),
  ));
  let uploads = Arc::new(UploadQueue::start(
    &config.upload,
    registry.clone(),
    reporter.clone(),
    cancel.clone(),
  ));

  let engine = Arc::new(
    HttpEngine::new(
      config.engine.base_url.clone(),
      config.reporter.connect_timeout(),
    )
    .context("failed to build engine client")?,
  );
  let driver = Arc::new(RunLifecycleDriver::new(
    engine,
    registry,
    uploads,
    &config.engine,
  ));

  let templates: Arc<dyn TemplateSource> = match &config.streaming.template_endpoint {
    Some(endpoint) => Arc::new(HttpTemplateSource::new(
      reporter,
      endpoint.clone(),
      config.streaming.auth_token.clone(),
    )),
    None => Arc::new(NoTemplates),
  };
  let sessions = Arc::new(SessionManager::new(driver.clone(), templates));

  let (sender, receiver) = mpsc::unbounded_channel();
  let mut state = AppState::new(driver.clone(), sessions, Arc::new(ChannelNotifier::new(sender)));

  if let Some(path) = &config.logs.path {
    let tail = Arc::new(LogTail::new(
      path.clone(),
      config.logs.poll_interval(),
      config.logs.snapshot_bytes,
    ));
    tokio::spawn(LogTail::clone(&tail).run(bridge, cancel.clone()));
    state = state.with_logs(tail);
  }

  let driver_task = {
    let cancel = cancel.clone();
    let sweep_interval = config.registry.sweep_interval();
    tokio::spawn(async move { driver.run(receiver, cancel, sweep_interval).await })
  };

  let shutdown = cancel.clone();
  tokio::spawn(async move {
    if let Err(e) = tokio::signal::ctrl_c().await {
      error!(error = %e, "failed to listen for ctrl-c");
      return;
    }
    info!("shutdown requested");
    shutdown.cancel();
  });

  info!(
    engine = %config.engine.base_url,
    output_root = %config.upload.output_root.display(),
    "ferry starting"
  );
  let served = ferry_server::serve(config.server.bind, state, cancel.clone()).await;
  cancel.cancel();
  driver_task.await.context("driver task panicked")?;

  served.context("server failed")
}
