use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use tradechat_core::ChatController;
use tradechat_core::models::ErrorStore;
use tradechat_core::repositories::{TranscriptJsonRepository, TranscriptRepository};
use tradechat_core::services::{ErrorCollectorLayer, HttpChatBackend};
use tradechat_core::settings::{ChatSettings, SettingsJsonRepository, SettingsRepository};

mod repl;

/// Diagnostics kept for `/errors`
const MAX_ERROR_ENTRIES: usize = 200;

#[derive(Parser, Debug)]
#[command(name = "tradechat")]
#[command(about = "Terminal client for the trading assistant chat", long_about = None)]
struct Args {
    /// Chat API base URL, e.g. http://localhost:8000/api/v1
    #[arg(long)]
    api_url: Option<String>,

    /// Push socket base URL (derived from the API URL when omitted)
    #[arg(long)]
    ws_url: Option<String>,

    /// Bearer token sent with every request
    #[arg(long)]
    token: Option<String>,

    /// Milliseconds to wait for the push socket before using the fallback
    #[arg(long)]
    fallback_timeout_ms: Option<u64>,

    /// Stream replies over SSE when the push socket is unavailable
    #[arg(long)]
    streaming_http: bool,

    /// Do not open the push socket
    #[arg(long)]
    no_socket: bool,

    /// Do not cache the transcript on disk
    #[arg(long)]
    no_cache: bool,

    /// Resume an existing session
    #[arg(long)]
    session: Option<String>,

    /// Settings file (defaults to the user config directory)
    #[arg(long)]
    config: Option<PathBuf>,
}

impl Args {
    fn apply(&self, settings: &mut ChatSettings) {
        if let Some(url) = &self.api_url {
            settings.api_base_url = url.clone();
        }
        if let Some(url) = &self.ws_url {
            settings.ws_base_url = Some(url.clone());
        }
        if let Some(token) = &self.token {
            settings.auth_token = Some(token.clone());
        }
        if let Some(ms) = self.fallback_timeout_ms {
            settings.fallback_timeout_ms = ms;
        }
        if self.streaming_http {
            settings.streaming_http = true;
        }
        if self.no_cache {
            settings.cache_transcript = false;
        }
    }
}

async fn load_settings(args: &Args) -> Result<ChatSettings> {
    let repository = match &args.config {
        Some(path) => SettingsJsonRepository::with_path(path),
        None => SettingsJsonRepository::new().context("Failed to locate settings")?,
    };

    let mut settings = match repository.load().await {
        Ok(settings) => settings,
        Err(e) => {
            warn!(error = %e, path = %repository.path().display(), "Invalid settings file, using defaults");
            ChatSettings::default()
        }
    };
    args.apply(&mut settings);
    Ok(settings)
}

fn transcript_repository(settings: &ChatSettings) -> Option<Arc<dyn TranscriptRepository>> {
    if !settings.cache_transcript {
        return None;
    }
    match TranscriptJsonRepository::new() {
        Ok(repository) => Some(Arc::new(repository)),
        Err(e) => {
            warn!(error = %e, "Transcript cache unavailable");
            None
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let error_store = ErrorStore::new(MAX_ERROR_ENTRIES);
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(ErrorCollectorLayer::new(error_store.clone()))
        .init();

    let settings = load_settings(&args).await?;
    info!(api = %settings.api_base(), "Starting tradechat");

    let backend = Arc::new(HttpChatBackend::new(&settings).context("Failed to build HTTP client")?);
    let repository = transcript_repository(&settings);
    let controller = ChatController::new(settings, backend, repository);

    if let Some(session_id) = &args.session {
        match controller.restore(session_id).await {
            Ok(found) => info!(session_id = %session_id, cached = found, "Resumed session"),
            Err(e) => {
                warn!(error = %e, "No cached transcript, resuming session without history");
                controller.session().resume(session_id.clone());
            }
        }
    }

    let printer = repl::spawn_printer(controller.clone());
    repl::print_history(&controller);

    if !args.no_socket {
        // A missing session is already reported in the transcript
        let _ = controller.connect_socket().await;
    }

    repl::run(&controller, &error_store).await?;
    printer.abort();
    Ok(())
}
