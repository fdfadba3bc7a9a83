//! # NMSP Speech Bridge - Main Application Entry Point
//!
//! Stands in for the legacy speech-middleware endpoint a wearable dictation
//! client talks to: it accepts the client's streaming audio upload, runs it
//! through decode / gain / noise suppression / recognition and answers in the
//! multipart format the client expects.
//!
//! ## Startup Order:
//! 1. `.env` and tracing
//! 2. Configuration (defaults → `config.toml` → `APP_*` env → `HOST`/`PORT`), validated
//! 3. Language catalog fetch. Fatal if unreachable or malformed
//! 4. Engines (recognizer, codec, optional denoiser) and the session registry
//! 5. Shared state and the HTTP server
//!
//! ## Application Architecture:
//! - **audio**: frame parsing, sample processing, codec and noise seams, the pipeline
//! - **transcription**: recognizer seam, languages, session registry, Vosk client
//! - **protocol**: NMSP multipart reply rendering
//! - **handlers**: the recognition endpoint and debug recording endpoints
//! - **health**: heartbeat and metrics
//! - **middleware**: request logging and metrics collection
//! - **recordings**: optional debug capture of request audio
//! - **config / state / error**: configuration, shared state, HTTP error mapping

mod audio;
mod config;
mod error;
mod handlers;
mod health;
mod middleware;
mod protocol;
mod recordings;
mod state;
mod transcription;

use actix_web::{web, App, HttpServer};
use anyhow::{Context, Result};
use audio::{codec, denoise};
use config::AppConfig;
use recordings::RecordingStore;
use state::AppState;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use transcription::language::{HttpLanguageCatalog, LanguageCatalog, LanguageTag};
use transcription::registry::{LanguageSessionManager, SessionFactory};
use transcription::vosk::VoskServerFactory;
use transcription::engine::RecognizerFactory;

/// Set once SIGINT or SIGTERM arrives.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting {} v{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    info!(
        host = %config.server.host,
        port = config.server.port,
        default_language = %config.models.default_language,
        recognizer_url = %config.models.recognizer_url,
        codec = %config.audio.codec,
        gain = config.audio.gain,
        noise_suppression = config.audio.noise_suppression,
        noise_window = %config.audio.noise_window,
        "Configuration loaded"
    );

    let catalog = HttpLanguageCatalog::new(config.models.catalog_url.clone(), config.catalog_timeout())?;
    let recognizers = Arc::new(VoskServerFactory::new(
        config.models.recognizer_url.clone(),
        config.audio.sample_rate,
    ));
    let sessions = build_session_manager(&config, &catalog, recognizers).await?;

    let recordings = if config.debug.audio_debug {
        let store = RecordingStore::open(&config.debug.recordings_dir)?;
        info!(dir = %store.dir().display(), "Audio debugging enabled");
        Some(store)
    } else {
        None
    };

    let app_state = AppState::new(config.clone(), sessions, recordings)?;
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let audio_debug = config.debug.audio_debug;

    setup_signal_handlers();

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(middleware::MetricsMiddleware)
            .wrap(middleware::RequestLogging)
            .wrap(TracingLogger::default())
            .configure(|cfg| configure_routes(cfg, audio_debug))
    })
    .bind(&bind_addr)
    .with_context(|| format!("Failed to bind {}", bind_addr))?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Fetch the supported languages, build the session registry and activate
/// the default language.
///
/// ## Errors:
/// Fails when the catalog cannot be fetched, the codec is unknown, or the
/// default language is not in the catalog. Each of these is fatal at startup.
async fn build_session_manager(
    config: &AppConfig,
    catalog: &dyn LanguageCatalog,
    recognizers: Arc<dyn RecognizerFactory>,
) -> Result<Arc<LanguageSessionManager>> {
    let supported = catalog
        .fetch()
        .await
        .context("Unable to load the supported language catalog")?;

    let decoders = codec::decoder_factory(&config.audio.codec)?;
    let denoisers = config
        .audio
        .noise_suppression
        .then(denoise::moving_average_factory);

    let sessions = Arc::new(LanguageSessionManager::new(
        supported,
        SessionFactory::new(recognizers, decoders, denoisers),
        config.performance.max_concurrent_sessions,
    ));

    let default_language = LanguageTag::new(config.models.default_language.clone());
    sessions.activate(&default_language).await?;
    info!(
        language = %default_language,
        supported = sessions.supported_count(),
        "Session registry ready"
    );

    Ok(sessions)
}

/// Mount every route. Recording endpoints exist only with audio debugging on.
fn configure_routes(cfg: &mut web::ServiceConfig, audio_debug: bool) {
    cfg.route("/heartbeat", web::get().to(health::heartbeat))
        .route("/NmspServlet/", web::post().to(handlers::recognize))
        .route("/metrics", web::get().to(health::detailed_metrics));

    if audio_debug {
        cfg.route("/audio-debug", web::get().to(handlers::list_recordings))
            .route("/audio/{file}", web::get().to(handlers::serve_recording));
    }
}

/// Initialize tracing.
///
/// `RUST_LOG` controls the filter; without it the service logs its own
/// events at debug and actix at info.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "nmsp_speech_bridge=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .context("Failed to initialize tracing")?;

    Ok(())
}

/// Flip [`SHUTDOWN_SIGNAL`] on SIGTERM or SIGINT.
fn setup_signal_handlers() {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async {
        let (mut sigterm, mut sigint) = match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
            (Err(e), _) | (_, Err(e)) => {
                error!("Failed to install signal handlers: {}", e);
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}
