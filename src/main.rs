use async_trait::async_trait;
use axum::{Extension, Router};
use std::path::Path;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use astro_montage::assembler::FfmpegAssembler;
use astro_montage::comfyui_client::ComfyUiVideoGenerator;
use astro_montage::config::AppConfig;
use astro_montage::elevenlabs_client::ElevenLabsSynthesizer;
use astro_montage::error::StageError;
use astro_montage::handlers::{self, AppState, ServiceStatus};
use astro_montage::music::DirectoryMusicLibrary;
use astro_montage::ollama_client::OllamaTextGenerator;
use astro_montage::publish_client::HttpPublisher;
use astro_montage::types::{Artifact, ContentUnit, Privacy, TranscriptionResult, VoiceOptions};
use astro_montage::whisper_client::WhisperTranscriber;
use astro_montage::workflow::artifacts::ArtifactDraft;
use astro_montage::workflow::stages::{
    PublishMetadata, Publisher, RenderPoll, RenderRequest, SpeechSynthesizer, TextGenerator, Transcriber, VideoGenerator,
};
use astro_montage::workflow::{
    ArtifactStore, BatchCoordinator, Collaborators, PipelineRunner, ResourceScheduler, RunCheckpointer, RunRegistry,
    StagePlan,
};
use astro_montage::{db, middleware, utils};

#[tokio::main]
async fn main() {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    if let Err(e) = init_logging() {
        eprintln!("Failed to initialize logging: {}", e);
        std::process::exit(1);
    }

    let config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("❌ Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = std::fs::create_dir_all(&config.output_dir) {
        tracing::warn!("Failed to create output directory {}: {}", config.output_dir.display(), e);
    } else {
        tracing::info!("Output directory ready: {}", config.output_dir.display());
    }

    if let Err(e) = utils::check_ffmpeg_available().await {
        tracing::warn!("{} Assembly stages will fail until it is installed.", e);
    }

    // Recovery log is optional
    let mut registry = RunRegistry::new();
    let mut checkpointer = None;
    if let Some(url) = &config.database_url {
        match db::create_pool(url).await {
            Ok(pool) => {
                let cp = Arc::new(RunCheckpointer::new(pool));
                match cp.setup().await {
                    Ok(_) => {
                        tracing::info!("✅ Run checkpointing enabled (PostgreSQL)");
                        registry = registry.with_checkpointer(cp.clone());
                        checkpointer = Some(cp);
                    }
                    Err(e) => tracing::error!("❌ Failed to setup run checkpointing: {}", e),
                }
            }
            Err(e) => tracing::error!("❌ Failed to connect to database: {}", e),
        }
    } else {
        tracing::info!("DATABASE_URL not set. Runs are kept in memory only.");
    }
    let registry = Arc::new(registry);

    let (collaborators, services) = build_collaborators(&config);
    let assembler = collaborators.assembler.clone();

    let scheduler = Arc::new(ResourceScheduler::new(&config.pools));
    let store = Arc::new(ArtifactStore::new());
    let plan = StagePlan::standard(collaborators, config.poll.clone(), config.cues.clone());
    let runner = Arc::new(PipelineRunner::new(
        plan,
        scheduler,
        store.clone(),
        registry.clone(),
        config.runner.clone(),
    ));
    let batches = Arc::new(BatchCoordinator::new(runner.clone(), assembler));

    let shared_state = Arc::new(AppState {
        runner,
        batches,
        services,
    });

    // Retention: evict finished runs and their artifact metadata
    {
        let registry = registry.clone();
        let store = store.clone();
        let retention_hours = config.run_retention_hours;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(3600));
            loop {
                interval.tick().await;
                let evicted = registry.cleanup_old(retention_hours).await;
                let mut removed = 0;
                for id in &evicted {
                    removed += store.remove_owner(id).await;
                }
                if removed > 0 {
                    tracing::info!("🧹 Dropped {} artifact records", removed);
                }
                if let Some(cp) = &checkpointer {
                    match cp.cleanup_old_checkpoints(30).await {
                        Ok(n) if n > 0 => tracing::info!("🧹 Deleted {} old checkpoints", n),
                        Ok(_) => {}
                        Err(e) => tracing::warn!("Checkpoint cleanup failed: {}", e),
                    }
                }
            }
        });
    }

    let app = Router::new()
        .merge(handlers::workflow::workflow_routes())
        .merge(handlers::events::event_routes())
        .merge(handlers::status::status_routes())
        .layer(axum::middleware::from_fn(middleware::logging::request_logging_middleware))
        .layer(CorsLayer::permissive())
        .layer(Extension(shared_state));

    let listener = match tokio::net::TcpListener::bind(&config.bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("❌ Failed to bind {}: {}", config.bind_addr, e);
            std::process::exit(1);
        }
    };
    tracing::info!("🚀 listening on {}", config.bind_addr);
    if let Err(e) = axum::serve(listener, app.into_make_service_with_connect_info::<std::net::SocketAddr>()).await {
        tracing::error!("Server error: {}", e);
    }
}

/// Wire one adapter per collaborator; missing endpoints get a stand-in that
/// fails the stage with a validation error
fn build_collaborators(config: &AppConfig) -> (Collaborators, Vec<ServiceStatus>) {
    let endpoints = &config.endpoints;
    let mut services = Vec::new();

    let text: Arc<dyn TextGenerator> = match &endpoints.ollama_url {
        Some(url) => {
            tracing::info!("Initializing Ollama text generator ({})...", endpoints.ollama_model);
            services.push(ServiceStatus::new("ollama", true));
            Arc::new(OllamaTextGenerator::new(url.clone(), endpoints.ollama_model.clone()))
        }
        None => {
            tracing::warn!("OLLAMA_URL not found. Text generation will fail.");
            services.push(ServiceStatus::new("ollama", false));
            Arc::new(Unconfigured("OLLAMA_URL"))
        }
    };

    let speech: Arc<dyn SpeechSynthesizer> = match &endpoints.eleven_labs_api_key {
        Some(api_key) => {
            tracing::info!("Initializing Eleven Labs voice synthesis...");
            services.push(ServiceStatus::new("eleven_labs", true));
            Arc::new(ElevenLabsSynthesizer::new(api_key.clone(), endpoints.eleven_labs_voice_id.clone()))
        }
        None => {
            tracing::warn!("ELEVEN_LABS_API_KEY not found. Speech synthesis will fail.");
            services.push(ServiceStatus::new("eleven_labs", false));
            Arc::new(Unconfigured("ELEVEN_LABS_API_KEY"))
        }
    };

    let video: Arc<dyn VideoGenerator> = match &endpoints.comfyui_url {
        Some(url) => {
            tracing::info!("Initializing ComfyUI render client ({})...", url);
            services.push(ServiceStatus::new("comfyui", true));
            Arc::new(ComfyUiVideoGenerator::new(url.clone()))
        }
        None => {
            tracing::warn!("COMFYUI_URL not found. Video generation will fail.");
            services.push(ServiceStatus::new("comfyui", false));
            Arc::new(Unconfigured("COMFYUI_URL"))
        }
    };

    let transcriber: Arc<dyn Transcriber> = match &endpoints.whisper_url {
        Some(url) => {
            tracing::info!("Initializing Whisper transcription client...");
            services.push(ServiceStatus::new("whisper", true));
            Arc::new(WhisperTranscriber::new(url.clone()))
        }
        None => {
            tracing::warn!("WHISPER_URL not found. Transcription will fail.");
            services.push(ServiceStatus::new("whisper", false));
            Arc::new(Unconfigured("WHISPER_URL"))
        }
    };

    let publisher: Arc<dyn Publisher> = match &endpoints.publish_url {
        Some(url) => {
            tracing::info!("Initializing publishing client...");
            services.push(ServiceStatus::new("publisher", true));
            Arc::new(HttpPublisher::new(url.clone(), endpoints.publish_token.clone()))
        }
        None => {
            tracing::info!("PUBLISH_URL not set. Runs requesting publication will record a failed Publish stage.");
            Arc::new(Unconfigured("PUBLISH_URL"))
        }
    };

    services.push(ServiceStatus::new("ffmpeg", true));

    let collaborators = Collaborators {
        text,
        speech,
        video,
        transcriber,
        assembler: Arc::new(FfmpegAssembler::new()),
        music: Arc::new(DirectoryMusicLibrary::new(endpoints.music_file.clone())),
        publisher,
    };
    (collaborators, services)
}

/// Stand-in for a collaborator whose endpoint is not configured
struct Unconfigured(&'static str);

impl Unconfigured {
    fn error(&self) -> StageError {
        StageError::Validation(format!("{} is not configured", self.0))
    }
}

#[async_trait]
impl TextGenerator for Unconfigured {
    async fn generate(&self, _unit: &ContentUnit) -> Result<String, StageError> {
        Err(self.error())
    }
}

#[async_trait]
impl SpeechSynthesizer for Unconfigured {
    async fn synthesize(&self, _text: &str, _voice: &VoiceOptions, _out_dir: &Path) -> Result<ArtifactDraft, StageError> {
        Err(self.error())
    }
}

#[async_trait]
impl VideoGenerator for Unconfigured {
    async fn submit(&self, _request: &RenderRequest) -> Result<String, StageError> {
        Err(self.error())
    }

    async fn poll(&self, _job_id: &str, _request: &RenderRequest) -> Result<RenderPoll, StageError> {
        Err(self.error())
    }

    async fn cancel(&self, _job_id: &str) -> Result<(), StageError> {
        Ok(())
    }
}

#[async_trait]
impl Transcriber for Unconfigured {
    async fn transcribe(&self, _audio: &Artifact) -> Result<TranscriptionResult, StageError> {
        Err(self.error())
    }
}

#[async_trait]
impl Publisher for Unconfigured {
    async fn upload(&self, _video: &Artifact, _metadata: &PublishMetadata, _privacy: Privacy) -> Result<String, StageError> {
        Err(StageError::Upload(format!("{} is not configured", self.0)))
    }
}

// Production-grade logging configuration
fn init_logging() -> Result<(), Box<dyn std::error::Error>> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cfg!(debug_assertions) {
            "debug,astro_montage=trace,sqlx=info,reqwest=info,hyper=info,tower=info".to_string()
        } else {
            "info,astro_montage=info,sqlx=warn,reqwest=warn,hyper=warn,tower=warn".to_string()
        }
    });

    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&log_level))?;

    let fmt_layer = if std::env::var("LOG_FORMAT").as_deref() == Ok("json") {
        // JSON logging for log aggregation
        fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .with_target(true)
            .with_thread_ids(true)
            .with_thread_names(true)
            .boxed()
    } else {
        fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_thread_names(false)
            .with_file(true)
            .with_line_number(true)
            .boxed()
    };

    tracing_subscriber::registry().with(env_filter).with(fmt_layer).init();

    tracing::info!("🔮 AstroMontage starting up...");
    tracing::info!("Version: {}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Build mode: {}", if cfg!(debug_assertions) { "development" } else { "production" });
    tracing::info!("Log level: {}", log_level);

    Ok(())
}
