// config.rs - Environment-driven configuration (.env is loaded by the binary via dotenvy)
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::workflow::runner::{RetryPolicy, RunnerConfig};
use crate::workflow::scheduler::PoolSizes;
use crate::workflow::stages::PollConfig;
use crate::workflow::sync_planner::CueConfig;

/// Collaborator endpoints; a missing value disables the matching adapter
#[derive(Debug, Clone, Default)]
pub struct CollaboratorEndpoints {
    pub ollama_url: Option<String>,
    pub ollama_model: String,
    pub comfyui_url: Option<String>,
    pub eleven_labs_api_key: Option<String>,
    pub eleven_labs_voice_id: String,
    pub whisper_url: Option<String>,
    pub music_file: PathBuf,
    pub publish_url: Option<String>,
    pub publish_token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    pub output_dir: PathBuf,
    pub pools: PoolSizes,
    pub runner: RunnerConfig,
    pub poll: PollConfig,
    pub cues: CueConfig,
    pub run_retention_hours: i64,
    pub database_url: Option<String>,
    pub endpoints: CollaboratorEndpoints,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let output_dir = PathBuf::from(env_string("OUTPUT_DIR", "final_montage"));

        let pools = PoolSizes {
            text: env_parse("POOL_TEXT", 2)?,
            speech: env_parse("POOL_SPEECH", 4)?,
            render: env_parse("POOL_RENDER", 1)?,
            transcribe: env_parse("POOL_TRANSCRIBE", 1)?,
            sync: env_parse("POOL_SYNC", 8)?,
            music: env_parse("POOL_MUSIC", 4)?,
            assembly: env_parse("POOL_ASSEMBLY", 2)?,
            publish: env_parse("POOL_PUBLISH", 1)?,
        };

        let runner = RunnerConfig {
            max_attempts: env_parse("MAX_STAGE_ATTEMPTS", 3)?,
            optional_attempts: env_parse("OPTIONAL_STAGE_ATTEMPTS", 3)?,
            retry: RetryPolicy {
                base: Duration::from_secs(env_parse("RETRY_BASE_SECS", 2)?),
                cap: Duration::from_secs(env_parse("RETRY_CAP_SECS", 30)?),
            },
            stage_timeout: Duration::from_secs(env_parse("STAGE_TIMEOUT_SECS", 600)?),
            acquire_timeout: Duration::from_secs(env_parse("ACQUIRE_TIMEOUT_SECS", 900)?),
            output_dir: output_dir.clone(),
        };

        let poll = PollConfig {
            initial_interval: Duration::from_secs(env_parse("RENDER_POLL_INTERVAL_SECS", 2)?),
            max_interval: Duration::from_secs(env_parse("RENDER_POLL_MAX_INTERVAL_SECS", 15)?),
            max_wait: Duration::from_secs(env_parse("RENDER_POLL_MAX_WAIT_SECS", 600)?),
        };

        let cues = CueConfig {
            max_chars: env_parse("CUE_MAX_CHARS", 40)?,
            max_duration: env_parse("CUE_MAX_SECONDS", 4.0)?,
            break_on_sentence: true,
        };

        let endpoints = CollaboratorEndpoints {
            ollama_url: env_optional("OLLAMA_URL"),
            ollama_model: env_string("OLLAMA_MODEL", "llama3.1:8b-instruct-q8_0"),
            comfyui_url: env_optional("COMFYUI_URL"),
            eleven_labs_api_key: env_optional("ELEVEN_LABS_API_KEY"),
            eleven_labs_voice_id: env_string("ELEVEN_LABS_VOICE_ID", "21m00Tcm4TlvDq8ikWAM"),
            whisper_url: env_optional("WHISPER_URL"),
            music_file: PathBuf::from(env_string("MUSIC_FILE", "music/Io.wav")),
            publish_url: env_optional("PUBLISH_URL"),
            publish_token: env_optional("PUBLISH_TOKEN"),
        };

        Ok(Self {
            bind_addr: env_string("BIND_ADDR", "0.0.0.0:3000"),
            output_dir,
            pools,
            runner,
            poll,
            cues,
            run_retention_hours: env_parse("RUN_RETENTION_HOURS", 24)?,
            database_url: env_optional("DATABASE_URL"),
            endpoints,
        })
    }
}

fn env_optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_string(key: &str, default: &str) -> String {
    env_optional(key).unwrap_or_else(|| default.to_string())
}

fn env_parse<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env_optional(key) {
        Some(raw) => parse_value(key, &raw),
        None => Ok(default),
    }
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse::<T>().map_err(|e| ConfigError::InvalidValue {
        key: key.to_string(),
        value: raw.to_string(),
        reason: e.to_string(),
    })
}
