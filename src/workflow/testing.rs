// Scripted fake collaborators for engine tests (no network, no ffmpeg)
use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::artifacts::{ArtifactDraft, ArtifactStore};
use super::runner::{PipelineRunner, RetryPolicy, RunnerConfig};
use super::scheduler::{PoolSizes, ResourceScheduler};
use super::stages::{
    Assembler, AssemblyRequest, Collaborators, MusicLibrary, PollConfig, PublishMetadata, Publisher, RenderPoll,
    RenderRequest, SpeechSynthesizer, StagePlan, TextGenerator, Transcriber, VideoGenerator,
};
use super::state::RunRegistry;
use super::sync_planner::CueConfig;
use crate::error::StageError;
use crate::types::{
    new_id, Artifact, ArtifactKind, ContentUnit, MontageSpec, Privacy, StageId, TranscriptionResult, VoiceOptions,
    WordTiming,
};
use crate::zodiac::Sign;

pub fn unit(sign: Sign) -> ContentUnit {
    ContentUnit::new(sign, NaiveDate::from_ymd_opt(2026, 10, 19).expect("valid date"), "fr")
}

/// Behaviour of one fake collaborator
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Script {
    Succeed,
    /// The first n calls per unit fail with a transient error
    FailTransient(u32),
    FailValidation,
    /// Transcriber returns no words
    EmptyTranscript,
    /// Never returns
    Hang,
    /// Render job is accepted but never finishes
    Stall,
    /// The collaborator panics
    Panic,
}

#[derive(Debug, Clone)]
pub struct Call {
    pub unit: String,
    pub stage: StageId,
    pub start: Instant,
    pub end: Instant,
}

#[derive(Default)]
pub struct CallLog {
    calls: Mutex<Vec<Call>>,
}

impl CallLog {
    async fn record(&self, call: Call) {
        self.calls.lock().await.push(call);
    }

    /// Calls made on behalf of one unit, in start order
    pub async fn calls_for(&self, unit: &ContentUnit) -> Vec<Call> {
        let label = unit.to_string();
        let mut calls: Vec<Call> = self.calls.lock().await.iter().filter(|c| c.unit == label).cloned().collect();
        calls.sort_by_key(|c| c.start);
        calls
    }

    pub async fn for_stage(&self, stage: StageId) -> Vec<Call> {
        let mut calls: Vec<Call> = self.calls.lock().await.iter().filter(|c| c.stage == stage).cloned().collect();
        calls.sort_by_key(|c| c.start);
        calls
    }

    pub async fn count(&self, stage: StageId) -> usize {
        self.calls.lock().await.iter().filter(|c| c.stage == stage).count()
    }
}

struct Settings {
    scripts: HashMap<(StageId, Option<Sign>), Script>,
    latency: HashMap<StageId, Duration>,
    speech_duration: f64,
    clip_duration: f64,
}

/// One object implementing every collaborator contract
pub struct Fakes {
    log: Arc<CallLog>,
    settings: Mutex<Settings>,
    attempts: Mutex<HashMap<(StageId, String), u32>>,
    music_file: PathBuf,
    /// Location order of every concatenate call
    pub concatenations: Mutex<Vec<Vec<String>>>,
    /// Render job the fake queue is working on; cancel interrupts it whoever owns it
    running_job: Mutex<Option<String>>,
    pub interrupted: Mutex<HashSet<String>>,
}

impl Fakes {
    /// Run one scripted call for `unit`
    async fn step(&self, stage: StageId, unit: &ContentUnit) -> Result<Script, StageError> {
        let (script, latency) = {
            let settings = self.settings.lock().await;
            let script = settings
                .scripts
                .get(&(stage, Some(unit.sign)))
                .or_else(|| settings.scripts.get(&(stage, None)))
                .copied()
                .unwrap_or(Script::Succeed);
            (script, settings.latency.get(&stage).copied().unwrap_or(Duration::from_millis(1)))
        };

        let start = Instant::now();
        if script == Script::Hang {
            std::future::pending::<()>().await;
        }
        if script == Script::Panic {
            panic!("{} collaborator crashed", stage);
        }
        tokio::time::sleep(latency).await;

        let attempt = {
            let mut attempts = self.attempts.lock().await;
            let n = attempts.entry((stage, unit.to_string())).or_insert(0);
            *n += 1;
            *n
        };
        self.log
            .record(Call {
                unit: unit.to_string(),
                stage,
                start,
                end: Instant::now(),
            })
            .await;

        match script {
            Script::FailTransient(n) if attempt <= n => {
                Err(StageError::Transient(format!("{} unavailable (attempt {})", stage, attempt)))
            }
            Script::FailValidation => Err(StageError::Validation(format!("{} rejected the request", stage))),
            other => Ok(other),
        }
    }

    fn unit_of(&self, artifact: &Artifact) -> ContentUnit {
        // Fakes encode the unit in the location they hand out
        let label = artifact.location.rsplit('#').next().unwrap_or_default().to_string();
        parse_label(&label)
    }
}

fn parse_label(label: &str) -> ContentUnit {
    let sign = label.split('@').next().and_then(|s| s.parse().ok()).unwrap_or(Sign::Aries);
    let date = label
        .split('@')
        .nth(1)
        .and_then(|rest| rest.split('[').next())
        .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
        .unwrap_or(NaiveDate::MIN);
    ContentUnit::new(sign, date, "fr")
}

#[async_trait]
impl TextGenerator for Fakes {
    async fn generate(&self, unit: &ContentUnit) -> Result<String, StageError> {
        self.step(StageId::TextGeneration, unit).await?;
        Ok(format!(
            "Chers {}, les astres vous sourient aujourd'hui. Osez avancer avec confiance!",
            unit.sign.display_name()
        ))
    }
}

#[async_trait]
impl SpeechSynthesizer for Fakes {
    async fn synthesize(&self, text: &str, _voice: &VoiceOptions, out_dir: &Path) -> Result<ArtifactDraft, StageError> {
        let unit = unit_from_text(text);
        self.step(StageId::SpeechSynthesis, &unit).await?;
        let duration = self.settings.lock().await.speech_duration;
        let location = format!("{}/voice.mp3#{}", out_dir.display(), unit);
        Ok(ArtifactDraft::from_bytes(ArtifactKind::Audio, location, text.as_bytes()).with_duration(duration))
    }
}

/// The speech fake only sees text; the greeting names the sign
fn unit_from_text(text: &str) -> ContentUnit {
    let sign = Sign::ALL
        .iter()
        .copied()
        .find(|s| text.contains(s.display_name()))
        .unwrap_or(Sign::Aries);
    unit(sign)
}

#[async_trait]
impl VideoGenerator for Fakes {
    async fn submit(&self, request: &RenderRequest) -> Result<String, StageError> {
        let sign = Sign::ALL
            .iter()
            .copied()
            .find(|s| request.prompt.contains(s.display_name()))
            .unwrap_or(Sign::Aries);
        self.step(StageId::VideoGeneration, &unit(sign)).await?;
        let job_id = format!("{}#{}", new_id(), unit(sign));
        *self.running_job.lock().await = Some(job_id.clone());
        Ok(job_id)
    }

    async fn poll(&self, job_id: &str, request: &RenderRequest) -> Result<RenderPoll, StageError> {
        if self.interrupted.lock().await.contains(job_id) {
            return Ok(RenderPoll::Failed("interrupted".to_string()));
        }
        let label = job_id.rsplit('#').next().unwrap_or_default();
        let sign = parse_label(label).sign;
        let stalled = self.settings.lock().await.scripts.get(&(StageId::VideoGeneration, Some(sign))) == Some(&Script::Stall);
        if stalled {
            return Ok(RenderPoll::Pending);
        }
        let duration = self.settings.lock().await.clip_duration;
        let location = format!("{}/clip.mp4#{}", request.out_dir.display(), label);
        Ok(RenderPoll::Done(
            ArtifactDraft::from_bytes(ArtifactKind::Video, location, job_id.as_bytes()).with_duration(duration),
        ))
    }

    async fn cancel(&self, _job_id: &str) -> Result<(), StageError> {
        if let Some(job) = self.running_job.lock().await.take() {
            self.interrupted.lock().await.insert(job);
        }
        Ok(())
    }
}

#[async_trait]
impl Transcriber for Fakes {
    async fn transcribe(&self, audio: &Artifact) -> Result<TranscriptionResult, StageError> {
        let unit = self.unit_of(audio);
        let script = self.step(StageId::Transcription, &unit).await?;
        let duration = audio.duration_seconds.unwrap_or(0.0);
        if script == Script::EmptyTranscript {
            return Ok(TranscriptionResult {
                words: Vec::new(),
                text: String::new(),
                duration,
            });
        }

        // Two words per second across the whole track
        let count = (duration * 2.0).floor().max(1.0) as usize;
        let words: Vec<WordTiming> = (0..count)
            .map(|i| WordTiming {
                word: if i % 7 == 6 { "astres.".to_string() } else { "étoiles".to_string() },
                start: i as f64 * 0.5,
                end: i as f64 * 0.5 + 0.4,
            })
            .collect();
        let text = words.iter().map(|w| w.word.as_str()).collect::<Vec<_>>().join(" ");
        Ok(TranscriptionResult { words, text, duration })
    }
}

#[async_trait]
impl Assembler for Fakes {
    async fn assemble(&self, request: &AssemblyRequest) -> Result<ArtifactDraft, StageError> {
        self.step(StageId::Assembly, &request.unit).await?;
        let location = format!("{}#{}", request.output.display(), request.unit);
        Ok(ArtifactDraft::from_bytes(ArtifactKind::FinalVideo, location, request.video.checksum.as_bytes())
            .with_duration(request.plan.target_duration))
    }

    async fn concatenate(&self, parts: &[Artifact], _montage: &MontageSpec, output: &Path) -> Result<ArtifactDraft, StageError> {
        self.concatenations
            .lock()
            .await
            .push(parts.iter().map(|p| p.location.clone()).collect());
        let duration = parts.iter().filter_map(|p| p.duration_seconds).sum();
        Ok(ArtifactDraft::reference(ArtifactKind::CombinedVideo, output.display().to_string(), 0).with_duration(duration))
    }
}

#[async_trait]
impl MusicLibrary for Fakes {
    async fn select(&self, unit: &ContentUnit) -> Result<Option<PathBuf>, StageError> {
        self.step(StageId::MusicMix, unit).await?;
        Ok(Some(self.music_file.clone()))
    }
}

#[async_trait]
impl Publisher for Fakes {
    async fn upload(&self, video: &Artifact, _metadata: &PublishMetadata, _privacy: Privacy) -> Result<String, StageError> {
        let unit = self.unit_of(video);
        self.step(StageId::Publish, &unit).await?;
        Ok(format!("https://videos.example/{}", unit.sign))
    }
}

/// Engine wired to fakes with millisecond retry delays
pub struct FakeWorld {
    pub fakes: Arc<Fakes>,
    pub log: Arc<CallLog>,
    pub scheduler: Arc<ResourceScheduler>,
    pub store: Arc<ArtifactStore>,
    pub registry: Arc<RunRegistry>,
    pub config: RunnerConfig,
}

impl FakeWorld {
    pub fn new() -> Self {
        Self::with_pools(PoolSizes::default())
    }

    pub fn with_pools(pools: PoolSizes) -> Self {
        Self::build(pools, RetryPolicy {
            base: Duration::from_millis(1),
            cap: Duration::from_millis(5),
        })
    }

    pub fn with_retry(base: Duration, cap: Duration) -> Self {
        Self::build(PoolSizes::default(), RetryPolicy { base, cap })
    }

    fn build(pools: PoolSizes, retry: RetryPolicy) -> Self {
        let dir = std::env::temp_dir().join(format!("astro-fakes-{}", new_id()));
        let music_file = dir.join("music.wav");
        if std::fs::create_dir_all(&dir).is_ok() {
            let _ = std::fs::write(&music_file, b"RIFF fake wav");
        }

        let log = Arc::new(CallLog::default());
        let fakes = Arc::new(Fakes {
            log: log.clone(),
            settings: Mutex::new(Settings {
                scripts: HashMap::new(),
                latency: HashMap::new(),
                speech_duration: 6.0,
                clip_duration: 2.0,
            }),
            attempts: Mutex::new(HashMap::new()),
            music_file,
            concatenations: Mutex::new(Vec::new()),
            running_job: Mutex::new(None),
            interrupted: Mutex::new(HashSet::new()),
        });

        Self {
            fakes,
            log,
            scheduler: Arc::new(ResourceScheduler::new(&pools)),
            store: Arc::new(ArtifactStore::new()),
            registry: Arc::new(RunRegistry::new()),
            config: RunnerConfig {
                max_attempts: 3,
                optional_attempts: 3,
                retry,
                stage_timeout: Duration::from_secs(10),
                acquire_timeout: Duration::from_secs(10),
                output_dir: dir,
            },
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            text: self.fakes.clone(),
            speech: self.fakes.clone(),
            video: self.fakes.clone(),
            transcriber: self.fakes.clone(),
            assembler: self.fakes.clone(),
            music: self.fakes.clone(),
            publisher: self.fakes.clone(),
        }
    }

    pub fn runner(&self) -> PipelineRunner {
        self.runner_with(|_| {})
    }

    pub fn runner_with(&self, adjust: impl FnOnce(&mut RunnerConfig)) -> PipelineRunner {
        let mut config = self.config.clone();
        adjust(&mut config);
        let poll = PollConfig {
            initial_interval: Duration::from_millis(1),
            max_interval: Duration::from_millis(5),
            max_wait: Duration::from_secs(5),
        };
        PipelineRunner::new(
            StagePlan::standard(self.collaborators(), poll, CueConfig::default()),
            self.scheduler.clone(),
            self.store.clone(),
            self.registry.clone(),
            config,
        )
    }

    pub async fn script(&self, stage: StageId, script: Script) {
        self.fakes.settings.lock().await.scripts.insert((stage, None), script);
    }

    pub async fn script_for(&self, stage: StageId, sign: Sign, script: Script) {
        self.fakes.settings.lock().await.scripts.insert((stage, Some(sign)), script);
    }

    pub async fn set_latency(&self, stage: StageId, latency: Duration) {
        self.fakes.settings.lock().await.latency.insert(stage, latency);
    }

    pub async fn set_speech_duration(&self, seconds: f64) {
        self.fakes.settings.lock().await.speech_duration = seconds;
    }

    pub async fn set_clip_duration(&self, seconds: f64) {
        self.fakes.settings.lock().await.clip_duration = seconds;
    }
}
