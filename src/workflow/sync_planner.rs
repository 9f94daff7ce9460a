// SyncPlanner - caption cues and duration reconciliation for one audio/video pair
//
// Voice timing is never altered: the clip is looped or trimmed to the voice track.
use crate::error::SyncError;
use crate::types::{Artifact, DurationDirective, MontageSpec, SubtitleCue, SyncPlan, TranscriptionResult, WordTiming};

/// Durations closer than this are treated as equal
const DURATION_TOLERANCE: f64 = 0.05;

/// Cue grouping thresholds
#[derive(Debug, Clone, PartialEq)]
pub struct CueConfig {
    pub max_chars: usize,
    /// Seconds
    pub max_duration: f64,
    /// Close a cue after a word ending with . ! or ?
    pub break_on_sentence: bool,
}

impl Default for CueConfig {
    fn default() -> Self {
        Self {
            max_chars: 40,
            max_duration: 4.0,
            break_on_sentence: true,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SyncPlanner {
    config: CueConfig,
}

impl SyncPlanner {
    pub fn new(config: CueConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CueConfig {
        &self.config
    }

    /// Build the cue timeline and pick how the clip is fitted to the voice track
    pub fn align(&self, transcription: &TranscriptionResult, video: &Artifact) -> Result<SyncPlan, SyncError> {
        let words: Vec<&WordTiming> = transcription
            .words
            .iter()
            .filter(|w| !w.word.trim().is_empty())
            .collect();
        if words.is_empty() {
            return Err(SyncError::EmptyTranscript);
        }

        let audio = transcription.duration;
        let video_duration = video.duration_seconds.unwrap_or(0.0);
        if !(audio > 0.0) || !(video_duration > 0.0) {
            return Err(SyncError::InvalidDuration {
                audio,
                video: video_duration,
            });
        }

        let cues = build_cues(&words, &self.config);
        let directive = choose_directive(audio, video_duration);

        Ok(SyncPlan {
            cues,
            directive,
            target_duration: audio,
            source_video_duration: video_duration,
            loop_count: loop_count(directive, audio, video_duration),
            clamped: false,
        })
    }
}

/// Loop when the clip is shorter than the voice, trim when it is longer
pub fn choose_directive(audio_duration: f64, video_duration: f64) -> DurationDirective {
    let delta = audio_duration - video_duration;
    if delta.abs() <= DURATION_TOLERANCE {
        DurationDirective::None
    } else if delta > 0.0 {
        DurationDirective::Loop
    } else {
        DurationDirective::Trim
    }
}

fn loop_count(directive: DurationDirective, target: f64, video: f64) -> u32 {
    match directive {
        DurationDirective::Loop => (target / video).ceil().max(1.0) as u32,
        _ => 1,
    }
}

/// Group consecutive words under the char/duration thresholds. Words are never
/// split; a single word over a threshold becomes its own cue.
pub fn build_cues(words: &[&WordTiming], config: &CueConfig) -> Vec<SubtitleCue> {
    let mut cues: Vec<SubtitleCue> = Vec::new();
    let mut current: Vec<&WordTiming> = Vec::new();
    let mut current_len = 0usize;

    for word in words {
        let text = word.word.trim();
        let word_len = text.chars().count();

        if let Some(first) = current.first() {
            let joined_len = current_len + 1 + word_len;
            let span = word.end - first.start;
            if joined_len > config.max_chars || span > config.max_duration {
                push_cue(&mut cues, &current);
                current.clear();
                current_len = 0;
            }
        }

        current_len = if current.is_empty() { word_len } else { current_len + 1 + word_len };
        current.push(word);

        if config.break_on_sentence && text.ends_with(['.', '!', '?']) {
            push_cue(&mut cues, &current);
            current.clear();
            current_len = 0;
        }
    }

    if !current.is_empty() {
        push_cue(&mut cues, &current);
    }
    cues
}

fn push_cue(cues: &mut Vec<SubtitleCue>, words: &[&WordTiming]) {
    let (Some(first), Some(last)) = (words.first(), words.last()) else {
        return;
    };
    let text = words.iter().map(|w| w.word.trim()).collect::<Vec<_>>().join(" ");

    // Transcriber timings can overlap; cues must not
    let floor = cues.last().map(|c| c.end).unwrap_or(f64::MIN);
    let start = first.start.max(floor);
    let end = last.end.max(start);
    cues.push(SubtitleCue { start, end, text });
}

impl SyncPlan {
    /// Fit the target duration into the montage bounds. Cues past a shortened
    /// target are dropped or cut at the new end.
    pub fn clamp_to(mut self, montage: &MontageSpec) -> Self {
        let bounded = self
            .target_duration
            .clamp(montage.min_duration_seconds, montage.max_duration_seconds);
        if (bounded - self.target_duration).abs() <= f64::EPSILON {
            return self;
        }

        tracing::info!(
            target = self.target_duration,
            bounded,
            min = montage.min_duration_seconds,
            max = montage.max_duration_seconds,
            "sync target clamped to montage bounds"
        );
        self.target_duration = bounded;
        self.clamped = true;
        self.cues.retain(|c| c.start < bounded);
        if let Some(last) = self.cues.last_mut() {
            last.end = last.end.min(bounded);
        }
        self.directive = choose_directive(bounded, self.source_video_duration);
        self.loop_count = loop_count(self.directive, bounded, self.source_video_duration);
        self
    }

    /// SubRip rendering of the cue list
    pub fn to_srt(&self) -> String {
        let mut out = String::new();
        for (i, cue) in self.cues.iter().enumerate() {
            out.push_str(&format!(
                "{}\n{} --> {}\n{}\n\n",
                i + 1,
                srt_timestamp(cue.start),
                srt_timestamp(cue.end),
                cue.text
            ));
        }
        out
    }
}

fn srt_timestamp(seconds: f64) -> String {
    let total_ms = (seconds.max(0.0) * 1000.0).round() as u64;
    let hours = total_ms / 3_600_000;
    let minutes = (total_ms % 3_600_000) / 60_000;
    let secs = (total_ms % 60_000) / 1000;
    let millis = total_ms % 1000;
    format!("{:02}:{:02}:{:02},{:03}", hours, minutes, secs, millis)
}
