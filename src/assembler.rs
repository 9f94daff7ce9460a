// FfmpegAssembler - mux clip, voice, captions and music into the final video
use async_trait::async_trait;
use std::path::Path;

use crate::error::StageError;
use crate::types::{Artifact, ArtifactKind, DurationDirective, MontageSpec};
use crate::utils::{ensure_parent_dir, escape_drawtext, probe_duration, run_ffmpeg};
use crate::workflow::artifacts::ArtifactDraft;
use crate::workflow::stages::{Assembler, AssemblyRequest};

/// Music bed level under the voice
pub const MUSIC_VOLUME: f64 = 0.4;

#[derive(Debug, Clone, Default)]
pub struct FfmpegAssembler;

impl FfmpegAssembler {
    pub fn new() -> Self {
        Self
    }
}

/// Scale/pad to the montage, then title, glyph and one drawtext per cue
pub fn build_video_filter(request: &AssemblyRequest) -> String {
    let montage = &request.montage;
    let mut filters = vec![
        format!(
            "scale={w}:{h}:force_original_aspect_ratio=decrease,pad={w}:{h}:(ow-iw)/2:(oh-ih)/2,fps={fps}",
            w = montage.width,
            h = montage.height,
            fps = montage.fps
        ),
        format!(
            "drawtext=text='♦{}♦':fontsize=40:fontcolor=silver:x=(w-text_w)/2:y=100:box=1:boxcolor=black@0.7:boxborderw=8",
            escape_drawtext(request.unit.sign.display_name())
        ),
        format!(
            "drawtext=text='{}':fontsize=60:fontcolor=gold:x=(w-text_w)/2:y=180",
            request.unit.sign.glyph()
        ),
    ];

    for (i, cue) in request.plan.cues.iter().enumerate() {
        let y = if i % 2 == 0 { "h-200" } else { "h-150" };
        filters.push(format!(
            "drawtext=text='{}':fontsize=18:fontcolor=white:x=(w-text_w)/2:y={}:box=1:boxcolor=black@0.7:boxborderw=5:enable='between(t,{:.2},{:.2})'",
            escape_drawtext(&cue.text),
            y,
            cue.start,
            cue.end
        ));
    }
    filters.join(",")
}

/// Full ffmpeg argument list for one unit
pub fn build_assemble_args(request: &AssemblyRequest) -> Vec<String> {
    let mut args: Vec<String> = vec!["-y".into()];

    // Looping covers a short clip; -t below cuts both loop and trim cases
    if request.plan.directive == DurationDirective::Loop {
        args.extend(["-stream_loop".into(), "-1".into()]);
    }
    args.extend(["-i".into(), request.video.location.clone()]);
    args.extend(["-i".into(), request.audio.location.clone()]);

    let video_filter = build_video_filter(request);
    match &request.music {
        Some(music) => {
            args.extend(["-stream_loop".into(), "-1".into(), "-i".into(), music.location.clone()]);
            args.extend([
                "-filter_complex".into(),
                format!(
                    "[0:v]{}[v_out];[2:a]volume={}[a_music];[1:a][a_music]amix=inputs=2:duration=first[a_out]",
                    video_filter, MUSIC_VOLUME
                ),
            ]);
            args.extend(["-map".into(), "[v_out]".into(), "-map".into(), "[a_out]".into()]);
        }
        None => {
            args.extend(["-filter_complex".into(), format!("[0:v]{}[v_out]", video_filter)]);
            args.extend(["-map".into(), "[v_out]".into(), "-map".into(), "1:a".into()]);
        }
    }

    args.extend([
        "-t".into(),
        format!("{:.3}", request.plan.target_duration),
        "-c:v".into(),
        "libx264".into(),
        "-preset".into(),
        "fast".into(),
        "-crf".into(),
        "23".into(),
        "-pix_fmt".into(),
        "yuv420p".into(),
        "-c:a".into(),
        "aac".into(),
        "-b:a".into(),
        "192k".into(),
        request.output.display().to_string(),
    ]);
    args
}

/// Concat demuxer list file content
pub fn concat_list(parts: &[Artifact]) -> String {
    parts
        .iter()
        .map(|p| format!("file '{}'\n", p.location.replace('\'', "'\\''")))
        .collect()
}

#[async_trait]
impl Assembler for FfmpegAssembler {
    async fn assemble(&self, request: &AssemblyRequest) -> Result<ArtifactDraft, StageError> {
        ensure_parent_dir(&request.output).await.map_err(StageError::Assembly)?;
        tracing::info!(
            unit = %request.unit,
            directive = ?request.plan.directive,
            target = request.plan.target_duration,
            music = request.music.is_some(),
            "🎞️ assembling final video"
        );

        run_ffmpeg(&build_assemble_args(request)).await.map_err(StageError::Assembly)?;

        let srt_path = request.output.with_extension("srt");
        if let Err(e) = tokio::fs::write(&srt_path, request.plan.to_srt()).await {
            tracing::warn!(path = %srt_path.display(), "Failed to write subtitle sidecar: {}", e);
        }

        let duration = probe_duration(&request.output)
            .await
            .unwrap_or(request.plan.target_duration);
        let draft = ArtifactDraft::from_file(ArtifactKind::FinalVideo, &request.output)
            .await
            .map_err(|e| StageError::Assembly(e.to_string()))?;
        Ok(draft.with_duration(duration))
    }

    async fn concatenate(&self, parts: &[Artifact], _montage: &MontageSpec, output: &Path) -> Result<ArtifactDraft, StageError> {
        ensure_parent_dir(output).await.map_err(StageError::Assembly)?;
        let list_path = output.with_extension("txt");
        tokio::fs::write(&list_path, concat_list(parts))
            .await
            .map_err(|e| StageError::Assembly(format!("Failed to write concat list: {}", e)))?;

        let args: Vec<String> = vec![
            "-y".into(),
            "-f".into(),
            "concat".into(),
            "-safe".into(),
            "0".into(),
            "-i".into(),
            list_path.display().to_string(),
            "-c".into(),
            "copy".into(),
            output.display().to_string(),
        ];
        let result = run_ffmpeg(&args).await;
        let _ = tokio::fs::remove_file(&list_path).await;
        result.map_err(StageError::Assembly)?;

        let expected: f64 = parts.iter().filter_map(|p| p.duration_seconds).sum();
        let duration = probe_duration(output).await.unwrap_or(expected);
        let draft = ArtifactDraft::from_file(ArtifactKind::CombinedVideo, output)
            .await
            .map_err(|e| StageError::Assembly(e.to_string()))?;
        Ok(draft.with_duration(duration))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ContentUnit, StageId, SubtitleCue, SyncPlan};
    use crate::zodiac::Sign;
    use chrono::{NaiveDate, Utc};
    use std::path::PathBuf;

    fn artifact(kind: ArtifactKind, location: &str) -> Artifact {
        Artifact {
            id: "a".into(),
            owner: "run".into(),
            stage: StageId::VideoGeneration,
            kind,
            location: location.into(),
            size_bytes: 1,
            duration_seconds: Some(2.0),
            checksum: "c".into(),
            inline: None,
            created_at: Utc::now(),
        }
    }

    fn request(directive: DurationDirective, music: bool) -> AssemblyRequest {
        AssemblyRequest {
            unit: ContentUnit::new(Sign::Aries, NaiveDate::from_ymd_opt(2026, 3, 21).unwrap(), "fr"),
            video: artifact(ArtifactKind::Video, "/out/clip.mp4"),
            audio: artifact(ArtifactKind::Audio, "/out/voice.mp3"),
            plan: SyncPlan {
                cues: vec![SubtitleCue {
                    start: 0.0,
                    end: 1.5,
                    text: "Bonjour l'Aries: courage".into(),
                }],
                directive,
                target_duration: 45.0,
                source_video_duration: 10.0,
                loop_count: 5,
                clamped: false,
            },
            music: music.then(|| artifact(ArtifactKind::Audio, "/music/Io.wav")),
            montage: MontageSpec::default(),
            output: PathBuf::from("/out/aries.mp4"),
        }
    }

    #[test]
    fn test_loop_directive_loops_video_input() {
        let args = build_assemble_args(&request(DurationDirective::Loop, false));
        assert_eq!(&args[1..5], &["-stream_loop", "-1", "-i", "/out/clip.mp4"]);
        let t = args.iter().position(|a| a == "-t").unwrap();
        assert_eq!(args[t + 1], "45.000");
        assert!(args.contains(&"1:a".to_string()));
    }

    #[test]
    fn test_trim_directive_reads_clip_once() {
        let args = build_assemble_args(&request(DurationDirective::Trim, false));
        assert_eq!(&args[1..3], &["-i", "/out/clip.mp4"]);
    }

    #[test]
    fn test_music_is_mixed_under_voice() {
        let args = build_assemble_args(&request(DurationDirective::None, true));
        let graph = args.iter().find(|a| a.contains("amix")).unwrap();
        assert!(graph.contains("[2:a]volume=0.4"));
        assert!(graph.contains("duration=first"));
        assert!(args.contains(&"/music/Io.wav".to_string()));
    }

    #[test]
    fn test_cue_text_is_escaped_and_timed() {
        let filter = build_video_filter(&request(DurationDirective::None, false));
        assert!(filter.contains("text='Bonjour lAries  courage'"));
        assert!(filter.contains("between(t,0.00,1.50)"));
        assert!(filter.contains("♦Bélier♦"));
        assert!(filter.starts_with("scale=1080:1920"));
    }

    #[test]
    fn test_concat_list_quotes_paths() {
        let parts = vec![artifact(ArtifactKind::FinalVideo, "/out/a.mp4"), artifact(ArtifactKind::FinalVideo, "/out/it's.mp4")];
        assert_eq!(concat_list(&parts), "file '/out/a.mp4'\nfile '/out/it'\\''s.mp4'\n");
    }
}
