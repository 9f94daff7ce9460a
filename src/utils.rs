// utils.rs - FFmpeg/FFprobe helpers shared by the assembler and the speech adapter
use std::path::Path;
use tokio::process::Command;

/// Execute FFmpeg with error handling; the child is killed if the future is dropped
pub async fn run_ffmpeg(args: &[String]) -> Result<String, String> {
    tracing::debug!(args = ?args, "executing ffmpeg");

    let output = Command::new("ffmpeg")
        .args(args)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| format!("Failed to execute FFmpeg: {}", e))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let tail: String = stderr.chars().rev().take(500).collect::<Vec<_>>().into_iter().rev().collect();
        return Err(format!("FFmpeg error: {}", tail));
    }

    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// Execute FFprobe for media analysis
pub async fn run_ffprobe(args: &[&str]) -> Result<String, String> {
    let output = Command::new("ffprobe")
        .args(args)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| format!("Failed to execute FFprobe: {}", e))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(format!("FFprobe error: {}", stderr));
    }

    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// Container duration in seconds
pub async fn probe_duration(path: &Path) -> Result<f64, String> {
    let path_str = path.to_string_lossy();
    let out = run_ffprobe(&[
        "-v",
        "error",
        "-show_entries",
        "format=duration",
        "-of",
        "default=noprint_wrappers=1:nokey=1",
        &path_str,
    ])
    .await?;
    parse_duration(&out).ok_or_else(|| format!("Unreadable duration for {}: '{}'", path.display(), out.trim()))
}

fn parse_duration(raw: &str) -> Option<f64> {
    raw.trim().parse::<f64>().ok().filter(|d| d.is_finite() && *d > 0.0)
}

/// Check if FFmpeg and FFprobe are available
pub async fn check_ffmpeg_available() -> Result<(), String> {
    Command::new("ffmpeg")
        .arg("-version")
        .output()
        .await
        .map_err(|_| "FFmpeg not found. Please install FFmpeg.".to_string())?;

    Command::new("ffprobe")
        .arg("-version")
        .output()
        .await
        .map_err(|_| "FFprobe not found. Please install FFmpeg with FFprobe.".to_string())?;

    Ok(())
}

/// Create the parent directory of an output path
pub async fn ensure_parent_dir(output_path: &Path) -> Result<(), String> {
    if let Some(parent) = output_path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| format!("Failed to create output directory {}: {}", parent.display(), e))?;
    }
    Ok(())
}

/// Get file extension from path
pub fn get_file_extension(path: &Path) -> Option<String> {
    path.extension().and_then(|ext| ext.to_str()).map(|ext| ext.to_lowercase())
}

/// Check if file is a supported audio format
pub fn is_supported_audio_format(path: &Path) -> bool {
    match get_file_extension(path) {
        Some(ext) => matches!(ext.as_str(), "mp3" | "wav" | "aac" | "ogg" | "flac" | "m4a" | "opus"),
        None => false,
    }
}

/// Strip characters that break a drawtext `text='...'` argument
pub fn escape_drawtext(text: &str) -> String {
    text.chars()
        .filter_map(|c| match c {
            '\'' | '\\' => None,
            ':' => Some(' '),
            '%' => Some(' '),
            c => Some(c),
        })
        .collect()
}
