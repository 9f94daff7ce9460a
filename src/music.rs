// Background music selection from a local file or directory
use async_trait::async_trait;
use std::path::PathBuf;

use crate::error::StageError;
use crate::types::ContentUnit;
use crate::utils::is_supported_audio_format;
use crate::workflow::stages::MusicLibrary;

/// A single track, or a directory whose tracks are spread across the signs
#[derive(Debug, Clone)]
pub struct DirectoryMusicLibrary {
    root: PathBuf,
}

impl DirectoryMusicLibrary {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    async fn tracks(&self) -> Result<Vec<PathBuf>, StageError> {
        let mut entries = tokio::fs::read_dir(&self.root)
            .await
            .map_err(|e| StageError::Validation(format!("Cannot read music directory {}: {}", self.root.display(), e)))?;

        let mut tracks = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StageError::Transient(format!("Music directory listing failed: {}", e)))?
        {
            let path = entry.path();
            if path.is_file() && is_supported_audio_format(&path) {
                tracks.push(path);
            }
        }
        tracks.sort();
        Ok(tracks)
    }
}

#[async_trait]
impl MusicLibrary for DirectoryMusicLibrary {
    async fn select(&self, unit: &ContentUnit) -> Result<Option<PathBuf>, StageError> {
        let meta = match tokio::fs::metadata(&self.root).await {
            Ok(meta) => meta,
            Err(_) => {
                tracing::warn!(path = %self.root.display(), "music source missing, skipping background track");
                return Ok(None);
            }
        };

        if meta.is_file() {
            return Ok(Some(self.root.clone()));
        }

        let tracks = self.tracks().await?;
        if tracks.is_empty() {
            return Ok(None);
        }
        let pick = unit.sign.position() % tracks.len();
        Ok(Some(tracks[pick].clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zodiac::Sign;
    use chrono::NaiveDate;

    fn unit(sign: Sign) -> ContentUnit {
        ContentUnit::new(sign, NaiveDate::from_ymd_opt(2026, 10, 19).unwrap(), "fr")
    }

    fn scratch(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("astro_music_{}_{}", name, uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn test_missing_source_yields_none() {
        let lib = DirectoryMusicLibrary::new("/nonexistent/astro/music.wav");
        assert_eq!(lib.select(&unit(Sign::Leo)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_single_file_is_used_for_every_sign() {
        let dir = scratch("file");
        let track = dir.join("Io.wav");
        std::fs::write(&track, b"RIFF").unwrap();
        let lib = DirectoryMusicLibrary::new(&track);
        assert_eq!(lib.select(&unit(Sign::Pisces)).await.unwrap(), Some(track.clone()));
        assert_eq!(lib.select(&unit(Sign::Aries)).await.unwrap(), Some(track));
        std::fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn test_directory_rotates_by_sign_and_ignores_non_audio() {
        let dir = scratch("dir");
        for name in ["a.mp3", "b.wav", "notes.txt"] {
            std::fs::write(dir.join(name), b"x").unwrap();
        }
        let lib = DirectoryMusicLibrary::new(&dir);
        let first = lib.select(&unit(Sign::ALL[0])).await.unwrap().unwrap();
        let second = lib.select(&unit(Sign::ALL[1])).await.unwrap().unwrap();
        assert_ne!(first, second);
        for sign in Sign::ALL {
            let pick = lib.select(&unit(sign)).await.unwrap().unwrap();
            assert!(is_supported_audio_format(&pick));
        }
        std::fs::remove_dir_all(dir).ok();
    }
}
