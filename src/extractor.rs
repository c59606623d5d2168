//! Seam between the HTTP layer and the external extraction engine.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ledger::Job;

pub const MAX_LISTED_FORMATS: usize = 10;
pub const EXTRACTOR_RETRIES: u32 = 3;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct VideoInfo {
    pub title: String,
    pub duration: Option<f64>,
    pub uploader: Option<String>,
    pub view_count: u64,
    pub upload_date: Option<String>,
    pub formats: Vec<FormatDescriptor>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct FormatDescriptor {
    #[serde(default)]
    pub format_id: Option<String>,
    #[serde(default)]
    pub ext: Option<String>,
    #[serde(default)]
    pub quality: Option<f64>,
    #[serde(default)]
    pub filesize: Option<u64>,
    #[serde(default)]
    pub vcodec: Option<String>,
    #[serde(default)]
    pub acodec: Option<String>,
    #[serde(default)]
    pub resolution: Option<String>,
    #[serde(default)]
    pub fps: Option<f64>,
}

impl FormatDescriptor {
    /// False only when the engine reports neither a video nor an audio codec.
    pub fn carries_stream(&self) -> bool {
        self.vcodec.as_deref() != Some("none") || self.acodec.as_deref() != Some("none")
    }
}

/// Keeps the first formats that carry at least one stream.
pub fn listable_formats(formats: impl IntoIterator<Item = FormatDescriptor>) -> Vec<FormatDescriptor> {
    formats
        .into_iter()
        .filter(FormatDescriptor::carries_stream)
        .take(MAX_LISTED_FORMATS)
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Mp4,
    Mp3,
}

impl OutputFormat {
    pub fn parse(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case("mp3") {
            Self::Mp3
        } else {
            Self::Mp4
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quality {
    Highest,
    P1080,
    P720,
    Lowest,
}

impl Quality {
    pub fn parse(value: &str) -> Self {
        match value.trim() {
            "highest" => Self::Highest,
            "1080p" => Self::P1080,
            "720p" => Self::P720,
            _ => Self::Lowest,
        }
    }

    pub fn video_selector(self) -> &'static str {
        match self {
            Self::Highest => "bestvideo+bestaudio/best",
            Self::P1080 => "bestvideo[height<=1080]+bestaudio/best[height<=1080]/best",
            Self::P720 => "bestvideo[height<=720]+bestaudio/best[height<=720]/best",
            Self::Lowest => "worst[height>=360]",
        }
    }

    pub fn mp3_bitrate(self) -> &'static str {
        match self {
            Self::Highest => "320K",
            _ => "128K",
        }
    }
}

#[derive(Debug, Clone)]
pub struct DownloadTask {
    pub url: String,
    pub format: OutputFormat,
    pub quality: Quality,
    pub job_id: String,
    pub cookie: Option<String>,
    pub output_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressUpdate {
    Downloading {
        percent: Option<String>,
        speed: Option<String>,
        eta: Option<String>,
        filename: Option<String>,
    },
    Finished {
        filename: Option<String>,
    },
}

impl ProgressUpdate {
    pub fn into_job(self) -> Job {
        match self {
            Self::Downloading {
                percent,
                speed,
                eta,
                filename,
            } => Job::downloading(
                percent.unwrap_or_else(|| "0%".to_string()),
                speed.unwrap_or_else(|| "N/A".to_string()),
                eta.unwrap_or_else(|| "N/A".to_string()),
                filename,
            ),
            Self::Finished { filename } => Job::stream_finished(filename),
        }
    }
}

pub type ProgressCallback = dyn Fn(ProgressUpdate) + Send + Sync;

#[derive(Debug, Error)]
pub enum ExtractorError {
    #[error("{0} is not installed or not on PATH")]
    NotInstalled(String),
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{0}")]
    Failed(String),
    #[error("unreadable extractor output: {0}")]
    Parse(String),
}

#[async_trait]
pub trait Extractor: Send + Sync {
    /// Reads metadata without downloading anything.
    async fn fetch_info(&self, url: &str, cookie: Option<&str>) -> Result<VideoInfo, ExtractorError>;

    /// Downloads into `task.output_dir`, reporting progress through `on_progress`.
    async fn download(
        &self,
        task: &DownloadTask,
        on_progress: &ProgressCallback,
    ) -> Result<(), ExtractorError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::JobStatus;

    fn format(id: &str, vcodec: &str, acodec: &str) -> FormatDescriptor {
        FormatDescriptor {
            format_id: Some(id.to_string()),
            vcodec: Some(vcodec.to_string()),
            acodec: Some(acodec.to_string()),
            ..FormatDescriptor::default()
        }
    }

    #[test]
    fn format_without_streams_is_dropped() {
        let formats = listable_formats(vec![
            format("storyboard", "none", "none"),
            format("audio", "none", "aac"),
            format("video", "h264", "none"),
        ]);

        let ids: Vec<_> = formats
            .iter()
            .filter_map(|item| item.format_id.as_deref())
            .collect();
        assert_eq!(ids, vec!["audio", "video"]);
    }

    #[test]
    fn missing_codecs_count_as_streams() {
        assert!(FormatDescriptor::default().carries_stream());
    }

    #[test]
    fn list_keeps_first_ten_qualifying_formats() {
        let mut input = vec![format("skip", "none", "none")];
        input.extend((0..15).map(|index| format(&index.to_string(), "h264", "aac")));

        let formats = listable_formats(input);
        assert_eq!(formats.len(), MAX_LISTED_FORMATS);
        assert_eq!(formats[0].format_id.as_deref(), Some("0"));
        assert_eq!(formats[9].format_id.as_deref(), Some("9"));
    }

    #[test]
    fn quality_maps_to_selector() {
        assert_eq!(Quality::parse("highest").video_selector(), "bestvideo+bestaudio/best");
        assert_eq!(
            Quality::parse("720p").video_selector(),
            "bestvideo[height<=720]+bestaudio/best[height<=720]/best"
        );
        assert_eq!(Quality::parse("lowest").video_selector(), "worst[height>=360]");
        assert_eq!(Quality::parse("480p"), Quality::Lowest);
    }

    #[test]
    fn mp3_bitrate_depends_on_quality() {
        assert_eq!(Quality::Highest.mp3_bitrate(), "320K");
        assert_eq!(Quality::P1080.mp3_bitrate(), "128K");
    }

    #[test]
    fn anything_but_mp3_is_mp4() {
        assert_eq!(OutputFormat::parse("mp3"), OutputFormat::Mp3);
        assert_eq!(OutputFormat::parse("MP3"), OutputFormat::Mp3);
        assert_eq!(OutputFormat::parse("webm"), OutputFormat::Mp4);
    }

    #[test]
    fn downloading_update_fills_placeholders() {
        let job = ProgressUpdate::Downloading {
            percent: None,
            speed: None,
            eta: None,
            filename: None,
        }
        .into_job();

        assert_eq!(job.status, JobStatus::Downloading);
        assert_eq!(job.percent.as_deref(), Some("0%"));
        assert_eq!(job.speed.as_deref(), Some("N/A"));
        assert_eq!(job.eta.as_deref(), Some("N/A"));
    }
}
