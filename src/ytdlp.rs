//! `yt-dlp` command-line binding for the [`Extractor`] seam.

use std::{collections::VecDeque, io::ErrorKind, process::Stdio};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::Command,
};
use tracing::{debug, info, warn};

use crate::extractor::{
    DownloadTask, EXTRACTOR_RETRIES, Extractor, ExtractorError, FormatDescriptor, OutputFormat,
    ProgressCallback, ProgressUpdate, VideoInfo, listable_formats,
};

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
const ACCEPT: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8";
const ACCEPT_LANGUAGE: &str = "en-US,en;q=0.9";
const REFERER: &str = "https://www.facebook.com/";

const PROGRESS_MARKER: &str = "fbdl-progress|";
const PROGRESS_TEMPLATE: &str = "download:fbdl-progress|%(progress.status)s|%(progress._percent_str)s|%(progress._speed_str)s|%(progress._eta_str)s|%(progress.filename)s";
const STDERR_TAIL_LINES: usize = 50;

#[derive(Debug, Deserialize)]
struct YtDlpVideoInfo {
    title: Option<String>,
    duration: Option<f64>,
    uploader: Option<String>,
    view_count: Option<u64>,
    upload_date: Option<String>,
    #[serde(default)]
    formats: Option<Vec<FormatDescriptor>>,
}

impl From<YtDlpVideoInfo> for VideoInfo {
    fn from(info: YtDlpVideoInfo) -> Self {
        Self {
            title: info.title.unwrap_or_else(|| "Unknown".to_string()),
            duration: info.duration,
            uploader: info.uploader,
            view_count: info.view_count.unwrap_or_default(),
            upload_date: info.upload_date,
            formats: listable_formats(info.formats.unwrap_or_default()),
        }
    }
}

pub struct YtDlp {
    program: String,
    leading_args: Vec<String>,
}

impl YtDlp {
    pub fn new(program: impl Into<String>, leading_args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            leading_args,
        }
    }

    /// Splits a configured command such as `python3 -m yt_dlp` on whitespace.
    pub fn from_command_line(command: &str) -> Option<Self> {
        let mut parts = command.split_whitespace().map(ToString::to_string);
        let program = parts.next()?;
        Some(Self::new(program, parts.collect()))
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.leading_args).stdin(Stdio::null());
        command
    }

    fn spawn_error(&self, error: std::io::Error) -> ExtractorError {
        if error.kind() == ErrorKind::NotFound {
            ExtractorError::NotInstalled(self.program.clone())
        } else {
            ExtractorError::Spawn {
                program: self.program.clone(),
                source: error,
            }
        }
    }
}

#[async_trait]
impl Extractor for YtDlp {
    async fn fetch_info(&self, url: &str, cookie: Option<&str>) -> Result<VideoInfo, ExtractorError> {
        let mut args = vec!["-J".to_string()];
        args.extend(common_args(cookie));
        args.push(url.to_string());

        debug!("Fetching metadata for {url}");
        let output = self
            .command()
            .args(&args)
            .output()
            .await
            .map_err(|error| self.spawn_error(error))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ExtractorError::Failed(failure_message(
                stderr.lines(),
                output.status,
            )));
        }

        let info: YtDlpVideoInfo = serde_json::from_slice(&output.stdout)
            .map_err(|error| ExtractorError::Parse(error.to_string()))?;

        Ok(info.into())
    }

    async fn download(
        &self,
        task: &DownloadTask,
        on_progress: &ProgressCallback,
    ) -> Result<(), ExtractorError> {
        let args = download_args(task);
        info!(
            "Starting download job={} format={:?} quality={:?}",
            task.job_id, task.format, task.quality
        );

        let mut child = self
            .command()
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|error| self.spawn_error(error))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ExtractorError::Failed("yt-dlp stdout was not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ExtractorError::Failed("yt-dlp stderr was not captured".to_string()))?;

        let read_stdout = async {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                match parse_progress_line(&line) {
                    Some(update) => on_progress(update),
                    None => debug!("yt-dlp[{}]: {line}", task.job_id),
                }
            }
        };

        let read_stderr = async {
            let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(update) = parse_progress_line(&line) {
                    on_progress(update);
                    continue;
                }
                debug!("yt-dlp[{}] stderr: {line}", task.job_id);
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            tail
        };

        let ((), stderr_tail) = tokio::join!(read_stdout, read_stderr);

        let status = child.wait().await.map_err(|error| ExtractorError::Spawn {
            program: self.program.clone(),
            source: error,
        })?;

        if !status.success() {
            let message = failure_message(stderr_tail.iter().map(String::as_str), status);
            warn!("yt-dlp failed for job {}: {message}", task.job_id);
            return Err(ExtractorError::Failed(message));
        }

        Ok(())
    }
}

fn common_args(cookie: Option<&str>) -> Vec<String> {
    let mut args = vec![
        "--no-playlist".to_string(),
        "--no-warnings".to_string(),
        "--no-check-certificate".to_string(),
        "--extractor-retries".to_string(),
        EXTRACTOR_RETRIES.to_string(),
        "--user-agent".to_string(),
        USER_AGENT.to_string(),
        "--referer".to_string(),
        REFERER.to_string(),
        "--add-headers".to_string(),
        format!("Accept:{ACCEPT}"),
        "--add-headers".to_string(),
        format!("Accept-Language:{ACCEPT_LANGUAGE}"),
        "--add-headers".to_string(),
        "Sec-Fetch-Mode:navigate".to_string(),
    ];

    if let Some(cookie) = cookie {
        args.push("--add-headers".to_string());
        args.push(format!("Cookie:{cookie}"));
    }

    args
}

fn download_args(task: &DownloadTask) -> Vec<String> {
    let output_template = task
        .output_dir
        .join(format!("{}_%(id)s.%(ext)s", task.job_id))
        .to_string_lossy()
        .to_string();

    let mut args = common_args(task.cookie.as_deref());
    args.extend([
        "--newline".to_string(),
        "--progress".to_string(),
        "--progress-template".to_string(),
        PROGRESS_TEMPLATE.to_string(),
        "--no-color".to_string(),
        "--restrict-filenames".to_string(),
        "--windows-filenames".to_string(),
        "-o".to_string(),
        output_template,
    ]);

    match task.format {
        OutputFormat::Mp3 => args.extend([
            "-f".to_string(),
            "bestaudio/best".to_string(),
            "-x".to_string(),
            "--audio-format".to_string(),
            "mp3".to_string(),
            "--audio-quality".to_string(),
            task.quality.mp3_bitrate().to_string(),
        ]),
        OutputFormat::Mp4 => args.extend([
            "-f".to_string(),
            task.quality.video_selector().to_string(),
            "--merge-output-format".to_string(),
            "mp4".to_string(),
            "--no-keep-video".to_string(),
            "--no-write-subs".to_string(),
            "--no-write-auto-subs".to_string(),
        ]),
    }

    args.push(task.url.to_string());
    args
}

/// Parses one line emitted through [`PROGRESS_TEMPLATE`].
fn parse_progress_line(line: &str) -> Option<ProgressUpdate> {
    let rest = line.trim().strip_prefix(PROGRESS_MARKER)?;
    let mut fields = rest.splitn(5, '|').map(template_value);

    let status = fields.next()??;
    let percent = fields.next().flatten();
    let speed = fields.next().flatten();
    let eta = fields.next().flatten();
    let filename = fields.next().flatten();

    match status.as_str() {
        "downloading" => Some(ProgressUpdate::Downloading {
            percent,
            speed,
            eta,
            filename,
        }),
        "finished" => Some(ProgressUpdate::Finished { filename }),
        _ => None,
    }
}

fn template_value(raw: &str) -> Option<String> {
    let value = raw.trim();
    if value.is_empty() || value == "NA" {
        None
    } else {
        Some(value.to_string())
    }
}

fn failure_message<'a>(
    lines: impl Iterator<Item = &'a str>,
    status: std::process::ExitStatus,
) -> String {
    let lines: Vec<&str> = lines
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();

    lines
        .iter()
        .rev()
        .find(|line| line.starts_with("ERROR:"))
        .or_else(|| lines.last())
        .map(|line| line.to_string())
        .unwrap_or_else(|| format!("yt-dlp exited with {status}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractor::Quality;
    use parking_lot::Mutex;
    use std::{path::PathBuf, sync::Arc};

    fn task(format: OutputFormat, quality: Quality, cookie: Option<&str>) -> DownloadTask {
        DownloadTask {
            url: "https://www.facebook.com/watch/?v=123".to_string(),
            format,
            quality,
            job_id: "job-1".to_string(),
            cookie: cookie.map(ToString::to_string),
            output_dir: PathBuf::from("downloads"),
        }
    }

    fn value_after<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
        args.iter()
            .position(|arg| arg == flag)
            .and_then(|index| args.get(index + 1))
            .map(String::as_str)
    }

    #[test]
    fn parses_downloading_line() {
        let update = parse_progress_line(
            "fbdl-progress|downloading|  42.1%|  1.20MiB/s|00:07|downloads/job-1_123.f1.mp4",
        );

        assert_eq!(
            update,
            Some(ProgressUpdate::Downloading {
                percent: Some("42.1%".to_string()),
                speed: Some("1.20MiB/s".to_string()),
                eta: Some("00:07".to_string()),
                filename: Some("downloads/job-1_123.f1.mp4".to_string()),
            })
        );
    }

    #[test]
    fn parses_finished_line_with_missing_fields() {
        let update = parse_progress_line("fbdl-progress|finished|100.0%|NA|NA|downloads/job-1_123.m4a");

        assert_eq!(
            update,
            Some(ProgressUpdate::Finished {
                filename: Some("downloads/job-1_123.m4a".to_string()),
            })
        );
    }

    #[test]
    fn ignores_unrelated_output() {
        assert!(parse_progress_line("[Merger] Merging formats into \"x.mp4\"").is_none());
        assert!(parse_progress_line("fbdl-progress|error|NA|NA|NA|NA").is_none());
    }

    #[test]
    fn mp4_args_force_container_and_skip_subtitles() {
        let args = download_args(&task(OutputFormat::Mp4, Quality::P1080, None));

        assert_eq!(
            value_after(&args, "-f"),
            Some("bestvideo[height<=1080]+bestaudio/best[height<=1080]/best")
        );
        assert_eq!(value_after(&args, "--merge-output-format"), Some("mp4"));
        assert!(args.iter().any(|arg| arg == "--no-keep-video"));
        assert!(args.iter().any(|arg| arg == "--no-write-subs"));
        assert!(!args.iter().any(|arg| arg == "-x"));
        assert_eq!(args.last().map(String::as_str), Some("https://www.facebook.com/watch/?v=123"));
    }

    #[test]
    fn mp3_args_transcode_at_quality_bitrate() {
        let args = download_args(&task(OutputFormat::Mp3, Quality::Highest, None));
        assert_eq!(value_after(&args, "-f"), Some("bestaudio/best"));
        assert_eq!(value_after(&args, "--audio-format"), Some("mp3"));
        assert_eq!(value_after(&args, "--audio-quality"), Some("320K"));

        let args = download_args(&task(OutputFormat::Mp3, Quality::P720, None));
        assert_eq!(value_after(&args, "--audio-quality"), Some("128K"));
    }

    #[test]
    fn output_template_prefixes_job_id() {
        let args = download_args(&task(OutputFormat::Mp4, Quality::Highest, None));
        let template = PathBuf::from(value_after(&args, "-o").unwrap());

        assert_eq!(template.parent(), Some(PathBuf::from("downloads").as_path()));
        assert_eq!(
            template.file_name().and_then(|name| name.to_str()),
            Some("job-1_%(id)s.%(ext)s")
        );
        assert!(args.iter().any(|arg| arg == "--restrict-filenames"));
        assert!(args.iter().any(|arg| arg == "--windows-filenames"));
    }

    #[test]
    fn common_args_carry_browser_headers_and_cookie() {
        let args = common_args(Some("c_user=1; xs=2"));

        assert_eq!(value_after(&args, "--referer"), Some(REFERER));
        assert_eq!(value_after(&args, "--extractor-retries"), Some("3"));
        assert!(args.iter().any(|arg| arg == "--no-check-certificate"));
        assert!(args.iter().any(|arg| arg == "Cookie:c_user=1; xs=2"));

        let without_cookie = common_args(None);
        assert!(!without_cookie.iter().any(|arg| arg.starts_with("Cookie:")));
    }

    #[test]
    fn failure_message_prefers_error_line() {
        let status = std::process::Command::new("sh")
            .args(["-c", "exit 1"])
            .status()
            .unwrap();
        let stderr = "[facebook] Extracting URL\nERROR: [facebook] 123: Cannot parse data\nsome trailing note\n";

        assert_eq!(
            failure_message(stderr.lines(), status),
            "ERROR: [facebook] 123: Cannot parse data"
        );
        assert_eq!(failure_message("".lines(), status), format!("yt-dlp exited with {status}"));
    }

    #[test]
    fn command_line_splits_interpreter_and_module() {
        let ytdlp = YtDlp::from_command_line("python3 -m yt_dlp").unwrap();
        assert_eq!(ytdlp.program, "python3");
        assert_eq!(ytdlp.leading_args, vec!["-m", "yt_dlp"]);
        assert!(YtDlp::from_command_line("   ").is_none());
    }

    fn scripted(script: &str) -> (tempfile::TempDir, YtDlp) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fake-yt-dlp.sh");
        std::fs::write(&path, script).unwrap();
        let ytdlp = YtDlp::new("sh", vec![path.to_string_lossy().to_string()]);
        (dir, ytdlp)
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn fetch_info_parses_engine_json() {
        let (_dir, ytdlp) = scripted(
            r#"cat <<'EOF'
{"title": "Clip", "duration": 12.5, "uploader": "Page", "view_count": null, "upload_date": "20240101",
 "formats": [
   {"format_id": "sb", "ext": "mhtml", "vcodec": "none", "acodec": "none"},
   {"format_id": "audio", "ext": "m4a", "vcodec": "none", "acodec": "mp4a.40.5", "filesize": 1024},
   {"format_id": "hd", "ext": "mp4", "vcodec": "avc1", "acodec": "mp4a", "resolution": "1280x720", "fps": 30}
 ]}
EOF
"#,
        );

        let info = ytdlp.fetch_info("https://fb.watch/x", None).await.unwrap();
        assert_eq!(info.title, "Clip");
        assert_eq!(info.view_count, 0);
        assert_eq!(info.formats.len(), 2);
        assert_eq!(info.formats[0].format_id.as_deref(), Some("audio"));
        assert_eq!(info.formats[1].fps, Some(30.0));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn fetch_info_surfaces_engine_error_text() {
        let (_dir, ytdlp) = scripted("echo 'ERROR: Unsupported URL: https://example.com' >&2\nexit 1\n");

        let error = ytdlp.fetch_info("https://example.com", None).await.unwrap_err();
        assert_eq!(error.to_string(), "ERROR: Unsupported URL: https://example.com");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn download_reports_progress_in_order() {
        let (_dir, ytdlp) = scripted(
            "echo '[facebook] Extracting URL'\n\
             echo 'fbdl-progress|downloading| 10.0%|1.00MiB/s|00:09|out/job-1_1.mp4'\n\
             echo 'fbdl-progress|downloading| 90.0%|2.00MiB/s|00:01|out/job-1_1.mp4'\n\
             echo 'fbdl-progress|finished|100%|NA|NA|out/job-1_1.mp4'\n",
        );
        let seen = Arc::new(Mutex::new(Vec::new()));
        let on_progress = {
            let seen = Arc::clone(&seen);
            move |update: ProgressUpdate| seen.lock().push(update)
        };

        ytdlp
            .download(&task(OutputFormat::Mp4, Quality::Highest, None), &on_progress)
            .await
            .unwrap();

        let seen = seen.lock().clone();
        assert_eq!(seen.len(), 3);
        assert!(matches!(
            &seen[0],
            ProgressUpdate::Downloading { percent: Some(percent), .. } if percent == "10.0%"
        ));
        assert!(matches!(&seen[2], ProgressUpdate::Finished { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn download_failure_carries_stderr() {
        let (_dir, ytdlp) = scripted("echo 'ERROR: Postprocessing: ffmpeg not found' >&2\nexit 1\n");

        let error = ytdlp
            .download(&task(OutputFormat::Mp3, Quality::Highest, None), &|_: ProgressUpdate| {})
            .await
            .unwrap_err();
        assert!(error.to_string().contains("ffmpeg not found"));
    }

    #[tokio::test]
    async fn missing_binary_is_reported() {
        let ytdlp = YtDlp::new("definitely-not-yt-dlp-binary", Vec::new());

        let error = ytdlp.fetch_info("https://fb.watch/x", None).await.unwrap_err();
        assert!(matches!(error, ExtractorError::NotInstalled(program) if program == "definitely-not-yt-dlp-binary"));
    }
}
