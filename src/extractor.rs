#![forbid(unsafe_code)]

//! Bridge between the job store and the external media extraction tool.
//!
//! yt-dlp does the actual network fetch, format selection, muxing and audio
//! transcoding. This module only decides which flags to pass, translates the
//! tool's progress output into [`ProgressEvent`]s, and turns whatever file the
//! tool left behind into a sanitized artifact the stream endpoint can serve.
//!
//! The progress side is a single-method capability, [`ProgressSink`], so the
//! adapter can be exercised with a fake sink and the HTTP layer with a fake
//! [`Extractor`].

use std::{
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use async_trait::async_trait;
use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::Command,
    sync::mpsc,
};

use crate::jobs::{JobStore, JobUpdate, remove_staging_dir};
use crate::sanitize::sanitize_filename;

/// Marker prefixed to every line produced by our `--progress-template`.
const PROGRESS_MARKER: &str = "MFPROG";
/// Marker prefixed to the final path printed after post-processing.
const OUTPUT_MARKER: &str = "MFDONE";

const PROGRESS_TEMPLATE: &str = "download:MFPROG|%(progress.status)s|%(progress.downloaded_bytes)s|%(progress.total_bytes)s|%(progress.total_bytes_estimate)s|%(progress.filename)s";
const OUTPUT_TEMPLATE: &str = "after_move:MFDONE|%(filepath)s";
const OUTPUT_NAME_TEMPLATE: &str = "%(title)s.%(ext)s";

const VIDEO_HEIGHTS: [u32; 8] = [144, 240, 360, 480, 720, 1080, 1440, 2160];
const AUDIO_CODEC: &str = "mp3";
const AUDIO_BITRATE: &str = "192K";
const VIDEO_CONTAINER: &str = "mp4";

/// Leftovers yt-dlp writes next to the real output while it works.
const SCRATCH_EXTENSIONS: [&str; 5] = ["part", "ytdl", "temp", "tmp", "json"];

/// Requested output flavour.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Quality {
    /// Best video no taller than `max_height`, merged with the best audio.
    Video { max_height: u32 },
    /// Best available audio, transcoded to mp3.
    Audio,
}

impl Default for Quality {
    fn default() -> Self {
        Self::Video { max_height: 720 }
    }
}

impl Quality {
    /// Accepts `720p`, `720`, `audio` (any case). Heights outside the fixed
    /// ladder are rejected.
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim().to_ascii_lowercase();
        if value == "audio" {
            return Some(Self::Audio);
        }
        let digits = value.strip_suffix('p').unwrap_or(&value);
        let height = digits.parse::<u32>().ok()?;
        VIDEO_HEIGHTS
            .contains(&height)
            .then_some(Self::Video { max_height: height })
    }

    pub fn label(self) -> String {
        match self {
            Self::Video { max_height } => format!("{max_height}p"),
            Self::Audio => "audio".to_string(),
        }
    }

    /// Extension of the file the tool leaves behind for this quality.
    pub fn output_extension(self) -> &'static str {
        match self {
            Self::Video { .. } => VIDEO_CONTAINER,
            Self::Audio => AUDIO_CODEC,
        }
    }

    fn format_args(self) -> Vec<String> {
        match self {
            Self::Video { max_height } => vec![
                "-f".to_string(),
                format!("bestvideo[height<={max_height}]+bestaudio/best"),
                "--merge-output-format".to_string(),
                VIDEO_CONTAINER.to_string(),
            ],
            Self::Audio => vec![
                "-f".to_string(),
                "bestaudio/best".to_string(),
                "-x".to_string(),
                "--audio-format".to_string(),
                AUDIO_CODEC.to_string(),
                "--audio-quality".to_string(),
                AUDIO_BITRATE.to_string(),
            ],
        }
    }
}

/// Progress notification emitted by the extraction tool.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProgressEvent {
    Downloading {
        downloaded_bytes: u64,
        total_bytes: Option<u64>,
        total_bytes_estimate: Option<u64>,
    },
    /// One transfer completed. Merged downloads emit this once per stream.
    Finished { filename: Option<PathBuf> },
}

/// `floor(downloaded / total * 100)`, preferring the exact total over the
/// estimate. Without any usable total there is nothing to report, so 0 is
/// returned and the job keeps its previous percentage.
pub fn progress_percent(
    downloaded_bytes: u64,
    total_bytes: Option<u64>,
    total_bytes_estimate: Option<u64>,
) -> u8 {
    let Some(total) = total_bytes
        .filter(|total| *total > 0)
        .or(total_bytes_estimate.filter(|total| *total > 0))
    else {
        return 0;
    };
    let percent = u128::from(downloaded_bytes) * 100 / u128::from(total);
    percent.min(100) as u8
}

/// Receives progress events for one job.
pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, event: ProgressEvent);
}

/// Sink that writes events straight into the [`JobStore`].
pub struct JobProgressSink {
    store: JobStore,
    job_id: String,
}

impl JobProgressSink {
    pub fn new(store: JobStore, job_id: impl Into<String>) -> Self {
        Self {
            store,
            job_id: job_id.into(),
        }
    }
}

impl ProgressSink for JobProgressSink {
    fn on_progress(&self, event: ProgressEvent) {
        let update = match event {
            ProgressEvent::Downloading {
                downloaded_bytes,
                total_bytes,
                total_bytes_estimate,
            } => JobUpdate::downloading(progress_percent(
                downloaded_bytes,
                total_bytes,
                total_bytes_estimate,
            )),
            ProgressEvent::Finished { filename } => JobUpdate::finished(
                filename
                    .as_deref()
                    .and_then(Path::file_name)
                    .map(|name| name.to_string_lossy().into_owned()),
            ),
        };
        self.store.update(&self.job_id, update);
    }
}

/// Everything the tool needs to fetch one job.
#[derive(Clone, Debug)]
pub struct FetchRequest {
    pub job_id: String,
    pub url: String,
    pub quality: Quality,
    /// Per-job staging directory; created before the tool runs.
    pub output_dir: PathBuf,
}

/// What the tool reported after it exited successfully.
#[derive(Clone, Debug, Default)]
pub struct ToolOutput {
    /// Final path after post-processing, when the tool printed one.
    pub final_path: Option<PathBuf>,
}

/// Finished artifact: sanitized name and its location in the staging area.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FetchOutcome {
    pub filename: String,
    pub path: PathBuf,
}

#[derive(Debug, Error)]
pub enum ExtractError {
    /// The tool ran and reported a failure (unsupported URL, network error,
    /// extraction failure...). Carries the tool's own message.
    #[error("{0}")]
    Download(String),
    #[error("could not launch extraction tool: {0}")]
    Launch(std::io::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("extraction timed out after {}s", .0.as_secs())]
    Timeout(Duration),
    #[error("extraction tool did not produce an output file")]
    MissingOutput,
}

impl ExtractError {
    pub fn is_download_error(&self) -> bool {
        matches!(self, Self::Download(_))
    }

    /// Message handed to the client. The tool's text is passed through as-is.
    pub fn client_message(&self) -> String {
        match self {
            Self::Download(message) => format!("Download error: {message}"),
            other => format!("An error occurred: {other}"),
        }
    }
}

/// The external fetch tool.
#[async_trait]
pub trait Extractor: Send + Sync {
    /// Downloads `request.url` into `request.output_dir`, reporting progress
    /// through `sink`. Returns once the tool exited.
    async fn fetch(
        &self,
        request: &FetchRequest,
        sink: &dyn ProgressSink,
    ) -> Result<ToolOutput, ExtractError>;
}

/// Runs one job end to end: fetch, post-process, record the outcome.
///
/// Success stores the sanitized filename and staged path in the job. Any
/// failure moves the job to `error` and deletes the partial staging
/// directory; the job itself stays for inspection until it is evicted.
pub async fn run_extraction(
    extractor: &dyn Extractor,
    store: &JobStore,
    request: &FetchRequest,
    timeout: Option<Duration>,
) -> Result<FetchOutcome, ExtractError> {
    let sink = JobProgressSink::new(store.clone(), request.job_id.clone());
    let result = fetch_and_finalize(extractor, &sink, request, timeout).await;

    match &result {
        Ok(outcome) => {
            let recorded = store.update(
                &request.job_id,
                JobUpdate::completed(outcome.filename.clone(), outcome.path.clone()),
            );
            if recorded {
                tracing::info!(
                    job_id = %request.job_id,
                    filename = %outcome.filename,
                    "download finished"
                );
            } else {
                tracing::warn!(
                    job_id = %request.job_id,
                    "job vanished before the download finished; discarding artifact"
                );
                remove_staging_dir(&request.output_dir).await;
            }
        }
        Err(err) => {
            tracing::warn!(
                job_id = %request.job_id,
                url = %request.url,
                download_error = err.is_download_error(),
                "download failed: {err}"
            );
            store.update(&request.job_id, JobUpdate::failed(err.client_message()));
            remove_staging_dir(&request.output_dir).await;
        }
    }

    result
}

async fn fetch_and_finalize(
    extractor: &dyn Extractor,
    sink: &dyn ProgressSink,
    request: &FetchRequest,
    timeout: Option<Duration>,
) -> Result<FetchOutcome, ExtractError> {
    tokio::fs::create_dir_all(&request.output_dir).await?;
    let fetch = extractor.fetch(request, sink);
    let output = match timeout {
        Some(limit) => tokio::time::timeout(limit, fetch)
            .await
            .map_err(|_| ExtractError::Timeout(limit))??,
        None => fetch.await?,
    };
    finalize_artifact(output, request.quality, &request.output_dir).await
}

/// Resolves the file the tool produced, then renames it to its sanitized
/// name inside `dir`.
///
/// Audio jobs are transcoded after the transfer, so a reported path that
/// still carries the source extension is swapped for its `.mp3` sibling.
pub async fn finalize_artifact(
    output: ToolOutput,
    quality: Quality,
    dir: &Path,
) -> Result<FetchOutcome, ExtractError> {
    // Only trust the file name; the artifact has to live in the job's dir.
    let reported = output
        .final_path
        .as_deref()
        .and_then(Path::file_name)
        .map(|name| dir.join(name));

    let mut path = match reported {
        Some(path) if tokio::fs::try_exists(&path).await.unwrap_or(false) => path,
        _ => locate_output(dir, quality).await?,
    };

    let wanted = quality.output_extension();
    if path.extension().and_then(|ext| ext.to_str()) != Some(wanted) {
        let candidate = path.with_extension(wanted);
        if tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
            path = candidate;
        }
    }

    let original = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or(ExtractError::MissingOutput)?;
    let filename = sanitize_filename(&original);
    let safe_path = dir.join(&filename);
    if safe_path != path {
        tokio::fs::rename(&path, &safe_path).await?;
        tracing::debug!(from = %original, to = %filename, "renamed staged file");
    }

    Ok(FetchOutcome {
        filename,
        path: safe_path,
    })
}

/// Picks the most recently modified finished file in `dir`, preferring the
/// extension the quality is expected to produce.
async fn locate_output(dir: &Path, quality: Quality) -> Result<PathBuf, ExtractError> {
    let wanted = quality.output_extension();
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut best: Option<(bool, std::time::SystemTime, PathBuf)> = None;

    while let Some(entry) = entries.next_entry().await? {
        let meta = entry.metadata().await?;
        if !meta.is_file() {
            continue;
        }
        let path = entry.path();
        let ext = path
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or("")
            .to_ascii_lowercase();
        if SCRATCH_EXTENSIONS.contains(&ext.as_str())
            || path.to_string_lossy().contains(".part-Frag")
        {
            continue;
        }
        let modified = meta.modified().unwrap_or(std::time::UNIX_EPOCH);
        let rank = (ext == wanted, modified, path);
        match &best {
            Some((preferred, time, _)) if (*preferred, *time) >= (rank.0, rank.1) => {}
            _ => best = Some(rank),
        }
    }

    best.map(|(_, _, path)| path)
        .ok_or(ExtractError::MissingOutput)
}

/// One classified line of tool output.
#[derive(Clone, Debug, PartialEq, Eq)]
enum ToolLine {
    Progress(ProgressEvent),
    Output(PathBuf),
    Error(String),
    Other(String),
}

fn parse_tool_line(line: &str) -> ToolLine {
    let trimmed = line.trim_end_matches(['\r', '\n']);
    if let Some(rest) = trimmed.strip_prefix(PROGRESS_MARKER).and_then(|r| r.strip_prefix('|'))
        && let Some(event) = parse_progress_fields(rest)
    {
        return ToolLine::Progress(event);
    }
    if let Some(path) = trimmed
        .strip_prefix(OUTPUT_MARKER)
        .and_then(|rest| rest.strip_prefix('|'))
        .filter(|path| !path.is_empty() && *path != "NA")
    {
        return ToolLine::Output(PathBuf::from(path));
    }
    if let Some(message) = trimmed.strip_prefix("ERROR:") {
        return ToolLine::Error(message.trim().to_string());
    }
    ToolLine::Other(trimmed.to_string())
}

fn parse_progress_fields(rest: &str) -> Option<ProgressEvent> {
    // The filename is last and may itself contain '|'.
    let mut fields = rest.splitn(5, '|');
    let status = fields.next()?;
    let downloaded = parse_byte_count(fields.next()?);
    let total = parse_byte_count(fields.next()?);
    let estimate = parse_byte_count(fields.next()?);
    let filename = fields
        .next()
        .filter(|name| !name.is_empty() && *name != "NA")
        .map(PathBuf::from);

    match status {
        "downloading" => Some(ProgressEvent::Downloading {
            downloaded_bytes: downloaded.unwrap_or(0),
            total_bytes: total,
            total_bytes_estimate: estimate,
        }),
        "finished" => Some(ProgressEvent::Finished { filename }),
        _ => None,
    }
}

/// yt-dlp prints `NA` for missing fields and floats for estimates.
fn parse_byte_count(value: &str) -> Option<u64> {
    let value = value.trim();
    if let Ok(count) = value.parse::<u64>() {
        return Some(count);
    }
    value
        .parse::<f64>()
        .ok()
        .filter(|count| count.is_finite() && *count >= 0.0)
        .map(|count| count as u64)
}

/// [`Extractor`] backed by the `yt-dlp` executable.
#[derive(Clone, Debug)]
pub struct YtDlp {
    binary: PathBuf,
}

impl YtDlp {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn build_args(request: &FetchRequest) -> Vec<String> {
        let mut args = vec![
            "--no-playlist".to_string(),
            "--no-warnings".to_string(),
            "--newline".to_string(),
            "--progress".to_string(),
            "--progress-template".to_string(),
            PROGRESS_TEMPLATE.to_string(),
            "--print".to_string(),
            OUTPUT_TEMPLATE.to_string(),
            "-o".to_string(),
            request
                .output_dir
                .join(OUTPUT_NAME_TEMPLATE)
                .to_string_lossy()
                .into_owned(),
        ];
        args.extend(request.quality.format_args());
        args.push("--".to_string());
        args.push(request.url.clone());
        args
    }
}

#[async_trait]
impl Extractor for YtDlp {
    async fn fetch(
        &self,
        request: &FetchRequest,
        sink: &dyn ProgressSink,
    ) -> Result<ToolOutput, ExtractError> {
        tracing::debug!(
            job_id = %request.job_id,
            quality = %request.quality.label(),
            binary = %self.binary.display(),
            "launching extraction tool"
        );
        let mut child = Command::new(&self.binary)
            .args(Self::build_args(request))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(ExtractError::Launch)?;

        // `--print` implies quiet mode, which moves progress lines to stderr,
        // so both pipes go through the same parser.
        let (tx, mut rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump_lines(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump_lines(stderr, tx.clone()));
        }
        drop(tx);

        let mut output = ToolOutput::default();
        let mut last_error: Option<String> = None;
        let mut last_line: Option<String> = None;
        while let Some(line) = rx.recv().await {
            match line {
                ToolLine::Progress(event) => sink.on_progress(event),
                ToolLine::Output(path) => output.final_path = Some(path),
                ToolLine::Error(message) => last_error = Some(message),
                ToolLine::Other(line) => {
                    if !line.trim().is_empty() {
                        tracing::trace!(job_id = %request.job_id, "yt-dlp: {line}");
                        last_line = Some(line);
                    }
                }
            }
        }

        let status = child.wait().await?;
        tracing::debug!(job_id = %request.job_id, %status, "extraction tool exited");
        if !status.success() {
            let message = last_error
                .or(last_line)
                .unwrap_or_else(|| format!("yt-dlp exited with {status}"));
            return Err(ExtractError::Download(message));
        }
        Ok(output)
    }
}

async fn pump_lines<R>(reader: R, tx: mpsc::UnboundedSender<ToolLine>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if tx.send(parse_tool_line(&line)).is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(err) => {
                tracing::debug!("stopped reading extraction tool output: {err}");
                break;
            }
        }
    }
}
