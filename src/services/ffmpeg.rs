//! FFmpeg-backed video decoding.
//!
//! `ffprobe` supplies stream metadata; `ffmpeg` decodes the first video stream
//! to raw `rgb24` frames on stdout, which are read one at a time. Frames are
//! decoded in coded orientation so they always match the size ffprobe reports.

use image::RgbImage;
use serde::Deserialize;
use std::ffi::OsString;
use std::io::{ErrorKind, Read};
use std::path::Path;
use std::process::{Child, ChildStdout, Command, Stdio};

use crate::services::error::AnalysisError;
use crate::services::video_analyzer::{FrameSource, StreamInfo};

/// FFprobe JSON output format.
#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    streams: Vec<FfprobeStream>,
    format: Option<FfprobeFormat>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    width: Option<u32>,
    height: Option<u32>,
    avg_frame_rate: Option<String>,
    r_frame_rate: Option<String>,
    nb_frames: Option<String>,
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
}

/// Geometry and timing of the first video stream.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbedStream {
    pub width: u32,
    pub height: u32,
    pub info: StreamInfo,
}

/// Probe a video file for its first video stream.
pub fn probe_stream(path: &Path) -> Result<ProbedStream, AnalysisError> {
    let ffprobe = which::which("ffprobe")
        .map_err(|_| AnalysisError::Open("ffprobe not found on PATH".to_string()))?;

    let output = Command::new(ffprobe)
        .args([
            "-v",
            "error",
            "-select_streams",
            "v:0",
            "-show_entries",
            "stream=width,height,avg_frame_rate,r_frame_rate,nb_frames,duration:format=duration",
            "-of",
            "json",
        ])
        .arg(path)
        .stdin(Stdio::null())
        .output()
        .map_err(|e| AnalysisError::Open(e.to_string()))?;

    if !output.status.success() {
        return Err(AnalysisError::Open(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ));
    }

    parse_stream_json(&output.stdout)
}

/// Read `ffprobe -of json` output. Containers without a frame count (MKV,
/// WebM) get one estimated from duration and frame rate.
fn parse_stream_json(json: &[u8]) -> Result<ProbedStream, AnalysisError> {
    let parsed: FfprobeOutput = serde_json::from_slice(json)
        .map_err(|e| AnalysisError::Open(format!("unreadable ffprobe output: {e}")))?;
    let format_duration = parsed.format.and_then(|f| f.duration);
    let stream = parsed
        .streams
        .into_iter()
        .next()
        .ok_or_else(|| AnalysisError::Open("no video stream found".to_string()))?;

    let (width, height) = match (stream.width, stream.height) {
        (Some(w), Some(h)) if w > 0 && h > 0 => (w, h),
        _ => return Err(AnalysisError::Open("video stream has no dimensions".to_string())),
    };

    let fps = stream
        .avg_frame_rate
        .as_deref()
        .and_then(parse_frame_rate)
        .or_else(|| stream.r_frame_rate.as_deref().and_then(parse_frame_rate));
    let duration = [stream.duration.as_deref(), format_duration.as_deref()]
        .into_iter()
        .flatten()
        .filter_map(|d| d.parse::<f64>().ok())
        .find(|d| d.is_finite() && *d > 0.0);
    let total_frames = stream
        .nb_frames
        .as_deref()
        .and_then(|n| n.parse().ok())
        .or_else(|| Some((duration? * fps?).round() as u64));

    Ok(ProbedStream {
        width,
        height,
        info: StreamInfo { fps, total_frames },
    })
}

/// Parse frame rate string (e.g., "30/1" or "29.97"). Zero rates are treated as unknown.
fn parse_frame_rate(s: &str) -> Option<f64> {
    let rate = if let Some((num, den)) = s.split_once('/') {
        let num: f64 = num.parse().ok()?;
        let den: f64 = den.parse().ok()?;
        if den <= 0.0 {
            return None;
        }
        num / den
    } else {
        s.parse().ok()?
    };
    (rate.is_finite() && rate > 0.0).then_some(rate)
}

/// Arguments decoding the first video stream of `path` to raw RGB on stdout.
/// `-noautorotate` is an input option and must precede `-i`.
fn decode_args(path: &Path) -> Vec<OsString> {
    let mut args: Vec<OsString> = ["-v", "error", "-nostdin", "-noautorotate", "-i"]
        .into_iter()
        .map(OsString::from)
        .collect();
    args.push(path.as_os_str().to_owned());
    args.extend(
        ["-map", "0:v:0", "-f", "rawvideo", "-pix_fmt", "rgb24", "-"]
            .into_iter()
            .map(OsString::from),
    );
    args
}

/// Sequential frame reader over an `ffmpeg` child process.
pub struct FfmpegFrameSource {
    child: Child,
    stdout: ChildStdout,
    stream: ProbedStream,
    buffer: Vec<u8>,
    grabbed: bool,
}

impl FfmpegFrameSource {
    pub fn open(path: &Path) -> Result<Self, AnalysisError> {
        let stream = probe_stream(path)?;
        let ffmpeg = which::which("ffmpeg")
            .map_err(|_| AnalysisError::Open("ffmpeg not found on PATH".to_string()))?;

        let mut child = Command::new(ffmpeg)
            .args(decode_args(path))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| AnalysisError::Open(e.to_string()))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AnalysisError::Open("ffmpeg stdout unavailable".to_string()))?;

        let frame_len = stream.width as usize * stream.height as usize * 3;
        tracing::debug!(
            path = %path.display(),
            width = stream.width,
            height = stream.height,
            fps = ?stream.info.fps,
            total_frames = ?stream.info.total_frames,
            "Opened video stream"
        );

        Ok(Self {
            child,
            stdout,
            stream,
            buffer: vec![0; frame_len],
            grabbed: false,
        })
    }
}

impl FrameSource for FfmpegFrameSource {
    fn info(&self) -> StreamInfo {
        self.stream.info
    }

    fn grab(&mut self) -> Result<bool, AnalysisError> {
        match self.stdout.read_exact(&mut self.buffer) {
            Ok(()) => {
                self.grabbed = true;
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                self.grabbed = false;
                Ok(false)
            }
            Err(e) => Err(AnalysisError::Decode(e.to_string())),
        }
    }

    fn retrieve(&mut self) -> Result<Option<RgbImage>, AnalysisError> {
        if !self.grabbed {
            return Ok(None);
        }
        Ok(RgbImage::from_raw(
            self.stream.width,
            self.stream.height,
            self.buffer.clone(),
        ))
    }
}

impl Drop for FfmpegFrameSource {
    fn drop(&mut self) {
        // Sampling may stop before the stream ends.
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}
