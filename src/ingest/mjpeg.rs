//! HTTP camera source.
//!
//! This module provides `MjpegSource` for IP cameras (for example phone
//! "IP Webcam" apps) that serve MJPEG over HTTP, or a single JPEG per request.
//!
//! The source is responsible for:
//! - Opening the HTTP stream with bounded connect/read timeouts, trying the
//!   configured fallback paths when the primary URL does not answer
//! - Carving JPEG frames out of the multipart byte stream
//! - Decoding frames in memory
//!
//! Every read is bounded twice: by `read_timeout` on the wall clock and by
//! `MAX_JPEG_BYTES` on the bytes consumed. A body that never yields a frame
//! therefore fails the read instead of holding the caller forever.
//!
//! Transport errors and stalls surface as `ConnectionFailure`; bytes that do
//! not form or decode as an image surface as `DecodeFailure`.

use std::io::Read;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use url::Url;

use super::{FrameSource, SourceStats};
use crate::error::AttendanceError;
use crate::frame::Frame;

const MAX_JPEG_BYTES: usize = 5 * 1024 * 1024;
const READ_CHUNK_BYTES: usize = 8192;
const HEALTH_GRACE: Duration = Duration::from_secs(5);

const SOI: u8 = 0xD8;
const EOI: u8 = 0xD9;
const SOS: u8 = 0xDA;

/// Configuration for an HTTP camera.
#[derive(Clone, Debug)]
pub struct MjpegConfig {
    /// Stream URL, e.g. `http://192.168.8.17:8080/video`.
    pub url: String,
    /// Upper bound on connect, on each blocking read, and on one whole frame.
    pub read_timeout: Duration,
    /// Paths tried on the same host when `url` cannot be opened.
    pub fallback_paths: Vec<String>,
}

impl Default for MjpegConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8080/video".to_string(),
            read_timeout: Duration::from_secs(5),
            fallback_paths: Vec::new(),
        }
    }
}

pub struct MjpegSource {
    config: MjpegConfig,
    agent: ureq::Agent,
    stream: Option<HttpStream>,
    last_frame_at: Option<Instant>,
    frame_count: u64,
}

enum HttpStream {
    Multipart(MultipartReader),
    /// Snapshot camera; every read is a fresh request to this URL.
    SingleJpeg(String),
}

impl MjpegSource {
    pub fn new(config: MjpegConfig) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(config.read_timeout)
            .timeout_read(config.read_timeout)
            .build();
        Self {
            config,
            agent,
            stream: None,
            last_frame_at: None,
            frame_count: 0,
        }
    }

    /// The configured URL followed by each fallback path on the same host.
    fn candidate_urls(&self) -> Result<Vec<String>> {
        let primary = Url::parse(&self.config.url).context("parse camera url")?;
        let mut urls = vec![self.config.url.clone()];
        for path in &self.config.fallback_paths {
            let mut alternate = primary.clone();
            alternate.set_path(path);
            let alternate = alternate.to_string();
            if !urls.contains(&alternate) {
                urls.push(alternate);
            }
        }
        Ok(urls)
    }

    fn open_url(&self, url: &str) -> Result<HttpStream> {
        let response = self
            .agent
            .get(url)
            .call()
            .with_context(|| format!("connect to camera stream {}", url))?;
        let content_type = response.header("Content-Type").unwrap_or("");
        if content_type.to_lowercase().contains("multipart") {
            Ok(HttpStream::Multipart(MultipartReader::new(
                response.into_reader(),
            )))
        } else {
            Ok(HttpStream::SingleJpeg(url.to_string()))
        }
    }

    fn fetch_single_jpeg(&self, url: &str) -> Result<Vec<u8>> {
        let response = self
            .agent
            .get(url)
            .timeout(self.config.read_timeout)
            .call()
            .with_context(|| format!("fetch jpeg snapshot from {}", url))?;
        let mut bytes = Vec::new();
        response
            .into_reader()
            .take(MAX_JPEG_BYTES as u64)
            .read_to_end(&mut bytes)
            .context("read jpeg snapshot")?;
        if bytes.is_empty() {
            return Err(anyhow!("empty jpeg snapshot"));
        }
        Ok(bytes)
    }
}

impl FrameSource for MjpegSource {
    fn describe(&self) -> String {
        self.config.url.clone()
    }

    fn open(&mut self) -> Result<()> {
        let mut last_err = None;
        for url in self.candidate_urls()? {
            match self.open_url(&url) {
                Ok(stream) => {
                    if url != self.config.url {
                        log::info!("camera answered on fallback url {}", url);
                    }
                    self.stream = Some(stream);
                    return Ok(());
                }
                Err(err) => {
                    log::debug!("camera url {} unavailable: {:#}", url, err);
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow!("no camera url to try")))
    }

    fn read(&mut self) -> Result<Option<Frame>, AttendanceError> {
        let jpeg = match self.stream.as_mut() {
            None => {
                return Err(AttendanceError::ConnectionFailure(anyhow!(
                    "camera stream not open"
                )))
            }
            Some(HttpStream::Multipart(reader)) => {
                reader.read_next_jpeg(Instant::now() + self.config.read_timeout)?
            }
            Some(HttpStream::SingleJpeg(url)) => {
                let url = url.clone();
                Some(
                    self.fetch_single_jpeg(&url)
                        .map_err(AttendanceError::ConnectionFailure)?,
                )
            }
        };
        let Some(jpeg) = jpeg else {
            return Ok(None);
        };
        let frame = Frame::from_jpeg(&jpeg).map_err(AttendanceError::DecodeFailure)?;
        self.frame_count += 1;
        self.last_frame_at = Some(Instant::now());
        Ok(Some(frame))
    }

    fn close(&mut self) {
        self.stream = None;
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            source: self.config.url.clone(),
            healthy: self.stream.is_some()
                && self
                    .last_frame_at
                    .is_some_and(|at| at.elapsed() <= HEALTH_GRACE),
        }
    }
}

/// Splits a multipart MJPEG body into JPEG payloads.
///
/// Frames are carved by walking JPEG marker segments, so SOI/EOI pairs
/// nested inside APPn payloads (EXIF thumbnails) are skipped by length.
/// Parsing resumes where the previous chunk stopped.
struct MultipartReader {
    reader: Box<dyn Read + Send>,
    buffer: Vec<u8>,
    /// Offset of the SOI of the frame being carved.
    start: Option<usize>,
    /// Next offset to examine.
    cursor: usize,
    /// Inside entropy-coded scan data.
    in_scan: bool,
}

/// Result of examining one marker or scan run.
#[derive(Debug, PartialEq, Eq)]
enum Step {
    /// Continue at this offset.
    Advance { to: usize, in_scan: bool },
    /// More bytes needed; resume at this offset.
    Need(usize),
    /// Frame ends at this offset (exclusive).
    End(usize),
    Corrupt(&'static str),
}

impl MultipartReader {
    fn new(reader: Box<dyn Read + Send>) -> Self {
        Self {
            reader,
            buffer: Vec::with_capacity(64 * 1024),
            start: None,
            cursor: 0,
            in_scan: false,
        }
    }

    /// Next complete JPEG, or `None` once the body is exhausted.
    ///
    /// Fails with `ConnectionFailure` when `deadline` passes and with
    /// `DecodeFailure` when more than `MAX_JPEG_BYTES` arrive without a frame.
    fn read_next_jpeg(&mut self, deadline: Instant) -> Result<Option<Vec<u8>>, AttendanceError> {
        let mut chunk = vec![0u8; READ_CHUNK_BYTES];
        let mut consumed = 0usize;
        loop {
            if let Some(frame) = self.carve()? {
                return Ok(Some(frame));
            }

            if consumed > MAX_JPEG_BYTES {
                self.reset();
                return Err(AttendanceError::DecodeFailure(anyhow!(
                    "no complete jpeg within {} bytes",
                    MAX_JPEG_BYTES
                )));
            }
            if Instant::now() >= deadline {
                self.reset();
                return Err(AttendanceError::ConnectionFailure(anyhow!(
                    "no complete jpeg before read deadline"
                )));
            }

            let read = self
                .reader
                .read(&mut chunk)
                .context("read mjpeg chunk")
                .map_err(AttendanceError::ConnectionFailure)?;
            if read == 0 {
                return Ok(None);
            }
            consumed += read;
            self.buffer.extend_from_slice(&chunk[..read]);
        }
    }

    fn carve(&mut self) -> Result<Option<Vec<u8>>, AttendanceError> {
        loop {
            let Some(start) = self.start else {
                match find_soi(&self.buffer, self.cursor) {
                    Some(pos) => {
                        self.start = Some(pos);
                        self.cursor = pos + 2;
                        self.in_scan = false;
                        continue;
                    }
                    None => {
                        // Keep a trailing 0xFF that may open the next SOI.
                        let keep = usize::from(self.buffer.last() == Some(&0xFF));
                        self.buffer.drain(..self.buffer.len() - keep);
                        self.cursor = 0;
                        return Ok(None);
                    }
                }
            };

            match next_step(&self.buffer, self.cursor, self.in_scan) {
                Step::Advance { to, in_scan } => {
                    self.cursor = to;
                    self.in_scan = in_scan;
                }
                Step::Need(resume) => {
                    self.cursor = resume;
                    return Ok(None);
                }
                Step::End(end) => {
                    let frame = self.buffer[start..end].to_vec();
                    self.buffer.drain(..end);
                    self.reset();
                    return Ok(Some(frame));
                }
                Step::Corrupt(reason) => {
                    let skip = (start + 2).min(self.buffer.len());
                    self.buffer.drain(..skip);
                    self.reset();
                    return Err(AttendanceError::DecodeFailure(anyhow!(reason)));
                }
            }
        }
    }

    fn reset(&mut self) {
        self.start = None;
        self.cursor = 0;
        self.in_scan = false;
    }
}

fn find_soi(buffer: &[u8], from: usize) -> Option<usize> {
    buffer
        .get(from..)?
        .windows(2)
        .position(|w| w == [0xFF, SOI])
        .map(|pos| pos + from)
}

fn next_step(buffer: &[u8], pos: usize, in_scan: bool) -> Step {
    if in_scan {
        let mut i = pos;
        while i + 1 < buffer.len() {
            if buffer[i] != 0xFF {
                i += 1;
                continue;
            }
            match buffer[i + 1] {
                // stuffed byte or restart marker: still scan data
                0x00 | 0xD0..=0xD7 => i += 2,
                0xFF => i += 1,
                _ => return Step::Advance { to: i, in_scan: false },
            }
        }
        return Step::Need(i);
    }

    let Some(&lead) = buffer.get(pos) else {
        return Step::Need(pos);
    };
    if lead != 0xFF {
        return Step::Corrupt("expected jpeg marker");
    }
    let Some(&marker) = buffer.get(pos + 1) else {
        return Step::Need(pos);
    };
    match marker {
        0xFF => Step::Advance {
            to: pos + 1,
            in_scan: false,
        },
        EOI => Step::End(pos + 2),
        SOI => Step::Corrupt("unexpected start of image inside frame"),
        0x01 | 0xD0..=0xD7 => Step::Advance {
            to: pos + 2,
            in_scan: false,
        },
        _ => {
            let (Some(&hi), Some(&lo)) = (buffer.get(pos + 2), buffer.get(pos + 3)) else {
                return Step::Need(pos);
            };
            let len = usize::from(u16::from_be_bytes([hi, lo]));
            if len < 2 {
                return Step::Corrupt("invalid jpeg segment length");
            }
            Step::Advance {
                to: pos + 2 + len,
                in_scan: marker == SOS,
            }
        }
    }
}
