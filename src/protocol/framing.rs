//! Frame codecs over a byte stream.
//!
//! Two framings are supported: newline-delimited JSON and LSP-style
//! `Content-Length: N\r\n\r\n` headers. Oversized frames are consumed and
//! reported, so one bad frame never desynchronizes the stream.

use serde::{Deserialize, Serialize};
use std::io;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Default cap on one inbound frame.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

/// Header lines are never allowed to grow past this.
const MAX_HEADER_LINE_BYTES: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Framing {
    #[default]
    Line,
    ContentLength,
}

impl std::fmt::Display for Framing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Line => write!(f, "line"),
            Self::ContentLength => write!(f, "content-length"),
        }
    }
}

/// A frame that was read off the stream but cannot be used.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("Frame of {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: usize, limit: usize },

    #[error("Invalid frame header: {0}")]
    BadHeader(String),
}

pub type Frame = Result<Vec<u8>, FrameError>;

pub struct FrameReader<R> {
    reader: R,
    framing: Framing,
    max_frame_bytes: usize,
}

impl<R: AsyncBufRead + Unpin> FrameReader<R> {
    pub fn new(reader: R, framing: Framing, max_frame_bytes: usize) -> Self {
        Self {
            reader,
            framing,
            max_frame_bytes: max_frame_bytes.max(1),
        }
    }

    /// Next frame, or `None` at end of stream.
    ///
    /// The outer error is an I/O failure of the transport; the inner one is a
    /// bad frame that was skipped.
    pub async fn next_frame(&mut self) -> io::Result<Option<Frame>> {
        match self.framing {
            Framing::Line => self.next_line_frame().await,
            Framing::ContentLength => self.next_content_length_frame().await,
        }
    }

    async fn next_line_frame(&mut self) -> io::Result<Option<Frame>> {
        loop {
            let Some((line, size)) = self.read_line_bounded(self.max_frame_bytes).await? else {
                return Ok(None);
            };
            let Some(line) = line else {
                return Ok(Some(Err(FrameError::TooLarge {
                    size,
                    limit: self.max_frame_bytes,
                })));
            };
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            return Ok(Some(Ok(line)));
        }
    }

    async fn next_content_length_frame(&mut self) -> io::Result<Option<Frame>> {
        let mut content_length: Option<usize> = None;
        let mut bad_header: Option<String> = None;
        let mut seen_header = false;

        loop {
            let Some((line, size)) = self.read_line_bounded(MAX_HEADER_LINE_BYTES).await? else {
                if seen_header {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "stream ended inside frame headers",
                    ));
                }
                return Ok(None);
            };
            let Some(line) = line else {
                bad_header.get_or_insert_with(|| format!("header line of {size} bytes"));
                seen_header = true;
                continue;
            };
            if line.is_empty() {
                if seen_header {
                    break;
                }
                // stray blank line between frames
                continue;
            }
            seen_header = true;

            let text = String::from_utf8_lossy(&line);
            let Some((name, value)) = text.split_once(':') else {
                bad_header.get_or_insert_with(|| text.to_string());
                continue;
            };
            if name.trim().eq_ignore_ascii_case("content-length") {
                match value.trim().parse::<usize>() {
                    Ok(n) => content_length = Some(n),
                    Err(_) => {
                        bad_header.get_or_insert_with(|| text.to_string());
                    }
                }
            }
        }

        let Some(length) = content_length else {
            return Ok(Some(Err(FrameError::BadHeader(
                bad_header.unwrap_or_else(|| "missing Content-Length".to_string()),
            ))));
        };
        if length > self.max_frame_bytes {
            self.discard(length).await?;
            return Ok(Some(Err(FrameError::TooLarge {
                size: length,
                limit: self.max_frame_bytes,
            })));
        }

        let mut body = vec![0u8; length];
        self.reader.read_exact(&mut body).await?;
        if let Some(header) = bad_header {
            return Ok(Some(Err(FrameError::BadHeader(header))));
        }
        Ok(Some(Ok(body)))
    }

    /// Read up to and including `\n`, keeping at most `limit` bytes.
    ///
    /// Returns `None` at end of stream, otherwise the line without its
    /// terminator (`None` if it was over the limit) and its full size.
    async fn read_line_bounded(
        &mut self,
        limit: usize,
    ) -> io::Result<Option<(Option<Vec<u8>>, usize)>> {
        let mut line = Vec::new();
        let mut size = 0usize;
        let mut oversized = false;

        loop {
            let available = self.reader.fill_buf().await?;
            if available.is_empty() {
                if size == 0 {
                    return Ok(None);
                }
                break;
            }

            let (chunk, used, done) = match available.iter().position(|b| *b == b'\n') {
                Some(pos) => (&available[..pos], pos + 1, true),
                None => (available, available.len(), false),
            };
            size += chunk.len();
            if !oversized {
                if line.len() + chunk.len() > limit {
                    oversized = true;
                    line = Vec::new();
                } else {
                    line.extend_from_slice(chunk);
                }
            }
            self.reader.consume(used);
            if done {
                break;
            }
        }

        if oversized {
            return Ok(Some((None, size)));
        }
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Ok(Some((Some(line), size)))
    }

    async fn discard(&mut self, mut remaining: usize) -> io::Result<()> {
        while remaining > 0 {
            let available = self.reader.fill_buf().await?;
            if available.is_empty() {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "stream ended inside frame body",
                ));
            }
            let n = available.len().min(remaining);
            self.reader.consume(n);
            remaining -= n;
        }
        Ok(())
    }
}

pub struct FrameWriter<W> {
    writer: W,
    framing: Framing,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W, framing: Framing) -> Self {
        Self { writer, framing }
    }

    pub async fn write_frame(&mut self, body: &[u8]) -> io::Result<()> {
        match self.framing {
            Framing::Line => {
                self.writer.write_all(body).await?;
                self.writer.write_all(b"\n").await?;
            }
            Framing::ContentLength => {
                let header = format!("Content-Length: {}\r\n\r\n", body.len());
                self.writer.write_all(header.as_bytes()).await?;
                self.writer.write_all(body).await?;
            }
        }
        self.writer.flush().await
    }

    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.writer.shutdown().await
    }
}
