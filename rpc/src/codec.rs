//! JSON-RPC framing codec.
//!
//! Frames are `Content-Length: N\r\n` (plus an optional `Content-Type`
//! header) followed by an empty line and N bytes of JSON. This module
//! provides [`FrameReader`] and [`FrameWriter`] for async reading and
//! writing of framed messages.
//!
//! Failure semantics: a malformed header block or a malformed JSON body
//! poisons only that frame — the reader reports a recoverable
//! [`FrameError`] and the caller resumes on the next header block. Only IO
//! errors tear the connection down.

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// Frames larger than this are rejected before the body is allocated.
const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

const CONTENT_TYPE: &str = "application/vscode-jsonrpc; charset=utf-8";

/// Errors surfaced by [`FrameReader::read_frame`].
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// Header block could not be parsed; the block was consumed.
    #[error("malformed frame header: {0}")]
    MalformedHeader(String),
    /// `Content-Length: 0` — no body to read.
    #[error("zero-length frame body")]
    EmptyBody,
    /// Body exceeded the frame limit; the body was consumed and discarded.
    #[error("frame body of {0} bytes exceeds maximum {MAX_FRAME_BYTES}")]
    BodyTooLarge(usize),
    /// Body was not valid JSON; the body was consumed.
    #[error("invalid JSON body: {0}")]
    InvalidBody(#[source] serde_json::Error),
    /// The underlying stream failed or ended mid-frame.
    #[error("frame IO error: {0}")]
    Io(#[source] std::io::Error),
}

impl FrameError {
    /// Whether the connection is still usable after this error.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Io(_))
    }
}

/// Reads JSON-RPC frames from an async reader.
pub struct FrameReader<R> {
    reader: BufReader<R>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
        }
    }

    /// Read the next JSON-RPC frame.
    ///
    /// Returns `Ok(None)` on clean EOF. Recoverable [`FrameError`]s leave
    /// the reader positioned at the next header block.
    pub async fn read_frame(&mut self) -> Result<Option<serde_json::Value>, FrameError> {
        let content_length = match self.read_headers().await? {
            Some(len) => len,
            None => return Ok(None), // EOF
        };

        if content_length == 0 {
            return Err(FrameError::EmptyBody);
        }

        if content_length > MAX_FRAME_BYTES {
            // Drain the oversized body so the stream stays framed.
            let mut remaining = content_length;
            let mut sink = [0u8; 8192];
            while remaining > 0 {
                let take = remaining.min(sink.len());
                self.reader
                    .read_exact(&mut sink[..take])
                    .await
                    .map_err(FrameError::Io)?;
                remaining -= take;
            }
            return Err(FrameError::BodyTooLarge(content_length));
        }

        let mut body = vec![0u8; content_length];
        self.reader
            .read_exact(&mut body)
            .await
            .map_err(FrameError::Io)?;

        match serde_json::from_slice(&body) {
            Ok(value) => Ok(Some(value)),
            Err(e) => Err(FrameError::InvalidBody(e)),
        }
    }

    /// Parse headers until the empty line separator.
    ///
    /// Returns the `Content-Length` value, or `None` on EOF before any
    /// header byte.
    async fn read_headers(&mut self) -> Result<Option<usize>, FrameError> {
        let mut content_length: Option<usize> = None;
        let mut line = String::new();
        let mut saw_any_header_bytes = false;

        loop {
            line.clear();
            let bytes_read = self
                .reader
                .read_line(&mut line)
                .await
                .map_err(FrameError::Io)?;

            if bytes_read == 0 {
                // EOF — clean only if no header bytes were consumed.
                if !saw_any_header_bytes {
                    return Ok(None);
                }
                return Err(FrameError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "EOF while reading frame headers",
                )));
            }
            saw_any_header_bytes = true;

            let trimmed = line.trim();
            if trimmed.is_empty() {
                // Empty line = end of headers
                break;
            }

            // Parse case-insensitively for robustness; ignore Content-Type
            // and any other headers.
            if let Some(colon_pos) = trimmed.find(':') {
                let key = &trimmed[..colon_pos];
                if key.eq_ignore_ascii_case("Content-Length") {
                    match trimmed[colon_pos + 1..].trim().parse() {
                        Ok(len) => content_length = Some(len),
                        Err(_) => {
                            self.drain_header_block().await?;
                            return Err(FrameError::MalformedHeader(format!(
                                "invalid Content-Length value in {trimmed:?}"
                            )));
                        }
                    }
                }
            }
        }

        match content_length {
            Some(len) => Ok(Some(len)),
            None => Err(FrameError::MalformedHeader(
                "missing Content-Length header".to_string(),
            )),
        }
    }

    /// Consume the rest of a header block after a parse failure so the next
    /// read starts at the following frame.
    async fn drain_header_block(&mut self) -> Result<(), FrameError> {
        let mut line = String::new();
        loop {
            line.clear();
            let bytes_read = self
                .reader
                .read_line(&mut line)
                .await
                .map_err(FrameError::Io)?;
            if bytes_read == 0 || line.trim().is_empty() {
                return Ok(());
            }
        }
    }
}

/// Writes JSON-RPC frames to an async writer.
pub struct FrameWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Write a JSON-RPC frame with `Content-Length` and `Content-Type`
    /// headers.
    pub async fn write_frame(&mut self, msg: &serde_json::Value) -> std::io::Result<()> {
        let body = serde_json::to_string(msg)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let header = format!(
            "Content-Length: {}\r\nContent-Type: {CONTENT_TYPE}\r\n\r\n",
            body.len()
        );

        self.writer.write_all(header.as_bytes()).await?;
        self.writer.write_all(body.as_bytes()).await?;
        self.writer.flush().await?;

        Ok(())
    }
}
