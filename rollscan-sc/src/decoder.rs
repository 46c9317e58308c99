//! Decoder adapter
//!
//! Wraps an external code reader (camera decoder, keyboard-wedge scanner,
//! text stream) and turns its frames into a single-consumer channel of
//! [`DecoderEvent`]s.
//!
//! Acquisition is scoped: [`ScannerHandle::start`] acquires the reader and
//! fails if it cannot; the reader task always calls `release()` on the way
//! out, whether the input ended, the consumer went away, or the handle was
//! shut down / dropped.

use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, Lines};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default detection channel depth
pub const DEFAULT_CHANNEL_CAPACITY: usize = 16;

/// Event delivered to the scan session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecoderEvent {
    /// Raw decoded text, untrusted
    Detected(String),
    /// Nothing decoded this frame; expected, never an error
    NoDetection,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CameraError {
    #[error("Could not acquire code reader: {0}")]
    Unavailable(String),
}

/// One read from a code reader
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Decoded(String),
    Nothing,
    /// Source is gone; no more frames will follow
    Closed,
}

/// External code-reading capability
#[async_trait]
pub trait CodeReader: Send + 'static {
    fn name(&self) -> &str;

    /// Acquire the device; failure is fatal to the scanning view
    async fn acquire(&mut self) -> Result<(), CameraError>;

    async fn next_frame(&mut self) -> Frame;

    /// Release the device; must be safe to call after a partial acquire
    async fn release(&mut self);
}

type BoxedInput = Box<dyn AsyncRead + Send + Unpin>;

enum LineSource {
    Stdin,
    File(PathBuf),
    Reader(BoxedInput),
}

/// Reads one decoded code per line
///
/// Keyboard-wedge scanners type the code followed by Enter, so stdin works
/// as a device. Blank lines count as "no detection".
pub struct LineReader {
    label: String,
    source: Option<LineSource>,
    lines: Option<Lines<BufReader<BoxedInput>>>,
}

impl LineReader {
    pub fn stdin() -> Self {
        Self::with_source("stdin", LineSource::Stdin)
    }

    pub fn file(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self::with_source(&path.display().to_string(), LineSource::File(path))
    }

    pub fn from_reader(label: &str, reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        Self::with_source(label, LineSource::Reader(Box::new(reader)))
    }

    fn with_source(label: &str, source: LineSource) -> Self {
        Self {
            label: label.to_string(),
            source: Some(source),
            lines: None,
        }
    }
}

#[async_trait]
impl CodeReader for LineReader {
    fn name(&self) -> &str {
        &self.label
    }

    async fn acquire(&mut self) -> Result<(), CameraError> {
        let source = self
            .source
            .take()
            .ok_or_else(|| CameraError::Unavailable(format!("{} already acquired", self.label)))?;

        let input: BoxedInput = match source {
            LineSource::Stdin => Box::new(tokio::io::stdin()),
            LineSource::File(path) => {
                let file = tokio::fs::File::open(&path).await.map_err(|e| {
                    CameraError::Unavailable(format!("{}: {}", path.display(), e))
                })?;
                Box::new(file)
            }
            LineSource::Reader(reader) => reader,
        };

        self.lines = Some(BufReader::new(input).lines());
        Ok(())
    }

    async fn next_frame(&mut self) -> Frame {
        let Some(lines) = self.lines.as_mut() else {
            return Frame::Closed;
        };

        match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => Frame::Nothing,
            Ok(Some(line)) => Frame::Decoded(line),
            Ok(None) => Frame::Closed,
            Err(e) => {
                warn!(reader = %self.label, "Read failed, closing reader: {}", e);
                Frame::Closed
            }
        }
    }

    async fn release(&mut self) {
        self.lines = None;
    }
}

/// Live subscription to a code reader
///
/// Dropping the handle cancels the reader task, which then releases the
/// reader. Use [`ScannerHandle::shutdown`] to wait for the release.
pub struct ScannerHandle {
    events: mpsc::Receiver<DecoderEvent>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ScannerHandle {
    /// Acquire `reader` and start pumping its frames into the channel
    pub async fn start<R: CodeReader>(mut reader: R, capacity: usize) -> Result<Self, CameraError> {
        if let Err(e) = reader.acquire().await {
            reader.release().await;
            return Err(e);
        }
        info!(reader = reader.name(), "Code reader acquired");

        let (tx, events) = mpsc::channel(capacity.max(1));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(pump(reader, tx, cancel.clone()));

        Ok(Self {
            events,
            cancel,
            task: Some(task),
        })
    }

    /// Next event; None once the reader has closed and the channel drained
    pub async fn next_event(&mut self) -> Option<DecoderEvent> {
        self.events.recv().await
    }

    /// Cancel the reader and wait until it has been released
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Code reader task ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for ScannerHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn pump<R: CodeReader>(
    mut reader: R,
    tx: mpsc::Sender<DecoderEvent>,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = reader.next_frame() => frame,
        };

        let event = match frame {
            Frame::Decoded(text) => DecoderEvent::Detected(text),
            Frame::Nothing => DecoderEvent::NoDetection,
            Frame::Closed => {
                debug!(reader = reader.name(), "Code reader closed");
                break;
            }
        };

        // Bounded channel: the reader waits while a scan is being processed
        tokio::select! {
            _ = cancel.cancelled() => break,
            sent = tx.send(event) => {
                if sent.is_err() {
                    break;
                }
            }
        }
    }

    reader.release().await;
    info!(reader = reader.name(), "Code reader released");
}
