//! Process output capture.
//!
//! Each supervised process gets one [`OutputLog`]: a bounded ring of the most
//! recent lines from stdout and stderr, kept for diagnostics when a service
//! fails to come up. When file logging is enabled the lines are also appended
//! to `<name>.out` / `<name>.err` in the cluster log directory.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::fs::OpenOptions;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::task::JoinHandle;

/// Default number of lines retained per process.
pub const DEFAULT_CAPACITY: usize = 500;

/// Longest line kept as one entry; longer runs are split.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// Which stream a captured line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    fn extension(self) -> &'static str {
        match self {
            Self::Stdout => "out",
            Self::Stderr => "err",
        }
    }
}

/// Bounded, shared ring buffer of captured lines.
#[derive(Debug, Clone)]
pub struct OutputLog {
    lines: Arc<Mutex<VecDeque<String>>>,
    capacity: usize,
    log_files: Option<(PathBuf, String)>,
}

impl OutputLog {
    /// Creates an in-memory log retaining at most `capacity` lines.
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: Arc::new(Mutex::new(VecDeque::with_capacity(capacity.min(1024)))),
            capacity: capacity.max(1),
            log_files: None,
        }
    }

    /// Also append captured lines to `<dir>/<name>.out` and `<dir>/<name>.err`.
    pub fn with_files(mut self, dir: &Path, name: &str) -> Self {
        self.log_files = Some((dir.to_path_buf(), name.to_string()));
        self
    }

    /// Path of the file a stream is mirrored into, if file logging is on.
    pub fn file_for(&self, stream: Stream) -> Option<PathBuf> {
        self.log_files
            .as_ref()
            .map(|(dir, name)| dir.join(format!("{name}.{}", stream.extension())))
    }

    /// Appends one line, evicting the oldest when full.
    pub fn push(&self, line: String) {
        let mut lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    /// Copy of every retained line, oldest first.
    pub fn snapshot(&self) -> Vec<String> {
        let lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        lines.iter().cloned().collect()
    }

    /// The last `n` retained lines.
    pub fn tail(&self, n: usize) -> Vec<String> {
        let lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        let skip = lines.len().saturating_sub(n);
        lines.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lines.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Spawns a task copying `reader` line by line into this log.
    ///
    /// Bytes that are not UTF-8 are replaced, never fatal: the pipe is
    /// drained until EOF, i.e. until the process exits.
    pub fn capture<R>(&self, reader: R, stream: Stream, service: String) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let log = self.clone();
        let file = self.file_for(stream);

        tokio::spawn(async move {
            let mut sink = match file {
                Some(path) => match OpenOptions::new().create(true).append(true).open(&path).await {
                    Ok(f) => Some(f),
                    Err(e) => {
                        tracing::warn!(%service, path = %path.display(), error = %e, "cannot open log file");
                        None
                    }
                },
                None => None,
            };

            let mut reader = BufReader::new(reader);
            let mut buf = Vec::with_capacity(256);
            loop {
                buf.clear();
                let limit = MAX_LINE_BYTES as u64;
                match (&mut reader).take(limit).read_until(b'\n', &mut buf).await {
                    Ok(0) => break,
                    Ok(_) => {
                        let line = decode_line(&buf);
                        tracing::trace!(target: "minicluster::output", %service, ?stream, "{line}");
                        if let Some(f) = sink.as_mut() {
                            let mut bytes = line.as_bytes().to_vec();
                            bytes.push(b'\n');
                            if f.write_all(&bytes).await.is_err() {
                                sink = None;
                            }
                        }
                        log.push(line);
                    }
                    Err(e) => {
                        tracing::debug!(%service, ?stream, error = %e, "output stream closed");
                        break;
                    }
                }
            }

            if let Some(mut f) = sink {
                let _ = f.flush().await;
            }
        })
    }
}

/// Strips the line terminator and replaces invalid UTF-8.
fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

impl Default for OutputLog {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
