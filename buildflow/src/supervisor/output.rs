//! Stage output capture: a bounded in-memory tail plus an optional log file.

use crate::core::OutputHandle;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

/// The last `capacity` lines of a stream.
#[derive(Debug, Clone)]
pub struct LogTail {
    lines: VecDeque<String>,
    capacity: usize,
    total: u64,
}

impl LogTail {
    /// Creates a tail keeping at most `capacity` lines.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity.min(256)),
            capacity: capacity.max(1),
            total: 0,
        }
    }

    /// Appends a line, evicting the oldest when full.
    pub fn push(&mut self, line: String) {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
        self.total += 1;
    }

    /// Returns the number of lines ever pushed.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Joins the retained lines.
    #[must_use]
    pub fn excerpt(&self) -> String {
        self.lines.iter().map(String::as_str).collect::<Vec<_>>().join("\n")
    }
}

/// Pass-through consumer of a stage's merged output.
///
/// Runs as its own task so slow disk writes never stall prompt detection.
pub(crate) struct OutputWriter {
    sender: mpsc::UnboundedSender<String>,
    task: JoinHandle<OutputHandle>,
}

impl OutputWriter {
    /// Starts the writer task.
    pub(crate) fn spawn(excerpt_lines: usize, log_path: Option<PathBuf>) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<String>();
        let task = tokio::spawn(async move {
            let mut tail = LogTail::new(excerpt_lines);
            let mut file = match &log_path {
                Some(path) => open_log(path).await,
                None => None,
            };

            while let Some(line) = receiver.recv().await {
                if let Some(writer) = file.as_mut() {
                    let written = async {
                        writer.write_all(line.as_bytes()).await?;
                        writer.write_all(b"\n").await
                    }
                    .await;
                    if let Err(e) = written {
                        warn!(error = %e, "Stage log write failed; continuing in memory only");
                        file = None;
                    }
                }
                tail.push(line);
            }

            if let Some(mut writer) = file {
                if let Err(e) = writer.flush().await {
                    warn!(error = %e, "Stage log flush failed");
                }
            }

            let handle = OutputHandle::new(tail.excerpt(), tail.total());
            match log_path {
                Some(path) => handle.with_log_path(path),
                None => handle,
            }
        });
        Self { sender, task }
    }

    /// Queues a line.
    pub(crate) fn write(&self, line: String) {
        // The task only exits after the sender is dropped.
        let _ = self.sender.send(line);
    }

    /// Closes the stream and returns the output handle.
    pub(crate) async fn finish(self) -> OutputHandle {
        drop(self.sender);
        self.task.await.unwrap_or_default()
    }
}

async fn open_log(path: &Path) -> Option<BufWriter<File>> {
    if let Some(parent) = path.parent() {
        if let Err(e) = tokio::fs::create_dir_all(parent).await {
            warn!(path = %path.display(), error = %e, "Could not create log directory");
            return None;
        }
    }
    match File::create(path).await {
        Ok(file) => Some(BufWriter::new(file)),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Could not open stage log");
            None
        }
    }
}

/// Longest unterminated line held before it is flushed as a line of its own.
pub(crate) const MAX_PENDING: usize = 64 * 1024;

/// Bytes at the end of an unterminated line that are checked for prompts.
pub(crate) const PROMPT_WINDOW: usize = 512;

/// Splits a byte stream into lines, keeping the unterminated remainder.
///
/// The remainder never grows past [`MAX_PENDING`], so a stage printing one
/// endless line (or `\r` progress bars) costs linear time.
#[derive(Debug, Default)]
pub(crate) struct LineAssembler {
    pending: Vec<u8>,
}

impl LineAssembler {
    /// Feeds a chunk and returns the complete lines it finished.
    pub(crate) fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        // Bytes already held were searched by earlier calls.
        let mut from = self.pending.len();
        self.pending.extend_from_slice(chunk);

        let mut lines = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.pending[from..].iter().position(|&b| b == b'\n') {
            let end = from + offset;
            lines.push(decode_line(&self.pending[start..end]));
            start = end + 1;
            from = start;
        }
        while self.pending.len() - start > MAX_PENDING {
            lines.push(decode_line(&self.pending[start..start + MAX_PENDING]));
            start += MAX_PENDING;
        }
        self.pending.drain(..start);
        lines
    }

    /// Returns the end of the unterminated remainder that a prompt could be:
    /// at most [`PROMPT_WINDOW`] bytes, starting after the last `\r`.
    pub(crate) fn prompt_tail(&self) -> Option<String> {
        let window = &self.pending[self.pending.len().saturating_sub(PROMPT_WINDOW)..];
        let tail = window
            .iter()
            .rposition(|&b| b == b'\r')
            .map_or(window, |i| &window[i + 1..]);
        if tail.is_empty() {
            None
        } else {
            Some(String::from_utf8_lossy(tail).into_owned())
        }
    }

    /// Takes the remainder as a final line.
    pub(crate) fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let line = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        Some(line)
    }
}

fn decode_line(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tail_is_bounded() {
        let mut tail = LogTail::new(2);
        for line in ["one", "two", "three"] {
            tail.push(line.to_string());
        }
        assert_eq!(tail.excerpt(), "two\nthree");
        assert_eq!(tail.total(), 3);
    }

    #[test]
    fn test_assembler_splits_lines() {
        let mut assembler = LineAssembler::default();
        assert_eq!(assembler.push(b"a\r\nb"), vec!["a"]);
        assert_eq!(assembler.prompt_tail().as_deref(), Some("b"));
        assert_eq!(assembler.push(b"c\n\n"), vec!["bc", ""]);
        assert!(assembler.prompt_tail().is_none());
        assert_eq!(assembler.push(b"Password: "), Vec::<String>::new());
        assert_eq!(assembler.finish().as_deref(), Some("Password: "));
        assert!(assembler.finish().is_none());
    }

    #[test]
    fn test_assembler_flushes_endless_line() {
        let mut assembler = LineAssembler::default();
        let mut flushed = Vec::new();
        for _ in 0..40 {
            flushed.extend(assembler.push(&[b'a'; 4096]));
        }

        assert_eq!(flushed.len(), 2);
        assert!(flushed.iter().all(|line| line.len() == MAX_PENDING));
        let rest = assembler.finish().unwrap();
        assert_eq!(rest.len(), 40 * 4096 - 2 * MAX_PENDING);
    }

    #[test]
    fn test_prompt_tail_is_bounded() {
        let mut assembler = LineAssembler::default();
        assembler.push(&[b'x'; 10_000]);
        assert_eq!(assembler.prompt_tail().unwrap().len(), PROMPT_WINDOW);

        assembler.push(b" 42%\r 97%\r");
        assert!(assembler.prompt_tail().is_none());

        assembler.push(b"[sudo] password for lfs: ");
        assert_eq!(
            assembler.prompt_tail().as_deref(),
            Some("[sudo] password for lfs: ")
        );
    }

    #[tokio::test]
    async fn test_writer_persists_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lfs-1").join("stage.log");

        let writer = OutputWriter::spawn(1, Some(path.clone()));
        writer.write("first".to_string());
        writer.write("second".to_string());
        let handle = writer.finish().await;

        assert_eq!(handle.excerpt, "second");
        assert_eq!(handle.line_count, 2);
        assert_eq!(handle.log_path.as_deref(), Some(path.as_path()));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "first\nsecond\n");
    }
}
