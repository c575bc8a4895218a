//! Incremental reader for a single growing file.
//!
//! A [`TailCursor`] keeps the file open and remembers how far it has read. Each call to
//! [`TailCursor::drain_lines`] yields only the complete lines appended since the previous call;
//! a trailing fragment without `\n` stays buffered until the rest of the line is written.

use anyhow::{Context, Result};
use std::collections::VecDeque;
use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const MAX_READ_CHUNK_BYTES: usize = 64 * 1024;

/// Where a freshly opened cursor starts reading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StartPosition {
    /// Process everything already in the file.
    #[default]
    Beginning,
    /// Skip existing content and only follow new writes. If the file does not end with `\n`,
    /// the rest of that half-written line is discarded too.
    End,
}

pub struct TailCursor {
    path: PathBuf,
    file: File,
    /// Bytes read from the current file handle.
    read_offset: u64,
    /// Trailing bytes after the last `\n`.
    pending: Vec<u8>,
    /// Complete lines read from disk but not yet handed out.
    ready: VecDeque<Vec<u8>>,
    ready_bytes: u64,
    /// Set when reading started mid-line; the first completed line is dropped.
    skip_partial: bool,
    chunk: Vec<u8>,
}

impl TailCursor {
    pub fn open(path: impl AsRef<Path>, start: StartPosition) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file =
            File::open(&path).with_context(|| format!("failed to open {}", path.display()))?;

        let (read_offset, skip_partial) = match start {
            StartPosition::Beginning => (0, false),
            StartPosition::End => {
                let end = file
                    .seek(SeekFrom::End(0))
                    .with_context(|| format!("failed to seek {} to end", path.display()))?;
                let mid_line = end > 0
                    && !ends_with_newline(&mut file, end)
                        .with_context(|| format!("failed to read {}", path.display()))?;
                (end, mid_line)
            }
        };

        info!(
            path = %path.display(),
            offset = read_offset,
            skip_partial,
            "opened tail cursor"
        );

        Ok(Self {
            path,
            file,
            read_offset,
            pending: Vec::new(),
            ready: VecDeque::new(),
            ready_bytes: 0,
            skip_partial,
            chunk: vec![0u8; MAX_READ_CHUNK_BYTES],
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Byte offset just past the last line handed out by [`TailCursor::drain_lines`].
    pub fn consumed_offset(&self) -> u64 {
        self.read_offset
            .saturating_sub(self.pending.len() as u64)
            .saturating_sub(self.ready_bytes)
    }

    /// Bytes of an incomplete trailing line held in memory.
    pub fn backlog_len(&self) -> usize {
        self.pending.len()
    }

    /// Yields every complete line currently available, in file order.
    ///
    /// The iterator ends at end-of-file. Dropping it early is safe: lines already read stay
    /// queued for the next call.
    pub fn drain_lines(&mut self) -> Drain<'_> {
        Drain {
            cursor: self,
            checked_truncation: false,
            exhausted: false,
        }
    }

    /// Re-opens the path and starts over from its first byte.
    ///
    /// Buffered fragments belong to the old file and are discarded; complete lines already read
    /// are still delivered.
    pub fn reopen(&mut self) -> Result<()> {
        self.file = File::open(&self.path)
            .with_context(|| format!("failed to reopen {}", self.path.display()))?;
        self.read_offset = 0;
        self.pending.clear();
        self.skip_partial = false;
        info!(path = %self.path.display(), "reopened tail cursor");
        Ok(())
    }

    fn reopen_if_truncated(&mut self) -> io::Result<()> {
        let current_size = match fs::metadata(&self.path) {
            Ok(meta) => meta.len(),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(
                    path = %self.path.display(),
                    "path missing; continuing on open handle"
                );
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        if current_size < self.read_offset {
            warn!(
                path = %self.path.display(),
                previous_offset = self.read_offset,
                current_size,
                "file truncated or rotated; reopening from start"
            );
            self.reopen().map_err(io::Error::other)?;
        }
        Ok(())
    }

    /// Reads one chunk and splits off any completed lines. Returns the number of bytes read.
    fn fill(&mut self) -> io::Result<usize> {
        let bytes_read = loop {
            match self.file.read(&mut self.chunk) {
                Ok(n) => break n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        };
        if bytes_read == 0 {
            return Ok(0);
        }

        self.read_offset += bytes_read as u64;
        let scan_from = self.pending.len();
        self.pending.extend_from_slice(&self.chunk[..bytes_read]);

        for line in drain_complete_lines(&mut self.pending, scan_from) {
            if self.skip_partial {
                self.skip_partial = false;
                debug!(bytes = line.len(), "dropping tail of line split by start position");
                continue;
            }
            self.ready_bytes += line.len() as u64 + 1;
            self.ready.push_back(line);
        }

        Ok(bytes_read)
    }

    fn pop_ready(&mut self) -> Option<String> {
        let raw = self.ready.pop_front()?;
        self.ready_bytes -= raw.len() as u64 + 1;
        Some(String::from_utf8_lossy(&raw).trim_end().to_string())
    }
}

/// Lazy sequence of lines returned by [`TailCursor::drain_lines`].
pub struct Drain<'a> {
    cursor: &'a mut TailCursor,
    checked_truncation: bool,
    exhausted: bool,
}

impl Iterator for Drain<'_> {
    type Item = io::Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(line) = self.cursor.pop_ready() {
                return Some(Ok(line));
            }
            if self.exhausted {
                return None;
            }
            if !self.checked_truncation {
                self.checked_truncation = true;
                if let Err(err) = self.cursor.reopen_if_truncated() {
                    self.exhausted = true;
                    return Some(Err(err));
                }
            }
            match self.cursor.fill() {
                Ok(0) => self.exhausted = true,
                Ok(_) => {}
                Err(err) => {
                    self.exhausted = true;
                    return Some(Err(err));
                }
            }
        }
    }
}

fn ends_with_newline(file: &mut File, len: u64) -> io::Result<bool> {
    let mut last = [0u8; 1];
    file.seek(SeekFrom::Start(len - 1))?;
    file.read_exact(&mut last)?;
    Ok(last[0] == b'\n')
}

/// Removes every `\n`-terminated line from the front of `buffer`, leaving any trailing fragment.
///
/// `buffer[..scan_from]` must hold no `\n`; only the bytes after it are searched.
pub(crate) fn drain_complete_lines(buffer: &mut Vec<u8>, scan_from: usize) -> Vec<Vec<u8>> {
    let mut lines = Vec::new();
    let mut start = 0usize;

    for idx in scan_from.min(buffer.len())..buffer.len() {
        if buffer[idx] == b'\n' {
            lines.push(buffer[start..idx].to_vec());
            start = idx + 1;
        }
    }

    if start > 0 {
        buffer.drain(0..start);
    }

    lines
}
