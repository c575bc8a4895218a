//! Drain loop that connects file notifications, the tail cursor, the parser and the sink.
//!
//! The loop is a two-state machine:
//! - `Idle`: blocked waiting for the next write notification.
//! - `Draining`: queued notifications are folded into one pass, then every complete line
//!   currently in the file is parsed and routed before returning to `Idle`.
//!
//! Notifications that arrive while a pass is running stay queued and trigger another pass, so a
//! write is never missed even though several writes may be handled together.

use crate::metrics::{ExporterMetrics, MetricSink};
use crate::parser::{line_preview, AccessLogParser};
use crate::tailer::TailCursor;
use crate::watcher::WriteSignal;
use anyhow::{bail, Result};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const LINE_PREVIEW_CHARS: usize = 256;

/// Per-pass line accounting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainSummary {
    pub lines: u64,
    pub parsed: u64,
    pub unmatched: u64,
    pub rejected: u64,
    pub sink_errors: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Draining,
}

pub struct Pipeline {
    cursor: TailCursor,
    parser: AccessLogParser,
    sink: Arc<dyn MetricSink>,
    metrics: ExporterMetrics,
}

impl Pipeline {
    pub fn new(
        cursor: TailCursor,
        parser: AccessLogParser,
        sink: Arc<dyn MetricSink>,
        metrics: ExporterMetrics,
    ) -> Self {
        Self {
            cursor,
            parser,
            sink,
            metrics,
        }
    }

    /// Consumes every complete line currently available and routes it to the sink.
    pub fn drain(&mut self) -> DrainSummary {
        let Self {
            cursor,
            parser,
            sink,
            metrics,
        } = self;
        let mut summary = DrainSummary::default();

        for line in cursor.drain_lines() {
            let line = match line {
                Ok(line) => line,
                Err(err) => {
                    warn!(
                        error = %err,
                        "failed to read appended bytes; retrying on next write"
                    );
                    break;
                }
            };
            if line.is_empty() {
                continue;
            }
            summary.lines += 1;

            match parser.parse(&line) {
                Ok(Some(record)) => {
                    match sink.observe(&record.uri, record.upstream_response_time) {
                        Ok(()) => summary.parsed += 1,
                        Err(err) => {
                            warn!(
                                error = %err,
                                uri = %record.uri,
                                "failed to record upstream duration"
                            );
                            summary.sink_errors += 1;
                        }
                    }
                }
                Ok(None) => {
                    debug!(
                        line = %line_preview(&line, LINE_PREVIEW_CHARS),
                        "line does not match access log layout; skipping"
                    );
                    summary.unmatched += 1;
                }
                Err(err) => {
                    warn!(
                        error = %err,
                        line = %line_preview(&line, LINE_PREVIEW_CHARS),
                        "rejecting malformed access log line"
                    );
                    summary.rejected += 1;
                }
            }
        }

        metrics.record_drain(&summary, cursor.consumed_offset());
        summary
    }

    /// Runs until the notification channel closes, which is always an error: the watcher is gone
    /// and further writes would go unnoticed.
    ///
    /// Blocks the calling thread; run it via `tokio::task::spawn_blocking`. The first pass happens
    /// immediately so content already in the file is not left waiting for the next write.
    pub fn run(mut self, mut events: mpsc::Receiver<WriteSignal>) -> Result<()> {
        info!(
            path = %self.cursor.path().display(),
            "pipeline started; awaiting file writes"
        );

        let mut state = State::Draining;
        loop {
            state = match state {
                State::Idle => match events.blocking_recv() {
                    Some(WriteSignal) => State::Draining,
                    None => bail!(
                        "file notification channel closed; no longer watching {}",
                        self.cursor.path().display()
                    ),
                },
                State::Draining => {
                    let mut coalesced = 0usize;
                    while events.try_recv().is_ok() {
                        coalesced += 1;
                    }

                    let summary = self.drain();
                    debug!(
                        coalesced,
                        lines = summary.lines,
                        parsed = summary.parsed,
                        unmatched = summary.unmatched,
                        rejected = summary.rejected,
                        sink_errors = summary.sink_errors,
                        offset = self.cursor.consumed_offset(),
                        "drain pass complete"
                    );
                    State::Idle
                }
            };
        }
    }
}
