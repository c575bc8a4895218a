use anyhow::{Context, Result};
use notify::event::{AccessKind, AccessMode, ModifyKind};
use notify::{
    Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher,
};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, error, info, warn};

/// Bounded so a burst of writes cannot grow memory; a full channel already guarantees a drain.
pub const WATCHER_CHANNEL_CAPACITY: usize = 64;

/// Tells the pipeline that the watched file has new bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteSignal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EventClass {
    Write,
    Detached,
    Ignored,
}

/// Subscription to change notifications for one file. Dropping it closes the signal channel.
pub struct FileWatcher {
    path: PathBuf,
    _watcher: RecommendedWatcher,
}

impl FileWatcher {
    pub fn start(
        path: impl AsRef<Path>,
        poll_interval: Duration,
        event_tx: mpsc::Sender<WriteSignal>,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => handle_event(&event_tx, event),
                Err(err) => error!(error = %err, "file watcher error"),
            },
            NotifyConfig::default().with_poll_interval(poll_interval),
        )
        .context("failed to create notify watcher")?;

        watcher
            .watch(&path, RecursiveMode::NonRecursive)
            .with_context(|| format!("failed to watch path {}", path.display()))?;

        info!(path = %path.display(), "file watcher started");

        Ok(Self {
            path,
            _watcher: watcher,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

pub(crate) fn classify(kind: &EventKind) -> EventClass {
    match kind {
        EventKind::Modify(ModifyKind::Data(_))
        | EventKind::Modify(ModifyKind::Any)
        | EventKind::Modify(ModifyKind::Other)
        | EventKind::Access(AccessKind::Close(AccessMode::Write)) => EventClass::Write,
        EventKind::Modify(ModifyKind::Name(_)) | EventKind::Remove(_) => EventClass::Detached,
        _ => EventClass::Ignored,
    }
}

fn handle_event(event_tx: &mpsc::Sender<WriteSignal>, event: Event) {
    match classify(&event.kind) {
        EventClass::Write => send_signal(event_tx),
        EventClass::Detached => {
            warn!(
                kind = ?event.kind,
                paths = ?event.paths,
                "watched file moved or removed; continuing on open handle"
            );
        }
        EventClass::Ignored => {
            debug!(kind = ?event.kind, "ignoring non-write file event");
        }
    }
}

fn send_signal(event_tx: &mpsc::Sender<WriteSignal>) {
    match event_tx.try_send(WriteSignal) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) => {
            debug!("drain already pending; coalescing write event");
        }
        Err(TrySendError::Closed(_)) => {
            warn!("pipeline channel closed; dropping write event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, DataChange, MetadataKind, RemoveKind, RenameMode};
    use std::io::Write;

    #[test]
    fn classify_write_events() {
        assert_eq!(
            classify(&EventKind::Modify(ModifyKind::Data(DataChange::Any))),
            EventClass::Write
        );
        assert_eq!(
            classify(&EventKind::Modify(ModifyKind::Any)),
            EventClass::Write
        );
        assert_eq!(
            classify(&EventKind::Access(AccessKind::Close(AccessMode::Write))),
            EventClass::Write
        );
    }

    #[test]
    fn classify_ignores_metadata_and_reads() {
        assert_eq!(
            classify(&EventKind::Modify(ModifyKind::Metadata(MetadataKind::Any))),
            EventClass::Ignored
        );
        assert_eq!(
            classify(&EventKind::Access(AccessKind::Close(AccessMode::Read))),
            EventClass::Ignored
        );
        assert_eq!(
            classify(&EventKind::Create(CreateKind::File)),
            EventClass::Ignored
        );
    }

    #[test]
    fn classify_detached_events() {
        assert_eq!(
            classify(&EventKind::Modify(ModifyKind::Name(RenameMode::From))),
            EventClass::Detached
        );
        assert_eq!(
            classify(&EventKind::Remove(RemoveKind::File)),
            EventClass::Detached
        );
    }

    #[test]
    fn full_channel_drops_signal_without_blocking() {
        let (tx, mut rx) = mpsc::channel(1);
        send_signal(&tx);
        send_signal(&tx);
        assert_eq!(rx.try_recv(), Ok(WriteSignal));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn missing_path_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = mpsc::channel(1);
        let result = FileWatcher::start(
            dir.path().join("absent.log"),
            Duration::from_millis(50),
            tx,
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn append_produces_write_signal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("access.log");
        std::fs::write(&path, "").unwrap();

        let (tx, mut rx) = mpsc::channel(WATCHER_CHANNEL_CAPACITY);
        let watcher = FileWatcher::start(&path, Duration::from_millis(50), tx).unwrap();
        assert_eq!(watcher.path(), path.as_path());

        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .unwrap();
        writeln!(file, "hello").unwrap();
        file.flush().unwrap();

        let signal = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("write event within timeout");
        assert_eq!(signal, Some(WriteSignal));
    }

    #[tokio::test]
    async fn dropping_watcher_closes_channel() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("access.log");
        std::fs::write(&path, "").unwrap();

        let (tx, mut rx) = mpsc::channel(WATCHER_CHANNEL_CAPACITY);
        let watcher = FileWatcher::start(&path, Duration::from_millis(50), tx).unwrap();
        drop(watcher);

        let closed = tokio::time::timeout(Duration::from_secs(5), async {
            while rx.recv().await.is_some() {}
        })
        .await;
        assert!(closed.is_ok(), "channel should close once the watcher is gone");
    }
}
