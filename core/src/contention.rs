//! Lock file contention watch.
//!
//! While an instance holds its lock, another actor opening or deleting the
//! lock file is the signal to give up ownership. The watch observes the
//! first such event (or a watch failure), logs it, fires a [`DoneSignal`]
//! and stops.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use notify::event::ModifyKind;
use notify::{Event, EventKind, RecursiveMode, Watcher};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::error::Result;

/// One-shot completion signal.
///
/// Any number of clones may wait on it. Only the first [`fire`](Self::fire)
/// has an effect; the signal is never reset and never delivered twice.
#[derive(Clone)]
pub struct DoneSignal {
    inner: Arc<DoneInner>,
}

struct DoneInner {
    fired: AtomicBool,
    tx: watch::Sender<bool>,
}

impl DoneSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            inner: Arc::new(DoneInner {
                fired: AtomicBool::new(false),
                tx,
            }),
        }
    }

    /// Fire the signal. Returns `true` only for the call that fired it.
    pub fn fire(&self) -> bool {
        if self
            .inner
            .fired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.inner.tx.send_replace(true);
        true
    }

    /// Whether the signal has fired.
    pub fn is_fired(&self) -> bool {
        self.inner.fired.load(Ordering::Acquire)
    }

    /// Wait until the signal fires. Returns immediately if it already has.
    pub async fn wait(&self) {
        let mut rx = self.inner.tx.subscribe();
        // The sender lives in `inner`, so the channel cannot close under us.
        let _ = rx.wait_for(|fired| *fired).await;
    }
}

impl Default for DoneSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for DoneSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DoneSignal")
            .field("fired", &self.is_fired())
            .finish()
    }
}

/// What ended the contention watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentionEvent {
    /// Another actor opened the lock file.
    Opened,
    /// The lock file was deleted or moved away.
    Removed,
    /// The watch backend reported an error.
    WatchFailed(String),
}

impl fmt::Display for ContentionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Opened => write!(f, "lock file opened"),
            Self::Removed => write!(f, "lock file removed"),
            Self::WatchFailed(e) => write!(f, "watch failed: {}", e),
        }
    }
}

/// A running contention watch. Dropping it stops the watch without firing.
#[derive(Debug)]
pub struct ContentionWatch {
    path: PathBuf,
    task: Option<JoinHandle<ContentionEvent>>,
}

impl ContentionWatch {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Wait for the watch to end and return the event that ended it.
    /// `None` if the observer task was cancelled.
    pub async fn finished(mut self) -> Option<ContentionEvent> {
        let task = self.task.take()?;
        task.await.ok()
    }
}

impl Drop for ContentionWatch {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Watch `path` for contention and fire `done` on the first event.
///
/// Must be called from within a tokio runtime. Setup failures (missing
/// path, inotify limits) are returned; failures after setup end the watch
/// as [`ContentionEvent::WatchFailed`] and fire `done` like any other event.
pub fn watch_for_contention(path: impl AsRef<Path>, done: DoneSignal) -> Result<ContentionWatch> {
    let path = path.as_ref().to_path_buf();
    let (tx, mut rx) = mpsc::unbounded_channel();

    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
        // Receiver gone means the watch already ended.
        let _ = tx.send(res);
    })?;
    watcher.watch(&path, RecursiveMode::NonRecursive)?;

    tracing::info!(path = %path.display(), "Watching lock file for contention");

    let watched = path.clone();
    let task = tokio::spawn(async move {
        // Dropped at the end of the task, which removes the inotify watch.
        let _watcher = watcher;

        let event = loop {
            match rx.recv().await {
                Some(Ok(ev)) => {
                    if let Some(event) = classify(&ev, &watched) {
                        break event;
                    }
                    tracing::trace!(kind = ?ev.kind, "Ignoring lock file event");
                }
                Some(Err(e)) => break ContentionEvent::WatchFailed(e.to_string()),
                None => break ContentionEvent::WatchFailed("event channel closed".to_string()),
            }
        };

        match &event {
            ContentionEvent::WatchFailed(e) => {
                tracing::error!(path = %watched.display(), error = %e, "Lock file watch failed")
            }
            other => {
                tracing::warn!(path = %watched.display(), event = %other, "Lock file contention")
            }
        }
        done.fire();
        event
    });

    Ok(ContentionWatch {
        path,
        task: Some(task),
    })
}

/// Map a raw notification onto a contention event, if it is one.
fn classify(event: &Event, path: &Path) -> Option<ContentionEvent> {
    match &event.kind {
        EventKind::Access(_) => Some(ContentionEvent::Opened),
        EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(_)) => {
            Some(ContentionEvent::Removed)
        }
        // An unlink while we hold the fd shows up as a link-count change.
        EventKind::Modify(ModifyKind::Metadata(_)) if !path.exists() => {
            Some(ContentionEvent::Removed)
        }
        _ => None,
    }
}
