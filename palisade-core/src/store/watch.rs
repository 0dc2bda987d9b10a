//! Watchers and the bounded event history that serves `since` catch-up.

use std::collections::VecDeque;

use tokio::sync::mpsc;

use crate::error::{PalisadeError, PalisadeResult};

use super::event::Event;

/// How many past events the store retains for watchers that resume from an
/// earlier index.
const EVENT_HISTORY_CAPACITY: usize = 1000;

/// Receiving half of a watch. Single-shot watchers yield one event and then
/// the channel closes; stream watchers keep yielding until dropped.
#[derive(Debug)]
pub struct Watcher {
    rx: mpsc::UnboundedReceiver<Event>,
}

impl Watcher {
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }
}

struct WatcherSlot {
    path: String,
    recursive: bool,
    stream: bool,
    tx: mpsc::UnboundedSender<Event>,
}

impl WatcherSlot {
    fn matches(&self, key: &str) -> bool {
        key_matches(&self.path, self.recursive, key)
    }
}

fn key_matches(path: &str, recursive: bool, key: &str) -> bool {
    if key == path {
        return true;
    }
    if !recursive {
        return false;
    }
    if path == "/" {
        return true;
    }
    key.strip_prefix(path)
        .is_some_and(|rest| rest.starts_with('/'))
}

#[derive(Default)]
pub(crate) struct WatcherHub {
    watchers: Vec<WatcherSlot>,
    history: EventHistory,
}

impl WatcherHub {
    /// Open a watch on `path`. A `since` greater than zero first replays
    /// the earliest retained event at or past that index; if history has
    /// already been compacted past `since`, the watch fails so the caller
    /// knows it may have missed events.
    pub fn watch(
        &mut self,
        path: &str,
        recursive: bool,
        stream: bool,
        since: u64,
    ) -> PalisadeResult<Watcher> {
        let (tx, rx) = mpsc::unbounded_channel();

        if since > 0 {
            if let Some(event) = self.history.scan(path, recursive, since)? {
                let _ = tx.send(event);
                if !stream {
                    return Ok(Watcher { rx });
                }
            }
        }

        self.watchers.push(WatcherSlot {
            path: path.to_string(),
            recursive,
            stream,
            tx,
        });
        Ok(Watcher { rx })
    }

    /// Record `event` in history and fan it out. Single-shot watchers and
    /// watchers whose receiver went away are dropped.
    pub fn notify(&mut self, event: &Event) {
        self.history.add(event.clone());
        self.watchers.retain(|slot| {
            if !slot.matches(&event.node.key) {
                return true;
            }
            let delivered = slot.tx.send(event.clone()).is_ok();
            delivered && slot.stream
        });
    }

    /// Drop every registered watcher. Used when the store is replaced by a
    /// snapshot; watchers observe the closed channel and must re-watch.
    pub fn clear(&mut self) {
        self.watchers.clear();
        self.history = EventHistory::default();
    }
}

struct EventHistory {
    queue: VecDeque<Event>,
}

impl Default for EventHistory {
    fn default() -> Self {
        EventHistory {
            queue: VecDeque::with_capacity(EVENT_HISTORY_CAPACITY),
        }
    }
}

impl EventHistory {
    fn add(&mut self, event: Event) {
        if self.queue.len() == EVENT_HISTORY_CAPACITY {
            self.queue.pop_front();
        }
        self.queue.push_back(event);
    }

    fn scan(&self, path: &str, recursive: bool, since: u64) -> PalisadeResult<Option<Event>> {
        if let Some(oldest) = self.queue.front().map(|e| e.store_index) {
            if since < oldest {
                return Err(PalisadeError::EventIndexCleared {
                    since,
                    oldest,
                });
            }
        }
        Ok(self
            .queue
            .iter()
            .find(|e| e.store_index >= since && key_matches(path, recursive, &e.node.key))
            .cloned())
    }
}
