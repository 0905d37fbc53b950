//! Run event hub: persists trace events and fans them out to live readers.
//!
//! The database is the source of truth. A subscriber registers its live
//! receiver before replaying stored events, so nothing emitted in between is
//! lost; overlap is removed by event id. Lagged or closed receivers catch up
//! from the database.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rusqlite::Connection;
use tokio::sync::broadcast::{self, error::RecvError};

use crate::db::{append_run_event, list_run_events, open_database, DatabaseError};
use crate::models::{StoredEvent, TraceEvent};

const CHANNEL_CAPACITY: usize = 256;

type Channels = HashMap<String, broadcast::Sender<StoredEvent>>;

#[derive(Clone)]
pub struct TraceHub {
    db_path: PathBuf,
    channels: Arc<Mutex<Channels>>,
}

impl TraceHub {
    pub fn new(db_path: PathBuf) -> Self {
        Self {
            db_path,
            channels: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn open(&self) -> Result<Connection, DatabaseError> {
        open_database(&self.db_path)
    }

    fn channels(&self) -> MutexGuard<'_, Channels> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Persist an event, then publish it to live subscribers.
    pub fn emit(&self, run_id: &str, event: TraceEvent) -> Result<StoredEvent, DatabaseError> {
        let conn = self.open()?;
        let id = append_run_event(&conn, run_id, &event)?;
        let stored = StoredEvent {
            id,
            run_id: run_id.to_string(),
            event,
        };

        let mut channels = self.channels();
        if let Some(tx) = channels.get(run_id) {
            // No receivers is fine: the event is already stored.
            let _ = tx.send(stored.clone());
        }
        if stored.event.event_type.is_terminal() {
            // Dropping the sender closes every receiver once drained.
            channels.remove(run_id);
        }
        Ok(stored)
    }

    /// All stored events of a run, in id order.
    pub fn list(&self, run_id: &str) -> Result<Vec<StoredEvent>, DatabaseError> {
        let conn = self.open()?;
        list_run_events(&conn, run_id, 0)
    }

    /// Replay from the first event, then follow live events until the run
    /// reaches `finalized` or `failed`.
    pub fn subscribe(&self, run_id: &str) -> Result<TraceSubscription, DatabaseError> {
        let rx = self
            .channels()
            .entry(run_id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe();

        let replay = self.list(run_id)?;
        let mut sub = TraceSubscription {
            hub: self.clone(),
            run_id: run_id.to_string(),
            rx: Some(rx),
            pending: replay.into(),
            last_id: 0,
            finished: false,
        };
        if sub.pending.iter().any(|e| e.event.event_type.is_terminal()) {
            sub.release();
        }
        Ok(sub)
    }

    /// Drop a run's channel so live readers fall back to storage and end.
    pub fn close(&self, run_id: &str) {
        if self.channels().remove(run_id).is_some() {
            tracing::warn!(run_id = %run_id, "Event channel closed without a terminal event");
        }
    }

    /// Drop the channel of a run nobody is listening to anymore.
    fn prune(&self, run_id: &str) {
        let mut channels = self.channels();
        if channels.get(run_id).is_some_and(|tx| tx.receiver_count() == 0) {
            channels.remove(run_id);
        }
    }

    #[cfg(test)]
    fn channel_count(&self) -> usize {
        self.channels().len()
    }
}

/// One reader's ordered, de-duplicated view of a run's events.
pub struct TraceSubscription {
    hub: TraceHub,
    run_id: String,
    rx: Option<broadcast::Receiver<StoredEvent>>,
    pending: VecDeque<StoredEvent>,
    last_id: i64,
    finished: bool,
}

impl TraceSubscription {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Next event, or `None` once the terminal event has been delivered.
    pub async fn next(&mut self) -> Option<StoredEvent> {
        loop {
            if self.finished {
                return None;
            }
            if let Some(event) = self.pending.pop_front() {
                if event.id <= self.last_id {
                    continue;
                }
                self.last_id = event.id;
                if event.event.event_type.is_terminal() {
                    self.finished = true;
                    self.release();
                }
                return Some(event);
            }

            let Some(rx) = self.rx.as_mut() else {
                self.finished = true;
                return None;
            };
            match rx.recv().await {
                Ok(event) => self.pending.push_back(event),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(run_id = %self.run_id, skipped, "Event subscriber lagged, reloading");
                    self.catch_up()?;
                }
                Err(RecvError::Closed) => {
                    self.rx = None;
                    self.catch_up()?;
                }
            }
        }
    }

    fn catch_up(&mut self) -> Option<()> {
        let loaded = self
            .hub
            .open()
            .and_then(|conn| list_run_events(&conn, &self.run_id, self.last_id));
        match loaded {
            Ok(events) => {
                self.pending.extend(events);
                Some(())
            }
            Err(e) => {
                tracing::error!(run_id = %self.run_id, error = %e, "Event replay failed");
                self.finished = true;
                self.release();
                None
            }
        }
    }

    fn release(&mut self) {
        if self.rx.take().is_some() {
            self.hub.prune(&self.run_id);
        }
    }
}

impl Drop for TraceSubscription {
    fn drop(&mut self) {
        self.release();
    }
}
