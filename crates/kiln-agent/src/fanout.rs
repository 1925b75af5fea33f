//! Per-instance broadcast of tailed console lines.
//!
//! Every subscriber reads from a tokio broadcast ring of `capacity` lines. A
//! subscriber that falls behind loses the oldest lines (it sees a lag, skips
//! ahead and keeps going); the publisher never waits on anyone.

use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
};

use kiln_process::SubscriberId;
use tokio::sync::{broadcast, watch};

struct State {
    tx: broadcast::Sender<String>,
    cancels: HashMap<SubscriberId, watch::Sender<bool>>,
}

pub struct LogFanout {
    capacity: usize,
    state: Mutex<State>,
}

/// Receiving side of one subscriber.
pub struct Subscription {
    pub id: SubscriberId,
    rx: broadcast::Receiver<String>,
    cancel: watch::Receiver<bool>,
}

impl LogFanout {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, _) = broadcast::channel(capacity);
        Self {
            capacity,
            state: Mutex::new(State {
                tx,
                cancels: HashMap::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn subscribe(&self) -> Subscription {
        let mut st = self.lock();
        st.cancels.retain(|_, c| !c.is_closed());

        let id = SubscriberId::new();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        st.cancels.insert(id.clone(), cancel_tx);
        Subscription {
            id,
            rx: st.tx.subscribe(),
            cancel: cancel_rx,
        }
    }

    /// Ends one subscription. Lines already buffered for it are still delivered.
    pub fn unsubscribe(&self, id: &SubscriberId) -> bool {
        self.lock().cancels.remove(id).is_some()
    }

    /// Never blocks. Lines published with no subscribers are dropped.
    pub fn publish(&self, line: String) {
        let _ = self.lock().tx.send(line);
    }

    pub fn subscriber_count(&self) -> usize {
        let mut st = self.lock();
        st.cancels.retain(|_, c| !c.is_closed());
        st.cancels.len()
    }

    /// Terminates every current subscription at the end of a run. Later
    /// subscribers attach to a fresh channel for the next run.
    pub fn close_run(&self) {
        let (tx, _) = broadcast::channel(self.capacity);
        let mut st = self.lock();
        let old = std::mem::replace(&mut st.tx, tx);
        let n = st.cancels.len();
        st.cancels.clear();
        drop(old);
        if n > 0 {
            tracing::debug!(subscribers = n, "closed console subscribers");
        }
    }
}

impl Subscription {
    /// Next line, or `None` once the run ended or this subscription was cancelled.
    pub async fn recv(&mut self) -> Option<String> {
        loop {
            tokio::select! {
                biased;
                r = self.rx.recv() => match r {
                    Ok(line) => return Some(line),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(subscriber = %self.id.0, skipped, "console subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                },
                _ = self.cancel.changed() => return None,
            }
        }
    }
}
