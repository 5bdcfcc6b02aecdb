//! Fan-out of results and status to dashboard consumers.
//!
//! Results go through a bounded broadcast ring: every consumer sees them in
//! order, and a consumer that falls behind by more than the buffer loses the
//! oldest ones and receives a [`LiveEvent::Gap`] first. Status is a single
//! latest-value cell, so a slow consumer only ever sees the newest board.

use std::sync::Arc;

use tokio::sync::{broadcast, watch};
use tokio::sync::broadcast::error::RecvError;

use crate::domain::{
    inspection::InspectionResult,
    stream::{LiveEvent, StatusBoard},
};

pub struct LiveChannel {
    results: broadcast::Sender<Arc<InspectionResult>>,
    status: watch::Sender<StatusBoard>,
    capacity: usize,
}

impl LiveChannel {
    /// The broadcast ring only comes in powers of two, so `buffer` is
    /// rounded up and [`LiveChannel::capacity`] reports what is kept.
    pub fn new(project_id: &str, buffer: usize) -> Self {
        let capacity = buffer.max(1).next_power_of_two();
        let (results, _) = broadcast::channel(capacity);
        let board = StatusBoard { project_id: project_id.to_string(), ..Default::default() };
        let (status, _) = watch::channel(board);
        Self { results, status, capacity }
    }

    /// Results a consumer may fall behind by before it sees a gap.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn publish_result(&self, result: Arc<InspectionResult>) {
        self.status.send_modify(|board| board.stats.record(&result));
        // No subscribers is not an error.
        let _ = self.results.send(result);
    }

    pub fn update_status(&self, f: impl FnOnce(&mut StatusBoard)) {
        self.status.send_modify(f);
    }

    pub fn status(&self) -> StatusBoard {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> LiveSubscription {
        LiveSubscription {
            results: self.results.subscribe(),
            status: self.status.subscribe(),
            sent_initial: false,
        }
    }
}

pub struct LiveSubscription {
    results: broadcast::Receiver<Arc<InspectionResult>>,
    status: watch::Receiver<StatusBoard>,
    sent_initial: bool,
}

impl LiveSubscription {
    /// Next event for this consumer; the first call yields the current
    /// status board. `None` once the channel is gone.
    pub async fn next(&mut self) -> Option<LiveEvent> {
        if !self.sent_initial {
            self.sent_initial = true;
            return Some(LiveEvent::Status(self.status.borrow_and_update().clone()));
        }
        tokio::select! {
            biased;
            received = self.results.recv() => match received {
                Ok(result) => Some(LiveEvent::Result(result)),
                Err(RecvError::Lagged(missed)) => Some(LiveEvent::Gap { missed }),
                Err(RecvError::Closed) => None,
            },
            changed = self.status.changed() => match changed {
                Ok(()) => Some(LiveEvent::Status(self.status.borrow_and_update().clone())),
                Err(_) => None,
            },
        }
    }
}
