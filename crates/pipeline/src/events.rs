//! Per-run status streaming with replay
//!
//! Every run owns an [`EventPublisher`]: a bounded log of sequenced events
//! plus a broadcast channel for live delivery. Publishing never waits on
//! subscribers; a subscriber that falls behind re-reads the retained log.

use analytics_common::{AgentType, EventStatus, PipelineEvent, RunId};
use chrono::Utc;
use futures::Stream;
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};

use crate::store::RunHandle;

/// Boxed stream of events for one run
pub type EventStream = Pin<Box<dyn Stream<Item = PipelineEvent> + Send>>;

pub struct EventPublisher {
    run_id: RunId,
    buffer: VecDeque<PipelineEvent>,
    capacity: usize,
    next_sequence: u64,
    sender: broadcast::Sender<PipelineEvent>,
}

impl EventPublisher {
    pub fn new(run_id: RunId, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self {
            run_id,
            buffer: VecDeque::with_capacity(capacity.min(256)),
            capacity,
            next_sequence: 1,
            sender,
        }
    }

    /// Assign the next sequence number, retain and broadcast the event.
    pub fn publish(
        &mut self,
        task: Option<AgentType>,
        status: EventStatus,
        progress: f32,
        attempt: u32,
        message: impl Into<String>,
    ) -> u64 {
        let event = PipelineEvent {
            sequence: self.next_sequence,
            run_id: self.run_id,
            task,
            status,
            progress,
            attempt,
            message: message.into(),
            timestamp: Utc::now(),
        };
        self.next_sequence += 1;

        if self.buffer.len() == self.capacity {
            self.buffer.pop_front();
        }
        self.buffer.push_back(event.clone());

        // Ignore send errors (no receivers)
        let _ = self.sender.send(event);
        self.next_sequence - 1
    }

    /// Retained events with a sequence number greater than `after`.
    ///
    /// Events evicted from the bounded log are not replayed.
    pub fn replay_after(&self, after: u64) -> Vec<PipelineEvent> {
        self.buffer
            .iter()
            .filter(|event| event.sequence > after)
            .cloned()
            .collect()
    }

    pub fn subscribe_live(&self) -> broadcast::Receiver<PipelineEvent> {
        self.sender.subscribe()
    }

    pub fn last_sequence(&self) -> u64 {
        self.next_sequence - 1
    }

    pub fn retained(&self) -> usize {
        self.buffer.len()
    }
}

/// Stream a run's events after `from` (exclusive), then follow live events
/// until the run's terminal event.
///
/// Delivery is at-least-once across reconnects: callers resume with the last
/// sequence they saw and must tolerate seeing it again.
pub fn subscribe(handle: Arc<RunHandle>, from: Option<u64>) -> EventStream {
    Box::pin(async_stream::stream! {
        let mut last_seen = from.unwrap_or(0);
        let (mut receiver, backlog, finished) = {
            let state = handle.lock().await;
            (
                state.events.subscribe_live(),
                state.events.replay_after(last_seen),
                state.run.status.is_terminal(),
            )
        };
        debug!(run_id = %handle.id, from = last_seen, replay = backlog.len(), "Subscriber attached");

        for event in backlog {
            last_seen = event.sequence;
            let terminal = event.is_terminal();
            yield event;
            if terminal {
                return;
            }
        }
        if finished {
            return;
        }

        loop {
            match receiver.recv().await {
                Ok(event) => {
                    if event.sequence <= last_seen {
                        continue;
                    }
                    last_seen = event.sequence;
                    let terminal = event.is_terminal();
                    yield event;
                    if terminal {
                        return;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(run_id = %handle.id, skipped, "Subscriber lagged, replaying from log");
                    let backlog = handle.lock().await.events.replay_after(last_seen);
                    for event in backlog {
                        last_seen = event.sequence;
                        let terminal = event.is_terminal();
                        yield event;
                        if terminal {
                            return;
                        }
                    }
                }
                Err(RecvError::Closed) => return,
            }
        }
    })
}
