//! Cooperative, fixed-period scheduler for push sources sharing one response.
//!
//! # Purpose
//! Drive every registered [`TickableSource`] once per period, in registration
//! order, then flush the response and sleep for the rest of the period.
//!
//! # Notes
//! - The period is measured from the start of each round against a monotonic
//!   clock, so slow ticks shorten the sleep instead of shifting the schedule.
//! - Sources are added and removed through a [`SchedulerHandle`] while the loop
//!   runs; commands are applied at the start of the next round.
//! - Client disconnect ends the whole loop; a terminated source only removes
//!   itself.
use crate::source::{TickContext, TickableSource};
use crate::sse::SseWriter;
use crate::teardown::Teardown;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until};

pub type SourceId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Running,
    Stopped,
}

/// Why [`Scheduler::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerExit {
    Stopped,
    ClientGone,
    /// Every source terminated or was removed.
    Drained,
}

enum Command {
    Add(SourceId, Box<dyn TickableSource>),
    Remove(SourceId),
}

struct Slot {
    id: SourceId,
    source: Box<dyn TickableSource>,
}

/// Cloneable control surface for a scheduler, usable from other tasks.
#[derive(Clone)]
pub struct SchedulerHandle {
    commands: mpsc::UnboundedSender<Command>,
    stop: Arc<AtomicBool>,
    next_id: Arc<AtomicU64>,
}

impl SchedulerHandle {
    pub fn add_source(&self, source: impl TickableSource + 'static) -> SourceId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        // A send error means the scheduler is gone; the source is simply dropped.
        let _ = self.commands.send(Command::Add(id, Box::new(source)));
        id
    }

    pub fn remove_source(&self, id: SourceId) {
        let _ = self.commands.send(Command::Remove(id));
    }

    /// Idempotent.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }
}

pub struct Scheduler {
    interval: Duration,
    state: SchedulerState,
    sources: Vec<Slot>,
    commands: mpsc::UnboundedReceiver<Command>,
    handle: SchedulerHandle,
}

impl Scheduler {
    pub fn new(interval: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            interval,
            state: SchedulerState::Idle,
            sources: Vec::new(),
            commands: rx,
            handle: SchedulerHandle {
                commands: tx,
                stop: Arc::new(AtomicBool::new(false)),
                next_id: Arc::new(AtomicU64::new(1)),
            },
        }
    }

    pub fn handle(&self) -> SchedulerHandle {
        self.handle.clone()
    }

    pub fn add_source(&mut self, source: impl TickableSource + 'static) -> SourceId {
        let id = self.handle.next_id.fetch_add(1, Ordering::SeqCst);
        self.sources.push(Slot {
            id,
            source: Box::new(source),
        });
        id
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Run until stopped, the client disconnects, or no source is left.
    ///
    /// Resources of sources removed along the way, and of those still
    /// registered at exit, are handed to `teardown`; the caller runs it after
    /// closing `writer`.
    pub async fn run(&mut self, writer: &SseWriter, teardown: &mut Teardown) -> SchedulerExit {
        if self.state == SchedulerState::Stopped {
            return SchedulerExit::Stopped;
        }
        self.state = SchedulerState::Running;
        tracing::debug!(interval_ms = self.interval.as_millis() as u64, "scheduler running");

        let exit = loop {
            let round_started = Instant::now();
            self.apply_commands(teardown);

            if writer.is_client_gone() {
                break SchedulerExit::ClientGone;
            }

            {
                let mut ctx = TickContext::new(writer, &self.handle.stop);
                for slot in self.sources.iter_mut() {
                    slot.source.tick(&mut ctx).await;
                }
            }
            self.remove_terminated(teardown);

            if let Err(err) = writer.flush() {
                tracing::debug!(error = %err, "scheduler flush failed");
                break SchedulerExit::ClientGone;
            }
            if self.handle.is_stopped() {
                break SchedulerExit::Stopped;
            }
            if self.sources.is_empty() {
                break SchedulerExit::Drained;
            }

            sleep_until(round_started + self.interval).await;
        };

        self.state = SchedulerState::Stopped;
        self.handle.stop();
        self.apply_commands(teardown);
        for mut slot in self.sources.drain(..) {
            slot.source.shutdown(teardown);
        }
        tracing::debug!(exit = ?exit, "scheduler stopped");
        exit
    }

    fn apply_commands(&mut self, teardown: &mut Teardown) {
        while let Ok(command) = self.commands.try_recv() {
            match command {
                Command::Add(id, source) => self.sources.push(Slot { id, source }),
                Command::Remove(id) => {
                    if let Some(index) = self.sources.iter().position(|slot| slot.id == id) {
                        let mut slot = self.sources.remove(index);
                        slot.source.shutdown(teardown);
                    }
                }
            }
        }
    }

    fn remove_terminated(&mut self, teardown: &mut Teardown) {
        let mut index = 0;
        while index < self.sources.len() {
            if self.sources[index].source.is_terminated() {
                let mut slot = self.sources.remove(index);
                tracing::debug!(source = %slot.source.name(), id = slot.id, "source terminated");
                slot.source.shutdown(teardown);
            } else {
                index += 1;
            }
        }
    }
}
