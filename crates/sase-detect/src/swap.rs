//! Swap Orchestrator
//!
//! Control-thread side of a reload. Given a freshly built generation it
//! builds a replacement state for every inspection-capable worker, publishes
//! the generation, hands each replacement over, waits for the workers to
//! confirm adoption and finally retires and reclaims the old generation.

use crate::config::ReloadConfig;
use crate::error::{DetectError, Result};
use crate::generation::{Generation, GenerationId};
use crate::inspect::Record;
use crate::registry::GenerationRegistry;
use crate::threads::{ThreadRegistry, WorkerThread};
use crate::worker::{AdoptionMarker, WorkerState};
use chrono::{DateTime, Utc};
use crossbeam_channel::RecvTimeoutError;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Outcome of one swap
#[derive(Clone, Debug, Serialize)]
pub struct SwapReport {
    pub previous: Option<GenerationId>,
    pub active: GenerationId,
    pub workers: usize,
    pub swapped: usize,
    pub reclaimed: Vec<GenerationId>,
    pub completed_at: DateTime<Utc>,
}

impl SwapReport {
    /// Every inspection worker moved to the new generation
    pub fn is_complete(&self) -> bool {
        self.swapped == self.workers
    }
}

enum Adoption {
    /// Worker adopted and handed back its old state
    Acked(Box<WorkerState>),
    /// Worker adopted, old state not handed back (released by the worker)
    Adopted,
    /// Replacement taken back, worker stays on its old state
    NotAdopted,
}

/// Coordinates a generation swap across all workers
pub struct SwapOrchestrator {
    registry: Arc<GenerationRegistry>,
    threads: Arc<ThreadRegistry>,
    config: ReloadConfig,
    shutdown: Arc<AtomicBool>,
}

impl SwapOrchestrator {
    pub fn new(
        registry: Arc<GenerationRegistry>,
        threads: Arc<ThreadRegistry>,
        config: ReloadConfig,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            registry,
            threads,
            config,
            shutdown,
        }
    }

    fn shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// Swap every inspection worker to `generation`. On error before the
    /// publish step nothing observable changed.
    pub fn swap(&self, generation: Generation) -> Result<SwapReport> {
        let generation = Arc::new(generation);
        let new_id = generation.id();
        let workers = self.threads.inspection_workers();

        for worker in &workers {
            if let Some(slot) = worker.detect_slot() {
                let stale = slot.drain_stale();
                if stale > 0 {
                    tracing::debug!(worker = worker.id(), stale, "Released stale worker states");
                }
            }
        }

        // Replacements are released by dropping them if anything fails here
        let mut replacements: Vec<(Arc<WorkerThread>, Box<WorkerState>)> = Vec::with_capacity(workers.len());
        for worker in workers {
            if self.shutting_down() {
                return Err(DetectError::Aborted("shutdown during reload".into()));
            }
            let state = WorkerState::adopt(&generation, worker.id()).map_err(|e| {
                tracing::error!(worker = worker.id(), error = %e, "Failed to build replacement state");
                e
            })?;
            replacements.push((worker, Box::new(state)));
        }

        let previous = self.registry.active_id();
        self.registry.publish(generation.clone())?;

        let mut pending: Vec<(Arc<WorkerThread>, AdoptionMarker)> = Vec::with_capacity(replacements.len());
        let total = replacements.len();
        for (worker, state) in replacements {
            let Some(slot) = worker.detect_slot() else {
                continue;
            };
            let marker = state.marker();
            match slot.hand_off(state) {
                Ok(()) => pending.push((worker, marker)),
                Err(state) => {
                    tracing::warn!(worker = worker.id(), "Detect slot occupied, worker not swapped");
                    state.release();
                }
            }
        }

        let mut old_states = Vec::new();
        let mut swapped = 0;
        for (worker, marker) in &pending {
            match self.wait_for_adoption(worker, marker) {
                Adoption::Acked(old) => {
                    swapped += 1;
                    old_states.push(old);
                }
                Adoption::Adopted => swapped += 1,
                Adoption::NotAdopted => {
                    tracing::warn!(worker = worker.id(), generation = %new_id, "Worker did not adopt new generation");
                }
            }
        }

        let released = old_states.len();
        for old in old_states {
            old.release();
        }

        if let Some(previous) = previous {
            if let Err(e) = self.registry.retire(previous) {
                tracing::warn!(generation = %previous, error = %e, "Could not retire previous generation");
            }
        }
        let reclaimed = self.registry.reclaim();

        tracing::info!(
            previous = ?previous,
            active = %new_id,
            workers = total,
            swapped,
            released,
            reclaimed = ?reclaimed,
            "Detection generation swap complete"
        );

        Ok(SwapReport {
            previous,
            active: new_id,
            workers: total,
            swapped,
            reclaimed,
            completed_at: Utc::now(),
        })
    }

    fn wait_for_adoption(&self, worker: &WorkerThread, marker: &AdoptionMarker) -> Adoption {
        let Some(slot) = worker.detect_slot() else {
            return Adoption::NotAdopted;
        };
        let poll = self.config.poll_interval();
        let deadline = self.config.adoption_timeout().map(|t| Instant::now() + t);
        let mut woken = false;

        loop {
            match slot.wait_ack(poll) {
                Ok(old) => return Adoption::Acked(old),
                Err(RecvTimeoutError::Disconnected) => {
                    return if marker.is_set() {
                        Adoption::Adopted
                    } else {
                        self.take_back(worker)
                    };
                }
                Err(RecvTimeoutError::Timeout) => {}
            }

            let expired = deadline.map_or(false, |d| Instant::now() >= d);
            if self.shutting_down() || expired || worker.is_done() {
                return self.take_back(worker);
            }

            // Wake a worker idling on an empty queue, once
            if !woken && !marker.is_set() {
                woken = worker.inject(Record::end_of_stream());
            }
        }
    }

    /// Retract a replacement the worker has not picked up. If the worker
    /// got to it first, give it one more poll interval to ack.
    fn take_back(&self, worker: &WorkerThread) -> Adoption {
        let Some(slot) = worker.detect_slot() else {
            return Adoption::NotAdopted;
        };
        if let Some(replacement) = slot.retract() {
            replacement.release();
            return Adoption::NotAdopted;
        }
        match slot.wait_ack(self.config.poll_interval()) {
            Ok(old) => Adoption::Acked(old),
            // Adopted; a late ack is drained before the next swap
            Err(_) => Adoption::Adopted,
        }
    }
}
