//! Worker threads
//!
//! The [`ThreadRegistry`] lists every live worker with its stage
//! descriptors, its input queue and, for inspection-capable workers, the
//! control-side end of its detect slot. [`DetectWorker`] is the worker
//! runtime: it drains its input queue, inspects records and picks up
//! replacement states handed over by the control thread.

use crate::dispatch::DispatchTable;
use crate::generation::GenerationId;
use crate::inspect::{inspect_record, Record};
use crate::worker::WorkerState;
use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Kind of processing stage a worker runs
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StageKind {
    Receive,
    Decode,
    Detect,
    Output,
}

impl StageKind {
    pub fn is_inspection_capable(self) -> bool {
        matches!(self, StageKind::Detect)
    }
}

#[derive(Clone, Debug)]
pub struct StageDescriptor {
    pub name: String,
    pub kind: StageKind,
}

impl StageDescriptor {
    pub fn new(name: &str, kind: StageKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
        }
    }
}

/// Control-side end of a worker's detect stage slot
pub struct DetectSlot {
    handoff_tx: Sender<Box<WorkerState>>,
    /// Lets the control thread take back a replacement nobody picked up
    handoff_rx: Receiver<Box<WorkerState>>,
    ack_rx: Receiver<Box<WorkerState>>,
}

/// Worker-side end of a detect stage slot
pub struct DetectPort {
    handoff_rx: Receiver<Box<WorkerState>>,
    ack_tx: Sender<Box<WorkerState>>,
}

/// Create a connected slot/port pair
pub fn detect_slot() -> (DetectSlot, DetectPort) {
    let (handoff_tx, handoff_rx) = bounded(1);
    let (ack_tx, ack_rx) = bounded(1);
    (
        DetectSlot {
            handoff_tx,
            handoff_rx: handoff_rx.clone(),
            ack_rx,
        },
        DetectPort { handoff_rx, ack_tx },
    )
}

impl DetectSlot {
    /// Offer a replacement; returns it back if the slot is occupied
    pub fn hand_off(&self, state: Box<WorkerState>) -> Result<(), Box<WorkerState>> {
        self.handoff_tx.try_send(state).map_err(TrySendError::into_inner)
    }

    /// Take back a replacement the worker has not picked up yet
    pub fn retract(&self) -> Option<Box<WorkerState>> {
        self.handoff_rx.try_recv().ok()
    }

    /// Wait for the worker to hand back its previous state
    pub fn wait_ack(&self, timeout: Duration) -> Result<Box<WorkerState>, RecvTimeoutError> {
        self.ack_rx.recv_timeout(timeout)
    }

    /// Release leftovers of an earlier, interrupted swap
    pub fn drain_stale(&self) -> usize {
        let mut drained = 0;
        while let Some(state) = self.retract() {
            state.release();
            drained += 1;
        }
        while let Ok(state) = self.ack_rx.try_recv() {
            state.release();
            drained += 1;
        }
        drained
    }
}

/// Registry entry of one worker thread
pub struct WorkerThread {
    id: u64,
    name: String,
    stages: Vec<StageDescriptor>,
    inq: Sender<Record>,
    detect: Option<DetectSlot>,
    running: AtomicBool,
    done: AtomicBool,
}

impl WorkerThread {
    pub fn new(
        id: u64,
        name: &str,
        stages: Vec<StageDescriptor>,
        inq: Sender<Record>,
        detect: Option<DetectSlot>,
    ) -> Self {
        Self {
            id,
            name: name.to_string(),
            stages,
            inq,
            detect,
            running: AtomicBool::new(false),
            done: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runs a detect stage with a swappable state slot
    pub fn is_inspection_capable(&self) -> bool {
        self.detect.is_some() && self.stages.iter().any(|s| s.kind.is_inspection_capable())
    }

    pub fn detect_slot(&self) -> Option<&DetectSlot> {
        self.detect.as_ref()
    }

    /// Queue a record without blocking; false if the queue is full or closed
    pub fn inject(&self, record: Record) -> bool {
        self.inq.try_send(record).is_ok()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    fn set_running(&self) {
        self.running.store(true, Ordering::Release);
    }

    fn set_done(&self) {
        self.running.store(false, Ordering::Release);
        self.done.store(true, Ordering::Release);
    }
}

/// Live worker threads
#[derive(Default)]
pub struct ThreadRegistry {
    workers: DashMap<u64, Arc<WorkerThread>>,
    next_id: AtomicU64,
}

impl ThreadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn register(&self, thread: WorkerThread) -> Arc<WorkerThread> {
        let thread = Arc::new(thread);
        self.workers.insert(thread.id(), thread.clone());
        tracing::debug!(id = thread.id(), name = thread.name(), "Registered worker thread");
        thread
    }

    pub fn unregister(&self, id: u64) -> Option<Arc<WorkerThread>> {
        self.workers.remove(&id).map(|(_, thread)| thread)
    }

    pub fn get(&self, id: u64) -> Option<Arc<WorkerThread>> {
        self.workers.get(&id).map(|entry| entry.value().clone())
    }

    /// Snapshot of all workers, ordered by id
    pub fn snapshot(&self) -> Vec<Arc<WorkerThread>> {
        let mut workers: Vec<_> = self.workers.iter().map(|e| e.value().clone()).collect();
        workers.sort_by_key(|w| w.id());
        workers
    }

    pub fn inspection_workers(&self) -> Vec<Arc<WorkerThread>> {
        self.snapshot()
            .into_iter()
            .filter(|w| w.is_inspection_capable())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}

/// Matches produced by a worker for one record
#[derive(Clone, Debug)]
pub struct DetectEvent {
    pub worker_id: u64,
    pub generation: GenerationId,
    pub sids: Vec<u32>,
    pub timestamp: DateTime<Utc>,
}

/// Worker runtime of a detect thread
pub struct DetectWorker {
    thread: Arc<WorkerThread>,
    inq: Receiver<Record>,
    port: DetectPort,
    state: Box<WorkerState>,
    dispatch: Arc<DispatchTable>,
    events: Option<Sender<DetectEvent>>,
    shutdown: Arc<AtomicBool>,
    poll: Duration,
    processed: u64,
}

impl DetectWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        thread: Arc<WorkerThread>,
        inq: Receiver<Record>,
        port: DetectPort,
        state: Box<WorkerState>,
        dispatch: Arc<DispatchTable>,
        events: Option<Sender<DetectEvent>>,
        shutdown: Arc<AtomicBool>,
        poll: Duration,
    ) -> Self {
        state.mark_adopted();
        Self {
            thread,
            inq,
            port,
            state,
            dispatch,
            events,
            shutdown,
            poll,
            processed: 0,
        }
    }

    /// Main worker loop
    pub fn run(mut self) {
        let id = self.thread.id();
        self.thread.set_running();
        tracing::debug!(worker = id, generation = %self.state.generation_id(), "Detect worker starting");

        while !self.shutdown.load(Ordering::Relaxed) {
            match self.inq.recv_timeout(self.poll) {
                Ok(record) => self.process(record),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        // A replacement nobody will adopt any more
        while let Ok(pending) = self.port.handoff_rx.try_recv() {
            pending.release();
        }
        self.thread.set_done();
        tracing::debug!(worker = id, processed = self.processed, "Detect worker stopped");
        // Dropping `self` releases the current state
    }

    /// Process one record, adopting a pending replacement state first
    pub fn process(&mut self, record: Record) {
        self.adopt_pending();
        if record.is_pseudo() {
            return;
        }

        self.processed += 1;
        let sids = inspect_record(&self.dispatch, &mut self.state, &record);
        if sids.is_empty() {
            return;
        }
        if let Some(events) = &self.events {
            let event = DetectEvent {
                worker_id: self.thread.id(),
                generation: self.state.generation_id(),
                sids,
                timestamp: Utc::now(),
            };
            if events.try_send(event).is_err() {
                tracing::trace!(worker = self.thread.id(), "Detect event dropped");
            }
        }
    }

    fn adopt_pending(&mut self) {
        let Ok(mut next) = self.port.handoff_rx.try_recv() else {
            return;
        };
        next.mark_adopted();
        std::mem::swap(&mut self.state, &mut next);
        tracing::debug!(
            worker = self.thread.id(),
            from = %next.generation_id(),
            to = %self.state.generation_id(),
            "Adopted new detection generation"
        );
        if let Err(e) = self.port.ack_tx.try_send(next) {
            // Control thread gone or not draining: release locally
            e.into_inner().release();
        }
    }

    pub fn state(&self) -> &WorkerState {
        &self.state
    }
}
