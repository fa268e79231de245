//! Record inspection
//!
//! A [`Record`] is one unit of worker input: a packet payload plus the
//! application buffers the protocol parsers extracted from it. Inspection
//! runs the generation's matcher over the payload and then every engine the
//! dispatch table lists for the record's protocol and direction.

use crate::dispatch::{AppInspector, Direction, DispatchTable};
use crate::worker::WorkerState;
use bytes::Bytes;
use sase_ips::{AppProto, SigList, TransportClass};

/// Unit of worker input
#[derive(Clone, Debug)]
pub struct Record {
    pub transport: TransportClass,
    pub app: AppProto,
    pub direction: Direction,
    pub payload: Bytes,
    buffers: Vec<(SigList, Bytes)>,
    pseudo: bool,
}

impl Record {
    pub fn new(transport: TransportClass, app: AppProto, direction: Direction, payload: Bytes) -> Self {
        Self {
            transport,
            app,
            direction,
            payload,
            buffers: Vec::new(),
            pseudo: false,
        }
    }

    /// Attach an application buffer
    pub fn with_buffer(mut self, list: SigList, data: impl Into<Bytes>) -> Self {
        self.buffers.push((list, data.into()));
        self
    }

    pub fn buffer(&self, list: SigList) -> Option<&Bytes> {
        self.buffers.iter().find(|(l, _)| *l == list).map(|(_, b)| b)
    }

    /// Pseudo end-of-stream record used to wake an idle worker
    pub fn end_of_stream() -> Self {
        Self {
            transport: TransportClass::Other,
            app: AppProto::Unknown,
            direction: Direction::ToServer,
            payload: Bytes::new(),
            buffers: Vec::new(),
            pseudo: true,
        }
    }

    pub fn is_pseudo(&self) -> bool {
        self.pseudo
    }
}

/// Inspection outcome of one engine
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InspectResult {
    NoMatch,
    Match,
}

/// What an engine sees
pub struct InspectContext<'a> {
    pub state: &'a mut WorkerState,
    pub record: &'a Record,
    /// Matched signature ids
    pub alerts: &'a mut Vec<u32>,
}

/// Runs the matcher over one application buffer
#[derive(Debug)]
pub struct BufferInspector {
    list: SigList,
}

impl BufferInspector {
    pub fn new(list: SigList) -> Self {
        Self { list }
    }
}

impl AppInspector for BufferInspector {
    fn name(&self) -> &str {
        self.list.as_str()
    }

    fn inspect(&self, ctx: &mut InspectContext<'_>) -> InspectResult {
        let Some(data) = ctx.record.buffer(self.list) else {
            return InspectResult::NoMatch;
        };
        let hits = ctx.state.scan(ctx.record.app, self.list, data);
        if hits.is_empty() {
            return InspectResult::NoMatch;
        }
        ctx.alerts.extend_from_slice(hits);
        InspectResult::Match
    }
}

/// Inspect a record; returns the sids of matching signatures
pub fn inspect_record(table: &DispatchTable, state: &mut WorkerState, record: &Record) -> Vec<u32> {
    if record.is_pseudo() || state.generation().is_minimal() {
        return Vec::new();
    }

    let mut alerts = Vec::new();
    if !record.payload.is_empty() {
        alerts.extend_from_slice(state.scan(record.app, SigList::Payload, &record.payload));
    }

    if record.app.is_real() {
        let engines = table.lookup(record.transport, record.app, record.direction);
        let mut ctx = InspectContext {
            state: &mut *state,
            record,
            alerts: &mut alerts,
        };
        for engine in engines {
            if engine.inspector.inspect(&mut ctx) == InspectResult::Match {
                tracing::trace!(
                    app = %record.app,
                    list = %engine.list,
                    inspector = engine.inspector.name(),
                    "Inspection engine matched"
                );
            }
        }
    }

    alerts.sort_unstable();
    alerts.dedup();

    let Some(ruleset) = state.generation().ruleset() else {
        return Vec::new();
    };
    alerts
        .into_iter()
        .filter_map(|id| ruleset.signature(id).map(|s| s.sid))
        .collect()
}
