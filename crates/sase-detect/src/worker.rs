//! Worker inspection state
//!
//! Per-worker scratch space bound to exactly one generation. A state is
//! built with fallible allocation, counts its generation only once every
//! allocation succeeded, and gives the count back when released or dropped.

use crate::error::{DetectError, Result};
use crate::generation::{Generation, GenerationId};
use crate::keyword::{KeywordContexts, KeywordId};
use crate::registry::GenerationRef;
use sase_ips::{AppProto, MatcherDimensions, SigList};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Observable "this state has been adopted" flag; only goes false → true
#[derive(Clone, Debug, Default)]
pub struct AdoptionMarker(Arc<AtomicBool>);

impl AdoptionMarker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Scratch arrays sized from the matcher dimensions
#[derive(Debug, Default)]
struct Scratch {
    content_ids: Vec<u32>,
    stream_ids: Vec<u32>,
    uri_ids: Vec<u32>,
    fp_queue: Vec<u32>,
    match_array: Vec<u32>,
    byte_values: Vec<u64>,
    non_matcher_ids: Vec<u32>,
}

fn alloc<T>(len: u32) -> Result<Vec<T>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len as usize)
        .map_err(|e| DetectError::ResourceExhausted(format!("scratch of {} entries: {}", len, e)))?;
    Ok(buf)
}

impl Scratch {
    fn allocate(dims: &MatcherDimensions) -> Result<Self> {
        Ok(Self {
            content_ids: alloc(dims.content_max_id)?,
            stream_ids: alloc(dims.stream_max_id)?,
            uri_ids: alloc(dims.uri_max_id)?,
            fp_queue: alloc(dims.max_fp_id)?,
            match_array: alloc(dims.sig_count)?,
            byte_values: alloc(u32::from(dims.byte_extract_max))?,
            non_matcher_ids: alloc(dims.non_matcher_max)?,
        })
    }

    fn capacity(&self) -> usize {
        self.content_ids.capacity()
            + self.stream_ids.capacity()
            + self.uri_ids.capacity()
            + self.fp_queue.capacity()
            + self.match_array.capacity()
            + self.byte_values.capacity()
            + self.non_matcher_ids.capacity()
    }
}

/// Per-protocol temporary buffers; grown on demand, never shrunk
#[derive(Debug)]
pub struct InspectBuffers {
    buffers: Vec<Vec<u8>>,
}

impl InspectBuffers {
    fn new() -> Self {
        Self {
            buffers: vec![Vec::new(); AppProto::COUNT],
        }
    }

    /// Buffer for `app` with room for at least `min_len` bytes, cleared
    pub fn get(&mut self, app: AppProto, min_len: usize) -> Result<&mut Vec<u8>> {
        let buf = &mut self.buffers[app.index()];
        buf.clear();
        if buf.capacity() < min_len {
            buf.try_reserve(min_len)
                .map_err(|e| DetectError::ResourceExhausted(e.to_string()))?;
        }
        Ok(buf)
    }

    pub fn capacity(&self, app: AppProto) -> usize {
        self.buffers[app.index()].capacity()
    }
}

/// Inspection state of one worker
pub struct WorkerState {
    worker_id: u64,
    scratch: Scratch,
    buffers: InspectBuffers,
    keywords: KeywordContexts,
    marker: AdoptionMarker,
    // Last field: the count is given back after everything above is freed
    generation: GenerationRef,
}

impl WorkerState {
    /// Build a state bound to `generation`
    pub fn adopt(generation: &Arc<Generation>, worker_id: u64) -> Result<Self> {
        let scratch = if generation.is_minimal() {
            Scratch::default()
        } else {
            Scratch::allocate(&generation.dimensions())?
        };
        let keywords = generation.keywords().instantiate()?;

        let state = Self {
            worker_id,
            scratch,
            buffers: InspectBuffers::new(),
            keywords,
            marker: AdoptionMarker::new(),
            generation: GenerationRef::acquire(generation),
        };

        tracing::debug!(
            worker = worker_id,
            generation = %generation.id(),
            scratch = state.scratch.capacity(),
            "Worker state bound to generation"
        );
        Ok(state)
    }

    /// Release the generation binding, keyword contexts and scratch
    pub fn release(self) {
        tracing::debug!(
            worker = self.worker_id,
            generation = %self.generation.id(),
            "Releasing worker state"
        );
        drop(self);
    }

    pub fn worker_id(&self) -> u64 {
        self.worker_id
    }

    pub fn generation(&self) -> &Generation {
        &self.generation
    }

    pub fn generation_id(&self) -> GenerationId {
        self.generation.id()
    }

    pub fn mark_adopted(&self) {
        self.marker.mark();
    }

    pub fn is_adopted(&self) -> bool {
        self.marker.is_set()
    }

    /// Handle for the control thread to observe adoption
    pub fn marker(&self) -> AdoptionMarker {
        self.marker.clone()
    }

    pub fn keyword<T: 'static>(&self, id: KeywordId) -> Option<&T> {
        self.keywords.get(id)
    }

    pub fn keyword_mut<T: 'static>(&mut self, id: KeywordId) -> Option<&mut T> {
        self.keywords.get_mut(id)
    }

    pub fn buffers(&mut self) -> &mut InspectBuffers {
        &mut self.buffers
    }

    /// Run the generation's matcher over `data` as buffer `list` of group
    /// `app`; returns the candidate signature ids
    pub fn scan(&mut self, app: AppProto, list: SigList, data: &[u8]) -> &[u32] {
        self.scratch.match_array.clear();
        if let Some(ruleset) = self.generation.arc().ruleset() {
            ruleset.matcher.scan(app, list, data, &mut self.scratch.match_array);
        }
        &self.scratch.match_array
    }
}

impl std::fmt::Debug for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerState")
            .field("worker_id", &self.worker_id)
            .field("generation", &self.generation.id())
            .field("adopted", &self.is_adopted())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigStore;
    use crate::generation::GenerationBuilder;
    use crate::keyword::{KeywordContext, KeywordInit, KeywordMode, KeywordTeardown};
    use sase_ips::RuleCompiler;
    use std::sync::atomic::AtomicUsize;

    const RULES: &str = r#"
        alert http any any -> any any (content:"/login"; http_uri; sid:10;)
        alert tcp any any -> any any (content:"secret"; nocase; sid:11;)
    "#;

    fn build(builder: &GenerationBuilder) -> Arc<Generation> {
        Arc::new(builder.build(&ConfigStore::new(), RULES).unwrap())
    }

    #[test]
    fn test_adopt_counts_and_release_uncounts() {
        let builder = GenerationBuilder::new(Arc::new(RuleCompiler::default()));
        let generation = build(&builder);

        let state = WorkerState::adopt(&generation, 1).unwrap();
        assert_eq!(generation.ref_count(), 1);
        assert_eq!(state.generation_id(), generation.id());

        state.release();
        assert_eq!(generation.ref_count(), 0);

        let dropped = WorkerState::adopt(&generation, 1).unwrap();
        drop(dropped);
        assert_eq!(generation.ref_count(), 0);
    }

    #[test]
    fn test_scan_uses_bound_generation() {
        let builder = GenerationBuilder::new(Arc::new(RuleCompiler::default()));
        let generation = build(&builder);
        let mut state = WorkerState::adopt(&generation, 1).unwrap();

        let hits = state.scan(AppProto::Http, SigList::Uri, b"/login?user=x").to_vec();
        assert_eq!(hits.len(), 1);
        assert_eq!(generation.ruleset().unwrap().signatures[hits[0] as usize].sid, 10);
        assert_eq!(state.scan(AppProto::Http, SigList::Payload, b"SECRET").len(), 1);
        assert!(state.scan(AppProto::Http, SigList::Uri, b"/index").is_empty());
    }

    #[test]
    fn test_minimal_generation_has_no_scratch() {
        let builder = GenerationBuilder::new(Arc::new(RuleCompiler::default()));
        let generation = Arc::new(builder.build_minimal());
        let mut state = WorkerState::adopt(&generation, 3).unwrap();

        assert_eq!(state.scratch.capacity(), 0);
        assert!(state.scan(AppProto::Http, SigList::Uri, b"/login").is_empty());
    }

    #[test]
    fn test_marker_observable_from_clone() {
        let builder = GenerationBuilder::new(Arc::new(RuleCompiler::default()));
        let generation = build(&builder);
        let state = WorkerState::adopt(&generation, 1).unwrap();

        let marker = state.marker();
        assert!(!marker.is_set());
        state.mark_adopted();
        assert!(marker.is_set());
        assert!(state.is_adopted());
    }

    #[test]
    fn test_buffers_grow_and_never_shrink() {
        let builder = GenerationBuilder::new(Arc::new(RuleCompiler::default()));
        let generation = build(&builder);
        let mut state = WorkerState::adopt(&generation, 1).unwrap();

        state.buffers().get(AppProto::Http, 4096).unwrap().extend_from_slice(b"abc");
        let grown = state.buffers().capacity(AppProto::Http);
        assert!(grown >= 4096);

        let buf = state.buffers().get(AppProto::Http, 16).unwrap();
        assert!(buf.is_empty());
        assert_eq!(state.buffers().capacity(AppProto::Http), grown);
    }

    #[test]
    fn test_keyword_failure_leaves_count_untouched() {
        let builder = GenerationBuilder::new(Arc::new(RuleCompiler::default()));
        let torn_down = Arc::new(AtomicUsize::new(0));
        let counter = torn_down.clone();
        let teardown: KeywordTeardown = Arc::new(move |_ctx: KeywordContext| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let ok: KeywordInit = Arc::new(|| Some(Box::new(1u32) as KeywordContext));
        let broken: KeywordInit = Arc::new(|| -> Option<KeywordContext> { None });

        let id = builder.register_keyword("flowint", ok, teardown.clone(), KeywordMode::Shared);
        let good = build(&builder);
        let state = WorkerState::adopt(&good, 1).unwrap();
        assert_eq!(state.keyword::<u32>(id), Some(&1));
        drop(state);
        assert_eq!(torn_down.load(Ordering::SeqCst), 1);

        builder.register_keyword("lua", broken, teardown, KeywordMode::PerInstance);
        let bad = build(&builder);
        assert!(matches!(
            WorkerState::adopt(&bad, 1),
            Err(DetectError::KeywordInit(_))
        ));
        assert_eq!(bad.ref_count(), 0);
        assert_eq!(torn_down.load(Ordering::SeqCst), 2);
    }
}
