//! Generation Registry
//!
//! Holds the live generations (head = active) and the retired ones still
//! referenced by workers. Retired generations are only destroyed by
//! [`GenerationRegistry::reclaim`] once their reference count reached zero;
//! the registry never waits on workers.

use crate::error::{DetectError, Result};
use crate::generation::{Generation, GenerationId};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::ops::Deref;
use std::sync::Arc;

/// Counted handle on a generation; the count is released on drop
pub struct GenerationRef {
    generation: Arc<Generation>,
}

impl GenerationRef {
    /// Take a reference on `generation`
    pub(crate) fn acquire(generation: &Arc<Generation>) -> Self {
        generation.acquire();
        Self {
            generation: generation.clone(),
        }
    }

    pub fn arc(&self) -> &Arc<Generation> {
        &self.generation
    }
}

impl Deref for GenerationRef {
    type Target = Generation;

    fn deref(&self) -> &Generation {
        &self.generation
    }
}

impl Clone for GenerationRef {
    fn clone(&self) -> Self {
        Self::acquire(&self.generation)
    }
}

impl Drop for GenerationRef {
    fn drop(&mut self) {
        self.generation.release();
    }
}

impl std::fmt::Debug for GenerationRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("GenerationRef").field(&self.generation.id()).finish()
    }
}

#[derive(Default)]
struct Lists {
    /// Front is the active generation
    live: VecDeque<Arc<Generation>>,
    retired: Vec<Arc<Generation>>,
}

impl Lists {
    fn contains(&self, id: GenerationId) -> bool {
        self.live.iter().chain(self.retired.iter()).any(|g| g.id() == id)
    }
}

/// Process-scoped generation registry
#[derive(Default)]
pub struct GenerationRegistry {
    lists: Mutex<Lists>,
}

impl GenerationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `generation` the active one. The previously active generation
    /// stays live until it is retired.
    pub fn publish(&self, generation: Arc<Generation>) -> Result<()> {
        let mut lists = self.lists.lock();
        if lists.contains(generation.id()) {
            return Err(DetectError::DuplicateGeneration(generation.id()));
        }
        // Registry hold
        generation.acquire();
        tracing::info!(
            id = %generation.id(),
            refs = generation.ref_count(),
            "Published detection generation"
        );
        lists.live.push_front(generation);
        Ok(())
    }

    /// Active generation, counted for the caller
    pub fn current(&self) -> Option<GenerationRef> {
        let lists = self.lists.lock();
        lists.live.front().map(GenerationRef::acquire)
    }

    pub fn active_id(&self) -> Option<GenerationId> {
        self.lists.lock().live.front().map(|g| g.id())
    }

    /// Whether any generation is live
    pub fn is_enabled(&self) -> bool {
        !self.lists.lock().live.is_empty()
    }

    pub fn live_ids(&self) -> Vec<GenerationId> {
        self.lists.lock().live.iter().map(|g| g.id()).collect()
    }

    pub fn retired_ids(&self) -> Vec<GenerationId> {
        self.lists.lock().retired.iter().map(|g| g.id()).collect()
    }

    /// Move a live generation to the retired list, dropping the registry hold
    pub fn retire(&self, id: GenerationId) -> Result<()> {
        let mut lists = self.lists.lock();
        if lists.retired.iter().any(|g| g.id() == id) {
            return Err(DetectError::AlreadyRetired(id));
        }
        let pos = lists
            .live
            .iter()
            .position(|g| g.id() == id)
            .ok_or(DetectError::NotLive(id))?;
        if lists.live.len() == 1 {
            return Err(DetectError::LastLiveGeneration(id));
        }

        if let Some(generation) = lists.live.remove(pos) {
            generation.release();
            tracing::info!(id = %id, refs = generation.ref_count(), "Retired detection generation");
            lists.retired.push(generation);
        }
        Ok(())
    }

    /// Destroy retired generations nobody references any more
    pub fn reclaim(&self) -> Vec<GenerationId> {
        let mut lists = self.lists.lock();
        let mut freed = Vec::new();
        lists.retired.retain(|generation| {
            if generation.ref_count() == 0 {
                freed.push(generation.id());
                false
            } else {
                true
            }
        });
        if !freed.is_empty() {
            tracing::info!(freed = ?freed, remaining = lists.retired.len(), "Reclaimed generations");
        }
        freed
    }

    /// Unlink everything at shutdown; returns generations that were still
    /// referenced
    pub fn drain(&self) -> Vec<GenerationId> {
        let mut guard = self.lists.lock();
        let lists = &mut *guard;
        for generation in lists.live.drain(..) {
            generation.release();
            lists.retired.push(generation);
        }
        let busy: Vec<GenerationId> = lists
            .retired
            .iter()
            .filter(|g| g.ref_count() > 0)
            .map(|g| g.id())
            .collect();
        if !busy.is_empty() {
            tracing::warn!(busy = ?busy, "Generations still referenced at shutdown");
        }
        lists.retired.clear();
        busy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigStore;
    use crate::generation::GenerationBuilder;
    use proptest::prelude::*;
    use sase_ips::RuleCompiler;

    fn builder() -> GenerationBuilder {
        GenerationBuilder::new(Arc::new(RuleCompiler::default()))
    }

    fn generation(builder: &GenerationBuilder) -> Arc<Generation> {
        let config = ConfigStore::new();
        Arc::new(
            builder
                .build(&config, "alert tcp any any -> any any (content:\"x\"; sid:1;)")
                .unwrap(),
        )
    }

    #[test]
    fn test_publish_and_current() {
        let registry = GenerationRegistry::new();
        assert!(registry.current().is_none());
        assert!(!registry.is_enabled());

        let b = builder();
        let g1 = generation(&b);
        registry.publish(g1.clone()).unwrap();
        assert_eq!(g1.ref_count(), 1);

        {
            let current = registry.current().unwrap();
            assert_eq!(current.id(), g1.id());
            assert_eq!(g1.ref_count(), 2);
        }
        assert_eq!(g1.ref_count(), 1);

        assert!(matches!(
            registry.publish(g1.clone()),
            Err(DetectError::DuplicateGeneration(_))
        ));
    }

    #[test]
    fn test_publish_does_not_retire_previous() {
        let registry = GenerationRegistry::new();
        let b = builder();
        let g1 = generation(&b);
        let g2 = generation(&b);
        registry.publish(g1.clone()).unwrap();
        registry.publish(g2.clone()).unwrap();

        assert_eq!(registry.active_id(), Some(g2.id()));
        assert_eq!(registry.live_ids(), vec![g2.id(), g1.id()]);
        assert!(registry.retired_ids().is_empty());
    }

    #[test]
    fn test_retire_errors() {
        let registry = GenerationRegistry::new();
        let b = builder();
        let g1 = generation(&b);
        let g2 = generation(&b);
        let never = generation(&b);

        registry.publish(g1.clone()).unwrap();
        assert!(matches!(registry.retire(g1.id()), Err(DetectError::LastLiveGeneration(_))));
        assert!(matches!(registry.retire(never.id()), Err(DetectError::NotLive(_))));

        registry.publish(g2.clone()).unwrap();
        registry.retire(g1.id()).unwrap();
        assert!(matches!(registry.retire(g1.id()), Err(DetectError::AlreadyRetired(_))));
        // Retired ids stay reserved until reclaimed
        assert!(matches!(
            registry.publish(g1.clone()),
            Err(DetectError::DuplicateGeneration(_))
        ));
    }

    #[test]
    fn test_swap_sequence_reclaims_old_generation() {
        let registry = GenerationRegistry::new();
        let b = builder();
        let g1 = generation(&b);
        registry.publish(g1.clone()).unwrap();

        let worker_binding = registry.current().unwrap();
        assert_eq!(g1.ref_count(), 2);

        let g2 = generation(&b);
        registry.publish(g2.clone()).unwrap();
        let new_binding = registry.current().unwrap();
        assert_eq!(new_binding.id(), g2.id());

        drop(worker_binding);
        assert_eq!(g1.ref_count(), 1);

        registry.retire(g1.id()).unwrap();
        assert_eq!(g1.ref_count(), 0);
        assert_eq!(registry.reclaim(), vec![g1.id()]);
        assert!(registry.retired_ids().is_empty());
        assert_eq!(registry.active_id(), Some(g2.id()));
    }

    #[test]
    fn test_reclaim_keeps_referenced() {
        let registry = GenerationRegistry::new();
        let b = builder();
        let g1 = generation(&b);
        let g2 = generation(&b);
        registry.publish(g1.clone()).unwrap();
        let binding = registry.current().unwrap();
        registry.publish(g2).unwrap();
        registry.retire(g1.id()).unwrap();

        assert!(registry.reclaim().is_empty());
        assert_eq!(registry.retired_ids(), vec![g1.id()]);

        drop(binding);
        assert_eq!(registry.reclaim(), vec![g1.id()]);
    }

    #[test]
    fn test_drain_reports_busy() {
        let registry = GenerationRegistry::new();
        let b = builder();
        let g1 = generation(&b);
        registry.publish(g1.clone()).unwrap();
        let binding = registry.current().unwrap();

        assert_eq!(registry.drain(), vec![g1.id()]);
        assert!(!registry.is_enabled());
        drop(binding);
        assert_eq!(g1.ref_count(), 0);
    }

    #[derive(Clone, Debug)]
    enum Op {
        Adopt,
        Release(usize),
        Swap,
        Reclaim,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            Just(Op::Adopt),
            any::<usize>().prop_map(Op::Release),
            Just(Op::Swap),
            Just(Op::Reclaim),
        ]
    }

    proptest! {
        #[test]
        fn prop_reclaim_only_frees_unreferenced(ops in proptest::collection::vec(op(), 1..64)) {
            let registry = GenerationRegistry::new();
            let b = builder();
            let mut all = vec![generation(&b)];
            registry.publish(all[0].clone()).unwrap();
            let mut bindings: Vec<GenerationRef> = Vec::new();

            for op in ops {
                match op {
                    Op::Adopt => bindings.extend(registry.current()),
                    Op::Release(i) if !bindings.is_empty() => {
                        let idx = i % bindings.len();
                        bindings.swap_remove(idx);
                    }
                    Op::Release(_) => {}
                    Op::Swap => {
                        let old = registry.active_id().unwrap();
                        let next = generation(&b);
                        registry.publish(next.clone()).unwrap();
                        all.push(next);
                        registry.retire(old).unwrap();
                    }
                    Op::Reclaim => {
                        let freed = registry.reclaim();
                        for id in freed {
                            // Freed generations are unreferenced and not live
                            prop_assert!(!bindings.iter().any(|r| r.id() == id));
                            prop_assert!(!registry.live_ids().contains(&id));
                            let g = all.iter().find(|g| g.id() == id).unwrap();
                            prop_assert_eq!(g.ref_count(), 0);
                        }
                    }
                }

                // Active generation is never absent
                prop_assert!(registry.active_id().is_some());
            }

            drop(bindings);
            registry.reclaim();
            prop_assert!(registry.retired_ids().is_empty());
        }
    }
}
