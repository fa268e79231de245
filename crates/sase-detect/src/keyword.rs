//! Keyword sub-contexts
//!
//! Some rule keywords need per-worker scratch of their own. They register an
//! init/teardown pair on the generation while it is being built; every
//! worker state adopting the generation then instantiates one context per
//! registration.

use crate::error::{DetectError, Result};
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Worker-local keyword context
pub type KeywordContext = Box<dyn Any + Send>;

pub type KeywordInit = Arc<dyn Fn() -> Option<KeywordContext> + Send + Sync>;
pub type KeywordTeardown = Arc<dyn Fn(KeywordContext) + Send + Sync>;

/// How registrations with the same name are treated
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeywordMode {
    /// Every registration gets its own context
    PerInstance,
    /// Registrations with the same name share one context per worker
    Shared,
}

/// Handle returned by registration, used to fetch the context at runtime
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct KeywordId(usize);

#[derive(Clone)]
struct KeywordEntry {
    name: String,
    init: KeywordInit,
    teardown: KeywordTeardown,
    mode: KeywordMode,
}

/// Keyword registrations of one generation
#[derive(Clone, Default)]
pub struct KeywordRegistry {
    entries: Vec<KeywordEntry>,
}

impl KeywordRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        name: &str,
        init: KeywordInit,
        teardown: KeywordTeardown,
        mode: KeywordMode,
    ) -> KeywordId {
        if mode == KeywordMode::Shared {
            if let Some(idx) = self
                .entries
                .iter()
                .position(|e| e.mode == KeywordMode::Shared && e.name == name)
            {
                return KeywordId(idx);
            }
        }
        self.entries.push(KeywordEntry {
            name: name.to_string(),
            init,
            teardown,
            mode,
        });
        KeywordId(self.entries.len() - 1)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Create one context per registration. On failure the contexts created
    /// so far are torn down before the error is returned.
    pub fn instantiate(&self) -> Result<KeywordContexts> {
        let mut contexts = KeywordContexts {
            slots: Vec::new(),
        };
        contexts
            .slots
            .try_reserve_exact(self.entries.len())
            .map_err(|e| DetectError::ResourceExhausted(e.to_string()))?;

        for entry in &self.entries {
            match (entry.init)() {
                Some(ctx) => contexts.slots.push((Some(ctx), entry.teardown.clone())),
                None => {
                    tracing::warn!(keyword = %entry.name, "Keyword context init failed");
                    // Dropping `contexts` tears down what was created
                    return Err(DetectError::KeywordInit(entry.name.clone()));
                }
            }
        }
        Ok(contexts)
    }
}

impl fmt::Debug for KeywordRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|e| (&e.name, e.mode)))
            .finish()
    }
}

/// Instantiated keyword contexts of one worker state
pub struct KeywordContexts {
    slots: Vec<(Option<KeywordContext>, KeywordTeardown)>,
}

impl KeywordContexts {
    pub fn get<T: 'static>(&self, id: KeywordId) -> Option<&T> {
        self.slots
            .get(id.0)
            .and_then(|(ctx, _)| ctx.as_ref())
            .and_then(|ctx| ctx.downcast_ref())
    }

    pub fn get_mut<T: 'static>(&mut self, id: KeywordId) -> Option<&mut T> {
        self.slots
            .get_mut(id.0)
            .and_then(|(ctx, _)| ctx.as_mut())
            .and_then(|ctx| ctx.downcast_mut())
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

impl Drop for KeywordContexts {
    fn drop(&mut self) {
        for (ctx, teardown) in self.slots.iter_mut() {
            if let Some(ctx) = ctx.take() {
                teardown(ctx);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting(
        created: &Arc<AtomicUsize>,
        destroyed: &Arc<AtomicUsize>,
    ) -> (KeywordInit, KeywordTeardown) {
        let c = created.clone();
        let d = destroyed.clone();
        (
            Arc::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
                Some(Box::new(0u64) as KeywordContext)
            }),
            Arc::new(move |_ctx: KeywordContext| {
                d.fetch_add(1, Ordering::SeqCst);
            }),
        )
    }

    #[test]
    fn test_shared_mode_reuses_registration() {
        let created = Arc::new(AtomicUsize::new(0));
        let destroyed = Arc::new(AtomicUsize::new(0));
        let mut registry = KeywordRegistry::new();

        let (init, teardown) = counting(&created, &destroyed);
        let a = registry.register("flowbits", init.clone(), teardown.clone(), KeywordMode::Shared);
        let b = registry.register("flowbits", init.clone(), teardown.clone(), KeywordMode::Shared);
        let c = registry.register("pcre", init.clone(), teardown.clone(), KeywordMode::PerInstance);
        let d = registry.register("pcre", init, teardown, KeywordMode::PerInstance);

        assert_eq!(a, b);
        assert_ne!(c, d);
        assert_eq!(registry.len(), 3);

        let mut contexts = registry.instantiate().unwrap();
        assert_eq!(created.load(Ordering::SeqCst), 3);
        *contexts.get_mut::<u64>(a).unwrap() += 5;
        assert_eq!(contexts.get::<u64>(b), Some(&5));
        assert!(contexts.get::<String>(a).is_none());

        drop(contexts);
        assert_eq!(destroyed.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_failed_init_tears_down_partial() {
        let created = Arc::new(AtomicUsize::new(0));
        let destroyed = Arc::new(AtomicUsize::new(0));
        let mut registry = KeywordRegistry::new();

        let (init, teardown) = counting(&created, &destroyed);
        registry.register("ok", init, teardown.clone(), KeywordMode::PerInstance);
        let broken: KeywordInit = Arc::new(|| -> Option<KeywordContext> { None });
        registry.register("broken", broken, teardown, KeywordMode::PerInstance);

        assert!(matches!(
            registry.instantiate(),
            Err(DetectError::KeywordInit(name)) if name == "broken"
        ));
        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert_eq!(destroyed.load(Ordering::SeqCst), 1);
    }
}
