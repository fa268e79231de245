//! OpenSASE Detection Engine - Live Ruleset Reload
//!
//! Replaces the compiled ruleset of a running multi-threaded inspection
//! pipeline without stopping traffic and without any worker ever touching a
//! freed ruleset.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        DETECT ENGINE                             │
//! │                                                                  │
//! │  reload-rules ──► ReloadSyncer ──► GenerationBuilder             │
//! │                                        │ build (prefixed config) │
//! │                                        ▼                         │
//! │                               ┌─────────────────┐                │
//! │                               │GenerationRegistry│               │
//! │                               │ live:  G2 → G1   │               │
//! │                               │ retired: [...]   │               │
//! │                               └────────┬────────┘                │
//! │                                        │ SwapOrchestrator        │
//! │          ┌─────────────────────────────┼──────────────────┐      │
//! │          ▼                             ▼                  ▼      │
//! │   ┌─────────────┐               ┌─────────────┐   ┌─────────────┐│
//! │   │  Worker 1   │               │  Worker 2   │   │  Worker N   ││
//! │   │ slot ◄─ G2  │               │ slot ◄─ G2  │   │ slot ◄─ G2  ││
//! │   │ ack  ─► G1  │               │ ack  ─► G1  │   │ ack  ─► G1  ││
//! │   └─────────────┘               └─────────────┘   └─────────────┘│
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Reload cycle
//!
//! 1. Build a generation from the (optionally prefixed) configuration
//! 2. Build a replacement worker state per inspection worker
//! 3. Publish the generation
//! 4. Hand replacements over; workers pick them up on their next record
//! 5. Release the old states the workers hand back
//! 6. Retire the old generation and reclaim everything unreferenced

pub mod config;
#[cfg(unix)]
pub mod control;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod generation;
pub mod inspect;
pub mod keyword;
pub mod registry;
pub mod swap;
pub mod sync;
pub mod threads;
pub mod worker;

pub use config::{ConfigSource, ConfigStore, ConfigView, PrefixGuard, ReloadConfig};
pub use dispatch::{AppInspector, Direction, DispatchTable, DispatchTableBuilder, InspectEngine, InspectFlags};
pub use engine::{DetectEngine, EngineStatus};
pub use error::{DetectError, Result};
pub use generation::{
    Generation, GenerationBuilder, GenerationId, GenerationSettings, GroupingLimits, MpmContext,
    Profile, RecursionLimit, RuleFiles, RuleSource, RulesetCompiler, StaticRules,
};
pub use inspect::{inspect_record, Record};
pub use keyword::{KeywordContext, KeywordId, KeywordMode};
pub use registry::{GenerationRef, GenerationRegistry};
pub use swap::{SwapOrchestrator, SwapReport};
pub use sync::{ReloadSyncer, SyncState};
pub use threads::{DetectEvent, DetectWorker, StageDescriptor, StageKind, ThreadRegistry, WorkerThread};
pub use worker::{AdoptionMarker, WorkerState};
