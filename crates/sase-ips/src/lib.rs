//! OpenSASE Signature Compiler
//!
//! Parses Suricata/Snort style rule text and compiles it into an immutable
//! [`CompiledRuleset`]: the multi-pattern matcher handle, the duplicate
//! signature index and the per-protocol signature group heads that a
//! detection generation owns.
//!
//! ## Features
//!
//! - **Rule Parser**: header + option parsing, sticky buffer modifiers
//! - **Rule Compiler**: per rule-list Aho-Corasick automata plus pcre fallback
//! - **Shared or per-group matcher contexts**: `single` / `full`

pub mod compiler;
pub mod lists;
pub mod parser;

pub use compiler::{
    CompileOptions, CompiledRuleset, DuplicateIndex, GroupHeads, MatcherDimensions,
    PatternMatcher, RuleCompiler, Signature,
};
pub use lists::{AppProto, SigList, TransportClass};
pub use parser::{ContentPattern, PcrePattern, Protocol, RuleAction, RuleParser, SuricataRule};

use thiserror::Error;

/// Signature compiler errors
#[derive(Error, Debug)]
pub enum IpsError {
    #[error("Rule parsing error: {0}")]
    ParseError(String),

    #[error("Compilation error: {0}")]
    CompileError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid rule: {0}")]
    InvalidRule(String),

    #[error("Pattern too complex: {0}")]
    PatternTooComplex(String),
}

pub type Result<T> = std::result::Result<T, IpsError>;
