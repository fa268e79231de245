//! Detection generations
//!
//! A [`Generation`] is one complete compiled ruleset plus the grouping
//! configuration it was built with. It is immutable once published apart
//! from its reference count, which tracks the registry's hold and every
//! worker state bound to it.

use crate::config::{is_true, ConfigSource, ConfigView, PrefixGuard};
use crate::error::{DetectError, Result};
use crate::keyword::{KeywordId, KeywordInit, KeywordMode, KeywordRegistry, KeywordTeardown};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use sase_ips::{CompileOptions, CompiledRuleset, MatcherDimensions, RuleCompiler};
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// Default nested content inspection limit
pub const DEFAULT_RECURSION_LIMIT: u32 = 3000;

/// Matching algorithms whose contexts can be shared between groups
const SHAREABLE_MPM_ALGOS: [&str; 3] = ["ac", "ac-bs", "ac-gfbs"];

const DEFAULT_MPM_ALGO: &str = "ac";

/// Unique, monotonic generation identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GenerationId(pub u64);

impl fmt::Display for GenerationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Maximum distinct rule groups per address role, one direction
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct DirectionLimits {
    pub src: u16,
    pub dst: u16,
    pub sp: u16,
    pub dp: u16,
}

impl DirectionLimits {
    const fn new(src: u16, dst: u16, sp: u16, dp: u16) -> Self {
        Self { src, dst, sp, dp }
    }
}

/// Grouping limits for both directions
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct GroupingLimits {
    pub to_client: DirectionLimits,
    pub to_server: DirectionLimits,
}

impl GroupingLimits {
    pub const LOW: Self = Self {
        to_client: DirectionLimits::new(2, 2, 2, 3),
        to_server: DirectionLimits::new(2, 2, 2, 3),
    };
    pub const MEDIUM: Self = Self {
        to_client: DirectionLimits::new(4, 4, 4, 6),
        to_server: DirectionLimits::new(4, 8, 4, 30),
    };
    pub const HIGH: Self = Self {
        to_client: DirectionLimits::new(15, 15, 15, 20),
        to_server: DirectionLimits::new(15, 15, 15, 40),
    };
}

impl Default for GroupingLimits {
    fn default() -> Self {
        Self::MEDIUM
    }
}

/// Grouping profile
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Profile {
    Low,
    Medium,
    High,
    Custom,
}

impl Profile {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            "custom" => Some(Self::Custom),
            _ => None,
        }
    }

    /// Fixed table; `Custom` starts from the medium values
    pub fn limits(self) -> GroupingLimits {
        match self {
            Self::Low => GroupingLimits::LOW,
            Self::Medium | Self::Custom => GroupingLimits::MEDIUM,
            Self::High => GroupingLimits::HIGH,
        }
    }
}

/// Nested content inspection limit
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum RecursionLimit {
    Limited(u32),
    Unlimited,
}

impl Default for RecursionLimit {
    fn default() -> Self {
        Self::Limited(DEFAULT_RECURSION_LIMIT)
    }
}

/// Matcher context sharing strategy
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MpmContext {
    /// One context shared by all signature groups
    Single,
    /// One context per signature group
    Full,
}

/// Configuration a generation was built with
#[derive(Clone, Debug, Serialize)]
pub struct GenerationSettings {
    pub profile: Profile,
    pub limits: GroupingLimits,
    pub recursion_limit: RecursionLimit,
    pub mpm_context: MpmContext,
    pub mpm_algo: String,
    pub failure_fatal: bool,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            profile: Profile::Medium,
            limits: GroupingLimits::MEDIUM,
            recursion_limit: RecursionLimit::default(),
            mpm_context: MpmContext::Single,
            mpm_algo: DEFAULT_MPM_ALGO.to_string(),
            failure_fatal: false,
        }
    }
}

/// Resolve `detect-engine.profile` and, for `custom`, the eight limits
pub fn resolve_grouping(config: &dyn ConfigSource) -> (Profile, GroupingLimits) {
    let profile = match config.get_scalar("detect-engine.profile") {
        None => Profile::Medium,
        Some(name) => Profile::from_str(&name).unwrap_or_else(|| {
            tracing::warn!(profile = %name, "Unknown detect-engine profile, using medium");
            Profile::Medium
        }),
    };

    let mut limits = profile.limits();
    if profile == Profile::Custom {
        let custom = config.get_subtree("detect-engine.custom-values");
        let custom = custom.as_ref();
        let medium = GroupingLimits::MEDIUM;
        limits.to_client.src = custom_value(custom, "toclient", "src", medium.to_client.src);
        limits.to_client.dst = custom_value(custom, "toclient", "dst", medium.to_client.dst);
        limits.to_client.sp = custom_value(custom, "toclient", "sp", medium.to_client.sp);
        limits.to_client.dp = custom_value(custom, "toclient", "dp", medium.to_client.dp);
        limits.to_server.src = custom_value(custom, "toserver", "src", medium.to_server.src);
        limits.to_server.dst = custom_value(custom, "toserver", "dst", medium.to_server.dst);
        limits.to_server.sp = custom_value(custom, "toserver", "sp", medium.to_server.sp);
        limits.to_server.dp = custom_value(custom, "toserver", "dp", medium.to_server.dp);
    }

    tracing::debug!(?profile, ?limits, "Resolved grouping profile");
    (profile, limits)
}

fn custom_value(custom: Option<&Value>, direction: &str, role: &str, fallback: u16) -> u16 {
    let dashed = format!("{}-{}-groups", direction, role);
    let underscored = format!("{}_{}_groups", direction, role);

    let node = custom.and_then(|c| c.get(dashed.as_str()).or_else(|| c.get(underscored.as_str())));
    let text = match node {
        None => return fallback,
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        Some(other) => format!("{:?}", other),
    };

    match text.trim().parse::<u16>() {
        Ok(value) => value,
        Err(_) => {
            tracing::warn!(
                key = %dashed,
                value = %text,
                fallback,
                "Invalid custom group value, using medium profile value"
            );
            fallback
        }
    }
}

/// Resolve `detect-engine.inspection-recursion-limit`
pub fn resolve_recursion_limit(config: &dyn ConfigSource) -> RecursionLimit {
    let Some(raw) = config.get_scalar("detect-engine.inspection-recursion-limit") else {
        return RecursionLimit::default();
    };
    let raw = raw.trim();
    if raw.is_empty() {
        return RecursionLimit::Unlimited;
    }
    match raw.parse::<i64>() {
        Ok(0) => RecursionLimit::Unlimited,
        Ok(n) if n > 0 => RecursionLimit::Limited(u32::try_from(n).unwrap_or(u32::MAX)),
        Ok(n) => {
            tracing::warn!(value = n, "Negative inspection recursion limit, inspecting without limit");
            RecursionLimit::Unlimited
        }
        Err(_) => {
            tracing::warn!(value = raw, "Invalid inspection recursion limit, inspecting without limit");
            RecursionLimit::Unlimited
        }
    }
}

/// Resolve `detect-engine.sgh-mpm-context` against the selected `mpm-algo`
pub fn resolve_mpm_context(
    config: &dyn ConfigSource,
    mpm_algo: &str,
    test_mode: bool,
) -> Result<MpmContext> {
    let setting = config.get_scalar("detect-engine.sgh-mpm-context");
    let context = match setting.as_deref().map(str::trim) {
        None | Some("auto") => {
            if SHAREABLE_MPM_ALGOS.contains(&mpm_algo) {
                MpmContext::Single
            } else {
                MpmContext::Full
            }
        }
        Some("single") => MpmContext::Single,
        Some("full") => MpmContext::Full,
        Some(other) => {
            return Err(DetectError::Config(format!(
                "invalid sgh-mpm-context value '{}', expected single, full or auto",
                other
            )))
        }
    };

    if test_mode {
        return Ok(MpmContext::Full);
    }
    Ok(context)
}

/// What a compiler needs to know about the generation being built
#[derive(Clone, Debug)]
pub struct CompileRequest {
    pub limits: GroupingLimits,
    pub mpm_context: MpmContext,
    pub failure_fatal: bool,
}

/// Ruleset compiler interface
pub trait RulesetCompiler: Send + Sync {
    fn compile(&self, rule_text: &str, request: &CompileRequest) -> Result<CompiledRuleset>;
}

impl RulesetCompiler for RuleCompiler {
    fn compile(&self, rule_text: &str, request: &CompileRequest) -> Result<CompiledRuleset> {
        let options = CompileOptions {
            failure_fatal: request.failure_fatal,
            shared_context: request.mpm_context == MpmContext::Single,
            port_group_limit: request.limits.to_server.dp,
        };
        Ok(RuleCompiler::new(options).compile(rule_text)?)
    }
}

/// Where rule text comes from
pub trait RuleSource: Send + Sync {
    fn load(&self, config: &dyn ConfigSource) -> Result<String>;
}

/// Rules held in memory
#[derive(Clone, Debug, Default)]
pub struct StaticRules(pub String);

impl RuleSource for StaticRules {
    fn load(&self, _config: &dyn ConfigSource) -> Result<String> {
        Ok(self.0.clone())
    }
}

/// Rules read from `rule-files` under `default-rule-path`
#[derive(Clone, Debug, Default)]
pub struct RuleFiles;

impl RuleSource for RuleFiles {
    fn load(&self, config: &dyn ConfigSource) -> Result<String> {
        let base = config
            .get_scalar("default-rule-path")
            .map(PathBuf::from)
            .unwrap_or_default();

        let files: Vec<String> = match config.get_subtree("rule-files") {
            Some(Value::Sequence(seq)) => seq
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            Some(Value::String(single)) => vec![single],
            _ => {
                tracing::warn!("No rule files configured");
                Vec::new()
            }
        };

        let mut text = String::new();
        for file in files {
            let path = base.join(&file);
            match std::fs::read_to_string(&path) {
                Ok(content) => {
                    text.push_str(&content);
                    text.push('\n');
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to read rule file");
                }
            }
        }
        Ok(text)
    }
}

/// One compiled ruleset generation
pub struct Generation {
    id: GenerationId,
    settings: GenerationSettings,
    /// `None` for minimal generations
    ruleset: Option<CompiledRuleset>,
    keywords: KeywordRegistry,
    prefix: Option<PrefixGuard>,
    refs: AtomicU32,
    built_at: DateTime<Utc>,
}

impl Generation {
    pub fn id(&self) -> GenerationId {
        self.id
    }

    pub fn settings(&self) -> &GenerationSettings {
        &self.settings
    }

    pub fn ruleset(&self) -> Option<&CompiledRuleset> {
        self.ruleset.as_ref()
    }

    /// Built without rules; detection is effectively disabled
    pub fn is_minimal(&self) -> bool {
        self.ruleset.is_none()
    }

    pub fn dimensions(&self) -> MatcherDimensions {
        self.ruleset
            .as_ref()
            .map(|r| r.dimensions)
            .unwrap_or_default()
    }

    pub fn signature_count(&self) -> usize {
        self.ruleset.as_ref().map_or(0, |r| r.signature_count())
    }

    pub fn keywords(&self) -> &KeywordRegistry {
        &self.keywords
    }

    pub fn config_prefix(&self) -> Option<&str> {
        self.prefix.as_ref().map(|p| p.prefix())
    }

    pub fn built_at(&self) -> DateTime<Utc> {
        self.built_at
    }

    /// Registry hold plus bound worker states
    pub fn ref_count(&self) -> u32 {
        self.refs.load(Ordering::Acquire)
    }

    pub(crate) fn acquire(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn release(&self) {
        let prev = self.refs.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "generation {} reference count underflow", self.id);
    }
}

impl fmt::Debug for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Generation")
            .field("id", &self.id)
            .field("minimal", &self.is_minimal())
            .field("signatures", &self.signature_count())
            .field("refs", &self.ref_count())
            .field("prefix", &self.config_prefix())
            .finish()
    }
}

impl Drop for Generation {
    fn drop(&mut self) {
        tracing::debug!(id = %self.id, prefix = ?self.config_prefix(), "Generation destroyed");
    }
}

/// Builds generations from configuration and rule text
pub struct GenerationBuilder {
    compiler: Arc<dyn RulesetCompiler>,
    next_id: AtomicU64,
    keywords: Mutex<KeywordRegistry>,
    test_mode: bool,
}

impl GenerationBuilder {
    pub fn new(compiler: Arc<dyn RulesetCompiler>) -> Self {
        Self {
            compiler,
            next_id: AtomicU64::new(1),
            keywords: Mutex::new(KeywordRegistry::new()),
            test_mode: false,
        }
    }

    /// Test-mode builds always use per-group matcher contexts
    pub fn with_test_mode(mut self, test_mode: bool) -> Self {
        self.test_mode = test_mode;
        self
    }

    /// Register a keyword sub-context attached to every generation built
    /// from now on
    pub fn register_keyword(
        &self,
        name: &str,
        init: KeywordInit,
        teardown: KeywordTeardown,
        mode: KeywordMode,
    ) -> KeywordId {
        self.keywords.lock().register(name, init, teardown, mode)
    }

    fn next_id(&self) -> GenerationId {
        GenerationId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Resolve every setting a build depends on
    pub fn resolve_settings(
        &self,
        root: &dyn ConfigSource,
        view: &dyn ConfigSource,
    ) -> Result<GenerationSettings> {
        let (profile, limits) = resolve_grouping(view);
        let recursion_limit = resolve_recursion_limit(view);
        let mpm_algo = root
            .get_scalar("mpm-algo")
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_MPM_ALGO.to_string());
        let mpm_context = resolve_mpm_context(view, &mpm_algo, self.test_mode)?;
        let failure_fatal = root
            .get_scalar("engine.init-failure-fatal")
            .map(|v| is_true(&v))
            .unwrap_or(false);

        Ok(GenerationSettings {
            profile,
            limits,
            recursion_limit,
            mpm_context,
            mpm_algo,
            failure_fatal,
        })
    }

    /// Build a generation from the unprefixed configuration
    pub fn build(&self, config: &dyn ConfigSource, rule_text: &str) -> Result<Generation> {
        self.build_with_prefix(config, None, rule_text)
    }

    /// Build a generation whose `detect-engine` settings are read under the
    /// guard's prefix; the prefix is removed again when the generation (or
    /// the failed build) is dropped
    pub fn build_with_prefix(
        &self,
        config: &dyn ConfigSource,
        prefix: Option<PrefixGuard>,
        rule_text: &str,
    ) -> Result<Generation> {
        let settings = {
            let view = ConfigView::new(config, prefix.as_ref().map(|p| p.prefix()));
            self.resolve_settings(config, &view)?
        };

        let request = CompileRequest {
            limits: settings.limits,
            mpm_context: settings.mpm_context,
            failure_fatal: settings.failure_fatal,
        };
        let ruleset = self.compiler.compile(rule_text, &request)?;

        let generation = Generation {
            id: self.next_id(),
            settings,
            ruleset: Some(ruleset),
            keywords: self.keywords.lock().clone(),
            prefix,
            refs: AtomicU32::new(0),
            built_at: Utc::now(),
        };

        tracing::info!(
            id = %generation.id,
            signatures = generation.signature_count(),
            profile = ?generation.settings.profile,
            mpm_context = ?generation.settings.mpm_context,
            prefix = ?generation.config_prefix(),
            "Built detection generation"
        );

        Ok(generation)
    }

    /// Rule-less generation used while detection is disabled
    pub fn build_minimal(&self) -> Generation {
        let generation = Generation {
            id: self.next_id(),
            settings: GenerationSettings::default(),
            ruleset: None,
            keywords: KeywordRegistry::new(),
            prefix: None,
            refs: AtomicU32::new(0),
            built_at: Utc::now(),
        };
        tracing::info!(id = %generation.id, "Built minimal detection generation");
        generation
    }
}
