//! Ruleset Compiler
//!
//! Compiles parsed Suricata rules into an immutable [`CompiledRuleset`]:
//! per rule-list Aho-Corasick automata with a regex fallback for pcre, the
//! duplicate signature index and the per-protocol signature group heads.
//! A compiled ruleset is never mutated; a reload compiles a new one.

use crate::lists::{AppProto, SigList, TransportClass};
use crate::parser::{Protocol, RuleAction, RuleParser, SuricataRule};
use crate::{IpsError, Result};
use aho_corasick::{AhoCorasick, AhoCorasickBuilder};
use regex::bytes::{Regex, RegexBuilder};
use std::collections::{HashMap, HashSet};
use std::time::Instant;

/// Compile-size ceiling for a single pcre
const PCRE_SIZE_LIMIT: usize = 1 << 20;

/// Compiler options
#[derive(Clone, Debug)]
pub struct CompileOptions {
    /// Any rule that fails to parse or compile fails the whole ruleset
    pub failure_fatal: bool,
    /// One matcher context per rule list shared by all groups (`single`),
    /// instead of one per group and list (`full`)
    pub shared_context: bool,
    /// Distinct destination-port groups kept per protocol before ports are
    /// merged into the catch-all group
    pub port_group_limit: u16,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            failure_fatal: false,
            shared_context: true,
            port_group_limit: 30,
        }
    }
}

/// Signature metadata kept after compilation
#[derive(Clone, Debug)]
pub struct Signature {
    /// Dense internal id, index into [`CompiledRuleset::signatures`]
    pub id: u32,
    pub sid: u32,
    pub gid: u32,
    pub rev: u32,
    pub action: RuleAction,
    pub msg: String,
    pub protocol: Protocol,
    pub transport: Option<TransportClass>,
    pub app: AppProto,
    /// Whether the signature is reachable through the matcher prefilter
    pub prefiltered: bool,
}

impl Signature {
    pub fn is_blocking(&self) -> bool {
        self.action.is_blocking()
    }
}

/// (gid, sid) → revision of the kept signature
#[derive(Clone, Debug, Default)]
pub struct DuplicateIndex {
    entries: HashMap<(u32, u32), (u32, u32)>,
    dropped: usize,
}

impl DuplicateIndex {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, gid: u32, sid: u32) -> bool {
        self.entries.contains_key(&(gid, sid))
    }

    /// Revision kept for (gid, sid)
    pub fn revision(&self, gid: u32, sid: u32) -> Option<u32> {
        self.entries.get(&(gid, sid)).map(|(rev, _)| *rev)
    }

    /// Number of rules dropped as duplicates
    pub fn dropped(&self) -> usize {
        self.dropped
    }
}

/// Per-protocol signature group heads
#[derive(Clone, Debug)]
pub struct GroupHeads {
    /// Indexed by `AppProto::index()`; `Unknown` holds generic signatures
    heads: Vec<Vec<u32>>,
    /// Distinct destination-port groups per protocol
    port_groups: Vec<usize>,
}

impl GroupHeads {
    fn new() -> Self {
        Self {
            heads: vec![Vec::new(); AppProto::COUNT],
            port_groups: vec![0; AppProto::COUNT],
        }
    }

    /// Signatures of `app`, generic signatures excluded
    pub fn group(&self, app: AppProto) -> &[u32] {
        &self.heads[app.index()]
    }

    /// Number of protocols with at least one signature
    pub fn len(&self) -> usize {
        self.heads.iter().filter(|h| !h.is_empty()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn port_groups(&self, app: AppProto) -> usize {
        self.port_groups[app.index()]
    }
}

/// Sizes a worker needs to allocate its scratch space for a ruleset
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MatcherDimensions {
    /// Content pattern id space (non-uri lists)
    pub content_max_id: u32,
    /// Stream/payload pattern id space
    pub stream_max_id: u32,
    /// Uri pattern id space
    pub uri_max_id: u32,
    /// Fast pattern queue size
    pub max_fp_id: u32,
    pub sig_count: u32,
    /// Signatures not reachable through the prefilter
    pub non_matcher_max: u32,
    pub byte_extract_max: u16,
}

/// Matcher for one rule list
struct ListMatcher {
    case_sensitive: Option<AhoCorasick>,
    case_sensitive_owners: Vec<u32>,
    nocase: Option<AhoCorasick>,
    nocase_owners: Vec<u32>,
    pcres: Vec<(Regex, u32)>,
}

impl ListMatcher {
    fn build(
        exact: Vec<(Vec<u8>, u32)>,
        nocase: Vec<(Vec<u8>, u32)>,
        pcres: Vec<(Regex, u32)>,
    ) -> Result<Self> {
        let (case_sensitive, case_sensitive_owners) = build_automaton(exact, false)?;
        let (nocase, nocase_owners) = build_automaton(nocase, true)?;
        Ok(Self {
            case_sensitive,
            case_sensitive_owners,
            nocase,
            nocase_owners,
            pcres,
        })
    }

    fn scan(&self, data: &[u8], mut accept: impl FnMut(u32)) {
        if let Some(ac) = &self.case_sensitive {
            for mat in ac.find_overlapping_iter(data) {
                accept(self.case_sensitive_owners[mat.pattern().as_usize()]);
            }
        }
        if let Some(ac) = &self.nocase {
            for mat in ac.find_overlapping_iter(data) {
                accept(self.nocase_owners[mat.pattern().as_usize()]);
            }
        }
        for (re, owner) in &self.pcres {
            if re.is_match(data) {
                accept(*owner);
            }
        }
    }
}

fn build_automaton(
    patterns: Vec<(Vec<u8>, u32)>,
    ascii_nocase: bool,
) -> Result<(Option<AhoCorasick>, Vec<u32>)> {
    if patterns.is_empty() {
        return Ok((None, Vec::new()));
    }
    let (bytes, owners): (Vec<Vec<u8>>, Vec<u32>) = patterns.into_iter().unzip();
    let ac = AhoCorasickBuilder::new()
        .ascii_case_insensitive(ascii_nocase)
        .build(&bytes)
        .map_err(|e| IpsError::CompileError(e.to_string()))?;
    Ok((Some(ac), owners))
}

/// Opaque multi-pattern matcher handle
pub struct PatternMatcher {
    /// Keyed by (group, list); group is `Unknown` for shared contexts
    contexts: HashMap<(AppProto, SigList), ListMatcher>,
    shared: bool,
    /// Group membership lookup used to filter shared contexts
    sig_apps: Vec<AppProto>,
}

impl PatternMatcher {
    /// Whether contexts are shared between groups
    pub fn is_shared(&self) -> bool {
        self.shared
    }

    /// Number of matcher contexts
    pub fn context_count(&self) -> usize {
        self.contexts.len()
    }

    /// Scan `data` as buffer `list` of protocol group `group`, appending the
    /// ids of candidate signatures to `out` (sorted, deduplicated)
    pub fn scan(&self, group: AppProto, list: SigList, data: &[u8], out: &mut Vec<u32>) {
        let start = out.len();
        if self.shared {
            if let Some(ctx) = self.contexts.get(&(AppProto::Unknown, list)) {
                let sig_apps = &self.sig_apps;
                ctx.scan(data, |id| {
                    // Generic (transport-only) signatures apply to every group
                    let app = sig_apps[id as usize];
                    if app == AppProto::Unknown || app == group {
                        out.push(id);
                    }
                });
            }
        } else {
            if let Some(ctx) = self.contexts.get(&(group, list)) {
                ctx.scan(data, |id| out.push(id));
            }
            // Generic signatures live in the Unknown group
            if group != AppProto::Unknown {
                if let Some(ctx) = self.contexts.get(&(AppProto::Unknown, list)) {
                    ctx.scan(data, |id| out.push(id));
                }
            }
        }
        let mut found = out.split_off(start);
        found.sort_unstable();
        found.dedup();
        out.extend(found);
    }
}

impl std::fmt::Debug for PatternMatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PatternMatcher")
            .field("contexts", &self.contexts.len())
            .field("shared", &self.shared)
            .finish()
    }
}

/// Output of a ruleset compilation
#[derive(Debug)]
pub struct CompiledRuleset {
    pub matcher: PatternMatcher,
    pub duplicates: DuplicateIndex,
    pub groups: GroupHeads,
    pub signatures: Vec<Signature>,
    pub dimensions: MatcherDimensions,
    /// (line, error) for rules that were skipped
    pub rule_errors: Vec<(usize, String)>,
    pub compile_time_ms: u64,
}

impl CompiledRuleset {
    /// Ruleset without any signature
    pub fn empty(options: &CompileOptions) -> Self {
        Self {
            matcher: PatternMatcher {
                contexts: HashMap::new(),
                shared: options.shared_context,
                sig_apps: Vec::new(),
            },
            duplicates: DuplicateIndex::default(),
            groups: GroupHeads::new(),
            signatures: Vec::new(),
            dimensions: MatcherDimensions::default(),
            rule_errors: Vec::new(),
            compile_time_ms: 0,
        }
    }

    pub fn signature(&self, id: u32) -> Option<&Signature> {
        self.signatures.get(id as usize)
    }

    pub fn signature_count(&self) -> usize {
        self.signatures.len()
    }
}

/// Accumulates patterns per matcher context while signatures are added
#[derive(Default)]
struct ContextPatterns {
    exact: Vec<(Vec<u8>, u32)>,
    nocase: Vec<(Vec<u8>, u32)>,
    pcres: Vec<(Regex, u32)>,
}

/// Rule compiler
pub struct RuleCompiler {
    options: CompileOptions,
}

impl RuleCompiler {
    /// Create new compiler
    pub fn new(options: CompileOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &CompileOptions {
        &self.options
    }

    /// Parse and compile rule text
    pub fn compile(&self, rule_text: &str) -> Result<CompiledRuleset> {
        let mut parser = RuleParser::new();
        parser.parse_content(rule_text)?;
        let errors = parser.errors().to_vec();
        self.compile_rules(parser.into_rules(), errors)
    }

    /// Compile already parsed rules; `errors` are the parse failures that
    /// preceded them
    pub fn compile_rules(
        &self,
        rules: Vec<SuricataRule>,
        mut errors: Vec<(usize, String)>,
    ) -> Result<CompiledRuleset> {
        let start = Instant::now();

        // Resolve duplicates first: higher revision wins, ties keep the first
        let mut duplicates = DuplicateIndex::default();
        let mut kept: Vec<Option<SuricataRule>> = Vec::with_capacity(rules.len());
        for rule in rules {
            let key = (rule.gid, rule.sid);
            match duplicates.entries.get(&key).copied() {
                Some((rev, slot)) if rule.rev > rev => {
                    tracing::warn!(sid = rule.sid, old_rev = rev, new_rev = rule.rev, "Replacing duplicate signature");
                    kept[slot as usize] = None;
                    duplicates.entries.insert(key, (rule.rev, kept.len() as u32));
                    duplicates.dropped += 1;
                    kept.push(Some(rule));
                }
                Some((rev, _)) => {
                    tracing::warn!(sid = rule.sid, rev = rule.rev, kept_rev = rev, "Dropping duplicate signature");
                    duplicates.dropped += 1;
                }
                None => {
                    duplicates.entries.insert(key, (rule.rev, kept.len() as u32));
                    kept.push(Some(rule));
                }
            }
        }

        let mut signatures = Vec::new();
        let mut groups = GroupHeads::new();
        let mut port_sets: Vec<HashSet<String>> = vec![HashSet::new(); AppProto::COUNT];
        let mut contexts: HashMap<(AppProto, SigList), ContextPatterns> = HashMap::new();
        let mut dims = MatcherDimensions::default();
        let mut content_ids: HashSet<(Vec<u8>, bool)> = HashSet::new();
        let mut stream_ids: HashSet<(Vec<u8>, bool)> = HashSet::new();
        let mut uri_ids: HashSet<(Vec<u8>, bool)> = HashSet::new();

        for rule in kept.into_iter().flatten() {
            let regexes = match compile_pcres(&rule) {
                Ok(regexes) => regexes,
                Err(e) => {
                    tracing::warn!(sid = rule.sid, error = %e, "Skipping rule with invalid pcre");
                    errors.push((0, format!("sid {}: {}", rule.sid, e)));
                    continue;
                }
            };

            let id = signatures.len() as u32;
            let app = rule.protocol.app_proto();
            let group_key = if self.options.shared_context { AppProto::Unknown } else { app };
            let mut prefiltered = false;

            for content in rule.contents.iter().filter(|c| !c.negated) {
                let ctx = contexts.entry((group_key, content.list)).or_default();
                let entry = (content.bytes.clone(), id);
                if content.nocase {
                    ctx.nocase.push(entry);
                } else {
                    ctx.exact.push(entry);
                }
                let key = (content.bytes.clone(), content.nocase);
                if content.list.is_uri() {
                    uri_ids.insert(key);
                } else {
                    if content.list == SigList::Payload {
                        stream_ids.insert(key.clone());
                    }
                    content_ids.insert(key);
                }
                prefiltered = true;
            }
            for (re, list) in regexes {
                contexts.entry((group_key, list)).or_default().pcres.push((re, id));
            }

            if !prefiltered {
                dims.non_matcher_max += 1;
            }
            dims.byte_extract_max = dims.byte_extract_max.max(rule.byte_extracts);

            groups.heads[app.index()].push(id);
            let ports = &mut port_sets[app.index()];
            if ports.len() < self.options.port_group_limit as usize {
                ports.insert(rule.dst_port.clone());
            }

            signatures.push(Signature {
                id,
                sid: rule.sid,
                gid: rule.gid,
                rev: rule.rev,
                action: rule.action,
                msg: rule.msg,
                protocol: rule.protocol,
                transport: rule.protocol.transport(),
                app,
                prefiltered,
            });
        }

        if !errors.is_empty() {
            if self.options.failure_fatal {
                let (line, error) = &errors[0];
                return Err(IpsError::CompileError(format!(
                    "{} rule(s) failed, first at line {}: {}",
                    errors.len(),
                    line,
                    error
                )));
            }
            if signatures.is_empty() {
                return Err(IpsError::CompileError(format!(
                    "all {} supplied rule(s) failed",
                    errors.len()
                )));
            }
            tracing::warn!(errors = errors.len(), "Some rules failed to load");
        }

        for (app, ports) in AppProto::ALL.iter().zip(port_sets.iter()) {
            groups.port_groups[app.index()] = ports.len();
        }

        let mut matchers = HashMap::with_capacity(contexts.len());
        for (key, patterns) in contexts {
            let matcher = ListMatcher::build(patterns.exact, patterns.nocase, patterns.pcres)?;
            matchers.insert(key, matcher);
        }

        dims.content_max_id = content_ids.len() as u32;
        dims.stream_max_id = stream_ids.len() as u32;
        dims.uri_max_id = uri_ids.len() as u32;
        dims.max_fp_id = dims.content_max_id + dims.uri_max_id;
        dims.sig_count = signatures.len() as u32;

        let compile_time_ms = start.elapsed().as_millis() as u64;

        tracing::info!(
            signatures = signatures.len(),
            contexts = matchers.len(),
            skipped = errors.len(),
            duplicates = duplicates.dropped,
            time_ms = compile_time_ms,
            "Ruleset compilation complete"
        );

        Ok(CompiledRuleset {
            matcher: PatternMatcher {
                contexts: matchers,
                shared: self.options.shared_context,
                sig_apps: signatures.iter().map(|s| s.app).collect(),
            },
            duplicates,
            groups,
            signatures,
            dimensions: dims,
            rule_errors: errors,
            compile_time_ms,
        })
    }
}

impl Default for RuleCompiler {
    fn default() -> Self {
        Self::new(CompileOptions::default())
    }
}

fn compile_pcres(rule: &SuricataRule) -> Result<Vec<(Regex, SigList)>> {
    rule.pcres
        .iter()
        .filter(|p| !p.negated)
        .map(|pcre| {
            if pcre.pattern.contains("(?R)") {
                return Err(IpsError::PatternTooComplex(pcre.pattern.clone()));
            }
            let re = RegexBuilder::new(&pcre.pattern)
                .case_insensitive(pcre.modifiers.contains('i'))
                .multi_line(pcre.modifiers.contains('m'))
                .dot_matches_new_line(pcre.modifiers.contains('s'))
                .size_limit(PCRE_SIZE_LIMIT)
                .build()
                .map_err(|e| match e {
                    regex::Error::CompiledTooBig(_) => {
                        IpsError::PatternTooComplex(pcre.pattern.clone())
                    }
                    other => IpsError::CompileError(other.to_string()),
                })?;
            Ok((re, pcre.list))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const RULES: &str = r#"
        alert http any any -> any 80 (msg:"Uri"; content:"/admin"; http_uri; sid:1;)
        alert tcp any any -> any any (msg:"Bytes"; content:"|00 01|"; sid:2;)
        alert http any any -> any any (msg:"Pcre"; pcre:"/eval\s*\(/i"; sid:3;)
        alert dns any any -> any 53 (msg:"Dns"; dns.query; content:"evil"; nocase; sid:4;)
    "#;

    #[test]
    fn test_compile_rules() {
        let ruleset = RuleCompiler::default().compile(RULES).unwrap();

        assert_eq!(ruleset.signature_count(), 4);
        assert_eq!(ruleset.groups.group(AppProto::Http).len(), 2);
        assert_eq!(ruleset.groups.group(AppProto::Dns).len(), 1);
        assert_eq!(ruleset.groups.group(AppProto::Unknown).len(), 1);
        assert_eq!(ruleset.dimensions.uri_max_id, 1);
        assert_eq!(ruleset.dimensions.non_matcher_max, 1);
        assert!(ruleset.rule_errors.is_empty());
    }

    #[test]
    fn test_scan_filters_by_group() {
        for shared in [true, false] {
            let compiler = RuleCompiler::new(CompileOptions {
                shared_context: shared,
                ..Default::default()
            });
            let ruleset = compiler.compile(RULES).unwrap();

            let mut hits = Vec::new();
            ruleset.matcher.scan(AppProto::Dns, SigList::DnsQuery, b"www.EVIL.com", &mut hits);
            assert_eq!(hits.len(), 1);
            assert_eq!(ruleset.signatures[hits[0] as usize].sid, 4);

            hits.clear();
            ruleset.matcher.scan(AppProto::Http, SigList::DnsQuery, b"evil", &mut hits);
            assert!(hits.is_empty());

            // Generic tcp signature applies to the http group
            hits.clear();
            ruleset.matcher.scan(AppProto::Http, SigList::Payload, b"\x00\x01\x00\x01", &mut hits);
            assert_eq!(hits, vec![1]);
        }
    }

    #[test]
    fn test_shared_context_count() {
        let shared = RuleCompiler::default().compile(RULES).unwrap();
        let full = RuleCompiler::new(CompileOptions {
            shared_context: false,
            ..Default::default()
        })
        .compile(RULES)
        .unwrap();

        assert!(shared.matcher.is_shared());
        assert!(!full.matcher.is_shared());
        assert!(full.matcher.context_count() >= shared.matcher.context_count());
    }

    #[test]
    fn test_duplicate_higher_rev_wins() {
        let text = r#"
            alert tcp any any -> any any (content:"old"; sid:7; rev:1;)
            alert tcp any any -> any any (content:"new"; sid:7; rev:3;)
            alert tcp any any -> any any (content:"older"; sid:7; rev:2;)
        "#;
        let ruleset = RuleCompiler::default().compile(text).unwrap();

        assert_eq!(ruleset.signature_count(), 1);
        assert_eq!(ruleset.duplicates.revision(1, 7), Some(3));
        assert_eq!(ruleset.duplicates.dropped(), 2);
    }

    #[test]
    fn test_failure_fatal() {
        let text = "alert tcp any any -> any any (content:\"x\"; sid:1;)\nnot a rule\n";

        let lenient = RuleCompiler::default().compile(text).unwrap();
        assert_eq!(lenient.signature_count(), 1);
        assert_eq!(lenient.rule_errors.len(), 1);

        let strict = RuleCompiler::new(CompileOptions {
            failure_fatal: true,
            ..Default::default()
        });
        assert!(strict.compile(text).is_err());
    }

    #[test]
    fn test_all_rules_failed() {
        assert!(RuleCompiler::default().compile("garbage\nmore garbage\n").is_err());
        // No rules at all is an empty ruleset, not a failure
        assert_eq!(RuleCompiler::default().compile("# nothing\n").unwrap().signature_count(), 0);
    }
}
