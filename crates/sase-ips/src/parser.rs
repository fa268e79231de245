//! Suricata Rule Parser
//!
//! Parses Suricata/Snort rule syntax into structured rule objects that the
//! [`crate::RuleCompiler`] turns into a matcher. Content modifiers
//! (`http_uri;`) and sticky buffers (`http.uri;`, `file_data;`) both route
//! patterns to their [`SigList`].

use crate::lists::{AppProto, SigList, TransportClass};
use crate::{IpsError, Result};
use std::path::Path;

/// Protocol keyword of the rule header
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
    Ip,
    Http,
    Tls,
    Dns,
    Smtp,
    Ftp,
    Ssh,
    Modbus,
    Any,
}

impl Protocol {
    pub fn from_str(s: &str) -> Option<Self> {
        let proto = match s.to_lowercase().as_str() {
            "tcp" | "tcp-pkt" | "tcp-stream" => Self::Tcp,
            "udp" => Self::Udp,
            "icmp" => Self::Icmp,
            "ip" => Self::Ip,
            "http" => Self::Http,
            "tls" | "ssl" => Self::Tls,
            "dns" => Self::Dns,
            "smtp" => Self::Smtp,
            "ftp" => Self::Ftp,
            "ssh" => Self::Ssh,
            "modbus" => Self::Modbus,
            "any" => Self::Any,
            _ => return None,
        };
        Some(proto)
    }

    /// Transport class the rule is bound to, `None` for any transport
    pub fn transport(self) -> Option<TransportClass> {
        match self {
            Self::Tcp | Self::Http | Self::Tls | Self::Smtp | Self::Ftp | Self::Ssh | Self::Modbus => {
                Some(TransportClass::Tcp)
            }
            Self::Udp => Some(TransportClass::Udp),
            Self::Icmp => Some(TransportClass::Icmp),
            Self::Dns | Self::Ip | Self::Any => None,
        }
    }

    /// Application protocol the rule is bound to, `Unknown` for transport rules
    pub fn app_proto(self) -> AppProto {
        match self {
            Self::Http => AppProto::Http,
            Self::Tls => AppProto::Tls,
            Self::Dns => AppProto::Dns,
            Self::Smtp => AppProto::Smtp,
            Self::Ftp => AppProto::Ftp,
            Self::Ssh => AppProto::Ssh,
            Self::Modbus => AppProto::Modbus,
            Self::Tcp | Self::Udp | Self::Icmp | Self::Ip | Self::Any => AppProto::Unknown,
        }
    }
}

/// Rule action
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RuleAction {
    Alert,
    Drop,
    Reject,
    Pass,
    Log,
}

impl RuleAction {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "alert" => Some(Self::Alert),
            "drop" => Some(Self::Drop),
            "reject" => Some(Self::Reject),
            "pass" => Some(Self::Pass),
            "log" => Some(Self::Log),
            _ => None,
        }
    }

    pub fn is_blocking(self) -> bool {
        matches!(self, Self::Drop | Self::Reject)
    }
}

/// Content pattern
#[derive(Clone, Debug)]
pub struct ContentPattern {
    /// Decoded pattern bytes
    pub bytes: Vec<u8>,
    /// Buffer the pattern is inspected in
    pub list: SigList,
    pub nocase: bool,
    pub negated: bool,
    pub fast_pattern: bool,
}

/// PCRE pattern
#[derive(Clone, Debug)]
pub struct PcrePattern {
    pub pattern: String,
    pub modifiers: String,
    pub list: SigList,
    pub negated: bool,
}

/// Parsed Suricata rule
#[derive(Clone, Debug)]
pub struct SuricataRule {
    pub action: RuleAction,
    pub protocol: Protocol,
    pub src_addr: String,
    pub src_port: String,
    /// `->` or `<>`
    pub direction: String,
    pub dst_addr: String,
    pub dst_port: String,
    pub msg: String,
    pub sid: u32,
    pub gid: u32,
    pub rev: u32,
    pub classtype: Option<String>,
    pub priority: Option<u32>,
    pub contents: Vec<ContentPattern>,
    pub pcres: Vec<PcrePattern>,
    pub flow: Option<String>,
    /// Number of byte_extract variables the rule declares
    pub byte_extracts: u16,
    /// Raw rule text
    pub raw: String,
}

impl Default for SuricataRule {
    fn default() -> Self {
        Self {
            action: RuleAction::Alert,
            protocol: Protocol::Any,
            src_addr: "any".to_string(),
            src_port: "any".to_string(),
            direction: "->".to_string(),
            dst_addr: "any".to_string(),
            dst_port: "any".to_string(),
            msg: String::new(),
            sid: 0,
            gid: 1,
            rev: 1,
            classtype: None,
            priority: None,
            contents: Vec::new(),
            pcres: Vec::new(),
            flow: None,
            byte_extracts: 0,
            raw: String::new(),
        }
    }
}

impl SuricataRule {
    /// Whether at least one pattern can be prefiltered by the matcher
    pub fn has_fast_pattern(&self) -> bool {
        self.contents.iter().any(|c| !c.negated && !c.bytes.is_empty())
    }
}

/// Suricata rule parser
pub struct RuleParser {
    rules: Vec<SuricataRule>,
    /// (line, error)
    errors: Vec<(usize, String)>,
}

impl RuleParser {
    pub fn new() -> Self {
        Self {
            rules: Vec::new(),
            errors: Vec::new(),
        }
    }

    /// Parse rules from file
    pub fn parse_file(&mut self, path: &Path) -> Result<usize> {
        let content = std::fs::read_to_string(path)?;
        self.parse_content(&content)
    }

    /// Parse rules from string, collecting per-line errors
    pub fn parse_content(&mut self, content: &str) -> Result<usize> {
        let mut rule_buffer = String::new();
        let mut start_line = 0;

        for (idx, line) in content.lines().enumerate() {
            let line_num = idx + 1;
            let trimmed = line.trim();

            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            // Line continuation
            if let Some(head) = trimmed.strip_suffix('\\') {
                if rule_buffer.is_empty() {
                    start_line = line_num;
                }
                rule_buffer.push_str(head);
                continue;
            }

            let full_rule = if rule_buffer.is_empty() {
                start_line = line_num;
                trimmed.to_string()
            } else {
                rule_buffer.push_str(trimmed);
                std::mem::take(&mut rule_buffer)
            };

            match self.parse_single_rule(&full_rule) {
                Ok(rule) => self.rules.push(rule),
                Err(e) => self.errors.push((start_line, e.to_string())),
            }
        }

        Ok(self.rules.len())
    }

    /// Parse a single rule
    pub fn parse_single_rule(&self, line: &str) -> Result<SuricataRule> {
        let mut rule = SuricataRule {
            raw: line.to_string(),
            ..Default::default()
        };

        let options_start = line
            .find('(')
            .ok_or_else(|| IpsError::ParseError("Missing options section".into()))?;
        let options_end = line
            .rfind(')')
            .filter(|end| *end > options_start)
            .ok_or_else(|| IpsError::ParseError("Missing closing parenthesis".into()))?;

        // action proto src_addr src_port -> dst_addr dst_port
        let header = line[..options_start].trim();
        let parts: Vec<&str> = header.split_whitespace().collect();
        if parts.len() != 7 {
            return Err(IpsError::ParseError(format!(
                "Invalid header, expected 7 parts, got {}: {}",
                parts.len(),
                header
            )));
        }

        rule.action = RuleAction::from_str(parts[0])
            .ok_or_else(|| IpsError::ParseError(format!("Unknown action: {}", parts[0])))?;
        rule.protocol = Protocol::from_str(parts[1])
            .ok_or_else(|| IpsError::ParseError(format!("Unknown protocol: {}", parts[1])))?;
        rule.src_addr = parts[2].to_string();
        rule.src_port = parts[3].to_string();
        if parts[4] != "->" && parts[4] != "<>" {
            return Err(IpsError::ParseError(format!("Invalid direction: {}", parts[4])));
        }
        rule.direction = parts[4].to_string();
        rule.dst_addr = parts[5].to_string();
        rule.dst_port = parts[6].to_string();

        self.parse_options(&mut rule, &line[options_start + 1..options_end])?;

        if rule.sid == 0 {
            return Err(IpsError::InvalidRule("Missing sid".into()));
        }

        Ok(rule)
    }

    fn parse_options(&self, rule: &mut SuricataRule, options: &str) -> Result<()> {
        // Buffer set by a sticky keyword, applies to following contents
        let mut sticky = SigList::Payload;

        for opt in split_options(options) {
            let (key, value) = match opt.find(':') {
                Some(pos) => (opt[..pos].trim(), Some(opt[pos + 1..].trim())),
                None => (opt.as_str(), None),
            };

            match key {
                "msg" => rule.msg = unquote(value.unwrap_or_default()).to_string(),
                "sid" => rule.sid = parse_number(key, value)?,
                "gid" => rule.gid = parse_number(key, value)?,
                "rev" => rule.rev = parse_number(key, value)?,
                "priority" => rule.priority = Some(parse_number(key, value)?),
                "classtype" => rule.classtype = value.map(str::to_string),
                "flow" => rule.flow = value.map(str::to_string),
                "content" | "uricontent" => {
                    let value = value.ok_or_else(|| {
                        IpsError::ParseError(format!("{} requires a value", key))
                    })?;
                    let (bytes, negated) = decode_content(value)?;
                    let list = if key == "uricontent" { SigList::Uri } else { sticky };
                    rule.contents.push(ContentPattern {
                        bytes,
                        list,
                        nocase: false,
                        negated,
                        fast_pattern: false,
                    });
                }
                "nocase" => last_content(rule, key)?.nocase = true,
                "fast_pattern" => last_content(rule, key)?.fast_pattern = true,
                "depth" | "offset" | "distance" | "within" => {
                    // Positional modifiers narrow a content; the prefilter ignores them
                    last_content(rule, key)?;
                }
                "pcre" => {
                    let value = value.ok_or_else(|| {
                        IpsError::ParseError("pcre requires a value".into())
                    })?;
                    rule.pcres.push(parse_pcre(value, sticky)?);
                }
                "byte_extract" => rule.byte_extracts = rule.byte_extracts.saturating_add(1),
                _ => {
                    if let Some(list) = SigList::from_modifier(key) {
                        if is_sticky_buffer(key) {
                            sticky = list;
                        } else {
                            last_content(rule, key)?.list = list;
                        }
                    }
                    // Remaining keywords do not influence the prefilter
                }
            }
        }

        Ok(())
    }

    /// Get parsed rules
    pub fn rules(&self) -> &[SuricataRule] {
        &self.rules
    }

    /// Get parse errors
    pub fn errors(&self) -> &[(usize, String)] {
        &self.errors
    }

    /// Take parsed rules
    pub fn into_rules(self) -> Vec<SuricataRule> {
        self.rules
    }
}

impl Default for RuleParser {
    fn default() -> Self {
        Self::new()
    }
}

fn is_sticky_buffer(keyword: &str) -> bool {
    keyword.contains('.') || matches!(keyword, "file_data" | "pkt_data")
}

fn last_content<'a>(rule: &'a mut SuricataRule, keyword: &str) -> Result<&'a mut ContentPattern> {
    rule.contents
        .last_mut()
        .ok_or_else(|| IpsError::ParseError(format!("{} without preceding content", keyword)))
}

fn parse_number(key: &str, value: Option<&str>) -> Result<u32> {
    value
        .and_then(|v| v.trim().parse().ok())
        .ok_or_else(|| IpsError::ParseError(format!("Invalid {} value: {:?}", key, value)))
}

fn unquote(s: &str) -> &str {
    let s = s.trim();
    s.strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(s)
}

/// Split options on `;`, respecting quotes and escapes
fn split_options(options: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut escape_next = false;

    for ch in options.chars() {
        if escape_next {
            current.push(ch);
            escape_next = false;
            continue;
        }

        match ch {
            '\\' => {
                escape_next = true;
                current.push(ch);
            }
            '"' => {
                in_quotes = !in_quotes;
                current.push(ch);
            }
            ';' if !in_quotes => {
                if !current.trim().is_empty() {
                    parts.push(current.trim().to_string());
                }
                current.clear();
            }
            _ => current.push(ch),
        }
    }

    if !current.trim().is_empty() {
        parts.push(current.trim().to_string());
    }

    parts
}

/// Decode `"GET|20|/"` style content into bytes, returning (bytes, negated)
fn decode_content(value: &str) -> Result<(Vec<u8>, bool)> {
    let mut s = value.trim();
    let negated = s.starts_with('!');
    if negated {
        s = &s[1..];
    }
    let s = unquote(s);

    let mut bytes = Vec::with_capacity(s.len());
    let mut in_hex = false;
    let mut escape_next = false;
    let mut hex_digits = String::new();

    for ch in s.chars() {
        if in_hex {
            match ch {
                '|' => {
                    if !hex_digits.is_empty() {
                        return Err(IpsError::ParseError(format!("Odd hex digits in {}", value)));
                    }
                    in_hex = false;
                }
                c if c.is_ascii_whitespace() => {}
                c if c.is_ascii_hexdigit() => {
                    hex_digits.push(c);
                    if hex_digits.len() == 2 {
                        let byte = u8::from_str_radix(&hex_digits, 16)
                            .map_err(|e| IpsError::ParseError(e.to_string()))?;
                        bytes.push(byte);
                        hex_digits.clear();
                    }
                }
                c => {
                    return Err(IpsError::ParseError(format!("Invalid hex char {:?} in {}", c, value)))
                }
            }
            continue;
        }

        if escape_next {
            let mut buf = [0u8; 4];
            bytes.extend_from_slice(ch.encode_utf8(&mut buf).as_bytes());
            escape_next = false;
            continue;
        }

        match ch {
            '\\' => escape_next = true,
            '|' => in_hex = true,
            c => {
                let mut buf = [0u8; 4];
                bytes.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            }
        }
    }

    if in_hex {
        return Err(IpsError::ParseError(format!("Unterminated hex block in {}", value)));
    }
    if bytes.is_empty() {
        return Err(IpsError::ParseError("Empty content".into()));
    }

    Ok((bytes, negated))
}

/// Parse `"/pattern/modifiers"`
fn parse_pcre(value: &str, sticky: SigList) -> Result<PcrePattern> {
    let s = unquote(value);
    let (s, negated) = match s.strip_prefix('!') {
        Some(rest) => (rest, true),
        None => (s, false),
    };

    let last_slash = s
        .rfind('/')
        .filter(|pos| s.starts_with('/') && *pos > 0)
        .ok_or_else(|| IpsError::ParseError(format!("Malformed pcre: {}", value)))?;

    let pattern = s[1..last_slash].to_string();
    let modifiers = s[last_slash + 1..].to_string();
    // Snort-style buffer flags on the pcre itself
    let list = if modifiers.contains('U') {
        SigList::Uri
    } else if modifiers.contains('H') {
        SigList::Headers
    } else if modifiers.contains('P') {
        SigList::ClientBody
    } else {
        sticky
    };

    Ok(PcrePattern {
        pattern,
        modifiers,
        list,
        negated,
    })
}
