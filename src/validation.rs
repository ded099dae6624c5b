//! Pattern-based request inspection.
//!
//! The validator runs an ordered catalogue of regex rules over the textual
//! parts of a request and reports every hit as a [`Violation`]. It never
//! decides what to do with a hit; the pipeline applies the configured
//! [`ValidationMode`].
//!
//! What is inspected:
//!
//! - URL length against a cap
//! - query string parameters (names and values)
//! - `application/json` bodies, walked recursively; object keys and scalar
//!   values are checked, with field paths like `user.tags[2]`
//! - `application/x-www-form-urlencoded` bodies
//! - `text/plain` bodies
//!
//! Other content types are not inspected.

use std::fmt;
use std::str::FromStr;

use regex::{Regex, RegexBuilder};
use serde::Serialize;

use crate::error::{AppError, AppResult};

/// Default cap on the full request URI.
pub const DEFAULT_MAX_URL_LENGTH: usize = 2048;

/// What a violation was raised for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    SqlInjection,
    NosqlInjection,
    Xss,
    PathTraversal,
    CommandInjection,
    UrlLength,
    MalformedBody,
}

impl ViolationKind {
    /// Families that come from the pattern catalogue.
    pub const RULE_FAMILIES: [ViolationKind; 5] = [
        ViolationKind::SqlInjection,
        ViolationKind::NosqlInjection,
        ViolationKind::Xss,
        ViolationKind::PathTraversal,
        ViolationKind::CommandInjection,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ViolationKind::SqlInjection => "sql_injection",
            ViolationKind::NosqlInjection => "nosql_injection",
            ViolationKind::Xss => "xss",
            ViolationKind::PathTraversal => "path_traversal",
            ViolationKind::CommandInjection => "command_injection",
            ViolationKind::UrlLength => "url_length",
            ViolationKind::MalformedBody => "malformed_body",
        }
    }
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ViolationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        Self::RULE_FAMILIES
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| {
                format!(
                    "unknown validation rule family '{s}' (expected one of: {})",
                    Self::RULE_FAMILIES.map(|k| k.as_str()).join(", ")
                )
            })
    }
}

/// One finding. Never carries the offending value itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Violation {
    pub rule: ViolationKind,
    pub field: String,
    pub description: String,
}

/// What the pipeline does with violations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ValidationMode {
    /// Reject with 400 (413 for oversized bodies).
    #[default]
    Block,
    /// Log and let the request through.
    Monitor,
    /// Skip inspection.
    Off,
}

impl FromStr for ValidationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "block" => Ok(ValidationMode::Block),
            "monitor" => Ok(ValidationMode::Monitor),
            "off" => Ok(ValidationMode::Off),
            other => Err(format!(
                "unknown validation mode '{other}' (expected block|monitor|off)"
            )),
        }
    }
}

impl fmt::Display for ValidationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationMode::Block => f.write_str("block"),
            ValidationMode::Monitor => f.write_str("monitor"),
            ValidationMode::Off => f.write_str("off"),
        }
    }
}

/// Textual request part a rule can apply to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    Json,
    /// Form bodies and the query string.
    Form,
    Text,
}

impl BodyKind {
    /// Classify a `Content-Type` header value. `None` for non-textual types.
    pub fn from_content_type(content_type: &str) -> Option<Self> {
        let mime = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        match mime.as_str() {
            "application/json" => Some(BodyKind::Json),
            m if m.starts_with("application/") && m.ends_with("+json") => Some(BodyKind::Json),
            "application/x-www-form-urlencoded" => Some(BodyKind::Form),
            "text/plain" => Some(BodyKind::Text),
            _ => None,
        }
    }
}

const ALL_KINDS: &[BodyKind] = &[BodyKind::Json, BodyKind::Form, BodyKind::Text];

/// A single compiled pattern.
#[derive(Debug, Clone)]
pub struct ValidationRule {
    pub family: ViolationKind,
    pub description: &'static str,
    pattern: Regex,
    applies_to: &'static [BodyKind],
}

impl ValidationRule {
    pub fn new(
        family: ViolationKind,
        description: &'static str,
        pattern: &str,
        applies_to: &'static [BodyKind],
    ) -> Result<Self, regex::Error> {
        let pattern = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .size_limit(1 << 20)
            .build()?;
        Ok(Self {
            family,
            description,
            pattern,
            applies_to,
        })
    }

    pub fn applies_to(&self, kind: BodyKind) -> bool {
        self.applies_to.contains(&kind)
    }

    pub fn is_match(&self, value: &str) -> bool {
        self.pattern.is_match(value)
    }
}

type CatalogueEntry = (ViolationKind, &'static str, &'static str, &'static [BodyKind]);

const SQL_KINDS: &[BodyKind] = &[BodyKind::Json, BodyKind::Form];
const NOSQL_KINDS: &[BodyKind] = &[BodyKind::Json];

const CATALOGUE: &[CatalogueEntry] = &[
    // SQL injection
    (
        ViolationKind::SqlInjection,
        "SQL statement keywords",
        r"\b(?:SELECT|INSERT|UPDATE|DELETE|DROP|ALTER|CREATE|TRUNCATE)\b.*?\b(?:FROM|TABLE|DATABASE)\b",
        SQL_KINDS,
    ),
    (
        ViolationKind::SqlInjection,
        "SQL comment followed by DDL",
        r"(?:--|#|\*/|/\*).*?(?:DROP|ALTER|CREATE|TRUNCATE)",
        SQL_KINDS,
    ),
    (
        ViolationKind::SqlInjection,
        "SQL UNION SELECT",
        r"UNION(?:\s+ALL)?\s+SELECT",
        SQL_KINDS,
    ),
    (
        ViolationKind::SqlInjection,
        "quote-terminated boolean clause",
        r"'(?:\s+OR\s+|\s+AND\s+).*?(?:--|#|/\*|'|=|>)",
        SQL_KINDS,
    ),
    (
        ViolationKind::SqlInjection,
        "tautology",
        r"\b(?:OR|AND)\b\s+\d+\s*=\s*\d+",
        SQL_KINDS,
    ),
    // NoSQL injection
    (
        ViolationKind::NosqlInjection,
        "query operator object",
        r"\{\s*\$(?:ne|eq|gt|lt|gte|lte|in|nin|or|and|regex|where|exists)\s*:",
        NOSQL_KINDS,
    ),
    (
        ViolationKind::NosqlInjection,
        "query operator",
        r"\$(?:ne|eq|gt|lt|gte|lte|in|nin|or|and|regex|where|exists)\b",
        NOSQL_KINDS,
    ),
    (
        ViolationKind::NosqlInjection,
        "database method call",
        r"\bdb\.[\w$]+\.(?:find|update|insert|delete)\w*\(",
        NOSQL_KINDS,
    ),
    // Cross-site scripting
    (
        ViolationKind::Xss,
        "script element",
        r"(?s)<script\b.*?>",
        ALL_KINDS,
    ),
    (
        ViolationKind::Xss,
        "javascript: URL",
        r"javascript\s*:",
        ALL_KINDS,
    ),
    (
        ViolationKind::Xss,
        "inline event handler",
        r"\bon(?:click|load|mouse|error|key|focus|blur|change|submit)\w*\s*=",
        ALL_KINDS,
    ),
    (
        ViolationKind::Xss,
        "image element with source",
        r"(?s)<img\b.*?src.*?=.*?>",
        ALL_KINDS,
    ),
    (
        ViolationKind::Xss,
        "iframe element",
        r"(?s)<iframe\b.*?>",
        ALL_KINDS,
    ),
    (
        ViolationKind::Xss,
        "executable data URL",
        r"data:(?:text|image)/(?:html|javascript)",
        ALL_KINDS,
    ),
    (
        ViolationKind::Xss,
        "noscript element",
        r"(?s)<noscript>.*?</noscript>",
        ALL_KINDS,
    ),
    // Path traversal
    (
        ViolationKind::PathTraversal,
        "parent directory reference",
        r"\.{2,}[/\\]",
        ALL_KINDS,
    ),
    (
        ViolationKind::PathTraversal,
        "encoded parent directory reference",
        r"(?:%2e|%252e){2,}[/\\%]",
        ALL_KINDS,
    ),
    (
        ViolationKind::PathTraversal,
        "system account file",
        r"/etc/(?:passwd|shadow|group|hosts)",
        ALL_KINDS,
    ),
    (
        ViolationKind::PathTraversal,
        "process information file",
        r"(?:proc|sys)/\w+/(?:cmdline|environ)",
        ALL_KINDS,
    ),
    (
        ViolationKind::PathTraversal,
        "system directory",
        r"/(?:var|usr|bin|opt)/",
        ALL_KINDS,
    ),
    // Command injection
    (
        ViolationKind::CommandInjection,
        "chained shell command",
        r"(?:;|&&|\|\||\|)\s*(?:sh|bash|ls|cat|rm|wget|curl|nc|id|whoami|uname|chmod)\b",
        ALL_KINDS,
    ),
    (
        ViolationKind::CommandInjection,
        "command substitution",
        r"`[^`]+`|\$\([^)]*\)|\$\{[^}]*\}",
        ALL_KINDS,
    ),
    (
        ViolationKind::CommandInjection,
        "shell binary path",
        r"/bin/(?:bash|sh|ksh|csh|tcsh|zsh|dash)\b",
        ALL_KINDS,
    ),
    (
        ViolationKind::CommandInjection,
        "network tool invocation",
        r"\b(?:wget|curl|nc|telnet|ncat|nmap)\s+(?:-\S+\s+)*(?:[a-z]+://|\d{1,3}\.\d{1,3}\.)",
        ALL_KINDS,
    ),
    (
        ViolationKind::CommandInjection,
        "file read of absolute path",
        r"\b(?:cat|head|tail|more|less|nl)\s+/",
        ALL_KINDS,
    ),
    (
        ViolationKind::CommandInjection,
        "destructive file command",
        r"\b(?:rm|chmod|chown)\s+-\w+",
        ALL_KINDS,
    ),
];

/// Compiled rule catalogue plus limits.
#[derive(Debug, Clone)]
pub struct InputValidator {
    rules: Vec<ValidationRule>,
    max_url_length: usize,
}

impl InputValidator {
    pub fn new(rules: Vec<ValidationRule>, max_url_length: usize) -> Self {
        Self {
            rules,
            max_url_length,
        }
    }

    /// The built-in catalogue restricted to `families`, in catalogue order.
    pub fn with_families(families: &[ViolationKind], max_url_length: usize) -> AppResult<Self> {
        let rules = CATALOGUE
            .iter()
            .filter(|(family, ..)| families.contains(family))
            .map(|&(family, description, pattern, kinds)| {
                ValidationRule::new(family, description, pattern, kinds).map_err(|e| {
                    AppError::ConfigError(format!("invalid {family} pattern '{description}': {e}"))
                })
            })
            .collect::<AppResult<Vec<_>>>()?;

        Ok(Self::new(rules, max_url_length))
    }

    /// Every built-in rule family.
    pub fn with_defaults() -> AppResult<Self> {
        Self::with_families(&ViolationKind::RULE_FAMILIES, DEFAULT_MAX_URL_LENGTH)
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// Inspect everything the validator knows how to read.
    pub fn inspect(&self, uri: &str, content_type: Option<&str>, body: &[u8]) -> Vec<Violation> {
        let mut violations = self.check_url(uri);
        if let Some((_, query)) = uri.split_once('?') {
            violations.extend(self.inspect_query(query));
        }
        if let Some(kind) = content_type.and_then(BodyKind::from_content_type) {
            violations.extend(self.inspect_body(kind, body));
        }
        violations
    }

    pub fn check_url(&self, uri: &str) -> Vec<Violation> {
        if uri.len() > self.max_url_length {
            vec![Violation {
                rule: ViolationKind::UrlLength,
                field: "url".to_string(),
                description: format!(
                    "URL length {} exceeds maximum {}",
                    uri.len(),
                    self.max_url_length
                ),
            }]
        } else {
            Vec::new()
        }
    }

    pub fn inspect_query(&self, query: &str) -> Vec<Violation> {
        let mut violations = Vec::new();
        for (name, value) in url::form_urlencoded::parse(query.as_bytes()) {
            let field = format!("query.{name}");
            self.check_field(BodyKind::Form, &field, &name, &mut violations);
            self.check_field(BodyKind::Form, &field, &value, &mut violations);
        }
        violations
    }

    /// Inspect a buffered body of the given kind.
    pub fn inspect_body(&self, kind: BodyKind, body: &[u8]) -> Vec<Violation> {
        let mut violations = Vec::new();
        if body.is_empty() {
            return violations;
        }

        match kind {
            BodyKind::Json => match serde_json::from_slice::<serde_json::Value>(body) {
                Ok(value) => self.walk_json(&value, "", &mut violations),
                Err(_) => violations.push(Violation {
                    rule: ViolationKind::MalformedBody,
                    field: "body".to_string(),
                    description: "body is not valid JSON".to_string(),
                }),
            },
            BodyKind::Form => {
                for (name, value) in url::form_urlencoded::parse(body) {
                    self.check_field(kind, &name, &name, &mut violations);
                    self.check_field(kind, &name, &value, &mut violations);
                }
            }
            BodyKind::Text => {
                let text = String::from_utf8_lossy(body);
                self.check_field(kind, "body", &text, &mut violations);
            }
        }

        violations
    }

    fn walk_json(&self, value: &serde_json::Value, path: &str, out: &mut Vec<Violation>) {
        use serde_json::Value;

        match value {
            Value::Object(map) => {
                for (key, child) in map {
                    let child_path = if path.is_empty() {
                        key.clone()
                    } else {
                        format!("{path}.{key}")
                    };
                    self.check_field(BodyKind::Json, &child_path, key, out);
                    self.walk_json(child, &child_path, out);
                }
            }
            Value::Array(items) => {
                for (i, child) in items.iter().enumerate() {
                    self.walk_json(child, &format!("{path}[{i}]"), out);
                }
            }
            Value::String(s) => self.check_field(BodyKind::Json, field_name(path), s, out),
            Value::Number(n) => {
                self.check_field(BodyKind::Json, field_name(path), &n.to_string(), out)
            }
            Value::Bool(_) | Value::Null => {}
        }
    }

    /// At most one violation per rule family per field.
    fn check_field(&self, kind: BodyKind, field: &str, value: &str, out: &mut Vec<Violation>) {
        for rule in self.rules.iter().filter(|r| r.applies_to(kind)) {
            let already = out
                .iter()
                .any(|v| v.rule == rule.family && v.field == field);
            if !already && rule.is_match(value) {
                out.push(Violation {
                    rule: rule.family,
                    field: field.to_string(),
                    description: rule.description.to_string(),
                });
            }
        }
    }
}

fn field_name(path: &str) -> &str {
    if path.is_empty() { "body" } else { path }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn validator() -> InputValidator {
        InputValidator::with_defaults().unwrap()
    }

    fn json(body: &str) -> Vec<Violation> {
        validator().inspect_body(BodyKind::Json, body.as_bytes())
    }

    fn kinds(violations: &[Violation]) -> Vec<ViolationKind> {
        violations.iter().map(|v| v.rule).collect()
    }

    #[test]
    fn test_catalogue_compiles() {
        assert_eq!(validator().rule_count(), CATALOGUE.len());
    }

    #[test]
    fn test_clean_json_passes() {
        let body = r#"{"name": "Ada O'Brien", "age": 36, "tags": ["math", "engines"],
                       "note": "Select your favourite colour", "active": true}"#;
        assert!(json(body).is_empty());
    }

    #[test]
    fn test_sql_injection_in_nested_field() {
        let v = json(r#"{"user": {"name": "x' OR '1'='1"}}"#);
        assert_eq!(kinds(&v), vec![ViolationKind::SqlInjection]);
        assert_eq!(v[0].field, "user.name");

        let v = json(r#"{"q": "1 UNION SELECT password FROM users"}"#);
        assert!(kinds(&v).contains(&ViolationKind::SqlInjection));
    }

    #[test]
    fn test_array_field_paths() {
        let v = json(r#"{"items": [{"ok": "fine"}, "<script>alert(1)</script>"]}"#);
        assert_eq!(v.len(), 1);
        assert_eq!(v[0].rule, ViolationKind::Xss);
        assert_eq!(v[0].field, "items[1]");
    }

    #[test]
    fn test_nosql_operator_in_key() {
        let v = json(r#"{"password": {"$ne": null}}"#);
        assert_eq!(kinds(&v), vec![ViolationKind::NosqlInjection]);
        assert_eq!(v[0].field, "password.$ne");
    }

    #[test]
    fn test_one_violation_per_family_per_field() {
        // Matches several XSS patterns
        let v = json(r#"{"bio": "<script src=x onerror=alert(1)>javascript:</script>"}"#);
        assert_eq!(v.iter().filter(|v| v.rule == ViolationKind::Xss).count(), 1);
    }

    #[test]
    fn test_violation_does_not_echo_value() {
        let v = json(r#"{"path": "../../etc/passwd"}"#);
        assert_eq!(kinds(&v), vec![ViolationKind::PathTraversal]);
        assert!(!v[0].description.contains("passwd"));
    }

    #[test]
    fn test_malformed_json() {
        let v = json("{not json");
        assert_eq!(kinds(&v), vec![ViolationKind::MalformedBody]);
    }

    #[test]
    fn test_form_body() {
        let v = validator().inspect_body(BodyKind::Form, b"name=bob&cmd=x%3B+cat+%2Fetc%2Fshadow");
        assert!(v.iter().all(|v| v.field == "cmd"));
        assert!(kinds(&v).contains(&ViolationKind::CommandInjection));
        assert!(kinds(&v).contains(&ViolationKind::PathTraversal));
    }

    #[test]
    fn test_text_body_skips_json_only_rules() {
        let v = validator().inspect_body(BodyKind::Text, b"{\"$where\": \"sleep(100)\"}");
        assert!(v.is_empty());

        let v = validator().inspect_body(BodyKind::Text, b"hello <iframe src=evil>");
        assert_eq!(kinds(&v), vec![ViolationKind::Xss]);
    }

    #[test]
    fn test_command_injection_not_triggered_by_prose() {
        let v = json(r#"{"msg": "Tom & Jerry; set the alarm for 7, then ping me"}"#);
        assert!(v.is_empty(), "{v:?}");

        let v = json(r#"{"msg": "run $(whoami)"}"#);
        assert_eq!(kinds(&v), vec![ViolationKind::CommandInjection]);
    }

    #[test]
    fn test_query_and_url_length() {
        let validator = InputValidator::with_families(&ViolationKind::RULE_FAMILIES, 40).unwrap();

        let v = validator.inspect("/search?q=%3Cscript%3E", None, b"");
        assert_eq!(kinds(&v), vec![ViolationKind::Xss]);
        assert_eq!(v[0].field, "query.q");

        let long = format!("/search?q={}", "a".repeat(64));
        let v = validator.inspect(&long, None, b"");
        assert_eq!(kinds(&v), vec![ViolationKind::UrlLength]);
    }

    #[test]
    fn test_unknown_content_type_not_inspected() {
        let v = validator().inspect("/upload", Some("application/octet-stream"), b"../../etc/passwd");
        assert!(v.is_empty());

        let v = validator().inspect(
            "/upload",
            Some("application/json; charset=utf-8"),
            br#"{"f": "../../etc/passwd"}"#,
        );
        assert_eq!(kinds(&v), vec![ViolationKind::PathTraversal]);
    }

    #[test]
    fn test_family_selection() {
        let validator =
            InputValidator::with_families(&[ViolationKind::Xss], DEFAULT_MAX_URL_LENGTH).unwrap();
        let v = validator.inspect_body(BodyKind::Json, br#"{"a": "1 UNION SELECT 2", "b": "<script>"}"#);
        assert_eq!(kinds(&v), vec![ViolationKind::Xss]);
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!("Monitor".parse::<ValidationMode>().unwrap(), ValidationMode::Monitor);
        assert_eq!(ValidationMode::default(), ValidationMode::Block);
        assert!("loud".parse::<ValidationMode>().is_err());
        assert_eq!("xss".parse::<ViolationKind>().unwrap(), ViolationKind::Xss);
        assert!("url_length".parse::<ViolationKind>().is_err());
    }
}
