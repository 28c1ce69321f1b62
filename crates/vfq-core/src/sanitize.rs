//! Validation and normalization for untrusted file-system input.
//!
//! Every function here is pure and total: it never touches the disk and never
//! fails. Results always carry `valid` and `issues`, and callers decide
//! whether an operation proceeds. A single pass is best-effort cleaning, not a
//! guarantee: check `valid`, do not re-sanitize `sanitized` and assume safety.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;
use std::sync::OnceLock;

pub const MAX_PATH_LENGTH: usize = 4096;
pub const MAX_FILE_NAME_LENGTH: usize = 255;
pub const MAX_CONTENT_LENGTH: usize = 1024 * 1024;
pub const MAX_PURPOSE_LENGTH: usize = 500;

/// Hidden files that may still be created.
pub const ALLOWED_HIDDEN_FILES: &[&str] = &[".gitignore"];

// ---------------------------------------------------------------------------
// SanitizeResult
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SanitizeResult {
    pub sanitized: String,
    pub valid: bool,
    pub issues: Vec<String>,
}

impl SanitizeResult {
    fn new(sanitized: String, issues: Vec<String>) -> Self {
        Self {
            sanitized,
            valid: issues.is_empty(),
            issues,
        }
    }
}

// ---------------------------------------------------------------------------
// Patterns
// ---------------------------------------------------------------------------

fn re(cell: &'static OnceLock<Regex>, pattern: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(pattern).unwrap())
}

fn encoded_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    re(&RE, r"(?i)%(?:2e|2f|5c|00|25)")
}

fn path_chars_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    re(&RE, r"[^A-Za-z0-9._\-/]")
}

fn file_name_chars_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    re(&RE, r"[^A-Za-z0-9._\-]")
}

fn slashes_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    re(&RE, r"/{2,}")
}

fn active_block_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    re(
        &RE,
        r"(?is)<(?:script|iframe|object)\b[^>]*>.*?</(?:script|iframe|object)\s*>",
    )
}

fn active_tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    re(&RE, r"(?i)</?(?:script|iframe|object|embed)\b[^>]*>")
}

fn script_block_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    re(&RE, r"(?is)<script\b[^>]*>.*?</script\s*>")
}

fn js_url_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    re(&RE, r"(?i)javascript\s*:")
}

fn any_tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    re(&RE, r"<[^>]*>")
}

fn event_handler_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    re(
        &RE,
        r#"(?i)\s+on[a-z]+\s*=\s*(?:"[^"]*"|'[^']*'|[^\s>]+)"#,
    )
}

fn code_comment_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    re(&RE, r"(?s)//[^\n]*|/\*.*?\*/")
}

fn shell_meta_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    re(
        &RE,
        r"\$\(|;\s*(?:rm|curl|wget|chmod|bash|sh)\b|\|\s*(?:ba)?sh\b|&&\s*(?:rm|curl|wget)\b|\brm\s+-[rf]+",
    )
}

/// `(label, pattern)` pairs flagged in free-text purpose fields.
const SQL_PURPOSE_PATTERNS: &[(&str, &str)] = &[
    (
        "boolean tautology",
        r#"(?i)\b(?:or|and)\s+['"]?\w+['"]?\s*=\s*['"]?\w+"#,
    ),
    ("UNION SELECT", r"(?i)\bunion\s+(?:all\s+)?select\b"),
    ("DROP TABLE", r"(?i)\bdrop\s+table\b"),
    ("trailing comment", r"--\s*$"),
];

fn sql_purpose_res() -> &'static [(&'static str, Regex)] {
    static RES: OnceLock<Vec<(&'static str, Regex)>> = OnceLock::new();
    RES.get_or_init(|| {
        SQL_PURPOSE_PATTERNS
            .iter()
            .map(|(label, p)| (*label, Regex::new(p).unwrap()))
            .collect()
    })
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn truncate_chars(s: &mut String, max: usize) -> bool {
    match s.char_indices().nth(max) {
        Some((idx, _)) => {
            s.truncate(idx);
            true
        }
        None => false,
    }
}

fn truncate_bytes(s: &mut String, max: usize) -> bool {
    if s.len() <= max {
        return false;
    }
    let mut idx = max;
    while !s.is_char_boundary(idx) {
        idx -= 1;
    }
    s.truncate(idx);
    true
}

/// `..`, `...` and longer runs of dots climb directories on some platforms.
fn is_dot_run(segment: &str) -> bool {
    segment.len() >= 2 && segment.chars().all(|c| c == '.')
}

fn replace_counted(re: &Regex, s: &mut String, with: &str) -> bool {
    if !re.is_match(s) {
        return false;
    }
    *s = re.replace_all(s, with).into_owned();
    true
}

// ---------------------------------------------------------------------------
// sanitize_path
// ---------------------------------------------------------------------------

pub fn sanitize_path(path: &str) -> SanitizeResult {
    let mut issues = Vec::new();
    if path.trim().is_empty() {
        issues.push("Path is empty".to_string());
        return SanitizeResult::new(String::new(), issues);
    }

    let mut s = path.to_string();

    if s.contains('\0') {
        issues.push("Null bytes removed".to_string());
        s = s.replace('\0', "");
    }
    if replace_counted(encoded_re(), &mut s, "") {
        issues.push("URL-encoded sequences removed".to_string());
    }

    s = s.replace('\\', "/");

    if replace_counted(path_chars_re(), &mut s, "") {
        issues.push("Invalid characters removed".to_string());
    }

    let mut traversal = false;
    let mut kept: Vec<&str> = Vec::new();
    for segment in s.split('/') {
        if is_dot_run(segment) {
            traversal = true;
        } else {
            kept.push(segment);
        }
    }
    if traversal {
        issues.push("Path traversal sequences removed".to_string());
        s = kept.join("/");
    }

    s = slashes_re().replace_all(&s, "/").into_owned();
    if s.len() > 1 && s.ends_with('/') {
        s.pop();
    }

    if truncate_chars(&mut s, MAX_PATH_LENGTH) {
        issues.push(format!("Path truncated to {MAX_PATH_LENGTH} characters"));
    }

    SanitizeResult::new(s, issues)
}

// ---------------------------------------------------------------------------
// sanitize_file_name
// ---------------------------------------------------------------------------

pub fn sanitize_file_name(name: &str) -> SanitizeResult {
    let mut issues = Vec::new();
    if name.is_empty() {
        issues.push("File name is empty".to_string());
        return SanitizeResult::new(String::new(), issues);
    }

    let mut s = name.to_string();
    if s.contains('/') || s.contains('\\') {
        issues.push("Path separators are not allowed in file names".to_string());
        s = s.replace(['/', '\\'], "");
    }
    if replace_counted(file_name_chars_re(), &mut s, "") {
        issues.push("Invalid characters removed".to_string());
    }

    if s == "." || s == ".." {
        issues.push(format!("Reserved file name '{s}'"));
        s.clear();
    } else if s.starts_with('.') && !ALLOWED_HIDDEN_FILES.contains(&s.as_str()) {
        issues.push("Hidden files are not allowed".to_string());
        s = s.trim_start_matches('.').to_string();
    }

    if truncate_chars(&mut s, MAX_FILE_NAME_LENGTH) {
        issues.push(format!(
            "File name truncated to {MAX_FILE_NAME_LENGTH} characters"
        ));
    }

    SanitizeResult::new(s, issues)
}

// ---------------------------------------------------------------------------
// sanitize_content
// ---------------------------------------------------------------------------

/// Sanitize file content according to its type (extension without the dot).
pub fn sanitize_content(content: &str, file_type: &str) -> SanitizeResult {
    let mut issues = Vec::new();
    let mut s = content.to_string();

    if truncate_bytes(&mut s, MAX_CONTENT_LENGTH) {
        issues.push(format!("Content truncated to {MAX_CONTENT_LENGTH} bytes"));
    }

    let kind = file_type.trim_start_matches('.').to_ascii_lowercase();
    match kind.as_str() {
        "html" | "htm" | "md" | "markdown" => strip_active_markup(&mut s, &mut issues),
        "js" | "ts" | "jsx" | "tsx" | "mjs" | "cjs" => flag_suspicious_comments(&s, &mut issues),
        "json" => {
            if let Err(e) = serde_json::from_str::<serde_json::Value>(&s) {
                issues.push(format!("Invalid JSON: {e}"));
            }
        }
        _ => {}
    }

    SanitizeResult::new(s, issues)
}

fn strip_active_markup(s: &mut String, issues: &mut Vec<String>) {
    let blocks = replace_counted(active_block_re(), s, "");
    let tags = replace_counted(active_tag_re(), s, "");
    if blocks || tags {
        issues.push("Removed script/iframe/embed/object tags".to_string());
    }
    if replace_counted(js_url_re(), s, "") {
        issues.push("Removed javascript: URLs".to_string());
    }

    let before = s.len();
    *s = any_tag_re()
        .replace_all(s, |caps: &regex::Captures| {
            event_handler_re().replace_all(&caps[0], "").into_owned()
        })
        .into_owned();
    if s.len() != before {
        issues.push("Removed inline event handlers".to_string());
    }
}

fn flag_suspicious_comments(s: &str, issues: &mut Vec<String>) {
    for comment in code_comment_re().find_iter(s) {
        let text = comment.as_str();
        if shell_meta_re().is_match(text) {
            let snippet: String = text.chars().take(60).collect();
            issues.push(format!("Suspicious shell pattern in comment: {snippet}"));
        }
    }
}

// ---------------------------------------------------------------------------
// sanitize_purpose
// ---------------------------------------------------------------------------

pub fn sanitize_purpose(text: &str) -> SanitizeResult {
    let mut issues = Vec::new();
    let mut s = text.trim().to_string();

    if replace_counted(script_block_re(), &mut s, "") {
        issues.push("Removed script content".to_string());
    }
    if replace_counted(any_tag_re(), &mut s, "") {
        issues.push("Removed HTML tags".to_string());
    }
    s = s.trim().to_string();

    for (label, pattern) in sql_purpose_res() {
        if pattern.is_match(&s) {
            issues.push(format!("Potential SQL injection: {label}"));
        }
    }

    if truncate_chars(&mut s, MAX_PURPOSE_LENGTH) {
        issues.push(format!("Purpose truncated to {MAX_PURPOSE_LENGTH} characters"));
    }

    SanitizeResult::new(s, issues)
}

// ---------------------------------------------------------------------------
// sanitize_text
// ---------------------------------------------------------------------------

/// Clean free text stored in a queue item: active markup and every HTML tag
/// are removed, length is capped like file content.
pub fn sanitize_text(text: &str) -> SanitizeResult {
    let mut s = text.to_string();
    let mut issues = Vec::new();

    if truncate_bytes(&mut s, MAX_CONTENT_LENGTH) {
        issues.push(format!("Text truncated to {MAX_CONTENT_LENGTH} bytes"));
    }
    if replace_counted(active_block_re(), &mut s, "") {
        issues.push("Removed script content".to_string());
    }
    if replace_counted(any_tag_re(), &mut s, "") {
        issues.push("Removed HTML tags".to_string());
    }
    if replace_counted(js_url_re(), &mut s, "") {
        issues.push("Removed javascript: URLs".to_string());
    }

    SanitizeResult::new(s, issues)
}

// ---------------------------------------------------------------------------
// detect_threats
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreatKind {
    PathTraversal,
    CommandInjection,
    ScriptInjection,
    SqlInjection,
    FileInclusion,
}

impl fmt::Display for ThreatKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ThreatKind::PathTraversal => "path_traversal",
            ThreatKind::CommandInjection => "command_injection",
            ThreatKind::ScriptInjection => "script_injection",
            ThreatKind::SqlInjection => "sql_injection",
            ThreatKind::FileInclusion => "file_inclusion",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreatLevel {
    None,
    Low,
    Medium,
    High,
    Critical,
}

impl ThreatLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            ThreatLevel::None => "none",
            ThreatLevel::Low => "low",
            ThreatLevel::Medium => "medium",
            ThreatLevel::High => "high",
            ThreatLevel::Critical => "critical",
        }
    }
}

impl fmt::Display for ThreatLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Threat {
    pub kind: ThreatKind,
    /// Source of the pattern that matched.
    pub pattern: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreatReport {
    pub safe: bool,
    pub threats: Vec<Threat>,
    pub threat_level: ThreatLevel,
}

const THREAT_PATTERNS: &[(ThreatKind, &str)] = &[
    (ThreatKind::PathTraversal, r"\.\./"),
    (ThreatKind::PathTraversal, r"\.\.\\"),
    (ThreatKind::PathTraversal, r"(?i)%2e%2e"),
    (ThreatKind::PathTraversal, r"(?i)%252e"),
    (ThreatKind::PathTraversal, r"(?i)\x00|%00"),
    (ThreatKind::CommandInjection, r"\$\("),
    (ThreatKind::CommandInjection, r"`[^`]+`"),
    (
        ThreatKind::CommandInjection,
        r"[;&|]\s*(?:rm|cat|ls|curl|wget|nc|bash|sh|chmod|chown|kill|python|perl)\b",
    ),
    (ThreatKind::CommandInjection, r"\brm\s+-[rf]+"),
    (ThreatKind::CommandInjection, r">\s*/dev/"),
    (ThreatKind::ScriptInjection, r"(?i)<script\b"),
    (ThreatKind::ScriptInjection, r"(?i)javascript\s*:"),
    (ThreatKind::ScriptInjection, r"(?i)<[^>]+\bon[a-z]+\s*="),
    (ThreatKind::ScriptInjection, r"(?i)<iframe\b"),
    (ThreatKind::ScriptInjection, r"(?i)\beval\s*\("),
    (
        ThreatKind::SqlInjection,
        r#"(?i)\b(?:or|and)\s+['"]?\w+['"]?\s*=\s*['"]?\w+"#,
    ),
    (ThreatKind::SqlInjection, r"(?i)\bunion\s+(?:all\s+)?select\b"),
    (ThreatKind::SqlInjection, r"(?i)\bdrop\s+table\b"),
    (ThreatKind::SqlInjection, r"(?i);\s*(?:delete|insert|update)\s"),
    (ThreatKind::SqlInjection, r"'\s*--"),
    (ThreatKind::FileInclusion, r"(?i)\bphp://"),
    (ThreatKind::FileInclusion, r"(?i)\bfile://"),
    (ThreatKind::FileInclusion, r"(?i)\bexpect://"),
    (ThreatKind::FileInclusion, r"(?i)\bphar://"),
    (ThreatKind::FileInclusion, r"(?i)\bzip://"),
    (ThreatKind::FileInclusion, r"(?i)\bdata:[a-z]+/[a-z0-9.+\-]+[;,]"),
];

fn threat_res() -> &'static [(ThreatKind, Regex)] {
    static RES: OnceLock<Vec<(ThreatKind, Regex)>> = OnceLock::new();
    RES.get_or_init(|| {
        THREAT_PATTERNS
            .iter()
            .map(|(kind, p)| (*kind, Regex::new(p).unwrap()))
            .collect()
    })
}

/// Classify `input` against the known attack families without changing it.
pub fn detect_threats(input: &str) -> ThreatReport {
    let threats: Vec<Threat> = threat_res()
        .iter()
        .filter(|(_, pattern)| pattern.is_match(input))
        .map(|(kind, pattern)| Threat {
            kind: *kind,
            pattern: pattern.as_str().to_string(),
        })
        .collect();

    let kinds: BTreeSet<ThreatKind> = threats.iter().map(|t| t.kind).collect();
    let threat_level = if kinds.contains(&ThreatKind::PathTraversal)
        || kinds.contains(&ThreatKind::CommandInjection)
    {
        ThreatLevel::Critical
    } else if kinds.contains(&ThreatKind::ScriptInjection)
        || kinds.contains(&ThreatKind::SqlInjection)
    {
        ThreatLevel::High
    } else if threats.len() > 3 {
        ThreatLevel::Medium
    } else if !threats.is_empty() {
        ThreatLevel::Low
    } else {
        ThreatLevel::None
    };

    ThreatReport {
        safe: threats.is_empty(),
        threats,
        threat_level,
    }
}

// ---------------------------------------------------------------------------
// sanitize_file_operation
// ---------------------------------------------------------------------------

/// Inputs to a file operation arriving from outside the process. Fields not
/// listed here are dropped during deserialization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileOperationInput {
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    /// Overrides the type inferred from the path extension.
    #[serde(default)]
    pub file_type: Option<String>,
    #[serde(default)]
    pub purpose: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub force: Option<bool>,
    #[serde(default)]
    pub justification: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SanitizedFileOperation {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub purpose: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub force: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub justification: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileOperationResult {
    pub valid: bool,
    pub issues: Vec<String>,
    pub sanitized: SanitizedFileOperation,
}

pub fn sanitize_file_operation(input: &FileOperationInput) -> FileOperationResult {
    let mut issues = Vec::new();
    let mut sanitized = SanitizedFileOperation {
        category: input.category.clone(),
        tags: input.tags.clone(),
        force: input.force,
        justification: input.justification.clone(),
        ..Default::default()
    };

    if let Some(path) = &input.path {
        let result = sanitize_path(path);
        issues.extend(result.issues.iter().map(|i| format!("path: {i}")));
        sanitized.path = Some(result.sanitized);
    }

    if let Some(content) = &input.content {
        let file_type = input
            .file_type
            .clone()
            .or_else(|| {
                input.path.as_deref().and_then(|p| {
                    Path::new(p)
                        .extension()
                        .map(|e| e.to_string_lossy().into_owned())
                })
            })
            .unwrap_or_default();
        let result = sanitize_content(content, &file_type);
        issues.extend(result.issues.iter().map(|i| format!("content: {i}")));
        sanitized.content = Some(result.sanitized);
    }

    if let Some(purpose) = &input.purpose {
        let result = sanitize_purpose(purpose);
        issues.extend(result.issues.iter().map(|i| format!("purpose: {i}")));
        sanitized.purpose = Some(result.sanitized);
    }

    FileOperationResult {
        valid: issues.is_empty(),
        issues,
        sanitized,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
