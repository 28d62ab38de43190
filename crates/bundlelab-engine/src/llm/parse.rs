//! Recovery of mappings from free-form model replies.
//!
//! Replies are supposed to be a single JSON object but routinely arrive with
//! prose around them, Python-literal syntax, comments, missing closers or
//! several objects glued together. [`parse`] extracts the first object and
//! runs an ordered ladder of independent repair strategies over it; the first
//! one that yields a mapping of the requested [`Schema`] wins. Every attempted
//! strategy leaves a [`Diagnostic`] behind.

use bundlelab_core::bundle::CandidateShape;
use bundlelab_core::rating::ScoreVector;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::OnceLock;

/// Expected shape of the mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Schema {
    /// label → list of `product<N>` references
    Bundle,
    /// label → intent text, or label → {rater label → score vector}
    Intent,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParseOptions {
    /// Allow placeholder score synthesis as the last resort for intent
    /// ratings.
    pub permissive: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseStatus {
    Ok,
    ParseFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Extract,
    Direct,
    BraceRepair,
    Lenient,
    StrictJson,
    Placeholder,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub strategy: Strategy,
    pub succeeded: bool,
    pub detail: String,
}

impl Diagnostic {
    fn ok(strategy: Strategy, detail: impl Into<String>) -> Self {
        Self {
            strategy,
            succeeded: true,
            detail: detail.into(),
        }
    }

    fn failed(strategy: Strategy, detail: impl Into<String>) -> Self {
        Self {
            strategy,
            succeeded: false,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParseOutcome {
    pub status: ParseStatus,
    /// Empty when parsing failed.
    pub value: Map<String, Value>,
    pub diagnostics: Vec<Diagnostic>,
}

/// One entry of a parsed intent mapping.
#[derive(Debug, Clone, PartialEq)]
pub enum IntentEntry {
    Text(String),
    /// Rater scores for the generated (`intent1`) and reference (`intent2`)
    /// intents.
    Rated {
        generated: Option<ScoreVector>,
        reference: Option<ScoreVector>,
    },
    Unrecognized,
}

impl IntentEntry {
    fn from_value(value: &Value) -> Self {
        match value {
            Value::String(text) => IntentEntry::Text(text.trim().to_string()),
            Value::Array(entries) if !entries.is_empty() && entries.iter().all(Value::is_string) => {
                let parts: Vec<&str> = entries.iter().filter_map(Value::as_str).collect();
                IntentEntry::Text(parts.join(", "))
            }
            Value::Array(_) => match ScoreVector::from_value(value) {
                Some(scores) => IntentEntry::Rated {
                    generated: Some(scores),
                    reference: None,
                },
                None => IntentEntry::Unrecognized,
            },
            Value::Object(scores) => {
                // Raters are asked for intent1/intent2 but sometimes key the
                // scores by the intent text instead.
                let generated = scores.get("intent1").or_else(|| scores.values().next());
                let reference = scores.get("intent2").or_else(|| scores.values().nth(1));
                let generated = generated.and_then(ScoreVector::from_value);
                let reference = reference.and_then(ScoreVector::from_value);
                if generated.is_none() && reference.is_none() {
                    IntentEntry::Unrecognized
                } else {
                    IntentEntry::Rated {
                        generated,
                        reference,
                    }
                }
            }
            _ => IntentEntry::Unrecognized,
        }
    }
}

impl ParseOutcome {
    fn failed(diagnostics: Vec<Diagnostic>) -> Self {
        Self {
            status: ParseStatus::ParseFailed,
            value: Map::new(),
            diagnostics,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == ParseStatus::Ok
    }

    /// The parsed mapping as a bundle candidate. A failed parse is absent.
    pub fn as_candidate(&self) -> CandidateShape {
        if !self.is_ok() {
            return CandidateShape::Absent;
        }
        CandidateShape::from_value(&Value::Object(self.value.clone()))
    }

    pub fn as_intents(&self) -> Vec<(String, IntentEntry)> {
        self.value
            .iter()
            .map(|(label, value)| (label.clone(), IntentEntry::from_value(value)))
            .collect()
    }

    /// `(label, intent text)` for every textual intent.
    pub fn intent_texts(&self) -> Vec<(String, String)> {
        self.as_intents()
            .into_iter()
            .filter_map(|(label, entry)| match entry {
                IntentEntry::Text(text) => Some((label, text)),
                _ => None,
            })
            .collect()
    }

    /// Name of the strategy that produced the value.
    pub fn winning_strategy(&self) -> Option<Strategy> {
        if !self.is_ok() {
            return None;
        }
        self.diagnostics
            .iter()
            .rev()
            .find(|diagnostic| diagnostic.succeeded)
            .map(|diagnostic| diagnostic.strategy)
    }
}

type StrategyFn = fn(&str) -> Result<Value, String>;

/// Parse a model reply into a mapping of the given schema.
pub fn parse(text: &str, schema: Schema, options: ParseOptions) -> ParseOutcome {
    let mut diagnostics = Vec::new();
    let cleaned = normalize_text(strip_markdown_fences(text));

    let Some(fragment) = extract_object(&cleaned) else {
        diagnostics.push(Diagnostic::failed(Strategy::Extract, "no '{' in reply"));
        return ParseOutcome::failed(diagnostics);
    };
    diagnostics.push(Diagnostic::ok(
        Strategy::Extract,
        format!(
            "{} block(s), {}",
            fragment.blocks,
            if fragment.terminated {
                "terminated"
            } else {
                "unterminated"
            }
        ),
    ));

    let ladder: [(Strategy, StrategyFn); 3] = [
        (Strategy::Direct, parse_direct),
        (Strategy::BraceRepair, parse_brace_repair),
        (Strategy::Lenient, parse_lenient),
    ];
    for (strategy, attempt) in ladder {
        if let Some(value) = run_strategy(strategy, attempt(&fragment.text), schema, &mut diagnostics)
        {
            return ok(value, diagnostics);
        }
    }

    if schema == Schema::Intent {
        if let Some(value) = run_strategy(
            Strategy::StrictJson,
            parse_strict_span(&cleaned),
            schema,
            &mut diagnostics,
        ) {
            return ok(value, diagnostics);
        }
        if options.permissive {
            if let Some(value) = run_strategy(
                Strategy::Placeholder,
                synthesize_placeholder_scores(&cleaned),
                schema,
                &mut diagnostics,
            ) {
                return ok(value, diagnostics);
            }
        }
    }

    ParseOutcome::failed(diagnostics)
}

fn ok(value: Map<String, Value>, diagnostics: Vec<Diagnostic>) -> ParseOutcome {
    ParseOutcome {
        status: ParseStatus::Ok,
        value,
        diagnostics,
    }
}

fn run_strategy(
    strategy: Strategy,
    result: Result<Value, String>,
    schema: Schema,
    diagnostics: &mut Vec<Diagnostic>,
) -> Option<Map<String, Value>> {
    match result.and_then(|value| check_schema(value, schema)) {
        Ok(map) => {
            diagnostics.push(Diagnostic::ok(strategy, format!("{} key(s)", map.len())));
            Some(map)
        }
        Err(detail) => {
            diagnostics.push(Diagnostic::failed(strategy, detail));
            None
        }
    }
}

fn check_schema(value: Value, schema: Schema) -> Result<Map<String, Value>, String> {
    let Value::Object(map) = value else {
        return Err("not a mapping".to_string());
    };
    for (label, entry) in &map {
        let fits = match schema {
            Schema::Bundle => entry.is_array(),
            Schema::Intent => entry.is_string() || entry.is_array() || entry.is_object(),
        };
        if !fits {
            return Err(format!("value of '{}' does not fit the {:?} schema", label, schema));
        }
    }
    Ok(map)
}

// ═══════════════════════════════════════════════════════════════════════════
//  Preprocessing
// ═══════════════════════════════════════════════════════════════════════════

/// Strip markdown code fences from a response
fn strip_markdown_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let clean = if trimmed.starts_with("```json") {
        trimmed.strip_prefix("```json").unwrap_or(trimmed)
    } else if trimmed.starts_with("```python") {
        trimmed.strip_prefix("```python").unwrap_or(trimmed)
    } else if trimmed.starts_with("```") {
        trimmed.strip_prefix("```").unwrap_or(trimmed)
    } else {
        trimmed
    };
    let clean = if clean.ends_with("```") {
        clean.strip_suffix("```").unwrap_or(clean)
    } else {
        clean
    };
    clean.trim()
}

/// Smart quotes to ASCII, stray control characters removed.
fn normalize_text(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            '\u{201C}' | '\u{201D}' => '"',
            '\u{2018}' | '\u{2019}' => '\'',
            other => other,
        })
        .filter(|c| !c.is_control() || matches!(c, '\n' | '\t' | '\r'))
        .collect()
}

// ═══════════════════════════════════════════════════════════════════════════
//  Lexing
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lex {
    Code,
    /// Opening or closing quote of a string.
    Delim,
    Text,
}

struct Lexed {
    chars: Vec<char>,
    kinds: Vec<Lex>,
    /// Quote of a string still open at the end of the text.
    open_quote: Option<char>,
}

fn is_quote(c: char) -> bool {
    c == '"' || c == '\''
}

fn is_structural(c: char) -> bool {
    matches!(c, '{' | '}' | '[' | ']' | ':' | ',')
}

/// Next non-whitespace char after `idx` is a separator or closer, or the
/// text ends.
fn ends_token(chars: &[char], idx: usize) -> bool {
    chars[idx + 1..]
        .iter()
        .find(|c| !c.is_whitespace())
        .is_none_or(|c| matches!(*c, ':' | ',' | ']' | '}' | ')'))
}

/// Classify every char as code or string content.
///
/// Double quotes always delimit strings. A single quote opens a string only
/// after a structural char, so apostrophes in bare words stay code, and closes
/// one only before a separator, so apostrophes inside strings survive. A quote
/// of the other kind in front of a separator closes the string too.
fn lex(text: &str) -> Lexed {
    let chars: Vec<char> = text.chars().collect();
    let mut kinds = Vec::with_capacity(chars.len());
    let mut open: Option<char> = None;
    let mut escaped = false;
    let mut prev_code: Option<char> = None;

    for (idx, &c) in chars.iter().enumerate() {
        match open {
            None => {
                let opens = c == '"'
                    || (c == '\''
                        && prev_code.is_none_or(|p| matches!(p, '{' | '[' | '(' | ':' | ',')));
                if opens {
                    open = Some(c);
                    kinds.push(Lex::Delim);
                } else {
                    if !c.is_whitespace() {
                        prev_code = Some(c);
                    }
                    kinds.push(Lex::Code);
                }
            }
            Some(quote) => {
                if escaped {
                    escaped = false;
                    kinds.push(Lex::Text);
                } else if c == '\\' {
                    escaped = true;
                    kinds.push(Lex::Text);
                } else if is_quote(c)
                    && ((c == quote && quote == '"') || ends_token(&chars, idx))
                {
                    open = None;
                    prev_code = Some(c);
                    kinds.push(Lex::Delim);
                } else {
                    kinds.push(Lex::Text);
                }
            }
        }
    }

    Lexed {
        chars,
        kinds,
        open_quote: open,
    }
}

/// Remove `//`, `/* */` and `#` comments outside strings.
fn strip_comments(text: &str) -> String {
    let lexed = lex(text);
    let chars = &lexed.chars;
    let code_at = |idx: usize| lexed.kinds.get(idx) == Some(&Lex::Code);
    let mut out = String::with_capacity(text.len());
    let mut idx = 0;

    while idx < chars.len() {
        let c = chars[idx];
        if code_at(idx) {
            if c == '/' && chars.get(idx + 1) == Some(&'/') && code_at(idx + 1) {
                while idx < chars.len() && chars[idx] != '\n' {
                    idx += 1;
                }
                continue;
            }
            if c == '/' && chars.get(idx + 1) == Some(&'*') && code_at(idx + 1) {
                idx += 2;
                while idx < chars.len() && !(chars[idx] == '*' && chars.get(idx + 1) == Some(&'/')) {
                    idx += 1;
                }
                idx += 2;
                continue;
            }
            if c == '#' {
                while idx < chars.len() && !matches!(chars[idx], '\n' | '}' | ']') {
                    idx += 1;
                }
                continue;
            }
        }
        out.push(c);
        idx += 1;
    }
    out
}

// ═══════════════════════════════════════════════════════════════════════════
//  Extraction
// ═══════════════════════════════════════════════════════════════════════════

struct Fragment {
    text: String,
    blocks: usize,
    terminated: bool,
}

/// The first `{...}` block of the text, with directly following blocks merged
/// into it. An unterminated block runs to the end of the text.
fn extract_object(text: &str) -> Option<Fragment> {
    let start = text.find('{')?;
    let lexed = lex(&strip_comments(&text[start..]));
    let chars = &lexed.chars;
    let len = chars.len();

    let mut bodies: Vec<String> = Vec::new();
    let mut depth = 0usize;
    let mut body_start = 0usize;
    let mut terminated = false;
    let mut idx = 0usize;

    while idx < len {
        if lexed.kinds[idx] == Lex::Code {
            match chars[idx] {
                '{' => {
                    if depth == 0 {
                        body_start = idx + 1;
                    }
                    depth += 1;
                }
                '}' if depth > 0 => {
                    depth -= 1;
                    if depth == 0 {
                        bodies.push(chars[body_start..idx].iter().collect());
                        match next_adjacent_block(chars, idx + 1) {
                            Some(next) => {
                                idx = next;
                                continue;
                            }
                            None => {
                                terminated = true;
                                break;
                            }
                        }
                    }
                }
                _ => {}
            }
        }
        idx += 1;
    }
    if !terminated && depth > 0 {
        bodies.push(chars[body_start..].iter().collect());
    }

    let blocks = bodies.len();
    let joined = bodies
        .iter()
        .map(|body| body.trim())
        .filter(|body| !body.is_empty())
        .collect::<Vec<_>>()
        .join(", ");
    let text = if terminated {
        format!("{{{}}}", joined)
    } else {
        format!("{{{}", joined)
    };
    Some(Fragment {
        text,
        blocks,
        terminated,
    })
}

/// Index of a `{` that follows a closed block after optional whitespace and
/// at most one comma.
fn next_adjacent_block(chars: &[char], from: usize) -> Option<usize> {
    let mut seen_comma = false;
    for (offset, &c) in chars[from..].iter().enumerate() {
        match c {
            c if c.is_whitespace() => continue,
            ',' if !seen_comma => seen_comma = true,
            '{' => return Some(from + offset),
            _ => return None,
        }
    }
    None
}

// ═══════════════════════════════════════════════════════════════════════════
//  Strategies
// ═══════════════════════════════════════════════════════════════════════════

/// (a) JSON first, then the same text read as a Python literal.
fn parse_direct(text: &str) -> Result<Value, String> {
    match serde_json::from_str(text) {
        Ok(value) => Ok(value),
        Err(json_err) => serde_json::from_str(&literal_to_json(text))
            .map_err(|literal_err| format!("json: {}; literal: {}", json_err, literal_err)),
    }
}

/// (b) Close whatever is left open, then parse as in (a).
fn parse_brace_repair(text: &str) -> Result<Value, String> {
    let Some(repaired) = balance_closers(text) else {
        return Err("nothing to repair".to_string());
    };
    parse_direct(&repaired)
}

/// (c) Drop whitespace outside strings and quote bare words.
fn parse_lenient(text: &str) -> Result<Value, String> {
    let quoted = quote_bare_words(text);
    let repaired = balance_closers(&quoted).unwrap_or(quoted);
    serde_json::from_str(&repaired).map_err(|err| err.to_string())
}

/// (d) Strict JSON over the widest brace span of the whole reply.
fn parse_strict_span(text: &str) -> Result<Value, String> {
    let (Some(start), Some(end)) = (text.find('{'), text.rfind('}')) else {
        return Err("no brace span".to_string());
    };
    if end <= start {
        return Err("no brace span".to_string());
    }
    serde_json::from_str(&text[start..=end]).map_err(|err| err.to_string())
}

fn bundle_skeleton_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r#"(?i)["']?bundle\s*(\d+)["']?\s*:\s*\{[^{}]*\d[^{}]*\}"#).ok())
        .as_ref()
}

/// Neutral scores for the generated and reference intents.
const PLACEHOLDER_GENERATED: [u32; 3] = [3, 3, 2];
const PLACEHOLDER_REFERENCE: [u32; 3] = [3, 2, 1];

/// (e) Placeholder scores for every `bundle<N>: {...digits...}` fragment.
fn synthesize_placeholder_scores(text: &str) -> Result<Value, String> {
    let Some(pattern) = bundle_skeleton_pattern() else {
        return Err("bundle skeleton pattern unavailable".to_string());
    };
    let mut map = Map::new();
    for captures in pattern.captures_iter(text) {
        let number = &captures[1];
        map.insert(
            format!("bundle{}", number),
            serde_json::json!({
                "intent1": PLACEHOLDER_GENERATED,
                "intent2": PLACEHOLDER_REFERENCE,
            }),
        );
    }
    if map.is_empty() {
        Err("no bundle score skeleton".to_string())
    } else {
        Ok(Value::Object(map))
    }
}

// ═══════════════════════════════════════════════════════════════════════════
//  Rewriting
// ═══════════════════════════════════════════════════════════════════════════

/// Close an open string, drop stray closers, insert closers an inner bracket
/// is missing and append the ones still open at the end. `None` when the text
/// needs no repair.
fn balance_closers(text: &str) -> Option<String> {
    let lexed = lex(text);
    let mut out = String::with_capacity(text.len() + 8);
    let mut stack: Vec<char> = Vec::new();
    let mut changed = false;

    for (&c, &kind) in lexed.chars.iter().zip(&lexed.kinds) {
        if kind != Lex::Code {
            out.push(c);
            continue;
        }
        match c {
            '{' => {
                stack.push('}');
                out.push(c);
            }
            '[' | '(' => {
                stack.push(']');
                out.push('[');
            }
            '}' | ']' | ')' => {
                let c = if c == ')' { ']' } else { c };
                if !stack.contains(&c) {
                    changed = true;
                    continue;
                }
                while let Some(expected) = stack.pop() {
                    out.push(expected);
                    if expected == c {
                        break;
                    }
                    changed = true;
                }
            }
            _ => out.push(c),
        }
    }

    if let Some(quote) = lexed.open_quote {
        out.push(quote);
        changed = true;
    }
    if !stack.is_empty() {
        let kept = out.trim_end().trim_end_matches(',').trim_end().len();
        out.truncate(kept);
        while let Some(closer) = stack.pop() {
            out.push(closer);
        }
        changed = true;
    }
    changed.then_some(out)
}

/// Index of the next non-whitespace char at or after `from`.
fn next_non_space(chars: &[char], from: usize) -> Option<usize> {
    (from..chars.len()).find(|&idx| !chars[idx].is_whitespace())
}

fn is_trailing_comma(lexed: &Lexed, idx: usize) -> bool {
    lexed.chars[idx] == ','
        && next_non_space(&lexed.chars, idx + 1).is_some_and(|next| {
            lexed.kinds[next] == Lex::Code && matches!(lexed.chars[next], '}' | ']' | ')')
        })
}

/// Copy string content at `idx` as JSON string content. Returns the next
/// index to read.
fn push_string_content(lexed: &Lexed, idx: usize, out: &mut String) -> usize {
    let chars = &lexed.chars;
    let c = chars[idx];
    if c == '\\' {
        match chars.get(idx + 1) {
            Some(&'\'') => out.push('\''),
            Some(&next) => {
                out.push('\\');
                out.push(next);
            }
            None => {}
        }
        return idx + 2;
    }
    match c {
        '"' => out.push_str("\\\""),
        '\n' => out.push_str("\\n"),
        '\t' => out.push_str("\\t"),
        '\r' => out.push_str("\\r"),
        other => out.push(other),
    }
    idx + 1
}

fn json_keyword(word: &str) -> Option<&'static str> {
    match word {
        "True" | "true" => Some("true"),
        "False" | "false" => Some("false"),
        "None" | "null" => Some("null"),
        _ => None,
    }
}

/// Python-literal syntax to JSON: single-quoted strings, tuples,
/// `True`/`False`/`None` and trailing commas.
fn literal_to_json(text: &str) -> String {
    let lexed = lex(text);
    let chars = &lexed.chars;
    let mut out = String::with_capacity(text.len());
    let mut idx = 0;

    while idx < chars.len() {
        let c = chars[idx];
        match lexed.kinds[idx] {
            Lex::Delim => {
                out.push('"');
                idx += 1;
            }
            Lex::Text => idx = push_string_content(&lexed, idx, &mut out),
            Lex::Code if c.is_alphabetic() || c == '_' => {
                let end = (idx..chars.len())
                    .find(|&i| {
                        lexed.kinds[i] != Lex::Code
                            || !(chars[i].is_alphanumeric() || chars[i] == '_')
                    })
                    .unwrap_or(chars.len());
                let word: String = chars[idx..end].iter().collect();
                out.push_str(json_keyword(&word).unwrap_or(&word));
                idx = end;
            }
            Lex::Code if is_trailing_comma(&lexed, idx) => idx += 1,
            Lex::Code => {
                out.push(match c {
                    '(' => '[',
                    ')' => ']',
                    other => other,
                });
                idx += 1;
            }
        }
    }
    out
}

/// Literal conversion plus quoting of every bare word, with whitespace outside
/// strings removed.
fn quote_bare_words(text: &str) -> String {
    let lexed = lex(text);
    let chars = &lexed.chars;
    let mut out = String::with_capacity(text.len() + 16);
    let mut idx = 0;

    while idx < chars.len() {
        let c = chars[idx];
        match lexed.kinds[idx] {
            Lex::Delim => {
                out.push('"');
                idx += 1;
            }
            Lex::Text => idx = push_string_content(&lexed, idx, &mut out),
            Lex::Code if c.is_whitespace() => idx += 1,
            Lex::Code if is_trailing_comma(&lexed, idx) => idx += 1,
            Lex::Code if is_structural(c) => {
                out.push(c);
                idx += 1;
            }
            Lex::Code => {
                let end = (idx..chars.len())
                    .find(|&i| lexed.kinds[i] != Lex::Code || is_structural(chars[i]))
                    .unwrap_or(chars.len());
                let word: String = chars[idx..end].iter().collect();
                let word = word.trim();
                if let Some(keyword) = json_keyword(word) {
                    out.push_str(keyword);
                } else if serde_json::from_str::<serde_json::Number>(word).is_ok() {
                    out.push_str(word);
                } else {
                    out.push_str(&Value::String(word.to_string()).to_string());
                }
                idx = end;
            }
        }
    }
    out
}
