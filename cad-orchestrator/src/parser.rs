//! Response parser
//!
//! Pulls the JSON plan and the script out of a free-text completion. Each
//! field has its own ordered chain of [`Extractor`]s; the first extractor in
//! a chain that yields something wins, and the two chains never influence
//! each other. Extractors are fail-soft: anything they cannot make sense of
//! is simply "not found".

use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;
use tracing::debug;

static LABELED_JSON: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?is)JSON[_ ]PLAN\s*\**:\**\s*(?:```(?:json)?\s*)?(\{.*?\})\s*(?:```\s*)?\**(?:PYTHON[_ ]CODE|$)",
    )
    .expect("valid labeled JSON regex")
});

static LABELED_FENCED_CODE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)PYTHON[_ ]CODE\s*\**:\**\s*```[ \t]*(?:python|py)?[ \t]*\r?\n(.*?)```")
        .expect("valid labeled fenced code regex")
});

// Code may start on the label line itself
static LABELED_BARE_CODE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)PYTHON[_ ]CODE\s*\**:\**[ \t]*(?:\r?\n)?(.*?)(?:\r?\n[ \t]*\r?\n|$)")
        .expect("valid labeled code regex")
});

static FENCED_PYTHON: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```(?:python|py)[ \t]*\r?\n(.*?)```").expect("valid fenced python regex")
});

/// One pattern matcher for one field of the response
pub trait Extractor<T>: Send + Sync {
    /// Short identifier used in diagnostics
    fn name(&self) -> &'static str;

    fn extract(&self, text: &str) -> Option<T>;
}

/// `JSON_PLAN:` label followed by a brace block, ending at the code label or
/// the end of the text
pub struct LabeledJsonSection;

impl Extractor<Value> for LabeledJsonSection {
    fn name(&self) -> &'static str {
        "labeled_json"
    }

    fn extract(&self, text: &str) -> Option<Value> {
        let block = LABELED_JSON.captures(text)?.get(1)?.as_str();
        serde_json::from_str(block).ok()
    }
}

/// First brace-delimited span anywhere in the text that mentions `"objects"`
pub struct ObjectsJsonScan;

impl Extractor<Value> for ObjectsJsonScan {
    fn name(&self) -> &'static str {
        "objects_scan"
    }

    fn extract(&self, text: &str) -> Option<Value> {
        let span = balanced_spans(text)
            .find(|span| span.contains("\"objects\""))
            .or_else(|| greedy_span(text).filter(|span| span.contains("\"objects\"")))?;
        serde_json::from_str(span).ok()
    }
}

/// `PYTHON_CODE:` label, preferring a fenced block right after it and
/// otherwise taking the text up to the next blank line
pub struct LabeledCodeSection;

impl Extractor<String> for LabeledCodeSection {
    fn name(&self) -> &'static str {
        "labeled_code"
    }

    fn extract(&self, text: &str) -> Option<String> {
        if let Some(code) = LABELED_FENCED_CODE
            .captures(text)
            .and_then(|caps| caps.get(1))
        {
            return non_empty(code.as_str());
        }

        let bare = LABELED_BARE_CODE.captures(text)?.get(1)?.as_str();
        let bare = match bare.trim_start().strip_prefix("```") {
            Some(rest) => rest.split_once('\n').map_or("", |(_, body)| body),
            None => bare,
        };
        non_empty(bare)
    }
}

/// First fenced block tagged as python, labels ignored
pub struct FencedCodeBlock;

impl Extractor<String> for FencedCodeBlock {
    fn name(&self) -> &'static str {
        "fenced_code"
    }

    fn extract(&self, text: &str) -> Option<String> {
        non_empty(FENCED_PYTHON.captures(text)?.get(1)?.as_str())
    }
}

/// What could be recovered from one completion
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedResponse {
    pub json_plan: Option<Value>,
    pub code: Option<String>,
}

impl ParsedResponse {
    /// Both fields were found
    pub fn is_complete(&self) -> bool {
        self.json_plan.is_some() && self.code.is_some()
    }

    /// Human-readable list of what is missing, for retry feedback
    pub fn missing(&self) -> Option<String> {
        match (self.json_plan.is_some(), self.code.is_some()) {
            (true, true) => None,
            (false, true) => Some("no parseable JSON_PLAN section".to_string()),
            (true, false) => Some("no PYTHON_CODE section".to_string()),
            (false, false) => {
                Some("neither a JSON_PLAN nor a PYTHON_CODE section could be found".to_string())
            }
        }
    }
}

pub struct ResponseParser {
    plan_chain: Vec<Box<dyn Extractor<Value>>>,
    code_chain: Vec<Box<dyn Extractor<String>>>,
}

impl Default for ResponseParser {
    fn default() -> Self {
        Self {
            plan_chain: vec![Box::new(LabeledJsonSection), Box::new(ObjectsJsonScan)],
            code_chain: vec![Box::new(LabeledCodeSection), Box::new(FencedCodeBlock)],
        }
    }
}

impl ResponseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a parser from custom chains
    pub fn with_chains(
        plan_chain: Vec<Box<dyn Extractor<Value>>>,
        code_chain: Vec<Box<dyn Extractor<String>>>,
    ) -> Self {
        Self {
            plan_chain,
            code_chain,
        }
    }

    pub fn parse(&self, text: &str) -> ParsedResponse {
        ParsedResponse {
            json_plan: first_match(&self.plan_chain, text, "json_plan"),
            code: first_match(&self.code_chain, text, "code"),
        }
    }
}

fn first_match<T>(chain: &[Box<dyn Extractor<T>>], text: &str, field: &str) -> Option<T> {
    chain.iter().find_map(|extractor| {
        let found = extractor.extract(text);
        if found.is_some() {
            debug!(field, extractor = extractor.name(), "Extracted response field");
        }
        found
    })
}

fn non_empty(code: &str) -> Option<String> {
    let code = code.trim();
    (!code.is_empty()).then(|| code.to_string())
}

/// Top-level `{...}` spans with balanced braces, skipping braces inside JSON
/// string literals
fn balanced_spans(text: &str) -> impl Iterator<Item = &str> {
    let mut spans = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in text.char_indices() {
        if depth > 0 && in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }

        match c {
            '"' if depth > 0 => in_string = true,
            '{' => {
                if depth == 0 {
                    start = i;
                }
                depth += 1;
            }
            '}' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    spans.push(&text[start..=i]);
                }
            }
            _ => {}
        }
    }

    spans.into_iter()
}

/// First `{` through last `}`
fn greedy_span(text: &str) -> Option<&str> {
    let open = text.find('{')?;
    let close = text.rfind('}')?;
    (close > open).then(|| &text[open..=close])
}
