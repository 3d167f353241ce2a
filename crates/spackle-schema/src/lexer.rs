//! Tokenizer for spec strings.
//!
//! Each [`TokenKind`] owns one pattern. At every position the patterns are
//! tried in the order of [`TokenKind::PRIORITY`] and the first one that
//! matches wins, so the order of that list is part of the grammar:
//!
//! - `^[` and `]` come before the bare `^` sigil.
//! - `@ref=version` comes before `@git.ref`, which comes before `@version-list`.
//! - `++x`/`~~x`/`--x` come before `+x`/`~x`/`-x`.
//! - `k==v` comes before `k=v`.
//! - `%compiler@version` comes before `%compiler`.
//! - file names come before package names, dotted names before plain ones.
//! - whitespace is last, and is dropped before tokens reach a parser.

use regex::Regex;
use std::fmt;
use std::sync::LazyLock;
use thiserror::Error;

const IDENTIFIER: &str = r"(?:[a-zA-Z_0-9][a-zA-Z_0-9\-]*)";
const GIT_HASH: &str = r"(?:[A-Fa-f0-9]{40})";
const GIT_REF: &str = r"(?:[a-zA-Z_0-9][a-zA-Z_0-9./\-]*)";
const NAME: &str = r"(?:[a-zA-Z_0-9][a-zA-Z_0-9\-.]*)";
const HASH: &str = r"(?:[a-zA-Z_0-9]+)";
/// Values that may appear unquoted after `=`.
const VALUE: &str = r"(?:[a-zA-Z_0-9+*.,:=~/\\\-]+)";
/// Single- or double-quoted values; a backslash escapes the next character.
const QUOTED_VALUE: &str = r#"(?:'(?:[^'\\]|\\.)*'|"(?:[^"\\]|\\.)*")"#;
const VERSION: &str = r"(?:=?[a-zA-Z0-9_][a-zA-Z_0-9\-.]*\b)";

#[cfg(not(windows))]
const FILENAME: &str = r"(?:(?:\.|/|[a-zA-Z0-9_\-]*/)[a-zA-Z0-9_\-./]*(?:\.json|\.yaml))";
#[cfg(windows)]
const FILENAME: &str =
    r"(?:(?:\.|[a-zA-Z0-9_\-]*\\|[a-zA-Z]:\\)[a-zA-Z0-9_\-.\\]*(?:\.json|\.yaml))";

fn dotted_identifier() -> String {
    format!(r"(?:{IDENTIFIER}(?:\.{IDENTIFIER})+)")
}

fn git_version() -> String {
    format!(r"(?:(?:git\.{GIT_REF})|{GIT_HASH})")
}

fn version_list() -> String {
    let range = format!(r"(?:{VERSION}?:{VERSION}?)");
    format!(r"(?:(?:{range}|{VERSION})(?:\s*,\s*(?:{range}|{VERSION}))*)")
}

/// Kinds of token in the spec grammar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenKind {
    StartEdgeProperties,
    EndEdgeProperties,
    Dependency,
    VersionHashPair,
    GitVersion,
    Version,
    PropagatedBoolVariant,
    BoolVariant,
    PropagatedKeyValuePair,
    KeyValuePair,
    CompilerAndVersion,
    Compiler,
    Filename,
    FullyQualifiedPackageName,
    UnqualifiedPackageName,
    DagHash,
    Whitespace,
}

impl TokenKind {
    /// Lexical priority, highest first. See the module docs before reordering.
    pub const PRIORITY: [TokenKind; 17] = [
        TokenKind::StartEdgeProperties,
        TokenKind::EndEdgeProperties,
        TokenKind::Dependency,
        TokenKind::VersionHashPair,
        TokenKind::GitVersion,
        TokenKind::Version,
        TokenKind::PropagatedBoolVariant,
        TokenKind::BoolVariant,
        TokenKind::PropagatedKeyValuePair,
        TokenKind::KeyValuePair,
        TokenKind::CompilerAndVersion,
        TokenKind::Compiler,
        TokenKind::Filename,
        TokenKind::FullyQualifiedPackageName,
        TokenKind::UnqualifiedPackageName,
        TokenKind::DagHash,
        TokenKind::Whitespace,
    ];

    fn pattern(self) -> String {
        match self {
            TokenKind::StartEdgeProperties => r"\^\[".to_owned(),
            TokenKind::EndEdgeProperties => r"\]".to_owned(),
            TokenKind::Dependency => r"\^".to_owned(),
            TokenKind::VersionHashPair => format!("@{}={VERSION}", git_version()),
            TokenKind::GitVersion => format!("@{}", git_version()),
            TokenKind::Version => format!(r"@\s*{}", version_list()),
            TokenKind::PropagatedBoolVariant => format!(r"(?:\+\+|~~|--)\s*{NAME}"),
            TokenKind::BoolVariant => format!(r"[~+\-]\s*{NAME}"),
            TokenKind::PropagatedKeyValuePair => format!("{NAME}==(?:{VALUE}|{QUOTED_VALUE})"),
            TokenKind::KeyValuePair => format!("{NAME}=(?:{VALUE}|{QUOTED_VALUE})"),
            TokenKind::CompilerAndVersion => {
                format!(r"%\s*{NAME}\s*@\s*{}", version_list())
            }
            TokenKind::Compiler => format!(r"%\s*{NAME}"),
            TokenKind::Filename => FILENAME.to_owned(),
            TokenKind::FullyQualifiedPackageName => dotted_identifier(),
            TokenKind::UnqualifiedPackageName => IDENTIFIER.to_owned(),
            TokenKind::DagHash => format!("/{HASH}"),
            TokenKind::Whitespace => r"\s+".to_owned(),
        }
    }

    /// Kinds whose text ends in a version list.
    fn ends_in_version_list(self) -> bool {
        matches!(self, TokenKind::Version | TokenKind::CompilerAndVersion)
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TokenKind::StartEdgeProperties => "START_EDGE_PROPERTIES",
            TokenKind::EndEdgeProperties => "END_EDGE_PROPERTIES",
            TokenKind::Dependency => "DEPENDENCY",
            TokenKind::VersionHashPair => "VERSION_HASH_PAIR",
            TokenKind::GitVersion => "GIT_VERSION",
            TokenKind::Version => "VERSION",
            TokenKind::PropagatedBoolVariant => "PROPAGATED_BOOL_VARIANT",
            TokenKind::BoolVariant => "BOOL_VARIANT",
            TokenKind::PropagatedKeyValuePair => "PROPAGATED_KEY_VALUE_PAIR",
            TokenKind::KeyValuePair => "KEY_VALUE_PAIR",
            TokenKind::CompilerAndVersion => "COMPILER_AND_VERSION",
            TokenKind::Compiler => "COMPILER",
            TokenKind::Filename => "FILENAME",
            TokenKind::FullyQualifiedPackageName => "FULLY_QUALIFIED_PACKAGE_NAME",
            TokenKind::UnqualifiedPackageName => "UNQUALIFIED_PACKAGE_NAME",
            TokenKind::DagHash => "DAG_HASH",
            TokenKind::Whitespace => "WS",
        };
        f.write_str(name)
    }
}

/// The compiled priority list, anchored at the start of the remaining input.
static RULES: LazyLock<Vec<(TokenKind, Regex)>> = LazyLock::new(|| {
    TokenKind::PRIORITY
        .iter()
        .map(|kind| {
            let anchored = format!("^(?:{})", kind.pattern());
            let regex = Regex::new(&anchored).expect("token patterns are valid");
            (*kind, regex)
        })
        .collect()
});

/// Catch-all used only while analysing input that failed to tokenize.
static UNEXPECTED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:.\s*)").expect("catch-all pattern is valid"));

/// Length of the longest token at the start of `rest`, with its kind.
fn match_at(rest: &str) -> Option<(TokenKind, usize)> {
    for (kind, regex) in RULES.iter() {
        let Some(m) = regex.find(rest) else {
            continue;
        };
        if m.end() == 0 {
            continue;
        }
        let mut len = m.end();
        if kind.ends_in_version_list() {
            len = release_assignment_bound(rest, len);
        }
        return Some((*kind, len));
    }
    None
}

/// A range's upper bound must not swallow the key of a following `key=value`
/// (`@1.2:cflags=-O3`); give the key back by ending the token at the colon.
fn release_assignment_bound(rest: &str, len: usize) -> usize {
    if !rest[len..].trim_start().starts_with('=') {
        return len;
    }
    let matched = &rest[..len];
    let last_item = matched.rfind(',').map_or(0, |i| i + 1);
    match matched[last_item..].find(':') {
        Some(colon) if last_item + colon + 1 < len => last_item + colon + 1,
        _ => len,
    }
}

/// One lexical unit of a spec string, with its byte span in the input.
#[derive(Debug, Clone)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
    pub start: usize,
    pub end: usize,
}

impl Token {
    pub fn new(kind: TokenKind, text: impl Into<String>) -> Self {
        let text = text.into();
        let end = text.len();
        Self {
            kind,
            text,
            start: 0,
            end,
        }
    }
}

impl PartialEq for Token {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.text == other.text
    }
}

impl Eq for Token {}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.kind, self.text)
    }
}

/// A span produced while analysing untokenizable input. `kind` is `None`
/// for text that no token pattern accepts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LexSegment {
    pub kind: Option<TokenKind>,
    pub start: usize,
    pub end: usize,
}

/// Input that contains text no token pattern accepts.
#[derive(Debug, Clone, Error)]
#[error("unexpected tokens in the spec string\n{text}\n{}", render_underline(.text, .segments))]
pub struct TokenizationError {
    pub text: String,
    pub segments: Vec<LexSegment>,
}

impl TokenizationError {
    fn analyze(text: &str) -> Self {
        let mut segments = Vec::new();
        let mut pos = 0;
        while pos < text.len() {
            let rest = &text[pos..];
            let (kind, len) = match match_at(rest) {
                Some((kind, len)) => (Some(kind), len),
                None => match UNEXPECTED.find(rest) {
                    Some(m) => (None, m.end()),
                    None => break,
                },
            };
            segments.push(LexSegment {
                kind,
                start: pos,
                end: pos + len,
            });
            pos += len;
        }
        Self {
            text: text.to_owned(),
            segments,
        }
    }

    /// Caret line marking every unexpected character, aligned under the input.
    pub fn underline(&self) -> String {
        render_underline(&self.text, &self.segments)
    }

    /// Byte spans of the rejected text, trailing whitespace excluded and
    /// adjacent spans merged.
    pub fn unexpected_spans(&self) -> Vec<(usize, usize)> {
        let mut spans: Vec<(usize, usize)> = Vec::new();
        for seg in self.segments.iter().filter(|s| s.kind.is_none()) {
            let trimmed = self.text[seg.start..seg.end].trim_end().len();
            let span = (seg.start, seg.start + trimmed);
            match spans.last_mut() {
                Some(last) if last.1 == span.0 => last.1 = span.1,
                _ => spans.push(span),
            }
        }
        spans
    }
}

fn render_underline(text: &str, segments: &[LexSegment]) -> String {
    let mut line = String::new();
    for seg in segments {
        let width = text[seg.start..seg.end].chars().count();
        let mark = if seg.kind.is_none() { '^' } else { ' ' };
        line.extend(std::iter::repeat_n(mark, width));
    }
    line.trim_end().to_owned()
}

/// Lazy, single-pass token stream over a spec string.
///
/// Yields every token including whitespace. On reaching text that no
/// pattern accepts, yields one [`TokenizationError`] and then stops.
#[derive(Debug, Clone)]
pub struct Tokenizer<'a> {
    text: &'a str,
    pos: usize,
    done: bool,
}

impl Iterator for Tokenizer<'_> {
    type Item = Result<Token, TokenizationError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.pos >= self.text.len() {
            return None;
        }
        let rest = &self.text[self.pos..];
        if let Some((kind, len)) = match_at(rest) {
            let start = self.pos;
            self.pos += len;
            return Some(Ok(Token {
                kind,
                text: rest[..len].to_owned(),
                start,
                end: self.pos,
            }));
        }
        self.done = true;
        tracing::debug!(position = self.pos, "spec text failed to tokenize");
        Some(Err(TokenizationError::analyze(self.text)))
    }
}

/// Tokenize `text`. Empty input yields nothing.
pub fn tokenize(text: &str) -> Tokenizer<'_> {
    Tokenizer {
        text,
        pos: 0,
        done: false,
    }
}
