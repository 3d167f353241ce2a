//! Recursive-descent parsing of spec strings.
//!
//! Grammar accepted:
//!
//! ```text
//! spec            = [name] [node_options] { ^[edge_properties] node }
//!                 | [name] [node_options] hash | filename
//! node            = name [node_options] | [name] [node_options] hash | filename
//! node_options    = [@version_list] [%compiler] { variant }
//! edge_properties = [ deptypes=<list> | virtuals=<list> ]*
//! hash            = /<id>
//! variant         = +id | ~id | -id | ++id | ~~id | --id | id=value | id==value
//! compiler        = id [@version_list]
//! ```
//!
//! Every `^` in one spec string attaches its node directly to the root of
//! that spec; `a ^b ^c` gives `a` two dependencies.

use crate::deptypes::{self, DepFlag};
use crate::hash::HashPrefix;
use crate::lexer::{tokenize, Token, TokenKind, TokenizationError, Tokenizer};
use crate::spec::{
    strip_quotes_and_unescape, AbstractSpec, CompilerSpec, Edge, FlagValue, SpecError,
};
use crate::specfile::{self, SpecFileError};
use crate::version::{Version, VersionConstraint};
use std::collections::BTreeSet;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

#[allow(clippy::trivially_copy_pass_by_ref)]
fn underline(start: &usize, end: &usize, text: &str) -> String {
    let (start, end) = (*start, *end);
    let lead = text.get(..start).map_or(start, |s| s.chars().count());
    let width = text
        .get(start..end)
        .map_or(end.saturating_sub(start), |s| s.chars().count())
        .max(1);
    format!("{}{}", " ".repeat(lead), "^".repeat(width))
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error(transparent)]
    Tokenization(#[from] TokenizationError),
    #[error("{message}\n{text}\n{}", underline(.start, .end, .text))]
    Syntax {
        message: String,
        token: String,
        start: usize,
        end: usize,
        text: String,
    },
    #[error("{source}\n{text}\n{}", underline(.start, .end, .text))]
    Spec {
        source: SpecError,
        token: String,
        start: usize,
        end: usize,
        text: String,
    },
    #[error(transparent)]
    SpecFile(#[from] SpecFileError),
    #[error("expected a spec, but got none")]
    NoSpec,
}

impl ParseError {
    fn syntax(message: impl Into<String>, token: &Token, text: &str) -> Self {
        ParseError::Syntax {
            message: message.into(),
            token: token.text.clone(),
            start: token.start,
            end: token.end,
            text: text.to_owned(),
        }
    }

    /// The identity-model error behind this parse failure, if there is one.
    pub fn spec_error(&self) -> Option<&SpecError> {
        match self {
            ParseError::Spec { source, .. } => Some(source),
            ParseError::SpecFile(SpecFileError::Spec(source)) => Some(source),
            _ => None,
        }
    }
}

/// One-token-lookahead cursor over the non-whitespace tokens of a string.
pub struct TokenContext<'a> {
    text: &'a str,
    tokens: Tokenizer<'a>,
    current: Option<Token>,
    next: Option<Token>,
    consumed: usize,
}

impl<'a> TokenContext<'a> {
    pub fn new(text: &'a str) -> Result<Self, ParseError> {
        let mut ctx = Self {
            text,
            tokens: tokenize(text),
            current: None,
            next: None,
            consumed: 0,
        };
        ctx.advance()?;
        ctx.consumed = 0;
        Ok(ctx)
    }

    pub fn text(&self) -> &'a str {
        self.text
    }

    pub fn current_token(&self) -> Option<&Token> {
        self.current.as_ref()
    }

    pub fn next_token(&self) -> Option<&Token> {
        self.next.as_ref()
    }

    pub fn is_exhausted(&self) -> bool {
        self.next.is_none()
    }

    /// Shift `next` into `current` and pull the next non-whitespace token.
    pub fn advance(&mut self) -> Result<(), ParseError> {
        if self.next.is_some() {
            self.consumed += 1;
        }
        self.current = self.next.take();
        for token in self.tokens.by_ref() {
            let token = token?;
            if token.kind != TokenKind::Whitespace {
                self.next = Some(token);
                break;
            }
        }
        Ok(())
    }

    /// Consume the next token if it has kind `kind`.
    pub fn accept(&mut self, kind: TokenKind) -> Result<bool, ParseError> {
        if self.expect(kind) {
            self.advance()?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Whether the next token has kind `kind`, without consuming it.
    pub fn expect(&self, kind: TokenKind) -> bool {
        self.next.as_ref().is_some_and(|t| t.kind == kind)
    }

    /// Error located at the current token, or at the end of input.
    fn error_here(&self, message: &str) -> ParseError {
        match &self.current {
            Some(token) => ParseError::syntax(message, token, self.text),
            None => self.error_at_end(message),
        }
    }

    fn error_at_next(&self, message: &str) -> ParseError {
        match &self.next {
            Some(token) => ParseError::syntax(message, token, self.text),
            None => self.error_at_end(message),
        }
    }

    fn error_at_end(&self, message: &str) -> ParseError {
        let end = self.text.len();
        ParseError::Syntax {
            message: message.to_owned(),
            token: String::new(),
            start: end,
            end,
            text: self.text.to_owned(),
        }
    }

    /// Attach the current token to an identity-model error.
    fn wrap<T>(&self, result: Result<T, SpecError>) -> Result<T, ParseError> {
        result.map_err(|source| {
            let (token, start, end) = match &self.current {
                Some(t) => (t.text.clone(), t.start, t.end),
                None => (String::new(), self.text.len(), self.text.len()),
            };
            ParseError::Spec {
                source,
                token,
                start,
                end,
                text: self.text.to_owned(),
            }
        })
    }

    fn current_text(&self) -> &str {
        self.current.as_ref().map_or("", |t| t.text.as_str())
    }
}

/// Parses the attributes of a single node.
pub struct SpecNodeParser<'c, 'a> {
    ctx: &'c mut TokenContext<'a>,
}

impl<'c, 'a> SpecNodeParser<'c, 'a> {
    pub fn new(ctx: &'c mut TokenContext<'a>) -> Self {
        Self { ctx }
    }

    /// Parse one node into `spec`. Returns `spec` unchanged when the input is
    /// exhausted or positioned at a `^`.
    pub fn parse(self, mut spec: AbstractSpec) -> Result<AbstractSpec, ParseError> {
        let ctx = self.ctx;
        if ctx.is_exhausted() || ctx.expect(TokenKind::Dependency) {
            return Ok(spec);
        }

        if ctx.accept(TokenKind::UnqualifiedPackageName)? {
            let name = ctx.current_text().to_owned();
            ctx.wrap(spec.set_name(None, name))?;
        } else if ctx.accept(TokenKind::FullyQualifiedPackageName)? {
            let text = ctx.current_text();
            let (namespace, name) = text.rsplit_once('.').unwrap_or(("", text));
            let (namespace, name) = (namespace.to_owned(), name.to_owned());
            ctx.wrap(spec.set_name(Some(namespace), name))?;
        } else if ctx.accept(TokenKind::Filename)? {
            FileParser::new(ctx).parse(&mut spec)?;
            return Ok(spec);
        }

        loop {
            if ctx.accept(TokenKind::Compiler)? || ctx.accept(TokenKind::CompilerAndVersion)? {
                let compiler = parse_compiler(ctx.current_text());
                let compiler = ctx.wrap(compiler)?;
                ctx.wrap(spec.set_compiler(compiler))?;
            } else if ctx.accept(TokenKind::VersionHashPair)? || ctx.accept(TokenKind::GitVersion)?
            {
                let text = ctx.current_text()[1..].trim().to_owned();
                let version = ctx.wrap(Version::parse(&text))?;
                ctx.wrap(spec.constrain_versions(VersionConstraint::exact(version)))?;
            } else if ctx.accept(TokenKind::Version)? {
                let text = ctx.current_text()[1..].trim().to_owned();
                let versions = ctx.wrap(VersionConstraint::parse(&text))?;
                ctx.wrap(spec.constrain_versions(versions))?;
            } else if ctx.accept(TokenKind::PropagatedBoolVariant)? {
                let (name, value) = split_bool_variant(ctx.current_text(), 2);
                ctx.wrap(spec.set_flag(
                    &name,
                    FlagValue::Bool {
                        value,
                        propagate: true,
                    },
                ))?;
            } else if ctx.accept(TokenKind::BoolVariant)? {
                let (name, value) = split_bool_variant(ctx.current_text(), 1);
                ctx.wrap(spec.set_flag(
                    &name,
                    FlagValue::Bool {
                        value,
                        propagate: false,
                    },
                ))?;
            } else if ctx.accept(TokenKind::PropagatedKeyValuePair)?
                || ctx.accept(TokenKind::KeyValuePair)?
            {
                let (key, value) = split_key_value(ctx.current_text());
                ctx.wrap(spec.set_flag(&key, value))?;
            } else if ctx.expect(TokenKind::DagHash) && spec.abstract_hash().is_none() {
                ctx.advance()?;
                let hash = ctx.wrap(HashPrefix::parse(ctx.current_text()))?;
                ctx.wrap(spec.set_abstract_hash(hash))?;
            } else {
                break;
            }
        }
        Ok(spec)
    }
}

/// `%gcc`, `% gcc @ 12.1` and similar.
fn parse_compiler(text: &str) -> Result<CompilerSpec, SpecError> {
    let body = text.trim_start_matches('%');
    let (name, versions) = match body.split_once('@') {
        Some((name, versions)) => (name, VersionConstraint::parse(versions)?),
        None => (body, VersionConstraint::any()),
    };
    Ok(CompilerSpec {
        name: name.trim().to_owned(),
        versions,
    })
}

/// Split `+name`/`~~name` style tokens into the name and its boolean value.
fn split_bool_variant(text: &str, sigil_len: usize) -> (String, bool) {
    let value = text.starts_with('+');
    (text[sigil_len..].trim_start().to_owned(), value)
}

/// Split `key=value` or `key==value`. Quotes around the value are removed;
/// `true`/`false` become boolean variants.
fn split_key_value(text: &str) -> (String, FlagValue) {
    let (key, rest) = text.split_once('=').unwrap_or((text, ""));
    let (propagate, raw) = match rest.strip_prefix('=') {
        Some(value) => (true, value),
        None => (false, rest),
    };
    let key = strip_quotes_and_unescape(key.trim());
    let value = strip_quotes_and_unescape(raw);
    let flag = if value.eq_ignore_ascii_case("true") || value.eq_ignore_ascii_case("false") {
        FlagValue::Bool {
            value: value.eq_ignore_ascii_case("true"),
            propagate,
        }
    } else {
        FlagValue::KeyValue { value, propagate }
    };
    (key, flag)
}

/// Attributes of one `^[...]` block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EdgeAttributes {
    pub depflag: DepFlag,
    pub virtuals: BTreeSet<String>,
}

/// Parses the inside of `^[ ... ]`, starting just after `^[`.
pub struct EdgeAttributeParser<'c, 'a> {
    ctx: &'c mut TokenContext<'a>,
}

impl<'c, 'a> EdgeAttributeParser<'c, 'a> {
    pub fn new(ctx: &'c mut TokenContext<'a>) -> Self {
        Self { ctx }
    }

    pub fn parse(self) -> Result<EdgeAttributes, ParseError> {
        let ctx = self.ctx;
        let mut attrs = EdgeAttributes::default();
        loop {
            if ctx.accept(TokenKind::KeyValuePair)? {
                let text = ctx.current_text();
                let (key, value) = text.split_once('=').unwrap_or((text, ""));
                let key = key.trim_matches(|c| matches!(c, '\'' | '"' | ' '));
                let values: Vec<String> = value
                    .trim_matches(|c| matches!(c, '\'' | '"' | ' '))
                    .split(',')
                    .map(str::trim)
                    .filter(|v| !v.is_empty())
                    .map(str::to_owned)
                    .collect();
                match key {
                    "deptypes" => attrs.depflag |= ctx.wrap(deptypes::canonicalize(&values))?,
                    "virtuals" => attrs.virtuals.extend(values),
                    _ => {
                        return Err(ctx.error_here(
                            "the only edge attributes that are currently accepted \
                             are 'deptypes' and 'virtuals'",
                        ))
                    }
                }
            } else if ctx.accept(TokenKind::EndEdgeProperties)? {
                return Ok(attrs);
            } else {
                return Err(ctx.error_at_next("unexpected token in edge attributes"));
            }
        }
    }
}

/// Splices a concrete spec read from a `.json`/`.yaml` file into a node.
pub struct FileParser<'c, 'a> {
    ctx: &'c mut TokenContext<'a>,
}

impl<'c, 'a> FileParser<'c, 'a> {
    pub fn new(ctx: &'c mut TokenContext<'a>) -> Self {
        Self { ctx }
    }

    /// Read the file named by the current token into `target`. On failure
    /// `target` is left untouched.
    pub fn parse(self, target: &mut AbstractSpec) -> Result<(), ParseError> {
        let path = Path::new(self.ctx.current_text());
        let concrete = specfile::read_spec_file(path)?;
        *target = AbstractSpec::from(concrete);
        Ok(())
    }
}

/// Parses whole spec strings, one top-level spec at a time.
pub struct SpecParser<'a> {
    ctx: TokenContext<'a>,
    failed: bool,
}

impl<'a> SpecParser<'a> {
    pub fn new(text: &'a str) -> Result<Self, ParseError> {
        Ok(Self {
            ctx: TokenContext::new(text)?,
            failed: false,
        })
    }

    /// Whitespace-free token list of the whole input.
    pub fn tokens(&self) -> Result<Vec<Token>, ParseError> {
        let mut out = Vec::new();
        for token in tokenize(self.ctx.text()) {
            let token = token?;
            if token.kind != TokenKind::Whitespace {
                out.push(token);
            }
        }
        Ok(out)
    }

    /// Parse the next top-level spec, building on `initial` if given.
    /// Returns `initial` unchanged when no tokens remain.
    pub fn next_spec(
        &mut self,
        initial: Option<AbstractSpec>,
    ) -> Result<Option<AbstractSpec>, ParseError> {
        if self.ctx.is_exhausted() {
            return Ok(initial);
        }
        let before = self.ctx.consumed;
        let mut root = SpecNodeParser::new(&mut self.ctx).parse(initial.unwrap_or_default())?;

        loop {
            let attrs = if self.ctx.accept(TokenKind::StartEdgeProperties)? {
                EdgeAttributeParser::new(&mut self.ctx).parse()?
            } else if self.ctx.accept(TokenKind::Dependency)? {
                EdgeAttributes::default()
            } else {
                break;
            };
            let dependency = self.parse_dependency_node()?;
            let edge = Edge::new(dependency, attrs.depflag, attrs.virtuals);
            self.ctx.wrap(root.add_dependency(edge))?;
        }

        if self.ctx.consumed == before {
            return Err(self.ctx.error_at_next("unexpected token"));
        }
        Ok(Some(root))
    }

    fn parse_dependency_node(&mut self) -> Result<AbstractSpec, ParseError> {
        let dependency = SpecNodeParser::new(&mut self.ctx).parse(AbstractSpec::new())?;
        if dependency.is_empty() {
            return Err(self.ctx.error_here(
                "the dependency sigil and any optional edge attributes must be followed by \
                 a package name or a node attribute (version, variant, etc.)",
            ));
        }
        Ok(dependency)
    }

    /// Every top-level spec in the input.
    pub fn all_specs(self) -> Result<Vec<AbstractSpec>, ParseError> {
        self.collect()
    }
}

impl Iterator for SpecParser<'_> {
    type Item = Result<AbstractSpec, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.next_spec(None) {
            Ok(spec) => spec.map(Ok),
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

/// Parse every spec in `text`.
pub fn parse(text: &str) -> Result<Vec<AbstractSpec>, ParseError> {
    SpecParser::new(text)?.all_specs()
}

/// Parse exactly one spec covering the whole of `text` (surrounding
/// whitespace ignored), optionally building on `initial`.
pub fn parse_one_or_raise(
    text: &str,
    initial: Option<AbstractSpec>,
) -> Result<AbstractSpec, ParseError> {
    let stripped = text.trim();
    let mut parser = SpecParser::new(stripped)?;
    let result = parser.next_spec(initial)?;
    if let Some(token) = parser.ctx.next_token() {
        return Err(ParseError::syntax(
            "expected a single spec, but got more",
            token,
            stripped,
        ));
    }
    result.ok_or(ParseError::NoSpec)
}

impl FromStr for AbstractSpec {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_one_or_raise(s, None)
    }
}
