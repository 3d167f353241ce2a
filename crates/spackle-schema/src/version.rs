//! Versions and version constraints as they appear after `@` in a spec.

use crate::spec::SpecError;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::LazyLock;

/// Component names that sort above every numeric release, highest first.
const INFINITY_VERSIONS: [&str; 6] = ["develop", "main", "master", "head", "trunk", "stable"];

/// One run of digits or letters plus any separators after it.
static SEGMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:([0-9]+)|([a-zA-Z]+))[_.-]*").expect("segment pattern is valid")
});

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum Component {
    // Variant order is the comparison order.
    Alpha(String),
    Number(u64),
    Infinity(std::cmp::Reverse<usize>),
}

impl Component {
    fn number(digits: &str) -> Self {
        // Runs too long for u64 still order after letters.
        digits
            .parse::<u64>()
            .map_or_else(|_| Component::Number(u64::MAX), Component::Number)
    }

    fn word(letters: &str) -> Self {
        let lower = letters.to_ascii_lowercase();
        match INFINITY_VERSIONS.iter().position(|v| *v == lower) {
            Some(rank) => Component::Infinity(std::cmp::Reverse(rank)),
            None => Component::Alpha(letters.to_owned()),
        }
    }
}

/// A single version such as `1.2.3`, `develop`, `git.main=1.2` or a 40-hex commit.
#[derive(Debug, Clone)]
pub struct Version {
    text: String,
    git_ref: Option<String>,
    components: Vec<Component>,
}

fn is_git_ref(text: &str) -> bool {
    text.starts_with("git.") || (text.len() == 40 && text.bytes().all(|b| b.is_ascii_hexdigit()))
}

fn is_release_text(text: &str) -> bool {
    let mut bytes = text.bytes();
    match bytes.next() {
        Some(first) if first.is_ascii_alphanumeric() || first == b'_' => {}
        _ => return false,
    }
    bytes.all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'-'))
}

/// `1.10a` splits into `1`, `10`, `a`: digit and letter runs are separate components.
fn split_components(text: &str) -> Vec<Component> {
    SEGMENT
        .captures_iter(text)
        .filter_map(|caps| match (caps.get(1), caps.get(2)) {
            (Some(digits), _) => Some(Component::number(digits.as_str())),
            (None, Some(letters)) => Some(Component::word(letters.as_str())),
            (None, None) => None,
        })
        .collect()
}

impl Version {
    pub fn parse(text: &str) -> Result<Self, SpecError> {
        let text = text.trim();
        if let Some((git, release)) = text.split_once('=') {
            if !is_git_ref(git) || !is_release_text(release) {
                return Err(SpecError::InvalidVersion(text.to_owned()));
            }
            return Ok(Version {
                text: text.to_owned(),
                git_ref: Some(git.to_owned()),
                components: split_components(release),
            });
        }
        if is_git_ref(text) {
            if text.len() <= 4 {
                return Err(SpecError::InvalidVersion(text.to_owned()));
            }
            return Ok(Version {
                text: text.to_owned(),
                git_ref: Some(text.to_owned()),
                components: Vec::new(),
            });
        }
        if !is_release_text(text) {
            return Err(SpecError::InvalidVersion(text.to_owned()));
        }
        Ok(Version {
            text: text.to_owned(),
            git_ref: None,
            components: split_components(text),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// The `git.<ref>` or commit part of a git version, if any.
    pub fn git_ref(&self) -> Option<&str> {
        self.git_ref.as_deref()
    }

    /// True when `other` equals this version or extends it by more components.
    pub fn is_prefix_of(&self, other: &Version) -> bool {
        if self.git_ref.is_some() && self.git_ref != other.git_ref {
            return false;
        }
        other.components.len() >= self.components.len()
            && self
                .components
                .iter()
                .zip(&other.components)
                .all(|(a, b)| a == b)
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.text == other.text
    }
}

impl Eq for Version {}

impl Hash for Version {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.text.hash(state);
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.components
            .cmp(&other.components)
            .then_with(|| self.text.cmp(&other.text))
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl FromStr for Version {
    type Err = SpecError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Version::parse(s)
    }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.text)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Version::parse(&text).map_err(serde::de::Error::custom)
    }
}

/// One comma-separated element of a version list.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum VersionItem {
    /// `1.2`: the version itself or anything it prefixes.
    Prefix(Version),
    /// `=1.2`: exactly this version.
    Exact(Version),
    /// `lo:hi` with either end open; the upper bound includes its prefix matches.
    Range {
        lo: Option<Version>,
        hi: Option<Version>,
    },
}

impl VersionItem {
    fn parse(text: &str) -> Result<Self, SpecError> {
        let text = text.trim();
        if let Some(exact) = text.strip_prefix('=') {
            return Ok(VersionItem::Exact(Version::parse(exact)?));
        }
        if let Some((lo, hi)) = text.split_once(':') {
            let bound = |s: &str| -> Result<Option<Version>, SpecError> {
                let s = s.trim().trim_start_matches('=');
                if s.is_empty() {
                    Ok(None)
                } else {
                    Version::parse(s).map(Some)
                }
            };
            return Ok(VersionItem::Range {
                lo: bound(lo)?,
                hi: bound(hi)?,
            });
        }
        Ok(VersionItem::Prefix(Version::parse(text)?))
    }

    fn lower(&self) -> Option<&Version> {
        match self {
            VersionItem::Prefix(v) | VersionItem::Exact(v) => Some(v),
            VersionItem::Range { lo, .. } => lo.as_ref(),
        }
    }

    pub fn contains(&self, version: &Version) -> bool {
        match self {
            VersionItem::Prefix(p) => p.is_prefix_of(version),
            VersionItem::Exact(e) => e == version,
            VersionItem::Range { lo, hi } => {
                lo.as_ref().is_none_or(|lo| lo <= version)
                    && hi
                        .as_ref()
                        .is_none_or(|hi| version <= hi || hi.is_prefix_of(version))
            }
        }
    }
}

impl fmt::Display for VersionItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionItem::Prefix(v) => write!(f, "{v}"),
            VersionItem::Exact(v) => write!(f, "={v}"),
            VersionItem::Range { lo, hi } => {
                if let Some(lo) = lo {
                    write!(f, "{lo}")?;
                }
                f.write_str(":")?;
                if let Some(hi) = hi {
                    write!(f, "{hi}")?;
                }
                Ok(())
            }
        }
    }
}

/// A version list; empty means unconstrained.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct VersionConstraint {
    items: Vec<VersionItem>,
}

impl VersionConstraint {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn exact(version: Version) -> Self {
        Self {
            items: vec![VersionItem::Prefix(version)],
        }
    }

    /// Parse the text following `@`, normalizing item order.
    pub fn parse(text: &str) -> Result<Self, SpecError> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(Self::any());
        }
        let mut items = text
            .split(',')
            .map(VersionItem::parse)
            .collect::<Result<Vec<_>, _>>()?;
        items.sort_by(|a, b| {
            a.lower()
                .cmp(&b.lower())
                .then_with(|| a.to_string().cmp(&b.to_string()))
        });
        items.dedup();
        Ok(Self { items })
    }

    pub fn is_any(&self) -> bool {
        self.items.is_empty()
    }

    pub fn items(&self) -> &[VersionItem] {
        &self.items
    }

    /// The single version this constraint pins, if it pins exactly one.
    pub fn as_concrete(&self) -> Option<&Version> {
        match self.items.as_slice() {
            [VersionItem::Prefix(v) | VersionItem::Exact(v)] => Some(v),
            _ => None,
        }
    }

    pub fn contains(&self, version: &Version) -> bool {
        self.is_any() || self.items.iter().any(|item| item.contains(version))
    }
}

impl fmt::Display for VersionConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, item) in self.items.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{item}")?;
        }
        Ok(())
    }
}

impl FromStr for VersionConstraint {
    type Err = SpecError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        VersionConstraint::parse(s)
    }
}
