//! The hash-keyed spec source capability and the records it serves.
//!
//! A [`SpecIndexable`] is anything that can find concrete specs by hash
//! prefix and filter them by an [`IndexQuery`]: the local install database,
//! a remote build cache, or a merge of several.

use crate::concretize::{ConcretizeError, Concretizer};
use crate::hash::{ConcreteHash, HashPrefix, PartialHash};
use crate::spec::{AbstractSpec, ArchSpec, ConcreteSpec, SpecError};
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("no installed or cached spec matches hash '{0}'")]
    NoSuchHash(String),
    #[error(
        "hash '{prefix}' matches {} specs:\n{}",
        .candidates.len(),
        list_candidates(.candidates)
    )]
    AmbiguousHash {
        prefix: String,
        candidates: Vec<ConcretizedSpec>,
    },
    #[error("query requires explicit query specs")]
    MissingQuerySpecs,
    #[error(transparent)]
    Spec(#[from] SpecError),
    #[error("index source failed: {0}")]
    Source(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl IndexError {
    /// Wrap a storage- or network-level failure from a spec source.
    pub fn source(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        IndexError::Source(Box::new(err))
    }
}

fn list_candidates(candidates: &[ConcretizedSpec]) -> String {
    candidates
        .iter()
        .map(|c| format!("    {}", c.spec().short_spec()))
        .collect::<Vec<_>>()
        .join("\n")
}

/// A concrete spec as served by an index. Abstract specs cannot become one
/// without passing through a [`Concretizer`].
#[derive(Debug, Clone)]
pub struct ConcretizedSpec(Arc<ConcreteSpec>);

impl ConcretizedSpec {
    pub fn new(spec: Arc<ConcreteSpec>) -> Self {
        Self(spec)
    }

    pub fn from_abstract_spec(
        spec: &AbstractSpec,
        concretizer: &dyn Concretizer,
    ) -> Result<Self, ConcretizeError> {
        concretizer.concretize(spec).map(Self)
    }

    pub fn spec(&self) -> &Arc<ConcreteSpec> {
        &self.0
    }

    pub fn into_spec(self) -> Arc<ConcreteSpec> {
        self.0
    }

    pub fn into_hash(self) -> ConcreteHash {
        self.0.dag_hash().clone()
    }

    /// `name/hash`
    pub fn spec_string_name_hash_only(&self) -> String {
        self.0.name_hash()
    }
}

impl TryFrom<&AbstractSpec> for ConcretizedSpec {
    type Error = SpecError;

    /// Succeeds only for nodes spliced from a concrete spec.
    fn try_from(spec: &AbstractSpec) -> Result<Self, Self::Error> {
        spec.as_concrete()
            .map(|c| Self(Arc::clone(c)))
            .ok_or_else(|| SpecError::NotConcrete(spec.to_string()))
    }
}

impl From<Arc<ConcreteSpec>> for ConcretizedSpec {
    fn from(spec: Arc<ConcreteSpec>) -> Self {
        Self(spec)
    }
}

impl PartialEq for ConcretizedSpec {
    fn eq(&self, other: &Self) -> bool {
        self.0.dag_hash() == other.0.dag_hash()
    }
}

impl Eq for ConcretizedSpec {}

impl fmt::Display for ConcretizedSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.spec_string_name_hash_only())
    }
}

/// Install state filter, composable with `|`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstallStatuses(u8);

impl InstallStatuses {
    pub const INSTALLED: InstallStatuses = InstallStatuses(0b001);
    pub const DEPRECATED: InstallStatuses = InstallStatuses(0b010);
    pub const MISSING: InstallStatuses = InstallStatuses(0b100);
    pub const ANY: InstallStatuses = InstallStatuses(0b111);

    pub const fn contains(self, other: InstallStatuses) -> bool {
        self.0 & other.0 == other.0
    }

    /// Parse a comma-separated list of `installed`, `deprecated`, `missing`
    /// or `any`.
    pub fn parse(text: &str) -> Result<Self, String> {
        let mut out = InstallStatuses(0);
        for part in text.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            out |= match part {
                "installed" => Self::INSTALLED,
                "deprecated" => Self::DEPRECATED,
                "missing" => Self::MISSING,
                "any" => Self::ANY,
                other => return Err(format!("unknown install status '{other}'")),
            };
        }
        Ok(out)
    }
}

impl Default for InstallStatuses {
    fn default() -> Self {
        Self::INSTALLED
    }
}

impl BitOr for InstallStatuses {
    type Output = InstallStatuses;
    fn bitor(self, rhs: Self) -> Self {
        InstallStatuses(self.0 | rhs.0)
    }
}

impl BitOrAssign for InstallStatuses {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Install metadata for one concrete spec.
#[derive(Debug, Clone, PartialEq)]
pub struct InstallRecord {
    pub spec: ConcretizedSpec,
    /// Installation prefix; `None` for specs that were never installed here.
    pub path: Option<PathBuf>,
    pub installed: bool,
    /// Number of installed dependents holding on to this record.
    pub ref_count: u32,
    pub explicit: bool,
    pub installation_time: DateTime<Utc>,
    pub deprecated_for: Option<ConcreteHash>,
    pub in_buildcache: bool,
}

impl InstallRecord {
    pub fn new(spec: impl Into<ConcretizedSpec>) -> Self {
        Self {
            spec: spec.into(),
            path: None,
            installed: false,
            ref_count: 0,
            explicit: false,
            installation_time: Utc::now(),
            deprecated_for: None,
            in_buildcache: false,
        }
    }

    pub fn hash(&self) -> &ConcreteHash {
        self.spec.spec().dag_hash()
    }

    /// Installed beats deprecated beats missing.
    pub fn status(&self) -> InstallStatuses {
        if self.installed {
            InstallStatuses::INSTALLED
        } else if self.deprecated_for.is_some() {
            InstallStatuses::DEPRECATED
        } else {
            InstallStatuses::MISSING
        }
    }

    pub fn install_type_matches(&self, statuses: InstallStatuses) -> bool {
        statuses.contains(self.status())
    }
}

/// A hit from [`SpecIndexable::lookup`].
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub concretized_spec: ConcretizedSpec,
    pub record: InstallRecord,
}

impl IndexEntry {
    pub fn new(record: InstallRecord) -> Self {
        Self {
            concretized_spec: record.spec.clone(),
            record,
        }
    }

    pub fn hash(&self) -> &ConcreteHash {
        self.concretized_spec.spec().dag_hash()
    }
}

/// Answers whether a package name is known to the package repository.
pub trait PackageRepository: Send + Sync {
    fn exists(&self, name: &str) -> bool;
}

impl PackageRepository for BTreeSet<String> {
    fn exists(&self, name: &str) -> bool {
        self.contains(name)
    }
}

/// Immutable filter set for [`SpecIndexable::query`].
///
/// Every unset filter matches everything, except the install status, which
/// defaults to installed records only.
#[derive(Clone, Default)]
pub struct IndexQuery {
    query_specs: Option<Vec<AbstractSpec>>,
    known: Option<bool>,
    repository: Option<Arc<dyn PackageRepository>>,
    installed: InstallStatuses,
    explicit: Option<bool>,
    start_date: Option<DateTime<Utc>>,
    end_date: Option<DateTime<Utc>>,
    hashes: Option<Vec<HashPrefix>>,
    for_all_architectures: bool,
}

impl fmt::Debug for IndexQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexQuery")
            .field("query_specs", &self.query_specs)
            .field("known", &self.known)
            .field("installed", &self.installed)
            .field("explicit", &self.explicit)
            .field("start_date", &self.start_date)
            .field("end_date", &self.end_date)
            .field("hashes", &self.hashes)
            .field("for_all_architectures", &self.for_all_architectures)
            .finish_non_exhaustive()
    }
}

impl IndexQuery {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_specs(mut self, specs: Vec<AbstractSpec>) -> Self {
        self.query_specs = Some(specs);
        self
    }

    /// Keep only packages the repository does (`true`) or does not (`false`) know.
    #[must_use]
    pub fn with_known(mut self, known: bool, repository: Arc<dyn PackageRepository>) -> Self {
        self.known = Some(known);
        self.repository = Some(repository);
        self
    }

    #[must_use]
    pub fn with_installed(mut self, statuses: InstallStatuses) -> Self {
        self.installed = statuses;
        self
    }

    #[must_use]
    pub fn with_explicit(mut self, explicit: bool) -> Self {
        self.explicit = Some(explicit);
        self
    }

    #[must_use]
    pub fn with_date_range(
        mut self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Self {
        self.start_date = start;
        self.end_date = end;
        self
    }

    #[must_use]
    pub fn with_hashes(mut self, hashes: Vec<HashPrefix>) -> Self {
        self.hashes = Some(hashes);
        self
    }

    #[must_use]
    pub fn with_all_architectures(mut self, all: bool) -> Self {
        self.for_all_architectures = all;
        self
    }

    pub fn query_specs(&self) -> Option<&[AbstractSpec]> {
        self.query_specs.as_deref()
    }

    pub fn installed(&self) -> InstallStatuses {
        self.installed
    }

    pub fn for_all_architectures(&self) -> bool {
        self.for_all_architectures
    }

    /// The spec satisfies at least one query spec.
    pub fn spec_matches(&self, spec: &ConcreteSpec) -> bool {
        self.query_specs
            .as_ref()
            .is_none_or(|specs| specs.iter().any(|q| spec.satisfies(q)))
    }

    pub fn hash_matches(&self, hash: &ConcreteHash) -> bool {
        self.hashes
            .as_ref()
            .is_none_or(|hashes| hashes.iter().any(|h| h.is_prefix_of(hash)))
    }

    pub fn known_matches(&self, name: &str) -> bool {
        match (self.known, &self.repository) {
            (Some(known), Some(repo)) => repo.exists(name) == known,
            _ => true,
        }
    }

    /// Architecture filter: passes when all architectures were requested or
    /// no host is given.
    pub fn arch_matches(&self, arch: &ArchSpec, host: Option<&ArchSpec>) -> bool {
        self.for_all_architectures || host.is_none_or(|host| host.is_satisfied_by(arch))
    }

    /// Status, explicit and date filters; these only apply to install records.
    pub fn record_matches(&self, record: &InstallRecord) -> bool {
        record.install_type_matches(self.installed)
            && self.explicit.is_none_or(|e| e == record.explicit)
            && self
                .start_date
                .is_none_or(|start| record.installation_time >= start)
            && self
                .end_date
                .is_none_or(|end| record.installation_time <= end)
    }

    /// Spec, hash and known filters together.
    pub fn identity_matches(&self, spec: &ConcreteSpec) -> bool {
        self.hash_matches(spec.dag_hash())
            && self.known_matches(spec.name())
            && self.spec_matches(spec)
    }
}

pub type EntryIter<'a> = Box<dyn Iterator<Item = Result<IndexEntry, IndexError>> + 'a>;
pub type SpecIter<'a> = Box<dyn Iterator<Item = Result<ConcretizedSpec, IndexError>> + 'a>;

/// A source of concrete specs keyed by DAG hash.
///
/// Both operations return lazy, single-pass iterators; iterating again
/// means calling again.
pub trait SpecIndexable: Send + Sync {
    /// Entries whose complete hash starts with `prefix`.
    fn lookup<'a>(&'a self, prefix: &HashPrefix) -> EntryIter<'a>;

    /// Specs passing every filter of `query`.
    fn query<'a>(&'a self, query: &IndexQuery) -> SpecIter<'a>;

    /// Name used in logs.
    fn describe(&self) -> String {
        std::any::type_name::<Self>().to_owned()
    }
}
