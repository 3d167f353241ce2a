//! The spec identity model.
//!
//! [`AbstractSpec`] is the mutable builder the parsers fill in: every field
//! is an optional constraint. [`ConcreteSpec`] is the immutable result of
//! resolving every constraint to a single value; it owns its dependency DAG
//! through `Arc`s and computes its DAG hash exactly once, at construction.
//! An abstract node spliced from a spec file keeps a handle to the concrete
//! spec it came from and refuses further constraints.

use crate::deptypes::DepFlag;
use crate::hash::{ConcreteHash, HashPrefix, PartialHash};
use crate::version::{Version, VersionConstraint};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, LazyLock};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SpecError {
    #[error("invalid version: '{0}'")]
    InvalidVersion(String),
    #[error("invalid dependency type: '{0}'")]
    InvalidDeptype(String),
    #[error("invalid hash: '{0}'")]
    InvalidHash(String),
    #[error("spec for '{0}' cannot have two compilers")]
    DuplicateCompiler(String),
    #[error("spec for '{0}' cannot have multiple version constraints")]
    MultipleVersions(String),
    #[error("spec for '{0}' cannot set variant '{1}' twice")]
    DuplicateVariant(String, String),
    #[error("spec for '{0}' cannot have two values for architecture field '{1}'")]
    DuplicateArchitecture(String, String),
    #[error("'{0}' cannot depend on itself")]
    CircularReference(String),
    #[error("cannot depend on '{0}' twice with conflicting constraints")]
    DuplicateDependency(String),
    #[error("'{0}' is already concrete; it cannot take further constraints")]
    Redundant(String),
    #[error("spec is not concrete: {0}")]
    NotConcrete(String),
    #[error("'{name}' names two different nodes: {first} and {second}")]
    ConflictingNodes {
        name: String,
        first: String,
        second: String,
    },
    #[error("failed to serialize spec: {0}")]
    Serialization(String),
}

/// A variant or flag setting on one node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FlagValue {
    /// `+name`, `~name`, `-name`, or the propagated `++`/`~~`/`--` forms.
    Bool { value: bool, propagate: bool },
    /// `key=value`, or the propagated `key==value`.
    KeyValue { value: String, propagate: bool },
}

impl FlagValue {
    pub fn propagate(&self) -> bool {
        match self {
            FlagValue::Bool { propagate, .. } | FlagValue::KeyValue { propagate, .. } => *propagate,
        }
    }

    /// Same setting regardless of propagation.
    pub fn same_value(&self, other: &FlagValue) -> bool {
        match (self, other) {
            (FlagValue::Bool { value: a, .. }, FlagValue::Bool { value: b, .. }) => a == b,
            (FlagValue::KeyValue { value: a, .. }, FlagValue::KeyValue { value: b, .. }) => a == b,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CompilerSpec {
    pub name: String,
    pub versions: VersionConstraint,
}

/// Platform, operating system and target of a node; each may be unset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArchSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

impl ArchSpec {
    /// Parse `platform-os-target`; empty or `None` parts stay unset.
    pub fn parse_triplet(text: &str) -> Self {
        let mut parts = text.splitn(3, '-').map(|p| match p {
            "" | "None" => None,
            p => Some(p.to_owned()),
        });
        Self {
            platform: parts.next().flatten(),
            os: parts.next().flatten(),
            target: parts.next().flatten(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.platform.is_none() && self.os.is_none() && self.target.is_none()
    }

    pub fn is_complete(&self) -> bool {
        self.platform.is_some() && self.os.is_some() && self.target.is_some()
    }

    /// Every field set here is set to the same value in `other`.
    pub fn is_satisfied_by(&self, other: &ArchSpec) -> bool {
        let field = |mine: &Option<String>, theirs: &Option<String>| {
            mine.is_none() || mine == theirs
        };
        field(&self.platform, &other.platform)
            && field(&self.os, &other.os)
            && field(&self.target, &other.target)
    }

    fn set(&mut self, owner: &str, field: &str, value: &str) -> Result<(), SpecError> {
        let slot = match field {
            "platform" => &mut self.platform,
            "os" | "operating_system" => &mut self.os,
            _ => &mut self.target,
        };
        match slot {
            Some(existing) if existing != value => Err(SpecError::DuplicateArchitecture(
                owner.to_owned(),
                field.to_owned(),
            )),
            _ => {
                *slot = Some(value.to_owned());
                Ok(())
            }
        }
    }

    fn merge(&mut self, owner: &str, other: &ArchSpec) -> Result<(), SpecError> {
        if let Some(p) = &other.platform {
            self.set(owner, "platform", p)?;
        }
        if let Some(o) = &other.os {
            self.set(owner, "os", o)?;
        }
        if let Some(t) = &other.target {
            self.set(owner, "target", t)?;
        }
        Ok(())
    }
}

impl fmt::Display for ArchSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let part = |p: &Option<String>| p.clone().unwrap_or_else(|| "None".to_owned());
        write!(
            f,
            "{}-{}-{}",
            part(&self.platform),
            part(&self.os),
            part(&self.target)
        )
    }
}

/// Key-value flag names that set the architecture instead of a variant.
const ARCH_KEYS: [&str; 6] = [
    "arch",
    "architecture",
    "platform",
    "os",
    "operating_system",
    "target",
];

/// A dependency edge of an abstract spec.
#[derive(Debug, Clone, PartialEq)]
pub struct Edge {
    pub spec: AbstractSpec,
    pub depflag: DepFlag,
    pub virtuals: BTreeSet<String>,
}

impl Edge {
    pub fn new(spec: AbstractSpec, depflag: DepFlag, virtuals: BTreeSet<String>) -> Self {
        Self {
            spec,
            depflag,
            virtuals,
        }
    }
}

/// A spec under construction: every attribute is a constraint that may be unset.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AbstractSpec {
    name: Option<String>,
    namespace: Option<String>,
    versions: VersionConstraint,
    compiler: Option<CompilerSpec>,
    flags: BTreeMap<String, FlagValue>,
    arch: ArchSpec,
    abstract_hash: Option<HashPrefix>,
    dependencies: Vec<Edge>,
    concrete: Option<Arc<ConcreteSpec>>,
}

impl AbstractSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    pub fn versions(&self) -> &VersionConstraint {
        &self.versions
    }

    pub fn compiler(&self) -> Option<&CompilerSpec> {
        self.compiler.as_ref()
    }

    pub fn flags(&self) -> &BTreeMap<String, FlagValue> {
        &self.flags
    }

    pub fn arch(&self) -> &ArchSpec {
        &self.arch
    }

    pub fn abstract_hash(&self) -> Option<&HashPrefix> {
        self.abstract_hash.as_ref()
    }

    pub fn dependencies(&self) -> &[Edge] {
        &self.dependencies
    }

    /// The concrete spec this node was spliced from, if any.
    pub fn as_concrete(&self) -> Option<&Arc<ConcreteSpec>> {
        self.concrete.as_ref()
    }

    pub fn is_concrete(&self) -> bool {
        self.concrete.is_some()
    }

    /// True when no attribute at all has been set.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    fn label(&self) -> String {
        match (&self.name, &self.abstract_hash) {
            (Some(name), _) => name.clone(),
            (None, Some(hash)) => format!("/{hash}"),
            (None, None) => "<anonymous>".to_owned(),
        }
    }

    fn ensure_mutable(&self) -> Result<(), SpecError> {
        match &self.concrete {
            Some(_) => Err(SpecError::Redundant(self.label())),
            None => Ok(()),
        }
    }

    pub fn set_name(
        &mut self,
        namespace: Option<String>,
        name: impl Into<String>,
    ) -> Result<(), SpecError> {
        self.ensure_mutable()?;
        self.namespace = namespace;
        self.name = Some(name.into());
        Ok(())
    }

    pub fn constrain_versions(&mut self, versions: VersionConstraint) -> Result<(), SpecError> {
        self.ensure_mutable()?;
        if !self.versions.is_any() {
            return Err(SpecError::MultipleVersions(self.label()));
        }
        self.versions = versions;
        Ok(())
    }

    pub fn set_compiler(&mut self, compiler: CompilerSpec) -> Result<(), SpecError> {
        self.ensure_mutable()?;
        if self.compiler.is_some() {
            return Err(SpecError::DuplicateCompiler(self.label()));
        }
        self.compiler = Some(compiler);
        Ok(())
    }

    /// Set a variant or flag. Architecture keys (`arch`, `architecture`,
    /// `platform`, `os`, `operating_system`, `target`) update the
    /// [`ArchSpec`] instead.
    pub fn set_flag(&mut self, key: &str, value: FlagValue) -> Result<(), SpecError> {
        self.ensure_mutable()?;
        if let FlagValue::KeyValue { value: text, .. } = &value {
            if ARCH_KEYS.contains(&key) {
                let label = self.label();
                if key == "arch" || key == "architecture" {
                    let triplet = ArchSpec::parse_triplet(text);
                    return self.arch.merge(&label, &triplet);
                }
                return self.arch.set(&label, key, text);
            }
        }
        if self.flags.contains_key(key) {
            return Err(SpecError::DuplicateVariant(self.label(), key.to_owned()));
        }
        self.flags.insert(key.to_owned(), value);
        Ok(())
    }

    pub fn set_abstract_hash(&mut self, hash: HashPrefix) -> Result<(), SpecError> {
        self.ensure_mutable()?;
        self.abstract_hash = Some(hash);
        Ok(())
    }

    /// Attach a dependency edge.
    ///
    /// A second edge to the same named package is folded into the first: the
    /// dependency kinds and virtuals are unioned and unset attributes of the
    /// existing target are filled in from the new one.
    pub fn add_dependency(&mut self, edge: Edge) -> Result<(), SpecError> {
        self.ensure_mutable()?;
        if let (Some(mine), Some(theirs)) = (&self.name, &edge.spec.name) {
            if mine == theirs {
                return Err(SpecError::CircularReference(mine.clone()));
            }
        }
        let existing = match edge.spec.name.as_deref() {
            Some(name) => self
                .dependencies
                .iter_mut()
                .find(|e| e.spec.name.as_deref() == Some(name)),
            None => None,
        };
        match existing {
            Some(existing) => {
                existing.depflag |= edge.depflag;
                existing.virtuals.extend(edge.virtuals);
                existing.spec.merge_unset(edge.spec)
            }
            None => {
                self.dependencies.push(edge);
                Ok(())
            }
        }
    }

    fn merge_unset(&mut self, other: AbstractSpec) -> Result<(), SpecError> {
        if other.is_empty() {
            return Ok(());
        }
        let conflict = || SpecError::DuplicateDependency(other.label());
        if self.concrete.is_some() || other.concrete.is_some() {
            return match (&self.concrete, &other.concrete) {
                (Some(a), Some(b)) if a.dag_hash() == b.dag_hash() => Ok(()),
                _ => Err(conflict()),
            };
        }
        if self.namespace.is_some()
            && other.namespace.is_some()
            && self.namespace != other.namespace
        {
            return Err(conflict());
        }
        if !self.versions.is_any() && !other.versions.is_any() && self.versions != other.versions {
            return Err(conflict());
        }
        if self.compiler.is_some() && other.compiler.is_some() && self.compiler != other.compiler {
            return Err(conflict());
        }
        if self.abstract_hash.is_some()
            && other.abstract_hash.is_some()
            && self.abstract_hash != other.abstract_hash
        {
            return Err(conflict());
        }
        for (key, value) in &other.flags {
            if self.flags.get(key).is_some_and(|v| v != value) {
                return Err(conflict());
            }
        }
        let label = self.label();
        self.arch
            .merge(&label, &other.arch)
            .map_err(|_| conflict())?;

        if self.namespace.is_none() {
            self.namespace = other.namespace;
        }
        if self.versions.is_any() {
            self.versions = other.versions;
        }
        if self.compiler.is_none() {
            self.compiler = other.compiler;
        }
        if self.abstract_hash.is_none() {
            self.abstract_hash = other.abstract_hash;
        }
        for (key, value) in other.flags {
            self.flags.entry(key).or_insert(value);
        }
        for edge in other.dependencies {
            self.add_dependency(edge)?;
        }
        Ok(())
    }

    /// Every node reachable through dependency edges, excluding this one,
    /// paired with the edge that first reached it. Named nodes appear once.
    fn transitive_edges(&self) -> Vec<&Edge> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        let mut stack: Vec<&Edge> = self.dependencies.iter().rev().collect();
        while let Some(edge) = stack.pop() {
            if let Some(name) = edge.spec.name() {
                if !seen.insert(name) {
                    continue;
                }
            }
            out.push(edge);
            stack.extend(edge.spec.dependencies.iter().rev());
        }
        out
    }

    fn node_format(&self) -> NodeFormat<'_> {
        NodeFormat {
            namespace: self.namespace.as_deref(),
            name: self.name.as_deref(),
            versions: (!self.versions.is_any()).then(|| self.versions.to_string()),
            compiler: self.compiler.as_ref().map(|c| {
                (
                    c.name.as_str(),
                    (!c.versions.is_any()).then(|| c.versions.to_string()),
                )
            }),
            flags: &self.flags,
            arch: &self.arch,
            hash: self.abstract_hash.as_ref().map(HashPrefix::as_str),
        }
    }
}

impl From<Arc<ConcreteSpec>> for AbstractSpec {
    /// An abstract view of a concrete spec, locked against further constraints.
    fn from(concrete: Arc<ConcreteSpec>) -> Self {
        let node = concrete.node();
        let dependencies = concrete
            .dependencies()
            .iter()
            .map(|edge| Edge {
                spec: AbstractSpec::from(Arc::clone(&edge.spec)),
                depflag: edge.depflag,
                virtuals: edge.virtuals.clone(),
            })
            .collect();
        Self {
            name: Some(node.name.clone()),
            namespace: node.namespace.clone(),
            versions: VersionConstraint::exact(node.version.clone()),
            compiler: node.compiler.as_ref().map(|c| CompilerSpec {
                name: c.name.clone(),
                versions: VersionConstraint::exact(c.version.clone()),
            }),
            flags: node.variants.clone(),
            arch: node.arch.clone(),
            abstract_hash: None,
            dependencies,
            concrete: Some(concrete),
        }
    }
}

impl fmt::Display for AbstractSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = vec![self.node_format().to_string()];
        let mut deps: Vec<(String, String)> = self
            .transitive_edges()
            .into_iter()
            .map(|edge| {
                let node = edge.spec.node_format().to_string();
                let key = edge.spec.name().unwrap_or_default().to_owned();
                (key, format_edge(edge.depflag, &edge.virtuals, &node))
            })
            .collect();
        deps.sort();
        parts.extend(deps.into_iter().map(|(_, text)| text));
        let text = parts.join(" ");
        f.write_str(text.trim())
    }
}

/// The resolved compiler of a concrete node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConcreteCompiler {
    pub name: String,
    pub version: Version,
}

/// The attributes of one concrete node, without its edges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConcreteNode {
    pub name: String,
    pub namespace: Option<String>,
    pub version: Version,
    pub compiler: Option<ConcreteCompiler>,
    pub variants: BTreeMap<String, FlagValue>,
    pub arch: ArchSpec,
}

/// A dependency edge of a concrete spec.
#[derive(Debug, Clone)]
pub struct ConcreteEdge {
    pub spec: Arc<ConcreteSpec>,
    pub depflag: DepFlag,
    pub virtuals: BTreeSet<String>,
}

/// Serialized value of one variant in a node record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VariantValue {
    Bool(bool),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyRecord {
    pub hash: ConcreteHash,
    #[serde(rename = "type")]
    pub depflag: DepFlag,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub virtuals: BTreeSet<String>,
}

/// One node of the node-dict format. Its canonical JSON is what the DAG
/// hash is computed over, so dependency hashes fold in transitively.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub version: Version,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compiler: Option<ConcreteCompiler>,
    #[serde(default)]
    pub variants: BTreeMap<String, VariantValue>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub propagate: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "ArchSpec::is_empty")]
    pub arch: ArchSpec,
    #[serde(default)]
    pub dependencies: BTreeMap<String, DependencyRecord>,
}

impl NodeRecord {
    /// Node attributes of this record.
    pub fn node(&self) -> ConcreteNode {
        let variants = self
            .variants
            .iter()
            .map(|(key, value)| {
                let propagate = self.propagate.contains(key);
                let flag = match value {
                    VariantValue::Bool(value) => FlagValue::Bool {
                        value: *value,
                        propagate,
                    },
                    VariantValue::Text(value) => FlagValue::KeyValue {
                        value: value.clone(),
                        propagate,
                    },
                };
                (key.clone(), flag)
            })
            .collect();
        ConcreteNode {
            name: self.name.clone(),
            namespace: self.namespace.clone(),
            version: self.version.clone(),
            compiler: self.compiler.clone(),
            variants,
            arch: self.arch.clone(),
        }
    }

    pub fn canonical_json(&self) -> Result<String, SpecError> {
        serde_json::to_string(self).map_err(|e| SpecError::Serialization(e.to_string()))
    }
}

/// A fully resolved spec. Immutable; the DAG hash is fixed at construction.
#[derive(Debug, Clone)]
pub struct ConcreteSpec {
    node: ConcreteNode,
    dependencies: Vec<ConcreteEdge>,
    hash: ConcreteHash,
}

impl PartialEq for ConcreteSpec {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl Eq for ConcreteSpec {}

impl std::hash::Hash for ConcreteSpec {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl ConcreteSpec {
    /// Build a concrete node over already-concrete dependencies.
    pub fn new(
        node: ConcreteNode,
        mut dependencies: Vec<ConcreteEdge>,
    ) -> Result<Arc<Self>, SpecError> {
        let mut names = HashSet::new();
        for edge in &dependencies {
            if edge.spec.name() == node.name {
                return Err(SpecError::CircularReference(node.name.clone()));
            }
            if !names.insert(edge.spec.name()) {
                return Err(SpecError::DuplicateDependency(edge.spec.name().to_owned()));
            }
        }
        dependencies.sort_by(|a, b| a.spec.name().cmp(b.spec.name()));
        let record = node_record(&node, &dependencies);
        let hash = ConcreteHash::digest(record.canonical_json()?.as_bytes());
        Ok(Arc::new(Self {
            node,
            dependencies,
            hash,
        }))
    }

    /// Freeze an abstract spec whose every constraint already names a single
    /// value. Nodes spliced from spec files are reused as they are. A `^` edge
    /// without dependency kinds gets [`DepFlag::DEFAULT`].
    pub fn freeze(spec: &AbstractSpec) -> Result<Arc<Self>, SpecError> {
        let mut memo = HashMap::new();
        freeze_node(spec, &mut memo)
    }

    pub fn node(&self) -> &ConcreteNode {
        &self.node
    }

    pub fn name(&self) -> &str {
        &self.node.name
    }

    pub fn version(&self) -> &Version {
        &self.node.version
    }

    pub fn arch(&self) -> &ArchSpec {
        &self.node.arch
    }

    pub fn dependencies(&self) -> &[ConcreteEdge] {
        &self.dependencies
    }

    pub fn dag_hash(&self) -> &ConcreteHash {
        &self.hash
    }

    /// The node-dict record of this node.
    pub fn record(&self) -> NodeRecord {
        node_record(&self.node, &self.dependencies)
    }

    /// This node and every node below it, each once, in depth-first preorder.
    pub fn traverse(&self) -> Vec<&ConcreteSpec> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        let mut stack = vec![self];
        while let Some(spec) = stack.pop() {
            if !seen.insert(&spec.hash) {
                continue;
            }
            out.push(spec);
            stack.extend(spec.dependencies.iter().rev().map(|e| e.spec.as_ref()));
        }
        out
    }

    /// The first node named `name` in this DAG.
    pub fn find(&self, name: &str) -> Option<&ConcreteSpec> {
        self.traverse().into_iter().find(|s| s.name() == name)
    }

    /// `name/hash`, the shortest unambiguous display form.
    pub fn name_hash(&self) -> String {
        format!("{}/{}", self.node.name, self.hash)
    }

    /// `name@version /hash7`, for listings.
    pub fn short_spec(&self) -> String {
        format!("{}@{} /{}", self.node.name, self.node.version, self.hash.short())
    }

    /// True when every constraint of `constraint` holds for this DAG.
    /// Dependency constraints may be met by any node below the root.
    pub fn satisfies(&self, constraint: &AbstractSpec) -> bool {
        if let Some(other) = &constraint.concrete {
            return other.hash == self.hash;
        }
        if !self.node_satisfies(constraint) {
            return false;
        }
        constraint.dependencies.iter().all(|edge| {
            self.traverse()
                .into_iter()
                .skip(1)
                .any(|node| node.satisfies(&edge.spec))
        })
    }

    fn node_satisfies(&self, c: &AbstractSpec) -> bool {
        let node = &self.node;
        if c.name.as_ref().is_some_and(|n| *n != node.name) {
            return false;
        }
        if c.namespace.is_some() && c.namespace != node.namespace {
            return false;
        }
        if !c.versions.contains(&node.version) {
            return false;
        }
        if let Some(compiler) = &c.compiler {
            match &node.compiler {
                Some(mine)
                    if mine.name == compiler.name && compiler.versions.contains(&mine.version) => {}
                _ => return false,
            }
        }
        let flags_hold = c.flags.iter().all(|(key, wanted)| {
            node.variants
                .get(key)
                .is_some_and(|have| have.same_value(wanted))
        });
        if !flags_hold || !c.arch.is_satisfied_by(&node.arch) {
            return false;
        }
        c.abstract_hash
            .as_ref()
            .is_none_or(|prefix| prefix.is_prefix_of(&self.hash))
    }

    fn node_format(&self) -> NodeFormat<'_> {
        let node = &self.node;
        NodeFormat {
            namespace: node.namespace.as_deref(),
            name: Some(&node.name),
            versions: Some(node.version.to_string()),
            compiler: node
                .compiler
                .as_ref()
                .map(|c| (c.name.as_str(), Some(c.version.to_string()))),
            flags: &node.variants,
            arch: &node.arch,
            hash: None,
        }
    }
}

impl fmt::Display for ConcreteSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = vec![self.node_format().to_string()];
        let mut seen = HashSet::new();
        let mut deps = Vec::new();
        let mut stack: Vec<&ConcreteEdge> = self.dependencies.iter().collect();
        while let Some(edge) = stack.pop() {
            if !seen.insert(edge.spec.name()) {
                continue;
            }
            let node = edge.spec.node_format().to_string();
            deps.push((
                edge.spec.name().to_owned(),
                format_edge(edge.depflag, &edge.virtuals, &node),
            ));
            stack.extend(edge.spec.dependencies.iter());
        }
        deps.sort();
        parts.extend(deps.into_iter().map(|(_, text)| text));
        f.write_str(&parts.join(" "))
    }
}

fn node_record(node: &ConcreteNode, dependencies: &[ConcreteEdge]) -> NodeRecord {
    let mut variants = BTreeMap::new();
    let mut propagate = BTreeSet::new();
    for (key, flag) in &node.variants {
        if flag.propagate() {
            propagate.insert(key.clone());
        }
        let value = match flag {
            FlagValue::Bool { value, .. } => VariantValue::Bool(*value),
            FlagValue::KeyValue { value, .. } => VariantValue::Text(value.clone()),
        };
        variants.insert(key.clone(), value);
    }
    let dependencies = dependencies
        .iter()
        .map(|edge| {
            (
                edge.spec.name().to_owned(),
                DependencyRecord {
                    hash: edge.spec.dag_hash().clone(),
                    depflag: edge.depflag,
                    virtuals: edge.virtuals.clone(),
                },
            )
        })
        .collect();
    NodeRecord {
        name: node.name.clone(),
        namespace: node.namespace.clone(),
        version: node.version.clone(),
        compiler: node.compiler.clone(),
        variants,
        propagate,
        arch: node.arch.clone(),
        dependencies,
    }
}

/// Record `frozen` and everything below it by name. A name already bound
/// to a node with another hash is a conflict.
fn register(
    frozen: &Arc<ConcreteSpec>,
    memo: &mut HashMap<String, Arc<ConcreteSpec>>,
) -> Result<(), SpecError> {
    if let Some(known) = memo.get(frozen.name()) {
        if known.dag_hash() != frozen.dag_hash() {
            return Err(SpecError::ConflictingNodes {
                name: frozen.name().to_owned(),
                first: format!("/{}", known.dag_hash()),
                second: format!("/{}", frozen.dag_hash()),
            });
        }
        return Ok(());
    }
    memo.insert(frozen.name().to_owned(), Arc::clone(frozen));
    for edge in frozen.dependencies() {
        register(&edge.spec, memo)?;
    }
    Ok(())
}

fn freeze_node(
    spec: &AbstractSpec,
    memo: &mut HashMap<String, Arc<ConcreteSpec>>,
) -> Result<Arc<ConcreteSpec>, SpecError> {
    if let Some(concrete) = &spec.concrete {
        register(concrete, memo)?;
        return Ok(Arc::clone(concrete));
    }
    let Some(name) = spec.name.clone() else {
        return Err(SpecError::NotConcrete("anonymous node".to_owned()));
    };
    if let Some(done) = memo.get(&name) {
        if !done.node_satisfies(spec) {
            return Err(SpecError::ConflictingNodes {
                name,
                first: format!("/{}", done.dag_hash()),
                second: spec.node_format().to_string(),
            });
        }
        return Ok(Arc::clone(done));
    }
    if let Some(hash) = &spec.abstract_hash {
        return Err(SpecError::NotConcrete(format!(
            "{name}: unresolved hash reference /{hash}"
        )));
    }
    let Some(version) = spec.versions.as_concrete().cloned() else {
        return Err(SpecError::NotConcrete(format!(
            "{name}: version constraint '{}' is not a single version",
            spec.versions
        )));
    };
    let compiler = match &spec.compiler {
        None => None,
        Some(c) => match c.versions.as_concrete() {
            Some(v) => Some(ConcreteCompiler {
                name: c.name.clone(),
                version: v.clone(),
            }),
            None => {
                return Err(SpecError::NotConcrete(format!(
                    "{name}: compiler '{}' has no single version",
                    c.name
                )))
            }
        },
    };
    let mut dependencies = Vec::with_capacity(spec.dependencies.len());
    for edge in &spec.dependencies {
        let depflag = if edge.depflag.is_empty() {
            DepFlag::DEFAULT
        } else {
            edge.depflag
        };
        dependencies.push(ConcreteEdge {
            spec: freeze_node(&edge.spec, memo)?,
            depflag,
            virtuals: edge.virtuals.clone(),
        });
    }
    let node = ConcreteNode {
        name: name.clone(),
        namespace: spec.namespace.clone(),
        version,
        compiler,
        variants: spec.flags.clone(),
        arch: spec.arch.clone(),
    };
    let frozen = ConcreteSpec::new(node, dependencies)?;
    register(&frozen, memo)?;
    Ok(frozen)
}

/// Borrowed view of one node's attributes, rendered in canonical order:
/// `ns.name@versions%compiler@versions+a~b k=v arch=p-o-t /hash`.
struct NodeFormat<'a> {
    namespace: Option<&'a str>,
    name: Option<&'a str>,
    versions: Option<String>,
    compiler: Option<(&'a str, Option<String>)>,
    flags: &'a BTreeMap<String, FlagValue>,
    arch: &'a ArchSpec,
    hash: Option<&'a str>,
}

impl fmt::Display for NodeFormat<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::new();
        if let (Some(ns), Some(_)) = (self.namespace, self.name) {
            out.push_str(ns);
            out.push('.');
        }
        if let Some(name) = self.name {
            out.push_str(name);
        }
        if let Some(versions) = &self.versions {
            out.push('@');
            out.push_str(versions);
        }
        if let Some((name, versions)) = &self.compiler {
            out.push('%');
            out.push_str(name);
            if let Some(versions) = versions {
                out.push('@');
                out.push_str(versions);
            }
        }
        for (key, flag) in self.flags {
            if let FlagValue::Bool { value, propagate } = flag {
                let sigil = if *value { "+" } else { "~" };
                out.push_str(sigil);
                if *propagate {
                    out.push_str(sigil);
                }
                out.push_str(key);
            }
        }
        for (key, flag) in self.flags {
            if let FlagValue::KeyValue { value, propagate } = flag {
                let eq = if *propagate { "==" } else { "=" };
                out.push_str(&format!(" {key}{eq}{}", quote_if_needed(value)));
            }
        }
        let arch = self.arch;
        if arch.is_complete() {
            out.push_str(&format!(" arch={arch}"));
        } else {
            for (key, value) in [
                ("platform", &arch.platform),
                ("os", &arch.os),
                ("target", &arch.target),
            ] {
                if let Some(value) = value {
                    out.push_str(&format!(" {key}={value}"));
                }
            }
        }
        if let Some(hash) = self.hash {
            out.push_str(&format!(" /{hash}"));
        }
        f.write_str(out.trim_start())
    }
}

fn format_edge(depflag: DepFlag, virtuals: &BTreeSet<String>, node: &str) -> String {
    let mut attrs = Vec::new();
    if !depflag.is_empty() {
        attrs.push(format!("deptypes={depflag}"));
    }
    if !virtuals.is_empty() {
        let list: Vec<&str> = virtuals.iter().map(String::as_str).collect();
        attrs.push(format!("virtuals={}", list.join(",")));
    }
    if attrs.is_empty() {
        format!("^{node}")
    } else {
        format!("^[{}] {node}", attrs.join(" "))
    }
}

static NO_QUOTES_NEEDED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9,/_.\-]+$").expect("quote pattern is valid"));

/// Quote a flag value for output unless it only holds safe characters.
/// Single quotes are used unless the value itself contains one.
pub fn quote_if_needed(value: &str) -> String {
    if NO_QUOTES_NEEDED.is_match(value) {
        return value.to_owned();
    }
    let quote = if value.contains('\'') { '"' } else { '\'' };
    let mut out = String::with_capacity(value.len() + 2);
    out.push(quote);
    for c in value.chars() {
        if c == '\\' || c == quote {
            out.push('\\');
        }
        out.push(c);
    }
    out.push(quote);
    out
}

/// Remove one pair of matching surrounding quotes and unescape `\\` and
/// that quote character inside. Other backslashes are kept. Unquoted text
/// is returned as is.
pub fn strip_quotes_and_unescape(text: &str) -> String {
    for quote in ['"', '\''] {
        if text.len() >= 2 && text.starts_with(quote) && text.ends_with(quote) {
            let inner = &text[1..text.len() - 1];
            let mut out = String::with_capacity(inner.len());
            let mut chars = inner.chars().peekable();
            while let Some(c) = chars.next() {
                match chars.peek() {
                    Some(&next) if c == '\\' && (next == '\\' || next == quote) => {
                        out.push(next);
                        chars.next();
                    }
                    _ => out.push(c),
                }
            }
            return out;
        }
    }
    text.to_owned()
}
