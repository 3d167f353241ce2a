//! Node-dict spec files.
//!
//! A concrete spec is stored as a flat map from DAG hash to node record,
//! plus the hash of the root:
//!
//! ```json
//! {"spec": {"_meta": {"version": 1}, "root": "<hash>", "nodes": {"<hash>": {...}}}}
//! ```
//!
//! Reading rebuilds the DAG bottom-up and recomputes every hash; a node
//! whose key does not match its content is rejected.

use crate::spec::{ConcreteEdge, ConcreteSpec, NodeRecord, SpecError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

pub const SPEC_FILE_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum SpecFileError {
    #[error("No such spec file: '{}'", .0.display())]
    NoSuchSpecFile(PathBuf),
    #[error("spec file I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("spec file JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("spec file YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("unsupported spec file format version {found} (expected {SPEC_FILE_FORMAT_VERSION})")]
    UnsupportedVersion { found: u32 },
    #[error("spec file is not .json or .yaml: '{}'", .0.display())]
    UnknownFormat(PathBuf),
    #[error("node '{0}' is referenced but not present in the spec file")]
    MissingNode(String),
    #[error("spec file has no single root node")]
    NoRoot,
    #[error("dependency cycle through node '{0}'")]
    Cycle(String),
    #[error("hash mismatch for '{name}': file says {expected}, content hashes to {actual}")]
    HashMismatch {
        name: String,
        expected: String,
        actual: String,
    },
    #[error(transparent)]
    Spec(#[from] SpecError),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct Meta {
    version: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct NodeDict {
    #[serde(rename = "_meta")]
    meta: Meta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    root: Option<String>,
    nodes: BTreeMap<String, NodeRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SpecDocument {
    spec: NodeDict,
}

impl SpecDocument {
    fn from_spec(spec: &ConcreteSpec) -> Self {
        let nodes = node_map([spec]);
        Self {
            spec: NodeDict {
                meta: Meta {
                    version: SPEC_FILE_FORMAT_VERSION,
                },
                root: Some(spec.dag_hash().to_string()),
                nodes,
            },
        }
    }

    fn into_spec(self) -> Result<Arc<ConcreteSpec>, SpecFileError> {
        let dict = self.spec;
        if dict.meta.version != SPEC_FILE_FORMAT_VERSION {
            return Err(SpecFileError::UnsupportedVersion {
                found: dict.meta.version,
            });
        }
        let root = match dict.root {
            Some(root) => root,
            None => find_root(&dict.nodes)?,
        };
        let mut builder = DagBuilder {
            nodes: &dict.nodes,
            built: HashMap::new(),
            visiting: HashSet::new(),
        };
        builder.build(&root)
    }
}

/// The single node no other node depends on.
fn find_root(nodes: &BTreeMap<String, NodeRecord>) -> Result<String, SpecFileError> {
    let referenced: BTreeSet<&str> = nodes
        .values()
        .flat_map(|n| n.dependencies.values().map(|d| d.hash.as_str()))
        .collect();
    let mut roots = nodes.keys().filter(|k| !referenced.contains(k.as_str()));
    match (roots.next(), roots.next()) {
        (Some(root), None) => Ok(root.clone()),
        _ => Err(SpecFileError::NoRoot),
    }
}

struct DagBuilder<'a> {
    nodes: &'a BTreeMap<String, NodeRecord>,
    built: HashMap<String, Arc<ConcreteSpec>>,
    visiting: HashSet<String>,
}

impl DagBuilder<'_> {
    fn build(&mut self, hash: &str) -> Result<Arc<ConcreteSpec>, SpecFileError> {
        if let Some(done) = self.built.get(hash) {
            return Ok(Arc::clone(done));
        }
        let nodes = self.nodes;
        let record = nodes
            .get(hash)
            .ok_or_else(|| SpecFileError::MissingNode(hash.to_owned()))?;
        if !self.visiting.insert(hash.to_owned()) {
            return Err(SpecFileError::Cycle(record.name.clone()));
        }
        let mut edges = Vec::with_capacity(record.dependencies.len());
        for dep in record.dependencies.values() {
            edges.push(ConcreteEdge {
                spec: self.build(dep.hash.as_str())?,
                depflag: dep.depflag,
                virtuals: dep.virtuals.clone(),
            });
        }
        let spec = ConcreteSpec::new(record.node(), edges)?;
        if spec.dag_hash().as_str() != hash {
            return Err(SpecFileError::HashMismatch {
                name: record.name.clone(),
                expected: hash.to_owned(),
                actual: spec.dag_hash().to_string(),
            });
        }
        self.visiting.remove(hash);
        self.built.insert(hash.to_owned(), Arc::clone(&spec));
        Ok(spec)
    }
}

/// Rebuild every node of a hash-keyed node map, verifying each key against
/// the hash of its content. Nodes shared between DAGs are built once.
pub fn rebuild_nodes(
    nodes: &BTreeMap<String, NodeRecord>,
) -> Result<BTreeMap<String, Arc<ConcreteSpec>>, SpecFileError> {
    let mut builder = DagBuilder {
        nodes,
        built: HashMap::new(),
        visiting: HashSet::new(),
    };
    nodes
        .keys()
        .map(|hash| Ok((hash.clone(), builder.build(hash)?)))
        .collect()
}

/// Flatten specs into a hash-keyed node map, the inverse of [`rebuild_nodes`].
pub fn node_map<'a>(
    specs: impl IntoIterator<Item = &'a ConcreteSpec>,
) -> BTreeMap<String, NodeRecord> {
    let mut nodes = BTreeMap::new();
    for spec in specs {
        for node in spec.traverse() {
            nodes
                .entry(node.dag_hash().to_string())
                .or_insert_with(|| node.record());
        }
    }
    nodes
}

pub fn to_json(spec: &ConcreteSpec) -> Result<String, SpecFileError> {
    Ok(serde_json::to_string_pretty(&SpecDocument::from_spec(spec))?)
}

pub fn to_yaml(spec: &ConcreteSpec) -> Result<String, SpecFileError> {
    Ok(serde_yaml::to_string(&SpecDocument::from_spec(spec))?)
}

pub fn from_json(text: &str) -> Result<Arc<ConcreteSpec>, SpecFileError> {
    serde_json::from_str::<SpecDocument>(text)?.into_spec()
}

pub fn from_yaml(text: &str) -> Result<Arc<ConcreteSpec>, SpecFileError> {
    serde_yaml::from_str::<SpecDocument>(text)?.into_spec()
}

enum Format {
    Json,
    Yaml,
}

fn format_of(path: &Path) -> Result<Format, SpecFileError> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => Ok(Format::Json),
        Some("yaml" | "yml") => Ok(Format::Yaml),
        _ => Err(SpecFileError::UnknownFormat(path.to_path_buf())),
    }
}

/// Read a concrete spec from a `.json` or `.yaml` node-dict file.
pub fn read_spec_file(path: impl AsRef<Path>) -> Result<Arc<ConcreteSpec>, SpecFileError> {
    let path = path.as_ref();
    if !path.is_file() {
        return Err(SpecFileError::NoSuchSpecFile(path.to_path_buf()));
    }
    let format = format_of(path)?;
    tracing::debug!("reading spec file {}", path.display());
    let content = fs::read_to_string(path)?;
    match format {
        Format::Json => from_json(&content),
        Format::Yaml => from_yaml(&content),
    }
}

/// Write `spec` atomically, choosing the format from the extension.
pub fn write_spec_file(spec: &ConcreteSpec, path: impl AsRef<Path>) -> Result<(), SpecFileError> {
    let path = path.as_ref();
    let content = match format_of(path)? {
        Format::Json => to_json(spec)?,
        Format::Yaml => to_yaml(spec)?,
    };
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    std::io::Write::write_all(&mut tmp, content.as_bytes())?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| SpecFileError::Io(e.error))?;
    if let Ok(f) = fs::File::open(dir) {
        let _ = f.sync_all();
    }
    Ok(())
}
