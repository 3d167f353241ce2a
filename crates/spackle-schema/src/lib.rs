//! Spec syntax, the spec data model, and the hash-indexed spec source
//! capability for spackle.
//!
//! This crate is the schema layer: the tokenizer (`lexer`) and recursive
//! descent parser (`parser`) for spec strings, the abstract/concrete spec
//! model with DAG hashing (`spec`), node-dict spec files (`specfile`),
//! deterministic topological ordering (`traverse`), and the `SpecIndexable`
//! trait that install databases and build caches implement (`index`).

pub mod concretize;
pub mod deptypes;
pub mod hash;
pub mod index;
pub mod lexer;
pub mod parser;
pub mod spec;
pub mod specfile;
pub mod traverse;
pub mod version;

pub use concretize::{ConcretizeError, Concretizer, PinnedConcretizer};
pub use deptypes::DepFlag;
pub use hash::{
    CompleteHash, ConcreteHash, HashPrefix, PartialHash, FULL_HASH_STRING_LENGTH,
    SHORT_HASH_LENGTH,
};
pub use index::{
    ConcretizedSpec, EntryIter, IndexEntry, IndexError, IndexQuery, InstallRecord,
    InstallStatuses, PackageRepository, SpecIndexable, SpecIter,
};
pub use lexer::{tokenize, Token, TokenKind, TokenizationError, Tokenizer};
pub use parser::{parse, parse_one_or_raise, ParseError, SpecParser};
pub use spec::{
    AbstractSpec, ArchSpec, CompilerSpec, ConcreteEdge, ConcreteSpec, Edge, FlagValue, SpecError,
};
pub use specfile::{read_spec_file, write_spec_file, SpecFileError};
pub use traverse::{topological_sort, DependencyGraph, TopologicalSortError};
pub use version::{Version, VersionConstraint};
