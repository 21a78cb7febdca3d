//! Manifold reference mapping catalog.
//!
//! Kind-specific reference behaviour lives here as data: each [`RefMapper`]
//! says where to read a value in a source record, which kind it points at and
//! how to match it there. One generic resolver consumes the whole table.

#![forbid(unsafe_code)]

pub mod builtin;
pub mod catalog;
pub mod path;
pub mod rule;

pub use catalog::{Catalog, RuleError};
pub use path::{scalar_string, Located, PathError, PropertyPath, Segment};
pub use rule::{Guard, MatcherKind, NamespaceMode, RefMapper, RefMapperSpec, TargetMatcher};
