//! Public data model for the embedded property-graph storage engine.
//!
//! This crate is deliberately small: the `Value` codec, the `Node`/`Edge`
//! entity types, and the statistics snapshot type, with no storage, no
//! concurrency, and no I/O. `graphdb-storage` depends on it; so can any
//! other crate that wants to speak the engine's wire format without
//! pulling in the engine itself.

pub mod model;
pub mod value;

pub use model::{Edge, Node, Statistics, ABSENT_ID};
pub use value::{tag_name, DecodeError, Value, WrongValueType};
