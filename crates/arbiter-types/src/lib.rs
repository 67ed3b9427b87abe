//! Arbiter Types
//!
//! This crate defines the data model shared by every Arbiter crate: the dynamically typed
//! [`FactValue`] used by expression conditions, the [`Fact`] trait implemented by application
//! records, and the [`FactType`] identifier the session and dependency analysis key on.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod fact;
mod value;

pub use fact::{Fact, FactType, FieldKind, FieldSpec, short_type_name};
pub use value::FactValue;
