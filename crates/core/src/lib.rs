//! Shared identifiers and the validation/conflict error model.
//!
//! This crate carries no infrastructure concerns; the queue core and its
//! collaborators build on these types.

pub mod error;
pub mod id;

pub use error::{DomainError, DomainResult};
pub use id::{ArticleId, DomainId};
