//! Network collaborator for the melo catalog cache.
//!
//! The cache layer never talks HTTP itself: it consumes the [`CatalogApi`]
//! trait defined here and the loosely-typed network [`models`]. With the
//! `mock` feature, [`MockCatalog`] provides an in-memory implementation
//! with call counters and failure injection for tests.

mod api;
pub mod error;
#[cfg(feature = "mock")]
mod mock;
pub mod models;

pub use crate::api::{CatalogApi, DEFAULT_MAX_BATCH_SIZE};
#[cfg(feature = "mock")]
pub use crate::mock::{Call, MockCatalog};
pub use melo_asyncutils::Page;
use std::sync::Arc;

pub type ApiHandle = Arc<dyn CatalogApi>;
