//! `store` crate: pure persistence layer.
//!
//! Provides the shared [`Store`] handle, typed row structs, and repository
//! functions for every table. Entities reference each other by id only;
//! dependency edges live in adjacency sets keyed by the owning tree's root.
//! No scheduling logic lives here.

pub mod error;
pub mod models;
pub mod repository;
pub mod store;

pub use error::StoreError;
pub use models::Id;
pub use store::{Db, Store};
