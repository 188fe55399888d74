//! Repository functions: one function per store operation.
//!
//! Every function takes a `&Db` (reads) or `&mut Db` (writes) obtained from
//! [`Store::read`](crate::Store::read) / [`Store::write`](crate::Store::write)
//! and returns a `Result<T, StoreError>` where a lookup can miss.

pub mod actions;
pub mod dags;
pub mod edges;
pub mod groups;
pub mod nodes;
pub mod steps;
pub mod tasks;
