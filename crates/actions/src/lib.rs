//! `actions` crate: the action catalog types, schema checks, and the
//! `Executor` trait the engine dispatches work through.
//!
//! The engine never runs an action itself; every action-backed step is
//! handed to an [`Executor`] and its outcome recorded when it comes back.

pub mod error;
pub mod mock;
pub mod registry;
pub mod schema;
pub mod spec;
pub mod traits;

pub use error::ActionError;
pub use registry::ExecutorRegistry;
pub use schema::FieldError;
pub use spec::{ActionKind, ActionSpec};
pub use traits::{ActionOutput, DispatchRequest, Executor};
