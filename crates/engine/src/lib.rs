//! `engine` crate: template graphs, fan-out, dependency resolution, the
//! execution state machine, graph assembly and the scheduler that ties them
//! together.

pub mod assembler;
pub mod catalog;
pub mod driver;
pub mod error;
pub mod fanout;
pub mod models;
pub mod payload;
pub mod resolver;
pub mod scheduler;
pub mod state;
pub mod template;

pub use assembler::Component;
pub use error::EngineError;
pub use models::{ComponentSpec, DagSpec, EdgeSpec, NodeSpec, SubDagSpec};
pub use scheduler::{Scheduler, SchedulerConfig};
