//! Stage handler contract and the closed stage registry.

pub mod handler;
pub mod registry;

pub use handler::{StageHandler, StageHandlerDyn, StageInput, StageOutput};
pub use registry::{StageEntry, StageRegistry};
