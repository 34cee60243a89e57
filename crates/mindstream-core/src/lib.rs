//! Shared vocabulary for the mindstream engine: events, status codes, ids,
//! error types, and the traits every collaborator of the turn loop implements.

pub mod errors;
pub mod event;
pub mod format;
pub mod hooks;
pub mod ids;
pub mod model;
pub mod status;
pub mod tools;

pub use errors::{ExecutorError, ModelError};
pub use event::{Event, StructuredFields, ToolType, UnknownToolType};
pub use ids::{RunId, SessionId};
pub use status::{ModelStatus, StatusCode};
