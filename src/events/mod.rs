//! Customer event schema and validation.

pub mod model;
pub mod validator;

pub use model::{CustomerEvent, EventType, Payload, canonicalize};
pub use validator::{ValidationResult, required_fields, validate};
