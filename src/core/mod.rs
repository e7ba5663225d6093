pub mod error;
pub mod record;
pub mod types;

pub use error::{FieldDecodeError, Result, StateError};
pub use record::EntityRecord;
pub use types::{EntityId, SanctionEntry, SanctionKind};
