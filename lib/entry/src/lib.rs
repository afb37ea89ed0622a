mod entry;
mod field;
mod severity;
mod value;

pub use entry::Entry;
pub use field::{Field, FieldError};
pub use severity::Severity;
pub use value::Value;
