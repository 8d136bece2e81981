//! Field-level checks run by the store step before any statement is issued.

mod validation;
pub use validation::{validate_field, FieldValidator};
