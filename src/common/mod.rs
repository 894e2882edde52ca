//! Infrastructure shared by the frontend and backend: source positions,
//! the compile error taxonomy, and identifier suggestions.

pub mod error;
pub mod source;
pub mod suggest;
pub mod types;
