//! Error taxonomy and JSON protocol types shared by the annotator crates.

pub mod error;
pub mod protocol;

pub use error::ServiceError;
