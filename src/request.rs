//! Read job descriptors written by users

/// Validate a JSON job descriptor against the bundled schema and deserialise it
pub mod message;
