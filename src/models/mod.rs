//! Core data models for the image service.
//!
//! Records serialize as camelCase JSON via `serde`, which is both the HTTP
//! response shape and the DynamoDB attribute naming.

pub mod image;
