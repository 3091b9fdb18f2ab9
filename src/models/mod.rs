//! Core data models for the file ingestion service.
//!
//! These types describe stored files, the access rules that group them, and
//! the background job payload emitted for image uploads. They serialize
//! naturally as JSON via `serde`.

pub mod access;
pub mod file;
pub mod thumbnail;
