pub mod access;
pub mod file_service;
pub mod mime;
pub mod upload;
