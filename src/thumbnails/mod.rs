//! Thumbnail pipeline consumer: decode each uploaded image once and store
//! fitted PNG variants under `thumbnails/<fileId>/<variant>.png`.

pub mod processor;
pub mod worker;

pub use worker::ThumbnailWorker;
