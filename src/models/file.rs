//! Represents an uploaded file's metadata record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Metadata for a single stored file.
///
/// The record describes the blob stored under `storage_key`; it never holds
/// the content bytes. Records are created once per successful upload and are
/// not mutated afterwards.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct FileMetadata {
    /// Identifier generated at ingestion time.
    pub id: Uuid,

    /// Client-supplied filename, used for download headers only.
    pub original_name: String,

    /// Backend-relative locator of the blob.
    pub storage_key: String,

    /// MIME type detected from the content, parameters included.
    pub mime_type: String,

    /// Byte length observed at ingestion.
    pub size_bytes: i64,

    /// Uploading principal; `None` for system-owned files.
    pub owner_id: Option<String>,

    /// Access-control groups assigned at upload time.
    pub tags: BTreeSet<String>,

    /// Server-assigned creation time.
    pub created_at: DateTime<Utc>,
}

impl FileMetadata {
    /// Base MIME type without parameters, e.g. `text/plain` for
    /// `text/plain; charset=utf-8`.
    pub fn base_mime_type(&self) -> &str {
        base_mime_type(&self.mime_type)
    }

    pub fn is_image(&self) -> bool {
        self.base_mime_type().starts_with("image/")
    }
}

/// Strip any `; param=value` suffix from a MIME type.
pub fn base_mime_type(mime: &str) -> &str {
    mime.split(';').next().unwrap_or(mime).trim()
}

/// Normalize a raw tag list: trim whitespace, drop empties, collapse duplicates.
pub fn normalize_tags<I, S>(raw: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    raw.into_iter()
        .map(|t| t.as_ref().trim().to_string())
        .filter(|t| !t.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_type_strips_parameters() {
        assert_eq!(base_mime_type("text/plain; charset=utf-8"), "text/plain");
        assert_eq!(base_mime_type("image/png"), "image/png");
    }

    #[test]
    fn tags_are_trimmed_and_deduplicated() {
        let tags = normalize_tags([" invoice", "invoice ", "", "hr"]);
        assert_eq!(tags.into_iter().collect::<Vec<_>>(), vec!["hr", "invoice"]);
    }
}
