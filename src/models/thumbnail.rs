//! Thumbnail job payload and the derived-blob naming scheme.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::file::FileMetadata;

/// Extension of every derived thumbnail; the worker always encodes PNG.
pub const THUMBNAIL_EXTENSION: &str = "png";

/// Published once per eligible upload. The wire form has exactly these
/// three fields, in camelCase.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ThumbnailEvent {
    pub file_id: Uuid,
    pub storage_key: String,
    pub mime_type: String,
}

impl From<&FileMetadata> for ThumbnailEvent {
    fn from(file: &FileMetadata) -> Self {
        Self {
            file_id: file.id,
            storage_key: file.storage_key.clone(),
            mime_type: file.mime_type.clone(),
        }
    }
}

/// A named target size. Images are fitted inside `max_width` x `max_height`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ThumbnailVariant {
    pub name: &'static str,
    pub max_width: u32,
    pub max_height: u32,
}

pub const THUMBNAIL_VARIANTS: [ThumbnailVariant; 2] = [
    ThumbnailVariant {
        name: "small",
        max_width: 150,
        max_height: 150,
    },
    ThumbnailVariant {
        name: "medium",
        max_width: 600,
        max_height: 600,
    },
];

pub fn find_variant(name: &str) -> Option<ThumbnailVariant> {
    THUMBNAIL_VARIANTS.iter().copied().find(|v| v.name == name)
}

/// `thumbnails/<fileId>/<variant>.png`
pub fn thumbnail_key(file_id: Uuid, variant: &str) -> String {
    format!("thumbnails/{}/{}.{}", file_id, variant, THUMBNAIL_EXTENSION)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_wire_format_uses_three_camel_case_fields() {
        let id = Uuid::new_v4();
        let event = ThumbnailEvent {
            file_id: id,
            storage_key: format!("{}.png", id),
            mime_type: "image/png".into(),
        };
        let value = serde_json::to_value(&event).unwrap();
        let obj = value.as_object().unwrap();
        assert_eq!(obj.len(), 3);
        assert_eq!(obj["fileId"], id.to_string());
        assert_eq!(obj["storageKey"], format!("{}.png", id));
        assert_eq!(obj["mimeType"], "image/png");
    }

    #[test]
    fn thumbnail_keys_are_namespaced_by_file_and_variant() {
        let id = Uuid::nil();
        assert_eq!(
            thumbnail_key(id, "small"),
            "thumbnails/00000000-0000-0000-0000-000000000000/small.png"
        );
        assert!(find_variant("medium").is_some());
        assert!(find_variant("huge").is_none());
    }
}
