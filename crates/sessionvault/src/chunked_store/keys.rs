//! Key layout for session records.

use crate::records::{ChunkedField, DetailField};

pub const SESSIONS_ROOT: &str = "sessions/";
const METADATA_SUFFIX: &str = "/metadata";

pub fn session_prefix(id: &str) -> String {
    format!("{}{}/", SESSIONS_ROOT, id)
}

pub fn metadata_key(id: &str) -> String {
    format!("{}{}{}", SESSIONS_ROOT, id, METADATA_SUFFIX)
}

pub fn detail_key(id: &str, field: DetailField) -> String {
    format!("{}{}/{}", SESSIONS_ROOT, id, field.as_str())
}

pub fn field_prefix(id: &str, field: ChunkedField) -> String {
    format!("{}{}/{}/", SESSIONS_ROOT, id, field.as_str())
}

pub fn chunk_key(id: &str, field: ChunkedField, index: usize) -> String {
    format!("{}chunk-{:03}", field_prefix(id, field), index)
}

/// Session id of a `sessions/<id>/metadata` key.
pub fn session_id_from_metadata_key(key: &str) -> Option<&str> {
    let id = key.strip_prefix(SESSIONS_ROOT)?.strip_suffix(METADATA_SUFFIX)?;
    (!id.is_empty() && !id.contains('/')).then_some(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        assert_eq!(metadata_key("s1"), "sessions/s1/metadata");
        assert_eq!(detail_key("s1", DetailField::CanvasSpec), "sessions/s1/canvas_spec");
        assert_eq!(
            chunk_key("s1", ChunkedField::Screenshots, 7),
            "sessions/s1/screenshots/chunk-007"
        );
        assert_eq!(
            chunk_key("s1", ChunkedField::AudioSegments, 1234),
            "sessions/s1/audio_segments/chunk-1234"
        );
    }

    #[test]
    fn test_metadata_key_parsing() {
        assert_eq!(session_id_from_metadata_key("sessions/abc/metadata"), Some("abc"));
        assert_eq!(session_id_from_metadata_key("sessions/abc/screenshots/metadata"), None);
        assert_eq!(session_id_from_metadata_key("notes/abc"), None);
    }
}
