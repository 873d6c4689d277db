//! Multipart and form encodings of a rendered body

use serde_json::{Map, Value};

use super::engine::stringify;
use crate::config::FileFormat;
use crate::http::{FilePart, RequestBody};
use crate::types::Attachment;

/// Flatten a rendered JSON object into text fields, skipping nulls and any
/// key that collides with a file part name
pub fn text_fields(body: &Map<String, Value>, file_field: Option<&str>) -> Vec<(String, String)> {
    body.iter()
        .filter(|(key, value)| {
            !value.is_null() && file_field.is_none_or(|field| !is_file_key(key, field))
        })
        .map(|(key, value)| (key.clone(), stringify(value)))
        .collect()
}

/// `image`, `image[0]`, `image[]` and `image1` collide with field `image`
fn is_file_key(key: &str, field: &str) -> bool {
    match key.strip_prefix(field) {
        Some("") => true,
        Some(rest) if rest.starts_with('[') && rest.ends_with(']') => true,
        Some(rest) => rest.chars().all(|c| c.is_ascii_digit()),
        None => false,
    }
}

/// Name the attachments per `file_format` and pair them with the text fields
pub fn multipart_body(
    body: &Map<String, Value>,
    attachments: &[Attachment],
    file_format: FileFormat,
    file_field: &str,
) -> RequestBody {
    let files = attachments
        .iter()
        .enumerate()
        .map(|(i, attachment)| FilePart {
            field: file_format.field_name(file_field, i),
            attachment: attachment.clone(),
        })
        .collect();
    RequestBody::Multipart {
        fields: text_fields(body, Some(file_field)),
        files,
    }
}
