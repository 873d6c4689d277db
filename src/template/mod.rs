//! Request template engine

pub mod engine;
pub mod json_path;
pub mod multipart;

pub use engine::{CHAT_CONTENT, Rendered, TemplateContext, TemplateEngine, ValueMappings};
pub use json_path::{get_all, get_path, get_string};
pub use multipart::{multipart_body, text_fields};
