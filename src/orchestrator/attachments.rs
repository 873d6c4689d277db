//! Attachment decoding on a bounded blocking pool

use std::path::Path;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tokio::sync::Semaphore;

use crate::error::{BatchboxError, Result};
use crate::types::{Attachment, AttachmentSource};

const FALLBACK_MIME: &str = "image/png";

/// Bounded gate in front of `spawn_blocking`, so a large batch of decodes
/// cannot starve Tokio's blocking threads
#[derive(Debug, Clone)]
pub struct BlockingPool {
    permits: Arc<Semaphore>,
}

impl BlockingPool {
    pub fn new(workers: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(workers.max(1))),
        }
    }

    pub async fn run<F, R>(&self, job: F) -> Result<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let _permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| BatchboxError::internal("blocking pool closed"))?;
        tokio::task::spawn_blocking(job)
            .await
            .map_err(|e| BatchboxError::internal(format!("blocking task failed: {e}")))
    }
}

impl Default for BlockingPool {
    fn default() -> Self {
        Self::new(4)
    }
}

/// Split `data:<mime>;base64,<payload>` into its mime type and payload
fn split_data_url(text: &str) -> (Option<&str>, &str) {
    let Some(rest) = text.strip_prefix("data:") else {
        return (None, text);
    };
    match rest.split_once(',') {
        Some((meta, payload)) => {
            let mime = meta.split(';').next().filter(|m| !m.is_empty());
            (mime, payload)
        }
        None => (None, rest),
    }
}

/// MIME type and file extension, from the content first and `fallback` second
fn sniff(bytes: &[u8], fallback: impl FnOnce() -> String) -> (String, String) {
    if let Some(kind) = infer::get(bytes) {
        return (kind.mime_type().to_string(), kind.extension().to_string());
    }
    let mime = fallback();
    let ext = mime_guess::get_mime_extensions_str(&mime)
        .and_then(|exts| exts.first().copied())
        .unwrap_or("bin")
        .to_string();
    (mime, ext)
}

fn decode_base64(index: usize, text: &str, file_name: Option<String>) -> Result<Attachment> {
    let (declared_mime, payload) = split_data_url(text.trim());
    let bytes = STANDARD.decode(payload.as_bytes()).map_err(|e| {
        BatchboxError::config(format!("attachment {} is not valid base64: {e}", index + 1))
    })?;
    let (mime, ext) = sniff(&bytes, || declared_mime.unwrap_or(FALLBACK_MIME).to_string());
    let file_name = file_name.unwrap_or_else(|| format!("image{}.{ext}", index + 1));
    Ok(Attachment::new(file_name, mime, bytes).with_encoded(payload.to_string()))
}

fn read_file(index: usize, path: &Path) -> Result<Attachment> {
    let bytes = std::fs::read(path).map_err(|e| {
        BatchboxError::config(format!("cannot read attachment {}: {e}", path.display()))
    })?;
    let (mime, ext) = sniff(&bytes, || {
        mime_guess::from_path(path).first_or_octet_stream().to_string()
    });
    let file_name = format!("image{}.{ext}", index + 1);
    Ok(Attachment::new(file_name, mime, bytes))
}

/// Decode every source once, in order, off the async scheduler
pub async fn decode_attachments(
    pool: &BlockingPool,
    sources: &[AttachmentSource],
) -> Result<Arc<[Attachment]>> {
    let jobs = sources.iter().cloned().enumerate().map(|(index, source)| {
        pool.run(move || match source {
            AttachmentSource::Base64 { data, file_name } => decode_base64(index, &data, file_name),
            AttachmentSource::FileRef { path } => read_file(index, &path),
        })
    });
    let decoded = futures::future::join_all(jobs).await;
    let attachments = decoded
        .into_iter()
        .map(|outcome| outcome.and_then(|inner| inner))
        .collect::<Result<Vec<_>>>()?;
    Ok(Arc::from(attachments))
}
