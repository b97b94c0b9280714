//! Turns axum's multipart extractor into [`UploadEvent`]s.
//!
//! File parts are spooled into `tmp_dir` as they arrive. The upload pipeline
//! owns every temp file it was told about, so this side only cleans up a file
//! whose `FileBegin` never reached the pipeline.

use std::path::Path;

use axum::extract::Multipart;
use axum::extract::multipart::{Field, MultipartError};
use axum::http::StatusCode;
use futures::SinkExt;
use futures::channel::mpsc::Sender;
use stowage_core::UploadEvent;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

/// Largest plain form field kept in memory.
pub const MAX_FIELD_SIZE: usize = 64 * 1024;

/// Why pumping stopped early.
enum Stop {
    /// The pipeline dropped its receiver.
    Closed,
    /// The body could not be read.
    Body(MultipartError),
    /// A temp file could not be written.
    Io(std::io::Error),
    /// A part breaks the form limits.
    Malformed(String),
}

impl From<MultipartError> for Stop {
    fn from(err: MultipartError) -> Self {
        Self::Body(err)
    }
}

impl From<std::io::Error> for Stop {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

/// Reads every part of `multipart`, sending the matching events to `events`.
///
/// Ends with [`UploadEvent::StreamEnd`] on a clean body,
/// [`UploadEvent::ParseError`] on a malformed one and [`UploadEvent::Aborted`]
/// when the client went away or a temp file failed. Returns quietly once the
/// receiver is gone. Dropping the future stops reading the body.
pub async fn pump(mut multipart: Multipart, tmp_dir: &Path, mut events: Sender<UploadEvent>) {
    let mut received = 0u64;
    let last = match pump_parts(&mut multipart, tmp_dir, &mut events, &mut received).await {
        Ok(()) => UploadEvent::StreamEnd,
        Err(Stop::Closed) => return,
        Err(Stop::Body(err)) if err.status() == StatusCode::BAD_REQUEST => {
            UploadEvent::ParseError(err.body_text())
        }
        Err(Stop::Body(err)) => {
            debug!(error = %err, received, "Request body interrupted");
            UploadEvent::Aborted
        }
        Err(Stop::Io(err)) => {
            warn!(error = %err, "Failed to spool upload");
            UploadEvent::Aborted
        }
        Err(Stop::Malformed(msg)) => UploadEvent::ParseError(msg),
    };
    let _ = events.send(last).await;
}

async fn pump_parts(
    multipart: &mut Multipart,
    tmp_dir: &Path,
    events: &mut Sender<UploadEvent>,
    received: &mut u64,
) -> Result<(), Stop> {
    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();
        match field.file_name().map(str::to_string) {
            Some(file_name) => spool_file(field, name, file_name, tmp_dir, events, received).await?,
            None => {
                let value = read_text(field, events, received).await?;
                send(events, UploadEvent::Field { name, value }).await?;
            }
        }
    }
    Ok(())
}

async fn spool_file(
    mut field: Field<'_>,
    name: String,
    file_name: String,
    tmp_dir: &Path,
    events: &mut Sender<UploadEvent>,
    received: &mut u64,
) -> Result<(), Stop> {
    let temp_path = tmp_dir.join(format!("upload_{}", Uuid::new_v4().simple()));
    let mut file = File::create(&temp_path).await?;

    let begin = UploadEvent::FileBegin {
        field: name,
        file_name,
        content_type: field.content_type().map(str::to_string),
        temp_path: temp_path.clone(),
    };
    if events.send(begin).await.is_err() {
        drop(file);
        remove_orphan(&temp_path).await;
        return Err(Stop::Closed);
    }

    let mut size = 0u64;
    while let Some(chunk) = field.chunk().await? {
        file.write_all(&chunk).await?;
        size += chunk.len() as u64;
        *received += chunk.len() as u64;
        send(events, progress(*received)).await?;
    }
    file.flush().await?;
    drop(file);

    send(events, UploadEvent::FileComplete { temp_path, size }).await
}

/// Collects a plain form field, reporting progress per chunk.
async fn read_text(
    mut field: Field<'_>,
    events: &mut Sender<UploadEvent>,
    received: &mut u64,
) -> Result<String, Stop> {
    let mut value = Vec::new();
    while let Some(chunk) = field.chunk().await? {
        if value.len() + chunk.len() > MAX_FIELD_SIZE {
            return Err(Stop::Malformed(format!(
                "form field exceeds {MAX_FIELD_SIZE} bytes"
            )));
        }
        value.extend_from_slice(&chunk);
        *received += chunk.len() as u64;
        send(events, progress(*received)).await?;
    }
    Ok(String::from_utf8_lossy(&value).into_owned())
}

async fn send(events: &mut Sender<UploadEvent>, event: UploadEvent) -> Result<(), Stop> {
    events.send(event).await.map_err(|_| Stop::Closed)
}

fn progress(bytes_received: u64) -> UploadEvent {
    UploadEvent::Progress { bytes_received }
}

async fn remove_orphan(path: &Path) {
    if let Err(err) = tokio::fs::remove_file(path).await {
        warn!(path = %path.display(), error = %err, "Failed to remove temp file");
    }
}
