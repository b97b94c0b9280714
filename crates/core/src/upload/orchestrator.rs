//! Fans every uploaded file out to all transports and joins the results.
//!
//! ```text
//! FileBegin ──> create_artifact on every transport (first = reporting)
//! FileComplete ──> validate ──┬─ rejected: fail reporting artifact, drop temp
//!                             └─ accepted: spawn store task
//!                                  ├─ reporting.store ──> oneshot ──> caller
//!                                  ├─ shadow.store ...   (awaited by the task)
//!                                  └─ remove temp file once all settled
//! StreamEnd / Aborted ──> await every reporting result ──> UploadOutcome
//! ```

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::join_all;
use futures::{Stream, StreamExt};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::error::UploadError;
use super::events::UploadEvent;
use super::policy::UploadPolicy;
use crate::artifact::{Artifact, FormFields, RawUpload};
use crate::context::RequestContext;
use crate::naming::sanitize;
use crate::transport::{StorageError, Transport};

/// Form field naming the page the client wants to be sent to afterwards.
pub const REDIRECT_FIELD: &str = "redirect";

const INCOMPLETE: &str = "File upload incomplete";
const TASK_LOST: &str = "Storage task stopped unexpectedly";

/// How the inbound stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStatus {
    /// The body was fully received.
    Completed,
    /// The client went away; only settled files are reported.
    Aborted,
}

/// Store tasks still running for shadow transports.
///
/// Dropping the set detaches the tasks; they still run to completion.
#[derive(Debug, Default)]
pub struct MirrorSet {
    tasks: Vec<JoinHandle<()>>,
}

impl MirrorSet {
    /// Number of store tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// True when no file was stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Waits until every transport settled and every temp file is gone.
    pub async fn wait(self) {
        for task in self.tasks {
            if let Err(err) = task.await {
                warn!(error = %err, "Store task failed");
            }
        }
    }
}

/// Result of one upload request.
#[derive(Debug)]
pub struct UploadOutcome {
    /// Reporting artifacts, one per file, in arrival order.
    pub files: Vec<Artifact>,
    /// Value of the `redirect` form field.
    pub redirect: Option<String>,
    /// How the inbound stream ended.
    pub status: UploadStatus,
    /// Background work of shadow transports.
    pub mirrors: MirrorSet,
}

/// Entry point of the pipeline: uploads, listing and deletion across all transports.
pub struct UploadService {
    reporting: Arc<dyn Transport>,
    shadows: Vec<Arc<dyn Transport>>,
    policy: UploadPolicy,
}

impl UploadService {
    /// Create a service; the first transport reports to the caller.
    ///
    /// # Errors
    ///
    /// Returns [`UploadError::NoTransports`] for an empty list.
    pub fn new(transports: Vec<Arc<dyn Transport>>, policy: UploadPolicy) -> Result<Self, UploadError> {
        let mut transports = transports.into_iter();
        let reporting = transports.next().ok_or(UploadError::NoTransports)?;
        Ok(Self {
            reporting,
            shadows: transports.collect(),
            policy,
        })
    }

    /// The transport whose artifacts the caller sees.
    #[must_use]
    pub fn reporting(&self) -> &Arc<dyn Transport> {
        &self.reporting
    }

    /// Mirror transports.
    #[must_use]
    pub fn shadows(&self) -> &[Arc<dyn Transport>] {
        &self.shadows
    }

    /// Upload limits.
    #[must_use]
    pub fn policy(&self) -> &UploadPolicy {
        &self.policy
    }

    /// Files stored by the reporting transport.
    pub async fn list(&self, ctx: &RequestContext) -> Result<Vec<Artifact>, StorageError> {
        self.reporting.list(ctx).await
    }

    /// Deletes from every transport; the reporting transport's result counts.
    pub async fn delete(&self, identifier: &str) -> Result<(), StorageError> {
        let (reported, mirrored) = tokio::join!(
            self.reporting.delete(identifier),
            join_all(self.shadows.iter().map(|t| t.delete(identifier)))
        );
        for (transport, result) in self.shadows.iter().zip(mirrored) {
            if let Err(err) = result {
                warn!(transport = transport.kind(), identifier, error = %err, "Shadow delete failed");
            }
        }
        reported
    }

    /// Drives one request's event stream to completion.
    ///
    /// Returns once the stream ended or aborted and every file's reporting
    /// transport settled. A stream that closes without [`UploadEvent::StreamEnd`]
    /// counts as aborted.
    ///
    /// # Errors
    ///
    /// Returns [`UploadError::Parse`] for a malformed body and
    /// [`UploadError::PostTooLarge`] when the body passes `max_post_size`; in
    /// both cases the caller should drop the connection.
    pub async fn upload<S>(&self, events: S, ctx: &RequestContext) -> Result<UploadOutcome, UploadError>
    where
        S: Stream<Item = UploadEvent> + Unpin + Send,
    {
        let mut run = UploadRun::new(self, ctx.clone());
        let mut events = events;

        let status = loop {
            let Some(event) = events.next().await else {
                debug!("Event stream closed without end marker");
                break UploadStatus::Aborted;
            };
            match event {
                UploadEvent::FileBegin {
                    field,
                    file_name,
                    content_type,
                    temp_path,
                } => {
                    debug!(field = %field, file = %file_name, "File part started");
                    run.begin(file_name, content_type, temp_path).await;
                }
                UploadEvent::Field { name, value } => run.field(name, value),
                UploadEvent::FileComplete { temp_path, size } => {
                    run.complete(&temp_path, size).await;
                }
                UploadEvent::Progress { bytes_received } => {
                    if self.policy.exceeds_post_size(bytes_received) {
                        warn!(
                            received = bytes_received,
                            limit = self.policy.max_post_size(),
                            "Request body too large, dropping upload"
                        );
                        run.cut_off().await;
                        return Err(UploadError::PostTooLarge {
                            limit: self.policy.max_post_size(),
                        });
                    }
                }
                UploadEvent::Aborted => break UploadStatus::Aborted,
                UploadEvent::ParseError(msg) => {
                    warn!(error = %msg, "Malformed multipart body");
                    run.cut_off().await;
                    return Err(UploadError::Parse(msg));
                }
                UploadEvent::StreamEnd => break UploadStatus::Completed,
            }
        };

        Ok(run.finish(status).await)
    }
}

enum FileState {
    Receiving {
        reporting: Artifact,
        shadows: Vec<(Arc<dyn Transport>, Artifact)>,
    },
    Storing {
        result: oneshot::Receiver<Artifact>,
        fallback: Artifact,
    },
    Done(Artifact),
    Gone,
}

struct FileSlot {
    temp_path: PathBuf,
    state: FileState,
    /// The run, not a store task, is responsible for removing the temp file.
    owns_temp: bool,
}

impl FileSlot {
    async fn release_temp(&mut self) {
        if self.owns_temp {
            self.owns_temp = false;
            remove_temp(&self.temp_path).await;
        }
    }
}

/// State of one request while its events are consumed.
struct UploadRun<'a> {
    service: &'a UploadService,
    ctx: RequestContext,
    fields: FormFields,
    redirect: Option<String>,
    files: Vec<FileSlot>,
    mirrors: Vec<JoinHandle<()>>,
}

impl<'a> UploadRun<'a> {
    fn new(service: &'a UploadService, ctx: RequestContext) -> Self {
        Self {
            service,
            ctx,
            fields: FormFields::new(),
            redirect: None,
            files: Vec::new(),
            mirrors: Vec::new(),
        }
    }

    async fn begin(&mut self, file_name: String, content_type: Option<String>, temp_path: PathBuf) {
        if self.files.iter().any(|slot| slot.temp_path == temp_path) {
            warn!(path = %temp_path.display(), "Duplicate file begin ignored");
            return;
        }

        let service = self.service;
        let raw = RawUpload::new(file_name, content_type);
        let fields = &self.fields;
        let (reporting, mirrored) = tokio::join!(
            service.reporting.create_artifact(&raw, fields),
            join_all(service.shadows.iter().map(|t| t.create_artifact(&raw, fields)))
        );

        let mut shadows = Vec::with_capacity(mirrored.len());
        for (transport, created) in service.shadows.iter().zip(mirrored) {
            match created {
                Ok(artifact) => shadows.push((Arc::clone(transport), artifact)),
                Err(err) => {
                    warn!(transport = transport.kind(), file = %raw.file_name, error = %err, "Shadow artifact not created");
                }
            }
        }

        let state = match reporting {
            Ok(artifact) => FileState::Receiving {
                reporting: artifact,
                shadows,
            },
            Err(err) => {
                warn!(transport = service.reporting.kind(), file = %raw.file_name, error = %err, "Artifact not created");
                discard_shadows(shadows);
                let mut artifact = Artifact::new(sanitize(&raw.file_name), &raw, false, fields.clone());
                artifact.fail(err.to_string());
                FileState::Done(artifact)
            }
        };

        self.files.push(FileSlot {
            temp_path,
            state,
            owns_temp: true,
        });
    }

    fn field(&mut self, name: String, value: String) {
        if name == REDIRECT_FIELD {
            self.redirect = Some(value.clone());
        }
        self.fields.insert(name, value);
    }

    async fn complete(&mut self, temp_path: &Path, size: u64) {
        let Some(slot) = self.files.iter_mut().find(|slot| slot.temp_path == temp_path) else {
            warn!(path = %temp_path.display(), "Completion for unknown file ignored");
            return;
        };

        match std::mem::replace(&mut slot.state, FileState::Gone) {
            FileState::Receiving {
                mut reporting,
                mut shadows,
            } => {
                reporting.set_size(size);
                for (_, artifact) in &mut shadows {
                    artifact.set_size(size);
                }

                if let Err(rejected) = self.service.policy.validate(reporting.name(), size) {
                    info!(name = %reporting.name(), size, reason = %rejected, "File rejected");
                    reporting.fail(rejected.to_string());
                    self.service.reporting.discard(&reporting);
                    discard_shadows(shadows);
                    slot.release_temp().await;
                    slot.state = FileState::Done(reporting);
                    return;
                }

                let (report, result) = oneshot::channel();
                let fallback = reporting.clone();
                let task = tokio::spawn(store_everywhere(
                    Arc::clone(&self.service.reporting),
                    reporting,
                    shadows,
                    slot.temp_path.clone(),
                    self.ctx.clone(),
                    report,
                ));
                self.mirrors.push(task);
                slot.owns_temp = false;
                slot.state = FileState::Storing { result, fallback };
            }
            FileState::Done(artifact) => {
                slot.release_temp().await;
                slot.state = FileState::Done(artifact);
            }
            other => {
                warn!(path = %temp_path.display(), "Duplicate completion ignored");
                slot.state = other;
            }
        }
    }

    /// Stops the request at once: cancels version work and drops files still receiving.
    async fn cut_off(&mut self) {
        self.ctx.cancel();
        for slot in &mut self.files {
            if let FileState::Receiving { reporting, shadows } =
                std::mem::replace(&mut slot.state, FileState::Gone)
            {
                self.service.reporting.discard(&reporting);
                discard_shadows(shadows);
            }
            slot.release_temp().await;
        }
    }

    async fn finish(self, status: UploadStatus) -> UploadOutcome {
        let Self {
            service,
            ctx,
            redirect,
            files: slots,
            mirrors,
            ..
        } = self;
        if status == UploadStatus::Aborted {
            ctx.cancel();
        }

        let mut files = Vec::with_capacity(slots.len());
        for mut slot in slots {
            match std::mem::replace(&mut slot.state, FileState::Gone) {
                FileState::Receiving {
                    mut reporting,
                    shadows,
                } => {
                    service.reporting.discard(&reporting);
                    discard_shadows(shadows);
                    slot.release_temp().await;
                    if status == UploadStatus::Completed {
                        reporting.fail(INCOMPLETE);
                        files.push(reporting);
                    }
                }
                FileState::Storing {
                    result,
                    mut fallback,
                } => {
                    let artifact = result.await.unwrap_or_else(|_| {
                        fallback.fail(TASK_LOST);
                        fallback
                    });
                    files.push(artifact);
                }
                FileState::Done(artifact) => {
                    slot.release_temp().await;
                    files.push(artifact);
                }
                FileState::Gone => slot.release_temp().await,
            }
        }

        info!(files = files.len(), status = ?status, "Upload finished");
        UploadOutcome {
            files,
            redirect,
            status,
            mirrors: MirrorSet { tasks: mirrors },
        }
    }
}

fn discard_shadows(shadows: Vec<(Arc<dyn Transport>, Artifact)>) {
    for (transport, artifact) in shadows {
        transport.discard(&artifact);
    }
}

/// Stores one file on every transport, reports the reporting artifact as
/// soon as it settled, then removes the temp file.
async fn store_everywhere(
    reporting_transport: Arc<dyn Transport>,
    reporting: Artifact,
    shadows: Vec<(Arc<dyn Transport>, Artifact)>,
    temp_path: PathBuf,
    ctx: RequestContext,
    report: oneshot::Sender<Artifact>,
) {
    let source = temp_path.as_path();
    let ctx = &ctx;

    let primary = async {
        let settled = reporting_transport.store(reporting, source, ctx).await;
        if let Some(err) = &settled.error {
            warn!(transport = reporting_transport.kind(), name = %settled.artifact.name(), error = %err, "Store failed");
        }
        if report.send(settled.artifact).is_err() {
            debug!("Upload request stopped waiting for its result");
        }
    };
    let mirrored = join_all(shadows.into_iter().map(|(transport, artifact)| async move {
        let settled = transport.store(artifact, source, ctx).await;
        match &settled.error {
            Some(err) => {
                warn!(transport = transport.kind(), name = %settled.artifact.name(), error = %err, "Shadow store failed");
            }
            None => debug!(transport = transport.kind(), name = %settled.artifact.name(), "Shadow store finished"),
        }
    }));

    tokio::join!(primary, mirrored);
    remove_temp(source).await;
}

async fn remove_temp(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "Temp file removed"),
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => warn!(path = %path.display(), error = %err, "Failed to remove temp file"),
    }
}
