//! In-VM execution agent.
//!
//! The agent is the only component that touches the target machine's file
//! system and process table. [`Agent`] implements the five protocol
//! operations; [`server`] exposes them over TCP.
//!
//! Every request is logged before it is served and every failure reason is
//! logged before it is signaled, so the agent's log is a complete audit
//! trail even when the master never receives the reply.

pub mod enumerate;
pub mod process;
pub mod server;

use std::fs::{File, OpenOptions};
use std::io::{SeekFrom, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::AgentConfig;
use crate::protocol::codec::{max_chunk_bytes, DEFAULT_MAX_LINE_BYTES};
use crate::protocol::{
    Completion, EnumerateResponse, EnumeratedItem, ExecuteRequest, ExecuteResponse,
    ExecuteStreamFrame, FailureKind, FileContents, OperationFailure, Request, WriteFileRequest,
};

/// Suffix of the sibling file a chunked write is staged in.
const STAGING_SUFFIX: &str = ".vm-relay-part";

/// Result of a single agent operation.
pub type OpResult<T> = std::result::Result<T, OperationFailure>;

/// Protocol operation handler bound to the local machine.
#[derive(Debug, Clone)]
pub struct Agent {
    root: PathBuf,
    max_chunk_bytes: usize,
}

impl Agent {
    /// Create an agent resolving relative paths against `root`.
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            max_chunk_bytes: max_chunk_bytes(DEFAULT_MAX_LINE_BYTES),
        }
    }

    /// Size `read_file` replies to fit lines of `max_line_bytes`.
    #[must_use]
    pub fn with_max_line_bytes(mut self, max_line_bytes: usize) -> Self {
        self.max_chunk_bytes = max_chunk_bytes(max_line_bytes);
        self
    }

    /// Create an agent from configuration, falling back to the process
    /// working directory as the root.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if no root is configured and the current
    /// directory cannot be determined.
    pub fn from_config(config: &AgentConfig) -> crate::Result<Self> {
        let root = match config.default_working_directory {
            Some(ref dir) => dir.clone(),
            None => std::env::current_dir().map_err(|err| {
                crate::AppError::Config(format!("cannot determine working directory: {err}"))
            })?,
        };
        Ok(Self::new(root).with_max_line_bytes(config.max_line_bytes))
    }

    /// Directory relative paths resolve against.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Most file bytes a single `read_file` reply carries.
    #[must_use]
    pub fn max_chunk_bytes(&self) -> usize {
        self.max_chunk_bytes
    }

    /// Serve one request, logging it and any failure.
    ///
    /// Output frames of an `execute` request are pushed into `frames`; the
    /// sender is dropped when the operation ends.
    pub async fn handle(
        &self,
        request: Request,
        frames: mpsc::Sender<ExecuteStreamFrame>,
    ) -> OpResult<Completion> {
        let op = request.op_name();
        log_request(&request);

        let outcome = match request {
            Request::Execute(req) => self.execute(&req, frames).await.map(Completion::Execute),
            Request::ReadFile(req) => {
                let limit = self.max_chunk_bytes as u64;
                let length = req.length.map_or(limit, |length| length.min(limit));
                self.read_range(&req.path, req.offset.unwrap_or(0), length)
                    .await
                    .map(Completion::ReadFile)
            }
            Request::WriteFile(req) => self.write_chunk(req).await.map(|()| Completion::WriteFile),
            Request::CreateDirectory(req) => self
                .create_directory(&req.path)
                .await
                .map(|()| Completion::CreateDirectory),
            Request::Enumerate(req) => self
                .enumerate(&req.pattern, req.recursive)
                .await
                .map(|items| Completion::Enumerate(EnumerateResponse { items })),
        };

        match outcome {
            Ok(ref completion) => log_completion(op, completion),
            Err(ref failure) => warn!(
                op,
                kind = ?failure.kind,
                reason = %failure.reason,
                detail = failure.detail.as_deref().unwrap_or(""),
                "operation failed"
            ),
        }

        outcome
    }

    /// Run a process, pushing each output line into `frames`.
    ///
    /// # Errors
    ///
    /// See [`process::run_process`].
    pub async fn execute(
        &self,
        request: &ExecuteRequest,
        frames: mpsc::Sender<ExecuteStreamFrame>,
    ) -> OpResult<ExecuteResponse> {
        let mut request = request.clone();
        if let Some(dir) = request.working_directory.take() {
            request.working_directory = Some(self.resolve(&dir).to_string_lossy().into_owned());
        }
        process::run_process(&request, Some(&self.root), frames).await
    }

    /// Read a whole file.
    ///
    /// # Errors
    ///
    /// Any I/O error, including a missing file, becomes an
    /// [`OperationFailure`] of the matching kind.
    pub async fn read_file(&self, path: &str) -> OpResult<Vec<u8>> {
        let target = self.resolve(path);
        tokio::fs::read(&target).await.map_err(|err| {
            OperationFailure::from_io(format!("cannot read {}", target.display()), &err)
        })
    }

    /// Read at most `length` bytes of `path` starting at `offset`.
    ///
    /// An offset past the end yields no bytes. The reply always carries the
    /// file's total size.
    ///
    /// # Errors
    ///
    /// Same as [`Agent::read_file`].
    pub async fn read_range(&self, path: &str, offset: u64, length: u64) -> OpResult<FileContents> {
        let target = self.resolve(path);
        let fail = |err: std::io::Error| {
            OperationFailure::from_io(format!("cannot read {}", target.display()), &err)
        };

        let mut file = tokio::fs::File::open(&target).await.map_err(fail)?;
        let size = file.metadata().await.map_err(fail)?.len();
        let start = offset.min(size);
        file.seek(SeekFrom::Start(start)).await.map_err(fail)?;

        let wanted = length.min(size - start);
        let mut contents = Vec::with_capacity(usize::try_from(wanted).unwrap_or_default());
        file.take(wanted)
            .read_to_end(&mut contents)
            .await
            .map_err(fail)?;

        Ok(FileContents { contents, size })
    }

    /// Write `contents` to `path`, creating parent directories.
    ///
    /// The file is written to a temporary sibling and renamed into place.
    /// When `overwrite` is false and the target exists, nothing on disk is
    /// touched.
    ///
    /// # Errors
    ///
    /// [`FailureKind::AlreadyExists`] when overwrite is refused; the
    /// matching kind for any other I/O error.
    pub async fn write_file(&self, path: &str, contents: Vec<u8>, overwrite: bool) -> OpResult<()> {
        let target = self.resolve(path);

        if !overwrite && tokio::fs::symlink_metadata(&target).await.is_ok() {
            return Err(refuse_overwrite(&target));
        }

        tokio::task::spawn_blocking(move || write_atomically(&target, &contents, overwrite))
            .await
            .map_err(|err| {
                OperationFailure::new(FailureKind::Io, "write worker failed")
                    .with_detail(err.to_string())
            })?
    }

    /// Apply one `write_file` chunk.
    ///
    /// A whole-file request goes through [`Agent::write_file`]. Otherwise the
    /// chunk at offset `0` starts a staging file beside the target, later
    /// chunks append to it, and the `last` chunk renames it into place. A
    /// chunk whose offset differs from the staged length is rejected.
    ///
    /// # Errors
    ///
    /// [`FailureKind::InvalidRequest`] for an out-of-order chunk; otherwise
    /// as [`Agent::write_file`].
    pub async fn write_chunk(&self, request: WriteFileRequest) -> OpResult<()> {
        let WriteFileRequest {
            path,
            contents,
            overwrite,
            offset,
            last,
        } = request;

        if offset == 0 && last {
            return self.write_file(&path, contents, overwrite).await;
        }

        let target = self.resolve(&path);
        if offset == 0 && !overwrite && tokio::fs::symlink_metadata(&target).await.is_ok() {
            return Err(refuse_overwrite(&target));
        }

        tokio::task::spawn_blocking(move || {
            stage_chunk(&target, &contents, offset, last, overwrite)
        })
        .await
        .map_err(|err| {
            OperationFailure::new(FailureKind::Io, "write worker failed")
                .with_detail(err.to_string())
        })?
    }

    /// Create `path` and any missing parents; succeeds if it already exists.
    ///
    /// # Errors
    ///
    /// Fails when the path exists as a file or cannot be created.
    pub async fn create_directory(&self, path: &str) -> OpResult<()> {
        let target = self.resolve(path);
        tokio::fs::create_dir_all(&target).await.map_err(|err| {
            OperationFailure::from_io(
                format!("cannot create directory {}", target.display()),
                &err,
            )
        })
    }

    /// List entries matching `pattern`.
    ///
    /// # Errors
    ///
    /// See [`enumerate::enumerate`].
    pub async fn enumerate(&self, pattern: &str, recursive: bool) -> OpResult<Vec<EnumeratedItem>> {
        let root = self.root.clone();
        let pattern = pattern.to_owned();
        tokio::task::spawn_blocking(move || enumerate::enumerate(&root, &pattern, recursive))
            .await
            .map_err(|err| {
                OperationFailure::new(FailureKind::Io, "enumerate worker failed")
                    .with_detail(err.to_string())
            })?
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let candidate = Path::new(path);
        if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.root.join(candidate)
        }
    }
}

fn refuse_overwrite(target: &Path) -> OperationFailure {
    OperationFailure::new(
        FailureKind::AlreadyExists,
        format!(
            "{} already exists and overwrite is not allowed",
            target.display()
        ),
    )
}

/// Parent directory of `target`, created if missing.
fn prepare_parent(target: &Path) -> OpResult<&Path> {
    let parent = match target.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    std::fs::create_dir_all(parent).map_err(|err| {
        OperationFailure::from_io(
            format!("cannot create parent directories for {}", target.display()),
            &err,
        )
    })?;
    Ok(parent)
}

fn staging_path(target: &Path) -> OpResult<PathBuf> {
    let Some(name) = target.file_name() else {
        return Err(OperationFailure::new(
            FailureKind::InvalidRequest,
            format!("{} does not name a file", target.display()),
        ));
    };
    let mut staged = std::ffi::OsString::from(".");
    staged.push(name);
    staged.push(STAGING_SUFFIX);
    Ok(target.with_file_name(staged))
}

fn stage_chunk(
    target: &Path,
    contents: &[u8],
    offset: u64,
    last: bool,
    overwrite: bool,
) -> OpResult<()> {
    let staging = staging_path(target)?;
    let write_failed = |err: std::io::Error| {
        OperationFailure::from_io(format!("cannot write {}", target.display()), &err)
    };

    let mut file = if offset == 0 {
        prepare_parent(target)?;
        File::create(&staging).map_err(write_failed)?
    } else {
        let file = OpenOptions::new().append(true).open(&staging).map_err(|err| {
            OperationFailure::new(
                FailureKind::InvalidRequest,
                format!("no chunked write of {} in progress", target.display()),
            )
            .with_detail(err.to_string())
        })?;
        let staged = file.metadata().map_err(write_failed)?.len();
        if staged != offset {
            return Err(OperationFailure::new(
                FailureKind::InvalidRequest,
                format!(
                    "chunk for {} starts at byte {offset} but {staged} bytes are staged",
                    target.display()
                ),
            ));
        }
        file
    };

    file.write_all(contents)
        .and_then(|()| file.flush())
        .map_err(write_failed)?;
    drop(file);
    debug!(
        path = %target.display(),
        offset,
        bytes = contents.len(),
        last,
        "chunk staged"
    );

    if !last {
        return Ok(());
    }

    let persisted = if overwrite {
        std::fs::rename(&staging, target)
    } else {
        std::fs::hard_link(&staging, target).and_then(|()| std::fs::remove_file(&staging))
    };
    persisted.map_err(|err| {
        if let Err(cleanup) = std::fs::remove_file(&staging) {
            debug!(%cleanup, "staging file not removed");
        }
        write_failed(err)
    })
}

fn write_atomically(target: &Path, contents: &[u8], overwrite: bool) -> OpResult<()> {
    let parent = prepare_parent(target)?;

    let mut tmp = NamedTempFile::new_in(parent).map_err(|err| {
        OperationFailure::from_io(
            format!("cannot create temporary file in {}", parent.display()),
            &err,
        )
    })?;

    tmp.write_all(contents)
        .and_then(|()| tmp.flush())
        .map_err(|err| {
            OperationFailure::from_io(format!("cannot write {}", target.display()), &err)
        })?;

    let persisted = if overwrite {
        tmp.persist(target)
    } else {
        tmp.persist_noclobber(target)
    };

    persisted.map(|_| ()).map_err(|err| {
        OperationFailure::from_io(format!("cannot write {}", target.display()), &err.error)
    })
}

fn log_request(request: &Request) {
    match request {
        Request::Execute(req) => info!(
            op = "execute",
            executable = %req.executable,
            arguments = ?req.arguments,
            working_directory = req.working_directory.as_deref().unwrap_or(""),
            environment_vars = req.environment.as_ref().map_or(0, std::collections::HashMap::len),
            timeout_seconds = ?req.timeout_seconds,
            "request received"
        ),
        Request::ReadFile(req) => info!(
            op = "read_file",
            path = %req.path,
            offset = ?req.offset,
            length = ?req.length,
            "request received"
        ),
        Request::WriteFile(req) => info!(
            op = "write_file",
            path = %req.path,
            bytes = req.contents.len(),
            overwrite = req.overwrite,
            offset = req.offset,
            last = req.last,
            "request received"
        ),
        Request::CreateDirectory(req) => {
            info!(op = "create_directory", path = %req.path, "request received");
        }
        Request::Enumerate(req) => info!(
            op = "enumerate",
            pattern = %req.pattern,
            recursive = req.recursive,
            "request received"
        ),
    }
}

fn log_completion(op: &str, completion: &Completion) {
    match completion {
        Completion::Execute(resp) => info!(op, exit_code = resp.exit_code, "operation completed"),
        Completion::ReadFile(contents) => {
            info!(
                op,
                bytes = contents.contents.len(),
                size = contents.size,
                "operation completed"
            );
        }
        Completion::Enumerate(resp) => info!(op, items = resp.items.len(), "operation completed"),
        Completion::WriteFile | Completion::CreateDirectory => info!(op, "operation completed"),
    }
}
