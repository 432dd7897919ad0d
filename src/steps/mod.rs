//! Built-in steps that act on the active VM session.
//!
//! Each step looks the session up in the registry when it runs, so it can
//! be constructed anywhere and only needs to execute inside an orchestrated
//! run. Outside one it errors with the registry's no-active-session message
//! and never falls back to local execution.

use std::future::Future;
use std::path::{Component, Path, PathBuf};
use std::pin::Pin;

use tracing::{info, warn};

use crate::orchestrator::{ResultScope, Step};
use crate::protocol::ItemKind;
use crate::proxy::{OutputSink, ProcessRunner, ProcessSpec};
use crate::session::registry;
use crate::{AppError, Result};

/// Join a remote directory and a `/`-separated relative path.
#[must_use]
pub fn remote_join(dir: &str, relative: &str) -> String {
    let relative = relative.trim_start_matches(['/', '\\']);
    if dir.is_empty() {
        relative.to_owned()
    } else if dir.ends_with(['/', '\\']) {
        format!("{dir}{relative}")
    } else {
        format!("{dir}/{relative}")
    }
}

/// Run a step body, turning an error into an errored scope.
fn finish(step: &str, scope: &mut ResultScope, outcome: Result<()>) {
    if let Err(err) = outcome {
        warn!(step, %err, "step errored");
        scope.error(err.to_string());
    }
}

/// Sink logging each line and keeping it in the step's scope.
struct ScopeSink<'a> {
    step: &'a str,
    scope: &'a mut ResultScope,
}

impl OutputSink for ScopeSink<'_> {
    fn stdout_line(&mut self, line: &str) {
        info!(step = self.step, stream = "stdout", "{line}");
        self.scope.log(line);
    }

    fn stderr_line(&mut self, line: &str) {
        info!(step = self.step, stream = "stderr", "{line}");
        self.scope.log(line);
    }
}

/// Runs a process inside the VM.
#[derive(Debug, Clone)]
pub struct RemoteExecStep {
    name: String,
    spec: ProcessSpec,
}

impl RemoteExecStep {
    /// Step running `spec`; an unset working directory defaults to the
    /// session's.
    pub fn new(name: impl Into<String>, spec: ProcessSpec) -> Self {
        Self {
            name: name.into(),
            spec,
        }
    }

    async fn execute(&self, scope: &mut ResultScope) -> Result<()> {
        let session = registry::current()?;
        let runner = session.controller().remote_runner().await?;

        let mut spec = self.spec.clone();
        if spec.working_directory.is_none() {
            spec.working_directory = session.working_directory().map(str::to_owned);
        }

        let result = {
            let mut sink = ScopeSink {
                step: &self.name,
                scope: &mut *scope,
            };
            runner.run(&spec, &mut sink).await?
        };

        if let Some(code) = result.exit_code {
            scope.set_property(format!("{}.exit_code", self.name), code.to_string());
        }

        if result.timed_out {
            scope.fail(format!("`{}` timed out", spec.executable));
        } else if result.failed {
            scope.fail(format!(
                "`{}` exited with code {}",
                spec.executable,
                result.exit_code.unwrap_or(-1)
            ));
        }
        Ok(())
    }
}

impl Step for RemoteExecStep {
    fn name(&self) -> &str {
        &self.name
    }

    fn run<'a>(&'a self, scope: &'a mut ResultScope) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            let outcome = self.execute(scope).await;
            finish(&self.name, scope, outcome);
        })
    }
}

/// Copies local files into a VM directory.
#[derive(Debug, Clone)]
pub struct CopyToVmStep {
    name: String,
    source: String,
    destination: String,
    overwrite: bool,
}

impl CopyToVmStep {
    /// Copy `source` (a file or a glob of files) into the VM directory
    /// `destination`, replacing existing files.
    ///
    /// Matched files keep their path relative to the glob's literal base
    /// directory, so `src/**/*.dll` copies `src/a/x.dll` to
    /// `destination/a/x.dll`.
    pub fn new(
        name: impl Into<String>,
        source: impl Into<String>,
        destination: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
            destination: destination.into(),
            overwrite: true,
        }
    }

    /// Refuse to replace files that already exist in the VM.
    #[must_use]
    pub fn keep_existing(mut self) -> Self {
        self.overwrite = false;
        self
    }

    async fn execute(&self, scope: &mut ResultScope) -> Result<()> {
        let session = registry::current()?;
        let client = session.controller().agent().await?;

        let files = local_matches(self.source.clone()).await?;
        if files.is_empty() {
            scope.fail(format!("no local files match `{}`", self.source));
            return Ok(());
        }

        client.create_directory(&self.destination).await?;
        for (file, relative) in files {
            let contents = tokio::fs::read(&file).await.map_err(|err| {
                AppError::Io(format!("cannot read {}: {err}", file.display()))
            })?;
            let target = remote_join(&self.destination, &relative);
            info!(step = %self.name, from = %file.display(), to = %target, bytes = contents.len(), "copying to vm");
            client.write_file(&target, contents, self.overwrite).await?;
            scope.log(format!("copied {} to {target}", file.display()));
        }
        Ok(())
    }
}

impl Step for CopyToVmStep {
    fn name(&self) -> &str {
        &self.name
    }

    fn run<'a>(&'a self, scope: &'a mut ResultScope) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            let outcome = self.execute(scope).await;
            finish(&self.name, scope, outcome);
        })
    }
}

fn is_glob(text: &str) -> bool {
    text.contains(['*', '?', '['])
}

/// Directory the matches of `source` are made relative to: the parent of a
/// plain file, or the components before the first wildcard of a glob.
fn glob_base(source: &str) -> PathBuf {
    let path = Path::new(source);
    if !is_glob(source) {
        return path.parent().map(Path::to_path_buf).unwrap_or_default();
    }
    path.components()
        .take_while(|component| !is_glob(&component.as_os_str().to_string_lossy()))
        .collect()
}

/// `path` relative to `base`, `/`-separated.
fn relative_to(path: &Path, base: &Path) -> String {
    let relative = path.strip_prefix(base).unwrap_or(path);
    let parts: Vec<_> = relative
        .components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part.to_string_lossy()),
            _ => None,
        })
        .collect();
    if parts.is_empty() {
        return path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
    }
    parts.join("/")
}

/// Regular files named by `source`, which may be a glob, each paired with
/// its path relative to the glob's base.
async fn local_matches(source: String) -> Result<Vec<(PathBuf, String)>> {
    tokio::task::spawn_blocking(move || {
        let base = glob_base(&source);
        if !is_glob(&source) {
            let path = PathBuf::from(&source);
            if !path.is_file() {
                return Ok(Vec::new());
            }
            let relative = relative_to(&path, &base);
            return Ok(vec![(path, relative)]);
        }

        let paths = glob::glob(&source)
            .map_err(|err| AppError::Step(format!("invalid glob `{source}`: {err}")))?;
        Ok(paths
            .filter_map(|entry| match entry {
                Ok(path) => Some(path),
                Err(err) => {
                    warn!(path = %err.path().display(), error = %err.error(), "skipping unreadable entry");
                    None
                }
            })
            .filter(|path| path.is_file())
            .map(|path| {
                let relative = relative_to(&path, &base);
                (path, relative)
            })
            .collect())
    })
    .await
    .map_err(|err| AppError::Step(format!("local glob worker failed: {err}")))?
}

/// Copies files matched by a VM glob into a local directory.
#[derive(Debug, Clone)]
pub struct CopyFromVmStep {
    name: String,
    pattern: String,
    recursive: bool,
    destination: Option<PathBuf>,
    require_match: bool,
}

impl CopyFromVmStep {
    /// Copy files matching `pattern` into the session's artifact directory,
    /// preserving their paths relative to the pattern's base.
    pub fn new(name: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pattern: pattern.into(),
            recursive: false,
            destination: None,
            require_match: false,
        }
    }

    /// Also match below subdirectories of the base.
    #[must_use]
    pub fn recursive(mut self) -> Self {
        self.recursive = true;
        self
    }

    /// Copy into `dir` instead of the artifact directory.
    #[must_use]
    pub fn into_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.destination = Some(dir.into());
        self
    }

    /// Fail when nothing matches.
    #[must_use]
    pub fn require_match(mut self) -> Self {
        self.require_match = true;
        self
    }

    async fn execute(&self, scope: &mut ResultScope) -> Result<()> {
        let session = registry::current()?;
        let destination = self
            .destination
            .as_deref()
            .or_else(|| session.artifact_directory())
            .map(Path::to_path_buf)
            .ok_or_else(|| {
                AppError::Config(format!(
                    "step `{}` has no destination and the session has no artifact directory",
                    self.name
                ))
            })?;
        let client = session.controller().agent().await?;

        let items = client.enumerate(&self.pattern, self.recursive).await?;
        let mut copied = 0_usize;
        for item in items.iter().filter(|item| item.kind == ItemKind::File) {
            let target = item
                .relative_path
                .split('/')
                .filter(|part| !part.is_empty())
                .fold(destination.clone(), |acc, part| acc.join(part));
            let contents = client.read_file(&item.absolute_path).await?;

            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await.map_err(|err| {
                    AppError::Io(format!("cannot create {}: {err}", parent.display()))
                })?;
            }
            tokio::fs::write(&target, &contents).await.map_err(|err| {
                AppError::Io(format!("cannot write {}: {err}", target.display()))
            })?;

            info!(step = %self.name, from = %item.absolute_path, to = %target.display(), bytes = contents.len(), "copied from vm");
            scope.add_artifact(target);
            copied += 1;
        }

        if copied == 0 && self.require_match {
            scope.fail(format!("no files in the vm match `{}`", self.pattern));
        } else {
            scope.log(format!("copied {copied} file(s) matching `{}`", self.pattern));
        }
        Ok(())
    }
}

impl Step for CopyFromVmStep {
    fn name(&self) -> &str {
        &self.name
    }

    fn run<'a>(&'a self, scope: &'a mut ResultScope) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            let outcome = self.execute(scope).await;
            finish(&self.name, scope, outcome);
        })
    }
}

/// Creates a directory inside the VM.
#[derive(Debug, Clone)]
pub struct MakeDirectoryStep {
    name: String,
    path: String,
}

impl MakeDirectoryStep {
    /// Create `path` (and parents) in the VM.
    pub fn new(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
        }
    }

    async fn execute(&self, scope: &mut ResultScope) -> Result<()> {
        let session = registry::current()?;
        let client = session.controller().agent().await?;
        client.create_directory(&self.path).await?;
        scope.log(format!("created {}", self.path));
        Ok(())
    }
}

impl Step for MakeDirectoryStep {
    fn name(&self) -> &str {
        &self.name
    }

    fn run<'a>(&'a self, scope: &'a mut ResultScope) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            let outcome = self.execute(scope).await;
            finish(&self.name, scope, outcome);
        })
    }
}
