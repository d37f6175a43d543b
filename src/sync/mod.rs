//! Generating packages and syncing the result into the working directory.
//!
//! [`sync_project`] runs the full pipeline for every package of a
//! [`Project`]: generation, reconciliation against the previous snapshot,
//! snapshot replacement, and post-write commands. [`sync_file`] applies only
//! the generated files matching a set of glob patterns.
//!
//! Both report through [`SyncProjectResult`] and never fail with `Err`, so a
//! CLI can map the result to an exit code and a service can hand out JSON.

pub mod commands;
pub mod ignore;
pub mod reconcile;
pub mod snapshot;

use std::time::Instant;

use camino::{Utf8Path, Utf8PathBuf};
use console::style;
use rayon::ThreadPool;
use serde::Serialize;

use crate::core::CancelFlag;
use crate::engine::runner::{run_task_graph_on, worker_pool};
use crate::engine::{RunOptions, RunOutput, TaskGraph, build_generator_entry};
use crate::error::{KumitateError, SyncError, TaskError};
use crate::generator::GeneratorBundle;
use crate::output::Formatters;
use crate::utils::{as_overhead, error_chain};

use self::commands::{CommandOutcome, run_post_write_commands};
use self::ignore::IgnoreMatcher;
use self::reconcile::{ReconcileOptions, SyncRunResult, reconcile};
use self::snapshot::{SyncSnapshot, patch_snapshot, write_snapshot};

/// A package of the project and the bundle tree that generates it.
#[derive(Debug)]
pub struct PackageEntry {
    pub name: String,
    pub directory: Utf8PathBuf,
    pub bundle: GeneratorBundle,
}

#[derive(Debug, Default)]
pub struct Project {
    packages: Vec<PackageEntry>,
}

impl Project {
    pub fn design() -> ProjectDesigner {
        ProjectDesigner::default()
    }

    pub fn packages(&self) -> &[PackageEntry] {
        &self.packages
    }

    pub fn package(&self, name: &str) -> Option<&PackageEntry> {
        self.packages.iter().find(|package| package.name == name)
    }
}

#[derive(Debug, Default)]
pub struct ProjectDesigner {
    packages: Vec<PackageEntry>,
}

impl ProjectDesigner {
    pub fn package(
        mut self,
        name: impl Into<String>,
        directory: impl Into<Utf8PathBuf>,
        bundle: GeneratorBundle,
    ) -> Self {
        self.packages.push(PackageEntry {
            name: name.into(),
            directory: directory.into(),
            bundle,
        });
        self
    }

    pub fn finish(self) -> Project {
        Project {
            packages: self.packages,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    /// Confirm every conflict and pending delete.
    pub overwrite: bool,
    pub skip_commands: bool,
    /// Only sync these packages, by name.
    pub packages: Option<Vec<String>>,
    /// Bounds running tasks as well as simultaneous file reads and writes.
    pub concurrency: Option<usize>,
    pub formatters: Formatters,
    pub cancel: CancelFlag,
}

impl SyncOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    pub fn skip_commands(mut self, skip_commands: bool) -> Self {
        self.skip_commands = skip_commands;
        self
    }

    pub fn packages<I, S>(mut self, packages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.packages = Some(packages.into_iter().map(Into::into).collect());
        self
    }

    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = Some(concurrency);
        self
    }

    pub fn formatters(mut self, formatters: Formatters) -> Self {
        self.formatters = formatters;
        self
    }

    pub fn cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Success,
    Error,
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageSyncResult {
    pub name: String,
    pub directory: Utf8PathBuf,
    pub status: SyncStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<SyncRunResult>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub commands: Vec<CommandOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PackageSyncResult {
    fn new(package: &PackageEntry, status: SyncStatus) -> Self {
        Self {
            name: package.name.clone(),
            directory: package.directory.clone(),
            status,
            result: None,
            commands: Vec::new(),
            error: None,
        }
    }

    fn failed(package: &PackageEntry, err: &KumitateError) -> Self {
        let status = match err {
            KumitateError::Task(TaskError::Cancelled) => SyncStatus::Cancelled,
            _ => SyncStatus::Error,
        };

        Self {
            error: Some(error_chain(err)),
            ..Self::new(package, status)
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncProjectResult {
    pub status: SyncStatus,
    pub packages: Vec<PackageSyncResult>,
    pub message: String,
}

impl SyncProjectResult {
    fn from_packages(packages: Vec<PackageSyncResult>) -> Self {
        let status = if packages.iter().any(|p| p.status == SyncStatus::Cancelled) {
            SyncStatus::Cancelled
        } else if packages.iter().any(|p| p.status == SyncStatus::Error) {
            SyncStatus::Error
        } else {
            SyncStatus::Success
        };

        let message = summarize(status, &packages);
        Self {
            status,
            packages,
            message,
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            status: SyncStatus::Error,
            packages: Vec::new(),
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == SyncStatus::Success
    }

    /// Process exit code for CLI callers.
    pub fn exit_code(&self) -> i32 {
        match self.status {
            SyncStatus::Success => 0,
            SyncStatus::Error => 1,
            SyncStatus::Cancelled => 130,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

fn summarize(status: SyncStatus, packages: &[PackageSyncResult]) -> String {
    let results = packages.iter().filter_map(|p| p.result.as_ref());
    let (mut written, mut deleted, mut conflicts, mut pending) = (0, 0, 0, 0);
    for result in results {
        written += result.written.len();
        deleted += result.deleted_relative_paths.len();
        conflicts += result.conflicts.len();
        pending += result.relative_paths_pending_delete.len();
    }

    match status {
        SyncStatus::Cancelled => String::from("Sync was cancelled"),
        SyncStatus::Error => {
            let failed: Vec<_> = packages
                .iter()
                .filter(|p| p.status == SyncStatus::Error)
                .map(|p| p.name.as_str())
                .collect();
            format!("Sync failed for {}", failed.join(", "))
        }
        SyncStatus::Success if conflicts + pending > 0 => format!(
            "Synced {} package(s): {written} written, {deleted} deleted, {conflicts} conflict(s) and {pending} pending delete(s) need confirmation with overwrite",
            packages.len()
        ),
        SyncStatus::Success => format!(
            "Synced {} package(s): {written} written, {deleted} deleted",
            packages.len()
        ),
    }
}

/// Runs the generators of one package and returns its virtual file set.
pub fn generate_package(package: &PackageEntry, options: &SyncOptions) -> Result<RunOutput, KumitateError> {
    let pool = worker_pool(options.concurrency)?;
    generate_on(package, options, &pool)
}

fn generate_on(
    package: &PackageEntry,
    options: &SyncOptions,
    pool: &ThreadPool,
) -> Result<RunOutput, KumitateError> {
    let entry = build_generator_entry(&package.bundle)?;
    let graph = TaskGraph::build(&entry)?;

    tracing::debug!(package = %package.name, tasks = graph.len(), "built task graph");

    let run = run_task_graph_on(
        &graph,
        &RunOptions {
            concurrency: options.concurrency,
            formatters: options.formatters.clone(),
            cancel: options.cancel.clone(),
        },
        pool,
    )?;

    Ok(run)
}

fn selected_packages<'a>(
    project: &'a Project,
    options: &SyncOptions,
) -> Result<Vec<&'a PackageEntry>, String> {
    let Some(names) = &options.packages else {
        return Ok(project.packages.iter().collect());
    };

    names
        .iter()
        .map(|name| {
            project
                .package(name)
                .ok_or_else(|| format!("unknown package '{name}'"))
        })
        .collect()
}

struct PreparedPackage {
    output: RunOutput,
    snapshot: SyncSnapshot,
    ignore: IgnoreMatcher,
}

fn prepare_package(
    package: &PackageEntry,
    options: &SyncOptions,
    pool: &ThreadPool,
) -> Result<PreparedPackage, KumitateError> {
    let output = generate_on(package, options, pool)?;
    let snapshot = pool.install(|| SyncSnapshot::load(&package.directory))?;
    let ignore = IgnoreMatcher::load(&package.directory)?;

    Ok(PreparedPackage {
        output,
        snapshot,
        ignore,
    })
}

fn sync_package(package: &PackageEntry, options: &SyncOptions, pool: &ThreadPool) -> PackageSyncResult {
    let s = Instant::now();

    let prepared = match prepare_package(package, options, pool) {
        Ok(prepared) => prepared,
        Err(err) => return PackageSyncResult::failed(package, &err),
    };

    let mut result = PackageSyncResult::new(package, SyncStatus::Success);

    let reconciliation = pool.install(|| {
        let reconciliation = reconcile(
            &package.directory,
            &prepared.snapshot,
            &prepared.output.output,
            &prepared.ignore,
            ReconcileOptions {
                overwrite: options.overwrite,
            },
            &|_| true,
        );

        // A full sync must not record a half-applied state, so the previous
        // snapshot stays in place when any file failed.
        if !reconciliation.result.errors.is_empty() {
            result.status = SyncStatus::Error;
            result.error = Some(format!(
                "{} file(s) could not be synced",
                reconciliation.result.errors.len()
            ));
        } else if let Err(err) = write_snapshot(&package.directory, &reconciliation.snapshot) {
            result.status = SyncStatus::Error;
            result.error = Some(error_chain(&err));
        }

        reconciliation
    });

    if result.status == SyncStatus::Success && !options.skip_commands {
        result.commands = run_post_write_commands(
            &package.directory,
            &prepared.output.output.post_write_commands,
            &reconciliation.result.written,
        );
        if let Some(failed) = result.commands.iter().find(|outcome| !outcome.success) {
            result.status = SyncStatus::Error;
            result.error = Some(format!("command '{}' failed", failed.command));
        }
    }

    result.result = Some(reconciliation.result);

    tracing::info!(
        "Synced package {} {}",
        style(&package.name).cyan(),
        as_overhead(s)
    );

    result
}

/// Generates and syncs every selected package of the project.
pub fn sync_project(project: &Project, options: &SyncOptions) -> SyncProjectResult {
    let packages = match selected_packages(project, options) {
        Ok(packages) => packages,
        Err(message) => return SyncProjectResult::error(message),
    };

    tracing::info!(
        "Running {} for {} package(s)",
        style("sync").blue(),
        packages.len()
    );

    let pool = match worker_pool(options.concurrency) {
        Ok(pool) => pool,
        Err(err) => return SyncProjectResult::error(error_chain(&err)),
    };

    let mut results = Vec::with_capacity(packages.len());
    for package in packages {
        if options.cancel.is_cancelled() {
            results.push(PackageSyncResult::new(package, SyncStatus::Cancelled));
            break;
        }
        results.push(sync_package(package, options, &pool));
    }

    SyncProjectResult::from_packages(results)
}

fn compile_patterns<I, S>(patterns: I) -> Result<Vec<glob::Pattern>, SyncError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    patterns
        .into_iter()
        .map(|pattern| glob::Pattern::new(pattern.as_ref()).map_err(SyncError::from))
        .collect()
}

fn sync_package_files(
    package: &PackageEntry,
    patterns: &[glob::Pattern],
    options: &SyncOptions,
    pool: &ThreadPool,
) -> PackageSyncResult {
    let prepared = match prepare_package(package, options, pool) {
        Ok(prepared) => prepared,
        Err(err) => return PackageSyncResult::failed(package, &err),
    };

    let filter = |path: &str| patterns.iter().any(|pattern| pattern.matches(path));
    let (reconciliation, patched) = pool.install(|| {
        let reconciliation = reconcile(
            &package.directory,
            &prepared.snapshot,
            &prepared.output.output,
            &prepared.ignore,
            ReconcileOptions {
                overwrite: options.overwrite,
            },
            &filter,
        );
        let patched = patch_snapshot(&package.directory, &reconciliation.snapshot);
        (reconciliation, patched)
    });

    let mut result = PackageSyncResult::new(package, SyncStatus::Success);

    if let Err(err) = patched {
        result.status = SyncStatus::Error;
        result.error = Some(error_chain(&err));
    } else if !reconciliation.result.errors.is_empty() {
        result.status = SyncStatus::Error;
        result.error = Some(format!(
            "{} file(s) could not be synced",
            reconciliation.result.errors.len()
        ));
    }

    result.result = Some(reconciliation.result);
    result
}

/// Applies only the generated files matching one of the glob patterns.
///
/// Per-file failures are collected and the remaining files still sync.
/// Post-write commands are not run.
pub fn sync_file<I, S>(project: &Project, patterns: I, options: &SyncOptions) -> SyncProjectResult
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let patterns = match compile_patterns(patterns) {
        Ok(patterns) => patterns,
        Err(err) => return SyncProjectResult::error(error_chain(&err)),
    };

    let packages = match selected_packages(project, options) {
        Ok(packages) => packages,
        Err(message) => return SyncProjectResult::error(message),
    };

    let pool = match worker_pool(options.concurrency) {
        Ok(pool) => pool,
        Err(err) => return SyncProjectResult::error(error_chain(&err)),
    };

    let mut results = Vec::with_capacity(packages.len());
    for package in packages {
        if options.cancel.is_cancelled() {
            results.push(PackageSyncResult::new(package, SyncStatus::Cancelled));
            break;
        }
        results.push(sync_package_files(package, &patterns, options, &pool));
    }

    SyncProjectResult::from_packages(results)
}

/// Removes the sync state of a package, so the next sync starts fresh.
pub fn reset_package_state(package_directory: &Utf8Path) -> Result<(), SyncError> {
    let state = snapshot::state_directory(package_directory);
    match std::fs::remove_dir_all(&state) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(SyncError::Delete {
            path: state,
            source,
        }),
    }
}
