//! Three-way reconciliation of generated output with the working directory.
//!
//! Every path is judged from three views: the previously generated contents
//! (the snapshot), the current working copy, and the newly generated
//! contents. User edits are never overwritten or deleted without
//! `overwrite`; they are reported as conflicts or pending deletes instead.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::ErrorKind;

use camino::Utf8Path;
use rayon::iter::{IntoParallelRefIterator, ParallelIterator};
use serde::Serialize;

use crate::core::Hash32;
use crate::error::SyncError;
use crate::output::{FileData, GeneratorOutput, OverwritePolicy};
use crate::sync::ignore::IgnoreMatcher;
use crate::sync::snapshot::{GeneratedFileRecord, SnapshotUpdate, SyncSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictKind {
    /// The user edited a generated file and the generator changed it too.
    ModifiedByUser,
    /// The user created a file at a path the generator now wants.
    AddedByUser,
    /// The user deleted a generated file the generator changed.
    DeletedByUser,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
    pub path: String,
    pub kind: ConflictKind,
    pub generator: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileError {
    pub path: String,
    pub message: String,
}

/// Outcome of reconciling one package.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRunResult {
    pub written: Vec<String>,
    pub unchanged: Vec<String>,
    pub deleted_relative_paths: Vec<String>,
    pub relative_paths_pending_delete: Vec<String>,
    pub conflicts: Vec<Conflict>,
    pub errors: Vec<FileError>,
}

impl SyncRunResult {
    pub fn has_conflicts(&self) -> bool {
        !self.conflicts.is_empty() || !self.relative_paths_pending_delete.is_empty()
    }
}

/// What reconciliation decided to do with a single path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileAction {
    Write,
    Unchanged,
    /// The working copy already differs from the old output, and the new
    /// output is the same as the old one.
    KeepUserEdit,
    /// The user removed a file whose generated contents did not change.
    KeepUserDeletion,
    Conflict(ConflictKind),
    Delete,
    PendingDelete,
    /// Generated before, removed by the user, not generated anymore.
    Forget,
}

#[derive(Debug, Clone, Copy)]
pub struct NewFile {
    pub hash: Hash32,
    pub policy: OverwritePolicy,
}

/// Decides the fate of a path from the hashes of its three views.
///
/// `overwrite` confirms every conflict and pending delete.
pub fn plan_file(
    previous: Option<Hash32>,
    working: Option<Hash32>,
    new: Option<NewFile>,
    overwrite: bool,
) -> FileAction {
    let Some(new) = new else {
        return match (previous, working) {
            (_, None) => FileAction::Forget,
            (Some(previous), Some(working)) if previous == working => FileAction::Delete,
            (None, Some(_)) => FileAction::Forget,
            (Some(_), Some(_)) if overwrite => FileAction::Delete,
            (Some(_), Some(_)) => FileAction::PendingDelete,
        };
    };

    if new.policy == OverwritePolicy::Never {
        return match (previous, working) {
            (None, None) => FileAction::Write,
            (Some(_), None) => FileAction::KeepUserDeletion,
            (_, Some(_)) => FileAction::Unchanged,
        };
    }

    let resolve = |kind| {
        if overwrite || new.policy == OverwritePolicy::Always {
            FileAction::Write
        } else {
            FileAction::Conflict(kind)
        }
    };

    match (previous, working) {
        (None, None) => FileAction::Write,
        (None, Some(working)) if working == new.hash => FileAction::Unchanged,
        (None, Some(_)) => resolve(ConflictKind::AddedByUser),
        (Some(previous), None) if previous == new.hash => FileAction::KeepUserDeletion,
        (Some(_), None) => resolve(ConflictKind::DeletedByUser),
        (Some(previous), Some(working)) if previous == working => {
            if working == new.hash {
                FileAction::Unchanged
            } else {
                FileAction::Write
            }
        }
        (Some(_), Some(working)) if working == new.hash => FileAction::Unchanged,
        (Some(previous), Some(_)) if previous == new.hash => FileAction::KeepUserEdit,
        (Some(_), Some(_)) => resolve(ConflictKind::ModifiedByUser),
    }
}

enum WorkingFile {
    Missing,
    Present(Hash32),
    Unreadable(std::io::Error),
}

fn read_working(package_directory: &Utf8Path, relative: &str) -> WorkingFile {
    match fs::read(package_directory.join(relative)) {
        Ok(bytes) => WorkingFile::Present(Hash32::hash(bytes)),
        Err(err) if err.kind() == ErrorKind::NotFound => WorkingFile::Missing,
        Err(err) => WorkingFile::Unreadable(err),
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReconcileOptions {
    pub overwrite: bool,
}

/// Reconciliation result plus the snapshot to persist afterwards.
#[derive(Debug, Default)]
pub struct Reconciliation {
    pub result: SyncRunResult,
    pub snapshot: SnapshotUpdate,
}

/// Reconciles `output` with the working copy of a package.
///
/// Only paths accepted by `filter` are considered; every other path keeps
/// its previous snapshot entry. All files are read before anything is
/// written, and a failure on one file never stops the others.
pub fn reconcile(
    package_directory: &Utf8Path,
    snapshot: &SyncSnapshot,
    output: &GeneratorOutput,
    ignore: &IgnoreMatcher,
    options: ReconcileOptions,
    filter: &(dyn Fn(&str) -> bool + Sync),
) -> Reconciliation {
    let mut next = SnapshotUpdate {
        records: snapshot.manifest.files.clone(),
        contents: snapshot.contents.clone(),
        touched: BTreeSet::new(),
    };

    let paths: Vec<&str> = snapshot
        .paths()
        .chain(output.files.keys().map(String::as_str))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .filter(|&path| filter(path))
        .collect();

    // Ignored paths drop out of the manifest entirely.
    for path in &paths {
        if ignore.is_ignored(path) {
            tracing::debug!(path, "ignored");
            if next.records.remove(*path).is_some() {
                next.contents.remove(*path);
                next.touched.insert(path.to_string());
            }
        }
    }

    let paths: Vec<&str> = paths
        .into_iter()
        .filter(|&path| !ignore.is_ignored(path))
        .collect();

    let working: BTreeMap<&str, WorkingFile> = paths
        .par_iter()
        .map(|path| (*path, read_working(package_directory, path)))
        .collect();

    let mut result = SyncRunResult::default();
    let mut writes: Vec<(&str, &FileData)> = Vec::new();
    let mut deletes: Vec<&str> = Vec::new();

    for (path, working) in working {
        let working = match working {
            WorkingFile::Missing => None,
            WorkingFile::Present(hash) => Some(hash),
            WorkingFile::Unreadable(err) => {
                result.errors.push(FileError {
                    path: path.to_string(),
                    message: err.to_string(),
                });
                continue;
            }
        };

        let file = output.files.get(path);
        let new = file.map(|file| NewFile {
            hash: Hash32::hash(&file.contents),
            policy: file.options.overwrite_policy,
        });

        let action = plan_file(snapshot.previous_hash(path), working, new, options.overwrite);
        tracing::debug!(path, ?action, "planned");

        match (action, file) {
            (FileAction::Write, Some(file)) => writes.push((path, file)),
            (FileAction::Unchanged | FileAction::KeepUserEdit | FileAction::KeepUserDeletion, Some(file)) => {
                result.unchanged.push(path.to_string());
                set_entry(&mut next, path, file);
            }
            (FileAction::Conflict(kind), Some(file)) => {
                tracing::warn!(path, ?kind, "conflict, keeping working copy");
                result.conflicts.push(Conflict {
                    path: path.to_string(),
                    kind,
                    generator: file.generator.clone(),
                });
            }
            (FileAction::Delete, _) => deletes.push(path),
            (FileAction::PendingDelete, _) => {
                tracing::warn!(path, "modified by user, pending delete");
                result.relative_paths_pending_delete.push(path.to_string());
            }
            (FileAction::Forget, _) => remove_entry(&mut next, path),
            (_, None) => remove_entry(&mut next, path),
        }
    }

    let written: Vec<_> = writes
        .par_iter()
        .map(|(path, file)| (*path, *file, write_working(package_directory, path, file)))
        .collect();

    for (path, file, outcome) in written {
        match outcome {
            Ok(()) => {
                result.written.push(path.to_string());
                set_entry(&mut next, path, file);
            }
            Err(err) => result.errors.push(file_error(path, &err)),
        }
    }

    for path in deletes {
        match delete_working(package_directory, path) {
            Ok(()) => {
                result.deleted_relative_paths.push(path.to_string());
                remove_entry(&mut next, path);
            }
            Err(err) => result.errors.push(file_error(path, &err)),
        }
    }

    tracing::info!(
        package = %package_directory,
        written = result.written.len(),
        unchanged = result.unchanged.len(),
        deleted = result.deleted_relative_paths.len(),
        conflicts = result.conflicts.len(),
        pending_delete = result.relative_paths_pending_delete.len(),
        "reconciled package"
    );

    Reconciliation {
        result,
        snapshot: next,
    }
}

fn set_entry(next: &mut SnapshotUpdate, path: &str, file: &FileData) {
    next.records
        .insert(path.to_string(), GeneratedFileRecord::from_file(file));
    next.contents
        .insert(path.to_string(), file.contents.as_ref().to_vec());
    next.touched.insert(path.to_string());
}

fn remove_entry(next: &mut SnapshotUpdate, path: &str) {
    next.records.remove(path);
    next.contents.remove(path);
    next.touched.insert(path.to_string());
}

fn file_error(path: &str, err: &SyncError) -> FileError {
    FileError {
        path: path.to_string(),
        message: crate::utils::error_chain(err),
    }
}

fn write_working(package_directory: &Utf8Path, relative: &str, file: &FileData) -> Result<(), SyncError> {
    let path = package_directory.join(relative);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| SyncError::Write {
            path: parent.to_owned(),
            source,
        })?;
    }

    fs::write(&path, &file.contents).map_err(|source| SyncError::Write { path, source })
}

/// Deletes a file, then prunes directories the delete left empty.
fn delete_working(package_directory: &Utf8Path, relative: &str) -> Result<(), SyncError> {
    let path = package_directory.join(relative);
    fs::remove_file(&path).map_err(|source| SyncError::Delete {
        path: path.clone(),
        source,
    })?;

    let mut parent = path.parent();
    while let Some(dir) = parent {
        if dir == package_directory || !dir.starts_with(package_directory) {
            break;
        }
        // Fails on non-empty directories, which ends the pruning.
        if fs::remove_dir(dir).is_err() {
            break;
        }
        parent = dir.parent();
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use camino::Utf8PathBuf;

    use super::*;
    use crate::output::{FileContents, WriteFileOptions};
    use crate::sync::snapshot::write_snapshot;

    struct Fixture {
        _dir: tempfile::TempDir,
        root: Utf8PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
            Self { _dir: dir, root }
        }

        fn previous(&self, files: &[(&str, &str)]) -> SyncSnapshot {
            let output = output(files);
            let mut update = SnapshotUpdate::default();
            for (path, file) in &output.files {
                set_entry(&mut update, path, file);
            }
            write_snapshot(&self.root, &update).unwrap();
            SyncSnapshot::load(&self.root).unwrap()
        }

        fn working(&self, files: &[(&str, &str)]) {
            for (path, text) in files {
                let path = self.root.join(path);
                fs::create_dir_all(path.parent().unwrap()).unwrap();
                fs::write(path, text).unwrap();
            }
        }

        fn read(&self, path: &str) -> Option<String> {
            fs::read_to_string(self.root.join(path)).ok()
        }

        fn reconcile(&self, snapshot: &SyncSnapshot, new: &GeneratorOutput, overwrite: bool) -> Reconciliation {
            reconcile(
                &self.root,
                snapshot,
                new,
                &IgnoreMatcher::defaults().unwrap(),
                ReconcileOptions { overwrite },
                &|_| true,
            )
        }
    }

    fn file(path: &str, text: &str, options: WriteFileOptions) -> FileData {
        FileData {
            id: format!("node:{path}"),
            generator: "node".into(),
            contents: FileContents::from(text),
            options,
            template_metadata: None,
        }
    }

    fn output(files: &[(&str, &str)]) -> GeneratorOutput {
        let mut output = GeneratorOutput::new();
        for (path, text) in files {
            output
                .files
                .insert(path.to_string(), file(path, text, WriteFileOptions::default()));
        }
        output
    }

    #[test]
    fn test_clean_delete() {
        let fx = Fixture::new();
        let snapshot = fx.previous(&[("src/a.ts", "X")]);
        fx.working(&[("src/a.ts", "X")]);

        let run = fx.reconcile(&snapshot, &output(&[]), false);
        assert_eq!(run.result.deleted_relative_paths, ["src/a.ts"]);
        assert_eq!(fx.read("src/a.ts"), None);
        assert!(!fx.root.join("src").exists());
        assert!(run.snapshot.records.is_empty());
    }

    #[test]
    fn test_user_edit_blocks_delete() {
        let fx = Fixture::new();
        let snapshot = fx.previous(&[("a.ts", "X")]);
        fx.working(&[("a.ts", "Y")]);

        let run = fx.reconcile(&snapshot, &output(&[]), false);
        assert!(run.result.deleted_relative_paths.is_empty());
        assert_eq!(run.result.relative_paths_pending_delete, ["a.ts"]);
        assert_eq!(fx.read("a.ts").as_deref(), Some("Y"));
        assert!(run.snapshot.records.contains_key("a.ts"));

        let run = fx.reconcile(&snapshot, &output(&[]), true);
        assert_eq!(run.result.deleted_relative_paths, ["a.ts"]);
        assert_eq!(fx.read("a.ts"), None);
    }

    #[test]
    fn test_new_file_is_written() {
        let fx = Fixture::new();
        let run = fx.reconcile(&SyncSnapshot::empty(), &output(&[("src/b.ts", "Z")]), false);

        assert_eq!(run.result.written, ["src/b.ts"]);
        assert_eq!(fx.read("src/b.ts").as_deref(), Some("Z"));
        assert_eq!(run.snapshot.contents["src/b.ts"], b"Z");
    }

    #[test]
    fn test_unchanged_file_is_not_written() {
        let fx = Fixture::new();
        let snapshot = fx.previous(&[("c.ts", "X")]);
        fx.working(&[("c.ts", "X")]);

        let run = fx.reconcile(&snapshot, &output(&[("c.ts", "X")]), false);
        assert!(run.result.written.is_empty());
        assert_eq!(run.result.unchanged, ["c.ts"]);
    }

    #[test]
    fn test_modified_file_conflicts() {
        let fx = Fixture::new();
        let snapshot = fx.previous(&[("a.ts", "X")]);
        fx.working(&[("a.ts", "user")]);

        let run = fx.reconcile(&snapshot, &output(&[("a.ts", "generated")]), false);
        assert_eq!(
            run.result.conflicts,
            [Conflict {
                path: "a.ts".into(),
                kind: ConflictKind::ModifiedByUser,
                generator: "node".into(),
            }]
        );
        assert_eq!(fx.read("a.ts").as_deref(), Some("user"));
        // The previous record stays so the conflict is reported again next time.
        assert_eq!(run.snapshot.contents["a.ts"], b"X");

        let run = fx.reconcile(&snapshot, &output(&[("a.ts", "generated")]), true);
        assert_eq!(run.result.written, ["a.ts"]);
        assert_eq!(fx.read("a.ts").as_deref(), Some("generated"));
    }

    #[test]
    fn test_update_and_ignored_paths() {
        let fx = Fixture::new();
        let snapshot = fx.previous(&[("a.ts", "v1")]);
        fx.working(&[("a.ts", "v1")]);

        let new = output(&[("a.ts", "v2"), (".env", "SECRET=1"), ("dist/out.js", "x")]);
        let run = fx.reconcile(&snapshot, &new, false);

        assert_eq!(run.result.written, ["a.ts"]);
        assert_eq!(fx.read(".env"), None);
        assert_eq!(fx.read("dist/out.js"), None);
        assert_eq!(run.snapshot.records.keys().collect::<Vec<_>>(), ["a.ts"]);
    }

    #[test]
    fn test_filter_limits_paths() {
        let fx = Fixture::new();
        let new = output(&[("src/a.ts", "a"), ("src/b.ts", "b")]);

        let run = reconcile(
            &fx.root,
            &SyncSnapshot::empty(),
            &new,
            &IgnoreMatcher::defaults().unwrap(),
            ReconcileOptions::default(),
            &|path| path.ends_with("a.ts"),
        );

        assert_eq!(run.result.written, ["src/a.ts"]);
        assert_eq!(fx.read("src/b.ts"), None);
        assert_eq!(run.snapshot.touched.iter().collect::<Vec<_>>(), ["src/a.ts"]);
    }

    #[test]
    fn test_plan_user_states() {
        let x = Hash32::hash("X");
        let y = Hash32::hash("Y");
        let z = Hash32::hash("Z");
        let new = |hash| {
            Some(NewFile {
                hash,
                policy: OverwritePolicy::IfUnmodified,
            })
        };

        assert_eq!(plan_file(Some(x), Some(y), new(x), false), FileAction::KeepUserEdit);
        assert_eq!(plan_file(Some(x), Some(y), new(y), false), FileAction::Unchanged);
        assert_eq!(plan_file(Some(x), None, new(x), false), FileAction::KeepUserDeletion);
        assert_eq!(
            plan_file(Some(x), None, new(z), false),
            FileAction::Conflict(ConflictKind::DeletedByUser)
        );
        assert_eq!(
            plan_file(None, Some(y), new(z), false),
            FileAction::Conflict(ConflictKind::AddedByUser)
        );
        assert_eq!(plan_file(Some(x), None, None, false), FileAction::Forget);
    }

    #[test]
    fn test_plan_overwrite_policies() {
        let x = Hash32::hash("X");
        let y = Hash32::hash("Y");
        let z = Hash32::hash("Z");

        let always = Some(NewFile {
            hash: z,
            policy: OverwritePolicy::Always,
        });
        assert_eq!(plan_file(Some(x), Some(y), always, false), FileAction::Write);

        let never = |hash| {
            Some(NewFile {
                hash,
                policy: OverwritePolicy::Never,
            })
        };
        assert_eq!(plan_file(None, None, never(z), false), FileAction::Write);
        assert_eq!(plan_file(Some(x), Some(x), never(z), true), FileAction::Unchanged);
        assert_eq!(plan_file(Some(x), None, never(z), true), FileAction::KeepUserDeletion);
    }
}
