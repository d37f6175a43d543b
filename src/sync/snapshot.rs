use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::ErrorKind;

use camino::{Utf8Path, Utf8PathBuf};
use rayon::iter::{IntoParallelRefIterator, ParallelIterator};
use serde::{Deserialize, Serialize};

use crate::core::Hash32;
use crate::error::SyncError;
use crate::output::{FileData, TemplateMetadata, WriteFileOptions};

/// Per-package state directory.
pub const STATE_DIRECTORY: &str = ".kumitate";
pub const MANIFEST_FILE_NAME: &str = "manifest.json";
/// Copy of the previously generated files, inside the state directory.
pub const GENERATED_DIRECTORY: &str = "generated";

pub const MANIFEST_VERSION: u32 = 1;

/// What the manifest remembers about one generated file.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct GeneratedFileRecord {
    pub id: String,
    pub generator: String,
    pub hash: Hash32,
    #[serde(default)]
    pub options: WriteFileOptions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_metadata: Option<TemplateMetadata>,
}

impl GeneratedFileRecord {
    pub fn from_file(file: &FileData) -> Self {
        Self {
            id: file.id.clone(),
            generator: file.generator.clone(),
            hash: Hash32::hash(&file.contents),
            options: file.options,
            template_metadata: file.template_metadata.clone(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    pub version: u32,
    pub files: BTreeMap<String, GeneratedFileRecord>,
}

impl Default for Manifest {
    fn default() -> Self {
        Self {
            version: MANIFEST_VERSION,
            files: BTreeMap::new(),
        }
    }
}

pub fn state_directory(package_directory: &Utf8Path) -> Utf8PathBuf {
    package_directory.join(STATE_DIRECTORY)
}

pub fn manifest_path(package_directory: &Utf8Path) -> Utf8PathBuf {
    state_directory(package_directory).join(MANIFEST_FILE_NAME)
}

pub fn generated_directory(package_directory: &Utf8Path) -> Utf8PathBuf {
    state_directory(package_directory).join(GENERATED_DIRECTORY)
}

/// The output of the previous sync: its manifest plus whatever copies of
/// the generated files survived in the snapshot directory.
///
/// Read once before reconciliation and never mutated while it runs.
#[derive(Debug, Clone, Default)]
pub struct SyncSnapshot {
    pub manifest: Manifest,
    pub contents: BTreeMap<String, Vec<u8>>,
}

impl SyncSnapshot {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Loads the snapshot of a package. A package that was never synced has
    /// an empty snapshot.
    pub fn load(package_directory: &Utf8Path) -> Result<Self, SyncError> {
        let path = manifest_path(package_directory);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Self::empty()),
            Err(source) => return Err(SyncError::Read { path, source }),
        };

        let manifest: Manifest =
            serde_json::from_str(&text).map_err(|source| SyncError::Manifest {
                path: path.clone(),
                source,
            })?;

        let generated = generated_directory(package_directory);
        let paths: Vec<&String> = manifest.files.keys().collect();

        let contents = paths
            .par_iter()
            .map(|relative| {
                let path = generated.join(relative.as_str());
                match fs::read(&path) {
                    Ok(bytes) => Ok(Some(((*relative).clone(), bytes))),
                    Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
                    Err(source) => Err(SyncError::Read { path, source }),
                }
            })
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .flatten()
            .collect();

        tracing::debug!(
            package = %package_directory,
            files = manifest.files.len(),
            "loaded previous snapshot"
        );

        Ok(Self { manifest, contents })
    }

    pub fn record(&self, path: &str) -> Option<&GeneratedFileRecord> {
        self.manifest.files.get(path)
    }

    /// Hash of the previously generated contents of `path`.
    ///
    /// The snapshot copy wins over the manifest hash when both exist.
    pub fn previous_hash(&self, path: &str) -> Option<Hash32> {
        match self.contents.get(path) {
            Some(bytes) => Some(Hash32::hash(bytes)),
            None => self.record(path).map(|record| record.hash),
        }
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.manifest.files.keys().map(String::as_str)
    }
}

/// The snapshot the next sync will compare against.
#[derive(Debug, Clone, Default)]
pub struct SnapshotUpdate {
    pub records: BTreeMap<String, GeneratedFileRecord>,
    pub contents: BTreeMap<String, Vec<u8>>,
    /// Paths whose entry changed during this reconciliation.
    pub touched: BTreeSet<String>,
}

impl SnapshotUpdate {
    pub fn manifest(&self) -> Manifest {
        Manifest {
            version: MANIFEST_VERSION,
            files: self.records.clone(),
        }
    }
}

fn write_file(path: &Utf8Path, contents: &[u8]) -> Result<(), SyncError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| SyncError::Write {
            path: parent.to_owned(),
            source,
        })?;
    }

    fs::write(path, contents).map_err(|source| SyncError::Write {
        path: path.to_owned(),
        source,
    })
}

fn write_manifest(package_directory: &Utf8Path, manifest: &Manifest) -> Result<(), SyncError> {
    let path = manifest_path(package_directory);
    let text = serde_json::to_string_pretty(manifest).map_err(|source| SyncError::Manifest {
        path: path.clone(),
        source,
    })?;

    let tmp = path.with_extension("json.tmp");
    write_file(&tmp, text.as_bytes())?;
    fs::rename(&tmp, &path).map_err(|source| SyncError::Snapshot { path, source })
}

/// Replaces the whole snapshot of a package.
///
/// Files are written into a sibling temporary directory which is then
/// renamed over the old snapshot, so an interrupted write leaves the
/// previous snapshot intact.
pub fn write_snapshot(package_directory: &Utf8Path, update: &SnapshotUpdate) -> Result<(), SyncError> {
    let generated = generated_directory(package_directory);
    let staging = state_directory(package_directory).join(format!("{GENERATED_DIRECTORY}.tmp"));
    let retired = state_directory(package_directory).join(format!("{GENERATED_DIRECTORY}.old"));

    for stale in [&staging, &retired] {
        if stale.exists() {
            fs::remove_dir_all(stale).map_err(|source| SyncError::Snapshot {
                path: stale.clone(),
                source,
            })?;
        }
    }

    fs::create_dir_all(&staging).map_err(|source| SyncError::Write {
        path: staging.clone(),
        source,
    })?;

    update
        .contents
        .par_iter()
        .try_for_each(|(relative, bytes)| write_file(&staging.join(relative), bytes))?;

    if generated.exists() {
        fs::rename(&generated, &retired).map_err(|source| SyncError::Snapshot {
            path: generated.clone(),
            source,
        })?;
    }
    fs::rename(&staging, &generated).map_err(|source| SyncError::Snapshot {
        path: generated.clone(),
        source,
    })?;
    if retired.exists() {
        fs::remove_dir_all(&retired).map_err(|source| SyncError::Snapshot {
            path: retired.clone(),
            source,
        })?;
    }

    write_manifest(package_directory, &update.manifest())?;

    tracing::debug!(
        package = %package_directory,
        files = update.records.len(),
        "replaced snapshot"
    );

    Ok(())
}

/// Updates only the touched entries of the snapshot, in place.
pub fn patch_snapshot(package_directory: &Utf8Path, update: &SnapshotUpdate) -> Result<(), SyncError> {
    let generated = generated_directory(package_directory);

    for relative in &update.touched {
        let path = generated.join(relative);
        match update.contents.get(relative) {
            Some(bytes) => write_file(&path, bytes)?,
            None => match fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(source) => return Err(SyncError::Delete { path, source }),
            },
        }
    }

    write_manifest(package_directory, &update.manifest())?;

    tracing::debug!(
        package = %package_directory,
        touched = update.touched.len(),
        "patched snapshot"
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::FileContents;

    fn tempdir() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        (dir, root)
    }

    fn update(files: &[(&str, &str)]) -> SnapshotUpdate {
        let mut update = SnapshotUpdate::default();
        for (path, text) in files {
            let file = FileData {
                id: format!("node:{path}"),
                generator: "node".into(),
                contents: FileContents::from(*text),
                options: WriteFileOptions::default(),
                template_metadata: None,
            };
            update
                .records
                .insert(path.to_string(), GeneratedFileRecord::from_file(&file));
            update
                .contents
                .insert(path.to_string(), text.as_bytes().to_vec());
            update.touched.insert(path.to_string());
        }
        update
    }

    #[test]
    fn test_missing_snapshot_is_empty() {
        let (_dir, root) = tempdir();
        let snapshot = SyncSnapshot::load(&root).unwrap();
        assert!(snapshot.manifest.files.is_empty());
        assert_eq!(snapshot.manifest.version, MANIFEST_VERSION);
    }

    #[test]
    fn test_write_then_load() {
        let (_dir, root) = tempdir();
        write_snapshot(&root, &update(&[("src/index.ts", "export {};\n")])).unwrap();

        let snapshot = SyncSnapshot::load(&root).unwrap();
        assert_eq!(snapshot.paths().collect::<Vec<_>>(), ["src/index.ts"]);
        assert_eq!(snapshot.contents["src/index.ts"], b"export {};\n");
        assert_eq!(
            snapshot.previous_hash("src/index.ts"),
            Some(Hash32::hash("export {};\n"))
        );
        assert_eq!(snapshot.record("src/index.ts").unwrap().generator, "node");
    }

    #[test]
    fn test_write_replaces_old_files() {
        let (_dir, root) = tempdir();
        write_snapshot(&root, &update(&[("a.ts", "a"), ("b.ts", "b")])).unwrap();
        write_snapshot(&root, &update(&[("b.ts", "b2")])).unwrap();

        let generated = generated_directory(&root);
        assert!(!generated.join("a.ts").exists());
        assert_eq!(fs::read_to_string(generated.join("b.ts")).unwrap(), "b2");
        assert!(!state_directory(&root).join("generated.tmp").exists());
        assert!(!state_directory(&root).join("generated.old").exists());
    }

    #[test]
    fn test_manifest_hash_used_without_copy() {
        let (_dir, root) = tempdir();
        write_snapshot(&root, &update(&[("a.ts", "a")])).unwrap();
        fs::remove_file(generated_directory(&root).join("a.ts")).unwrap();

        let snapshot = SyncSnapshot::load(&root).unwrap();
        assert!(snapshot.contents.is_empty());
        assert_eq!(snapshot.previous_hash("a.ts"), Some(Hash32::hash("a")));
    }

    #[test]
    fn test_patch_touches_only_listed_paths() {
        let (_dir, root) = tempdir();
        write_snapshot(&root, &update(&[("a.ts", "a"), ("b.ts", "b")])).unwrap();

        let mut patch = update(&[("a.ts", "a"), ("b.ts", "b")]);
        patch.touched.clear();
        patch.records.remove("b.ts");
        patch.contents.remove("b.ts");
        patch.touched.insert("b.ts".into());
        patch_snapshot(&root, &patch).unwrap();

        let snapshot = SyncSnapshot::load(&root).unwrap();
        assert_eq!(snapshot.paths().collect::<Vec<_>>(), ["a.ts"]);
        assert!(!generated_directory(&root).join("b.ts").exists());
    }

    #[test]
    fn test_invalid_manifest() {
        let (_dir, root) = tempdir();
        fs::create_dir_all(state_directory(&root)).unwrap();
        fs::write(manifest_path(&root), "{ not json").unwrap();

        assert!(matches!(
            SyncSnapshot::load(&root).unwrap_err(),
            SyncError::Manifest { .. }
        ));
    }
}
