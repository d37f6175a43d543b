use std::collections::BTreeSet;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};

use crate::core::Dynamic;
use crate::error::ConfigError;
use crate::generator::{BundleChild, GeneratorBundle, TaskDefinition};
use crate::provider::ProviderExportScope;

pub const ROOT_ENTRY_ID: &str = "root";

/// A generator bundle with its position in the tree fixed by an id.
///
/// Ids are hierarchical: `root`, `root.<slot>` for single children and
/// `root.<slot>.<instance>` for instances in a multi-child slot.
#[derive(Debug)]
pub struct GeneratorEntry {
    pub(crate) id: String,
    pub(crate) generator_name: String,
    pub(crate) base_directory: Utf8PathBuf,
    pub(crate) descriptor: Option<Dynamic>,
    pub(crate) scopes: Vec<ProviderExportScope>,
    pub(crate) tasks: Vec<Arc<TaskDefinition>>,
    pub(crate) children: Vec<GeneratorEntry>,
}

impl GeneratorEntry {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn generator_name(&self) -> &str {
        &self.generator_name
    }

    pub fn base_directory(&self) -> &Utf8Path {
        &self.base_directory
    }

    pub fn scopes(&self) -> &[ProviderExportScope] {
        &self.scopes
    }

    pub fn tasks(&self) -> impl Iterator<Item = &TaskDefinition> {
        self.tasks.iter().map(Arc::as_ref)
    }

    pub fn children(&self) -> &[GeneratorEntry] {
        &self.children
    }

    pub fn descriptor<D: std::any::Any>(&self) -> Option<&D> {
        self.descriptor.as_ref()?.downcast_ref::<D>()
    }

    /// All entries of the tree, depth first, parents before children.
    pub fn walk(&self) -> Vec<&GeneratorEntry> {
        let mut entries = Vec::new();
        let mut stack = vec![self];

        while let Some(entry) = stack.pop() {
            entries.push(entry);
            stack.extend(entry.children.iter().rev());
        }

        entries
    }
}

/// Assigns ids to every bundle of the tree and checks they are unique.
pub fn build_generator_entry(bundle: &GeneratorBundle) -> Result<GeneratorEntry, ConfigError> {
    let mut seen = BTreeSet::new();
    build_entry(bundle, ROOT_ENTRY_ID.to_string(), &mut seen)
}

fn build_entry(
    bundle: &GeneratorBundle,
    id: String,
    seen: &mut BTreeSet<String>,
) -> Result<GeneratorEntry, ConfigError> {
    if !seen.insert(id.clone()) {
        return Err(ConfigError::DuplicateEntry(id));
    }

    let mut names = BTreeSet::new();
    for task in &bundle.tasks {
        if !names.insert(task.name.as_str()) {
            return Err(ConfigError::DuplicateTask {
                entry: id,
                task: task.name.clone(),
            });
        }
    }

    let mut children = Vec::new();
    for (slot, child) in &bundle.children {
        match child {
            BundleChild::One(child) => {
                children.push(build_entry(child, format!("{id}.{slot}"), seen)?);
            }
            BundleChild::Many(instances) => {
                for (name, child) in instances {
                    children.push(build_entry(child, format!("{id}.{slot}.{name}"), seen)?);
                }
            }
        }
    }

    tracing::trace!(entry = %id, generator = %bundle.name, "flattened generator entry");

    Ok(GeneratorEntry {
        id,
        generator_name: bundle.name.clone(),
        base_directory: bundle.directory.clone(),
        descriptor: bundle.descriptor.clone(),
        scopes: bundle.scopes.clone(),
        tasks: bundle.tasks.clone(),
        children,
    })
}
