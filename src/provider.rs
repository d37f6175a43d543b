//! Typed capabilities exchanged between generator tasks.
//!
//! A [`ProviderType<T>`] is a named token. Tasks declare that they *export* a
//! provider (optionally into a wider scope) or *depend* on one. The graph
//! builder matches dependencies to exports by name and scope, and the runner
//! hands each task the values its producers returned.
//!
//! ## Phantom tokens
//!
//! Provider values travel through the engine type-erased as
//! `Arc<dyn Any + Send + Sync>`. The token carries `T` only in `PhantomData`,
//! which lets [`TaskProviders::get`] downcast safely, and lets the graph
//! builder reject two tokens that share a name but disagree on the type.

use std::any::{Any, TypeId, type_name};
use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::marker::PhantomData;
use std::sync::Arc;

use anyhow::anyhow;

use crate::core::{ArcStr, Dynamic};
use crate::error::GraphError;

/// Runtime identity of a provider: its name plus the Rust type it carries.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProviderKey {
    pub(crate) name: ArcStr,
    pub(crate) type_id: TypeId,
    pub(crate) type_name: &'static str,
}

impl ProviderKey {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }
}

/// A named, typed capability identifier.
pub struct ProviderType<T> {
    key: ProviderKey,
    _phantom: PhantomData<fn() -> T>,
}

impl<T> Clone for ProviderType<T> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            _phantom: PhantomData,
        }
    }
}

impl<T> std::fmt::Debug for ProviderType<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ProviderType({}: {})", self.key.name, self.key.type_name)
    }
}

impl<T: Send + Sync + 'static> ProviderType<T> {
    pub fn new(name: impl Into<ArcStr>) -> Self {
        Self {
            key: ProviderKey {
                name: name.into(),
                type_id: TypeId::of::<T>(),
                type_name: type_name::<T>(),
            },
            _phantom: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.key.name
    }

    pub fn key(&self) -> &ProviderKey {
        &self.key
    }

    /// Export visible to the exporting generator and its descendants.
    pub fn export(&self) -> ProviderExport {
        ProviderExport {
            provider: self.key.clone(),
            scope: ExportScope::Generator,
        }
    }

    /// Export visible to the parent generator and the parent's subtree.
    pub fn export_to_parent(&self) -> ProviderExport {
        ProviderExport {
            provider: self.key.clone(),
            scope: ExportScope::Parent,
        }
    }

    /// Export visible to everything under the nearest generator declaring `scope`.
    pub fn export_to(&self, scope: &ProviderExportScope) -> ProviderExport {
        ProviderExport {
            provider: self.key.clone(),
            scope: ExportScope::Named(scope.clone()),
        }
    }

    pub fn dependency(&self) -> ProviderDependency {
        ProviderDependency {
            provider: self.key.clone(),
            optional: false,
            reference: None,
            output: false,
        }
    }

    /// Dependency on a provider produced by another task's build phase.
    pub fn output_dependency(&self) -> ProviderDependency {
        ProviderDependency {
            output: true,
            ..self.dependency()
        }
    }
}

/// A scope tag opened by a generator, e.g. "project" or "package".
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProviderExportScope {
    name: ArcStr,
    description: ArcStr,
}

impl ProviderExportScope {
    pub fn new(name: impl Into<ArcStr>, description: impl Into<ArcStr>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExportScope {
    Generator,
    Parent,
    Named(ProviderExportScope),
}

impl std::fmt::Display for ExportScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExportScope::Generator => f.write_str("generator"),
            ExportScope::Parent => f.write_str("parent"),
            ExportScope::Named(scope) => f.write_str(scope.name()),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ProviderExport {
    pub(crate) provider: ProviderKey,
    pub(crate) scope: ExportScope,
}

impl ProviderExport {
    pub fn provider(&self) -> &ProviderKey {
        &self.provider
    }

    pub fn scope(&self) -> &ExportScope {
        &self.scope
    }
}

#[derive(Clone, Debug)]
pub struct ProviderDependency {
    pub(crate) provider: ProviderKey,
    pub(crate) optional: bool,
    pub(crate) reference: Option<String>,
    pub(crate) output: bool,
}

impl ProviderDependency {
    /// Resolve to nothing instead of failing when no export is visible.
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    /// Only accept an export coming from the generator entry with this id.
    pub fn reference(mut self, entry_id: impl Into<String>) -> Self {
        self.reference = Some(entry_id.into());
        self
    }

    pub fn provider(&self) -> &ProviderKey {
        &self.provider
    }

    pub fn is_optional(&self) -> bool {
        self.optional
    }

    pub fn is_output(&self) -> bool {
        self.output
    }
}

/// Every provider name seen while building a graph, with the type it carries.
///
/// One registry is created per graph build, so concurrent runs never share
/// state.
#[derive(Debug, Default)]
pub struct ProviderRegistry {
    types: BTreeMap<ArcStr, (TypeId, &'static str)>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, key: &ProviderKey) -> Result<(), GraphError> {
        match self.types.entry(key.name.clone()) {
            Entry::Vacant(entry) => {
                entry.insert((key.type_id, key.type_name));
                Ok(())
            }
            Entry::Occupied(entry) => {
                let (type_id, expected) = *entry.get();
                if type_id == key.type_id {
                    Ok(())
                } else {
                    Err(GraphError::ProviderTypeMismatch {
                        provider: key.name.to_string(),
                        expected,
                        found: key.type_name,
                    })
                }
            }
        }
    }

    pub fn type_name(&self, name: &str) -> Option<&'static str> {
        self.types.get(name).map(|(_, type_name)| *type_name)
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

/// Provider values returned from a task, keyed by export (or output) key.
#[derive(Clone, Default)]
pub struct ProviderSet {
    values: BTreeMap<String, Dynamic>,
}

impl ProviderSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<T: Send + Sync + 'static>(&mut self, key: impl Into<String>, value: T) {
        self.values.insert(key.into(), Arc::new(value));
    }

    pub fn with<T: Send + Sync + 'static>(mut self, key: impl Into<String>, value: T) -> Self {
        self.insert(key, value);
        self
    }

    pub(crate) fn get(&self, key: &str) -> Option<&Dynamic> {
        self.values.get(key)
    }

    pub(crate) fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }
}

impl std::fmt::Debug for ProviderSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.values.keys()).finish()
    }
}

/// Dependencies of a task resolved to the values their producers returned.
#[derive(Clone, Default)]
pub struct TaskProviders {
    pub(crate) values: BTreeMap<String, Option<Dynamic>>,
}

impl TaskProviders {
    /// Returns a required dependency.
    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> anyhow::Result<&T> {
        self.get_optional(key)?
            .ok_or_else(|| anyhow!("dependency '{key}' was not resolved"))
    }

    /// Returns an optional dependency, `None` when nothing was exported for it.
    pub fn get_optional<T: Any + Send + Sync>(&self, key: &str) -> anyhow::Result<Option<&T>> {
        let Some(value) = self.values.get(key) else {
            return Err(anyhow!("task did not declare a dependency named '{key}'"));
        };

        match value {
            None => Ok(None),
            Some(value) => value.downcast_ref::<T>().map(Some).ok_or_else(|| {
                anyhow!(
                    "dependency '{key}' does not hold a value of type {}",
                    type_name::<T>()
                )
            }),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        matches!(self.values.get(key), Some(Some(_)))
    }

    #[cfg(test)]
    pub(crate) fn from_values(values: BTreeMap<String, Option<Dynamic>>) -> Self {
        Self { values }
    }
}
