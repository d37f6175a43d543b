//! Generators, the tasks they contribute, and the bundle tree they form.
//!
//! A generator is a function of a validated descriptor. Invoking it produces
//! a [`GeneratorBundle`]: the generator's tasks, the scopes it opens for its
//! descendants, and its child bundles. The bundle tree is what
//! [`build_generator_entry`](crate::build_generator_entry) flattens into a
//! task graph.

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::core::Dynamic;
use crate::error::ConfigError;
use crate::output::BuilderAction;
use crate::provider::{
    ProviderDependency, ProviderExport, ProviderExportScope, ProviderSet, TaskProviders,
};

type RunFn = Arc<dyn Fn(&TaskProviders) -> anyhow::Result<TaskRun> + Send + Sync>;
type BuildFn = Box<dyn FnOnce(&BuildContext) -> anyhow::Result<BuildOutput> + Send>;

/// A unit of work inside a generator.
///
/// `run` receives the resolved dependencies and returns the providers this
/// task exports. It must not touch the filesystem. An optional build phase
/// then returns the builder actions that produce files, plus any output
/// providers.
pub struct TaskDefinition {
    pub(crate) name: String,
    pub(crate) dependencies: BTreeMap<String, ProviderDependency>,
    pub(crate) exports: BTreeMap<String, ProviderExport>,
    pub(crate) outputs: BTreeMap<String, ProviderExport>,
    pub(crate) run: RunFn,
}

impl TaskDefinition {
    pub fn builder(name: impl Into<String>) -> TaskBuilder {
        TaskBuilder {
            name: name.into(),
            dependencies: BTreeMap::new(),
            exports: BTreeMap::new(),
            outputs: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dependencies(&self) -> &BTreeMap<String, ProviderDependency> {
        &self.dependencies
    }

    pub fn exports(&self) -> &BTreeMap<String, ProviderExport> {
        &self.exports
    }

    pub fn outputs(&self) -> &BTreeMap<String, ProviderExport> {
        &self.outputs
    }
}

impl std::fmt::Debug for TaskDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskDefinition")
            .field("name", &self.name)
            .field("dependencies", &self.dependencies.keys())
            .field("exports", &self.exports.keys())
            .field("outputs", &self.outputs.keys())
            .finish()
    }
}

pub struct TaskBuilder {
    name: String,
    dependencies: BTreeMap<String, ProviderDependency>,
    exports: BTreeMap<String, ProviderExport>,
    outputs: BTreeMap<String, ProviderExport>,
}

impl TaskBuilder {
    pub fn dependency(mut self, key: impl Into<String>, dependency: ProviderDependency) -> Self {
        self.dependencies.insert(key.into(), dependency);
        self
    }

    pub fn export(mut self, key: impl Into<String>, export: ProviderExport) -> Self {
        self.exports.insert(key.into(), export);
        self
    }

    /// Declares a provider produced by the build phase.
    pub fn output(mut self, key: impl Into<String>, export: ProviderExport) -> Self {
        self.outputs.insert(key.into(), export);
        self
    }

    pub fn run<F>(self, callback: F) -> TaskDefinition
    where
        F: Fn(&TaskProviders) -> anyhow::Result<TaskRun> + Send + Sync + 'static,
    {
        TaskDefinition {
            name: self.name,
            dependencies: self.dependencies,
            exports: self.exports,
            outputs: self.outputs,
            run: Arc::new(callback),
        }
    }
}

/// What a task's run phase returns.
#[derive(Default)]
pub struct TaskRun {
    pub(crate) providers: ProviderSet,
    pub(crate) build: Option<BuildFn>,
}

impl TaskRun {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn provide<T: Send + Sync + 'static>(mut self, key: impl Into<String>, value: T) -> Self {
        self.providers.insert(key, value);
        self
    }

    pub fn build<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(&BuildContext) -> anyhow::Result<BuildOutput> + Send + 'static,
    {
        self.build = Some(Box::new(callback));
        self
    }
}

/// Read-only information handed to a task's build phase.
#[derive(Debug, Clone)]
pub struct BuildContext {
    pub task_id: String,
    pub generator_name: String,
    pub base_directory: Utf8PathBuf,
}

/// Actions and output providers produced by a build phase.
#[derive(Default)]
pub struct BuildOutput {
    pub(crate) actions: Vec<Box<dyn BuilderAction>>,
    pub(crate) outputs: ProviderSet,
}

impl BuildOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn action(mut self, action: impl BuilderAction + 'static) -> Self {
        self.actions.push(Box::new(action));
        self
    }

    pub fn output<T: Send + Sync + 'static>(mut self, key: impl Into<String>, value: T) -> Self {
        self.outputs.insert(key, value);
        self
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

/// Children of a bundle in a named slot.
pub enum BundleChild {
    One(Box<GeneratorBundle>),
    /// Instances keyed by their instance name, kept in insertion order.
    Many(Vec<(String, GeneratorBundle)>),
}

/// A node of the generator tree before flattening.
pub struct GeneratorBundle {
    pub(crate) name: String,
    pub(crate) directory: Utf8PathBuf,
    pub(crate) descriptor: Option<Dynamic>,
    pub(crate) children: BTreeMap<String, BundleChild>,
    pub(crate) tasks: Vec<Arc<TaskDefinition>>,
    pub(crate) scopes: Vec<ProviderExportScope>,
}

impl GeneratorBundle {
    pub fn new(name: impl Into<String>, directory: impl Into<Utf8PathBuf>) -> Self {
        Self {
            name: name.into(),
            directory: directory.into(),
            descriptor: None,
            children: BTreeMap::new(),
            tasks: Vec::new(),
            scopes: Vec::new(),
        }
    }

    pub fn with_descriptor<D: Any + Send + Sync>(mut self, descriptor: D) -> Self {
        self.descriptor = Some(Arc::new(descriptor));
        self
    }

    pub fn task(mut self, task: TaskDefinition) -> Self {
        self.tasks.push(Arc::new(task));
        self
    }

    /// Opens a named provider scope for this bundle's subtree.
    pub fn scope(mut self, scope: ProviderExportScope) -> Self {
        self.scopes.push(scope);
        self
    }

    pub fn child(mut self, slot: impl Into<String>, bundle: GeneratorBundle) -> Self {
        self.children
            .insert(slot.into(), BundleChild::One(Box::new(bundle)));
        self
    }

    pub fn children<I, K>(mut self, slot: impl Into<String>, bundles: I) -> Self
    where
        I: IntoIterator<Item = (K, GeneratorBundle)>,
        K: Into<String>,
    {
        let bundles = bundles
            .into_iter()
            .map(|(name, bundle)| (name.into(), bundle))
            .collect();
        self.children.insert(slot.into(), BundleChild::Many(bundles));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn directory(&self) -> &Utf8Path {
        &self.directory
    }

    pub fn descriptor<D: Any>(&self) -> Option<&D> {
        self.descriptor.as_ref()?.downcast_ref::<D>()
    }

    pub fn tasks(&self) -> impl Iterator<Item = &TaskDefinition> {
        self.tasks.iter().map(Arc::as_ref)
    }
}

impl std::fmt::Debug for GeneratorBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeneratorBundle")
            .field("name", &self.name)
            .field("directory", &self.directory)
            .field("tasks", &self.tasks)
            .field("children", &self.children.keys())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct DescriptorError {
    pub field: Option<String>,
    pub message: String,
}

impl DescriptorError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: Some(field.into()),
            message: message.into(),
        }
    }
}

/// Validated input of a generator.
///
/// Deserialization enforces the shape, `validate` the remaining rules.
pub trait Descriptor: DeserializeOwned + Send + Sync + 'static {
    fn validate(&self) -> Result<(), DescriptorError> {
        Ok(())
    }
}

/// A generator turns a descriptor into a bundle of tasks.
pub trait Generator: Send + Sync + 'static {
    type Descriptor: Descriptor;

    fn name(&self) -> &str;

    /// Base directory templates are resolved against.
    fn directory(&self) -> &Utf8Path;

    fn scopes(&self) -> Vec<ProviderExportScope> {
        Vec::new()
    }

    fn build_tasks(&self, descriptor: &Self::Descriptor) -> anyhow::Result<Vec<TaskDefinition>>;

    fn bundle(&self, descriptor: Self::Descriptor) -> anyhow::Result<GeneratorBundle> {
        let tasks = self.build_tasks(&descriptor)?;
        let mut bundle = GeneratorBundle::new(self.name(), self.directory());

        for scope in self.scopes() {
            bundle = bundle.scope(scope);
        }

        for task in tasks {
            bundle = bundle.task(task);
        }

        Ok(bundle.with_descriptor(descriptor))
    }
}

trait ErasedGenerator: Send + Sync {
    fn instantiate(
        &self,
        descriptor: serde_json::Value,
        entry: &str,
    ) -> Result<GeneratorBundle, ConfigError>;
}

impl<T> ErasedGenerator for T
where
    T: Generator,
{
    fn instantiate(
        &self,
        descriptor: serde_json::Value,
        entry: &str,
    ) -> Result<GeneratorBundle, ConfigError> {
        let invalid = |field: Option<String>, message: String| ConfigError::InvalidDescriptor {
            generator: self.name().to_string(),
            entry: entry.to_string(),
            field,
            message,
        };

        let descriptor: T::Descriptor = serde_json::from_value(descriptor).map_err(|err| {
            let message = err.to_string();
            invalid(field_from_serde_message(&message), message)
        })?;

        descriptor
            .validate()
            .map_err(|err| invalid(err.field, err.message))?;

        self.bundle(descriptor)
            .map_err(|source| ConfigError::Generator {
                generator: self.name().to_string(),
                entry: entry.to_string(),
                source: source.into(),
            })
    }
}

/// Pulls the field name out of messages like "missing field `name`".
fn field_from_serde_message(message: &str) -> Option<String> {
    let start = message.find("field `")? + "field `".len();
    let len = message[start..].find('`')?;
    Some(message[start..start + len].to_string())
}

/// JSON-shaped project definition of a bundle, validated by the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleDefinition {
    pub generator: String,
    #[serde(default = "empty_descriptor")]
    pub descriptor: serde_json::Value,
    #[serde(default)]
    pub children: BTreeMap<String, ChildDefinition>,
}

fn empty_descriptor() -> serde_json::Value {
    serde_json::Value::Object(Default::default())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChildDefinition {
    Many(Vec<NamedBundleDefinition>),
    One(Box<BundleDefinition>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamedBundleDefinition {
    pub name: String,
    #[serde(flatten)]
    pub bundle: BundleDefinition,
}

/// Generator name to generator lookup.
///
/// Hosts create one registry and pass it wherever definitions are turned
/// into bundles.
#[derive(Default)]
pub struct GeneratorRegistry {
    generators: BTreeMap<String, Arc<dyn ErasedGenerator>>,
}

impl GeneratorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<G: Generator>(&mut self, generator: G) -> Result<&mut Self, ConfigError> {
        let name = generator.name().to_string();
        if self.generators.contains_key(&name) {
            return Err(ConfigError::DuplicateGenerator(name));
        }

        self.generators.insert(name, Arc::new(generator));
        Ok(self)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.generators.contains_key(name)
    }

    /// Validates every descriptor in the definition tree and builds the bundles.
    pub fn bundle_from_definition(&self, definition: &BundleDefinition) -> Result<GeneratorBundle, ConfigError> {
        self.bundle_at(definition, "root")
    }

    fn bundle_at(
        &self,
        definition: &BundleDefinition,
        entry: &str,
    ) -> Result<GeneratorBundle, ConfigError> {
        let generator = self.generators.get(&definition.generator).ok_or_else(|| {
            ConfigError::UnknownGenerator {
                generator: definition.generator.clone(),
                entry: entry.to_string(),
            }
        })?;

        let mut bundle = generator.instantiate(definition.descriptor.clone(), entry)?;

        for (slot, child) in &definition.children {
            let path = format!("{entry}.{slot}");
            if bundle.children.contains_key(slot) {
                return Err(ConfigError::DuplicateEntry(path));
            }

            let child = match child {
                ChildDefinition::One(definition) => {
                    BundleChild::One(Box::new(self.bundle_at(definition, &path)?))
                }
                ChildDefinition::Many(definitions) => BundleChild::Many(
                    definitions
                        .iter()
                        .map(|named| {
                            let path = format!("{path}.{}", named.name);
                            Ok((named.name.clone(), self.bundle_at(&named.bundle, &path)?))
                        })
                        .collect::<Result<_, ConfigError>>()?,
                ),
            };

            bundle.children.insert(slot.clone(), child);
        }

        Ok(bundle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ProviderType;

    #[derive(Debug, Deserialize)]
    #[serde(deny_unknown_fields)]
    struct ModelDescriptor {
        name: String,
        #[serde(default)]
        fields: Vec<String>,
    }

    impl Descriptor for ModelDescriptor {
        fn validate(&self) -> Result<(), DescriptorError> {
            if self.name.is_empty() {
                return Err(DescriptorError::new("name", "must not be empty"));
            }
            Ok(())
        }
    }

    struct ModelGenerator;

    impl Generator for ModelGenerator {
        type Descriptor = ModelDescriptor;

        fn name(&self) -> &str {
            "prisma-model"
        }

        fn directory(&self) -> &Utf8Path {
            Utf8Path::new("generators/prisma-model")
        }

        fn build_tasks(&self, descriptor: &ModelDescriptor) -> anyhow::Result<Vec<TaskDefinition>> {
            let name = descriptor.name.clone();
            let model = ProviderType::<String>::new("prisma-model");
            Ok(vec![
                TaskDefinition::builder("main")
                    .export("model", model.export())
                    .run(move |_| Ok(TaskRun::new().provide("model", name.clone()))),
            ])
        }
    }

    fn registry() -> GeneratorRegistry {
        let mut registry = GeneratorRegistry::new();
        registry.register(ModelGenerator).unwrap();
        registry
    }

    #[test]
    fn test_registry_rejects_duplicates() {
        let mut registry = registry();
        let err = registry.register(ModelGenerator).err().unwrap();
        assert!(matches!(err, ConfigError::DuplicateGenerator(name) if name == "prisma-model"));
    }

    #[test]
    fn test_bundle_from_definition() {
        let definition: BundleDefinition = serde_json::from_value(serde_json::json!({
            "generator": "prisma-model",
            "descriptor": { "name": "User", "fields": ["id"] },
            "children": {
                "relations": [
                    { "name": "posts", "generator": "prisma-model", "descriptor": { "name": "Post" } }
                ],
                "profile": { "generator": "prisma-model", "descriptor": { "name": "Profile" } }
            }
        }))
        .unwrap();

        let bundle = registry().bundle_from_definition(&definition).unwrap();
        assert_eq!(bundle.name(), "prisma-model");
        assert_eq!(bundle.descriptor::<ModelDescriptor>().unwrap().name, "User");
        assert_eq!(bundle.descriptor::<ModelDescriptor>().unwrap().fields, ["id"]);
        assert_eq!(bundle.tasks().count(), 1);
        assert!(matches!(bundle.children["profile"], BundleChild::One(_)));
        match &bundle.children["relations"] {
            BundleChild::Many(items) => {
                assert_eq!(items.len(), 1);
                assert_eq!(items[0].0, "posts");
            }
            BundleChild::One(_) => panic!("expected many"),
        }
    }

    #[test]
    fn test_schema_error_reports_generator_and_field() {
        let definition: BundleDefinition = serde_json::from_value(serde_json::json!({
            "generator": "prisma-model",
            "descriptor": { "name": "User" },
            "children": {
                "profile": { "generator": "prisma-model", "descriptor": {} }
            }
        }))
        .unwrap();

        let err = registry().bundle_from_definition(&definition).err().unwrap();
        match err {
            ConfigError::InvalidDescriptor {
                generator,
                entry,
                field,
                ..
            } => {
                assert_eq!(generator, "prisma-model");
                assert_eq!(entry, "root.profile");
                assert_eq!(field.as_deref(), Some("name"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_validate_error_reports_field() {
        let definition = BundleDefinition {
            generator: "prisma-model".into(),
            descriptor: serde_json::json!({ "name": "" }),
            children: BTreeMap::new(),
        };

        let err = registry().bundle_from_definition(&definition).err().unwrap();
        let message = err.to_string();
        assert!(message.contains("field 'name'"), "{message}");
        assert!(message.contains("must not be empty"), "{message}");
    }

    #[test]
    fn test_unknown_generator() {
        let definition = BundleDefinition {
            generator: "react-app".into(),
            descriptor: empty_descriptor(),
            children: BTreeMap::new(),
        };

        let err = registry().bundle_from_definition(&definition).err().unwrap();
        assert!(matches!(err, ConfigError::UnknownGenerator { generator, .. } if generator == "react-app"));
    }

    #[test]
    fn test_field_from_serde_message() {
        assert_eq!(
            field_from_serde_message("missing field `name`").as_deref(),
            Some("name")
        );
        assert_eq!(
            field_from_serde_message("unknown field `nmae`, expected `name` or `fields`")
                .as_deref(),
            Some("nmae")
        );
        assert_eq!(field_from_serde_message("invalid type: integer"), None);
    }
}
