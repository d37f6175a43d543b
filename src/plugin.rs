//! Plugins and the capabilities they provide.
//!
//! A plugin contributes generators and capability implementations. A
//! capability is a typed extension point, identified by a string id: the
//! host asks the [`PluginStore`] for `C::Implementation` and gets back
//! whatever the installed plugin registered for it.

use std::any::Any;
use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::sync::Arc;

use crate::error::ConfigError;
use crate::generator::{Generator, GeneratorRegistry};

/// A typed extension point.
pub trait Capability: 'static {
    const ID: &'static str;
    type Implementation: ?Sized + Send + Sync + 'static;
}

struct Provided {
    plugin: String,
    /// Holds an `Arc<C::Implementation>`.
    implementation: Box<dyn Any + Send + Sync>,
}

/// Capability id to implementation, at most one implementation each.
#[derive(Default)]
pub struct PluginStore {
    capabilities: BTreeMap<&'static str, Provided>,
}

impl PluginStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<C: Capability>(
        &mut self,
        plugin: &str,
        implementation: Arc<C::Implementation>,
    ) -> Result<&mut Self, ConfigError> {
        match self.capabilities.entry(C::ID) {
            Entry::Occupied(entry) => Err(ConfigError::DuplicateCapability {
                capability: C::ID.to_string(),
                existing: entry.get().plugin.clone(),
                plugin: plugin.to_string(),
            }),
            Entry::Vacant(entry) => {
                entry.insert(Provided {
                    plugin: plugin.to_string(),
                    implementation: Box::new(implementation),
                });
                Ok(self)
            }
        }
    }

    pub fn get<C: Capability>(&self) -> Option<Arc<C::Implementation>> {
        self.capabilities
            .get(C::ID)?
            .implementation
            .downcast_ref::<Arc<C::Implementation>>()
            .cloned()
    }

    pub fn require<C: Capability>(&self) -> Result<Arc<C::Implementation>, ConfigError> {
        self.get::<C>()
            .ok_or_else(|| ConfigError::MissingCapability(C::ID.to_string()))
    }

    /// Name of the plugin providing a capability.
    pub fn provider_of(&self, capability: &str) -> Option<&str> {
        self.capabilities
            .get(capability)
            .map(|provided| provided.plugin.as_str())
    }
}

impl std::fmt::Debug for PluginStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.capabilities.iter().map(|(id, p)| (id, &p.plugin)))
            .finish()
    }
}

/// Handed to a plugin while it is being installed.
pub struct PluginConfig<'a> {
    plugin: &'static str,
    generators: &'a mut GeneratorRegistry,
    store: &'a mut PluginStore,
}

impl PluginConfig<'_> {
    pub fn add_generator<G: Generator>(&mut self, generator: G) -> Result<&mut Self, ConfigError> {
        self.generators.register(generator)?;
        Ok(self)
    }

    pub fn provide<C: Capability>(
        &mut self,
        implementation: Arc<C::Implementation>,
    ) -> Result<&mut Self, ConfigError> {
        self.store.register::<C>(self.plugin, implementation)?;
        Ok(self)
    }
}

pub struct Plugin {
    pub(crate) name: &'static str,
    pub(crate) func: fn(&mut PluginConfig) -> Result<(), ConfigError>,
}

impl Plugin {
    pub const fn new(name: &'static str, func: fn(&mut PluginConfig) -> Result<(), ConfigError>) -> Self {
        Self { name, func }
    }

    pub fn name(&self) -> &str {
        self.name
    }
}

/// Installs plugins in order. The first failure stops the installation.
pub fn install_plugins(
    plugins: &[Plugin],
    generators: &mut GeneratorRegistry,
    store: &mut PluginStore,
) -> Result<(), ConfigError> {
    for plugin in plugins {
        let mut config = PluginConfig {
            plugin: plugin.name,
            generators: &mut *generators,
            store: &mut *store,
        };
        (plugin.func)(&mut config)?;
        tracing::debug!(plugin = plugin.name, "installed plugin");
    }
    Ok(())
}
