#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod core;
mod error;
mod utils;

pub mod engine;
pub mod fragment;
pub mod generator;
pub mod output;
pub mod plugin;
pub mod provider;
pub mod sync;
pub mod tree;

pub use crate::core::{CancelFlag, Hash32, ParseHashError};
pub use crate::engine::{
    Diagnostics, GeneratorEntry, RunOptions, RunOutput, TaskGraph, build_generator_entry,
    run_task_graph,
};
pub use crate::error::*;
pub use crate::fragment::{CodeFragment, HoistPosition, HoistedFragment};
pub use crate::generator::{
    BuildContext, BuildOutput, BundleDefinition, Descriptor, DescriptorError, Generator,
    GeneratorBundle, GeneratorRegistry, TaskDefinition, TaskRun,
};
pub use crate::output::{
    BuilderAction, FileContents, FileFormatter, Formatters, GeneratorOutput, OverwritePolicy,
    PostWriteCommand, WriteFileOptions,
};
pub use crate::plugin::{Capability, Plugin, PluginConfig, PluginStore, install_plugins};
pub use crate::provider::{ProviderExportScope, ProviderType, TaskProviders};
pub use crate::sync::{
    Project, SyncOptions, SyncProjectResult, SyncStatus, generate_package, sync_file, sync_project,
};
pub use crate::utils::{as_overhead, error_chain, init_logging};
