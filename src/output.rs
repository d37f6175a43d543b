//! The virtual file set produced by a generation run.
//!
//! Tasks never touch the filesystem. Their build phase returns
//! [`BuilderAction`]s, which the runner applies to a per-task
//! [`GeneratorTaskOutputBuilder`]. Finished task outputs are merged into one
//! [`GeneratorOutput`], which is what the sync engine reconciles against the
//! working directory.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::fs;
use std::sync::Arc;

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::error::{ActionError, OutputError, TemplateError};
use crate::fragment::CodeFragment;
use crate::fragment::importmap::ImportMapProviders;
use crate::fragment::template::{RenderOptions, TemplateFile, render_text_template};

/// Normalize a path, removing things like `.` and `..`.
///
/// CAUTION: This does not resolve symlinks (unlike [`std::fs::canonicalize`]).
///
/// Adapted from
/// <https://github.com/rust-lang/cargo/blob/f7acf448fc127df9a77c52cc2bba027790ac4931/crates/cargo-util/src/paths.rs#L76-L116>
pub(crate) fn normalize_path(path: &Utf8Path) -> Utf8PathBuf {
    let mut components = path.components().peekable();
    let mut ret = if let Some(c @ Utf8Component::Prefix(..)) = components.peek().cloned() {
        components.next();
        Utf8PathBuf::from(c.as_str())
    } else {
        Utf8PathBuf::new()
    };

    for component in components {
        match component {
            Utf8Component::Prefix(..) => unreachable!(),
            Utf8Component::RootDir => {
                ret.push(Utf8Component::RootDir);
            }
            Utf8Component::CurDir => {}
            Utf8Component::ParentDir => {
                if ret.ends_with(Utf8Component::ParentDir) {
                    ret.push(Utf8Component::ParentDir);
                } else {
                    let popped = ret.pop();
                    if !popped && !ret.has_root() {
                        ret.push(Utf8Component::ParentDir);
                    }
                }
            }
            Utf8Component::Normal(c) => {
                ret.push(c);
            }
        }
    }
    ret
}

/// Turns a destination into a forward-slash path relative to the package
/// root, rejecting anything that would escape it.
pub fn normalize_destination(destination: &str) -> Result<String, OutputError> {
    let normalized = normalize_path(Utf8Path::new(destination));
    let escapes = normalized.has_root()
        || normalized
            .components()
            .any(|c| matches!(c, Utf8Component::ParentDir | Utf8Component::Prefix(..)));

    if escapes || normalized.as_str().is_empty() {
        return Err(OutputError::InvalidPath(destination.to_string()));
    }

    Ok(normalized
        .components()
        .map(|c| c.as_str())
        .collect::<Vec<_>>()
        .join("/"))
}

/// The content of a generated file.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FileContents {
    /// Text content (UTF-8).
    Utf8(String),
    /// Binary content (raw bytes).
    Binary(Vec<u8>),
}

impl AsRef<[u8]> for FileContents {
    fn as_ref(&self) -> &[u8] {
        match self {
            FileContents::Utf8(s) => s.as_bytes(),
            FileContents::Binary(b) => b.as_slice(),
        }
    }
}

impl From<String> for FileContents {
    fn from(value: String) -> Self {
        FileContents::Utf8(value)
    }
}

impl From<&str> for FileContents {
    fn from(value: &str) -> Self {
        FileContents::Utf8(value.to_string())
    }
}

impl From<Vec<u8>> for FileContents {
    fn from(value: Vec<u8>) -> Self {
        FileContents::Binary(value)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverwritePolicy {
    /// Overwrite even when the user changed the file.
    Always,
    /// Overwrite unless the user changed the file, which is a conflict.
    #[default]
    IfUnmodified,
    /// Write once, never touch the file again.
    Never,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteFileOptions {
    #[serde(default)]
    pub overwrite_policy: OverwritePolicy,
    #[serde(default)]
    pub skip_formatting: bool,
}

impl WriteFileOptions {
    pub fn write_once() -> Self {
        Self {
            overwrite_policy: OverwritePolicy::Never,
            ..Self::default()
        }
    }
}

/// Enough information to find the template a file was rendered from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateMetadata {
    pub name: String,
    pub template: String,
    pub generator: String,
}

/// An entry of the virtual file set.
#[derive(Debug, Clone)]
pub struct FileData {
    /// Stable identifier, `<generator>:<destination>` unless set explicitly.
    pub id: String,
    pub generator: String,
    pub contents: FileContents,
    pub options: WriteFileOptions,
    pub template_metadata: Option<TemplateMetadata>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CommandPriority {
    /// Dependency installation and similar, runs first.
    Dependencies,
    #[default]
    Default,
    /// Formatting and linting, runs last.
    Formatting,
}

/// A command to run in the package once files are written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostWriteCommand {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Relative to the package root.
    #[serde(default)]
    pub working_directory: Option<String>,
    /// Only run when one of these paths was written.
    #[serde(default)]
    pub only_if_changed: Vec<String>,
    #[serde(default)]
    pub priority: CommandPriority,
}

impl PostWriteCommand {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            working_directory: None,
            only_if_changed: Vec::new(),
            priority: CommandPriority::Default,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn working_directory(mut self, directory: impl Into<String>) -> Self {
        self.working_directory = Some(directory.into());
        self
    }

    pub fn only_if_changed<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.only_if_changed
            .extend(paths.into_iter().map(Into::into));
        self
    }

    pub fn priority(mut self, priority: CommandPriority) -> Self {
        self.priority = priority;
        self
    }
}

/// Transforms file contents before they enter the virtual file set.
pub trait FileFormatter: Send + Sync {
    fn name(&self) -> &str;

    /// File extensions (without the dot) this formatter handles.
    fn extensions(&self) -> &[&str];

    fn format(&self, path: &str, contents: &str) -> anyhow::Result<String>;
}

/// Formatters by file extension.
#[derive(Clone, Default)]
pub struct Formatters {
    formatters: Vec<Arc<dyn FileFormatter>>,
}

impl Formatters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, formatter: impl FileFormatter + 'static) -> Self {
        self.formatters.push(Arc::new(formatter));
        self
    }

    fn find(&self, path: &str) -> Option<&dyn FileFormatter> {
        let extension = Utf8Path::new(path).extension()?;
        self.formatters
            .iter()
            .find(|formatter| formatter.extensions().contains(&extension))
            .map(Arc::as_ref)
    }

    pub fn apply(&self, path: &str, contents: String) -> Result<String, OutputError> {
        match self.find(path) {
            None => Ok(contents),
            Some(formatter) => {
                formatter
                    .format(path, &contents)
                    .map_err(|source| OutputError::Format {
                        formatter: formatter.name().to_string(),
                        path: path.to_string(),
                        source: source.into(),
                    })
            }
        }
    }
}

impl Debug for Formatters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.formatters.iter().map(|formatter| formatter.name()))
            .finish()
    }
}

/// All files and commands produced by a run.
#[derive(Debug, Clone, Default)]
pub struct GeneratorOutput {
    pub files: BTreeMap<String, FileData>,
    pub post_write_commands: Vec<PostWriteCommand>,
}

impl GeneratorOutput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends another output. Writing a path twice is an error.
    pub fn merge(&mut self, other: GeneratorOutput) -> Result<(), OutputError> {
        for (path, file) in other.files {
            if let Some(existing) = self.files.get(&path) {
                return Err(OutputError::DuplicateFile {
                    path,
                    first: existing.generator.clone(),
                    second: file.generator,
                });
            }
            self.files.insert(path, file);
        }

        self.post_write_commands.extend(other.post_write_commands);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Collects the effects of one task's builder actions.
#[derive(Debug)]
pub struct GeneratorTaskOutputBuilder {
    generator: String,
    base_directory: Utf8PathBuf,
    formatters: Formatters,
    output: GeneratorOutput,
}

impl GeneratorTaskOutputBuilder {
    pub fn new(
        generator: impl Into<String>,
        base_directory: impl Into<Utf8PathBuf>,
        formatters: Formatters,
    ) -> Self {
        Self {
            generator: generator.into(),
            base_directory: base_directory.into(),
            formatters,
            output: GeneratorOutput::new(),
        }
    }

    pub fn generator(&self) -> &str {
        &self.generator
    }

    /// Directory templates and copied files are read from.
    pub fn base_directory(&self) -> &Utf8Path {
        &self.base_directory
    }

    pub fn write_file(
        &mut self,
        destination: &str,
        contents: impl Into<FileContents>,
        options: WriteFileOptions,
        template_metadata: Option<TemplateMetadata>,
    ) -> Result<(), OutputError> {
        let path = normalize_destination(destination)?;
        if self.output.files.contains_key(&path) {
            return Err(OutputError::DuplicateFile {
                path,
                first: self.generator.clone(),
                second: self.generator.clone(),
            });
        }

        let contents = match contents.into() {
            FileContents::Utf8(text) if !options.skip_formatting => {
                FileContents::Utf8(self.formatters.apply(&path, text)?)
            }
            contents => contents,
        };

        tracing::debug!(path = %path, generator = %self.generator, "queued file");

        self.output.files.insert(
            path.clone(),
            FileData {
                id: format!("{}:{}", self.generator, path),
                generator: self.generator.clone(),
                contents,
                options,
                template_metadata,
            },
        );
        Ok(())
    }

    pub fn add_post_write_command(&mut self, command: PostWriteCommand) {
        self.output.post_write_commands.push(command);
    }

    /// Runs an action, wrapping its failure with the action name, this
    /// builder's generator and the action's destination.
    pub fn apply(&mut self, action: &dyn BuilderAction) -> Result<(), ActionError> {
        action.execute(self).map_err(|source| ActionError {
            action: action.name().to_string(),
            generator: self.generator.clone(),
            destination: action.destination().map(str::to_string),
            source: source.into(),
        })
    }

    pub fn finish(self) -> GeneratorOutput {
        self.output
    }
}

/// A deferred side effect collected during a task's build phase.
pub trait BuilderAction: Send + Sync {
    fn name(&self) -> &str;

    fn destination(&self) -> Option<&str> {
        None
    }

    fn execute(&self, builder: &mut GeneratorTaskOutputBuilder) -> anyhow::Result<()>;
}

pub struct WriteFile {
    pub destination: String,
    pub contents: FileContents,
    pub options: WriteFileOptions,
}

impl WriteFile {
    pub fn new(destination: impl Into<String>, contents: impl Into<FileContents>) -> Self {
        Self {
            destination: destination.into(),
            contents: contents.into(),
            options: WriteFileOptions::default(),
        }
    }

    pub fn options(mut self, options: WriteFileOptions) -> Self {
        self.options = options;
        self
    }
}

impl BuilderAction for WriteFile {
    fn name(&self) -> &str {
        "write-file"
    }

    fn destination(&self) -> Option<&str> {
        Some(&self.destination)
    }

    fn execute(&self, builder: &mut GeneratorTaskOutputBuilder) -> anyhow::Result<()> {
        builder.write_file(&self.destination, self.contents.clone(), self.options, None)?;
        Ok(())
    }
}

/// Copies a file from the generator's base directory verbatim.
pub struct CopyFile {
    pub source: Utf8PathBuf,
    pub destination: String,
    pub options: WriteFileOptions,
}

impl CopyFile {
    pub fn new(source: impl Into<Utf8PathBuf>, destination: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            options: WriteFileOptions::default(),
        }
    }

    pub fn options(mut self, options: WriteFileOptions) -> Self {
        self.options = options;
        self
    }
}

impl BuilderAction for CopyFile {
    fn name(&self) -> &str {
        "copy-file"
    }

    fn destination(&self) -> Option<&str> {
        Some(&self.destination)
    }

    fn execute(&self, builder: &mut GeneratorTaskOutputBuilder) -> anyhow::Result<()> {
        let path = builder.base_directory().join(&self.source);
        let bytes = fs::read(&path).map_err(|source| TemplateError::Read {
            path: path.clone(),
            source,
        })?;

        let contents = match String::from_utf8(bytes) {
            Ok(text) => FileContents::Utf8(text),
            Err(err) => FileContents::Binary(err.into_bytes()),
        };

        let options = WriteFileOptions {
            skip_formatting: true,
            ..self.options
        };
        builder.write_file(&self.destination, contents, options, None)?;
        Ok(())
    }
}

/// Renders a [`TemplateFile`] with fragment variables and import maps.
pub struct RenderTemplate {
    pub template: TemplateFile,
    pub destination: String,
    pub variables: BTreeMap<String, CodeFragment>,
    pub import_maps: ImportMapProviders,
    pub options: WriteFileOptions,
    pub render_options: RenderOptions,
}

impl RenderTemplate {
    pub fn new(template: TemplateFile, destination: impl Into<String>) -> Self {
        Self {
            template,
            destination: destination.into(),
            variables: BTreeMap::new(),
            import_maps: ImportMapProviders::new(),
            options: WriteFileOptions::default(),
            render_options: RenderOptions::default(),
        }
    }

    pub fn variable(mut self, name: impl Into<String>, value: impl Into<CodeFragment>) -> Self {
        self.variables.insert(name.into(), value.into());
        self
    }

    pub fn import_maps(mut self, import_maps: ImportMapProviders) -> Self {
        self.import_maps = import_maps;
        self
    }

    pub fn options(mut self, options: WriteFileOptions) -> Self {
        self.options = options;
        self
    }
}

impl BuilderAction for RenderTemplate {
    fn name(&self) -> &str {
        "render-template"
    }

    fn destination(&self) -> Option<&str> {
        Some(&self.destination)
    }

    fn execute(&self, builder: &mut GeneratorTaskOutputBuilder) -> anyhow::Result<()> {
        let rendered = self
            .template
            .render(
                builder.base_directory(),
                &self.variables,
                &self.import_maps,
                &self.render_options,
            )
            .map_err(|source| TemplateError::Render {
                template: self.template.location(),
                generator: builder.generator().to_string(),
                source: Box::new(source),
            })?;

        let metadata = TemplateMetadata {
            name: self.template.name.clone(),
            template: self.template.location(),
            generator: builder.generator().to_string(),
        };

        builder.write_file(&self.destination, rendered, self.options, Some(metadata))?;
        Ok(())
    }
}

/// Renders a plain text template, e.g. a `.env.example` or a Prisma schema
/// block, without import handling.
pub struct RenderText {
    pub template: TemplateFile,
    pub destination: String,
    pub variables: BTreeMap<String, String>,
    pub options: WriteFileOptions,
}

impl RenderText {
    pub fn new(template: TemplateFile, destination: impl Into<String>) -> Self {
        Self {
            template,
            destination: destination.into(),
            variables: BTreeMap::new(),
            options: WriteFileOptions::default(),
        }
    }

    pub fn variable(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(name.into(), value.into());
        self
    }
}

impl BuilderAction for RenderText {
    fn name(&self) -> &str {
        "render-text"
    }

    fn destination(&self) -> Option<&str> {
        Some(&self.destination)
    }

    fn execute(&self, builder: &mut GeneratorTaskOutputBuilder) -> anyhow::Result<()> {
        let raw = self.template.read_source(builder.base_directory())?;
        let rendered = render_text_template(&raw, &self.variables, &RenderOptions::default())
            .map_err(|source| TemplateError::Render {
                template: self.template.location(),
                generator: builder.generator().to_string(),
                source: Box::new(source),
            })?;

        builder.write_file(&self.destination, rendered, self.options, None)?;
        Ok(())
    }
}

pub struct AddPostWriteCommand(pub PostWriteCommand);

impl BuilderAction for AddPostWriteCommand {
    fn name(&self) -> &str {
        "add-post-write-command"
    }

    fn execute(&self, builder: &mut GeneratorTaskOutputBuilder) -> anyhow::Result<()> {
        builder.add_post_write_command(self.0.clone());
        Ok(())
    }
}

type ActionFn = Box<dyn Fn(&mut GeneratorTaskOutputBuilder) -> anyhow::Result<()> + Send + Sync>;

/// An action backed by a closure.
pub struct FnAction {
    name: String,
    destination: Option<String>,
    func: ActionFn,
}

impl FnAction {
    pub fn new<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&mut GeneratorTaskOutputBuilder) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            destination: None,
            func: Box::new(func),
        }
    }

    pub fn destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }
}

impl BuilderAction for FnAction {
    fn name(&self) -> &str {
        &self.name
    }

    fn destination(&self) -> Option<&str> {
        self.destination.as_deref()
    }

    fn execute(&self, builder: &mut GeneratorTaskOutputBuilder) -> anyhow::Result<()> {
        (self.func)(builder)
    }
}
