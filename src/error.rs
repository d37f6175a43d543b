use camino::Utf8PathBuf;
use thiserror::Error;

/// Boxed error used to chain user-land failures (`anyhow` and friends) as a
/// proper `source`.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

fn field_suffix(field: &Option<String>) -> String {
    match field {
        Some(field) => format!(" (field '{field}')"),
        None => String::new(),
    }
}

fn destination_suffix(destination: &Option<String>) -> String {
    match destination {
        Some(destination) => format!(" writing '{destination}'"),
        None => String::new(),
    }
}

/// Problems with the project definition, detected before any task runs.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(
        "invalid descriptor for generator '{generator}' at '{entry}'{}: {message}",
        field_suffix(.field)
    )]
    InvalidDescriptor {
        generator: String,
        entry: String,
        field: Option<String>,
        message: String,
    },

    #[error("generator '{generator}' failed to create its tasks at '{entry}'")]
    Generator {
        generator: String,
        entry: String,
        #[source]
        source: BoxError,
    },

    #[error("unknown generator '{generator}' at '{entry}'")]
    UnknownGenerator { generator: String, entry: String },

    #[error("generator '{0}' is already registered")]
    DuplicateGenerator(String),

    #[error("duplicate generator entry '{0}'")]
    DuplicateEntry(String),

    #[error("duplicate task '{task}' in generator entry '{entry}'")]
    DuplicateTask { entry: String, task: String },

    #[error(
        "capability '{capability}' is already provided by plugin '{existing}', cannot register plugin '{plugin}'"
    )]
    DuplicateCapability {
        capability: String,
        existing: String,
        plugin: String,
    },

    #[error("capability '{0}' has no registered implementation")]
    MissingCapability(String),
}

/// Failures while wiring tasks into a graph. Always fatal, nothing runs.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("dependency '{provider}' not found for task '{task}'")]
    DependencyNotFound {
        task: String,
        key: String,
        provider: String,
    },

    #[error(
        "ambiguous dependency '{provider}' for task '{task}', found {count} candidates: {}",
        .candidates.join(", ")
    )]
    AmbiguousDependency {
        task: String,
        key: String,
        provider: String,
        count: usize,
        candidates: Vec<String>,
    },

    #[error("dependency cycle detected: {}", .path.join(" -> "))]
    Cycle { path: Vec<String> },

    #[error(
        "task '{task}' exports '{provider}' to scope '{scope}' but no enclosing generator declares it"
    )]
    ScopeNotFound {
        task: String,
        provider: String,
        scope: String,
    },

    #[error("task '{task}' exports '{provider}' to its parent but '{entry}' is the root entry")]
    NoParent {
        task: String,
        provider: String,
        entry: String,
    },

    #[error("provider '{provider}' is used with conflicting types '{expected}' and '{found}'")]
    ProviderTypeMismatch {
        provider: String,
        expected: &'static str,
        found: &'static str,
    },
}

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("conflicting default imports from '{module}': '{first}' and '{second}'")]
    ConflictingDefaultImport {
        module: String,
        first: String,
        second: String,
    },

    #[error("import map not found for {specifier}")]
    ImportMapNotFound { specifier: String },

    #[error("import map entry not found for {name} in {specifier}")]
    ImportMapEntryNotFound { name: String, specifier: String },

    #[error("import map {specifier} only supports named imports")]
    ImportMapNamedOnly { specifier: String },

    #[error("malformed import statement: {0}")]
    Malformed(String),

    #[error("unterminated import statement starting at line {0}")]
    Unterminated(usize),
}

#[derive(Debug, Error)]
pub enum FragmentError {
    #[error("hoisted fragment '{key}' was registered twice with different contents")]
    HoistedConflict { key: String },

    #[error("duplicate fragment key '{0}'")]
    DuplicateKey(String),

    #[error("unknown include key '{key}' under '{path}'")]
    UnknownIncludeKey { path: String, key: String },

    #[error("include '{0}' is used both as a value and as a branch")]
    IncludeShape(String),

    #[error(transparent)]
    Import(#[from] ImportError),
}

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error(
        "template variables do not match: expected [{}], provided [{}]",
        .expected.join(", "),
        .provided.join(", ")
    )]
    VariablesMismatch {
        expected: Vec<String>,
        provided: Vec<String>,
    },

    #[error("variable '{0}' is declared but does not appear in the template")]
    VariableNotFound(String),

    #[error("variable '{name}' appears {count} times in the template, expected exactly once")]
    VariableRepeated { name: String, count: usize },

    #[error("invalid variable prefix '{0}'")]
    InvalidPrefix(String),

    #[error("value of variable '{variable}' already appears in the template: {value:?}")]
    ValueCollision { variable: String, value: String },

    #[error("failed to read template '{path}'")]
    Read {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("template '{template}' of generator '{generator}' failed to render")]
    Render {
        template: String,
        generator: String,
        #[source]
        source: Box<TemplateError>,
    },

    #[error(transparent)]
    Fragment(#[from] FragmentError),

    #[error(transparent)]
    Import(#[from] ImportError),
}

#[derive(Debug, Error)]
pub enum OutputError {
    #[error("file '{path}' is written by both '{first}' and '{second}'")]
    DuplicateFile {
        path: String,
        first: String,
        second: String,
    },

    #[error("invalid destination path '{0}'")]
    InvalidPath(String),

    #[error("formatter '{formatter}' failed on '{path}'")]
    Format {
        formatter: String,
        path: String,
        #[source]
        source: BoxError,
    },
}

/// A builder action failed. Carries enough context to find the culprit.
#[derive(Debug, Error)]
#[error(
    "action '{action}' of generator '{generator}' failed{}",
    destination_suffix(.destination)
)]
pub struct ActionError {
    pub action: String,
    pub generator: String,
    pub destination: Option<String>,
    #[source]
    pub source: BoxError,
}

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("task '{task}' failed during run")]
    Run {
        task: String,
        #[source]
        source: BoxError,
    },

    #[error("task '{task}' failed during build")]
    Build {
        task: String,
        #[source]
        source: BoxError,
    },

    #[error("task '{task}' failed while applying builder actions")]
    Action {
        task: String,
        #[source]
        source: ActionError,
    },

    #[error("task '{task}' did not provide '{key}'")]
    MissingProvider { task: String, key: String },

    #[error("task '{task}' provided undeclared '{key}'")]
    UndeclaredProvider { task: String, key: String },

    #[error("task '{task}' provided '{key}' with a value that is not a {expected}")]
    ProviderTypeMismatch {
        task: String,
        key: String,
        expected: &'static str,
    },

    #[error("task '{task}' panicked: {message}")]
    Panic { task: String, message: String },

    #[error(transparent)]
    Output(#[from] OutputError),

    #[error("failed to build worker pool")]
    Pool(#[from] rayon::ThreadPoolBuildError),

    #[error("generation was cancelled")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("failed to read '{path}'")]
    Read {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write '{path}'")]
    Write {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to delete '{path}'")]
    Delete {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid manifest '{path}'")]
    Manifest {
        path: Utf8PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("could not replace snapshot at '{path}'")]
    Snapshot {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid ignore pattern")]
    Ignore(#[from] ignore::Error),

    #[error("invalid glob pattern")]
    Pattern(#[from] glob::PatternError),
}

/// Top-level error for a generation and sync run.
#[derive(Debug, Error)]
pub enum KumitateError {
    #[error("configuration error")]
    Config(#[from] ConfigError),

    #[error("failed to build the task graph")]
    Graph(#[from] GraphError),

    #[error("generation failed")]
    Task(#[from] TaskError),

    #[error("sync failed")]
    Sync(#[from] SyncError),
}
