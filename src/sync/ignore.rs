use camino::Utf8Path;
use ignore::gitignore::{Gitignore, GitignoreBuilder};

use crate::error::SyncError;

/// Name of the per-package ignore file, in gitignore syntax.
pub const IGNORE_FILE_NAME: &str = ".kumitateignore";

/// Paths never touched by reconciliation.
pub const DEFAULT_IGNORE_PATTERNS: &[&str] = &[
    ".env",
    ".env.*",
    "node_modules/",
    "dist/",
    "build/",
    ".turbo/",
    ".next/",
    "coverage/",
    "*.log",
    ".DS_Store",
    ".git/",
    ".idea/",
    ".vscode/",
    "prisma/migrations/",
    "pnpm-lock.yaml",
    "package-lock.json",
    "yarn.lock",
    "*.tsbuildinfo",
];

/// Gitignore matcher over package-relative paths.
#[derive(Debug, Clone)]
pub struct IgnoreMatcher {
    gitignore: Gitignore,
}

impl IgnoreMatcher {
    /// Matcher with only the default patterns.
    pub fn defaults() -> Result<Self, SyncError> {
        let builder = default_builder(Utf8Path::new(""))?;
        Ok(Self {
            gitignore: builder.build()?,
        })
    }

    /// Default patterns extended with the package's ignore file, if any.
    pub fn load(package_directory: &Utf8Path) -> Result<Self, SyncError> {
        let mut builder = default_builder(package_directory)?;

        let ignore_file = package_directory.join(IGNORE_FILE_NAME);
        if ignore_file.is_file() {
            if let Some(err) = builder.add(&ignore_file) {
                return Err(err.into());
            }
            tracing::debug!(path = %ignore_file, "loaded ignore file");
        }

        Ok(Self {
            gitignore: builder.build()?,
        })
    }

    /// Whether a package-relative path is excluded from reconciliation.
    pub fn is_ignored(&self, relative_path: &str) -> bool {
        let path = Utf8Path::new(relative_path);
        self.gitignore
            .matched_path_or_any_parents(path, false)
            .is_ignore()
    }
}

fn default_builder(root: &Utf8Path) -> Result<GitignoreBuilder, SyncError> {
    let mut builder = GitignoreBuilder::new(root);
    for pattern in DEFAULT_IGNORE_PATTERNS {
        builder.add_line(None, pattern)?;
    }
    Ok(builder)
}

#[cfg(test)]
mod tests {
    use camino::Utf8PathBuf;

    use super::*;

    #[test]
    fn test_default_patterns() {
        let matcher = IgnoreMatcher::defaults().unwrap();

        for path in [
            ".env",
            ".env.local",
            "node_modules/x",
            "dist/y.js",
            "prisma/migrations/20240101000000_init/migration.sql",
            "apps/web/tsconfig.tsbuildinfo",
        ] {
            assert!(matcher.is_ignored(path), "{path} should be ignored");
        }

        for path in ["src/file.ts", "prisma/schema.prisma", "package.json"] {
            assert!(!matcher.is_ignored(path), "{path} should not be ignored");
        }
    }

    #[test]
    fn test_ignore_file_extends_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        std::fs::write(root.join(IGNORE_FILE_NAME), "src/generated/\n*.snap\n").unwrap();

        let matcher = IgnoreMatcher::load(&root).unwrap();
        assert!(matcher.is_ignored("src/generated/graphql.ts"));
        assert!(matcher.is_ignored("tests/__snapshots__/app.snap"));
        assert!(matcher.is_ignored(".env"));
        assert!(!matcher.is_ignored("src/index.ts"));
    }

    #[test]
    fn test_missing_ignore_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();

        let matcher = IgnoreMatcher::load(&root).unwrap();
        assert!(matcher.is_ignored("node_modules/react/index.js"));
        assert!(!matcher.is_ignored("src/index.ts"));
    }
}
