use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::ImportError;
use crate::fragment::imports::{ImportDeclaration, NamedImport};

/// Prefix marking a module specifier that resolves through an import map.
pub const IMPORT_MAP_PREFIX: char = '$';

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ImportMapEntry {
    pub module_specifier: String,
    #[serde(default)]
    pub is_type_only: bool,
}

/// Symbol to module table exported by a package, so that templates can import
/// `{ prisma } from '$db'` without knowing where `prisma` lives.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportMap {
    imports: BTreeMap<String, ImportMapEntry>,
}

/// Import maps available to a template, keyed by the name following `$`.
pub type ImportMapProviders = BTreeMap<String, ImportMap>;

impl ImportMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a symbol and the module that exports it.
    pub fn register(&mut self, symbol: impl Into<String>, module: impl Into<String>) -> &mut Self {
        self.imports.insert(
            symbol.into(),
            ImportMapEntry {
                module_specifier: module.into(),
                is_type_only: false,
            },
        );
        self
    }

    pub fn register_type(
        &mut self,
        symbol: impl Into<String>,
        module: impl Into<String>,
    ) -> &mut Self {
        self.imports.insert(
            symbol.into(),
            ImportMapEntry {
                module_specifier: module.into(),
                is_type_only: true,
            },
        );
        self
    }

    /// Merge another map into this one. Entries of `other` win.
    pub fn merge(&mut self, other: ImportMap) {
        self.imports.extend(other.imports);
    }

    pub fn get(&self, symbol: &str) -> Option<&ImportMapEntry> {
        self.imports.get(symbol)
    }

    pub fn len(&self) -> usize {
        self.imports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.imports.is_empty()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Rewrites `$key` imports symbol by symbol into imports of real modules.
///
/// Declarations with ordinary specifiers pass through untouched.
pub fn resolve_import_map_specifiers(
    declarations: Vec<ImportDeclaration>,
    providers: &ImportMapProviders,
) -> Result<Vec<ImportDeclaration>, ImportError> {
    let mut resolved = Vec::with_capacity(declarations.len());

    for declaration in declarations {
        let Some(key) = declaration
            .module_specifier
            .strip_prefix(IMPORT_MAP_PREFIX)
        else {
            resolved.push(declaration);
            continue;
        };

        if declaration.default_import.is_some()
            || declaration.namespace_import.is_some()
            || declaration.is_side_effect()
        {
            return Err(ImportError::ImportMapNamedOnly {
                specifier: declaration.module_specifier,
            });
        }

        let map = providers
            .get(key)
            .ok_or_else(|| ImportError::ImportMapNotFound {
                specifier: declaration.module_specifier.clone(),
            })?;

        for named in &declaration.named_imports {
            let entry = map
                .get(&named.name)
                .ok_or_else(|| ImportError::ImportMapEntryNotFound {
                    name: named.name.clone(),
                    specifier: declaration.module_specifier.clone(),
                })?;

            resolved.push(ImportDeclaration {
                named_imports: vec![NamedImport {
                    name: named.name.clone(),
                    alias: named.alias.clone(),
                    is_type_only: named.is_type_only,
                }],
                is_type_only: declaration.is_type_only || entry.is_type_only,
                ..ImportDeclaration::side_effect(&entry.module_specifier)
            });
        }
    }

    Ok(resolved)
}
