//! Code fragments and the algorithms merging them.
//!
//! A [`CodeFragment`] is a piece of generated source text together with the
//! imports it needs and the declarations that must be hoisted above its point
//! of use. Fragments from many tasks are merged into arrays, objects or
//! statement blocks, and finally rendered into a template.
//!
//! Merges that take keyed input sort by key first, so the output never
//! depends on the iteration order of the caller's map.

pub mod importmap;
pub mod imports;
pub mod template;

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::FragmentError;
use crate::fragment::imports::{ImportDeclaration, NamedImport, merge_import_declarations};

static IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_$][\w$]*$").expect("valid identifier regex"));

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HoistPosition {
    BeforeImports,
    #[default]
    AfterImports,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HoistedFragment {
    pub key: String,
    pub fragment: CodeFragment,
    #[serde(default)]
    pub position: HoistPosition,
}

impl HoistedFragment {
    pub fn new(key: impl Into<String>, fragment: impl Into<CodeFragment>) -> Self {
        Self {
            key: key.into(),
            fragment: fragment.into(),
            position: HoistPosition::AfterImports,
        }
    }

    pub fn before_imports(mut self) -> Self {
        self.position = HoistPosition::BeforeImports;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeFragment {
    pub contents: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub imports: Vec<ImportDeclaration>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hoisted: Vec<HoistedFragment>,
}

impl CodeFragment {
    pub fn new(contents: impl Into<String>) -> Self {
        Self {
            contents: contents.into(),
            imports: Vec::new(),
            hoisted: Vec::new(),
        }
    }

    pub fn with_import(mut self, import: ImportDeclaration) -> Self {
        self.imports.push(import);
        self
    }

    pub fn with_imports(mut self, imports: impl IntoIterator<Item = ImportDeclaration>) -> Self {
        self.imports.extend(imports);
        self
    }

    pub fn with_hoisted(mut self, hoisted: HoistedFragment) -> Self {
        self.hoisted.push(hoisted);
        self
    }

    /// Replaces the text, keeping imports and hoisted fragments.
    pub fn map_contents(mut self, f: impl FnOnce(String) -> String) -> Self {
        self.contents = f(self.contents);
        self
    }
}

impl From<&str> for CodeFragment {
    fn from(value: &str) -> Self {
        CodeFragment::new(value)
    }
}

impl From<String> for CodeFragment {
    fn from(value: String) -> Self {
        CodeFragment::new(value)
    }
}

/// A fragment referencing a single named export, e.g. `Button` from
/// `@/components/button`.
pub fn import_fragment(name: &str, module: &str) -> CodeFragment {
    CodeFragment::new(name).with_import(ImportDeclaration::named(module, [name]))
}

pub fn type_import_fragment(name: &str, module: &str) -> CodeFragment {
    CodeFragment::new(name).with_import(ImportDeclaration::type_named(module, [name]))
}

/// Collects hoisted fragments, lifting nested ones to the top level.
///
/// The same key twice is allowed only with identical contents.
pub fn flatten_hoisted<'a, I>(hoisted: I) -> Result<Vec<HoistedFragment>, FragmentError>
where
    I: IntoIterator<Item = &'a HoistedFragment>,
{
    let mut seen: BTreeMap<String, HoistedFragment> = BTreeMap::new();
    let mut order = Vec::new();
    let mut stack: Vec<&HoistedFragment> = hoisted.into_iter().collect();
    stack.reverse();

    while let Some(item) = stack.pop() {
        stack.extend(item.fragment.hoisted.iter().rev());

        let flat = HoistedFragment {
            key: item.key.clone(),
            fragment: CodeFragment {
                hoisted: Vec::new(),
                ..item.fragment.clone()
            },
            position: item.position,
        };

        match seen.entry(item.key.clone()) {
            Entry::Vacant(entry) => {
                order.push(item.key.clone());
                entry.insert(flat);
            }
            Entry::Occupied(entry) => {
                if *entry.get() != flat {
                    return Err(FragmentError::HoistedConflict {
                        key: item.key.clone(),
                    });
                }
            }
        }
    }

    Ok(order
        .into_iter()
        .filter_map(|key| seen.remove(&key))
        .collect())
}

fn merge_parts<'a, I>(
    fragments: I,
) -> Result<(Vec<ImportDeclaration>, Vec<HoistedFragment>), FragmentError>
where
    I: IntoIterator<Item = &'a CodeFragment> + Clone,
{
    let imports = fragments
        .clone()
        .into_iter()
        .flat_map(|fragment| fragment.imports.iter().cloned());
    let imports = merge_import_declarations(imports)?;
    let hoisted = flatten_hoisted(fragments.into_iter().flat_map(|f| f.hoisted.iter()))?;
    Ok((imports, hoisted))
}

fn sorted_by_key<K, V, I>(fragments: I) -> Result<Vec<(String, V)>, FragmentError>
where
    K: Into<String>,
    I: IntoIterator<Item = (K, V)>,
{
    let mut sorted = BTreeMap::new();
    for (key, value) in fragments {
        let key = key.into();
        if sorted.contains_key(&key) {
            return Err(FragmentError::DuplicateKey(key));
        }
        sorted.insert(key, value);
    }
    Ok(sorted.into_iter().collect())
}

/// Joins fragments with `separator` in the given order.
pub fn merge_fragments_presorted<I>(fragments: I, separator: &str) -> Result<CodeFragment, FragmentError>
where
    I: IntoIterator<Item = CodeFragment>,
{
    let fragments: Vec<CodeFragment> = fragments.into_iter().collect();
    let (imports, hoisted) = merge_parts(&fragments)?;
    let contents = fragments
        .iter()
        .map(|fragment| fragment.contents.as_str())
        .collect::<Vec<_>>()
        .join(separator);

    Ok(CodeFragment {
        contents,
        imports,
        hoisted,
    })
}

/// Joins fragments with `separator`, ordered by key.
pub fn merge_fragments<K, I>(fragments: I, separator: &str) -> Result<CodeFragment, FragmentError>
where
    K: Into<String>,
    I: IntoIterator<Item = (K, CodeFragment)>,
{
    let sorted = sorted_by_key(fragments)?;
    merge_fragments_presorted(sorted.into_iter().map(|(_, fragment)| fragment), separator)
}

/// Emits an array literal of the fragments in the given order.
pub fn merge_fragments_as_array_presorted<I>(fragments: I) -> Result<CodeFragment, FragmentError>
where
    I: IntoIterator<Item = CodeFragment>,
{
    merge_fragments_presorted(fragments, ",\n").map(|merged| {
        merged.map_contents(|contents| format!("[{contents}]"))
    })
}

/// Emits an array literal of the fragments ordered by key.
pub fn merge_fragments_as_array<K, I>(fragments: I) -> Result<CodeFragment, FragmentError>
where
    K: Into<String>,
    I: IntoIterator<Item = (K, CodeFragment)>,
{
    let sorted = sorted_by_key(fragments)?;
    merge_fragments_as_array_presorted(sorted.into_iter().map(|(_, fragment)| fragment))
}

fn object_key(key: &str) -> String {
    if IDENTIFIER.is_match(key) {
        key.to_string()
    } else {
        format!("'{}'", key.replace('\\', "\\\\").replace('\'', "\\'"))
    }
}

/// Emits an object literal ordered by key, skipping `None` entries.
///
/// An entry whose contents equal its key uses the shorthand form. Keys
/// starting with `...` spread their contents.
pub fn merge_fragments_as_object<K, I>(fragments: I) -> Result<CodeFragment, FragmentError>
where
    K: Into<String>,
    I: IntoIterator<Item = (K, Option<CodeFragment>)>,
{
    let sorted = sorted_by_key(fragments)?;
    let present: Vec<(String, CodeFragment)> = sorted
        .into_iter()
        .filter_map(|(key, fragment)| fragment.map(|fragment| (key, fragment)))
        .collect();

    let (imports, hoisted) = merge_parts(present.iter().map(|(_, fragment)| fragment))?;
    let entries: Vec<String> = present
        .iter()
        .map(|(key, fragment)| {
            if key.starts_with("...") {
                format!("...{}", fragment.contents)
            } else if *key == fragment.contents && IDENTIFIER.is_match(key) {
                key.clone()
            } else {
                format!("{}: {}", object_key(key), fragment.contents)
            }
        })
        .collect();

    Ok(CodeFragment {
        contents: format!("{{{}}}", entries.join(",\n")),
        imports,
        hoisted,
    })
}

/// Canonical form for comparing fragments regardless of merge order.
pub fn normalize_fragment(fragment: &CodeFragment) -> CodeFragment {
    let mut imports = fragment.imports.clone();
    for import in &mut imports {
        import.named_imports.sort_by(compare_named);
    }
    imports.sort_by(|a, b| {
        a.module_specifier
            .cmp(&b.module_specifier)
            .then_with(|| import_kind(a).cmp(&import_kind(b)))
            .then_with(|| a.is_type_only.cmp(&b.is_type_only))
    });

    let mut hoisted: Vec<HoistedFragment> = fragment
        .hoisted
        .iter()
        .map(|item| HoistedFragment {
            fragment: normalize_fragment(&item.fragment),
            ..item.clone()
        })
        .collect();
    hoisted.sort_by(|a, b| a.key.cmp(&b.key));

    CodeFragment {
        contents: fragment.contents.clone(),
        imports,
        hoisted,
    }
}

fn compare_named(a: &NamedImport, b: &NamedImport) -> std::cmp::Ordering {
    a.name
        .cmp(&b.name)
        .then_with(|| a.alias.cmp(&b.alias))
        .then_with(|| a.is_type_only.cmp(&b.is_type_only))
}

fn import_kind(import: &ImportDeclaration) -> u8 {
    if import.namespace_import.is_some() {
        0
    } else if import.default_import.is_some() {
        1
    } else if import.named_imports.is_empty() {
        3
    } else {
        2
    }
}
