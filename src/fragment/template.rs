//! Template files with `TPL_` placeholders.
//!
//! Every declared variable must appear exactly once in the template text, and
//! no provided value may already appear verbatim in it. Both rules keep a
//! rendered file unambiguous, so a template can later be recovered from it.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::TemplateError;
use crate::fragment::importmap::{ImportMapProviders, resolve_import_map_specifiers};
use crate::fragment::imports::{SourceFile, merge_import_declarations, render_import_declarations};
use crate::fragment::{CodeFragment, HoistPosition, flatten_hoisted};

pub const DEFAULT_VARIABLE_PREFIX: &str = "TPL_";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TemplateSource {
    /// Relative to the generator's base directory, read when rendered.
    Path(Utf8PathBuf),
    Contents(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateFile {
    pub name: String,
    pub source: TemplateSource,
    #[serde(default)]
    pub variables: BTreeMap<String, VariableSpec>,
    #[serde(default)]
    pub import_map_providers: Vec<String>,
}

impl TemplateFile {
    pub fn from_path(name: impl Into<String>, path: impl Into<Utf8PathBuf>) -> Self {
        Self {
            name: name.into(),
            source: TemplateSource::Path(path.into()),
            variables: BTreeMap::new(),
            import_map_providers: Vec::new(),
        }
    }

    pub fn from_contents(name: impl Into<String>, contents: impl Into<String>) -> Self {
        Self {
            source: TemplateSource::Contents(contents.into()),
            ..Self::from_path(name, Utf8PathBuf::new())
        }
    }

    pub fn variable(mut self, name: impl Into<String>) -> Self {
        self.variables.insert(name.into(), VariableSpec::default());
        self
    }

    pub fn described_variable(
        mut self,
        name: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        self.variables.insert(
            name.into(),
            VariableSpec {
                description: Some(description.into()),
            },
        );
        self
    }

    pub fn import_map_provider(mut self, key: impl Into<String>) -> Self {
        self.import_map_providers.push(key.into());
        self
    }

    /// A printable location of the template, used in errors and metadata.
    pub fn location(&self) -> String {
        match &self.source {
            TemplateSource::Path(path) => path.to_string(),
            TemplateSource::Contents(_) => format!("<inline:{}>", self.name),
        }
    }

    pub fn read_source(&self, base_directory: &Utf8Path) -> Result<String, TemplateError> {
        match &self.source {
            TemplateSource::Contents(contents) => Ok(contents.clone()),
            TemplateSource::Path(path) => {
                let path = base_directory.join(path);
                fs::read_to_string(&path).map_err(|source| TemplateError::Read { path, source })
            }
        }
    }

    /// Reads and renders the template, checking provided variables against
    /// the declared ones.
    pub fn render(
        &self,
        base_directory: &Utf8Path,
        variables: &BTreeMap<String, CodeFragment>,
        import_maps: &ImportMapProviders,
        options: &RenderOptions,
    ) -> Result<String, TemplateError> {
        check_keys(self.variables.keys(), variables.keys())?;

        let raw = self.read_source(base_directory)?;
        let placeholders = options.placeholders(&raw)?;
        for name in self.variables.keys() {
            if !placeholders.contains_key(name) {
                return Err(TemplateError::VariableNotFound(name.clone()));
            }
        }

        let import_maps: ImportMapProviders = import_maps
            .iter()
            .filter(|(key, _)| self.import_map_providers.contains(key))
            .map(|(key, map)| (key.clone(), map.clone()))
            .collect();

        render_template(&raw, variables, &import_maps, options)
    }
}

#[derive(Debug, Clone)]
pub struct RenderOptions {
    pub prefix: String,
    /// Reject values that already appear verbatim in the template.
    pub check_collisions: bool,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_VARIABLE_PREFIX.to_string(),
            check_collisions: true,
        }
    }
}

impl RenderOptions {
    fn placeholder_regex(&self) -> Result<Regex, TemplateError> {
        let pattern = format!(r"\b{}\w+", regex::escape(&self.prefix));
        Regex::new(&pattern).map_err(|_| TemplateError::InvalidPrefix(self.prefix.clone()))
    }

    /// Placeholder names found in `raw` with their occurrence counts.
    fn placeholders(&self, raw: &str) -> Result<BTreeMap<String, usize>, TemplateError> {
        let mut counts = BTreeMap::new();
        for found in self.placeholder_regex()?.find_iter(raw) {
            *counts.entry(found.as_str().to_string()).or_insert(0) += 1;
        }
        Ok(counts)
    }
}

fn check_keys<'a>(
    expected: impl Iterator<Item = &'a String>,
    provided: impl Iterator<Item = &'a String>,
) -> Result<(), TemplateError> {
    let expected: BTreeSet<&String> = expected.collect();
    let provided: BTreeSet<&String> = provided.collect();

    if expected != provided {
        return Err(TemplateError::VariablesMismatch {
            expected: expected.into_iter().cloned().collect(),
            provided: provided.into_iter().cloned().collect(),
        });
    }
    Ok(())
}

/// Substitutes placeholders and collects the imports and hoisted fragments of
/// the substituted values.
///
/// The placeholders present in `raw` must match the keys of `variables`
/// exactly, and each must occur once. Replacement is a single pass, so
/// substituted text is never scanned for placeholders.
pub fn render_template_fragment(
    raw: &str,
    variables: &BTreeMap<String, CodeFragment>,
    options: &RenderOptions,
) -> Result<CodeFragment, TemplateError> {
    let placeholders = options.placeholders(raw)?;
    check_keys(placeholders.keys(), variables.keys())?;

    for (name, &count) in &placeholders {
        if count != 1 {
            return Err(TemplateError::VariableRepeated {
                name: name.clone(),
                count,
            });
        }
    }

    let regex = options.placeholder_regex()?;

    if options.check_collisions {
        // Placeholder tokens are not template text.
        let text = regex.replace_all(raw, "\0");
        for (name, fragment) in variables {
            let value = fragment.contents.trim();
            if !value.is_empty() && text.contains(value) {
                return Err(TemplateError::ValueCollision {
                    variable: name.clone(),
                    value: value.to_string(),
                });
            }
        }
    }

    let contents = regex
        .replace_all(raw, |captures: &regex::Captures| {
            variables
                .get(&captures[0])
                .map(|fragment| fragment.contents.clone())
                .unwrap_or_default()
        })
        .into_owned();

    let imports = variables
        .values()
        .flat_map(|fragment| fragment.imports.iter().cloned())
        .collect();
    let hoisted = flatten_hoisted(variables.values().flat_map(|f| f.hoisted.iter()))?;

    Ok(CodeFragment {
        contents,
        imports,
        hoisted,
    })
}

/// Renders a template into final source text.
///
/// Imports written in the template are parsed out, merged with the imports of
/// the substituted fragments, resolved through `import_maps` and re-inserted
/// as one sorted block after the prologue. Hoisted fragments are placed right
/// before or after that block.
pub fn render_template(
    raw: &str,
    variables: &BTreeMap<String, CodeFragment>,
    import_maps: &ImportMapProviders,
    options: &RenderOptions,
) -> Result<String, TemplateError> {
    let fragment = render_template_fragment(raw, variables, options)?;
    let source = SourceFile::parse(&fragment.contents)?;

    let mut hoisted = fragment.hoisted;
    hoisted.sort_by(|a, b| a.key.cmp(&b.key));

    let imports = source
        .imports
        .iter()
        .cloned()
        .chain(fragment.imports)
        .chain(hoisted.iter().flat_map(|h| h.fragment.imports.iter().cloned()))
        .collect();
    let imports = resolve_import_map_specifiers(imports, import_maps)?;
    let imports = merge_import_declarations(imports)?;

    let (before, after): (Vec<_>, Vec<_>) = hoisted
        .iter()
        .partition(|h| h.position == HoistPosition::BeforeImports);
    let before: Vec<String> = before.iter().map(|h| h.fragment.contents.clone()).collect();
    let after: Vec<String> = after.iter().map(|h| h.fragment.contents.clone()).collect();

    Ok(source.render(&before, &render_import_declarations(&imports), &after))
}

/// Renders a plain text template without any import handling.
pub fn render_text_template(
    raw: &str,
    variables: &BTreeMap<String, String>,
    options: &RenderOptions,
) -> Result<String, TemplateError> {
    let variables = variables
        .iter()
        .map(|(name, value)| (name.clone(), CodeFragment::new(value.as_str())))
        .collect();
    render_template_fragment(raw, &variables, options).map(|fragment| fragment.contents)
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::error::ImportError;
    use crate::fragment::importmap::ImportMap;
    use crate::fragment::imports::ImportDeclaration;
    use crate::fragment::{HoistedFragment, import_fragment};

    fn vars<const N: usize>(items: [(&str, CodeFragment); N]) -> BTreeMap<String, CodeFragment> {
        items
            .into_iter()
            .map(|(name, fragment)| (name.to_string(), fragment))
            .collect()
    }

    #[test]
    fn test_round_trip_locates_every_value() {
        let raw = "export const TPL_NAME = TPL_VALUE;\n";
        let variables = vars([
            ("TPL_NAME", CodeFragment::new("userSchema")),
            ("TPL_VALUE", CodeFragment::new("z.object({ id: z.string() })")),
        ]);

        let rendered = render_template_fragment(raw, &variables, &RenderOptions::default()).unwrap();
        for fragment in variables.values() {
            assert!(rendered.contents.contains(&fragment.contents));
        }
        assert_eq!(
            rendered.contents,
            "export const userSchema = z.object({ id: z.string() });\n"
        );
    }

    #[test]
    fn test_variables_mismatch() {
        let raw = "const TPL_A = 1;";
        let err = render_template_fragment(
            raw,
            &vars([("TPL_A", "a".into()), ("TPL_B", "b".into())]),
            &RenderOptions::default(),
        )
        .unwrap_err();

        match err {
            TemplateError::VariablesMismatch { expected, provided } => {
                assert_eq!(expected, ["TPL_A"]);
                assert_eq!(provided, ["TPL_A", "TPL_B"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_variable_repeated() {
        let err = render_template_fragment(
            "TPL_A + TPL_A",
            &vars([("TPL_A", "x".into())]),
            &RenderOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, TemplateError::VariableRepeated { count: 2, .. }));
    }

    #[test]
    fn test_value_inside_placeholder_is_not_a_collision() {
        let rendered = render_template_fragment(
            "export const TPL_NAME = 1;",
            &vars([("TPL_NAME", "NAME".into())]),
            &RenderOptions::default(),
        )
        .unwrap();
        assert_eq!(rendered.contents, "export const NAME = 1;");
    }

    #[test]
    fn test_value_collision() {
        let err = render_template_fragment(
            "const user = TPL_NAME;",
            &vars([("TPL_NAME", "user".into())]),
            &RenderOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, TemplateError::ValueCollision { variable, .. } if variable == "TPL_NAME"));

        let options = RenderOptions {
            check_collisions: false,
            ..Default::default()
        };
        let rendered = render_template_fragment(
            "const user = TPL_NAME;",
            &vars([("TPL_NAME", "user".into())]),
            &options,
        )
        .unwrap();
        assert_eq!(rendered.contents, "const user = user;");
    }

    #[test]
    fn test_substitution_is_single_pass() {
        let rendered = render_template_fragment(
            "a(TPL_A); b(TPL_B);",
            &vars([("TPL_A", "TPL_B".into()), ("TPL_B", "2".into())]),
            &RenderOptions {
                check_collisions: false,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(rendered.contents, "a(TPL_B); b(2);");
    }

    #[test]
    fn test_render_template_rebuilds_imports() {
        let raw = "\
'use client';

import { useState } from 'react';
import { prisma } from '$db';

export function TPL_COMPONENT() {
  const [state] = useState(TPL_INITIAL);
  return prisma;
}
";
        let mut db = ImportMap::new();
        db.register("prisma", "@/services/prisma");
        let maps = ImportMapProviders::from([("db".to_string(), db)]);

        let variables = vars([
            ("TPL_COMPONENT", CodeFragment::new("UserList")),
            (
                "TPL_INITIAL",
                CodeFragment::new("defaultUsers()")
                    .with_import(ImportDeclaration::named("./defaults", ["defaultUsers"]))
                    .with_import(ImportDeclaration::named("react", ["useState"]))
                    .with_hoisted(HoistedFragment::new(
                        "banner",
                        CodeFragment::new("// generated"),
                    ).before_imports())
                    .with_hoisted(HoistedFragment::new(
                        "limit",
                        CodeFragment::new("const LIMIT = 10;"),
                    )),
            ),
        ]);

        let rendered =
            render_template(raw, &variables, &maps, &RenderOptions::default()).unwrap();
        assert_eq!(
            rendered,
            "'use client';\n\n\
             // generated\n\n\
             import { useState } from 'react';\n\
             import { prisma } from '@/services/prisma';\n\
             import { defaultUsers } from './defaults';\n\n\
             const LIMIT = 10;\n\n\
             export function UserList() {\n  const [state] = useState(defaultUsers());\n  return prisma;\n}\n"
        );
    }

    #[test]
    fn test_render_template_missing_import_map() {
        let err = render_template(
            "import { prisma } from '$db';\nTPL_X",
            &vars([("TPL_X", import_fragment("x", "./x"))]),
            &ImportMapProviders::new(),
            &RenderOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            TemplateError::Import(ImportError::ImportMapNotFound { .. })
        ));
    }

    #[test]
    fn test_template_file_from_path() {
        let dir = TempDir::new().unwrap();
        let base = Utf8Path::from_path(dir.path()).unwrap();
        fs::create_dir_all(base.join("templates")).unwrap();
        fs::write(base.join("templates/route.ts"), "export const route = TPL_PATH;\n").unwrap();

        let template = TemplateFile::from_path("route", "templates/route.ts").variable("TPL_PATH");
        let rendered = template
            .render(
                base,
                &vars([("TPL_PATH", "'/users'".into())]),
                &ImportMapProviders::new(),
                &RenderOptions::default(),
            )
            .unwrap();
        assert_eq!(rendered, "export const route = '/users';\n");

        let missing = TemplateFile::from_path("missing", "templates/missing.ts");
        assert!(matches!(
            missing.read_source(base).unwrap_err(),
            TemplateError::Read { .. }
        ));
    }

    #[test]
    fn test_template_file_declared_variable_missing_from_text() {
        let template = TemplateFile::from_contents("inline", "const a = 1;").variable("TPL_A");
        let err = template
            .render(
                Utf8Path::new("."),
                &vars([("TPL_A", "x".into())]),
                &ImportMapProviders::new(),
                &RenderOptions::default(),
            )
            .unwrap_err();
        assert!(matches!(err, TemplateError::VariableNotFound(name) if name == "TPL_A"));
    }

    #[test]
    fn test_render_text_template() {
        let variables = BTreeMap::from([("TPL_PORT".to_string(), "3000".to_string())]);
        let rendered =
            render_text_template("PORT=TPL_PORT\n", &variables, &RenderOptions::default()).unwrap();
        assert_eq!(rendered, "PORT=3000\n");
    }
}
