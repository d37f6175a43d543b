//! Import declarations: model, merging, ordering, rendering and parsing.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ImportError;

/// Modules shipped with Node that may be imported without the `node:` prefix.
const NODE_BUILTINS: &[&str] = &[
    "assert",
    "buffer",
    "child_process",
    "crypto",
    "dns",
    "events",
    "fs",
    "http",
    "https",
    "module",
    "net",
    "os",
    "path",
    "process",
    "querystring",
    "readline",
    "stream",
    "string_decoder",
    "timers",
    "tls",
    "url",
    "util",
    "vm",
    "worker_threads",
    "zlib",
];

static IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_$][\w$]*$").expect("valid identifier regex"));

static IMPORT_FROM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)^import\s+(.+?)\s*from\s*(['"])([^'"]+)['"]\s*;?\s*$"#)
        .expect("valid import regex")
});

static IMPORT_SIDE_EFFECT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^import\s*(['"])([^'"]+)['"]\s*;?\s*$"#).expect("valid import regex")
});

static IMPORT_START: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^import(\s+[\w${*'"]|\s*[{*'"])"#).expect("valid import regex")
});

static DIRECTIVE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^(['"])use [\w ]+['"]\s*;?\s*$"#).expect("valid directive regex")
});

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NamedImport {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(default)]
    pub is_type_only: bool,
}

impl NamedImport {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            alias: None,
            is_type_only: false,
        }
    }

    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn type_only(mut self) -> Self {
        self.is_type_only = true;
        self
    }

    /// The local binding this import introduces.
    pub fn local_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImportDeclaration {
    pub module_specifier: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_import: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace_import: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub named_imports: Vec<NamedImport>,
    #[serde(default)]
    pub is_type_only: bool,
}

impl ImportDeclaration {
    /// `import 'module';`
    pub fn side_effect(module: impl Into<String>) -> Self {
        Self {
            module_specifier: module.into(),
            default_import: None,
            namespace_import: None,
            named_imports: Vec::new(),
            is_type_only: false,
        }
    }

    pub fn named<I, S>(module: impl Into<String>, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            named_imports: names.into_iter().map(NamedImport::new).collect(),
            ..Self::side_effect(module)
        }
    }

    /// `import type { ... } from 'module';`
    pub fn type_named<I, S>(module: impl Into<String>, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            is_type_only: true,
            ..Self::named(module, names)
        }
    }

    pub fn default(module: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            default_import: Some(name.into()),
            ..Self::side_effect(module)
        }
    }

    pub fn namespace(module: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace_import: Some(name.into()),
            ..Self::side_effect(module)
        }
    }

    pub fn with_named(mut self, named: NamedImport) -> Self {
        self.named_imports.push(named);
        self
    }

    pub fn is_side_effect(&self) -> bool {
        self.default_import.is_none()
            && self.namespace_import.is_none()
            && self.named_imports.is_empty()
    }

    fn kind_rank(&self) -> u8 {
        match (self.is_side_effect(), self.namespace_import.is_some(), self.is_type_only) {
            (true, _, _) => 0,
            (_, true, _) => 1,
            (_, _, false) => 2,
            (_, _, true) => 3,
        }
    }
}

/// Position of a module specifier in the sorted import block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ImportGroup {
    Builtin,
    External,
    Internal,
    Parent,
    Sibling,
}

impl ImportGroup {
    pub fn of(specifier: &str) -> Self {
        if specifier.starts_with("node:") {
            return ImportGroup::Builtin;
        }

        if specifier == ".." || specifier.starts_with("../") {
            return ImportGroup::Parent;
        }

        if specifier == "." || specifier.starts_with("./") {
            return ImportGroup::Sibling;
        }

        let internal = ["@/", "~/", "#", "/"];
        if internal.iter().any(|prefix| specifier.starts_with(prefix)) {
            return ImportGroup::Internal;
        }

        let head = specifier.split('/').next().unwrap_or(specifier);
        if NODE_BUILTINS.contains(&head) {
            ImportGroup::Builtin
        } else {
            ImportGroup::External
        }
    }
}

fn compare_declarations(a: &ImportDeclaration, b: &ImportDeclaration) -> Ordering {
    ImportGroup::of(&a.module_specifier)
        .cmp(&ImportGroup::of(&b.module_specifier))
        .then_with(|| a.module_specifier.cmp(&b.module_specifier))
        .then_with(|| a.kind_rank().cmp(&b.kind_rank()))
        .then_with(|| a.default_import.cmp(&b.default_import))
        .then_with(|| a.namespace_import.cmp(&b.namespace_import))
}

/// Sorts declarations into groups (builtin, external, internal, parent,
/// sibling), then by module specifier and kind.
pub fn sort_import_declarations(declarations: &mut [ImportDeclaration]) {
    for declaration in declarations.iter_mut() {
        declaration.named_imports.sort();
    }
    declarations.sort_by(compare_declarations);
}

#[derive(Default)]
struct ModuleImports {
    default_import: Option<(String, bool)>,
    namespaces: BTreeMap<String, bool>,
    named: BTreeMap<(String, Option<String>), bool>,
    side_effect: bool,
}

/// Merges declarations so that each module is imported once.
///
/// A symbol imported both as a value and as a type ends up as a value import.
/// Namespace imports keep their own declaration. The result is sorted.
pub fn merge_import_declarations<I>(declarations: I) -> Result<Vec<ImportDeclaration>, ImportError>
where
    I: IntoIterator<Item = ImportDeclaration>,
{
    let mut modules: BTreeMap<String, ModuleImports> = BTreeMap::new();

    for declaration in declarations {
        let module = modules
            .entry(declaration.module_specifier.clone())
            .or_default();

        if declaration.is_side_effect() {
            module.side_effect = true;
            continue;
        }

        if let Some(name) = declaration.default_import {
            match &mut module.default_import {
                None => module.default_import = Some((name, declaration.is_type_only)),
                Some((existing, type_only)) if *existing == name => {
                    *type_only &= declaration.is_type_only;
                }
                Some((existing, _)) => {
                    return Err(ImportError::ConflictingDefaultImport {
                        module: declaration.module_specifier,
                        first: existing.clone(),
                        second: name,
                    });
                }
            }
        }

        if let Some(name) = declaration.namespace_import {
            let type_only = module.namespaces.entry(name).or_insert(true);
            *type_only &= declaration.is_type_only;
        }

        for named in declaration.named_imports {
            let type_only = module
                .named
                .entry((named.name, named.alias))
                .or_insert(true);
            *type_only &= declaration.is_type_only || named.is_type_only;
        }
    }

    let mut merged = Vec::new();
    for (specifier, module) in modules {
        let named: Vec<NamedImport> = module
            .named
            .into_iter()
            .map(|((name, alias), is_type_only)| NamedImport {
                name,
                alias,
                is_type_only,
            })
            .collect();
        let all_types = named.iter().all(|named| named.is_type_only);
        let mut emitted = Vec::new();

        match module.default_import {
            Some((default, false)) => emitted.push(ImportDeclaration {
                default_import: Some(default),
                named_imports: named,
                ..ImportDeclaration::side_effect(&specifier)
            }),
            default => {
                if let Some((default, _)) = default {
                    emitted.push(ImportDeclaration {
                        default_import: Some(default),
                        is_type_only: true,
                        ..ImportDeclaration::side_effect(&specifier)
                    });
                }
                if !named.is_empty() && all_types {
                    emitted.push(ImportDeclaration {
                        named_imports: named
                            .into_iter()
                            .map(|named| NamedImport {
                                is_type_only: false,
                                ..named
                            })
                            .collect(),
                        is_type_only: true,
                        ..ImportDeclaration::side_effect(&specifier)
                    });
                } else if !named.is_empty() {
                    emitted.push(ImportDeclaration {
                        named_imports: named,
                        ..ImportDeclaration::side_effect(&specifier)
                    });
                }
            }
        }

        for (namespace, is_type_only) in module.namespaces {
            emitted.push(ImportDeclaration {
                namespace_import: Some(namespace),
                is_type_only,
                ..ImportDeclaration::side_effect(&specifier)
            });
        }

        // A type-only import is erased at compile time, so it does not load
        // the module.
        if module.side_effect && emitted.iter().all(|decl| decl.is_type_only) {
            emitted.push(ImportDeclaration::side_effect(&specifier));
        }

        merged.extend(emitted);
    }

    sort_import_declarations(&mut merged);
    Ok(merged)
}

pub fn render_import_declaration(declaration: &ImportDeclaration) -> String {
    let specifier = &declaration.module_specifier;
    if declaration.is_side_effect() {
        return format!("import '{specifier}';");
    }

    let mut clauses = Vec::new();
    if let Some(default) = &declaration.default_import {
        clauses.push(default.clone());
    }
    if let Some(namespace) = &declaration.namespace_import {
        clauses.push(format!("* as {namespace}"));
    }
    if !declaration.named_imports.is_empty() {
        let names: Vec<String> = declaration
            .named_imports
            .iter()
            .map(|named| {
                let mut text = String::new();
                if named.is_type_only {
                    text.push_str("type ");
                }
                text.push_str(&named.name);
                if let Some(alias) = &named.alias {
                    text.push_str(" as ");
                    text.push_str(alias);
                }
                text
            })
            .collect();
        clauses.push(format!("{{ {} }}", names.join(", ")));
    }

    let keyword = if declaration.is_type_only {
        "import type"
    } else {
        "import"
    };

    format!("{keyword} {} from '{specifier}';", clauses.join(", "))
}

pub fn render_import_declarations(declarations: &[ImportDeclaration]) -> String {
    declarations
        .iter()
        .map(render_import_declaration)
        .collect::<Vec<_>>()
        .join("\n")
}

fn identifier(text: &str, statement: &str) -> Result<String, ImportError> {
    if IDENTIFIER.is_match(text) {
        Ok(text.to_string())
    } else {
        Err(ImportError::Malformed(statement.to_string()))
    }
}

/// Parses a single import statement.
pub fn parse_import_declaration(statement: &str) -> Result<ImportDeclaration, ImportError> {
    let statement = statement.trim();

    if let Some(captures) = IMPORT_SIDE_EFFECT.captures(statement) {
        return Ok(ImportDeclaration::side_effect(&captures[2]));
    }

    let captures = IMPORT_FROM
        .captures(statement)
        .ok_or_else(|| ImportError::Malformed(statement.to_string()))?;

    let mut clause = captures[1].trim();
    let mut declaration = ImportDeclaration::side_effect(&captures[3]);

    if let Some(rest) = clause.strip_prefix("type ") {
        declaration.is_type_only = true;
        clause = rest.trim_start();
    }

    let (head, named) = match clause.find('{') {
        Some(start) => {
            let end = clause
                .rfind('}')
                .filter(|&end| end > start)
                .ok_or_else(|| ImportError::Malformed(statement.to_string()))?;
            (&clause[..start], Some(&clause[start + 1..end]))
        }
        None => (clause, None),
    };

    for part in head.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        if let Some(namespace) = part.strip_prefix('*') {
            let namespace = namespace
                .trim()
                .strip_prefix("as")
                .ok_or_else(|| ImportError::Malformed(statement.to_string()))?;
            declaration.namespace_import = Some(identifier(namespace.trim(), statement)?);
        } else {
            declaration.default_import = Some(identifier(part, statement)?);
        }
    }

    for item in named
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
    {
        let (item, is_type_only) = match item.strip_prefix("type ") {
            Some(rest) => (rest.trim(), true),
            None => (item, false),
        };

        let mut parts = item.split_whitespace();
        let name = identifier(parts.next().unwrap_or_default(), statement)?;
        let alias = match (parts.next(), parts.next(), parts.next()) {
            (None, _, _) => None,
            (Some("as"), Some(alias), None) => Some(identifier(alias, statement)?),
            _ => return Err(ImportError::Malformed(statement.to_string())),
        };

        declaration.named_imports.push(NamedImport {
            name,
            alias,
            is_type_only,
        });
    }

    if declaration.is_side_effect() {
        return Err(ImportError::Malformed(statement.to_string()));
    }

    Ok(declaration)
}

/// A source text split around its import statements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    /// Leading comments, shebang and directives such as `'use client'`.
    pub prologue: String,
    pub imports: Vec<ImportDeclaration>,
    pub body: String,
    pub trailing_newline: bool,
}

impl SourceFile {
    /// Splits `text` into prologue, top-level imports and the remaining body.
    pub fn parse(text: &str) -> Result<Self, ImportError> {
        let lines: Vec<&str> = text.lines().collect();
        let mut index = 0;

        let mut in_block_comment = false;
        while index < lines.len() {
            let line = lines[index].trim();
            if in_block_comment {
                in_block_comment = !line.contains("*/");
            } else if line.starts_with("/*") {
                in_block_comment = !line.contains("*/");
            } else if !(line.is_empty()
                || line.starts_with("//")
                || line.starts_with("#!")
                || DIRECTIVE.is_match(line))
            {
                break;
            }
            index += 1;
        }

        let prologue = lines[..index].join("\n").trim_end().to_string();
        let mut imports = Vec::new();
        let mut body = Vec::new();

        while index < lines.len() {
            let line = lines[index];
            if !IMPORT_START.is_match(line) {
                body.push(line);
                index += 1;
                continue;
            }

            let start = index;
            let mut statement = String::new();
            loop {
                let Some(line) = lines.get(index) else {
                    return Err(ImportError::Unterminated(start + 1));
                };
                if !statement.is_empty() {
                    statement.push('\n');
                }
                statement.push_str(line);
                index += 1;

                let trimmed = statement.trim();
                if IMPORT_FROM.is_match(trimmed) || IMPORT_SIDE_EFFECT.is_match(trimmed) {
                    break;
                }
            }

            imports.push(parse_import_declaration(&statement)?);
        }

        let body = body.join("\n");
        Ok(Self {
            prologue,
            imports,
            body: body.trim_matches('\n').to_string(),
            trailing_newline: text.ends_with('\n'),
        })
    }

    /// Reassembles the file around a new import block.
    pub fn render(&self, before_imports: &[String], imports: &str, after_imports: &[String]) -> String {
        let sections = [
            self.prologue.clone(),
            before_imports.join("\n\n"),
            imports.to_string(),
            after_imports.join("\n\n"),
            self.body.trim_end().to_string(),
        ];

        let mut text = sections
            .into_iter()
            .filter(|section| !section.trim().is_empty())
            .collect::<Vec<_>>()
            .join("\n\n");

        if self.trailing_newline {
            text.push('\n');
        }
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_named_imports_same_module() {
        let merged = merge_import_declarations([
            ImportDeclaration::named("react", ["useState"]),
            ImportDeclaration::named("react", ["useEffect", "useState"]),
        ])
        .unwrap();

        assert_eq!(merged.len(), 1);
        assert_eq!(
            render_import_declaration(&merged[0]),
            "import { useEffect, useState } from 'react';"
        );
    }

    #[test]
    fn test_merge_is_idempotent() {
        let declarations = vec![
            ImportDeclaration::named("zod", ["z"]),
            ImportDeclaration::default("react", "React").with_named(NamedImport::new("useMemo")),
            ImportDeclaration::type_named("@/types", ["User"]),
        ];

        let once = merge_import_declarations(declarations.clone()).unwrap();
        let twice = merge_import_declarations(
            declarations.iter().chain(declarations.iter()).cloned(),
        )
        .unwrap();
        assert_eq!(once, twice);
        assert_eq!(merge_import_declarations(once.clone()).unwrap(), once);
    }

    #[test]
    fn test_value_import_wins_over_type_import() {
        let merged = merge_import_declarations([
            ImportDeclaration::type_named("./user", ["User"]),
            ImportDeclaration::named("./user", ["User"]),
        ])
        .unwrap();

        assert_eq!(
            render_import_declarations(&merged),
            "import { User } from './user';"
        );
    }

    #[test]
    fn test_mixed_type_and_value_named_imports() {
        let merged = merge_import_declarations([
            ImportDeclaration::type_named("./user", ["User"]),
            ImportDeclaration::named("./user", ["createUser"]),
        ])
        .unwrap();

        assert_eq!(
            render_import_declarations(&merged),
            "import { type User, createUser } from './user';"
        );
    }

    #[test]
    fn test_conflicting_default_import() {
        let err = merge_import_declarations([
            ImportDeclaration::default("react", "React"),
            ImportDeclaration::default("react", "R"),
        ])
        .unwrap_err();

        assert!(matches!(
            err,
            ImportError::ConflictingDefaultImport { module, .. } if module == "react"
        ));
    }

    #[test]
    fn test_side_effect_dropped_when_module_is_loaded() {
        let merged = merge_import_declarations([
            ImportDeclaration::side_effect("./styles.css"),
            ImportDeclaration::side_effect("polyfill"),
            ImportDeclaration::named("polyfill", ["install"]),
        ])
        .unwrap();

        assert_eq!(
            render_import_declarations(&merged),
            "import { install } from 'polyfill';\nimport './styles.css';"
        );
    }

    #[test]
    fn test_sort_groups() {
        let merged = merge_import_declarations([
            ImportDeclaration::named("./local", ["a"]),
            ImportDeclaration::named("../parent", ["b"]),
            ImportDeclaration::named("@/components/button", ["Button"]),
            ImportDeclaration::named("@tanstack/react-query", ["useQuery"]),
            ImportDeclaration::namespace("node:path", "path"),
            ImportDeclaration::named("fs", ["readFile"]),
            ImportDeclaration::named("react", ["useState"]),
        ])
        .unwrap();

        let specifiers: Vec<_> = merged.iter().map(|d| d.module_specifier.as_str()).collect();
        assert_eq!(
            specifiers,
            [
                "fs",
                "node:path",
                "@tanstack/react-query",
                "react",
                "@/components/button",
                "../parent",
                "./local"
            ]
        );
    }

    #[test]
    fn test_parse_import_forms() {
        let cases = [
            ("import React from 'react';", "import React from 'react';"),
            (
                "import React, { useState as useLocal } from \"react\"",
                "import React, { useState as useLocal } from 'react';",
            ),
            (
                "import type { User, Post } from './types';",
                "import type { User, Post } from './types';",
            ),
            (
                "import * as path from 'node:path';",
                "import * as path from 'node:path';",
            ),
            ("import './styles.css';", "import './styles.css';"),
            (
                "import { type User, createUser } from './user';",
                "import { type User, createUser } from './user';",
            ),
        ];

        for (input, expected) in cases {
            let declaration = parse_import_declaration(input).unwrap();
            assert_eq!(render_import_declaration(&declaration), expected, "{input}");
        }
    }

    #[test]
    fn test_parse_malformed() {
        assert!(parse_import_declaration("import { a b c } from 'x';").is_err());
        assert!(parse_import_declaration("import from 'x';").is_err());
        assert!(parse_import_declaration("import {} from 'x';").is_err());
    }

    #[test]
    fn test_source_file_parse() {
        let text = "\
// @ts-nocheck
'use client';

import { useState } from 'react';
import {
  Button,
  type ButtonProps,
} from '@/components/button';

export function Page() {
  return <Button />;
}
";
        let source = SourceFile::parse(text).unwrap();
        assert_eq!(source.prologue, "// @ts-nocheck\n'use client';");
        assert_eq!(source.imports.len(), 2);
        assert_eq!(
            source.imports[1].named_imports,
            [
                NamedImport::new("Button"),
                NamedImport::new("ButtonProps").type_only()
            ]
        );
        assert!(source.body.starts_with("export function Page()"));
        assert!(source.trailing_newline);

        let rendered = source.render(
            &[],
            &render_import_declarations(&source.imports),
            &["const helper = 1;".to_string()],
        );
        assert_eq!(
            rendered,
            "// @ts-nocheck\n'use client';\n\n\
             import { useState } from 'react';\n\
             import { Button, type ButtonProps } from '@/components/button';\n\n\
             const helper = 1;\n\n\
             export function Page() {\n  return <Button />;\n}\n"
        );
    }

    #[test]
    fn test_source_file_unterminated_import() {
        let err = SourceFile::parse("import {\n  a,\n").unwrap_err();
        assert!(matches!(err, ImportError::Unterminated(1)));
    }

    #[test]
    fn test_dynamic_import_is_body() {
        let source = SourceFile::parse("const mod = import('./lazy');\nimport.meta.url;\n").unwrap();
        assert!(source.imports.is_empty());
        assert_eq!(source.body, "const mod = import('./lazy');\nimport.meta.url;");
    }
}
