//! Nested include trees.
//!
//! Several generators often contribute to one nested structure, for example
//! the `plugins` option of a server config, where every feature adds its own
//! keys. Each contribution is an [`IncludeTree`]; the trees are merged key by
//! key, checked against an [`IncludeSchema`], and rendered as nested object
//! literals.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;

use crate::error::FragmentError;
use crate::fragment::{CodeFragment, merge_fragments_as_object};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IncludeTree {
    Leaf(CodeFragment),
    Branch(BTreeMap<String, IncludeTree>),
}

/// Keys allowed at each level of an include tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IncludeSchema {
    /// Any fragment.
    Leaf,
    Branch(BTreeMap<String, IncludeSchema>),
}

impl IncludeSchema {
    pub fn branch<K, I>(children: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, IncludeSchema)>,
    {
        IncludeSchema::Branch(
            children
                .into_iter()
                .map(|(key, schema)| (key.into(), schema))
                .collect(),
        )
    }
}

fn join(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{path}.{key}")
    }
}

impl IncludeTree {
    pub fn leaf(fragment: impl Into<CodeFragment>) -> Self {
        IncludeTree::Leaf(fragment.into())
    }

    pub fn branch() -> Self {
        IncludeTree::Branch(BTreeMap::new())
    }

    /// A tree holding a single fragment at a dotted path, e.g.
    /// `auth.providers.google`.
    pub fn at(path: &str, fragment: impl Into<CodeFragment>) -> Self {
        path.rsplit('.')
            .fold(IncludeTree::leaf(fragment), |tree, key| {
                IncludeTree::Branch(BTreeMap::from([(key.to_string(), tree)]))
            })
    }

    /// Adds a child to a branch. Does nothing on a leaf.
    pub fn with(mut self, key: impl Into<String>, tree: IncludeTree) -> Self {
        if let IncludeTree::Branch(children) = &mut self {
            children.insert(key.into(), tree);
        }
        self
    }

    pub fn get(&self, path: &str) -> Option<&IncludeTree> {
        path.split('.').try_fold(self, |tree, key| match tree {
            IncludeTree::Branch(children) => children.get(key),
            IncludeTree::Leaf(_) => None,
        })
    }

    /// Merges two trees key by key. Identical leaves collapse into one,
    /// different leaves under the same key are an error.
    pub fn merge(self, other: IncludeTree) -> Result<IncludeTree, FragmentError> {
        merge_at(String::new(), self, other)
    }

    pub fn validate(&self, schema: &IncludeSchema) -> Result<(), FragmentError> {
        validate_at("", self, schema)
    }

    /// Renders branches as object literals ordered by key.
    pub fn to_fragment(&self) -> Result<CodeFragment, FragmentError> {
        match self {
            IncludeTree::Leaf(fragment) => Ok(fragment.clone()),
            IncludeTree::Branch(children) => {
                let rendered = children
                    .iter()
                    .map(|(key, child)| Ok((key.clone(), Some(child.to_fragment()?))))
                    .collect::<Result<Vec<_>, FragmentError>>()?;
                merge_fragments_as_object(rendered)
            }
        }
    }
}

fn merge_at(path: String, a: IncludeTree, b: IncludeTree) -> Result<IncludeTree, FragmentError> {
    match (a, b) {
        (IncludeTree::Leaf(a), IncludeTree::Leaf(b)) if a == b => Ok(IncludeTree::Leaf(a)),
        (IncludeTree::Leaf(_), IncludeTree::Leaf(_)) => Err(FragmentError::DuplicateKey(path)),
        (IncludeTree::Branch(mut a), IncludeTree::Branch(b)) => {
            for (key, tree) in b {
                match a.entry(key) {
                    Entry::Vacant(entry) => {
                        entry.insert(tree);
                    }
                    Entry::Occupied(entry) => {
                        let (key, existing) = entry.remove_entry();
                        let merged = merge_at(join(&path, &key), existing, tree)?;
                        a.insert(key, merged);
                    }
                }
            }
            Ok(IncludeTree::Branch(a))
        }
        _ => Err(FragmentError::IncludeShape(path)),
    }
}

fn validate_at(path: &str, tree: &IncludeTree, schema: &IncludeSchema) -> Result<(), FragmentError> {
    match (tree, schema) {
        (IncludeTree::Leaf(_), IncludeSchema::Leaf) => Ok(()),
        (IncludeTree::Branch(children), IncludeSchema::Branch(allowed)) => {
            for (key, child) in children {
                let Some(child_schema) = allowed.get(key) else {
                    return Err(FragmentError::UnknownIncludeKey {
                        path: path.to_string(),
                        key: key.clone(),
                    });
                };
                validate_at(&join(path, key), child, child_schema)?;
            }
            Ok(())
        }
        _ => Err(FragmentError::IncludeShape(path.to_string())),
    }
}

/// Merges all contributions, then checks the result against `schema`.
pub fn merge_include_trees<I>(trees: I, schema: &IncludeSchema) -> Result<IncludeTree, FragmentError>
where
    I: IntoIterator<Item = IncludeTree>,
{
    let merged = trees
        .into_iter()
        .try_fold(IncludeTree::branch(), IncludeTree::merge)?;
    merged.validate(schema)?;
    Ok(merged)
}
