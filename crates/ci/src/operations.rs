//! Operations and sets of operations
//!
//! An [`Operation`] adds one or more steps to a pipeline. A [`Set`] is an
//! ordered list of operations and named sub-sets; named sub-sets become
//! Buildkite groups when the set is applied.

use pipegen_buildkite::PipelineBuilder;
use std::fmt;

/// Name of the set holding steps every other step may rely on.
pub const PIPELINE_SETUP_SET_NAME: &str = "Pipeline setup";

/// Something that adds steps to a pipeline
pub trait Operation: fmt::Debug {
    /// Short description, used when previewing or inspecting a set
    fn name(&self) -> String;

    /// Add this operation's steps
    fn apply(&self, pipeline: &mut PipelineBuilder);
}

#[derive(Debug)]
enum Item {
    Operation(Box<dyn Operation>),
    Set(Set),
}

/// Ordered, optionally named, collection of operations
#[derive(Debug, Default)]
pub struct Set {
    name: Option<String>,
    items: Vec<Item>,
}

impl Set {
    /// An unnamed set
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A named set, applied as a group
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            items: Vec::new(),
        }
    }

    /// Name of the set, if any
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Append an operation
    pub fn append(&mut self, operation: impl Operation + 'static) -> &mut Self {
        self.items.push(Item::Operation(Box::new(operation)));
        self
    }

    /// Append an operation, builder style
    #[must_use]
    pub fn with(mut self, operation: impl Operation + 'static) -> Self {
        self.append(operation);
        self
    }

    /// Merge another set into this one
    ///
    /// A named set is kept as a single item and becomes a group. An unnamed
    /// set is spliced in.
    ///
    /// # Panics
    ///
    /// Groups cannot be nested: merging a named set into a named set panics.
    #[allow(clippy::panic)]
    pub fn merge(&mut self, other: Self) -> &mut Self {
        match (&self.name, &other.name) {
            (Some(outer), Some(inner)) => {
                panic!("cannot merge named set {inner:?} into named set {outer:?}")
            }
            (_, Some(_)) => self.items.push(Item::Set(other)),
            (_, None) => self.items.extend(other.items),
        }
        self
    }

    /// Number of direct items
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the set has no items
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Names of every operation, depth first; grouped operations are
    /// prefixed with their group name
    #[must_use]
    pub fn operation_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        for item in &self.items {
            match item {
                Item::Operation(op) => names.push(op.name()),
                Item::Set(set) => {
                    let group = set.name.as_deref().unwrap_or_default();
                    names.extend(
                        set.operation_names()
                            .into_iter()
                            .map(|name| format!("{group}: {name}")),
                    );
                }
            }
        }
        names
    }

    /// Apply every operation in order
    pub fn apply(&self, pipeline: &mut PipelineBuilder) {
        for item in &self.items {
            match item {
                Item::Operation(op) => op.apply(pipeline),
                Item::Set(set) => {
                    let label = set.name.clone().unwrap_or_default();
                    pipeline.add_group(label.clone(), group_key(&label), |group| {
                        set.apply(group);
                    });
                }
            }
        }
    }
}

/// Key of the group created for a named set, e.g. `Go checks` -> `go-checks`
#[must_use]
pub fn group_key(name: &str) -> String {
    let mut key = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            key.push(c.to_ascii_lowercase());
        } else if !key.is_empty() && !key.ends_with('-') {
            key.push('-');
        }
    }
    key.trim_end_matches('-').to_string()
}
