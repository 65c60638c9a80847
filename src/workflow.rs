//! Workflow graph templates and parameter patching.
//!
//! Templates are parsed once and shared. A request never mutates a template:
//! it builds a [`PatchSet`] of JSON-pointer → value overrides and serializes
//! the template through it, so concurrent requests see the same pristine
//! graph and a patch touches only the fields it names.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Serialize, Serializer};
use serde_json::Value;

use crate::error::{PluginError, Result};

/// A parsed, immutable workflow graph.
#[derive(Debug)]
pub struct WorkflowTemplate {
    name: &'static str,
    graph: Value,
}

impl WorkflowTemplate {
    pub fn parse(name: &'static str, raw: &str) -> Result<Self> {
        let graph = serde_json::from_str(raw)
            .map_err(|e| PluginError::protocol(format!("Invalid {name} workflow template: {e}")))?;
        Ok(Self { name, graph })
    }

    /// Parse `raw` on first use and keep it for the life of the process.
    pub fn cached(
        cell: &'static OnceLock<Self>,
        name: &'static str,
        raw: &str,
    ) -> Result<&'static Self> {
        if let Some(template) = cell.get() {
            return Ok(template);
        }
        let parsed = Self::parse(name, raw)?;
        Ok(cell.get_or_init(|| parsed))
    }

    pub const fn name(&self) -> &'static str {
        self.name
    }

    pub const fn graph(&self) -> &Value {
        &self.graph
    }

    /// Id of the first top-level node whose `class_type` matches.
    ///
    /// Only meaningful for graphs keyed by node id (ComfyUI's API format).
    pub fn node_by_class(&self, class_type: &str) -> Option<&str> {
        self.graph.as_object()?.iter().find_map(|(id, node)| {
            (node.get("class_type").and_then(Value::as_str) == Some(class_type))
                .then_some(id.as_str())
        })
    }

    /// Apply `patches` to this template.
    ///
    /// Every patch point must already exist in the graph; a template that
    /// has drifted from the code fails here instead of producing a graph the
    /// backend would silently run with stale values.
    pub fn apply(&self, patches: PatchSet) -> Result<PatchedWorkflow<'_>> {
        if let Some(missing) = patches
            .overrides
            .keys()
            .find(|pointer| self.graph.pointer(pointer).is_none())
        {
            return Err(PluginError::protocol(format!(
                "{} workflow has no field at {missing}",
                self.name
            )));
        }
        Ok(PatchedWorkflow {
            template: self,
            patches,
        })
    }
}

/// Field overrides keyed by JSON pointer (RFC 6901).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PatchSet {
    overrides: BTreeMap<String, Value>,
}

impl PatchSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the field at the path formed by `segments`.
    #[must_use]
    pub fn set<I, S>(mut self, segments: I, value: impl Into<Value>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.overrides.insert(pointer(segments), value.into());
        self
    }

    pub fn len(&self) -> usize {
        self.overrides.len()
    }

    pub fn is_empty(&self) -> bool {
        self.overrides.is_empty()
    }
}

/// Build a JSON pointer from raw path segments.
pub fn pointer<I, S>(segments: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    segments.into_iter().fold(String::new(), |mut acc, segment| {
        acc.push('/');
        acc.push_str(&escape(segment.as_ref()));
        acc
    })
}

fn escape(segment: &str) -> String {
    segment.replace('~', "~0").replace('/', "~1")
}

/// A template viewed through a set of overrides. Serializes as the patched graph.
#[derive(Debug)]
pub struct PatchedWorkflow<'a> {
    template: &'a WorkflowTemplate,
    patches: PatchSet,
}

impl PatchedWorkflow<'_> {
    /// Materialize the patched graph. Used by tests and debug logging.
    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Field value after patching.
    pub fn get(&self, pointer: &str) -> Option<&Value> {
        self.patches
            .overrides
            .get(pointer)
            .or_else(|| self.template.graph.pointer(pointer))
    }
}

impl Serialize for PatchedWorkflow<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        Overlay {
            value: &self.template.graph,
            path: String::new(),
            overrides: &self.patches.overrides,
        }
        .serialize(serializer)
    }
}

struct Overlay<'a> {
    value: &'a Value,
    path: String,
    overrides: &'a BTreeMap<String, Value>,
}

impl Overlay<'_> {
    fn child<'b>(&'b self, value: &'b Value, segment: &str) -> Overlay<'b> {
        Overlay {
            value,
            path: format!("{}/{}", self.path, escape(segment)),
            overrides: self.overrides,
        }
    }

    fn has_override_below(&self) -> bool {
        let prefix = format!("{}/", self.path);
        self.overrides
            .range(prefix.clone()..)
            .next()
            .is_some_and(|(key, _)| key.starts_with(&prefix))
    }
}

impl Serialize for Overlay<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        if let Some(replacement) = self.overrides.get(&self.path) {
            return replacement.serialize(serializer);
        }
        if !self.has_override_below() {
            return self.value.serialize(serializer);
        }

        match self.value {
            Value::Object(map) => {
                let mut out = serializer.serialize_map(Some(map.len()))?;
                for (key, value) in map {
                    out.serialize_entry(key, &self.child(value, key))?;
                }
                out.end()
            }
            Value::Array(items) => {
                let mut out = serializer.serialize_seq(Some(items.len()))?;
                for (index, value) in items.iter().enumerate() {
                    out.serialize_element(&self.child(value, &index.to_string()))?;
                }
                out.end()
            }
            scalar => scalar.serialize(serializer),
        }
    }
}
