//! Per-type node definitions.
//!
//! A [`DefinitionSource`] is the declarative, serialized form (one JSON
//! document per node type). The [`DefinitionRegistry`] compiles sources into
//! immutable [`Definition`]s on first use and caches them by type name, so
//! types that reference each other (a comment's `parent` is a comment) never
//! compile recursively.

use crate::error::{Result, ScanError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use tracing::debug;

pub const DEFAULT_NODE_BATCH_SIZE: usize = 20;
pub const DEFAULT_EDGE_PAGE_SIZE: usize = 100;

fn default_true() -> bool {
    true
}

fn is_false(value: &bool) -> bool {
    !*value
}

fn is_true(value: &bool) -> bool {
    *value
}

/// Options declared for a single field or edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldOptions {
    #[serde(default, skip_serializing_if = "is_false")]
    pub omit: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub default: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edge_type: Option<String>,
    #[serde(default = "default_true", skip_serializing_if = "is_true")]
    pub follow_edge: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub omit_on_error: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl Default for FieldOptions {
    fn default() -> Self {
        Self {
            omit: false,
            default: false,
            edge_type: None,
            follow_edge: true,
            omit_on_error: None,
            comment: None,
        }
    }
}

impl FieldOptions {
    pub fn omitted() -> Self {
        Self {
            omit: true,
            ..Self::default()
        }
    }
}

/// One column of the flat CSV projection.
///
/// In JSON: `"message"`, `["from", "id"]` or `{"parent_comment": ["parent", "id"]}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CsvField {
    Name(String),
    Path(Vec<String>),
    Named(BTreeMap<String, Vec<String>>),
}

impl CsvField {
    pub fn header(&self) -> String {
        match self {
            CsvField::Name(name) => name.clone(),
            CsvField::Path(path) => path.join("_"),
            CsvField::Named(named) => named.keys().next().cloned().unwrap_or_default(),
        }
    }

    pub fn path(&self) -> Vec<&str> {
        match self {
            CsvField::Name(name) => vec![name.as_str()],
            CsvField::Path(path) => path.iter().map(String::as_str).collect(),
            CsvField::Named(named) => named
                .values()
                .next()
                .map(|path| path.iter().map(String::as_str).collect())
                .unwrap_or_default(),
        }
    }
}

/// Serialized form of a node type definition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DefinitionSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_batch_size: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edge_size: Option<usize>,
    #[serde(default)]
    pub fields: BTreeMap<String, FieldOptions>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub csv_fields: Vec<CsvField>,
}

impl DefinitionSource {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| ScanError::Definition(e.to_string()))
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// A stub definition covering `names`, every one of them omitted.
    pub fn template<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let fields = names
            .into_iter()
            .map(Into::into)
            .filter(|name| name != "id")
            .map(|name| (name, FieldOptions::omitted()))
            .collect();
        Self {
            fields,
            ..Self::default()
        }
    }

    /// Copy of this definition with any names it does not yet declare added
    /// as omitted fields.
    pub fn with_new_fields<I, S>(&self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut updated = self.clone();
        for name in names.into_iter().map(Into::into) {
            if name == "id" || updated.fields.contains_key(&name) {
                continue;
            }
            updated.fields.insert(
                name,
                FieldOptions {
                    comment: Some("Added field".to_string()),
                    ..FieldOptions::omitted()
                },
            );
        }
        updated
    }
}

/// A compiled node type definition.
#[derive(Debug, Clone)]
pub struct Definition {
    pub name: String,
    pub default_fields: BTreeSet<String>,
    pub on_demand_fields: BTreeSet<String>,
    pub default_edges: BTreeSet<String>,
    pub on_demand_edges: BTreeSet<String>,
    pub omit_fields_by_error_code: HashMap<i64, BTreeSet<String>>,
    pub node_batch_size: usize,
    pub edge_page_size: usize,
    pub csv_projection: Vec<CsvField>,
    options: BTreeMap<String, FieldOptions>,
}

impl Definition {
    /// Compiles `source`. `is_registered` reports whether an edge target type
    /// has a definition available.
    pub fn compile(
        name: &str,
        source: &DefinitionSource,
        is_registered: impl Fn(&str) -> bool,
    ) -> Result<Self> {
        let node_batch_size = source.node_batch_size.unwrap_or(DEFAULT_NODE_BATCH_SIZE);
        let edge_page_size = source.edge_size.unwrap_or(DEFAULT_EDGE_PAGE_SIZE);
        if node_batch_size == 0 || edge_page_size == 0 {
            return Err(ScanError::Definition(format!(
                "{}: node_batch_size and edge_size must be at least 1",
                name
            )));
        }

        let mut definition = Definition {
            name: name.to_string(),
            default_fields: BTreeSet::new(),
            on_demand_fields: BTreeSet::new(),
            default_edges: BTreeSet::new(),
            on_demand_edges: BTreeSet::new(),
            omit_fields_by_error_code: HashMap::new(),
            node_batch_size,
            edge_page_size,
            csv_projection: source.csv_fields.clone(),
            options: source.fields.clone(),
        };

        for (field_name, options) in &source.fields {
            if options.omit {
                continue;
            }
            match &options.edge_type {
                Some(edge_type) => {
                    if !is_registered(edge_type) {
                        return Err(ScanError::Definition(format!(
                            "{}.{} references unknown type {}",
                            name, field_name, edge_type
                        )));
                    }
                    if options.default {
                        definition.default_edges.insert(field_name.clone());
                    } else {
                        definition.on_demand_edges.insert(field_name.clone());
                    }
                }
                None => {
                    if options.default {
                        definition.default_fields.insert(field_name.clone());
                    } else {
                        definition.on_demand_fields.insert(field_name.clone());
                    }
                }
            }
            if let Some(code) = options.omit_on_error {
                definition
                    .omit_fields_by_error_code
                    .entry(code)
                    .or_default()
                    .insert(field_name.clone());
            }
        }

        for column in &definition.csv_projection {
            if let CsvField::Named(named) = column
                && named.len() != 1
            {
                return Err(ScanError::Definition(format!(
                    "{}: named csv field must have exactly one entry",
                    name
                )));
            }
        }

        Ok(definition)
    }

    pub fn edge_type(&self, edge: &str) -> Option<&str> {
        self.options.get(edge)?.edge_type.as_deref()
    }

    pub fn follow_edge(&self, edge: &str) -> bool {
        self.options.get(edge).map(|o| o.follow_edge).unwrap_or(false)
    }

    /// Default edges, plus on-demand edges when fetching at full depth.
    pub fn edges(&self, full_depth: bool) -> impl Iterator<Item = &String> {
        let on_demand = full_depth.then_some(&self.on_demand_edges);
        self.default_edges
            .iter()
            .chain(on_demand.into_iter().flatten())
    }

    pub fn omitted_for(&self, code: i64) -> Option<&BTreeSet<String>> {
        self.omit_fields_by_error_code.get(&code)
    }

    pub fn omits_on(&self, code: i64) -> bool {
        self.omit_fields_by_error_code.contains_key(&code)
    }

    /// Every declared name, including omitted ones.
    pub fn declared_names(&self) -> impl Iterator<Item = &String> {
        self.options.keys()
    }
}

/// Definition sources by type name, compiled lazily and cached.
#[derive(Debug, Default)]
pub struct DefinitionRegistry {
    sources: HashMap<String, DefinitionSource>,
    compiled: Mutex<HashMap<String, Arc<Definition>>>,
}

impl DefinitionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) the source for `name`.
    pub fn register(&mut self, name: impl Into<String>, source: DefinitionSource) {
        let name = name.into();
        self.compiled
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&name);
        self.sources.insert(name, source);
    }

    pub fn register_json(&mut self, name: impl Into<String>, json: &str) -> Result<()> {
        let name = name.into();
        let source = DefinitionSource::from_json(json)
            .map_err(|e| ScanError::Definition(format!("{}: {}", name, e)))?;
        self.register(name, source);
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.sources.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sources.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn source(&self, name: &str) -> Option<&DefinitionSource> {
        self.sources.get(name)
    }

    pub fn get(&self, name: &str) -> Result<Arc<Definition>> {
        let mut compiled = self.compiled.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(definition) = compiled.get(name) {
            return Ok(definition.clone());
        }
        let source = self
            .sources
            .get(name)
            .ok_or_else(|| ScanError::Definition(format!("no definition for type {}", name)))?;
        debug!("Compiling definition {}", name);
        let definition = Arc::new(Definition::compile(name, source, |t| self.contains(t))?);
        compiled.insert(name.to_string(), definition.clone());
        Ok(definition)
    }
}
