use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sm_dialect::{Dialect, DialectError, PersistedKind, validate_column_name};
use sm_template::{Segment, Template};

use crate::expression::Expression;
use crate::graph::{RefPath, set_placeholders};
use crate::{GraphError, ModelError};

/// Number of hex characters kept from the sha256 digest.
const HASH_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Materialization {
    /// Emitted as a `WITH name AS (...)` entry of every statement that uses it.
    Cte,
    /// Its own `SELECT` statement, and a CTE for every other statement using it.
    Query,
    View,
    Table,
    TempTable,
    /// Already exists in the database. Without references its SQL is
    /// inlined where referenced; with references it is emitted as a CTE.
    Source,
}

impl Materialization {
    /// Can be defined as a CTE inside another statement.
    #[must_use]
    pub fn is_cte(self) -> bool {
        matches!(self, Self::Cte | Self::Query)
    }

    /// Compiles to a statement of its own.
    #[must_use]
    pub fn is_statement(self) -> bool {
        matches!(self, Self::Query | Self::View | Self::Table | Self::TempTable)
    }

    /// Creates a database object that other statements read by name.
    #[must_use]
    pub fn persisted_kind(self) -> Option<PersistedKind> {
        match self {
            Self::View => Some(PersistedKind::View),
            Self::Table => Some(PersistedKind::Table),
            Self::TempTable => Some(PersistedKind::TempTable),
            Self::Cte | Self::Query | Self::Source => None,
        }
    }

    #[must_use]
    pub fn is_persisted(self) -> bool {
        self.persisted_kind().is_some()
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cte => "cte",
            Self::Query => "query",
            Self::View => "view",
            Self::Table => "table",
            Self::TempTable => "temp_table",
            Self::Source => "source",
        }
    }
}

impl fmt::Display for Materialization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Value bound to a `{placeholder}`.
///
/// Plain strings are raw SQL text. A fragment that can itself carry fields
/// is written as `{"template": "..."}` so that it reads back as a fragment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PlaceholderValue {
    Bool(bool),
    Int(i64),
    Raw(String),
    Fragment { template: Template },
}

impl PlaceholderValue {
    #[must_use]
    pub fn into_template(self) -> Template {
        match self {
            Self::Raw(text) => Template::literal(&text),
            Self::Int(value) => Template::literal(&value.to_string()),
            Self::Bool(value) => Template::literal(if value { "true" } else { "false" }),
            Self::Fragment { template } => template,
        }
    }
}

impl From<&str> for PlaceholderValue {
    fn from(value: &str) -> Self {
        Self::Raw(value.to_owned())
    }
}

impl From<String> for PlaceholderValue {
    fn from(value: String) -> Self {
        Self::Raw(value)
    }
}

impl From<i64> for PlaceholderValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for PlaceholderValue {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<bool> for PlaceholderValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<Template> for PlaceholderValue {
    fn from(value: Template) -> Self {
        Self::Fragment { template: value }
    }
}

/// Identity used when walking a graph: two nodes with the same key are the
/// same node, whether or not they are the same allocation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeKey {
    pub hash: String,
    pub name: String,
    pub materialization: Materialization,
}

/// One node of the SQL model graph.
///
/// Nodes are immutable. Every "edit" builds a new node and shares the
/// untouched children through `Arc`.
#[derive(Debug, Clone)]
pub struct SqlModel {
    generic_name: String,
    template: Template,
    placeholders: BTreeMap<String, Template>,
    references: BTreeMap<String, Arc<SqlModel>>,
    materialization: Materialization,
    materialization_name: Option<String>,
    column_expressions: Vec<(String, Expression)>,
    resolved: Template,
    hash: String,
    name: String,
}

impl PartialEq for SqlModel {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
            && self.name == other.name
            && self.materialization == other.materialization
    }
}

impl Eq for SqlModel {}

impl SqlModel {
    #[must_use]
    pub fn generic_name(&self) -> &str {
        &self.generic_name
    }

    #[must_use]
    pub fn template(&self) -> &Template {
        &self.template
    }

    #[must_use]
    pub fn placeholders(&self) -> &BTreeMap<String, Template> {
        &self.placeholders
    }

    #[must_use]
    pub fn references(&self) -> &BTreeMap<String, Arc<SqlModel>> {
        &self.references
    }

    #[must_use]
    pub fn reference(&self, name: &str) -> Option<&Arc<SqlModel>> {
        self.references.get(name)
    }

    #[must_use]
    pub fn materialization(&self) -> Materialization {
        self.materialization
    }

    /// Explicitly assigned materialization name, if any.
    #[must_use]
    pub fn materialization_name(&self) -> Option<&str> {
        self.materialization_name.as_deref()
    }

    /// Name of the CTE, view or table this node compiles to:
    /// the explicit materialization name, or `{generic_name}___{hash}`.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn hash(&self) -> &str {
        &self.hash
    }

    #[must_use]
    pub fn node_key(&self) -> NodeKey {
        NodeKey {
            hash: self.hash.clone(),
            name: self.name.clone(),
            materialization: self.materialization,
        }
    }

    /// Reference name used when an expression points at this node.
    #[must_use]
    pub fn reference_key(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.hash.as_bytes());
        hasher.update(b"\0");
        hasher.update(self.name.as_bytes());
        hasher.update(b"\0");
        hasher.update(self.materialization.as_str().as_bytes());
        let digest: String = hasher
            .finalize()
            .iter()
            .take(8)
            .map(|byte| format!("{byte:02x}"))
            .collect();
        format!("ref_{digest}")
    }

    /// Template with every placeholder substituted; only text and
    /// references remain.
    #[must_use]
    pub fn resolved_template(&self) -> &Template {
        &self.resolved
    }

    #[must_use]
    pub fn column_expressions(&self) -> &[(String, Expression)] {
        &self.column_expressions
    }

    #[must_use]
    pub fn column_names(&self) -> Vec<&str> {
        self.column_expressions
            .iter()
            .map(|(name, _)| name.as_str())
            .collect()
    }

    pub fn validate_columns(&self, dialect: Dialect) -> Result<(), DialectError> {
        self.column_expressions
            .iter()
            .try_for_each(|(name, _)| validate_column_name(dialect, name))
    }

    #[must_use]
    pub fn copy_set_materialization(&self, materialization: Materialization) -> Arc<Self> {
        Arc::new(Self {
            materialization,
            ..self.clone()
        })
    }

    #[must_use]
    pub fn copy_set_materialization_name(&self, name: impl Into<String>) -> Arc<Self> {
        let name = name.into();
        Arc::new(Self {
            materialization_name: Some(name.clone()),
            name,
            ..self.clone()
        })
    }

    /// Copy with some placeholder values replaced. The template must already
    /// use every given placeholder.
    pub fn copy_override_placeholders(
        &self,
        placeholders: BTreeMap<String, PlaceholderValue>,
    ) -> Result<Arc<Self>, ModelError> {
        let mut builder = self.to_builder();
        for (name, value) in placeholders {
            if !self.placeholders.contains_key(&name) {
                return Err(ModelError::UnusedPlaceholder {
                    model: self.generic_name.clone(),
                    name,
                });
            }
            builder = builder.placeholder(name, value);
        }
        builder.build()
    }

    /// Copy with one reference pointing at a different node.
    pub fn copy_override_reference(
        &self,
        name: &str,
        model: Arc<SqlModel>,
    ) -> Result<Arc<Self>, ModelError> {
        if !self.references.contains_key(name) {
            return Err(ModelError::UnusedReference {
                model: self.generic_name.clone(),
                name: name.to_owned(),
            });
        }
        let mut references = self.references.clone();
        references.insert(name.to_owned(), model);
        Ok(Arc::new(self.with_references(references)))
    }

    /// Set placeholders of the node at `path` below `self`, rebuilding only
    /// the nodes on that path.
    pub fn set(
        self: &Arc<Self>,
        path: &RefPath,
        placeholders: BTreeMap<String, PlaceholderValue>,
    ) -> Result<Arc<Self>, GraphError> {
        set_placeholders(self, path, placeholders)
    }

    #[must_use]
    pub fn to_builder(&self) -> SqlModelBuilder {
        SqlModelBuilder {
            generic_name: self.generic_name.clone(),
            template: self.template.clone(),
            placeholders: self.placeholders.clone(),
            references: self.references.clone(),
            materialization: self.materialization,
            materialization_name: self.materialization_name.clone(),
            column_expressions: self.column_expressions.clone(),
            error: None,
        }
    }

    fn with_references(&self, references: BTreeMap<String, Arc<SqlModel>>) -> Self {
        let hash = content_hash(&self.resolved, &references);
        let name = derive_name(&self.generic_name, self.materialization_name.as_deref(), &hash);
        Self {
            references,
            hash,
            name,
            ..self.clone()
        }
    }
}

fn derive_name(generic_name: &str, materialization_name: Option<&str>, hash: &str) -> String {
    match materialization_name {
        Some(name) => name.to_owned(),
        None => format!("{generic_name}___{hash}"),
    }
}

/// Digest of the resolved template with every reference replaced by the
/// referenced node's hash. Allocation identity plays no part.
fn content_hash(resolved: &Template, references: &BTreeMap<String, Arc<SqlModel>>) -> String {
    let mut hasher = Sha256::new();
    for segment in resolved.segments() {
        match segment {
            Segment::Text(text) => {
                hasher.update(b"T");
                hasher.update((text.len() as u64).to_le_bytes());
                hasher.update(text.as_bytes());
            }
            Segment::Reference(name) => {
                hasher.update(b"R");
                // Validated at build time; the name itself keeps the digest
                // distinct should that ever not hold.
                match references.get(name) {
                    Some(model) => hasher.update(model.hash.as_bytes()),
                    None => hasher.update(name.as_bytes()),
                }
            }
            Segment::Placeholder(name) => {
                hasher.update(b"P");
                hasher.update(name.as_bytes());
            }
        }
    }
    hasher
        .finalize()
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect::<String>()
        .chars()
        .take(HASH_LEN)
        .collect()
}

// ── Builder ─────────────────────────────────────────────────────────────

/// Builds a [`SqlModel`] from a template and the values it needs.
///
/// ```
/// use sm_model::{Materialization, SqlModelBuilder};
///
/// let source = SqlModelBuilder::new("Source", "select * from events")
///     .materialization(Materialization::Cte)
///     .build()
///     .unwrap();
/// let filtered = SqlModelBuilder::new("Filter", "select * from {{source}} where day > {day}")
///     .reference("source", source)
///     .placeholder("day", 3)
///     .build()
///     .unwrap();
/// assert_eq!(filtered.references().len(), 1);
/// ```
#[derive(Debug, Clone)]
pub struct SqlModelBuilder {
    generic_name: String,
    template: Template,
    placeholders: BTreeMap<String, Template>,
    references: BTreeMap<String, Arc<SqlModel>>,
    materialization: Materialization,
    materialization_name: Option<String>,
    column_expressions: Vec<(String, Expression)>,
    error: Option<ModelError>,
}

impl SqlModelBuilder {
    /// Start from template source text. Parse errors surface from
    /// [`SqlModelBuilder::build`].
    #[must_use]
    pub fn new(generic_name: impl Into<String>, template: &str) -> Self {
        let (template, error) = match Template::parse(template) {
            Ok(template) => (template, None),
            Err(err) => (Template::new(), Some(ModelError::from(err))),
        };
        Self {
            error,
            ..Self::from_template(generic_name, template)
        }
    }

    #[must_use]
    pub fn from_template(generic_name: impl Into<String>, template: Template) -> Self {
        Self {
            generic_name: generic_name.into(),
            template,
            placeholders: BTreeMap::new(),
            references: BTreeMap::new(),
            materialization: Materialization::Cte,
            materialization_name: None,
            column_expressions: Vec::new(),
            error: None,
        }
    }

    #[must_use]
    pub fn placeholder(mut self, name: impl Into<String>, value: impl Into<PlaceholderValue>) -> Self {
        self.placeholders
            .insert(name.into(), value.into().into_template());
        self
    }

    /// Render `expression` for `dialect` into placeholder `name`, registering
    /// the models it references.
    #[must_use]
    pub fn expression(mut self, name: impl Into<String>, expression: &Expression, dialect: Dialect) -> Self {
        self.references.extend(expression.model_references());
        self.placeholders
            .insert(name.into(), expression.to_template(dialect, None));
        self
    }

    #[must_use]
    pub fn reference(mut self, name: impl Into<String>, model: Arc<SqlModel>) -> Self {
        self.references.insert(name.into(), model);
        self
    }

    #[must_use]
    pub fn materialization(mut self, materialization: Materialization) -> Self {
        self.materialization = materialization;
        self
    }

    #[must_use]
    pub fn materialization_name(mut self, name: impl Into<String>) -> Self {
        self.materialization_name = Some(name.into());
        self
    }

    #[must_use]
    pub fn column(mut self, name: impl Into<String>, expression: Expression) -> Self {
        let name = name.into();
        match self.column_expressions.iter_mut().find(|(existing, _)| *existing == name) {
            Some(slot) => slot.1 = expression,
            None => self.column_expressions.push((name, expression)),
        }
        self
    }

    pub fn build(self) -> Result<Arc<SqlModel>, ModelError> {
        if let Some(err) = self.error {
            return Err(err);
        }
        let model = self.generic_name.clone();

        let used_placeholders = self.template.placeholder_names();
        if let Some(name) = used_placeholders
            .iter()
            .find(|name| !self.placeholders.contains_key(**name))
        {
            return Err(ModelError::MissingPlaceholder {
                model,
                name: (*name).to_owned(),
            });
        }
        if let Some(name) = self
            .placeholders
            .keys()
            .find(|name| !used_placeholders.contains(name.as_str()))
        {
            return Err(ModelError::UnusedPlaceholder {
                model,
                name: name.clone(),
            });
        }
        if let Some((name, _)) = self
            .placeholders
            .iter()
            .find(|(_, value)| value.has_placeholders())
        {
            return Err(ModelError::NestedPlaceholder {
                model,
                name: name.clone(),
            });
        }

        let resolved = self.template.substitute_placeholders(&self.placeholders)?;
        let used_references = resolved.reference_names();
        if let Some(name) = used_references
            .iter()
            .find(|name| !self.references.contains_key(**name))
        {
            return Err(ModelError::MissingReference {
                model,
                name: (*name).to_owned(),
            });
        }
        if let Some(name) = self
            .references
            .keys()
            .find(|name| !used_references.contains(name.as_str()))
        {
            return Err(ModelError::UnusedReference {
                model,
                name: name.clone(),
            });
        }

        let hash = content_hash(&resolved, &self.references);
        let name = derive_name(&self.generic_name, self.materialization_name.as_deref(), &hash);
        Ok(Arc::new(SqlModel {
            generic_name: self.generic_name,
            template: self.template,
            placeholders: self.placeholders,
            references: self.references,
            materialization: self.materialization,
            materialization_name: self.materialization_name,
            column_expressions: self.column_expressions,
            resolved,
            hash,
            name,
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use sm_dialect::Dialect;
    use sm_template::Template;

    use super::{Materialization, PlaceholderValue, SqlModel, SqlModelBuilder};
    use crate::{Expression, ModelError};

    fn value_model(key: &str, value: i64) -> Arc<SqlModel> {
        SqlModelBuilder::new("ValueModel", "select {key} as key, {val} as value")
            .placeholder("key", format!("'{key}'"))
            .placeholder("val", value)
            .build()
            .expect("value model")
    }

    fn ref_model(reference: Arc<SqlModel>, value: i64) -> Arc<SqlModel> {
        SqlModelBuilder::new("RefModel", "select key, value + {val} as value from {{ref}}")
            .reference("ref", reference)
            .placeholder("val", value)
            .build()
            .expect("ref model")
    }

    #[test]
    fn hash_is_content_based() {
        let a = value_model("a", 1);
        let b = value_model("a", 1);
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(a.hash(), b.hash());
        assert_eq!(a.hash().len(), 32);
        assert_ne!(a.hash(), value_model("a", 2).hash());

        // References compare by hash, not by allocation.
        assert_eq!(ref_model(a.clone(), 5).hash(), ref_model(b, 5).hash());
        assert_ne!(ref_model(a.clone(), 5).hash(), ref_model(value_model("b", 1), 5).hash());
    }

    #[test]
    fn default_name_is_derived_from_hash() {
        let model = value_model("a", 1);
        assert_eq!(model.name(), format!("ValueModel___{}", model.hash()));
        let named = model.copy_set_materialization_name("values");
        assert_eq!(named.name(), "values");
        assert_eq!(named.hash(), model.hash());
        assert_eq!(model.materialization_name(), None);
    }

    #[test]
    fn placeholder_and_reference_sets_must_match_template() {
        let missing = SqlModelBuilder::new("M", "select {a}").build().unwrap_err();
        assert_eq!(
            missing,
            ModelError::MissingPlaceholder {
                model: "M".to_owned(),
                name: "a".to_owned()
            }
        );

        let unused = SqlModelBuilder::new("M", "select 1")
            .placeholder("a", 1)
            .build()
            .unwrap_err();
        assert!(matches!(unused, ModelError::UnusedPlaceholder { .. }));

        let missing_ref = SqlModelBuilder::new("M", "select * from {{t}}")
            .build()
            .unwrap_err();
        assert!(matches!(missing_ref, ModelError::MissingReference { .. }));

        let unused_ref = SqlModelBuilder::new("M", "select 1")
            .reference("t", value_model("a", 1))
            .build()
            .unwrap_err();
        assert!(matches!(unused_ref, ModelError::UnusedReference { .. }));

        let bad_template = SqlModelBuilder::new("M", "select }").build().unwrap_err();
        assert!(matches!(bad_template, ModelError::Template(_)));
    }

    #[test]
    fn copy_operations_leave_the_original_untouched() {
        let model = value_model("a", 1);
        let view = model.copy_set_materialization(Materialization::View);
        assert_eq!(model.materialization(), Materialization::Cte);
        assert_eq!(view.materialization(), Materialization::View);

        let mut values = BTreeMap::new();
        values.insert("val".to_owned(), PlaceholderValue::from(7));
        let changed = model.copy_override_placeholders(values).unwrap();
        assert_ne!(changed.hash(), model.hash());
        assert_eq!(
            changed.placeholders()["val"].to_template_string(),
            "7"
        );
        assert_eq!(model.placeholders()["val"].to_template_string(), "1");
    }

    #[test]
    fn expression_placeholders_register_model_references() {
        let base = value_model("a", 1);
        let subquery = Expression::construct(
            "(select max(value) from {})",
            [Expression::model_reference(base.clone()).into()],
        )
        .unwrap();
        let model = SqlModelBuilder::new("Max", "select {max_value} as m")
            .expression("max_value", &subquery, Dialect::Postgres)
            .build()
            .unwrap();
        assert_eq!(model.references().len(), 1);
        let child = model.references().values().next().unwrap();
        assert_eq!(child.hash(), base.hash());
    }

    #[test]
    fn column_expressions_keep_insertion_order() {
        let model = SqlModelBuilder::new("Cols", "select 1 as b, 2 as a")
            .column("b", Expression::column_reference("b"))
            .column("a", Expression::column_reference("a"))
            .build()
            .unwrap();
        assert_eq!(model.column_names(), vec!["b", "a"]);
        assert!(model.validate_columns(Dialect::BigQuery).is_ok());
    }

    #[test]
    fn fragments_read_back_as_fragments() {
        let template = Template::parse("select max(value) from {{input}} where a = {x}").unwrap();
        let fragment = PlaceholderValue::from(template.clone());
        let json = serde_json::to_value(&fragment).unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "template": "select max(value) from {{input}} where a = {x}" })
        );
        let back: PlaceholderValue = serde_json::from_value(json).unwrap();
        assert_eq!(back, PlaceholderValue::Fragment { template });

        let raw: PlaceholderValue = serde_json::from_str("\"'{x}'\"").unwrap();
        assert_eq!(raw, PlaceholderValue::Raw("'{x}'".to_owned()));
        let flag: PlaceholderValue = serde_json::from_str("true").unwrap();
        assert_eq!(flag, PlaceholderValue::Bool(true));
    }
}
