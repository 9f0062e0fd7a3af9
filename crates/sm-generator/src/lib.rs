#![forbid(unsafe_code)]

//! SQL generation for [`SqlModel`] graphs.
//!
//! Every distinct node below the compiled root becomes one named CTE and is
//! referred to by name wherever it is used, so the size of the output is
//! linear in the number of distinct nodes however many paths lead to them.
//! A source without references names an existing relation and is inlined
//! where referenced; a source with references is a CTE like any other node.
//!
//! Nodes sharing a name must share a body. When such nodes differ only in
//! materialization they are one definition: a persisted form wins over a
//! query, and a query over a CTE.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use sm_dialect::{Dialect, DialectError, create_statement, quote_identifier};
use sm_model::{Materialization, SqlModel};
use sm_template::FieldKind;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GeneratorError {
    #[error("No models to compile: {model} is a source without references")]
    NoModelsToCompile { model: String },
    #[error(
        "name {name:?} is used multiple times but with different definitions \
         (hashes {first_hash} and {second_hash})"
    )]
    NameCollision {
        name: String,
        first_hash: String,
        second_hash: String,
    },
    #[error("{model}: template field {field:?} does not resolve to a reference")]
    UnresolvedField { model: String, field: String },
    #[error(transparent)]
    Dialect(#[from] DialectError),
}

/// One executable statement produced by [`to_sql_materialized_nodes`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GeneratedSqlStatement {
    /// Name of the node the statement was compiled from.
    pub name: String,
    pub sql: String,
    /// `Query` for plain selects, otherwise the kind of object created.
    pub materialization: Materialization,
}

/// Compile `model` into a single select statement.
///
/// Every node below `model`, except reference-free sources, is emitted as a
/// CTE, including nodes that would be persisted by
/// [`to_sql_materialized_nodes`]. Column names are checked against the
/// dialect's rules for the root and every emitted CTE.
pub fn to_sql(dialect: Dialect, model: &Arc<SqlModel>) -> Result<String, GeneratorError> {
    ensure_compilable(model)?;
    let definitions = Definitions::collect(model)?;
    StatementCompiler::new(dialect, &definitions, model, false).compile()
}

/// Compile the graph below `start_node` into the ordered statements that
/// create every persisted node and select every query node.
///
/// Persisted nodes (views, tables, temporary tables) are read by name from
/// the statements that depend on them. Query nodes get their own select and
/// are also inlined as CTEs wherever they are used. Statements creating an
/// object always come before statements reading it. With
/// `include_start_node`, `start_node` is compiled last; a CTE start node is
/// compiled as a query.
pub fn to_sql_materialized_nodes(
    dialect: Dialect,
    start_node: &Arc<SqlModel>,
    include_start_node: bool,
) -> Result<Vec<GeneratedSqlStatement>, GeneratorError> {
    ensure_compilable(start_node)?;
    let definitions = Definitions::collect(start_node)?;

    let nodes = definitions.materialized_nodes(start_node, include_start_node);
    if nodes.is_empty() {
        return Err(GeneratorError::NoModelsToCompile {
            model: start_node.name().to_owned(),
        });
    }

    let mut statements = Vec::with_capacity(nodes.len());
    for node in &nodes {
        let select = StatementCompiler::new(dialect, &definitions, node, true).compile()?;
        let (sql, materialization) = match node.materialization().persisted_kind() {
            Some(kind) => (
                create_statement(dialect, kind, node.name(), &select)?,
                node.materialization(),
            ),
            None => (select, Materialization::Query),
        };
        statements.push(GeneratedSqlStatement {
            name: node.name().to_owned(),
            sql,
            materialization,
        });
    }

    #[cfg(feature = "tracing")]
    tracing::debug!(
        root = start_node.name(),
        %dialect,
        statements = statements.len(),
        "compiled materialized nodes"
    );
    Ok(statements)
}

/// Nodes that [`to_sql_materialized_nodes`] compiles into statements, in
/// statement order. Nodes sharing a name appear once, in their winning
/// materialization.
pub fn get_materialized_nodes(
    start_node: &Arc<SqlModel>,
    include_start_node: bool,
) -> Result<Vec<Arc<SqlModel>>, GeneratorError> {
    let definitions = Definitions::collect(start_node)?;
    Ok(definitions.materialized_nodes(start_node, include_start_node))
}

fn ensure_compilable(model: &SqlModel) -> Result<(), GeneratorError> {
    if is_inlined(model) {
        return Err(GeneratorError::NoModelsToCompile {
            model: model.name().to_owned(),
        });
    }
    Ok(())
}

/// A source without references is the name of an existing relation.
fn is_inlined(node: &SqlModel) -> bool {
    node.materialization() == Materialization::Source && node.references().is_empty()
}

fn precedence(materialization: Materialization) -> u8 {
    match materialization {
        Materialization::View | Materialization::Table | Materialization::TempTable => 3,
        Materialization::Query => 2,
        Materialization::Cte => 1,
        Materialization::Source => 0,
    }
}

// ── Name resolution ─────────────────────────────────────────────────────

/// One definition per name in a graph.
struct Definitions {
    by_name: HashMap<String, Arc<SqlModel>>,
}

impl Definitions {
    /// Every name in the graph must belong to exactly one body.
    fn collect(root: &Arc<SqlModel>) -> Result<Self, GeneratorError> {
        let mut by_name: HashMap<String, Arc<SqlModel>> = HashMap::new();
        let mut stack: Vec<&Arc<SqlModel>> = vec![root];
        while let Some(node) = stack.pop() {
            match by_name.get_mut(node.name()) {
                Some(first) => {
                    if first.hash() != node.hash() {
                        return Err(GeneratorError::NameCollision {
                            name: node.name().to_owned(),
                            first_hash: first.hash().to_owned(),
                            second_hash: node.hash().to_owned(),
                        });
                    }
                    if precedence(node.materialization()) > precedence(first.materialization()) {
                        *first = Arc::clone(node);
                    }
                    // Same body reached again; its subtree is already queued.
                }
                None => {
                    by_name.insert(node.name().to_owned(), Arc::clone(node));
                    stack.extend(node.references().values());
                }
            }
        }
        Ok(Self { by_name })
    }

    fn resolve<'a>(&'a self, node: &'a Arc<SqlModel>) -> &'a Arc<SqlModel> {
        self.by_name.get(node.name()).unwrap_or(node)
    }

    fn materialized_nodes(
        &self,
        start_node: &Arc<SqlModel>,
        include_start_node: bool,
    ) -> Vec<Arc<SqlModel>> {
        fn visit<'a>(
            definitions: &'a Definitions,
            node: &'a Arc<SqlModel>,
            visited: &mut HashSet<&'a str>,
            out: &mut Vec<Arc<SqlModel>>,
        ) {
            for child in node.references().values() {
                let child = definitions.resolve(child);
                if visited.insert(child.name()) {
                    visit(definitions, child, visited, out);
                    if child.materialization().is_statement() {
                        out.push(Arc::clone(child));
                    }
                }
            }
        }

        let start_node = self.resolve(start_node);
        let mut visited = HashSet::from([start_node.name()]);
        let mut out = Vec::new();
        visit(self, start_node, &mut visited, &mut out);
        if include_start_node {
            out.push(Arc::clone(start_node));
        }
        out
    }
}

// ── Statement compilation ───────────────────────────────────────────────

struct StatementCompiler<'a> {
    dialect: Dialect,
    definitions: &'a Definitions,
    root: &'a Arc<SqlModel>,
    /// Read persisted nodes by name instead of defining them as CTEs.
    persisted_are_opaque: bool,
    visited: HashSet<&'a str>,
    ctes: Vec<(String, String)>,
}

impl<'a> StatementCompiler<'a> {
    fn new(
        dialect: Dialect,
        definitions: &'a Definitions,
        root: &'a Arc<SqlModel>,
        persisted_are_opaque: bool,
    ) -> Self {
        Self {
            dialect,
            definitions,
            root,
            persisted_are_opaque,
            visited: HashSet::from([root.name()]),
            ctes: Vec::new(),
        }
    }

    fn compile(mut self) -> Result<String, GeneratorError> {
        let root = self.root;
        root.validate_columns(self.dialect)?;
        self.collect(root)?;
        let body = self.render_body(root)?;

        #[cfg(feature = "tracing")]
        tracing::debug!(
            root = self.root.name(),
            dialect = %self.dialect,
            ctes = self.ctes.len(),
            "compiled statement"
        );

        if self.ctes.is_empty() {
            return Ok(body);
        }
        let definitions = self
            .ctes
            .iter()
            .map(|(name, sql)| format!("{} as (\n{sql}\n)", quote_identifier(self.dialect, name)))
            .collect::<Vec<_>>()
            .join(",\n");
        Ok(format!("with {definitions}\n{body}"))
    }

    fn is_opaque(&self, node: &SqlModel) -> bool {
        self.persisted_are_opaque && node.materialization().is_persisted()
    }

    /// Post-order walk adding each CTE after the CTEs it uses.
    fn collect(&mut self, node: &'a Arc<SqlModel>) -> Result<(), GeneratorError> {
        let definitions = self.definitions;
        for child in node.references().values() {
            let child = definitions.resolve(child);
            if !self.visited.insert(child.name()) {
                continue;
            }
            if self.is_opaque(child) || is_inlined(child) {
                continue;
            }
            self.collect(child)?;
            child.validate_columns(self.dialect)?;
            let sql = self.render_body(child)?;
            self.ctes.push((child.name().to_owned(), sql));
        }
        Ok(())
    }

    fn render_body(&self, node: &SqlModel) -> Result<String, GeneratorError> {
        node.resolved_template().render(|kind, field| {
            let child = match kind {
                FieldKind::Reference => node.reference(field),
                FieldKind::Placeholder => None,
            };
            let Some(child) = child else {
                return Err(GeneratorError::UnresolvedField {
                    model: node.name().to_owned(),
                    field: field.to_owned(),
                });
            };
            let child = self.definitions.resolve(child);
            if is_inlined(child) {
                self.render_body(child)
            } else {
                Ok(quote_identifier(self.dialect, child.name()))
            }
        })
    }
}
