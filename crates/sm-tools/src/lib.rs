#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sm_dialect::{Dialect, DialectError};
use sm_generator::{GeneratedSqlStatement, GeneratorError, to_sql, to_sql_materialized_nodes};
use sm_model::{
    GraphError, Materialization, ModelError, NodeInfo, PlaceholderValue, RefPath, SqlModel,
    SqlModelBuilder, get_graph_nodes_info, get_node_info_selected_node,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ToolError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("model {id:?} is defined more than once")]
    DuplicateModel { id: String },
    #[error("model {referenced_by:?} references unknown model {id:?}")]
    UnknownModel { id: String, referenced_by: String },
    #[error("models form a cycle through {id:?}")]
    Cycle { id: String },
    #[error("no dialect given on the command line or in the graph document")]
    MissingDialect,
    #[error("invalid arguments: {0}")]
    Usage(String),
    #[error(transparent)]
    Dialect(#[from] DialectError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Generator(#[from] GeneratorError),
}

// ── Graph documents ─────────────────────────────────────────────────────

/// A model graph written as JSON, models referring to each other by id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dialect: Option<Dialect>,
    /// Id of the model to compile.
    pub root: String,
    pub models: Vec<ModelDocument>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDocument {
    pub id: String,
    /// Defaults to `id`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generic_name: Option<String>,
    pub sql: String,
    #[serde(default)]
    pub placeholders: BTreeMap<String, PlaceholderValue>,
    /// Reference name to model id.
    #[serde(default)]
    pub references: BTreeMap<String, String>,
    #[serde(default = "default_materialization")]
    pub materialization: Materialization,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub materialization_name: Option<String>,
}

fn default_materialization() -> Materialization {
    Materialization::Cte
}

impl GraphDocument {
    pub fn from_path(path: &Path) -> Result<Self, ToolError> {
        let body = fs::read_to_string(path)?;
        Self::from_json(&body)
    }

    pub fn from_json(body: &str) -> Result<Self, ToolError> {
        Ok(serde_json::from_str(body)?)
    }

    /// Build every model reachable from `root` and return the root node.
    /// Models referenced from several places are built once and shared.
    pub fn build(&self) -> Result<Arc<SqlModel>, ToolError> {
        let mut by_id: HashMap<&str, &ModelDocument> = HashMap::with_capacity(self.models.len());
        for model in &self.models {
            if by_id.insert(model.id.as_str(), model).is_some() {
                return Err(ToolError::DuplicateModel {
                    id: model.id.clone(),
                });
            }
        }
        let mut state = HashMap::new();
        build_model(&self.root, &by_id, &mut state)
    }
}

enum BuildState {
    InProgress,
    Built(Arc<SqlModel>),
}

fn build_model<'d>(
    id: &'d str,
    by_id: &HashMap<&'d str, &'d ModelDocument>,
    state: &mut HashMap<&'d str, BuildState>,
) -> Result<Arc<SqlModel>, ToolError> {
    match state.get(id) {
        Some(BuildState::Built(model)) => return Ok(Arc::clone(model)),
        Some(BuildState::InProgress) => return Err(ToolError::Cycle { id: id.to_owned() }),
        None => {}
    }
    state.insert(id, BuildState::InProgress);

    let document = by_id.get(id).copied().ok_or_else(|| ToolError::UnknownModel {
        id: id.to_owned(),
        referenced_by: "<root>".to_owned(),
    })?;
    let mut builder = SqlModelBuilder::new(
        document.generic_name.as_deref().unwrap_or(&document.id),
        &document.sql,
    )
    .materialization(document.materialization);
    if let Some(name) = &document.materialization_name {
        builder = builder.materialization_name(name.clone());
    }
    for (name, value) in &document.placeholders {
        builder = builder.placeholder(name.clone(), value.clone());
    }
    for (name, target) in &document.references {
        if !by_id.contains_key(target.as_str()) {
            return Err(ToolError::UnknownModel {
                id: target.clone(),
                referenced_by: id.to_owned(),
            });
        }
        let child = build_model(target, by_id, state)?;
        builder = builder.reference(name.clone(), child);
    }

    let model = builder.build()?;
    tracing::debug!(id, name = model.name(), "built model");
    state.insert(id, BuildState::Built(Arc::clone(&model)));
    Ok(model)
}

// ── Rendering ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputMode {
    /// One select with every dependency as a CTE.
    #[default]
    Sql,
    /// Ordered create/select statements.
    Statements,
    /// Per-node diagnostics.
    Nodes,
}

impl FromStr for OutputMode {
    type Err = ToolError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "sql" => Ok(Self::Sql),
            "statements" => Ok(Self::Statements),
            "nodes" => Ok(Self::Nodes),
            other => Err(ToolError::Usage(format!(
                "unsupported mode {other:?}; expected sql, statements or nodes"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CliOptions {
    pub graph: Option<PathBuf>,
    /// Overrides the document's dialect.
    pub dialect: Option<Dialect>,
    pub mode: OutputMode,
    pub include_start_node: bool,
    /// Restrict `nodes` output to the node at this path.
    pub path: Option<RefPath>,
    pub verbose: bool,
}

impl Default for CliOptions {
    fn default() -> Self {
        Self {
            graph: None,
            dialect: None,
            mode: OutputMode::Sql,
            include_start_node: true,
            path: None,
            verbose: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CliCommand {
    Run(CliOptions),
    Help,
}

impl CliOptions {
    /// Parse arguments, program name excluded.
    pub fn parse<I>(args: I) -> Result<CliCommand, ToolError>
    where
        I: IntoIterator<Item = String>,
    {
        let mut options = Self::default();
        let mut args = args.into_iter();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--graph" => {
                    let value = args
                        .next()
                        .ok_or_else(|| ToolError::Usage("--graph requires a file path".to_owned()))?;
                    options.graph = Some(PathBuf::from(value));
                }
                "--dialect" => {
                    let value = args.next().ok_or_else(|| {
                        ToolError::Usage("--dialect requires postgres, bigquery or athena".to_owned())
                    })?;
                    options.dialect = Some(value.parse()?);
                }
                "--mode" => {
                    let value = args.next().ok_or_else(|| {
                        ToolError::Usage("--mode requires sql, statements or nodes".to_owned())
                    })?;
                    options.mode = value.parse()?;
                }
                "--path" => {
                    let value = args.next().ok_or_else(|| {
                        ToolError::Usage("--path requires reference names joined by '/'".to_owned())
                    })?;
                    options.path = Some(value.split('/').filter(|name| !name.is_empty()).collect());
                }
                "--no-start-node" => options.include_start_node = false,
                "--verbose" | "-v" => options.verbose = true,
                "--help" | "-h" => return Ok(CliCommand::Help),
                other => return Err(ToolError::Usage(format!("unknown argument: {other}"))),
            }
        }
        if options.graph.is_none() {
            return Err(ToolError::Usage("--graph is required".to_owned()));
        }
        Ok(CliCommand::Run(options))
    }
}

/// Render `document` the way `options` asks for.
pub fn render(options: &CliOptions, document: &GraphDocument) -> Result<String, ToolError> {
    let root = document.build()?;
    let dialect = options
        .dialect
        .or(document.dialect)
        .ok_or(ToolError::MissingDialect)?;

    match options.mode {
        OutputMode::Sql => Ok(to_sql(dialect, &root)?),
        OutputMode::Statements => {
            let statements = to_sql_materialized_nodes(dialect, &root, options.include_start_node)?;
            Ok(render_statements(&statements))
        }
        OutputMode::Nodes => match &options.path {
            Some(path) => Ok(get_node_info_selected_node(&root, path)?.to_string()),
            None => Ok(render_nodes_info(&get_graph_nodes_info(&root))),
        },
    }
}

#[must_use]
pub fn render_statements(statements: &[GeneratedSqlStatement]) -> String {
    statements
        .iter()
        .map(|statement| {
            format!(
                "-- {} ({})\n{};\n",
                statement.name, statement.materialization, statement.sql
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[must_use]
pub fn render_nodes_info(infos: &[NodeInfo]) -> String {
    infos
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n\n")
}
