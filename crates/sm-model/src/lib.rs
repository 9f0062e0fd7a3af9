#![forbid(unsafe_code)]

mod expression;
mod graph;
mod model;

pub use expression::{ExprArg, Expression, ExpressionKind, ExpressionToken};
pub use graph::{
    FoundNode, NodeInfo, RefPath, find_node, find_nodes, get_graph_nodes_info, get_node,
    get_node_info_selected_node, replace_node_in_graph, replace_non_start_node_in_graph,
    set_placeholders,
};
pub use model::{Materialization, NodeKey, PlaceholderValue, SqlModel, SqlModelBuilder};

use sm_dialect::DialectError;
use sm_template::TemplateError;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExpressionError {
    #[error("template {template:?} has {expected} '{{}}' slots but {given} arguments were given")]
    ArgumentCount {
        template: String,
        expected: usize,
        given: usize,
    },
    #[error("expression references model {model} and can only be rendered as part of a model")]
    UnresolvedModelReference { model: String },
    #[error(transparent)]
    Dialect(#[from] DialectError),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ModelError {
    #[error("{model}: template uses placeholder {name:?} but no value was provided")]
    MissingPlaceholder { model: String, name: String },
    #[error("{model}: placeholder {name:?} was provided but the template does not use it")]
    UnusedPlaceholder { model: String, name: String },
    #[error("{model}: value of placeholder {name:?} contains placeholders itself")]
    NestedPlaceholder { model: String, name: String },
    #[error("{model}: template uses reference {name:?} but no model was provided")]
    MissingReference { model: String, name: String },
    #[error("{model}: reference {name:?} was provided but the template does not use it")]
    UnusedReference { model: String, name: String },
    #[error(transparent)]
    Template(#[from] TemplateError),
    #[error(transparent)]
    Expression(#[from] ExpressionError),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("reference path {path} does not resolve: no reference {missing:?}")]
    PathNotFound { path: RefPath, missing: String },
    #[error("reference path is empty; the start node itself cannot be replaced here")]
    EmptyPath,
    #[error(transparent)]
    Model(#[from] ModelError),
}
