#![forbid(unsafe_code)]

//! Build SQL lazily as a graph of immutable, content-hashed models and
//! compile it for a target database.
//!
//! ```
//! use sqlmodels::{Dialect, SqlModelBuilder, to_sql};
//!
//! let people = SqlModelBuilder::new("Source", "{table}")
//!     .placeholder("table", "\"people\"")
//!     .materialization(sqlmodels::Materialization::Source)
//!     .build()?;
//! let adults = SqlModelBuilder::new("Filter", "select * from {{input}} where age >= {age}")
//!     .placeholder("age", 18)
//!     .reference("input", people)
//!     .build()?;
//! assert_eq!(
//!     to_sql(Dialect::Postgres, &adults)?,
//!     "select * from \"people\" where age >= 18"
//! );
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub use sm_dialect::{
    ColumnNameRules, Dialect, DialectError, PersistedKind, SqlLiteral, create_statement,
    is_athena, is_bigquery, is_postgres, is_valid_column_name, quote_identifier, quote_string,
    render_literal, supports_temporary_tables, validate_column_name,
};
pub use sm_generator::{
    GeneratedSqlStatement, GeneratorError, get_materialized_nodes, to_sql,
    to_sql_materialized_nodes,
};
pub use sm_model::{
    ExprArg, Expression, ExpressionError, ExpressionKind, ExpressionToken, FoundNode, GraphError,
    Materialization, ModelError, NodeInfo, NodeKey, PlaceholderValue, RefPath, SqlModel,
    SqlModelBuilder, find_node, find_nodes, get_graph_nodes_info, get_node,
    get_node_info_selected_node, replace_node_in_graph, replace_non_start_node_in_graph,
    set_placeholders,
};
pub use sm_template::{
    FieldKind, Segment, Template, TemplateError, escape_format_string, format_string,
};
