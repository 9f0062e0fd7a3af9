use std::collections::BTreeMap;
use std::sync::Arc;

use sm_dialect::{Dialect, SqlLiteral, quote_identifier, render_literal};
use sm_template::Template;

use crate::ExpressionError;
use crate::model::SqlModel;

#[derive(Debug, Clone, PartialEq)]
pub enum ExpressionToken {
    /// SQL text, emitted as-is.
    Raw(String),
    /// A value rendered as a dialect literal.
    Literal(SqlLiteral),
    Identifier(String),
    /// A column of the model the expression is evaluated against; may be
    /// qualified with a table name at render time.
    ColumnReference(String),
    /// Another model; becomes the name of its CTE or table once compiled.
    ModelReference(Arc<SqlModel>),
    Expression(Expression),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ExpressionKind {
    #[default]
    Plain,
    /// Needs parentheses when used as part of a larger expression.
    NonAtomic,
    /// Always evaluates to exactly one value.
    SingleValue,
    AggregateFunction,
    WindowFunction,
    /// A sub-query that does not depend on the row it is used in.
    IndependentSubquery,
}

/// Argument to [`Expression::construct`].
#[derive(Debug, Clone, PartialEq)]
pub enum ExprArg {
    Expression(Expression),
    Literal(SqlLiteral),
}

impl From<Expression> for ExprArg {
    fn from(value: Expression) -> Self {
        Self::Expression(value)
    }
}

impl From<&Expression> for ExprArg {
    fn from(value: &Expression) -> Self {
        Self::Expression(value.clone())
    }
}

impl From<SqlLiteral> for ExprArg {
    fn from(value: SqlLiteral) -> Self {
        Self::Literal(value)
    }
}

impl From<bool> for ExprArg {
    fn from(value: bool) -> Self {
        Self::Literal(value.into())
    }
}

impl From<i64> for ExprArg {
    fn from(value: i64) -> Self {
        Self::Literal(value.into())
    }
}

impl From<i32> for ExprArg {
    fn from(value: i32) -> Self {
        Self::Literal(value.into())
    }
}

impl From<f64> for ExprArg {
    fn from(value: f64) -> Self {
        Self::Literal(value.into())
    }
}

impl From<&str> for ExprArg {
    fn from(value: &str) -> Self {
        Self::Literal(value.into())
    }
}

impl From<String> for ExprArg {
    fn from(value: String) -> Self {
        Self::Literal(value.into())
    }
}

/// A fragment of SQL built from tokens. Immutable; composed by nesting.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Expression {
    tokens: Vec<ExpressionToken>,
    kind: ExpressionKind,
}

impl Expression {
    #[must_use]
    pub fn new(tokens: Vec<ExpressionToken>) -> Self {
        Self {
            tokens,
            kind: ExpressionKind::Plain,
        }
    }

    #[must_use]
    pub fn with_kind(self, kind: ExpressionKind) -> Self {
        Self { kind, ..self }
    }

    #[must_use]
    pub fn raw(sql: impl Into<String>) -> Self {
        Self::new(vec![ExpressionToken::Raw(sql.into())])
    }

    #[must_use]
    pub fn literal(value: impl Into<SqlLiteral>) -> Self {
        Self::new(vec![ExpressionToken::Literal(value.into())])
    }

    #[must_use]
    pub fn string_value(value: &str) -> Self {
        Self::literal(value)
    }

    #[must_use]
    pub fn identifier(name: impl Into<String>) -> Self {
        Self::new(vec![ExpressionToken::Identifier(name.into())])
    }

    #[must_use]
    pub fn column_reference(name: impl Into<String>) -> Self {
        Self::new(vec![ExpressionToken::ColumnReference(name.into())])
    }

    #[must_use]
    pub fn model_reference(model: Arc<SqlModel>) -> Self {
        Self::new(vec![ExpressionToken::ModelReference(model)])
    }

    /// Fill the `{}` slots of `template` left to right with `args`.
    ///
    /// Plain values become literals. A non-atomic argument is wrapped in
    /// parentheses unless the template is exactly `{}`.
    pub fn construct(
        template: &str,
        args: impl IntoIterator<Item = ExprArg>,
    ) -> Result<Self, ExpressionError> {
        let args: Vec<ExprArg> = args.into_iter().collect();
        let parts: Vec<&str> = template.split("{}").collect();
        if parts.len() - 1 != args.len() {
            return Err(ExpressionError::ArgumentCount {
                template: template.to_owned(),
                expected: parts.len() - 1,
                given: args.len(),
            });
        }

        let wrap_non_atomic = template != "{}";
        let mut tokens = Vec::new();
        let slots = args.into_iter().map(Some).chain(std::iter::once(None));
        for (part, arg) in parts.iter().zip(slots) {
            if !part.is_empty() {
                tokens.push(ExpressionToken::Raw((*part).to_owned()));
            }
            match arg {
                Some(ExprArg::Literal(value)) => tokens.push(ExpressionToken::Literal(value)),
                Some(ExprArg::Expression(expr))
                    if wrap_non_atomic && expr.kind == ExpressionKind::NonAtomic =>
                {
                    tokens.push(ExpressionToken::Raw("(".to_owned()));
                    tokens.push(ExpressionToken::Expression(expr));
                    tokens.push(ExpressionToken::Raw(")".to_owned()));
                }
                Some(ExprArg::Expression(expr)) => tokens.push(ExpressionToken::Expression(expr)),
                None => {}
            }
        }
        Ok(Self::new(tokens))
    }

    /// `{expr} as "name"`.
    #[must_use]
    pub fn construct_expr_as_name(expr: Expression, name: impl Into<String>) -> Self {
        Self::new(vec![
            ExpressionToken::Expression(expr),
            ExpressionToken::Raw(" as ".to_owned()),
            ExpressionToken::Identifier(name.into()),
        ])
    }

    #[must_use]
    pub fn tokens(&self) -> &[ExpressionToken] {
        &self.tokens
    }

    #[must_use]
    pub fn kind(&self) -> ExpressionKind {
        self.kind
    }

    #[must_use]
    pub fn is_constant(&self) -> bool {
        if matches!(
            self.kind,
            ExpressionKind::AggregateFunction
                | ExpressionKind::WindowFunction
                | ExpressionKind::IndependentSubquery
        ) {
            return false;
        }
        self.tokens.iter().all(|token| match token {
            ExpressionToken::Raw(_) | ExpressionToken::Literal(_) => true,
            ExpressionToken::Identifier(_)
            | ExpressionToken::ColumnReference(_)
            | ExpressionToken::ModelReference(_) => false,
            ExpressionToken::Expression(expr) => expr.is_constant(),
        })
    }

    #[must_use]
    pub fn is_single_value(&self) -> bool {
        match self.kind {
            ExpressionKind::SingleValue => true,
            ExpressionKind::AggregateFunction
            | ExpressionKind::WindowFunction
            | ExpressionKind::IndependentSubquery => false,
            ExpressionKind::Plain | ExpressionKind::NonAtomic => {
                self.tokens.iter().all(|token| match token {
                    ExpressionToken::Raw(_) | ExpressionToken::Literal(_) => true,
                    ExpressionToken::Identifier(_)
                    | ExpressionToken::ColumnReference(_)
                    | ExpressionToken::ModelReference(_) => false,
                    ExpressionToken::Expression(expr) => expr.is_single_value(),
                })
            }
        }
    }

    #[must_use]
    pub fn is_independent_subquery(&self) -> bool {
        self.kind == ExpressionKind::IndependentSubquery
    }

    #[must_use]
    pub fn has_aggregate_function(&self) -> bool {
        self.kind == ExpressionKind::AggregateFunction
            || self.nested().any(Expression::has_aggregate_function)
    }

    #[must_use]
    pub fn has_windowed_aggregate_function(&self) -> bool {
        self.kind == ExpressionKind::WindowFunction
            || self.nested().any(Expression::has_windowed_aggregate_function)
    }

    /// Distinct column references, in order of appearance.
    #[must_use]
    pub fn column_references(&self) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        self.collect_columns(&mut out);
        out
    }

    /// Models referenced anywhere in the expression, keyed by the reference
    /// name used in rendered templates.
    #[must_use]
    pub fn model_references(&self) -> BTreeMap<String, Arc<SqlModel>> {
        let mut out = BTreeMap::new();
        self.collect_models(&mut out);
        out
    }

    /// Render into a template fragment. Model references become template
    /// references, to be resolved by the compiler.
    #[must_use]
    pub fn to_template(&self, dialect: Dialect, table_name: Option<&str>) -> Template {
        let mut template = Template::new();
        self.append_to(&mut template, dialect, table_name);
        template
    }

    pub fn to_sql(&self, dialect: Dialect) -> Result<String, ExpressionError> {
        self.render(dialect, None)
    }

    /// Render with every column reference qualified by `table_name`.
    pub fn to_sql_with_table(
        &self,
        dialect: Dialect,
        table_name: &str,
    ) -> Result<String, ExpressionError> {
        self.render(dialect, Some(table_name))
    }

    fn render(&self, dialect: Dialect, table_name: Option<&str>) -> Result<String, ExpressionError> {
        let models = self.model_references();
        self.to_template(dialect, table_name).render(|_, key| {
            let model = models
                .get(key)
                .map_or_else(|| key.to_owned(), |model| model.name().to_owned());
            Err(ExpressionError::UnresolvedModelReference { model })
        })
    }

    fn append_to(&self, out: &mut Template, dialect: Dialect, table_name: Option<&str>) {
        for token in &self.tokens {
            match token {
                ExpressionToken::Raw(sql) => out.push_text(sql),
                ExpressionToken::Literal(value) => out.push_text(&render_literal(dialect, value)),
                ExpressionToken::Identifier(name) => {
                    out.push_text(&quote_identifier(dialect, name));
                }
                ExpressionToken::ColumnReference(name) => {
                    if let Some(table) = table_name {
                        out.push_text(&quote_identifier(dialect, table));
                        out.push_text(".");
                    }
                    out.push_text(&quote_identifier(dialect, name));
                }
                ExpressionToken::ModelReference(model) => out.push_reference(model.reference_key()),
                ExpressionToken::Expression(expr) => expr.append_to(out, dialect, table_name),
            }
        }
    }

    fn nested(&self) -> impl Iterator<Item = &Expression> {
        self.tokens.iter().filter_map(|token| match token {
            ExpressionToken::Expression(expr) => Some(expr),
            _ => None,
        })
    }

    fn collect_columns<'a>(&'a self, out: &mut Vec<&'a str>) {
        for token in &self.tokens {
            match token {
                ExpressionToken::ColumnReference(name) => {
                    if !out.contains(&name.as_str()) {
                        out.push(name);
                    }
                }
                ExpressionToken::Expression(expr) => expr.collect_columns(out),
                _ => {}
            }
        }
    }

    fn collect_models(&self, out: &mut BTreeMap<String, Arc<SqlModel>>) {
        for token in &self.tokens {
            match token {
                ExpressionToken::ModelReference(model) => {
                    out.insert(model.reference_key(), Arc::clone(model));
                }
                ExpressionToken::Expression(expr) => expr.collect_models(out),
                _ => {}
            }
        }
    }
}
