//! SQL parsing and AST utilities shared by the compiler and the orchestrator.
//!
//! Everything here is a thin layer over the third-party `sqlparser` AST:
//! parse/render helpers, mutating-statement rejection, identifier utilities,
//! and the alias-reference convention used to carry extracted ingredient
//! calls through the parser.

use std::ops::ControlFlow;

use simmer_common::{Result, SimmerError};
use sqlparser::ast::{
    visit_expressions, visit_expressions_mut, visit_relations, Expr, Ident, ObjectName, Query,
    Statement, TableWithJoins,
};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;

/// Parse a SQL string into statements under the generic dialect.
pub fn parse_sql(sql: &str) -> Result<Vec<Statement>> {
    let dialect = GenericDialect {};
    Parser::parse_sql(&dialect, sql).map_err(|e| SimmerError::Grammar(e.to_string()))
}

/// Parse a SQL string expected to hold exactly one statement.
pub fn parse_single(sql: &str) -> Result<Statement> {
    let mut stmts = parse_sql(sql)?;
    if stmts.len() != 1 {
        return Err(SimmerError::InvalidQuery(format!(
            "expected exactly one statement, got {}",
            stmts.len()
        )));
    }
    Ok(stmts.remove(0))
}

/// Render a statement back to SQL text.
pub fn render(stmt: &Statement) -> String {
    stmt.to_string()
}

/// Reject anything that is not a plain query.
///
/// Mutating statement kinds get the dedicated message required by the
/// fail-fast validation contract; other non-query kinds are equally invalid.
pub fn validate_executable(stmt: &Statement) -> Result<()> {
    match stmt {
        Statement::Query(_) => Ok(()),
        Statement::Insert { .. }
        | Statement::Update { .. }
        | Statement::Delete { .. }
        | Statement::Drop { .. }
        | Statement::Truncate { .. }
        | Statement::AlterTable { .. }
        | Statement::CreateTable { .. }
        | Statement::CreateView { .. } => Err(SimmerError::InvalidQuery(format!(
            "mutating statement kind is not allowed: {}",
            statement_kind(stmt)
        ))),
        other => Err(SimmerError::InvalidQuery(format!(
            "unsupported statement kind: {}",
            statement_kind(other)
        ))),
    }
}

fn statement_kind(stmt: &Statement) -> &'static str {
    match stmt {
        Statement::Query(_) => "QUERY",
        Statement::Insert { .. } => "INSERT",
        Statement::Update { .. } => "UPDATE",
        Statement::Delete { .. } => "DELETE",
        Statement::Drop { .. } => "DROP",
        Statement::Truncate { .. } => "TRUNCATE",
        Statement::AlterTable { .. } => "ALTER TABLE",
        Statement::CreateTable { .. } => "CREATE TABLE",
        Statement::CreateView { .. } => "CREATE VIEW",
        _ => "OTHER",
    }
}

/// Quote an identifier for direct inclusion in generated SQL text.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote a string literal for direct inclusion in generated SQL text.
pub fn quote_literal(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

pub fn object_name_to_string(n: &ObjectName) -> String {
    n.0.iter()
        .map(|i| i.value.clone())
        .collect::<Vec<_>>()
        .join(".")
}

pub fn compound_ident_to_string(parts: &[Ident]) -> String {
    parts
        .iter()
        .map(|i| i.value.clone())
        .collect::<Vec<_>>()
        .join(".")
}

// ---------------------------------------------------------------------------
// Alias references
// ---------------------------------------------------------------------------
//
// The extractor replaces each `{{ Ingredient(...) }}` span with a quoted
// identifier of the form `"{{A}}"`. That token parses as an ordinary column
// reference, so the rewritten text is always valid parser input, while the
// `{{...}}` shape stays pattern-matchable during later AST passes.

/// Render the identifier text for an alias reference.
pub fn alias_ref_text(alias: &str) -> String {
    format!("{{{{{alias}}}}}")
}

/// Render a quoted alias reference for inclusion in SQL text.
pub fn alias_ref_sql(alias: &str) -> String {
    quote_ident(&alias_ref_text(alias))
}

/// Extract the alias name when an identifier is an alias reference.
pub fn ident_alias(ident: &Ident) -> Option<&str> {
    let v = ident.value.as_str();
    v.strip_prefix("{{")?.strip_suffix("}}")
}

/// Extract the alias name when an expression is a bare alias reference.
pub fn expr_alias(expr: &Expr) -> Option<&str> {
    match expr {
        Expr::Identifier(id) => ident_alias(id),
        _ => None,
    }
}

/// Collect every alias referenced anywhere under `node`, in no particular order.
pub fn collect_alias_refs<V: sqlparser::ast::Visit>(node: &V) -> Vec<String> {
    let mut found = Vec::new();
    let _ = visit_expressions(node, |e: &Expr| {
        if let Some(alias) = expr_alias(e) {
            if !found.iter().any(|f| f == alias) {
                found.push(alias.to_string());
            }
        }
        ControlFlow::<()>::Continue(())
    });
    found
}

/// True when any alias reference remains under `node`.
pub fn contains_alias_ref<V: sqlparser::ast::Visit>(node: &V) -> bool {
    !collect_alias_refs(node).is_empty()
}

/// Replace every reference to `alias` under `node` with `replacement`.
///
/// Returns the number of replaced occurrences.
pub fn replace_alias_ref<V: sqlparser::ast::VisitMut>(
    node: &mut V,
    alias: &str,
    replacement: &Expr,
) -> usize {
    let mut replaced = 0usize;
    let _ = visit_expressions_mut(node, |e: &mut Expr| {
        if expr_alias(e) == Some(alias) {
            *e = replacement.clone();
            replaced += 1;
        }
        ControlFlow::<()>::Continue(())
    });
    replaced
}

/// Collect distinct table names referenced under `node` (FROM/JOIN relations).
pub fn collect_relation_names<V: sqlparser::ast::Visit>(node: &V) -> Vec<String> {
    let mut names = Vec::new();
    let _ = visit_relations(node, |name: &ObjectName| {
        let n = object_name_to_string(name);
        if !names.iter().any(|x| x == &n) {
            names.push(n);
        }
        ControlFlow::<()>::Continue(())
    });
    names
}

// ---------------------------------------------------------------------------
// Fragment re-parse helpers
// ---------------------------------------------------------------------------

/// Parse a FROM-clause fragment (`t1 JOIN t2 ON ...`) into a [`TableWithJoins`].
///
/// Bootstrapping node construction through the parser keeps us independent of
/// the AST's struct-literal field set across `sqlparser` releases.
pub fn parse_table_with_joins(fragment: &str) -> Result<TableWithJoins> {
    let stmt = parse_single(&format!("SELECT 1 FROM {fragment}"))?;
    let Statement::Query(q) = stmt else {
        return Err(SimmerError::InvalidQuery(
            "fragment did not parse as a query".to_string(),
        ));
    };
    let sqlparser::ast::SetExpr::Select(select) = *q.body else {
        return Err(SimmerError::InvalidQuery(
            "fragment did not parse as a select".to_string(),
        ));
    };
    let mut from = select.from;
    if from.len() != 1 {
        return Err(SimmerError::InvalidQuery(
            "fragment must contain exactly one FROM source".to_string(),
        ));
    }
    Ok(from.remove(0))
}

/// Parse an expression fragment into an [`Expr`].
pub fn parse_expr(fragment: &str) -> Result<Expr> {
    let stmt = parse_single(&format!("SELECT {fragment}"))?;
    let Statement::Query(q) = stmt else {
        return Err(SimmerError::InvalidQuery(
            "fragment did not parse as a query".to_string(),
        ));
    };
    let sqlparser::ast::SetExpr::Select(select) = *q.body else {
        return Err(SimmerError::InvalidQuery(
            "fragment did not parse as a select".to_string(),
        ));
    };
    match select.projection.into_iter().next() {
        Some(sqlparser::ast::SelectItem::UnnamedExpr(e)) => Ok(e),
        _ => Err(SimmerError::InvalidQuery(
            "fragment did not parse as an expression".to_string(),
        )),
    }
}

/// Extract the inner [`Query`] from a `Statement::Query`.
pub fn into_query(stmt: Statement) -> Result<Box<Query>> {
    match stmt {
        Statement::Query(q) => Ok(q),
        other => Err(SimmerError::InvalidQuery(format!(
            "expected a query, got {}",
            statement_kind(&other)
        ))),
    }
}
