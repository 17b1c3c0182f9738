//! Per-subquery context analysis.
//!
//! For one subquery unit this module computes the "abstracted selects": the
//! minimal projection/filter per referenced base table sufficient to supply
//! every ingredient call in the unit with exactly the distinct values it
//! needs. This is the engine's core performance lever: the number of values
//! forwarded to an expensive call is bounded by the post-filter cardinality,
//! not the whole table. It also infers generation constraints for each call
//! from its syntactic context.

use std::collections::{BTreeMap, BTreeSet};

use simmer_backend::SchemaMap;
use simmer_ingredient::{GenConstraints, OptionsSpec, OutputType};
use simmer_sql::{expr_alias, object_name_to_string, quote_ident};
use sqlparser::ast::{
    BinaryOperator, Expr, GroupByExpr, OrderByExpr, Select, SelectItem, TableFactor, Value,
};
use tracing::warn;

use crate::extract::AliasTable;

/// A table referenced by a unit's FROM clause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FromTable {
    pub name: String,
    /// FROM-clause alias, when present.
    pub alias: Option<String>,
    /// Derived subqueries and CTE references are deferred, not selected.
    pub derived: bool,
}

/// Minimal select for one table of one unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbstractedSelect {
    pub table: String,
    /// Whether projection/predicate pushdown was actually applied; `false`
    /// means the whole table is selected.
    pub constrained: bool,
    /// `None` for aliased derived tables: the computation is deferred to the
    /// lazy table registry instead.
    pub select_sql: Option<String>,
}

/// One node of the deepest-first subquery traversal.
#[derive(Debug)]
pub struct SubqueryUnit {
    pub index: usize,
    /// An ingredient call exists in a subquery nested below this unit; used
    /// to relax predicate pushdown upward.
    pub has_nested_ingredient: bool,
    /// Aliases already executed within this unit. Calls are cached per unit
    /// but may re-execute with different bound values across sibling units.
    pub executed: BTreeSet<String>,
}

impl SubqueryUnit {
    pub fn new(index: usize, has_nested_ingredient: bool) -> Self {
        Self {
            index,
            has_nested_ingredient,
            executed: BTreeSet::new(),
        }
    }
}

/// Collect the FROM tables of a select, joins included.
pub fn from_tables(select: &Select) -> Vec<FromTable> {
    let mut out = Vec::new();
    for twj in &select.from {
        collect_factor(&twj.relation, &mut out);
        for join in &twj.joins {
            collect_factor(&join.relation, &mut out);
        }
    }
    out
}

fn collect_factor(factor: &TableFactor, out: &mut Vec<FromTable>) {
    match factor {
        TableFactor::Table { name, alias, .. } => out.push(FromTable {
            name: object_name_to_string(name),
            alias: alias.as_ref().map(|a| a.name.value.clone()),
            derived: false,
        }),
        TableFactor::Derived { alias, .. } => {
            if let Some(alias) = alias {
                out.push(FromTable {
                    name: alias.name.value.clone(),
                    alias: None,
                    derived: true,
                });
            }
        }
        _ => {}
    }
}

/// Compute the abstracted selects for one unit.
///
/// `revisions` maps base tables to their current session-scoped temp
/// revision; generated SQL reads through the revision (aliased back to the
/// base name so column qualifiers keep resolving) so later units observe
/// columns added by earlier ones.
pub fn abstracted_table_selects(
    select: &Select,
    order_by: &[OrderByExpr],
    unit: &SubqueryUnit,
    aliases: &AliasTable,
    schema: &SchemaMap,
    revisions: &BTreeMap<String, String>,
    deferred_names: &BTreeSet<String>,
) -> Vec<AbstractedSelect> {
    let tables = from_tables(select);
    let mut out = Vec::new();

    for table in &tables {
        // Alias-reference table names resolve later; derived tables and CTE
        // references defer to the lazy registry.
        if table.derived || table.name.starts_with("{{") || deferred_names.contains(&table.name) {
            out.push(AbstractedSelect {
                table: table.name.clone(),
                constrained: false,
                select_sql: None,
            });
            continue;
        }
        let Some(table_schema) = schema.get(&table.name) else {
            warn!(table = %table.name, "table not in schema; selecting whole table");
            out.push(AbstractedSelect {
                table: table.name.clone(),
                constrained: false,
                select_sql: Some(whole_table_select(&table.name, table, revisions)),
            });
            continue;
        };

        let needed = needed_columns(select, order_by, table, &tables, schema, aliases);
        let predicates = safe_predicates(select, unit, table, &tables, schema);

        let projection = match needed {
            Needed::All => "*".to_string(),
            Needed::Columns(cols) => {
                let mut cols: Vec<&String> = cols.iter().collect();
                cols.sort();
                let known: Vec<String> = cols
                    .into_iter()
                    .filter(|c| table_schema.contains_key(*c))
                    .map(|c| quote_ident(c))
                    .collect();
                if known.is_empty() {
                    "*".to_string()
                } else {
                    known.join(", ")
                }
            }
        };

        let constrained = projection != "*" || !predicates.is_empty();
        let mut sql = format!(
            "SELECT {projection} FROM {}",
            from_clause(&table.name, table, revisions)
        );
        if !predicates.is_empty() {
            let rendered: Vec<String> = predicates.iter().map(ToString::to_string).collect();
            sql.push_str(&format!(" WHERE {}", rendered.join(" AND ")));
        }
        out.push(AbstractedSelect {
            table: table.name.clone(),
            constrained,
            select_sql: Some(sql),
        });
    }
    out
}

fn from_clause(base: &str, table: &FromTable, revisions: &BTreeMap<String, String>) -> String {
    let source = revisions.get(base).map(String::as_str).unwrap_or(base);
    let qualifier = table.alias.as_deref().unwrap_or(base);
    if source == qualifier {
        quote_ident(source)
    } else {
        format!("{} AS {}", quote_ident(source), quote_ident(qualifier))
    }
}

fn whole_table_select(base: &str, table: &FromTable, revisions: &BTreeMap<String, String>) -> String {
    format!("SELECT * FROM {}", from_clause(base, table, revisions))
}

enum Needed {
    All,
    Columns(BTreeSet<String>),
}

/// Columns of `table` referenced by the unit's output, ORDER/GROUP/HAVING,
/// or any ingredient-call argument.
fn needed_columns(
    select: &Select,
    order_by: &[OrderByExpr],
    table: &FromTable,
    tables: &[FromTable],
    schema: &SchemaMap,
    aliases: &AliasTable,
) -> Needed {
    for item in &select.projection {
        if matches!(
            item,
            SelectItem::Wildcard(_) | SelectItem::QualifiedWildcard(_, _)
        ) {
            return Needed::All;
        }
    }

    let mut cols = BTreeSet::new();
    let mut add_expr = |e: &Expr| {
        for (qualifier, name) in columns_in_expr(e) {
            if column_belongs(&qualifier, &name, table, tables, schema) {
                cols.insert(name);
            }
        }
    };

    for item in &select.projection {
        match item {
            SelectItem::UnnamedExpr(e) | SelectItem::ExprWithAlias { expr: e, .. } => add_expr(e),
            _ => {}
        }
    }
    if let GroupByExpr::Expressions(exprs, _) = &select.group_by {
        for e in exprs {
            add_expr(e);
        }
    }
    if let Some(having) = &select.having {
        add_expr(having);
    }
    for o in order_by {
        add_expr(&o.expr);
    }
    // Predicate branches that hold a call supply its comparison columns
    // (options/type inference reads them from the materialized subset).
    if let Some(selection) = &select.selection {
        let mut conjuncts = Vec::new();
        split_conjuncts(selection, &mut conjuncts);
        for conjunct in conjuncts {
            if simmer_sql::contains_alias_ref(conjunct) {
                add_expr(conjunct);
            }
        }
    }
    // Every column an ingredient call reads must survive the projection.
    for record in aliases.iter() {
        for target in record.columns() {
            if target.table == table.name
                || table.alias.as_deref() == Some(target.table.as_str())
            {
                cols.insert(target.column.clone());
            }
        }
    }

    if cols.is_empty() {
        Needed::All
    } else {
        Needed::Columns(cols)
    }
}

/// Conjunctive predicate branches safe to evaluate before any ingredient in
/// this unit has run: no alias references, no subqueries once an ingredient
/// exists below this unit, and every column resolvable to `table`.
fn safe_predicates<'a>(
    select: &'a Select,
    unit: &SubqueryUnit,
    table: &FromTable,
    tables: &[FromTable],
    schema: &SchemaMap,
) -> Vec<&'a Expr> {
    let Some(selection) = &select.selection else {
        return Vec::new();
    };
    let mut conjuncts = Vec::new();
    split_conjuncts(selection, &mut conjuncts);
    conjuncts
        .into_iter()
        .filter(|c| predicate_is_safe(c, unit, table, tables, schema))
        .collect()
}

fn split_conjuncts<'a>(expr: &'a Expr, out: &mut Vec<&'a Expr>) {
    match expr {
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => {
            split_conjuncts(left, out);
            split_conjuncts(right, out);
        }
        Expr::Nested(inner) => split_conjuncts(inner, out),
        other => out.push(other),
    }
}

fn predicate_is_safe(
    expr: &Expr,
    unit: &SubqueryUnit,
    table: &FromTable,
    tables: &[FromTable],
    schema: &SchemaMap,
) -> bool {
    if simmer_sql::contains_alias_ref(expr) {
        return false;
    }
    if unit.has_nested_ingredient && contains_subquery(expr) {
        return false;
    }
    columns_in_expr(expr)
        .iter()
        .all(|(qualifier, name)| column_belongs(qualifier, name, table, tables, schema))
}

fn contains_subquery(expr: &Expr) -> bool {
    let mut found = false;
    let _ = sqlparser::ast::visit_expressions(expr, |e: &Expr| {
        if matches!(
            e,
            Expr::Subquery(_) | Expr::InSubquery { .. } | Expr::Exists { .. }
        ) {
            found = true;
        }
        std::ops::ControlFlow::<()>::Continue(())
    });
    found
}

/// `(qualifier, column)` pairs under an expression, alias references skipped.
fn columns_in_expr(expr: &Expr) -> Vec<(Option<String>, String)> {
    let mut out = Vec::new();
    let _ = sqlparser::ast::visit_expressions(expr, |e: &Expr| {
        match e {
            Expr::Identifier(id) => {
                if expr_alias(e).is_none() {
                    out.push((None, id.value.clone()));
                }
            }
            Expr::CompoundIdentifier(parts) if parts.len() == 2 => {
                out.push((Some(parts[0].value.clone()), parts[1].value.clone()));
            }
            _ => {}
        }
        std::ops::ControlFlow::<()>::Continue(())
    });
    out
}

/// Does a column reference resolve to `table` within this unit's FROM set?
fn column_belongs(
    qualifier: &Option<String>,
    name: &str,
    table: &FromTable,
    tables: &[FromTable],
    schema: &SchemaMap,
) -> bool {
    if let Some(q) = qualifier {
        return q == &table.name || table.alias.as_deref() == Some(q.as_str());
    }
    // Unqualified: attribute to the first FROM table whose schema has it.
    for t in tables {
        if let Some(cols) = schema.get(&t.name) {
            if cols.contains_key(name) {
                return t.name == table.name;
            }
        }
    }
    false
}

// ---------------------------------------------------------------------------
// Generation-constraint inference
// ---------------------------------------------------------------------------

/// Infer generation constraints for `alias` from its syntactic context in
/// the unit: output datatype from the compared column's backend type or from
/// literal operands, a list quantifier from membership context, and an
/// options source when the call is compared against a resolvable column.
pub fn infer_constraints(
    select: &Select,
    order_by: &[OrderByExpr],
    alias: &str,
    tables: &[FromTable],
    schema: &SchemaMap,
) -> GenConstraints {
    let mut c = GenConstraints::default();

    {
        let mut visit = |e: &Expr| infer_from_expr(e, alias, tables, schema, &mut c);
        if let Some(selection) = &select.selection {
            walk_expr(selection, &mut visit);
        }
        if let Some(having) = &select.having {
            walk_expr(having, &mut visit);
        }
        for item in &select.projection {
            match item {
                SelectItem::UnnamedExpr(e) | SelectItem::ExprWithAlias { expr: e, .. } => {
                    walk_expr(e, &mut visit)
                }
                _ => {}
            }
        }
        for o in order_by {
            walk_expr(&o.expr, &mut visit);
        }
    }
    // Ordering context implies a comparable, numeric-leaning output.
    for o in order_by {
        if expr_alias(&o.expr) == Some(alias) && c.output_type.is_none() {
            c.output_type = Some(OutputType::Real);
        }
    }

    if c.pattern.is_none() {
        c.pattern = c.output_type.and_then(|t| t.default_pattern().map(String::from));
    }
    c
}

fn infer_from_expr(
    e: &Expr,
    alias: &str,
    tables: &[FromTable],
    schema: &SchemaMap,
    c: &mut GenConstraints,
) {
    match e {
        Expr::BinaryOp { left, op, right } => {
            let (other, is_call) = if expr_alias(left) == Some(alias) {
                (right.as_ref(), true)
            } else if expr_alias(right) == Some(alias) {
                (left.as_ref(), true)
            } else {
                (left.as_ref(), false)
            };
            if !is_call {
                return;
            }
            infer_type_from_operand(other, tables, schema, c);
            if matches!(
                op,
                BinaryOperator::Lt | BinaryOperator::LtEq | BinaryOperator::Gt | BinaryOperator::GtEq
            ) && c.output_type.is_none()
            {
                c.output_type = Some(OutputType::Real);
            }
            if matches!(op, BinaryOperator::Eq) && c.options.is_none() {
                if let Some((table, column)) = resolve_column_ref(other, tables, schema) {
                    c.options = Some(OptionsSpec::Column { table, column });
                }
            }
        }
        Expr::InList { expr, list, .. } => {
            // The call as the membership *field* returns a list; the call as
            // the *target* of IN does not.
            let call_is_field = list.len() == 1 && expr_alias(&list[0]) == Some(alias);
            if call_is_field {
                if c.return_list.is_none() {
                    c.return_list = Some(true);
                }
                infer_type_from_operand(expr, tables, schema, c);
                if c.options.is_none() {
                    if let Some((table, column)) = resolve_column_ref(expr, tables, schema) {
                        c.options = Some(OptionsSpec::Column { table, column });
                    }
                }
            } else if expr_alias(expr) == Some(alias) {
                for item in list {
                    infer_type_from_operand(item, tables, schema, c);
                }
            }
        }
        Expr::Between {
            expr, low, high, ..
        } => {
            if expr_alias(expr) == Some(alias) {
                infer_type_from_operand(low, tables, schema, c);
                infer_type_from_operand(high, tables, schema, c);
                if c.output_type.is_none() {
                    c.output_type = Some(OutputType::Real);
                }
            }
        }
        _ => {}
    }
}

fn infer_type_from_operand(
    other: &Expr,
    tables: &[FromTable],
    schema: &SchemaMap,
    c: &mut GenConstraints,
) {
    if c.output_type.is_some() {
        return;
    }
    if let Some((table, column)) = resolve_column_ref(other, tables, schema) {
        if let Some(t) = schema.get(&table).and_then(|cols| cols.get(&column)) {
            c.output_type = OutputType::from_column_type(*t);
        }
        return;
    }
    if let Expr::Value(v) = other {
        c.output_type = match v {
            Value::Number(n, _) => {
                if n.contains('.') {
                    Some(OutputType::Real)
                } else {
                    Some(OutputType::Integer)
                }
            }
            Value::SingleQuotedString(_) | Value::DoubleQuotedString(_) => Some(OutputType::Text),
            Value::Boolean(_) => Some(OutputType::Boolean),
            _ => None,
        };
    }
}

fn resolve_column_ref(
    e: &Expr,
    tables: &[FromTable],
    schema: &SchemaMap,
) -> Option<(String, String)> {
    match e {
        Expr::Identifier(id) => {
            if expr_alias(e).is_some() {
                return None;
            }
            let name = id.value.clone();
            for t in tables {
                if schema.get(&t.name).is_some_and(|cols| cols.contains_key(&name)) {
                    return Some((t.name.clone(), name));
                }
            }
            None
        }
        Expr::CompoundIdentifier(parts) if parts.len() == 2 => {
            let qualifier = &parts[0].value;
            let name = parts[1].value.clone();
            for t in tables {
                if &t.name == qualifier || t.alias.as_deref() == Some(qualifier.as_str()) {
                    return Some((t.name.clone(), name));
                }
            }
            None
        }
        Expr::Nested(inner) => resolve_column_ref(inner, tables, schema),
        _ => None,
    }
}

/// Recursive walk that stops at subquery boundaries: constraints for a
/// nested unit's calls are inferred when that unit is processed.
fn walk_expr(e: &Expr, f: &mut impl FnMut(&Expr)) {
    f(e);
    match e {
        Expr::BinaryOp { left, right, .. } => {
            walk_expr(left, f);
            walk_expr(right, f);
        }
        Expr::UnaryOp { expr, .. }
        | Expr::Nested(expr)
        | Expr::IsNull(expr)
        | Expr::IsNotNull(expr) => walk_expr(expr, f),
        Expr::InList { expr, list, .. } => {
            walk_expr(expr, f);
            for item in list {
                walk_expr(item, f);
            }
        }
        Expr::Between {
            expr, low, high, ..
        } => {
            walk_expr(expr, f);
            walk_expr(low, f);
            walk_expr(high, f);
        }
        Expr::InSubquery { expr, .. } => walk_expr(expr, f),
        _ => {}
    }
}
