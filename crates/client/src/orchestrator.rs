//! Recursive execution driver.
//!
//! One orchestrator instance drives one engine entry: extraction, validation,
//! deepest-first subquery processing with fixed-priority ingredient
//! execution, alias splicing, table renaming, lazy-table collection, and the
//! final backend execution. `context`/`options` arguments that are
//! themselves queries re-enter the whole engine through [`Orchestrator::run`]
//! on a nested, non-outermost instance sharing the session.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::time::Instant;

use regex::Regex;
use simmer_backend::{temp, Relation, SchemaMap, Value};
use simmer_common::{Result, SimmerError};
use simmer_compiler::{
    abstracted_table_selects, extract, from_tables, infer_constraints, AliasRecord, AliasTable,
    CallArg, FromTable, LazyTableRegistry, SubqueryUnit,
};
use simmer_ingredient::{
    ColumnTarget, GenConstraints, IngredientKind, IngredientOutput, Invocation, InvocationCtx,
    OptionsSpec,
};
use simmer_sql::{
    alias_ref_text, collect_alias_refs, collect_relation_names, contains_alias_ref, expr_alias,
    into_query, object_name_to_string, parse_single, parse_table_with_joins, quote_ident,
    replace_alias_ref, validate_executable,
};
use sqlparser::ast::{
    Expr, Ident, JoinConstraint, JoinOperator, ObjectName, OrderByExpr, Query, Select, SelectItem,
    SetExpr, Statement, TableFactor, TableWithJoins, Value as AstValue,
};
use tracing::{debug, warn};

use crate::envelope::ResultEnvelope;
use crate::session::Session;

/// A Join-kind result parked until the last alias of its predicate resolves.
#[derive(Debug, Clone)]
struct PendingAlignment {
    left: ColumnTarget,
    right: ColumnTarget,
    table: String,
}

pub struct Orchestrator<'a> {
    session: &'a Session,
    outermost: bool,
    aliases: AliasTable,
    lazy: LazyTableRegistry,
    /// Base table -> current session-scoped temp revision.
    revisions: BTreeMap<String, String>,
    /// Columns added to revisions by Map invocations.
    added_columns: BTreeSet<String>,
    /// Alias -> final expression splice, for occurrences outside the unit
    /// that resolved it (ORDER BY, outer projections).
    resolved: HashMap<String, Expr>,
    /// Alias -> list splice (membership contexts).
    resolved_lists: HashMap<String, Vec<Value>>,
    /// Alias -> table name (Alias-kind results).
    resolved_tables: HashMap<String, String>,
    pending_alignments: Vec<PendingAlignment>,
    schema: SchemaMap,
    /// CTE names registered with the lazy registry.
    deferred_names: BTreeSet<String>,
}

impl<'a> Orchestrator<'a> {
    pub fn outermost(session: &'a Session) -> Self {
        Self::with_state(session, true, AliasTable::new(), BTreeMap::new(), BTreeSet::new(), SchemaMap::new())
    }

    fn with_state(
        session: &'a Session,
        outermost: bool,
        aliases: AliasTable,
        revisions: BTreeMap<String, String>,
        added_columns: BTreeSet<String>,
        schema: SchemaMap,
    ) -> Self {
        Self {
            session,
            outermost,
            aliases,
            lazy: LazyTableRegistry::new(),
            revisions,
            added_columns,
            resolved: HashMap::new(),
            resolved_lists: HashMap::new(),
            resolved_tables: HashMap::new(),
            pending_alignments: Vec::new(),
            schema,
            deferred_names: BTreeSet::new(),
        }
    }

    /// Run one engine entry to completion.
    ///
    /// The session reset is the guaranteed final step of the outermost frame
    /// only, success or failure, so nested calls leave their temp tables
    /// visible to the statement that triggered them.
    pub fn run(mut self, raw: &str) -> Result<ResultEnvelope> {
        let started = Instant::now();
        let result = self.run_inner(raw, started);
        if self.outermost {
            if let Err(e) = self.session.db.reset_session() {
                warn!(error = %e, "session reset failed");
            }
            let outcome = if result.is_ok() { "ok" } else { "error" };
            self.session
                .metrics
                .record_blend(outcome, started.elapsed().as_secs_f64());
        }
        result
    }

    fn run_inner(&mut self, raw: &str, started: Instant) -> Result<ResultEnvelope> {
        let rewritten = extract(raw, &self.session.kitchen, &mut self.aliases)?;
        let stmt = parse_single(&rewritten)?;
        validate_executable(&stmt)?;

        if !statement_contains_alias(&stmt) {
            // Fast path: plain SQL, executed verbatim.
            let sql = stmt.to_string();
            let result = self.execute(&sql)?;
            return Ok(self.envelope(result, sql, started, false));
        }

        self.schema = self.session.db.schema()?;
        let mut query = into_query(stmt)?;
        self.process_query(&mut query)?;
        self.splice(&mut query)?;

        let final_sql = query.to_string();
        debug!(sql = %final_sql, "resolved statement");
        let result = self.execute(&final_sql)?;
        Ok(self.envelope(result, final_sql, started, true))
    }

    fn envelope(
        &self,
        result: Relation,
        resolved_query: String,
        started: Instant,
        contains_ingredient: bool,
    ) -> ResultEnvelope {
        let usage = &self.session.usage;
        ResultEnvelope {
            result,
            values_passed: usage.values_passed(),
            generation_calls: usage.generation_calls(),
            prompt_tokens: usage.prompt_tokens(),
            completion_tokens: usage.completion_tokens(),
            process_time: started.elapsed(),
            query: resolved_query,
            contains_ingredient,
        }
    }

    fn execute(&self, sql: &str) -> Result<Relation> {
        self.session.metrics.record_backend_statement("query");
        self.session.db.execute_to_relation(sql)
    }

    // -----------------------------------------------------------------------
    // Deepest-first traversal
    // -----------------------------------------------------------------------

    fn process_query(&mut self, q: &mut Query) -> Result<()> {
        // CTE bodies are always deferred; the final spliced statement decides
        // whether they ever run.
        if let Some(with) = q.with.take() {
            for cte in with.cte_tables {
                let name = cte.alias.name.value.clone();
                let has_ing = contains_alias_ref(&*cte.query);
                let body = self.reexpand(&cte.query);
                self.deferred_names.insert(name.clone());
                self.lazy.register(name, body, has_ing);
            }
        }
        let order_exprs: Vec<OrderByExpr> = q
            .order_by
            .as_ref()
            .map(|o| o.exprs.clone())
            .unwrap_or_default();
        self.process_set_expr(&mut q.body, &order_exprs)?;
        self.apply_resolved(q);
        Ok(())
    }

    fn process_set_expr(&mut self, se: &mut SetExpr, order_exprs: &[OrderByExpr]) -> Result<()> {
        match se {
            SetExpr::Select(s) => self.process_select(s, order_exprs),
            SetExpr::SetOperation { left, right, .. } => {
                self.process_set_expr(left, &[])?;
                self.process_set_expr(right, &[])
            }
            SetExpr::Query(q) => self.process_query(q),
            _ => Ok(()),
        }
    }

    fn process_select(&mut self, s: &mut Select, order_exprs: &[OrderByExpr]) -> Result<()> {
        let has_nested = nested_queries(s).iter().any(|q| contains_alias_ref(*q));

        // Nested units first; after this, any alias left in `s` is ours.
        for twj in &mut s.from {
            self.process_factor(&mut twj.relation)?;
            for join in &mut twj.joins {
                self.process_factor(&mut join.relation)?;
            }
        }
        for e in select_exprs_mut(s) {
            self.process_expr_subqueries(e)?;
        }

        let alias_names = self.aliases_in_select(s, order_exprs);
        if alias_names.is_empty() {
            return Ok(());
        }

        let mut unit = SubqueryUnit::new(self.session.next_unit_index(), has_nested);
        let unit_temps = self.materialize_unit_tables(s, order_exprs, &unit)?;

        // Fixed priority order: String < Map < QA < Join, then first-seen.
        let mut ordered: Vec<(u8, usize, String)> = alias_names
            .into_iter()
            .filter_map(|name| {
                let idx = self.aliases.iter().position(|r| r.alias == name)?;
                let kind = self.aliases.get(&name)?.kind;
                Some((kind.priority(), idx, name))
            })
            .collect();
        ordered.sort();

        for (_, _, alias) in ordered {
            if unit.executed.contains(&alias) {
                continue;
            }
            self.execute_alias(s, order_exprs, &alias, &unit, &unit_temps)?;
            unit.executed.insert(alias);
        }
        Ok(())
    }

    fn process_factor(&mut self, factor: &mut TableFactor) -> Result<()> {
        if let TableFactor::Derived { subquery, .. } = factor {
            self.process_query(subquery)?;
        }
        Ok(())
    }

    /// Recurse into expression subqueries, stopping at each query boundary
    /// (the nested query is processed as its own unit, not descended past).
    fn process_expr_subqueries(&mut self, e: &mut Expr) -> Result<()> {
        for_each_nested_query_mut(e, &mut |q| self.process_query(q))
    }

    /// Aliases this unit is responsible for: expression references, table
    /// positions, and the owning query's ORDER BY.
    fn aliases_in_select(&self, s: &Select, order_exprs: &[OrderByExpr]) -> Vec<String> {
        let mut names = collect_alias_refs(s);
        for oe in order_exprs {
            for a in collect_alias_refs(&oe.expr) {
                if !names.iter().any(|n| n == &a) {
                    names.push(a);
                }
            }
        }
        for rel in collect_relation_names(s) {
            if let Some(inner) = rel.strip_prefix("{{").and_then(|r| r.strip_suffix("}}")) {
                if !names.iter().any(|n| n == inner) {
                    names.push(inner.to_string());
                }
            }
        }
        names
    }

    // -----------------------------------------------------------------------
    // Abstracted table selects
    // -----------------------------------------------------------------------

    /// Materialize the minimal select per referenced base table into a
    /// subquery-scoped temp table. A backend failure degrades to the whole
    /// table when configured, and only then propagates.
    fn materialize_unit_tables(
        &mut self,
        s: &Select,
        order_exprs: &[OrderByExpr],
        unit: &SubqueryUnit,
    ) -> Result<BTreeMap<String, String>> {
        let abstracted = abstracted_table_selects(
            s,
            order_exprs,
            unit,
            &self.aliases,
            &self.schema,
            &self.revisions,
            &self.deferred_names,
        );
        let mut unit_temps = BTreeMap::new();
        for a in &abstracted {
            let Some(sql) = &a.select_sql else {
                continue; // deferred through the lazy registry
            };
            let temp_name = temp::subquery_scoped(self.session.id.as_str(), unit.index, &a.table);
            let written = self
                .execute(sql)
                .and_then(|rel| self.session.db.write_temp_relation(&rel, &temp_name));
            match written {
                Ok(()) => {
                    unit_temps.insert(a.table.clone(), temp_name);
                }
                Err(e) if self.session.config.fallback_to_full_scan && a.constrained => {
                    warn!(table = %a.table, error = %e, "abstracted select failed; selecting whole table");
                    let source = self.revisions.get(&a.table).cloned().unwrap_or_else(|| a.table.clone());
                    let rel = self.execute(&format!("SELECT * FROM {}", quote_ident(&source)))?;
                    self.session.db.write_temp_relation(&rel, &temp_name)?;
                    unit_temps.insert(a.table.clone(), temp_name);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(unit_temps)
    }

    // -----------------------------------------------------------------------
    // Ingredient execution
    // -----------------------------------------------------------------------

    fn execute_alias(
        &mut self,
        s: &mut Select,
        order_exprs: &[OrderByExpr],
        alias: &str,
        unit: &SubqueryUnit,
        unit_temps: &BTreeMap<String, String>,
    ) -> Result<()> {
        let record = self
            .aliases
            .get(alias)
            .cloned()
            .ok_or_else(|| SimmerError::InvalidQuery(format!("unbound ingredient alias: {alias}")))?;

        let tables = from_tables(s);
        let inferred = if self.session.config.infer_gen_constraints {
            infer_constraints(s, order_exprs, alias, &tables, &self.schema)
        } else {
            GenConstraints::default()
        };
        // User-supplied constraints always win over inferred ones.
        let constraints = record.user_constraints().merged_over(&inferred);

        match record.kind {
            IngredientKind::String | IngredientKind::Alias => {
                self.execute_simple(s, alias, &record, &constraints, unit, unit_temps)
            }
            IngredientKind::Map => self.execute_map(s, alias, &record, &constraints, unit, unit_temps, &tables),
            IngredientKind::Qa => self.execute_qa(s, alias, &record, &constraints, unit, unit_temps, &tables),
            IngredientKind::Join => self.execute_join(s, alias, &record, &constraints, unit, unit_temps, &tables),
        }
    }

    fn invocation_ctx<'b>(&'b self, unit: &SubqueryUnit) -> InvocationCtx<'b> {
        InvocationCtx {
            db: self.session.db.as_ref(),
            session_id: self.session.id.as_str(),
            unit_index: unit.index,
            table_revisions: &self.revisions,
            prior_columns: &self.added_columns,
            usage: &self.session.usage,
            metrics: &self.session.metrics,
            concurrency_limit: self.session.config.max_concurrent_ingredient_calls,
        }
    }

    fn record_call(&self, record: &AliasRecord, values_routed: u64) {
        self.session.usage.add_generation_call();
        self.session.usage.add_values_passed(values_routed);
        self.session
            .metrics
            .record_ingredient_call(&record.ingredient, record.kind.as_str(), values_routed);
    }

    fn execute_simple(
        &mut self,
        s: &mut Select,
        alias: &str,
        record: &AliasRecord,
        constraints: &GenConstraints,
        unit: &SubqueryUnit,
        unit_temps: &BTreeMap<String, String>,
    ) -> Result<()> {
        let question = self.resolve_question(record.question(), unit_temps)?;
        let out = {
            let ingredient = self.session.kitchen.lookup(&record.ingredient)?;
            let ctx = self.invocation_ctx(unit);
            let inv = Invocation {
                question: question.as_deref(),
                target: None,
                right_target: None,
                values: &[],
                right_values: &[],
                context: None,
                options: None,
                constraints,
            };
            ingredient.invoke(&inv, &ctx)?
        };
        self.record_call(record, 0);
        match out {
            IngredientOutput::Literal(v) => {
                self.splice_literal(s, alias, &v);
                Ok(())
            }
            IngredientOutput::TableRef(name) => {
                self.splice_table_ref(s, alias, &name);
                Ok(())
            }
            other => Err(SimmerError::Ingredient(format!(
                "{} returned {} for a {} call",
                record.ingredient,
                output_kind(&other),
                record.kind.as_str()
            ))),
        }
    }

    fn execute_map(
        &mut self,
        s: &mut Select,
        alias: &str,
        record: &AliasRecord,
        constraints: &GenConstraints,
        unit: &SubqueryUnit,
        unit_temps: &BTreeMap<String, String>,
        tables: &[FromTable],
    ) -> Result<()> {
        let target = record
            .columns()
            .first()
            .cloned()
            .cloned()
            .ok_or_else(|| {
                SimmerError::InvalidQuery(format!(
                    "{} needs a table.column argument",
                    record.ingredient
                ))
            })?;
        let base = resolve_base_table(&target.table, tables);
        let current = self
            .revisions
            .get(&base)
            .cloned()
            .unwrap_or_else(|| base.clone());

        let base_rel = self.execute(&format!("SELECT * FROM {}", quote_ident(&current)))?;

        // Values already mapped in a prior revision are skipped for
        // idempotence across subqueries.
        let expected_col = format!(
            "{}_{}",
            record.ingredient.to_ascii_lowercase(),
            target.column
        );
        let mut skip: HashSet<String> = HashSet::new();
        if let (Some(key_vals), Ok(mapped_vals)) = (
            base_rel.column_values(&target.column).ok(),
            base_rel.column_values(&expected_col),
        ) {
            for (key, mapped) in key_vals.iter().zip(mapped_vals.iter()) {
                if !mapped.is_null() {
                    skip.insert(key.merge_key());
                }
            }
        }

        let source = unit_temps
            .get(&base)
            .cloned()
            .unwrap_or_else(|| current.clone());
        let distinct = self.execute(&format!(
            "SELECT DISTINCT {} FROM {}",
            quote_ident(&target.column),
            quote_ident(&source)
        ))?;
        let values: Vec<Value> = distinct
            .into_single_column()?
            .into_iter()
            .filter(|v| !v.is_null() && !skip.contains(&v.merge_key()))
            .collect();

        let question = self.resolve_question(record.question(), unit_temps)?;
        let out = {
            let ingredient = self.session.kitchen.lookup(&record.ingredient)?;
            let ctx = self.invocation_ctx(unit);
            let inv = Invocation {
                question: question.as_deref(),
                target: Some(&target),
                right_target: None,
                values: &values,
                right_values: &[],
                context: Some(&base_rel),
                options: None,
                constraints,
            };
            ingredient.invoke(&inv, &ctx)?
        };
        self.record_call(record, values.len() as u64);

        let IngredientOutput::MappedColumn {
            column,
            table: out_table,
            source_column: _,
            relation,
        } = out
        else {
            return Err(SimmerError::Ingredient(format!(
                "{} returned {} for a map call",
                record.ingredient,
                output_kind(&out)
            )));
        };
        if relation.num_rows() != base_rel.num_rows() {
            return Err(SimmerError::Ingredient(format!(
                "map output of {} has {} rows for a base relation of {} rows",
                record.ingredient,
                relation.num_rows(),
                base_rel.num_rows()
            )));
        }

        let revision = temp::session_scoped(self.session.id.as_str(), &base);
        self.session.db.write_temp_relation(&relation, &revision)?;
        self.revisions.insert(base.clone(), revision);
        self.added_columns.insert(column.clone());
        debug!(table = %out_table, column = %column, "map column merged");

        // The alias now stands for the merged column.
        let qualifier = tables
            .iter()
            .find(|t| t.name == base)
            .and_then(|t| t.alias.clone())
            .unwrap_or(base);
        let expr = Expr::CompoundIdentifier(vec![
            Ident::with_quote('"', qualifier),
            Ident::with_quote('"', column),
        ]);
        self.splice_expr(s, alias, expr);
        Ok(())
    }

    fn execute_qa(
        &mut self,
        s: &mut Select,
        alias: &str,
        record: &AliasRecord,
        constraints: &GenConstraints,
        unit: &SubqueryUnit,
        unit_temps: &BTreeMap<String, String>,
        tables: &[FromTable],
    ) -> Result<()> {
        let question = self.resolve_question(record.question(), unit_temps)?;
        let options = self.resolve_options(constraints, unit_temps, tables)?;

        let context_rel: Option<Relation> = match record.named_arg("context") {
            Some(CallArg::Subquery(q)) => Some(self.blend_nested(q)?),
            Some(CallArg::Column(ct)) => {
                let base = resolve_base_table(&ct.table, tables);
                let source = self.reading_source(&base, unit_temps);
                Some(self.execute(&format!(
                    "SELECT {} FROM {}",
                    quote_ident(&ct.column),
                    quote_ident(&source)
                ))?)
            }
            _ => match record.columns().first() {
                Some(ct) => {
                    let base = resolve_base_table(&ct.table, tables);
                    let source = self.reading_source(&base, unit_temps);
                    Some(self.execute(&format!("SELECT * FROM {}", quote_ident(&source)))?)
                }
                None => None,
            },
        };

        let routed = options.as_ref().map(|o| o.len() as u64).unwrap_or(0)
            + context_rel.as_ref().map(|r| r.num_rows() as u64).unwrap_or(0);
        let out = {
            let ingredient = self.session.kitchen.lookup(&record.ingredient)?;
            let ctx = self.invocation_ctx(unit);
            let inv = Invocation {
                question: question.as_deref(),
                target: None,
                right_target: None,
                values: &[],
                right_values: &[],
                context: context_rel.as_ref(),
                options: options.as_deref(),
                constraints,
            };
            ingredient.invoke(&inv, &ctx)?
        };
        self.record_call(record, routed);

        match out {
            IngredientOutput::Literal(v) => {
                self.splice_literal(s, alias, &v);
                Ok(())
            }
            IngredientOutput::LiteralList(values) => {
                self.splice_literal_list(s, alias, values);
                Ok(())
            }
            other => Err(SimmerError::Ingredient(format!(
                "{} returned {} for a qa call",
                record.ingredient,
                output_kind(&other)
            ))),
        }
    }

    fn execute_join(
        &mut self,
        s: &mut Select,
        alias: &str,
        record: &AliasRecord,
        constraints: &GenConstraints,
        unit: &SubqueryUnit,
        unit_temps: &BTreeMap<String, String>,
        tables: &[FromTable],
    ) -> Result<()> {
        let cols = record.columns();
        let (left, right) = match (cols.first(), cols.get(1)) {
            (Some(l), Some(r)) => ((*l).clone(), (*r).clone()),
            _ => {
                return Err(SimmerError::InvalidQuery(format!(
                    "{} needs two table.column arguments",
                    record.ingredient
                )))
            }
        };
        let left_values = self.distinct_column_values(&left, unit_temps, tables)?;
        let right_values = self.distinct_column_values(&right, unit_temps, tables)?;
        let question = self.resolve_question(record.question(), unit_temps)?;

        let out = {
            let ingredient = self.session.kitchen.lookup(&record.ingredient)?;
            let ctx = self.invocation_ctx(unit);
            let inv = Invocation {
                question: question.as_deref(),
                target: Some(&left),
                right_target: Some(&right),
                values: &left_values,
                right_values: &right_values,
                context: None,
                options: None,
                constraints,
            };
            ingredient.invoke(&inv, &ctx)?
        };
        self.record_call(record, (left_values.len() + right_values.len()) as u64);

        let IngredientOutput::Alignment { table, .. } = out else {
            return Err(SimmerError::Ingredient(format!(
                "{} returned {} for a join call",
                record.ingredient,
                output_kind(&out)
            )));
        };
        if !self.session.db.has_temp_relation(&table) {
            return Err(SimmerError::Ingredient(format!(
                "{} reported alignment table {table} but never wrote it",
                record.ingredient
            )));
        }
        self.rewrite_join(s, alias, left, right, table)
    }

    /// Rewrite `JOIN right ON "{{A}}"` through the alignment relation.
    ///
    /// Policy: the rewrite happens immediately iff this is the only
    /// unresolved alias left in the predicate; otherwise the alignment is
    /// parked and a placeholder keeps sibling calls' context intact until
    /// the predicate's last alias resolves.
    fn rewrite_join(
        &mut self,
        s: &mut Select,
        alias: &str,
        left: ColumnTarget,
        right: ColumnTarget,
        align_table: String,
    ) -> Result<()> {
        let mut found: Option<(usize, usize)> = None;
        'outer: for (ti, twj) in s.from.iter().enumerate() {
            for (ji, join) in twj.joins.iter().enumerate() {
                if let Some(on) = join_on_expr(&join.join_operator) {
                    if collect_alias_refs(on).iter().any(|a| a == alias) {
                        found = Some((ti, ji));
                        break 'outer;
                    }
                }
            }
        }
        let Some((ti, ji)) = found else {
            return Err(SimmerError::InvalidQuery(format!(
                "join alias {alias} does not appear in any JOIN predicate"
            )));
        };

        let others = {
            let on = join_on_expr(&s.from[ti].joins[ji].join_operator).expect("checked above");
            collect_alias_refs(on)
                .into_iter()
                .filter(|a| a != alias)
                .count()
        };
        if others > 0 {
            // Park this alignment; the predicate's last alias completes it.
            self.pending_alignments.push(PendingAlignment {
                left,
                right,
                table: align_table,
            });
            let placeholder = Expr::Value(AstValue::Boolean(true));
            if let Some(on) = join_on_expr_mut(&mut s.from[ti].joins[ji].join_operator) {
                replace_alias_ref(on, alias, &placeholder);
            }
            return Ok(());
        }

        let mut alignments = std::mem::take(&mut self.pending_alignments);
        alignments.push(PendingAlignment {
            left,
            right,
            table: align_table,
        });

        let twj = &s.from[ti];
        let left_part = TableWithJoins {
            relation: twj.relation.clone(),
            joins: twj.joins[..ji].to_vec(),
        };
        let mut fragment = left_part.to_string();
        for a in &alignments {
            fragment.push_str(&format!(
                " JOIN {align} ON {lq}.{lc} = {align}.\"lhs\"",
                align = quote_ident(&a.table),
                lq = quote_ident(&a.left.table),
                lc = quote_ident(&a.left.column),
            ));
        }
        let right_factor = twj.joins[ji].relation.to_string();
        let on_clauses: Vec<String> = alignments
            .iter()
            .map(|a| {
                format!(
                    "{align}.\"rhs\" = {rq}.{rc}",
                    align = quote_ident(&a.table),
                    rq = quote_ident(&a.right.table),
                    rc = quote_ident(&a.right.column),
                )
            })
            .collect();
        fragment.push_str(&format!(
            " JOIN {right_factor} ON {}",
            on_clauses.join(" AND ")
        ));

        let mut rebuilt = parse_table_with_joins(&fragment)?;
        rebuilt.joins.extend_from_slice(&twj.joins[ji + 1..]);
        s.from[ti] = rebuilt;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Argument resolution
    // -----------------------------------------------------------------------

    /// The relation current reads of `base` should go through: the
    /// session-scoped revision first (Map columns must be visible to later
    /// calls in the same unit), then the unit's bounded temp, then the table.
    fn reading_source(&self, base: &str, unit_temps: &BTreeMap<String, String>) -> String {
        if let Some(rev) = self.revisions.get(base) {
            return rev.clone();
        }
        if let Some(t) = unit_temps.get(base) {
            return t.clone();
        }
        base.to_string()
    }

    fn distinct_column_values(
        &self,
        target: &ColumnTarget,
        unit_temps: &BTreeMap<String, String>,
        tables: &[FromTable],
    ) -> Result<Vec<Value>> {
        let base = resolve_base_table(&target.table, tables);
        // Prefer the bounded unit subset; a subset that lacks the column
        // (not part of this unit's projection) falls back to the revision,
        // then the base table.
        let mut sources = Vec::new();
        if let Some(t) = unit_temps.get(&base) {
            sources.push(t.clone());
        }
        if let Some(r) = self.revisions.get(&base) {
            sources.push(r.clone());
        }
        sources.push(base.clone());

        let mut last_err = None;
        for source in sources {
            match self.execute(&format!(
                "SELECT DISTINCT {} FROM {}",
                quote_ident(&target.column),
                quote_ident(&source)
            )) {
                Ok(rel) => {
                    return Ok(rel
                        .into_single_column()?
                        .into_iter()
                        .filter(|v| !v.is_null())
                        .collect())
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            SimmerError::InvalidQuery(format!(
                "unresolvable column reference: {}.{}",
                target.table, target.column
            ))
        }))
    }

    fn resolve_options(
        &mut self,
        constraints: &GenConstraints,
        unit_temps: &BTreeMap<String, String>,
        tables: &[FromTable],
    ) -> Result<Option<Vec<Value>>> {
        match &constraints.options {
            None => Ok(None),
            Some(OptionsSpec::Values(vs)) => Ok(Some(vs.clone())),
            Some(OptionsSpec::Column { table, column }) => {
                let target = ColumnTarget {
                    table: table.clone(),
                    column: column.clone(),
                };
                Ok(Some(self.distinct_column_values(&target, unit_temps, tables)?))
            }
            Some(OptionsSpec::Query(q)) => {
                let rel = self.blend_nested(q)?;
                Ok(Some(rel.into_single_column()?))
            }
        }
    }

    /// Resolve `{table::column}` placeholders inside a question string by
    /// substituting the first value found; more than one match warns.
    fn resolve_question(
        &self,
        question: Option<&str>,
        unit_temps: &BTreeMap<String, String>,
    ) -> Result<Option<String>> {
        let Some(q) = question else {
            return Ok(None);
        };
        let re = Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)::([A-Za-z_][A-Za-z0-9_]*)\}")
            .expect("template pattern");
        let mut out = String::new();
        let mut last = 0usize;
        for caps in re.captures_iter(q) {
            let whole = caps.get(0).expect("match");
            let (table, column) = (&caps[1], &caps[2]);
            out.push_str(&q[last..whole.start()]);
            let source = self.reading_source(table, unit_temps);
            let values = self.execute(&format!(
                "SELECT DISTINCT {} FROM {} LIMIT 2",
                quote_ident(column),
                quote_ident(&source)
            ))?;
            let values = values.into_single_column()?;
            match values.len() {
                0 => {
                    warn!(table, column, "no value found for question template");
                    out.push_str(whole.as_str());
                }
                1 => out.push_str(&values[0].to_string()),
                _ => {
                    warn!(table, column, "multiple values found for question template; using first");
                    out.push_str(&values[0].to_string());
                }
            }
            last = whole.end();
        }
        out.push_str(&q[last..]);
        Ok(Some(out))
    }

    /// Re-enter the whole engine for a nested statement. The nested frame
    /// shares the session (temp namespace, counters, kitchen) and receives a
    /// value copy of the alias table so alias names stay stable.
    fn blend_nested(&mut self, raw: &str) -> Result<Relation> {
        debug!(raw, "nested engine entry");
        let child = Orchestrator::with_state(
            self.session,
            false,
            self.aliases.clone(),
            self.revisions.clone(),
            self.added_columns.clone(),
            self.schema.clone(),
        );
        Ok(child.run(raw)?.result)
    }

    /// Render a query with alias references expanded back to their original
    /// `{{ ... }}` source spans, for recursive re-entry.
    fn reexpand(&self, q: &Query) -> String {
        let mut text = q.to_string();
        for alias in collect_alias_refs(q) {
            if let Some(record) = self.aliases.get(&alias) {
                text = text.replace(
                    &simmer_sql::alias_ref_sql(&alias),
                    &record.raw,
                );
            }
        }
        text
    }

    // -----------------------------------------------------------------------
    // Splicing
    // -----------------------------------------------------------------------

    fn splice_literal(&mut self, s: &mut Select, alias: &str, v: &Value) {
        self.splice_expr(s, alias, literal_expr(v));
    }

    fn splice_expr(&mut self, s: &mut Select, alias: &str, expr: Expr) {
        replace_alias_ref(s, alias, &expr);
        self.resolved.insert(alias.to_string(), expr);
    }

    fn splice_literal_list(&mut self, s: &mut Select, alias: &str, values: Vec<Value>) {
        apply_list_splice(s, alias, &values);
        self.resolved_lists.insert(alias.to_string(), values);
    }

    fn splice_table_ref(&mut self, s: &mut Select, alias: &str, name: &str) {
        let marker = alias_ref_text(alias);
        let replacement = ObjectName(vec![Ident::with_quote('"', name)]);
        let _ = sqlparser::ast::visit_relations_mut(s, |n: &mut ObjectName| {
            if object_name_to_string(n) == marker {
                *n = replacement.clone();
            }
            std::ops::ControlFlow::<()>::Continue(())
        });
        // Expression positions resolve to a bare identifier.
        let expr = Expr::Identifier(Ident::new(name));
        replace_alias_ref(s, alias, &expr);
        self.resolved_tables.insert(alias.to_string(), name.to_string());
        self.resolved.insert(alias.to_string(), expr);
    }

    /// Apply every session-wide resolution to `node`; used for occurrences
    /// outside the resolving unit (ORDER BY, outer projections).
    fn apply_resolved(&self, node: &mut Query) {
        for (alias, values) in &self.resolved_lists {
            apply_list_splice(node, alias, values);
        }
        for (alias, expr) in &self.resolved {
            replace_alias_ref(node, alias, expr);
        }
        for (alias, name) in &self.resolved_tables {
            let marker = alias_ref_text(alias);
            let replacement = ObjectName(vec![Ident::with_quote('"', name)]);
            let _ = sqlparser::ast::visit_relations_mut(node, |n: &mut ObjectName| {
                if object_name_to_string(n) == marker {
                    *n = replacement.clone();
                }
                std::ops::ControlFlow::<()>::Continue(())
            });
        }
    }

    /// Final pass over the top statement: verify nothing unresolved remains,
    /// route renamed tables through their revisions, and materialize lazy
    /// tables the final statement still references.
    fn splice(&mut self, q: &mut Query) -> Result<()> {
        self.apply_resolved(q);

        let mut leftover = collect_alias_refs(q);
        for rel in collect_relation_names(q) {
            if let Some(inner) = rel.strip_prefix("{{").and_then(|r| r.strip_suffix("}}")) {
                leftover.push(inner.to_string());
            }
        }
        if !leftover.is_empty() {
            return Err(SimmerError::InvalidQuery(format!(
                "unbound ingredient alias: {}",
                leftover.join(", ")
            )));
        }

        self.rename_revisions_in_query(q)?;

        for name in self.lazy.pending_names() {
            if collect_relation_names(q).iter().any(|n| n == &name) {
                self.materialize_lazy(&name)?;
            }
        }
        Ok(())
    }

    /// Point every base table with a session-scoped revision at that
    /// revision. The revision is aliased back to the base name so existing
    /// column qualifiers keep resolving.
    fn rename_revisions_in_query(&self, q: &mut Query) -> Result<()> {
        self.rename_in_set_expr(&mut q.body)
    }

    fn rename_in_set_expr(&self, se: &mut SetExpr) -> Result<()> {
        match se {
            SetExpr::Select(s) => {
                for twj in &mut s.from {
                    self.rename_factor(&mut twj.relation)?;
                    for join in &mut twj.joins {
                        self.rename_factor(&mut join.relation)?;
                    }
                }
                for e in select_exprs_mut(s) {
                    for_each_nested_query_mut(e, &mut |sub| self.rename_revisions_in_query(sub))?;
                }
                Ok(())
            }
            SetExpr::SetOperation { left, right, .. } => {
                self.rename_in_set_expr(left)?;
                self.rename_in_set_expr(right)
            }
            SetExpr::Query(q) => self.rename_revisions_in_query(q),
            _ => Ok(()),
        }
    }

    fn rename_factor(&self, factor: &mut TableFactor) -> Result<()> {
        match factor {
            TableFactor::Table { name, alias, .. } => {
                let base = object_name_to_string(name);
                if let Some(revision) = self.revisions.get(&base) {
                    if alias.is_some() {
                        // Qualifiers go through the alias; renaming suffices.
                        *name = ObjectName(vec![Ident::with_quote('"', revision)]);
                    } else {
                        let rebuilt = parse_table_with_joins(&format!(
                            "{} AS {}",
                            quote_ident(revision),
                            quote_ident(&base)
                        ))?;
                        *factor = rebuilt.relation;
                    }
                }
                Ok(())
            }
            TableFactor::Derived { subquery, .. } => self.rename_revisions_in_query(subquery),
            _ => Ok(()),
        }
    }

    /// Materialize one lazy table, dependencies first. Collection is
    /// take-once; bodies holding ingredient calls re-enter the engine,
    /// plain bodies go straight to the backend.
    fn materialize_lazy(&mut self, name: &str) -> Result<()> {
        let Some(deferred) = self.lazy.collect(name) else {
            return Ok(());
        };
        for dep in self.lazy.pending_names() {
            if references_table(&deferred.body_sql, &dep) {
                self.materialize_lazy(&dep)?;
            }
        }
        let rel = if deferred.has_ingredient_call {
            self.blend_nested(&deferred.body_sql)?
        } else {
            self.execute(&deferred.body_sql)?
        };
        self.session.db.write_temp_relation(&rel, name)
    }
}

// ---------------------------------------------------------------------------
// Free helpers
// ---------------------------------------------------------------------------

fn statement_contains_alias(stmt: &Statement) -> bool {
    if !collect_alias_refs(stmt).is_empty() {
        return true;
    }
    collect_relation_names(stmt)
        .iter()
        .any(|n| n.starts_with("{{"))
}

fn resolve_base_table(written: &str, tables: &[FromTable]) -> String {
    for t in tables {
        if t.alias.as_deref() == Some(written) {
            return t.name.clone();
        }
    }
    written.to_string()
}

fn literal_expr(v: &Value) -> Expr {
    match v {
        Value::Null => Expr::Value(AstValue::Null),
        Value::Integer(i) => Expr::Value(AstValue::Number(i.to_string(), false)),
        Value::Real(f) => Expr::Value(AstValue::Number(f.to_string(), false)),
        Value::Text(s) => Expr::Value(AstValue::SingleQuotedString(s.clone())),
        Value::Boolean(b) => Expr::Value(AstValue::Boolean(*b)),
    }
}

fn output_kind(out: &IngredientOutput) -> &'static str {
    match out {
        IngredientOutput::Literal(_) => "a literal",
        IngredientOutput::LiteralList(_) => "a literal list",
        IngredientOutput::TableRef(_) => "a table reference",
        IngredientOutput::MappedColumn { .. } => "a mapped column",
        IngredientOutput::Alignment { .. } => "an alignment",
    }
}

fn join_on_expr(op: &JoinOperator) -> Option<&Expr> {
    match op {
        JoinOperator::Inner(JoinConstraint::On(e))
        | JoinOperator::LeftOuter(JoinConstraint::On(e))
        | JoinOperator::RightOuter(JoinConstraint::On(e))
        | JoinOperator::FullOuter(JoinConstraint::On(e)) => Some(e),
        _ => None,
    }
}

fn join_on_expr_mut(op: &mut JoinOperator) -> Option<&mut Expr> {
    match op {
        JoinOperator::Inner(JoinConstraint::On(e))
        | JoinOperator::LeftOuter(JoinConstraint::On(e))
        | JoinOperator::RightOuter(JoinConstraint::On(e))
        | JoinOperator::FullOuter(JoinConstraint::On(e)) => Some(e),
        _ => None,
    }
}

/// Mutable references to a select's top-level expressions.
fn select_exprs_mut(s: &mut Select) -> Vec<&mut Expr> {
    let mut out = Vec::new();
    for item in &mut s.projection {
        match item {
            SelectItem::UnnamedExpr(e) | SelectItem::ExprWithAlias { expr: e, .. } => out.push(e),
            _ => {}
        }
    }
    if let Some(e) = &mut s.selection {
        out.push(e);
    }
    if let Some(e) = &mut s.having {
        out.push(e);
    }
    out
}

/// Direct nested query nodes of a select: derived tables and expression
/// subqueries, without descending past each query boundary.
fn nested_queries(s: &Select) -> Vec<&Query> {
    let mut out = Vec::new();
    for twj in &s.from {
        collect_factor_queries(&twj.relation, &mut out);
        for join in &twj.joins {
            collect_factor_queries(&join.relation, &mut out);
        }
    }
    for item in &s.projection {
        match item {
            SelectItem::UnnamedExpr(e) | SelectItem::ExprWithAlias { expr: e, .. } => {
                collect_expr_queries(e, &mut out)
            }
            _ => {}
        }
    }
    if let Some(e) = &s.selection {
        collect_expr_queries(e, &mut out);
    }
    if let Some(e) = &s.having {
        collect_expr_queries(e, &mut out);
    }
    out
}

fn collect_factor_queries<'x>(factor: &'x TableFactor, out: &mut Vec<&'x Query>) {
    if let TableFactor::Derived { subquery, .. } = factor {
        out.push(subquery);
    }
}

fn collect_expr_queries<'x>(e: &'x Expr, out: &mut Vec<&'x Query>) {
    match e {
        Expr::Subquery(q) => out.push(q),
        Expr::InSubquery { expr, subquery, .. } => {
            collect_expr_queries(expr, out);
            out.push(subquery);
        }
        Expr::Exists { subquery, .. } => out.push(subquery),
        Expr::BinaryOp { left, right, .. } => {
            collect_expr_queries(left, out);
            collect_expr_queries(right, out);
        }
        Expr::UnaryOp { expr, .. }
        | Expr::Nested(expr)
        | Expr::IsNull(expr)
        | Expr::IsNotNull(expr) => collect_expr_queries(expr, out),
        Expr::InList { expr, list, .. } => {
            collect_expr_queries(expr, out);
            for item in list {
                collect_expr_queries(item, out);
            }
        }
        Expr::Between {
            expr, low, high, ..
        } => {
            collect_expr_queries(expr, out);
            collect_expr_queries(low, out);
            collect_expr_queries(high, out);
        }
        Expr::Tuple(items) => {
            for item in items {
                collect_expr_queries(item, out);
            }
        }
        _ => {}
    }
}

/// Visit each directly nested query under an expression, mutably, without
/// descending into the queries themselves.
fn for_each_nested_query_mut(
    e: &mut Expr,
    f: &mut impl FnMut(&mut Query) -> Result<()>,
) -> Result<()> {
    match e {
        Expr::Subquery(q) => f(q),
        Expr::InSubquery { expr, subquery, .. } => {
            for_each_nested_query_mut(expr, f)?;
            f(subquery)
        }
        Expr::Exists { subquery, .. } => f(subquery),
        Expr::BinaryOp { left, right, .. } => {
            for_each_nested_query_mut(left, f)?;
            for_each_nested_query_mut(right, f)
        }
        Expr::UnaryOp { expr, .. }
        | Expr::Nested(expr)
        | Expr::IsNull(expr)
        | Expr::IsNotNull(expr) => for_each_nested_query_mut(expr, f),
        Expr::InList { expr, list, .. } => {
            for_each_nested_query_mut(expr, f)?;
            for item in list {
                for_each_nested_query_mut(item, f)?;
            }
            Ok(())
        }
        Expr::Between {
            expr, low, high, ..
        } => {
            for_each_nested_query_mut(expr, f)?;
            for_each_nested_query_mut(low, f)?;
            for_each_nested_query_mut(high, f)
        }
        Expr::Case {
            operand,
            conditions,
            results,
            else_result,
        } => {
            if let Some(op) = operand {
                for_each_nested_query_mut(op, f)?;
            }
            for c in conditions {
                for_each_nested_query_mut(c, f)?;
            }
            for r in results {
                for_each_nested_query_mut(r, f)?;
            }
            if let Some(er) = else_result {
                for_each_nested_query_mut(er, f)?;
            }
            Ok(())
        }
        Expr::Tuple(items) => {
            for item in items {
                for_each_nested_query_mut(item, f)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Splice a value list into membership positions: a single-element
/// `IN ("{{A}}")` expands in place; any other position gets a tuple.
fn apply_list_splice<V: sqlparser::ast::VisitMut>(node: &mut V, alias: &str, values: &[Value]) {
    let _ = sqlparser::ast::visit_expressions_mut(node, |e: &mut Expr| {
        if let Expr::InList { list, .. } = e {
            if list.len() == 1 && expr_alias(&list[0]) == Some(alias) {
                *list = values.iter().map(literal_expr).collect();
            }
        }
        std::ops::ControlFlow::<()>::Continue(())
    });
    let tuple = Expr::Tuple(values.iter().map(literal_expr).collect());
    let _ = sqlparser::ast::visit_expressions_mut(node, |e: &mut Expr| {
        if expr_alias(e) == Some(alias) {
            *e = tuple.clone();
        }
        std::ops::ControlFlow::<()>::Continue(())
    });
}

/// Word-boundary check for a table name inside rendered SQL text.
fn references_table(sql: &str, name: &str) -> bool {
    Regex::new(&format!(r"(?i)\b{}\b", regex::escape(name)))
        .map(|re| re.is_match(sql))
        .unwrap_or(false)
}
