//! Ingredient-call extraction.
//!
//! Scans raw hybrid text for `{{ Name(args) }}` spans, parses the argument
//! grammar, assigns short canonical aliases with query-wide de-duplication,
//! and rewrites each span to a quoted alias reference (`"{{A}}"`) so the
//! result is always valid input for the SQL parser. All text-level work of
//! the engine is confined to this pass.

use std::collections::HashMap;

use indexmap::IndexMap;
use simmer_backend::Value;
use simmer_common::{Result, SimmerError};
use simmer_ingredient::{
    ColumnTarget, GenConstraints, IngredientKind, Kitchen, OptionsSpec, OutputType,
};
use simmer_sql::alias_ref_sql;
use tracing::debug;

/// One parsed argument of an ingredient call.
#[derive(Debug, Clone, PartialEq)]
pub enum CallArg {
    Literal(Value),
    Column(ColumnTarget),
    /// Raw nested sub-statement text; may itself contain ingredient calls.
    Subquery(String),
    /// Literal value set (`('a', 'b')`).
    List(Vec<Value>),
}

impl CallArg {
    fn canonical(&self) -> String {
        match self {
            CallArg::Literal(v) => v.to_sql_literal(),
            CallArg::Column(c) => format!("{}.{}", c.table, c.column),
            CallArg::Subquery(q) => q.split_whitespace().collect::<Vec<_>>().join(" "),
            CallArg::List(vs) => {
                let inner = vs.iter().map(Value::to_sql_literal).collect::<Vec<_>>();
                format!("({})", inner.join(", "))
            }
        }
    }

    pub fn as_literal_text(&self) -> Option<&str> {
        match self {
            CallArg::Literal(Value::Text(s)) => Some(s),
            _ => None,
        }
    }
}

/// One distinct ingredient call within a top-level execution.
#[derive(Debug, Clone)]
pub struct AliasRecord {
    pub alias: String,
    pub ingredient: String,
    pub kind: IngredientKind,
    pub positional: Vec<CallArg>,
    pub named: IndexMap<String, CallArg>,
    /// Original `{{ ... }}` source span, needed to re-expand the call when a
    /// nested statement is executed through a recursive engine entry.
    pub raw: String,
}

impl AliasRecord {
    /// The free-form question/criteria string: `question=` kwarg or the
    /// first positional string literal.
    pub fn question(&self) -> Option<&str> {
        if let Some(arg) = self.named.get("question") {
            return arg.as_literal_text();
        }
        self.positional.iter().find_map(CallArg::as_literal_text)
    }

    /// Column arguments in call order (positional before named).
    pub fn columns(&self) -> Vec<&ColumnTarget> {
        let positional = self.positional.iter().filter_map(|a| match a {
            CallArg::Column(c) => Some(c),
            _ => None,
        });
        let named = self.named.values().filter_map(|a| match a {
            CallArg::Column(c) => Some(c),
            _ => None,
        });
        positional.chain(named).collect()
    }

    pub fn named_arg(&self, name: &str) -> Option<&CallArg> {
        self.named.get(name)
    }

    /// Constraints the user wrote into the call itself. These always win
    /// over context inference.
    pub fn user_constraints(&self) -> GenConstraints {
        let mut c = GenConstraints::default();
        if let Some(t) = self
            .named
            .get("output_type")
            .or_else(|| self.named.get("type"))
            .and_then(CallArg::as_literal_text)
        {
            c.output_type = parse_output_type(t);
        }
        if let Some(p) = self
            .named
            .get("regex")
            .or_else(|| self.named.get("pattern"))
            .and_then(CallArg::as_literal_text)
        {
            c.pattern = Some(p.to_string());
        }
        if let Some(arg) = self.named.get("options") {
            c.options = Some(options_spec_from_arg(arg));
        }
        if let Some(CallArg::Literal(Value::Boolean(b))) = self.named.get("list") {
            c.return_list = Some(*b);
        }
        c
    }

    /// Canonical signature: calls with equal signatures share one alias and
    /// are executed at most once per unit.
    pub fn signature(ingredient: &str, positional: &[CallArg], named: &IndexMap<String, CallArg>) -> String {
        let mut parts = vec![ingredient.to_ascii_lowercase()];
        for arg in positional {
            parts.push(arg.canonical());
        }
        let mut kw: Vec<(&String, &CallArg)> = named.iter().collect();
        kw.sort_by(|a, b| a.0.cmp(b.0));
        for (k, v) in kw {
            parts.push(format!("{k}={}", v.canonical()));
        }
        parts.join("\u{1f}")
    }
}

fn parse_output_type(text: &str) -> Option<OutputType> {
    match text.to_ascii_lowercase().as_str() {
        "int" | "integer" => Some(OutputType::Integer),
        "float" | "real" | "numeric" => Some(OutputType::Real),
        "str" | "text" | "string" => Some(OutputType::Text),
        "bool" | "boolean" => Some(OutputType::Boolean),
        _ => None,
    }
}

fn options_spec_from_arg(arg: &CallArg) -> OptionsSpec {
    match arg {
        CallArg::List(vs) => OptionsSpec::Values(vs.clone()),
        CallArg::Column(c) => OptionsSpec::Column {
            table: c.table.clone(),
            column: c.column.clone(),
        },
        CallArg::Subquery(q) => OptionsSpec::Query(q.clone()),
        CallArg::Literal(Value::Text(s)) => {
            if let Some((t, c)) = s.split_once("::") {
                OptionsSpec::Column {
                    table: t.to_string(),
                    column: c.to_string(),
                }
            } else {
                OptionsSpec::Values(
                    s.split(';')
                        .map(|p| Value::Text(p.trim().to_string()))
                        .collect(),
                )
            }
        }
        CallArg::Literal(v) => OptionsSpec::Values(vec![v.clone()]),
    }
}

/// Alias table for one top-level execution.
///
/// Insertion order is first-seen order; nested recursive executions receive
/// a value copy so alias names stay stable across re-entry.
#[derive(Debug, Clone, Default)]
pub struct AliasTable {
    records: IndexMap<String, AliasRecord>,
    by_signature: HashMap<String, String>,
}

impl AliasTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, alias: &str) -> Option<&AliasRecord> {
        self.records.get(alias)
    }

    pub fn iter(&self) -> impl Iterator<Item = &AliasRecord> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn next_alias(&self) -> String {
        let mut n = self.records.len();
        let mut out = String::new();
        loop {
            out.insert(0, (b'A' + (n % 26) as u8) as char);
            n /= 26;
            if n == 0 {
                break;
            }
            n -= 1;
        }
        out
    }

    /// Register a call, reusing the alias of an identical signature.
    fn register(
        &mut self,
        ingredient: String,
        kind: IngredientKind,
        positional: Vec<CallArg>,
        named: IndexMap<String, CallArg>,
        raw: String,
    ) -> String {
        let signature = AliasRecord::signature(&ingredient, &positional, &named);
        if let Some(existing) = self.by_signature.get(&signature) {
            return existing.clone();
        }
        let alias = self.next_alias();
        debug!(alias = %alias, ingredient = %ingredient, "ingredient call registered");
        self.by_signature.insert(signature, alias.clone());
        self.records.insert(
            alias.clone(),
            AliasRecord {
                alias: alias.clone(),
                ingredient,
                kind,
                positional,
                named,
                raw,
            },
        );
        alias
    }
}

/// Extract every ingredient call from `raw`, registering records in `table`.
///
/// Returns text that parses cleanly under the SQL parser: each call span is
/// replaced by a quoted alias reference, a bare call gains a `SELECT`
/// prefix, and a call directly following `IN` is parenthesized.
pub fn extract(raw: &str, kitchen: &Kitchen, table: &mut AliasTable) -> Result<String> {
    let mut out = String::with_capacity(raw.len());
    let mut i = 0usize;
    let mut found_any = false;

    while i < raw.len() {
        let c = raw[i..].chars().next().expect("in bounds");
        // Plain SQL string literals pass through unscanned.
        if c == '\'' {
            let end = skip_quoted(raw, i)?;
            out.push_str(&raw[i..end]);
            i = end;
            continue;
        }
        if raw[i..].starts_with("{{") {
            let (record_span, call) = parse_call(raw, i, kitchen)?;
            let alias = table.register(
                call.ingredient,
                call.kind,
                call.positional,
                call.named,
                raw[i..record_span].to_string(),
            );
            // `x IN {{Call(...)}}` must stay parseable: wrap the reference.
            if last_keyword_is_in(&out) {
                out.push('(');
                out.push_str(&alias_ref_sql(&alias));
                out.push(')');
            } else {
                out.push_str(&alias_ref_sql(&alias));
            }
            found_any = true;
            i = record_span;
            continue;
        }
        out.push(c);
        i += c.len_utf8();
    }

    // A call used in isolation still has to execute as a statement.
    if found_any {
        let trimmed = out.trim();
        if trimmed.starts_with("\"{{") && !trimmed.to_ascii_uppercase().contains("SELECT") {
            out = format!("SELECT {trimmed}");
        }
    }
    Ok(out)
}

struct ParsedCall {
    ingredient: String,
    kind: IngredientKind,
    positional: Vec<CallArg>,
    named: IndexMap<String, CallArg>,
}

/// Parse one `{{ Name(args) }}` span starting at `start`. Returns the index
/// one past the closing `}}` and the parsed call.
fn parse_call(raw: &str, start: usize, kitchen: &Kitchen) -> Result<(usize, ParsedCall)> {
    let mut i = start + 2;
    i = skip_ws(raw, i);

    let name_start = i;
    while i < raw.len() && raw[i..].starts_with(|c: char| c.is_ascii_alphanumeric() || c == '_') {
        i += 1;
    }
    if i == name_start {
        return Err(SimmerError::Grammar(format!(
            "expected ingredient name after '{{{{' at byte {start}"
        )));
    }
    let name = &raw[name_start..i];
    let kind = kitchen.kind_of(name)?;

    i = skip_ws(raw, i);
    if !raw[i..].starts_with('(') {
        return Err(SimmerError::Grammar(format!(
            "expected '(' after ingredient name {name}"
        )));
    }
    let args_end = matching_paren(raw, i)?;
    let args_text = &raw[i + 1..args_end];
    i = skip_ws(raw, args_end + 1);
    if !raw[i..].starts_with("}}") {
        return Err(SimmerError::Grammar(format!(
            "unterminated ingredient call for {name}: expected '}}}}'"
        )));
    }
    i += 2;

    let (positional, named) = parse_args(args_text)?;
    Ok((
        i,
        ParsedCall {
            ingredient: name.to_string(),
            kind,
            positional,
            named,
        },
    ))
}

fn skip_ws(s: &str, mut i: usize) -> usize {
    while let Some(c) = s[i..].chars().next() {
        if !c.is_whitespace() {
            break;
        }
        i += c.len_utf8();
    }
    i
}

/// Index one past the end of a quoted string starting at `start`.
/// Doubling escapes the delimiter, SQL-style.
fn skip_quoted(s: &str, start: usize) -> Result<usize> {
    let quote = s[start..].chars().next().expect("caller checked");
    let mut i = start + quote.len_utf8();
    let bytes = s.as_bytes();
    while i < bytes.len() {
        if s[i..].starts_with(quote) {
            if s[i + quote.len_utf8()..].starts_with(quote) {
                i += 2 * quote.len_utf8();
                continue;
            }
            return Ok(i + quote.len_utf8());
        }
        i += s[i..].chars().next().map(char::len_utf8).unwrap_or(1);
    }
    Err(SimmerError::Grammar("unterminated string literal".to_string()))
}

/// Index of the `)` matching the `(` at `open`, respecting nesting and quotes.
fn matching_paren(s: &str, open: usize) -> Result<usize> {
    let mut depth = 0usize;
    let mut i = open;
    while i < s.len() {
        let c = s[i..].chars().next().expect("in bounds");
        match c {
            '\'' | '"' => {
                i = skip_quoted(s, i)?;
                continue;
            }
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return Ok(i);
                }
            }
            _ => {}
        }
        i += c.len_utf8();
    }
    Err(SimmerError::Grammar("unbalanced parentheses in ingredient call".to_string()))
}

fn last_keyword_is_in(out: &str) -> bool {
    out.trim_end()
        .rsplit(|c: char| c.is_whitespace())
        .next()
        .is_some_and(|w| w.eq_ignore_ascii_case("in"))
}

fn parse_args(text: &str) -> Result<(Vec<CallArg>, IndexMap<String, CallArg>)> {
    let mut positional = Vec::new();
    let mut named = IndexMap::new();
    for piece in split_top_level(text)? {
        let piece = piece.trim();
        if piece.is_empty() {
            continue;
        }
        if let Some((key, value)) = split_kwarg(piece) {
            let arg = parse_value(value.trim())?;
            if named.insert(key.to_string(), arg).is_some() {
                return Err(SimmerError::Grammar(format!(
                    "duplicate keyword argument: {key}"
                )));
            }
            continue;
        }
        if !named.is_empty() {
            return Err(SimmerError::Grammar(
                "positional argument after keyword argument".to_string(),
            ));
        }
        positional.push(parse_value(piece)?);
    }
    Ok((positional, named))
}

/// Split `text` on commas outside quotes, parens, and brackets.
fn split_top_level(text: &str) -> Result<Vec<&str>> {
    let mut pieces = Vec::new();
    let mut depth = 0usize;
    let mut last = 0usize;
    let mut i = 0usize;
    while i < text.len() {
        let c = text[i..].chars().next().expect("in bounds");
        match c {
            '\'' | '"' => {
                i = skip_quoted(text, i)?;
                continue;
            }
            '(' | '[' => depth += 1,
            ')' | ']' => {
                depth = depth.checked_sub(1).ok_or_else(|| {
                    SimmerError::Grammar("unbalanced parentheses in arguments".to_string())
                })?;
            }
            ',' if depth == 0 => {
                pieces.push(&text[last..i]);
                last = i + 1;
            }
            _ => {}
        }
        i += c.len_utf8();
    }
    if depth != 0 {
        return Err(SimmerError::Grammar("unbalanced parentheses in arguments".to_string()));
    }
    if last < text.len() || !pieces.is_empty() {
        pieces.push(&text[last..]);
    } else if !text.trim().is_empty() {
        pieces.push(text);
    }
    Ok(pieces)
}

/// Recognize `ident = value`, rejecting `=` inside quotes or comparisons.
fn split_kwarg(piece: &str) -> Option<(&str, &str)> {
    let eq = piece.find('=')?;
    let key = piece[..eq].trim();
    if key.is_empty()
        || !key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        || !key.chars().next().is_some_and(|c| c.is_ascii_alphabetic())
    {
        return None;
    }
    let value = &piece[eq + 1..];
    if value.starts_with('=') {
        return None;
    }
    Some((key, value))
}

fn parse_value(piece: &str) -> Result<CallArg> {
    if piece.is_empty() {
        return Err(SimmerError::Grammar("empty argument".to_string()));
    }
    if piece.starts_with('\'') || piece.starts_with('"') {
        let end = skip_quoted(piece, 0)?;
        if piece[end..].trim() != "" {
            return Err(SimmerError::Grammar(format!(
                "trailing content after string literal: {piece}"
            )));
        }
        let quote = piece.chars().next().expect("non-empty");
        let inner = &piece[1..end - 1];
        let unescaped = inner.replace(&format!("{quote}{quote}"), &quote.to_string());
        return Ok(CallArg::Literal(Value::Text(unescaped)));
    }
    if piece.starts_with('(') {
        let end = matching_paren(piece, 0)?;
        if piece[end + 1..].trim() != "" {
            return Err(SimmerError::Grammar(format!(
                "trailing content after parenthesized argument: {piece}"
            )));
        }
        let inner = piece[1..end].trim();
        let head = inner.split_whitespace().next().unwrap_or("");
        if head.eq_ignore_ascii_case("select") || head.eq_ignore_ascii_case("with") {
            return Ok(CallArg::Subquery(inner.to_string()));
        }
        let mut values = Vec::new();
        for item in split_top_level(inner)? {
            match parse_value(item.trim())? {
                CallArg::Literal(v) => values.push(v),
                _ => {
                    return Err(SimmerError::Grammar(
                        "value sets may contain only literals".to_string(),
                    ))
                }
            }
        }
        return Ok(CallArg::List(values));
    }
    if piece.eq_ignore_ascii_case("true") {
        return Ok(CallArg::Literal(Value::Boolean(true)));
    }
    if piece.eq_ignore_ascii_case("false") {
        return Ok(CallArg::Literal(Value::Boolean(false)));
    }
    if piece.eq_ignore_ascii_case("null") {
        return Ok(CallArg::Literal(Value::Null));
    }
    if let Ok(i) = piece.parse::<i64>() {
        return Ok(CallArg::Literal(Value::Integer(i)));
    }
    if let Ok(f) = piece.parse::<f64>() {
        return Ok(CallArg::Literal(Value::Real(f)));
    }
    if let Some((table, column)) = piece.split_once("::") {
        return column_target(table, column, piece);
    }
    if piece.contains('.') {
        let parts: Vec<&str> = piece.split('.').collect();
        if parts.len() != 2 {
            return Err(SimmerError::Grammar(format!(
                "column reference must be table.column, got: {piece}"
            )));
        }
        return column_target(parts[0], parts[1], piece);
    }
    Err(SimmerError::Grammar(format!("unrecognized argument: {piece}")))
}

fn column_target(table: &str, column: &str, piece: &str) -> Result<CallArg> {
    let ok = |s: &str| {
        !s.is_empty()
            && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
    };
    if !ok(table) || !ok(column) {
        return Err(SimmerError::Grammar(format!(
            "column reference must be table.column, got: {piece}"
        )));
    }
    Ok(CallArg::Column(ColumnTarget {
        table: table.to_string(),
        column: column.to_string(),
    }))
}
