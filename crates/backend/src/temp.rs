//! Session temp-table naming.
//!
//! Two scopes exist:
//! - subquery-scoped: one materialized abstracted select per unit and base
//!   table, `{session}_{unit}_{base}`;
//! - session-scoped: one accumulating revision per base table that Map
//!   ingredients add columns to, `{session}_{base}`.

/// Name for a subquery-scoped materialization of `base` in unit `unit`.
pub fn subquery_scoped(session: &str, unit: usize, base: &str) -> String {
    format!("{session}_{unit}_{base}")
}

/// Name for the session-scoped revision of `base`.
pub fn session_scoped(session: &str, base: &str) -> String {
    format!("{session}_{base}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scopes_do_not_collide() {
        assert_ne!(subquery_scoped("s", 0, "w"), session_scoped("s", "w"));
        assert_ne!(subquery_scoped("s", 0, "w"), subquery_scoped("s", 1, "w"));
    }
}
