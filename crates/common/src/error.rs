use thiserror::Error;

/// Canonical Simmer error taxonomy used across crates.
///
/// Classification guidance:
/// - [`SimmerError::Grammar`]: the hybrid call syntax itself is malformed
/// - [`SimmerError::InvalidQuery`]: semantically invalid hybrid SQL discovered before execution
/// - [`SimmerError::UnknownIngredient`] / [`SimmerError::DuplicateIngredient`]: kitchen binding failures
/// - [`SimmerError::Ingredient`]: contract violation by an ingredient implementation
/// - [`SimmerError::Backend`]: the backend rejected a statement we sent it
/// - [`SimmerError::Io`]: raw filesystem IO failures from std APIs
#[derive(Debug, Error)]
pub enum SimmerError {
    /// Malformed ingredient-call syntax.
    ///
    /// Examples:
    /// - unterminated `{{ ... }}` span
    /// - bad argument shape (`table.col.extra`, dangling `kw=`)
    ///
    /// Not retried here; an out-of-band corrector may consume and retry it.
    #[error("grammar error: {0}")]
    Grammar(String),

    /// Semantically invalid hybrid SQL.
    ///
    /// Examples:
    /// - a data-mutating statement kind (`DELETE`, `DROP`, `UPDATE`, ...)
    /// - an unresolvable `table.column` reference
    /// - a malformed `options` subquery (wrong column/row cardinality)
    /// - an unbound ingredient alias left in the final statement
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// Lookup of an ingredient name that was never bound to the kitchen.
    #[error("unknown ingredient: {0}")]
    UnknownIngredient(String),

    /// Two bound ingredients normalize to the same case-insensitive name.
    #[error("duplicate ingredient: {0}")]
    DuplicateIngredient(String),

    /// Contract violation by an ingredient implementation.
    ///
    /// Examples:
    /// - Map output row-count mismatch against the base relation
    /// - wrong output variant for the declared kind
    /// - empty required context
    #[error("ingredient error: {0}")]
    Ingredient(String),

    /// The backend failed to execute a statement.
    #[error("backend execution error: {0}")]
    Backend(String),

    /// Invalid or inconsistent configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Transparent std IO failures.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Standard Simmer result alias.
pub type Result<T> = std::result::Result<T, SimmerError>;
