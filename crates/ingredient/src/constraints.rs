//! Generation constraints attached to an ingredient invocation.
//!
//! Constraints arrive from two places: kwargs written by the user inside the
//! call, and inference from the call's surrounding predicate context. User
//! values always win; inference only fills what the user left open.

use serde::{Deserialize, Serialize};
use simmer_backend::{ColumnType, Value};

/// Expected scalar type of an ingredient's generated output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputType {
    Integer,
    Real,
    Text,
    Boolean,
}

impl OutputType {
    /// Default output-shape pattern implied by the type, used when the user
    /// supplied none.
    pub fn default_pattern(self) -> Option<&'static str> {
        match self {
            OutputType::Integer => Some(r"(\d+)"),
            OutputType::Real => Some(r"(\d+(\.\d+)?)"),
            OutputType::Boolean => Some(r"(true|false)"),
            OutputType::Text => None,
        }
    }

    pub fn from_column_type(t: ColumnType) -> Option<Self> {
        match t {
            ColumnType::Integer => Some(OutputType::Integer),
            ColumnType::Real => Some(OutputType::Real),
            ColumnType::Text => Some(OutputType::Text),
            ColumnType::Boolean => Some(OutputType::Boolean),
            ColumnType::Unknown => None,
        }
    }

    pub fn from_value(v: &Value) -> Option<Self> {
        match v {
            Value::Integer(_) => Some(OutputType::Integer),
            Value::Real(_) => Some(OutputType::Real),
            Value::Text(_) => Some(OutputType::Text),
            Value::Boolean(_) => Some(OutputType::Boolean),
            Value::Null => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OutputType::Integer => "integer",
            OutputType::Real => "real",
            OutputType::Text => "text",
            OutputType::Boolean => "boolean",
        }
    }
}

/// Where an option set comes from; resolved to concrete values right before
/// the invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OptionsSpec {
    /// Literal value set written in the call.
    Values(Vec<Value>),
    /// Distinct values of a resolvable column.
    Column { table: String, column: String },
    /// Single-column subquery; its result set is flattened.
    Query(String),
}

/// Merged constraint set for one invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenConstraints {
    pub output_type: Option<OutputType>,
    /// Output-shape pattern; overrides the type's default when present.
    pub pattern: Option<String>,
    pub options: Option<OptionsSpec>,
    /// Whether the call should return a list of values rather than one.
    pub return_list: Option<bool>,
}

impl GenConstraints {
    pub fn is_empty(&self) -> bool {
        self.output_type.is_none()
            && self.pattern.is_none()
            && self.options.is_none()
            && self.return_list.is_none()
    }

    /// Fill open fields of `self` from `inferred`. `self` is the
    /// user-supplied set and always wins on conflict.
    pub fn merged_over(mut self, inferred: &GenConstraints) -> GenConstraints {
        if self.output_type.is_none() {
            self.output_type = inferred.output_type;
        }
        if self.pattern.is_none() {
            self.pattern = inferred.pattern.clone();
        }
        if self.options.is_none() {
            self.options = inferred.options.clone();
        }
        if self.return_list.is_none() {
            self.return_list = inferred.return_list;
        }
        self
    }

    /// The pattern in force: explicit, or the output type's default.
    pub fn effective_pattern(&self) -> Option<String> {
        self.pattern
            .clone()
            .or_else(|| self.output_type.and_then(|t| t.default_pattern().map(String::from)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_constraints_win_over_inferred() {
        let user = GenConstraints {
            output_type: Some(OutputType::Text),
            ..Default::default()
        };
        let inferred = GenConstraints {
            output_type: Some(OutputType::Integer),
            pattern: Some(r"(\d+)".into()),
            return_list: Some(true),
            ..Default::default()
        };
        let merged = user.merged_over(&inferred);
        assert_eq!(merged.output_type, Some(OutputType::Text));
        // Open fields are filled from inference.
        assert_eq!(merged.pattern.as_deref(), Some(r"(\d+)"));
        assert_eq!(merged.return_list, Some(true));
    }

    #[test]
    fn effective_pattern_falls_back_to_type_default() {
        let c = GenConstraints {
            output_type: Some(OutputType::Integer),
            ..Default::default()
        };
        assert_eq!(c.effective_pattern().as_deref(), Some(r"(\d+)"));

        let explicit = GenConstraints {
            output_type: Some(OutputType::Integer),
            pattern: Some("(yes|no)".into()),
            ..Default::default()
        };
        assert_eq!(explicit.effective_pattern().as_deref(), Some("(yes|no)"));
    }
}
