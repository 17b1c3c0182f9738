use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Mutex;

use rusqlite::types::ValueRef;
use rusqlite::Connection;
use simmer_common::{Result, SimmerError};
use tracing::debug;

use crate::db::Database;
use crate::relation::{ColumnType, Relation, SchemaMap, Value};

/// SQLite-backed [`Database`] implementation.
///
/// The connection is owned exclusively by one session; temp relations are
/// created in SQLite's `temp` schema and tracked so `reset_session` can drop
/// exactly what this session created.
pub struct SqliteBackend {
    conn: Mutex<Connection>,
    temp_tables: Mutex<BTreeSet<String>>,
}

impl SqliteBackend {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path).map_err(|e| SimmerError::Backend(e.to_string()))?;
        Ok(Self::from_connection(conn))
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| SimmerError::Backend(e.to_string()))?;
        Ok(Self::from_connection(conn))
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
            temp_tables: Mutex::new(BTreeSet::new()),
        }
    }

    /// Run arbitrary setup DDL/DML outside the engine's validation path.
    ///
    /// Intended for fixtures and embedding callers that own the database.
    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        let conn = self.conn.lock().expect("connection lock poisoned");
        conn.execute_batch(sql)
            .map_err(|e| SimmerError::Backend(e.to_string()))
    }

    fn value_from_ref(v: ValueRef<'_>) -> Value {
        match v {
            ValueRef::Null => Value::Null,
            ValueRef::Integer(i) => Value::Integer(i),
            ValueRef::Real(f) => Value::Real(f),
            ValueRef::Text(t) => Value::Text(String::from_utf8_lossy(t).into_owned()),
            ValueRef::Blob(b) => Value::Text(String::from_utf8_lossy(b).into_owned()),
        }
    }

    fn value_to_sql(v: &Value) -> rusqlite::types::Value {
        match v {
            Value::Null => rusqlite::types::Value::Null,
            Value::Integer(i) => rusqlite::types::Value::Integer(*i),
            Value::Real(f) => rusqlite::types::Value::Real(*f),
            Value::Text(s) => rusqlite::types::Value::Text(s.clone()),
            Value::Boolean(b) => rusqlite::types::Value::Integer(i64::from(*b)),
        }
    }

    fn column_type_from_decl(decl: &str) -> ColumnType {
        let d = decl.to_ascii_uppercase();
        if d.contains("BOOL") {
            ColumnType::Boolean
        } else if d.contains("INT") {
            ColumnType::Integer
        } else if d.contains("REAL") || d.contains("FLOA") || d.contains("DOUB") || d.contains("NUM") {
            ColumnType::Real
        } else if d.contains("CHAR") || d.contains("TEXT") || d.contains("CLOB") {
            ColumnType::Text
        } else {
            ColumnType::Unknown
        }
    }
}

impl Database for SqliteBackend {
    fn execute_to_relation(&self, sql: &str) -> Result<Relation> {
        debug!(sql, "backend execute");
        let conn = self.conn.lock().expect("connection lock poisoned");
        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| SimmerError::Backend(e.to_string()))?;
        let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
        let mut out = Relation::new(columns.clone());
        let mut rows = stmt
            .query([])
            .map_err(|e| SimmerError::Backend(e.to_string()))?;
        while let Some(row) = rows.next().map_err(|e| SimmerError::Backend(e.to_string()))? {
            let mut values = Vec::with_capacity(columns.len());
            for i in 0..columns.len() {
                let v = row
                    .get_ref(i)
                    .map_err(|e| SimmerError::Backend(e.to_string()))?;
                values.push(Self::value_from_ref(v));
            }
            out.push_row(values)?;
        }
        Ok(out)
    }

    fn execute_to_scalar_list(&self, sql: &str) -> Result<Vec<Value>> {
        self.execute_to_relation(sql)?.into_single_column()
    }

    fn write_temp_relation(&self, relation: &Relation, name: &str) -> Result<()> {
        let quoted = format!("\"{}\"", name.replace('"', "\"\""));
        let cols = relation
            .columns()
            .iter()
            .map(|c| format!("\"{}\"", c.replace('"', "\"\"")))
            .collect::<Vec<_>>()
            .join(", ");
        let placeholders = (1..=relation.num_columns())
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");

        let mut conn = self.conn.lock().expect("connection lock poisoned");
        let tx = conn
            .transaction()
            .map_err(|e| SimmerError::Backend(e.to_string()))?;
        tx.execute_batch(&format!(
            "DROP TABLE IF EXISTS temp.{quoted}; CREATE TEMP TABLE {quoted} ({cols});"
        ))
        .map_err(|e| SimmerError::Backend(e.to_string()))?;
        {
            let mut insert = tx
                .prepare(&format!("INSERT INTO {quoted} VALUES ({placeholders})"))
                .map_err(|e| SimmerError::Backend(e.to_string()))?;
            for row in relation.rows() {
                let params = row.iter().map(Self::value_to_sql).collect::<Vec<_>>();
                insert
                    .execute(rusqlite::params_from_iter(params))
                    .map_err(|e| SimmerError::Backend(e.to_string()))?;
            }
        }
        tx.commit().map_err(|e| SimmerError::Backend(e.to_string()))?;

        self.temp_tables
            .lock()
            .expect("temp table lock poisoned")
            .insert(name.to_string());
        debug!(name, rows = relation.num_rows(), "temp relation written");
        Ok(())
    }

    fn has_temp_relation(&self, name: &str) -> bool {
        let conn = self.conn.lock().expect("connection lock poisoned");
        conn.query_row(
            "SELECT 1 FROM sqlite_temp_master WHERE type = 'table' AND name = ?1",
            [name],
            |_| Ok(()),
        )
        .is_ok()
    }

    fn schema(&self) -> Result<SchemaMap> {
        let conn = self.conn.lock().expect("connection lock poisoned");
        let mut tables = Vec::new();
        {
            let mut stmt = conn
                .prepare(
                    "SELECT name FROM sqlite_master \
                     WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
                )
                .map_err(|e| SimmerError::Backend(e.to_string()))?;
            let mut rows = stmt
                .query([])
                .map_err(|e| SimmerError::Backend(e.to_string()))?;
            while let Some(row) = rows.next().map_err(|e| SimmerError::Backend(e.to_string()))? {
                let name: String = row
                    .get(0)
                    .map_err(|e| SimmerError::Backend(e.to_string()))?;
                tables.push(name);
            }
        }

        let mut schema = SchemaMap::new();
        for table in tables {
            let mut columns = BTreeMap::new();
            let quoted = format!("\"{}\"", table.replace('"', "\"\""));
            let mut stmt = conn
                .prepare(&format!("PRAGMA table_info({quoted})"))
                .map_err(|e| SimmerError::Backend(e.to_string()))?;
            let mut rows = stmt
                .query([])
                .map_err(|e| SimmerError::Backend(e.to_string()))?;
            while let Some(row) = rows.next().map_err(|e| SimmerError::Backend(e.to_string()))? {
                let name: String = row
                    .get(1)
                    .map_err(|e| SimmerError::Backend(e.to_string()))?;
                let decl: String = row
                    .get::<_, Option<String>>(2)
                    .map_err(|e| SimmerError::Backend(e.to_string()))?
                    .unwrap_or_default();
                columns.insert(name, Self::column_type_from_decl(&decl));
            }
            schema.insert(table, columns);
        }
        Ok(schema)
    }

    fn reset_session(&self) -> Result<()> {
        let names: Vec<String> = {
            let mut tracked = self.temp_tables.lock().expect("temp table lock poisoned");
            std::mem::take(&mut *tracked).into_iter().collect()
        };
        let conn = self.conn.lock().expect("connection lock poisoned");
        for name in names {
            let quoted = format!("\"{}\"", name.replace('"', "\"\""));
            conn.execute_batch(&format!("DROP TABLE IF EXISTS temp.{quoted}"))
                .map_err(|e| SimmerError::Backend(e.to_string()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> SqliteBackend {
        let db = SqliteBackend::open_in_memory().unwrap();
        db.execute_batch(
            "CREATE TABLE w (date TEXT, rival TEXT, city TEXT);
             INSERT INTO w VALUES ('11 jun', 'western districts', 'bathurst');
             INSERT INTO w VALUES ('5 jun', 'northern districts', 'newcastle');",
        )
        .unwrap();
        db
    }

    #[test]
    fn query_returns_relation() {
        let db = fixture();
        let rel = db.execute_to_relation("SELECT date, city FROM w ORDER BY date").unwrap();
        assert_eq!(rel.columns(), &["date".to_string(), "city".to_string()]);
        assert_eq!(rel.num_rows(), 2);
    }

    #[test]
    fn scalar_list_requires_single_column() {
        let db = fixture();
        let cities = db
            .execute_to_scalar_list("SELECT DISTINCT city FROM w ORDER BY city")
            .unwrap();
        assert_eq!(cities.len(), 2);
        assert!(db.execute_to_scalar_list("SELECT date, city FROM w").is_err());
    }

    #[test]
    fn temp_relation_lifecycle() {
        let db = fixture();
        let rel = db.execute_to_relation("SELECT * FROM w").unwrap();
        db.write_temp_relation(&rel, "sess_0_w").unwrap();
        assert!(db.has_temp_relation("sess_0_w"));

        // Rewrite under the same name replaces the contents.
        let smaller = db
            .execute_to_relation("SELECT * FROM w WHERE city = 'bathurst'")
            .unwrap();
        db.write_temp_relation(&smaller, "sess_0_w").unwrap();
        let back = db.execute_to_relation("SELECT * FROM sess_0_w").unwrap();
        assert_eq!(back.num_rows(), 1);

        db.reset_session().unwrap();
        assert!(!db.has_temp_relation("sess_0_w"));
    }

    #[test]
    fn schema_reports_declared_types() {
        let db = fixture();
        let schema = db.schema().unwrap();
        let w = schema.get("w").unwrap();
        assert_eq!(w.get("city"), Some(&ColumnType::Text));
    }

    #[test]
    fn schema_skips_temp_tables() {
        let db = fixture();
        let rel = db.execute_to_relation("SELECT * FROM w").unwrap();
        db.write_temp_relation(&rel, "scratch").unwrap();
        let schema = db.schema().unwrap();
        assert!(!schema.contains_key("scratch"));
    }

    #[test]
    fn file_backed_database_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fixture.db");
        let db = SqliteBackend::open(&path).unwrap();
        db.execute_batch("CREATE TABLE t (x INTEGER); INSERT INTO t VALUES (1);")
            .unwrap();
        let rel = db.execute_to_relation("SELECT x FROM t").unwrap();
        assert_eq!(rel.rows()[0][0], Value::Integer(1));
    }

    #[test]
    fn bad_sql_is_a_backend_error() {
        let db = fixture();
        let err = db.execute_to_relation("SELECT nope FROM missing").unwrap_err();
        assert!(matches!(err, SimmerError::Backend(_)));
    }
}
