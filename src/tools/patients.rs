//! Patient record lookups through a closed set of query templates.
//!
//! The agent picks a template and supplies values; it never composes SQL.
//! Every value is a bound parameter.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use sqlx::{Column, Row};

use super::{AgentTool, FailureKind, ToolOutcome};
use crate::secrets::PatientDbSecrets;

pub const NO_ROWS: &str = "No rows found.";

/// Clinical columns returned for record queries, cast to text in SQL.
const RECORD_COLUMNS: &str = "patient_id::text AS patient_id, first_name, last_name, \
     date_of_birth::text AS date_of_birth, gender, medical_condition, medications, allergies, \
     blood_type, last_visit_date::text AS last_visit_date, smoking_status, blood_pressure, \
     heart_rate_bpm::text AS heart_rate_bpm, notes";

/// The query templates the agent may choose from.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "query_type", rename_all = "snake_case")]
pub enum PatientQuery {
    ByName {
        first_name: String,
        last_name: String,
    },
    ByCondition {
        condition: String,
    },
    ByMedication {
        medication: String,
    },
    ByConditionAndMedication {
        condition: String,
        medication: String,
    },
    CountByConditionAndMedication {
        condition: String,
        medication: String,
    },
}

impl PatientQuery {
    /// SQL text and bind values. Comparisons are case-insensitive.
    fn to_sql(&self, limit: i64) -> (String, Vec<&str>) {
        match self {
            Self::ByName {
                first_name,
                last_name,
            } => (
                format!(
                    "SELECT {RECORD_COLUMNS} FROM patient_medical_data \
                     WHERE lower(first_name) = lower($1) AND lower(last_name) = lower($2) \
                     ORDER BY patient_id LIMIT {limit}"
                ),
                vec![first_name.as_str(), last_name.as_str()],
            ),
            Self::ByCondition { condition } => (
                format!(
                    "SELECT {RECORD_COLUMNS} FROM patient_medical_data \
                     WHERE lower(medical_condition) = lower($1) \
                     ORDER BY patient_id LIMIT {limit}"
                ),
                vec![condition.as_str()],
            ),
            Self::ByMedication { medication } => (
                format!(
                    "SELECT {RECORD_COLUMNS} FROM patient_medical_data \
                     WHERE lower(medications) = lower($1) \
                     ORDER BY patient_id LIMIT {limit}"
                ),
                vec![medication.as_str()],
            ),
            Self::ByConditionAndMedication {
                condition,
                medication,
            } => (
                format!(
                    "SELECT {RECORD_COLUMNS} FROM patient_medical_data \
                     WHERE lower(medical_condition) = lower($1) AND lower(medications) = lower($2) \
                     ORDER BY patient_id LIMIT {limit}"
                ),
                vec![condition.as_str(), medication.as_str()],
            ),
            Self::CountByConditionAndMedication {
                condition,
                medication,
            } => (
                "SELECT COUNT(*)::text AS patient_count FROM patient_medical_data \
                 WHERE lower(medical_condition) = lower($1) AND lower(medications) = lower($2)"
                    .to_string(),
                vec![condition.as_str(), medication.as_str()],
            ),
        }
    }
}

/// Column names plus rows of nullable text cells.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
}

impl RowSet {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Right-aligned text table without an index column. NULL shows as `None`.
    pub fn render_table(&self) -> String {
        let cell = |value: &Option<String>| value.clone().unwrap_or_else(|| "None".to_string());

        let mut widths: Vec<usize> = self.columns.iter().map(|c| c.chars().count()).collect();
        for row in &self.rows {
            for (i, value) in row.iter().enumerate() {
                if let Some(w) = widths.get_mut(i) {
                    *w = (*w).max(cell(value).chars().count());
                }
            }
        }

        let format_line = |cells: Vec<String>| {
            cells
                .iter()
                .zip(&widths)
                .map(|(c, w)| format!("{c:>w$}"))
                .collect::<Vec<_>>()
                .join(" ")
        };

        let mut lines = vec![format_line(self.columns.clone())];
        for row in &self.rows {
            lines.push(format_line(row.iter().map(cell).collect()));
        }
        lines.join("\n")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PatientStoreError {
    #[error("{0}")]
    Sql(#[from] sqlx::Error),
}

/// Read access to patient records.
#[async_trait]
pub trait PatientStore: Send + Sync + std::fmt::Debug {
    async fn fetch(&self, query: &PatientQuery, limit: i64) -> Result<RowSet, PatientStoreError>;
}

/// `PostgreSQL` store over the `patient_medical_data` table.
#[derive(Debug, Clone)]
pub struct PgPatientStore {
    pool: PgPool,
}

impl PgPatientStore {
    /// Build a lazily connecting pool; connection failures surface per query.
    pub fn connect_lazy(db: &PatientDbSecrets) -> Self {
        let options = PgConnectOptions::new()
            .host(&db.host)
            .port(db.port)
            .database(&db.database)
            .username(&db.username)
            .password(&db.password);
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(std::time::Duration::from_secs(30))
            .connect_lazy_with(options);
        Self { pool }
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply the schema migrations shipped with the crate.
    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await
    }
}

#[async_trait]
impl PatientStore for PgPatientStore {
    async fn fetch(&self, query: &PatientQuery, limit: i64) -> Result<RowSet, PatientStoreError> {
        let (sql, binds) = query.to_sql(limit);
        let mut q = sqlx::query(&sql);
        for value in binds {
            q = q.bind(value);
        }
        let rows = q.fetch_all(&self.pool).await?;

        let columns = rows
            .first()
            .map(|r| r.columns().iter().map(|c| c.name().to_string()).collect())
            .unwrap_or_default();

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut cells = Vec::with_capacity(row.len());
            for idx in 0..row.len() {
                cells.push(row.try_get::<Option<String>, _>(idx)?);
            }
            out.push(cells);
        }

        Ok(RowSet { columns, rows: out })
    }
}

/// `lookup_patient_data`: patient records by template.
#[derive(Debug, Clone)]
pub struct PatientLookupTool {
    store: Arc<dyn PatientStore>,
    row_limit: i64,
}

impl PatientLookupTool {
    pub fn new(store: Arc<dyn PatientStore>, row_limit: i64) -> Self {
        Self { store, row_limit }
    }
}

#[async_trait]
impl AgentTool for PatientLookupTool {
    fn name(&self) -> &str {
        "lookup_patient_data"
    }

    fn description(&self) -> &str {
        "Looks up records in the patient medical data table. Choose a query_type and supply only the fields that query type needs."
    }

    fn parameters(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "query_type": {
                    "type": "string",
                    "enum": [
                        "by_name",
                        "by_condition",
                        "by_medication",
                        "by_condition_and_medication",
                        "count_by_condition_and_medication"
                    ],
                    "description": "Which lookup to run."
                },
                "first_name": { "type": "string", "description": "Patient first name (by_name)." },
                "last_name": { "type": "string", "description": "Patient last name (by_name)." },
                "condition": { "type": "string", "description": "Medical condition, e.g. 'Hypertension'." },
                "medication": { "type": "string", "description": "Medication, e.g. 'Lisinopril'." }
            },
            "required": ["query_type"]
        })
    }

    #[tracing::instrument(name = "lookup_patient_data", skip(self, args), fields(patient_data_query = tracing::field::Empty))]
    async fn invoke(&self, args: serde_json::Value) -> ToolOutcome {
        let query: PatientQuery = match serde_json::from_value(args) {
            Ok(q) => q,
            Err(e) => {
                return ToolOutcome::failure(
                    FailureKind::InvalidArguments,
                    format!("Invalid patient query: {e}"),
                );
            }
        };
        tracing::Span::current().record("patient_data_query", tracing::field::debug(&query));

        match self.store.fetch(&query, self.row_limit).await {
            Ok(rows) if rows.is_empty() => ToolOutcome::success(NO_ROWS),
            Ok(rows) => ToolOutcome::success(rows.render_table()),
            Err(e) => ToolOutcome::failure(FailureKind::Upstream, format!("Database error: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    struct FakeStore {
        result: RowSet,
        seen: Mutex<Vec<(PatientQuery, i64)>>,
    }

    #[async_trait]
    impl PatientStore for FakeStore {
        async fn fetch(
            &self,
            query: &PatientQuery,
            limit: i64,
        ) -> Result<RowSet, PatientStoreError> {
            self.seen.lock().unwrap().push((query.clone(), limit));
            Ok(self.result.clone())
        }
    }

    #[derive(Debug)]
    struct BrokenStore;

    #[async_trait]
    impl PatientStore for BrokenStore {
        async fn fetch(&self, _: &PatientQuery, _: i64) -> Result<RowSet, PatientStoreError> {
            Err(sqlx::Error::PoolTimedOut.into())
        }
    }

    #[test]
    fn test_render_table_right_aligns() {
        let rows = RowSet {
            columns: vec!["first_name".into(), "age".into()],
            rows: vec![
                vec![Some("Gloria".into()), Some("79".into())],
                vec![Some("Al".into()), None],
            ],
        };
        assert_eq!(
            rows.render_table(),
            "first_name  age\n    Gloria   79\n        Al None"
        );
    }

    #[test]
    fn test_templates_bind_values_not_text() {
        let query = PatientQuery::ByName {
            first_name: "Robert'); DROP TABLE patient_medical_data;--".into(),
            last_name: "Tables".into(),
        };
        let (sql, binds) = query.to_sql(50);
        assert!(!sql.contains("DROP"));
        assert!(sql.contains("$1") && sql.contains("$2"));
        assert!(sql.ends_with("LIMIT 50"));
        assert_eq!(binds.len(), 2);
    }

    #[tokio::test]
    async fn test_empty_result_is_literal_marker() {
        let store = Arc::new(FakeStore::default());
        let tool = PatientLookupTool::new(Arc::clone(&store) as Arc<dyn PatientStore>, 50);

        let outcome = tool
            .invoke(json!({ "query_type": "by_condition", "condition": "Hypertension" }))
            .await;

        assert_eq!(outcome, ToolOutcome::success(NO_ROWS));
        assert_eq!(
            store.seen.lock().unwrap()[0],
            (
                PatientQuery::ByCondition {
                    condition: "Hypertension".into()
                },
                50
            )
        );
    }

    #[tokio::test]
    async fn test_rows_are_rendered() {
        let store = FakeStore {
            result: RowSet {
                columns: vec!["patient_count".into()],
                rows: vec![vec![Some("42".into())]],
            },
            ..Default::default()
        };
        let tool = PatientLookupTool::new(Arc::new(store), 50);

        let outcome = tool
            .invoke(json!({
                "query_type": "count_by_condition_and_medication",
                "condition": "Hypertension",
                "medication": "Lisinopril"
            }))
            .await;

        assert_eq!(outcome.render(), "patient_count\n           42");
    }

    #[tokio::test]
    async fn test_free_text_sql_is_rejected() {
        let tool = PatientLookupTool::new(Arc::new(FakeStore::default()), 50);
        let outcome = tool
            .invoke(json!({ "query": "SELECT * FROM patient_medical_data" }))
            .await;
        assert_eq!(outcome.failure_kind(), Some(FailureKind::InvalidArguments));
    }

    #[tokio::test]
    async fn test_store_failure_is_contained() {
        let tool = PatientLookupTool::new(Arc::new(BrokenStore), 50);
        let outcome = tool
            .invoke(json!({ "query_type": "by_medication", "medication": "Metformin" }))
            .await;

        assert_eq!(outcome.failure_kind(), Some(FailureKind::Upstream));
        assert!(outcome.render().starts_with("Database error: "));
    }
}
