//! Typed warehouse statements and their BigQuery Standard SQL rendering.

use velo_core::PartitionKey;

use super::{TableRef, quote_relation};
use crate::row::Value;

/// A statement the warehouse can execute.
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    /// Creates a raw table if it does not exist.
    EnsureTable {
        /// Table definition.
        table: TableRef,
    },
    /// Registers a view.
    CreateView {
        /// Model the view is defined by.
        model: String,
        /// Fully-qualified relation.
        relation: String,
        /// Compiled view body.
        sql: String,
    },
    /// Replaces a table with the result of a query.
    CreateTableAs {
        /// Model the table is computed by.
        model: String,
        /// Fully-qualified relation.
        relation: String,
        /// Compiled query.
        sql: String,
        /// Clustering columns.
        cluster_by: Vec<String>,
    },
    /// Replaces one month of a partitioned table with the result of a query.
    MergePartition {
        /// Model the table is computed by.
        model: String,
        /// Fully-qualified relation.
        relation: String,
        /// Compiled query.
        sql: String,
        /// DATE column the table is partitioned on.
        partition_column: String,
        /// Month being replaced.
        partition: PartitionKey,
        /// Clustering columns.
        cluster_by: Vec<String>,
    },
    /// A read-only query.
    Query {
        /// Query text.
        sql: String,
    },
}

impl Statement {
    /// Returns a short name of the statement kind.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::EnsureTable { .. } => "ensure_table",
            Self::CreateView { .. } => "create_view",
            Self::CreateTableAs { .. } => "create_table_as",
            Self::MergePartition { .. } => "merge_partition",
            Self::Query { .. } => "query",
        }
    }

    /// Returns the relation the statement writes, if any.
    #[must_use]
    pub fn relation(&self) -> Option<&str> {
        match self {
            Self::EnsureTable { table } => Some(&table.relation),
            Self::CreateView { relation, .. }
            | Self::CreateTableAs { relation, .. }
            | Self::MergePartition { relation, .. } => Some(relation),
            Self::Query { .. } => None,
        }
    }

    /// Renders the statement as BigQuery Standard SQL.
    #[must_use]
    pub fn to_sql(&self) -> String {
        match self {
            Self::EnsureTable { table } => ensure_table_sql(table),
            Self::CreateView { relation, sql, .. } => {
                format!("CREATE OR REPLACE VIEW {} AS\n{sql}", quote_relation(relation))
            }
            Self::CreateTableAs {
                relation,
                sql,
                cluster_by,
                ..
            } => format!(
                "CREATE OR REPLACE TABLE {}{}\nAS\n{sql}",
                quote_relation(relation),
                cluster_clause(cluster_by)
            ),
            Self::MergePartition {
                relation,
                sql,
                partition_column,
                partition,
                cluster_by,
                ..
            } => {
                let target = quote_relation(relation);
                let range = date_range(partition_column, *partition);
                format!(
                    "CREATE TABLE IF NOT EXISTS {target}\nPARTITION BY {partition_column}{cluster}\nAS SELECT * FROM (\n{sql}\n) WHERE FALSE;\n\
                     DELETE FROM {target} WHERE {range};\n\
                     INSERT INTO {target}\nSELECT * FROM (\n{sql}\n) WHERE {range};",
                    cluster = cluster_clause(cluster_by),
                )
            }
            Self::Query { sql } => sql.clone(),
        }
    }
}

/// Renders the delete issued by a partition reload.
#[must_use]
pub fn delete_partition_sql(table: &TableRef, partition: PartitionKey) -> String {
    format!(
        "DELETE FROM {} WHERE {}",
        quote_relation(&table.relation),
        date_range(&table.partition_date_sql(), partition)
    )
}

fn date_range(expr: &str, partition: PartitionKey) -> String {
    format!(
        "{expr} BETWEEN {} AND {}",
        Value::from(partition.first_day()).sql_literal(),
        Value::from(partition.last_day()).sql_literal()
    )
}

fn cluster_clause(columns: &[String]) -> String {
    if columns.is_empty() {
        String::new()
    } else {
        format!("\nCLUSTER BY {}", columns.join(", "))
    }
}

fn ensure_table_sql(table: &TableRef) -> String {
    let columns = table
        .schema
        .iter()
        .map(|(name, ty)| format!("  {name} {}", ty.sql_name()))
        .collect::<Vec<_>>()
        .join(",\n");
    let partition = table
        .storage_partition
        .as_ref()
        .map(|column| format!("\nPARTITION BY DATE({column})"))
        .unwrap_or_default();
    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n{columns}\n){partition}{}",
        quote_relation(&table.relation),
        cluster_clause(&table.cluster_by)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::warehouse::Dataset;

    fn jan() -> PartitionKey {
        PartitionKey::new(2025, 1).unwrap()
    }

    #[test]
    fn delete_uses_month_bounds() {
        let table = TableRef::trips(&Dataset::new("citibike-portfolio", "citibike"), "trips");
        assert_eq!(
            delete_partition_sql(&table, jan()),
            "DELETE FROM `citibike-portfolio.citibike.trips` WHERE DATE(COALESCE(ended_at, started_at)) BETWEEN DATE '2025-01-01' AND DATE '2025-01-31'"
        );
    }

    #[test]
    fn ensure_table_carries_partition_and_cluster_hints() {
        let table = TableRef::trips(&Dataset::new("p", "d"), "trips");
        let sql = Statement::EnsureTable { table }.to_sql();
        assert!(sql.starts_with("CREATE TABLE IF NOT EXISTS `p.d.trips` ("));
        assert!(sql.contains("  started_at TIMESTAMP"));
        assert!(sql.contains("PARTITION BY DATE(started_at)"));
        assert!(sql.ends_with("CLUSTER BY start_station_id, member_casual"));
    }

    #[test]
    fn merge_partition_deletes_then_inserts_month() {
        let stmt = Statement::MergePartition {
            model: "fct_daily".into(),
            relation: "p.d.fct_daily".into(),
            sql: "SELECT 1 AS x".into(),
            partition_column: "ride_date".into(),
            partition: jan(),
            cluster_by: vec![],
        };
        let sql = stmt.to_sql();
        let delete = sql.find("DELETE FROM `p.d.fct_daily`").unwrap();
        let insert = sql.find("INSERT INTO `p.d.fct_daily`").unwrap();
        assert!(delete < insert);
        assert!(sql.contains("ride_date BETWEEN DATE '2025-01-01' AND DATE '2025-01-31'"));
        assert_eq!(stmt.relation(), Some("p.d.fct_daily"));
    }

    #[test]
    fn view_and_table_rendering() {
        let view = Statement::CreateView {
            model: "stg".into(),
            relation: "p.d.stg".into(),
            sql: "SELECT * FROM `p.d.trips`".into(),
        };
        assert_eq!(
            view.to_sql(),
            "CREATE OR REPLACE VIEW `p.d.stg` AS\nSELECT * FROM `p.d.trips`"
        );

        let table = Statement::CreateTableAs {
            model: "dim".into(),
            relation: "p.d.dim".into(),
            sql: "SELECT 1".into(),
            cluster_by: vec!["station_id".into()],
        };
        assert_eq!(
            table.to_sql(),
            "CREATE OR REPLACE TABLE `p.d.dim`\nCLUSTER BY station_id\nAS\nSELECT 1"
        );
    }
}
