//! Operation timing metrics

use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use super::queries::now_stamp;
use crate::error::Result;

/// Aggregated timings for one operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSummary {
    pub operation: String,
    pub count: i64,
    pub avg_ms: f64,
    pub max_ms: f64,
}

/// Append one timing sample
pub fn record_metric(conn: &Connection, operation: &str, duration_ms: f64) -> Result<()> {
    conn.execute(
        "INSERT INTO performance_metrics (operation, duration_ms, recorded_at)
         VALUES (?1, ?2, ?3)",
        params![operation, duration_ms, now_stamp()],
    )?;
    Ok(())
}

/// Per-operation summaries over all recorded samples
pub fn metric_summaries(conn: &Connection) -> Result<Vec<MetricSummary>> {
    let mut stmt = conn.prepare_cached(
        "SELECT operation, COUNT(*), AVG(duration_ms), MAX(duration_ms)
         FROM performance_metrics
         GROUP BY operation ORDER BY operation",
    )?;
    let summaries = stmt
        .query_map([], |row| {
            Ok(MetricSummary {
                operation: row.get(0)?,
                count: row.get(1)?,
                avg_ms: row.get(2)?,
                max_ms: row.get(3)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(summaries)
}

/// Drop samples older than the retention window
pub fn prune_metrics(conn: &Connection, keep_days: i64) -> Result<usize> {
    let cutoff = chrono::Utc::now() - chrono::Duration::days(keep_days);
    let deleted = conn.execute(
        "DELETE FROM performance_metrics WHERE recorded_at < ?1",
        [cutoff.to_rfc3339()],
    )?;
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;

    #[test]
    fn test_record_and_summarize() {
        let storage = Storage::open_in_memory().unwrap();
        storage
            .with_writer(|conn| {
                record_metric(conn, "search.keyword", 12.5)?;
                record_metric(conn, "search.keyword", 7.5)?;
                record_metric(conn, "memory.create", 3.0)
            })
            .unwrap();

        let summaries = storage.with_reader(metric_summaries).unwrap();
        assert_eq!(summaries.len(), 2);
        let keyword = summaries
            .iter()
            .find(|s| s.operation == "search.keyword")
            .unwrap();
        assert_eq!(keyword.count, 2);
        assert!((keyword.avg_ms - 10.0).abs() < f64::EPSILON);
        assert!((keyword.max_ms - 12.5).abs() < f64::EPSILON);
    }
}
