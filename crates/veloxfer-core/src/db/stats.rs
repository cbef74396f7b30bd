//! Transfer stats database operations

use crate::db::Database;
use crate::error::Result;
use crate::types::{TransferStats, TransferType};
use rusqlite::params;

/// Aggregate totals over the stats table
#[derive(Debug, Clone, Default)]
pub struct StatsTotals {
    pub transfers: i64,
    pub succeeded: i64,
    pub total_bytes: i64,
}

/// Stats table operations
pub struct StatsDb;

impl StatsDb {
    /// Save a completed transfer. Saving the same transfer_id twice
    /// replaces the row instead of duplicating it.
    pub fn save(db: &Database, stats: &TransferStats) -> Result<i64> {
        db.with_conn(|conn| {
            conn.execute(
                r#"
                INSERT OR REPLACE INTO transfer_stats
                (transfer_id, user_id, file_name, file_size, transfer_type,
                 duration_seconds, avg_speed_bps, max_speed_bps, min_speed_bps,
                 success, error_message, retry_count, tags, started_at, finished_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
                "#,
                params![
                    stats.transfer_id,
                    stats.user_id,
                    stats.file_name,
                    stats.file_size as i64,
                    stats.transfer_type.to_string(),
                    stats.duration_seconds,
                    stats.avg_speed_bps,
                    stats.max_speed_bps,
                    stats.min_speed_bps,
                    stats.success as i64,
                    stats.error_message,
                    stats.retry_count as i64,
                    if stats.tags.is_empty() {
                        None
                    } else {
                        Some(stats.tags.join(","))
                    },
                    stats.started_at,
                    stats.finished_at,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Get a record by transfer id
    pub fn get_by_id(db: &Database, transfer_id: &str) -> Result<Option<TransferStats>> {
        db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                r#"
                SELECT transfer_id, user_id, file_name, file_size, transfer_type,
                       duration_seconds, avg_speed_bps, max_speed_bps, min_speed_bps,
                       success, error_message, retry_count, tags, started_at, finished_at
                FROM transfer_stats WHERE transfer_id = ?1
                "#,
            )?;

            let result = stmt.query_row(params![transfer_id], row_to_stats);

            match result {
                Ok(stats) => Ok(Some(stats)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(e),
            }
        })
    }

    /// Most recently finished transfers
    pub fn recent(db: &Database, limit: i64) -> Result<Vec<TransferStats>> {
        db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                r#"
                SELECT transfer_id, user_id, file_name, file_size, transfer_type,
                       duration_seconds, avg_speed_bps, max_speed_bps, min_speed_bps,
                       success, error_message, retry_count, tags, started_at, finished_at
                FROM transfer_stats
                ORDER BY finished_at DESC
                LIMIT ?1
                "#,
            )?;

            let records = stmt
                .query_map(params![limit], row_to_stats)?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            Ok(records)
        })
    }

    /// Aggregate totals
    pub fn totals(db: &Database) -> Result<StatsTotals> {
        db.with_conn(|conn| {
            conn.query_row(
                r#"
                SELECT COUNT(*),
                       COALESCE(SUM(success), 0),
                       COALESCE(SUM(file_size), 0)
                FROM transfer_stats
                "#,
                [],
                |row| {
                    Ok(StatsTotals {
                        transfers: row.get(0)?,
                        succeeded: row.get(1)?,
                        total_bytes: row.get(2)?,
                    })
                },
            )
        })
    }

    /// Clear all records
    pub fn clear(db: &Database) -> Result<()> {
        db.with_conn(|conn| {
            conn.execute("DELETE FROM transfer_stats", [])?;
            Ok(())
        })
    }
}

fn row_to_stats(row: &rusqlite::Row) -> rusqlite::Result<TransferStats> {
    let transfer_type_str: String = row.get(4)?;
    let tags_str: Option<String> = row.get(12)?;

    Ok(TransferStats {
        transfer_id: row.get(0)?,
        user_id: row.get(1)?,
        file_name: row.get(2)?,
        file_size: row.get::<_, i64>(3)? as u64,
        transfer_type: TransferType::from(transfer_type_str.as_str()),
        duration_seconds: row.get(5)?,
        avg_speed_bps: row.get(6)?,
        max_speed_bps: row.get(7)?,
        min_speed_bps: row.get(8)?,
        success: row.get::<_, i64>(9)? != 0,
        error_message: row.get(10)?,
        retry_count: row.get::<_, i64>(11)? as u32,
        tags: tags_str
            .map(|s| s.split(',').map(String::from).collect())
            .unwrap_or_default(),
        started_at: row.get(13)?,
        finished_at: row.get(14)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(id: &str) -> TransferStats {
        TransferStats {
            transfer_id: id.to_string(),
            user_id: "u1".into(),
            file_name: "video.mkv".into(),
            file_size: 1024 * 1024,
            transfer_type: TransferType::Download,
            duration_seconds: 12.5,
            avg_speed_bps: 83886.0,
            max_speed_bps: 100000.0,
            min_speed_bps: 50000.0,
            success: true,
            error_message: None,
            retry_count: 1,
            tags: vec!["video".into(), "hd".into()],
            started_at: "2026-08-05T10:00:00+00:00".into(),
            finished_at: "2026-08-05T10:00:12+00:00".into(),
        }
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let db = Database::open_in_memory().unwrap();
        StatsDb::save(&db, &sample("t1")).unwrap();

        let loaded = StatsDb::get_by_id(&db, "t1").unwrap().unwrap();
        assert_eq!(loaded.file_name, "video.mkv");
        assert_eq!(loaded.file_size, 1024 * 1024);
        assert_eq!(loaded.tags, vec!["video".to_string(), "hd".to_string()]);
        assert!(loaded.success);

        assert!(StatsDb::get_by_id(&db, "missing").unwrap().is_none());
    }

    #[test]
    fn test_double_save_does_not_duplicate() {
        let db = Database::open_in_memory().unwrap();
        StatsDb::save(&db, &sample("t1")).unwrap();
        StatsDb::save(&db, &sample("t1")).unwrap();

        let totals = StatsDb::totals(&db).unwrap();
        assert_eq!(totals.transfers, 1);
    }

    #[test]
    fn test_recent_orders_by_finish_time() {
        let db = Database::open_in_memory().unwrap();
        let mut early = sample("t1");
        early.finished_at = "2026-08-05T09:00:00+00:00".into();
        let late = sample("t2");
        StatsDb::save(&db, &early).unwrap();
        StatsDb::save(&db, &late).unwrap();

        let recent = StatsDb::recent(&db, 10).unwrap();
        assert_eq!(recent[0].transfer_id, "t2");
        assert_eq!(recent.len(), 2);
    }

    #[test]
    fn test_totals_aggregate() {
        let db = Database::open_in_memory().unwrap();
        let mut failed = sample("t1");
        failed.success = false;
        StatsDb::save(&db, &failed).unwrap();
        StatsDb::save(&db, &sample("t2")).unwrap();

        let totals = StatsDb::totals(&db).unwrap();
        assert_eq!(totals.transfers, 2);
        assert_eq!(totals.succeeded, 1);
        assert_eq!(totals.total_bytes, 2 * 1024 * 1024);
    }
}
