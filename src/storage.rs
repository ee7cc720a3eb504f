use anyhow::Result;
use rusqlite::{params, Connection};

use crate::reconcile::{NextStep, TickReport};

/// Optional SQLite log of applied ticks.
pub struct HistoryStore {
    conn: Connection,
}

impl HistoryStore {
    pub fn new(path: &str) -> Result<Self> {
        Ok(Self { conn: Connection::open(path)? })
    }

    pub fn init(&mut self) -> Result<()> {
        self.conn.execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS observations (
                ts INTEGER NOT NULL,
                cycle INTEGER NOT NULL,
                step_count INTEGER NOT NULL,
                feature_id INTEGER NOT NULL,
                value REAL,
                source TEXT NOT NULL,
                status TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS predictions (
                ts INTEGER NOT NULL,
                cycle INTEGER NOT NULL,
                feature_id INTEGER NOT NULL,
                value REAL NOT NULL
            );
            COMMIT;",
        )?;
        Ok(())
    }

    /// One observation row per feature, one prediction row per ready forecast.
    pub fn record_tick(&mut self, ts: u64, report: &TickReport) -> Result<()> {
        let tx = self.conn.transaction()?;
        for rec in &report.records {
            tx.execute(
                "INSERT INTO observations (ts, cycle, step_count, feature_id, value, source, status)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    ts as i64,
                    report.cycle as i64,
                    report.upstream_step as i64,
                    rec.feature_id as i64,
                    rec.current,
                    rec.source.as_str(),
                    rec.status.as_str()
                ],
            )?;
            if let NextStep::Value(v) = rec.next_step {
                tx.execute(
                    "INSERT INTO predictions (ts, cycle, feature_id, value) VALUES (?1, ?2, ?3, ?4)",
                    params![ts as i64, report.cycle as i64, rec.feature_id as i64, v],
                )?;
            }
        }
        tx.commit()?;
        Ok(())
    }
}
