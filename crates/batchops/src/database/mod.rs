//! Database connection and embedded schema migrations

use anyhow::Result;
use sqlx::{migrate::MigrateDatabase, Pool, Sqlite, SqlitePool};

use crate::config::DatabaseConfig;

/// Versioned schema migrations applied in order at startup
const MIGRATIONS: &[(i64, &str, &str)] = &[
    (
        1,
        "initial_schema",
        r#"
        CREATE TABLE IF NOT EXISTS uploads (
            id TEXT PRIMARY KEY,
            department TEXT NOT NULL,
            filename TEXT NOT NULL,
            file_path TEXT,
            notes TEXT,
            status TEXT NOT NULL DEFAULT 'pending',
            process_mode TEXT NOT NULL DEFAULT 'transform',
            process_config TEXT NOT NULL DEFAULT '{}',
            received_at TEXT NOT NULL,
            report_csv TEXT,
            report_pdf BLOB,
            report_meta TEXT,
            report_generated_at TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_uploads_status_department
            ON uploads(status, department);

        CREATE TABLE IF NOT EXISTS jobs (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            job_type TEXT NOT NULL DEFAULT 'callable',
            config TEXT NOT NULL DEFAULT '{}',
            schedule_cron TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS job_runs (
            id TEXT PRIMARY KEY,
            job_id TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
            upload_id TEXT REFERENCES uploads(id) ON DELETE CASCADE,
            status TEXT NOT NULL DEFAULT 'queued',
            started_at TEXT,
            finished_at TEXT,
            duration_ms INTEGER,
            exit_code INTEGER,
            details TEXT NOT NULL DEFAULT '[]',
            logs TEXT NOT NULL DEFAULT ''
        );
        CREATE INDEX IF NOT EXISTS idx_job_runs_upload_job
            ON job_runs(upload_id, job_id);
        CREATE INDEX IF NOT EXISTS idx_job_runs_status ON job_runs(status);

        CREATE TABLE IF NOT EXISTS known_errors (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL DEFAULT '',
            pattern TEXT NOT NULL UNIQUE,
            severity TEXT NOT NULL DEFAULT 'medium',
            category TEXT NOT NULL DEFAULT '',
            corrective_action TEXT,
            root_cause TEXT,
            resolution_report TEXT,
            auto_retry INTEGER NOT NULL DEFAULT 0,
            max_auto_retries INTEGER NOT NULL DEFAULT 0,
            active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS incidents (
            id TEXT PRIMARY KEY,
            upload_id TEXT NOT NULL REFERENCES uploads(id) ON DELETE CASCADE,
            job_run_id TEXT,
            stage TEXT NOT NULL,
            state TEXT NOT NULL DEFAULT 'open',
            severity TEXT NOT NULL DEFAULT 'medium',
            category TEXT,
            error TEXT NOT NULL,
            root_cause TEXT,
            corrective_action TEXT,
            impact_summary TEXT,
            analysis_notes TEXT,
            resolution_report TEXT,
            matched_known_error TEXT,
            is_known INTEGER NOT NULL DEFAULT 0,
            auto_retry_count INTEGER NOT NULL DEFAULT 0,
            max_auto_retries INTEGER NOT NULL DEFAULT 0,
            detection_source TEXT NOT NULL DEFAULT 'engine',
            assignee TEXT,
            resolved_by TEXT,
            timeline TEXT NOT NULL DEFAULT '[]',
            created_at TEXT NOT NULL,
            resolved_at TEXT,
            archived_at TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_incidents_state_upload
            ON incidents(state, upload_id);
        CREATE INDEX IF NOT EXISTS idx_incidents_upload_stage
            ON incidents(upload_id, stage);

        CREATE TABLE IF NOT EXISTS department_sources (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            code TEXT NOT NULL UNIQUE,
            description TEXT NOT NULL DEFAULT '',
            active INTEGER NOT NULL DEFAULT 1,
            last_ingested_at TEXT,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS department_records (
            id TEXT PRIMARY KEY,
            source_id TEXT NOT NULL REFERENCES department_sources(id) ON DELETE CASCADE,
            student_id TEXT NOT NULL,
            student_name TEXT NOT NULL DEFAULT '',
            class_name TEXT NOT NULL DEFAULT '',
            score REAL,
            attendance_percent REAL,
            status TEXT NOT NULL DEFAULT '',
            recorded_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_department_records_source
            ON department_records(source_id, recorded_at);
        "#,
    ),
];

/// Connection handle shared by the SQL repositories
#[derive(Clone)]
pub struct Database {
    pool: Pool<Sqlite>,
}

impl Database {
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        if !Sqlite::database_exists(&config.url).await.unwrap_or(false) {
            Sqlite::create_database(&config.url).await?;
        }
        let pool = SqlitePool::connect(&config.url).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// Apply any not-yet-applied embedded migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS _batchops_migrations (
                version INTEGER PRIMARY KEY,
                description TEXT NOT NULL,
                applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        for (version, description, sql) in MIGRATIONS {
            let applied: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM _batchops_migrations WHERE version = ?",
            )
            .bind(version)
            .fetch_one(&self.pool)
            .await?;
            if applied > 0 {
                continue;
            }

            let mut tx = self.pool.begin().await?;
            sqlx::raw_sql(sql).execute(&mut *tx).await?;
            sqlx::query(
                "INSERT INTO _batchops_migrations (version, description) VALUES (?, ?)",
            )
            .bind(version)
            .bind(description)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;

            tracing::info!("Applied migration {:03}_{}", version, description);
        }

        Ok(())
    }
}
