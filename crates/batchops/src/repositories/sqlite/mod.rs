//! SQL-backed repositories
//!
//! Each entity's queries live in its own module; rows are mapped by hand
//! (TEXT uuids, RFC3339 timestamps, JSON payload columns) so the store
//! works against a plain connection with runtime-checked queries. The
//! atomic (run finalise + incident write) path shares the statement
//! helpers with the per-entity modules and wraps them in one transaction.

use async_trait::async_trait;
use sqlx::Row;
use uuid::Uuid;

use super::traits::{FailureSink, IncidentWrite, Repos};
use crate::database::Database;
use crate::errors::{RepositoryError, RepositoryResult};
use crate::models::{Incident, RunFinalize};

mod department;
mod incident;
mod job;
mod job_run;
mod known_error;
mod upload;

pub(crate) use incident::{exec_insert_incident, exec_update_incident};
pub(crate) use job_run::exec_finalize_run;

/// SQL repository bundle over one connection pool
#[derive(Clone)]
pub struct SqliteStore {
    db: Database,
}

impl SqliteStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub(crate) fn pool(&self) -> &sqlx::Pool<sqlx::Sqlite> {
        self.db.pool()
    }

    /// Bundle this store as the engine's repository set
    pub fn repos(&self) -> Repos {
        Repos {
            uploads: std::sync::Arc::new(self.clone()),
            jobs: std::sync::Arc::new(self.clone()),
            runs: std::sync::Arc::new(self.clone()),
            incidents: std::sync::Arc::new(self.clone()),
            known_errors: std::sync::Arc::new(self.clone()),
            departments: std::sync::Arc::new(self.clone()),
            failures: std::sync::Arc::new(self.clone()),
        }
    }
}

pub(crate) fn get_uuid(row: &sqlx::sqlite::SqliteRow, column: &str) -> RepositoryResult<Uuid> {
    let raw: String = row.get(column);
    Ok(Uuid::parse_str(&raw)?)
}

pub(crate) fn get_uuid_opt(
    row: &sqlx::sqlite::SqliteRow,
    column: &str,
) -> RepositoryResult<Option<Uuid>> {
    let raw: Option<String> = row.get(column);
    raw.map(|v| Uuid::parse_str(&v).map_err(RepositoryError::from))
        .transpose()
}

pub(crate) fn get_json<T: serde::de::DeserializeOwned>(
    row: &sqlx::sqlite::SqliteRow,
    column: &str,
) -> RepositoryResult<T> {
    let raw: String = row.get(column);
    Ok(serde_json::from_str(&raw)?)
}

#[async_trait]
impl FailureSink for SqliteStore {
    async fn record_failure(
        &self,
        finalize: RunFinalize,
        incident: IncidentWrite,
    ) -> RepositoryResult<Incident> {
        let mut tx = self.pool().begin().await?;
        exec_finalize_run(&mut *tx, &finalize).await?;
        let stored = match incident {
            IncidentWrite::Create(incident) => {
                exec_insert_incident(&mut *tx, &incident).await?;
                incident
            }
            IncidentWrite::Update(incident) => {
                exec_update_incident(&mut *tx, &incident).await?;
                incident
            }
        };
        tx.commit().await?;
        Ok(stored)
    }
}
