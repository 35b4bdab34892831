use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{types::Json, Pool, Postgres};
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

use crate::error::{VersionError, VersionResult};
use crate::models::{
    BuildStatus, BuildTransition, DeployStatus, DeployTransition, NewVersion, ProjectVersion, StatusRecord, StorageRecord,
};
use crate::store::VersionStore;

pub async fn init_db(database_url: &str) -> anyhow::Result<Pool<Postgres>> {
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(3))
        .connect(database_url)
        .await?;
    sqlx::migrate!().run(&pool).await?;
    info!("migrations applied");
    Ok(pool)
}

const COLUMNS: &str = "id, project_id, number, code, src_storage, dist_storage, \
    build_status, build_status_updated_at, build_status_reason, \
    deploy_status, deploy_status_updated_at, deploy_status_reason, build_request_id, created_at";

const UNIQUE_CODE_INDEX: &str = "project_versions_project_code";

#[derive(sqlx::FromRow, Debug)]
struct VersionRow {
    id: Uuid,
    project_id: String,
    number: Option<i64>,
    code: Option<String>,
    src_storage: Json<StorageRecord>,
    dist_storage: Json<StorageRecord>,
    build_status: String,
    build_status_updated_at: DateTime<Utc>,
    build_status_reason: Option<String>,
    deploy_status: String,
    deploy_status_updated_at: DateTime<Utc>,
    deploy_status_reason: Option<String>,
    build_request_id: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<VersionRow> for ProjectVersion {
    type Error = VersionError;

    fn try_from(r: VersionRow) -> VersionResult<Self> {
        let build = r.build_status.parse::<BuildStatus>().map_err(VersionError::storage)?;
        let deploy = r.deploy_status.parse::<DeployStatus>().map_err(VersionError::storage)?;
        Ok(ProjectVersion {
            id: r.id,
            project_id: r.project_id,
            number: r.number,
            code: r.code,
            src_storage: r.src_storage.0,
            dist_storage: r.dist_storage.0,
            build_status: StatusRecord { value: build, updated_at: r.build_status_updated_at, reason: r.build_status_reason },
            deploy_status: StatusRecord { value: deploy, updated_at: r.deploy_status_updated_at, reason: r.deploy_status_reason },
            build_request_id: r.build_request_id,
            created_at: r.created_at,
        })
    }
}

fn convert_all(rows: Vec<VersionRow>) -> VersionResult<Vec<ProjectVersion>> {
    rows.into_iter().map(ProjectVersion::try_from).collect()
}

fn convert_opt(row: Option<VersionRow>) -> VersionResult<Option<ProjectVersion>> {
    row.map(ProjectVersion::try_from).transpose()
}

fn is_duplicate_code(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .map(|db| db.is_unique_violation() && db.constraint().map_or(true, |c| c == UNIQUE_CODE_INDEX))
        .unwrap_or(false)
}

/// Postgres backed [`VersionStore`]. Guarded transitions lock the row, check in Rust, write back.
#[derive(Clone, Debug)]
pub struct PgVersionStore { pool: Pool<Postgres> }

impl PgVersionStore {
    pub fn new(pool: Pool<Postgres>) -> Self { Self { pool } }
    pub fn pool(&self) -> &Pool<Postgres> { &self.pool }

    async fn lock_row(tx: &mut sqlx::Transaction<'_, Postgres>, id: Uuid) -> VersionResult<Option<ProjectVersion>> {
        let row = sqlx::query_as::<_, VersionRow>(&format!("SELECT {COLUMNS} FROM project_versions WHERE id=$1 FOR UPDATE"))
            .bind(id)
            .fetch_optional(&mut **tx)
            .await?;
        convert_opt(row)
    }

    async fn write_state(tx: &mut sqlx::Transaction<'_, Postgres>, v: &ProjectVersion) -> VersionResult<ProjectVersion> {
        let sql = format!(
            "UPDATE project_versions SET dist_storage=$2, build_status=$3, build_status_updated_at=$4, build_status_reason=$5, \
             deploy_status=$6, deploy_status_updated_at=$7, deploy_status_reason=$8, build_request_id=$9 \
             WHERE id=$1 RETURNING {COLUMNS}"
        );
        let row = sqlx::query_as::<_, VersionRow>(&sql)
            .bind(v.id)
            .bind(Json(&v.dist_storage))
            .bind(v.build_status.value.as_str())
            .bind(v.build_status.updated_at)
            .bind(&v.build_status.reason)
            .bind(v.deploy_status.value.as_str())
            .bind(v.deploy_status.updated_at)
            .bind(&v.deploy_status.reason)
            .bind(&v.build_request_id)
            .fetch_one(&mut **tx)
            .await?;
        row.try_into()
    }
}

#[async_trait]
impl VersionStore for PgVersionStore {
    async fn insert_draft(&self, draft: NewVersion) -> VersionResult<ProjectVersion> {
        // GREATEST skips the NULL from an empty project
        let sql = format!(
            "INSERT INTO project_versions (id, project_id, src_storage, dist_storage, created_at) \
             VALUES ($1, $2, $3, $4, GREATEST(clock_timestamp(), \
               (SELECT max(created_at) + interval '1 microsecond' FROM project_versions WHERE project_id=$2))) \
             RETURNING {COLUMNS}"
        );
        let row = sqlx::query_as::<_, VersionRow>(&sql)
            .bind(draft.id)
            .bind(&draft.project_id)
            .bind(Json(&draft.src_storage))
            .bind(Json(&draft.dist_storage))
            .fetch_one(&self.pool)
            .await?;
        row.try_into()
    }

    async fn assign_number(&self, id: Uuid, number: i64, code: &str) -> VersionResult<ProjectVersion> {
        let res = sqlx::query_as::<_, VersionRow>(&format!("UPDATE project_versions SET number=$2, code=$3 WHERE id=$1 RETURNING {COLUMNS}"))
            .bind(id)
            .bind(number)
            .bind(code)
            .fetch_optional(&self.pool)
            .await;
        match res {
            Ok(Some(row)) => row.try_into(),
            Ok(None) => Err(VersionError::not_found("version", id.to_string())),
            Err(e) if is_duplicate_code(&e) => {
                let project_id = sqlx::query_scalar::<_, String>("SELECT project_id FROM project_versions WHERE id=$1")
                    .bind(id)
                    .fetch_optional(&self.pool)
                    .await?
                    .unwrap_or_default();
                Err(VersionError::DuplicateCode { project_id, code: code.to_string() })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn find_previous(&self, project_id: &str, before: DateTime<Utc>) -> VersionResult<Option<ProjectVersion>> {
        let row = sqlx::query_as::<_, VersionRow>(&format!(
            "SELECT {COLUMNS} FROM project_versions WHERE project_id=$1 AND created_at < $2 ORDER BY created_at DESC LIMIT 1"
        ))
        .bind(project_id)
        .bind(before)
        .fetch_optional(&self.pool)
        .await?;
        convert_opt(row)
    }

    async fn get(&self, id: Uuid) -> VersionResult<Option<ProjectVersion>> {
        let row = sqlx::query_as::<_, VersionRow>(&format!("SELECT {COLUMNS} FROM project_versions WHERE id=$1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        convert_opt(row)
    }

    async fn find_by_code(&self, project_id: &str, code: &str) -> VersionResult<Option<ProjectVersion>> {
        let row = sqlx::query_as::<_, VersionRow>(&format!("SELECT {COLUMNS} FROM project_versions WHERE project_id=$1 AND code=$2"))
            .bind(project_id)
            .bind(code)
            .fetch_optional(&self.pool)
            .await?;
        convert_opt(row)
    }

    async fn find_latest(&self, project_id: &str) -> VersionResult<Option<ProjectVersion>> {
        let row = sqlx::query_as::<_, VersionRow>(&format!(
            "SELECT {COLUMNS} FROM project_versions WHERE project_id=$1 AND code IS NOT NULL ORDER BY created_at DESC, number DESC LIMIT 1"
        ))
        .bind(project_id)
        .fetch_optional(&self.pool)
        .await?;
        convert_opt(row)
    }

    async fn list_by_project(&self, project_id: &str) -> VersionResult<Vec<ProjectVersion>> {
        let rows = sqlx::query_as::<_, VersionRow>(&format!(
            "SELECT {COLUMNS} FROM project_versions WHERE project_id=$1 AND code IS NOT NULL ORDER BY created_at ASC, number ASC"
        ))
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    async fn list_by_build_status(&self, statuses: &[BuildStatus], limit: i64) -> VersionResult<Vec<ProjectVersion>> {
        let wanted: Vec<String> = statuses.iter().map(|s| s.as_str().to_string()).collect();
        let rows = sqlx::query_as::<_, VersionRow>(&format!(
            "SELECT {COLUMNS} FROM project_versions WHERE code IS NOT NULL AND build_status = ANY($1) \
             ORDER BY created_at ASC, number ASC LIMIT $2"
        ))
        .bind(&wanted)
        .bind(limit.max(0))
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    async fn find_by_build_request(&self, request_id: &str) -> VersionResult<Option<ProjectVersion>> {
        let row = sqlx::query_as::<_, VersionRow>(&format!("SELECT {COLUMNS} FROM project_versions WHERE build_request_id=$1"))
            .bind(request_id)
            .fetch_optional(&self.pool)
            .await?;
        convert_opt(row)
    }

    async fn transition_build(&self, id: Uuid, request_id: Option<&str>, transition: &BuildTransition) -> VersionResult<Option<ProjectVersion>> {
        let mut tx = self.pool.begin().await?;
        let Some(mut v) = Self::lock_row(&mut tx, id).await? else { return Ok(None) };
        if !transition.allowed_from().contains(&v.build_status.value) { return Ok(None); }
        if request_id.is_some() && v.build_request_id.as_deref() != request_id { return Ok(None); }
        transition.apply(&mut v, Utc::now());
        let updated = Self::write_state(&mut tx, &v).await?;
        tx.commit().await?;
        Ok(Some(updated))
    }

    async fn transition_deploy(&self, id: Uuid, transition: &DeployTransition) -> VersionResult<Option<ProjectVersion>> {
        let mut tx = self.pool.begin().await?;
        let Some(mut v) = Self::lock_row(&mut tx, id).await? else { return Ok(None) };
        if !transition.allowed_from().contains(&v.deploy_status.value) { return Ok(None); }
        transition.apply(&mut v, Utc::now());
        let updated = Self::write_state(&mut tx, &v).await?;
        tx.commit().await?;
        Ok(Some(updated))
    }

    async fn remove(&self, id: Uuid) -> VersionResult<bool> {
        let res = sqlx::query("DELETE FROM project_versions WHERE id=$1").bind(id).execute(&self.pool).await?;
        Ok(res.rows_affected() > 0)
    }

    async fn list_stale_drafts(&self, before: DateTime<Utc>, limit: i64) -> VersionResult<Vec<ProjectVersion>> {
        let rows = sqlx::query_as::<_, VersionRow>(&format!(
            "SELECT {COLUMNS} FROM project_versions WHERE code IS NULL AND created_at < $1 ORDER BY created_at ASC LIMIT $2"
        ))
        .bind(before)
        .bind(limit.max(0))
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    async fn remove_draft(&self, id: Uuid) -> VersionResult<bool> {
        let res = sqlx::query("DELETE FROM project_versions WHERE id=$1 AND code IS NULL").bind(id).execute(&self.pool).await?;
        Ok(res.rows_affected() > 0)
    }
}
