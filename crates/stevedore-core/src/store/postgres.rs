// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL state store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::types::Json;

use crate::definition::Definition;
use crate::error::{CoreError, Result};
use crate::run::{EnvVar, Run, RunPatch, RunStatus};

use super::{ListRunsOptions, SortField, SortOrder, StateStore};

const RUN_COLUMNS: &str = "run_id, definition_id, alias, cluster_name, group_name, engine, \
     status, queued_at, started_at, finished_at, exit_code, exit_reason, \
     backend_handle, instance_id, instance_dns_name, env, command, cpu, memory, gpu";

/// Run row as stored; converted into [`Run`] after parsing the status text.
#[derive(Debug, sqlx::FromRow)]
struct RunRow {
    run_id: String,
    definition_id: String,
    alias: String,
    cluster_name: String,
    group_name: String,
    engine: Option<String>,
    status: String,
    queued_at: Option<DateTime<Utc>>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    exit_code: Option<i64>,
    exit_reason: Option<String>,
    backend_handle: Option<String>,
    instance_id: Option<String>,
    instance_dns_name: Option<String>,
    env: Json<Vec<EnvVar>>,
    command: Option<String>,
    cpu: Option<i64>,
    memory: Option<i64>,
    gpu: Option<i64>,
}

impl TryFrom<RunRow> for Run {
    type Error = CoreError;

    fn try_from(row: RunRow) -> Result<Self> {
        Ok(Run {
            status: row.status.parse()?,
            run_id: row.run_id,
            definition_id: row.definition_id,
            alias: row.alias,
            cluster_name: row.cluster_name,
            group_name: row.group_name,
            engine: row.engine,
            queued_at: row.queued_at,
            started_at: row.started_at,
            finished_at: row.finished_at,
            exit_code: row.exit_code,
            exit_reason: row.exit_reason,
            backend_handle: row.backend_handle,
            instance_id: row.instance_id,
            instance_dns_name: row.instance_dns_name,
            env: row.env.0,
            command: row.command,
            cpu: row.cpu,
            memory: row.memory,
            gpu: row.gpu,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct DefinitionRow {
    definition_id: String,
    image: String,
    alias: String,
    group_name: String,
    command: Option<String>,
    env: Json<Vec<EnvVar>>,
    memory: Option<i64>,
    cpu: Option<i64>,
    gpu: Option<i64>,
    ports: Json<Vec<i32>>,
    tags: Json<Vec<String>>,
    template_handle: Option<String>,
}

impl From<DefinitionRow> for Definition {
    fn from(row: DefinitionRow) -> Self {
        Definition {
            definition_id: row.definition_id,
            image: row.image,
            alias: row.alias,
            group_name: row.group_name,
            command: row.command,
            env: row.env.0,
            memory: row.memory,
            cpu: row.cpu,
            gpu: row.gpu,
            ports: row.ports.0,
            tags: row.tags.0,
            template_handle: row.template_handle,
        }
    }
}

/// PostgreSQL [`StateStore`] implementation.
pub struct PostgresStateStore {
    pool: PgPool,
}

impl PostgresStateStore {
    /// Create a store over the given pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn order_clause(options: &ListRunsOptions) -> &'static str {
        match (options.sort_by, options.order) {
            (SortField::QueuedAt, SortOrder::Asc) => "ORDER BY queued_at ASC NULLS FIRST",
            (SortField::QueuedAt, SortOrder::Desc) => "ORDER BY queued_at DESC NULLS LAST",
            (SortField::StartedAt, SortOrder::Asc) => "ORDER BY started_at ASC NULLS FIRST",
            (SortField::StartedAt, SortOrder::Desc) => "ORDER BY started_at DESC NULLS LAST",
            (SortField::FinishedAt, SortOrder::Asc) => "ORDER BY finished_at ASC NULLS FIRST",
            (SortField::FinishedAt, SortOrder::Desc) => "ORDER BY finished_at DESC NULLS LAST",
            (SortField::Status, SortOrder::Asc) => "ORDER BY status ASC",
            (SortField::Status, SortOrder::Desc) => "ORDER BY status DESC",
        }
    }
}

#[async_trait]
impl StateStore for PostgresStateStore {
    async fn create_run(&self, run: &Run) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO runs (run_id, definition_id, alias, cluster_name, group_name, engine,
                              status, queued_at, started_at, finished_at, exit_code, exit_reason,
                              backend_handle, instance_id, instance_dns_name, env, command,
                              cpu, memory, gpu)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17,
                    $18, $19, $20)
            "#,
        )
        .bind(&run.run_id)
        .bind(&run.definition_id)
        .bind(&run.alias)
        .bind(&run.cluster_name)
        .bind(&run.group_name)
        .bind(&run.engine)
        .bind(run.status.as_str())
        .bind(run.queued_at)
        .bind(run.started_at)
        .bind(run.finished_at)
        .bind(run.exit_code)
        .bind(&run.exit_reason)
        .bind(&run.backend_handle)
        .bind(&run.instance_id)
        .bind(&run.instance_dns_name)
        .bind(Json(&run.env))
        .bind(&run.command)
        .bind(run.cpu)
        .bind(run.memory)
        .bind(run.gpu)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<Run>> {
        let row: Option<RunRow> =
            sqlx::query_as(&format!("SELECT {RUN_COLUMNS} FROM runs WHERE run_id = $1"))
                .bind(run_id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(Run::try_from).transpose()
    }

    async fn get_run_by_handle(&self, backend_handle: &str) -> Result<Option<Run>> {
        let row: Option<RunRow> = sqlx::query_as(&format!(
            "SELECT {RUN_COLUMNS} FROM runs WHERE backend_handle = $1"
        ))
        .bind(backend_handle)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Run::try_from).transpose()
    }

    async fn update_run(&self, run_id: &str, patch: &RunPatch) -> Result<Run> {
        let row: Option<RunRow> = sqlx::query_as(&format!(
            r#"
            UPDATE runs SET
                status = COALESCE($2::TEXT, status),
                started_at = COALESCE(started_at, $3),
                finished_at = COALESCE(finished_at, $4),
                exit_code = COALESCE($5, exit_code),
                exit_reason = COALESCE($6, exit_reason),
                backend_handle = COALESCE($7, backend_handle),
                instance_id = COALESCE($8, instance_id),
                instance_dns_name = COALESCE($9, instance_dns_name)
            WHERE run_id = $1
            RETURNING {RUN_COLUMNS}
            "#
        ))
        .bind(run_id)
        .bind(patch.status.map(RunStatus::as_str))
        .bind(patch.started_at)
        .bind(patch.finished_at)
        .bind(patch.exit_code)
        .bind(&patch.exit_reason)
        .bind(&patch.backend_handle)
        .bind(&patch.instance_id)
        .bind(&patch.instance_dns_name)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Run::try_from)
            .transpose()?
            .ok_or_else(|| CoreError::RunNotFound(run_id.to_string()))
    }

    async fn list_runs(&self, options: &ListRunsOptions) -> Result<(Vec<Run>, i64)> {
        let statuses: Option<Vec<String>> = if options.statuses.is_empty() {
            None
        } else {
            Some(
                options
                    .statuses
                    .iter()
                    .map(|s| s.as_str().to_string())
                    .collect(),
            )
        };
        let engines: Option<Vec<String>> = if options.engines.is_empty() {
            None
        } else {
            Some(options.engines.clone())
        };
        let env_filter: Option<Json<&Vec<EnvVar>>> = if options.env_filters.is_empty() {
            None
        } else {
            Some(Json(&options.env_filters))
        };

        let filter = r#"
            WHERE ($1::TEXT[] IS NULL OR status = ANY($1))
              AND ($2::TEXT IS NULL OR cluster_name = $2)
              AND ($3::TEXT IS NULL OR group_name = $3)
              AND ($4::TEXT IS NULL OR alias = $4)
              AND ($5::TEXT[] IS NULL OR engine = ANY($5))
              AND ($6::JSONB IS NULL OR env @> $6)
        "#;

        let query = format!(
            "SELECT {RUN_COLUMNS} FROM runs {filter} {} LIMIT $7 OFFSET $8",
            Self::order_clause(options)
        );
        let rows: Vec<RunRow> = sqlx::query_as(&query)
            .bind(&statuses)
            .bind(&options.cluster_name)
            .bind(&options.group_name)
            .bind(&options.alias)
            .bind(&engines)
            .bind(&env_filter)
            .bind(options.limit)
            .bind(options.offset)
            .fetch_all(&self.pool)
            .await?;

        let count_query = format!("SELECT COUNT(*) FROM runs {filter}");
        let (total,): (i64,) = sqlx::query_as(&count_query)
            .bind(&statuses)
            .bind(&options.cluster_name)
            .bind(&options.group_name)
            .bind(&options.alias)
            .bind(&engines)
            .bind(&env_filter)
            .fetch_one(&self.pool)
            .await?;

        let items = rows
            .into_iter()
            .map(Run::try_from)
            .collect::<Result<Vec<_>>>()?;
        Ok((items, total))
    }

    async fn list_needs_retry(&self, limit: i64) -> Result<Vec<Run>> {
        let rows: Vec<RunRow> = sqlx::query_as(&format!(
            r#"
            SELECT {RUN_COLUMNS} FROM runs
            WHERE status = 'NEEDS_RETRY'
            ORDER BY queued_at ASC NULLS FIRST
            LIMIT $1
            "#
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Run::try_from).collect()
    }

    async fn create_definition(&self, definition: &Definition) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO definitions (definition_id, image, alias, group_name, command, env,
                                     memory, cpu, gpu, ports, tags, template_handle)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(&definition.definition_id)
        .bind(&definition.image)
        .bind(&definition.alias)
        .bind(&definition.group_name)
        .bind(&definition.command)
        .bind(Json(&definition.env))
        .bind(definition.memory)
        .bind(definition.cpu)
        .bind(definition.gpu)
        .bind(Json(&definition.ports))
        .bind(Json(&definition.tags))
        .bind(&definition.template_handle)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_definition(&self, definition_id: &str) -> Result<Option<Definition>> {
        let row: Option<DefinitionRow> = sqlx::query_as(
            r#"
            SELECT definition_id, image, alias, group_name, command, env, memory, cpu, gpu,
                   ports, tags, template_handle
            FROM definitions
            WHERE definition_id = $1
            "#,
        )
        .bind(definition_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Definition::from))
    }

    async fn get_definition_by_alias(&self, alias: &str) -> Result<Option<Definition>> {
        let row: Option<DefinitionRow> = sqlx::query_as(
            r#"
            SELECT definition_id, image, alias, group_name, command, env, memory, cpu, gpu,
                   ports, tags, template_handle
            FROM definitions
            WHERE alias = $1
            "#,
        )
        .bind(alias)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Definition::from))
    }
}
