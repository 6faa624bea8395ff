use async_trait::async_trait;
use sqlx::{Row, sqlite::SqlitePoolOptions, SqlitePool};

use crate::error::{CoreError, CoreResult};
use crate::model::{
    AlertSession, Interaction, InteractionDetail, SessionId, SessionStatus, StageExecution,
    StageExecutionId, StageStatus,
};

use super::{
    HistoryStore, Pagination, SessionDetail, SessionFilter, SessionListPage, SessionTokenSummary,
    SortField, SortOrder, aggregate_tokens,
};

/// SQLite-backed implementation of [`HistoryStore`].
///
/// Schema mirrors spec §6.5: `sessions`, `stage_executions`, `interactions`
/// with FK `ON DELETE CASCADE` from session down to its descendants, so a
/// retention sweep's `DELETE FROM sessions ...` is enough to clean up the
/// rest.
pub struct SqliteHistoryStore {
    pool: SqlitePool,
}

impl SqliteHistoryStore {
    pub async fn new(database_url: &str) -> CoreResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(|e| CoreError::Storage(format!("failed to connect to sqlite: {e}")))?;
        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    async fn migrate(pool: &SqlitePool) -> CoreResult<()> {
        sqlx::query("PRAGMA foreign_keys = ON;").execute(pool).await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS sessions (
                session_id TEXT PRIMARY KEY NOT NULL,
                chain_id TEXT NOT NULL,
                alert_type TEXT NOT NULL,
                agent_type TEXT NOT NULL,
                status TEXT NOT NULL,
                author TEXT NOT NULL,
                started_at_us INTEGER NOT NULL,
                completed_at_us INTEGER,
                final_analysis TEXT,
                final_analysis_summary TEXT,
                error_message TEXT,
                alert_data_json TEXT NOT NULL,
                slack_message_fingerprint TEXT
            );",
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS stage_executions (
                execution_id TEXT PRIMARY KEY NOT NULL,
                session_id TEXT NOT NULL REFERENCES sessions(session_id) ON DELETE CASCADE,
                stage_id TEXT NOT NULL,
                stage_index INTEGER NOT NULL,
                stage_name TEXT NOT NULL,
                agent TEXT NOT NULL,
                iteration_strategy TEXT,
                status TEXT NOT NULL,
                started_at_us INTEGER,
                paused_at_us INTEGER,
                completed_at_us INTEGER,
                duration_ms INTEGER,
                stage_output_json TEXT,
                error_message TEXT,
                parent_execution_id TEXT
            );",
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS interactions (
                interaction_id TEXT PRIMARY KEY NOT NULL,
                session_id TEXT NOT NULL REFERENCES sessions(session_id) ON DELETE CASCADE,
                stage_execution_id TEXT,
                started_at_us INTEGER NOT NULL,
                completed_at_us INTEGER NOT NULL,
                duration_ms INTEGER NOT NULL,
                success INTEGER NOT NULL,
                error_message TEXT,
                detail_json TEXT NOT NULL
            );",
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_stage_executions_session ON stage_executions(session_id);",
        )
        .execute(pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_interactions_session ON interactions(session_id);",
        )
        .execute(pool)
        .await?;

        Ok(())
    }

    fn status_to_str(status: SessionStatus) -> &'static str {
        match status {
            SessionStatus::Pending => "PENDING",
            SessionStatus::InProgress => "IN_PROGRESS",
            SessionStatus::Completed => "COMPLETED",
            SessionStatus::Failed => "FAILED",
            SessionStatus::Canceling => "CANCELING",
            SessionStatus::Cancelled => "CANCELLED",
            SessionStatus::Paused => "PAUSED",
        }
    }

    fn status_from_str(s: &str) -> CoreResult<SessionStatus> {
        Ok(match s {
            "PENDING" => SessionStatus::Pending,
            "IN_PROGRESS" => SessionStatus::InProgress,
            "COMPLETED" => SessionStatus::Completed,
            "FAILED" => SessionStatus::Failed,
            "CANCELING" => SessionStatus::Canceling,
            "CANCELLED" => SessionStatus::Cancelled,
            "PAUSED" => SessionStatus::Paused,
            other => return Err(CoreError::Storage(format!("unknown session status: {other}"))),
        })
    }

    fn stage_status_to_str(status: StageStatus) -> &'static str {
        match status {
            StageStatus::Pending => "PENDING",
            StageStatus::Active => "ACTIVE",
            StageStatus::Completed => "COMPLETED",
            StageStatus::Failed => "FAILED",
            StageStatus::Paused => "PAUSED",
            StageStatus::Cancelled => "CANCELLED",
        }
    }

    fn stage_status_from_str(s: &str) -> CoreResult<StageStatus> {
        Ok(match s {
            "PENDING" => StageStatus::Pending,
            "ACTIVE" => StageStatus::Active,
            "COMPLETED" => StageStatus::Completed,
            "FAILED" => StageStatus::Failed,
            "PAUSED" => StageStatus::Paused,
            "CANCELLED" => StageStatus::Cancelled,
            other => return Err(CoreError::Storage(format!("unknown stage status: {other}"))),
        })
    }

    fn row_to_session(row: &sqlx::sqlite::SqliteRow) -> CoreResult<AlertSession> {
        let alert_data_json: String = row.try_get("alert_data_json")?;
        let status_str: String = row.try_get("status")?;
        Ok(AlertSession {
            session_id: row.try_get("session_id")?,
            chain_id: row.try_get("chain_id")?,
            alert_type: row.try_get("alert_type")?,
            agent_type: row.try_get("agent_type")?,
            status: Self::status_from_str(&status_str)?,
            author: row.try_get("author")?,
            started_at_us: row.try_get("started_at_us")?,
            completed_at_us: row.try_get("completed_at_us")?,
            final_analysis: row.try_get("final_analysis")?,
            final_analysis_summary: row.try_get("final_analysis_summary")?,
            error_message: row.try_get("error_message")?,
            alert_data: serde_json::from_str(&alert_data_json)
                .map_err(|e| CoreError::Storage(e.to_string()))?,
            slack_message_fingerprint: row.try_get("slack_message_fingerprint")?,
        })
    }

    fn row_to_stage(row: &sqlx::sqlite::SqliteRow) -> CoreResult<StageExecution> {
        let status_str: String = row.try_get("status")?;
        let iteration_strategy: Option<String> = row.try_get("iteration_strategy")?;
        let stage_output_json: Option<String> = row.try_get("stage_output_json")?;
        Ok(StageExecution {
            execution_id: row.try_get("execution_id")?,
            session_id: row.try_get("session_id")?,
            stage_id: row.try_get("stage_id")?,
            stage_index: row.try_get::<i64, _>("stage_index")? as u32,
            stage_name: row.try_get("stage_name")?,
            agent: row.try_get("agent")?,
            iteration_strategy: iteration_strategy
                .map(|s| serde_json::from_str(&format!("\"{s}\"")))
                .transpose()
                .map_err(|e: serde_json::Error| CoreError::Storage(e.to_string()))?,
            status: Self::stage_status_from_str(&status_str)?,
            started_at_us: row.try_get("started_at_us")?,
            paused_at_us: row.try_get("paused_at_us")?,
            completed_at_us: row.try_get("completed_at_us")?,
            duration_ms: row.try_get("duration_ms")?,
            stage_output: stage_output_json
                .map(|s| serde_json::from_str(&s))
                .transpose()
                .map_err(|e: serde_json::Error| CoreError::Storage(e.to_string()))?,
            error_message: row.try_get("error_message")?,
            parent_execution_id: row.try_get("parent_execution_id")?,
        })
    }

    fn row_to_interaction(row: &sqlx::sqlite::SqliteRow) -> CoreResult<Interaction> {
        let detail_json: String = row.try_get("detail_json")?;
        let success: i64 = row.try_get("success")?;
        Ok(Interaction {
            interaction_id: row.try_get("interaction_id")?,
            session_id: row.try_get("session_id")?,
            stage_execution_id: row.try_get("stage_execution_id")?,
            started_at_us: row.try_get("started_at_us")?,
            completed_at_us: row.try_get("completed_at_us")?,
            duration_ms: row.try_get("duration_ms")?,
            success: success != 0,
            error_message: row.try_get("error_message")?,
            detail: serde_json::from_str::<InteractionDetail>(&detail_json)
                .map_err(|e| CoreError::Storage(e.to_string()))?,
        })
    }
}

#[async_trait]
impl HistoryStore for SqliteHistoryStore {
    async fn create_session(&self, session: &AlertSession) -> CoreResult<()> {
        let alert_data_json = serde_json::to_string(&session.alert_data)
            .map_err(|e| CoreError::Storage(e.to_string()))?;
        sqlx::query(
            "INSERT INTO sessions
             (session_id, chain_id, alert_type, agent_type, status, author, started_at_us,
              completed_at_us, final_analysis, final_analysis_summary, error_message,
              alert_data_json, slack_message_fingerprint)
             VALUES (?,?,?,?,?,?,?,?,?,?,?,?,?)",
        )
        .bind(&session.session_id)
        .bind(&session.chain_id)
        .bind(&session.alert_type)
        .bind(&session.agent_type)
        .bind(Self::status_to_str(session.status))
        .bind(&session.author)
        .bind(session.started_at_us)
        .bind(session.completed_at_us)
        .bind(&session.final_analysis)
        .bind(&session.final_analysis_summary)
        .bind(&session.error_message)
        .bind(alert_data_json)
        .bind(&session.slack_message_fingerprint)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_session(&self, session: &AlertSession) -> CoreResult<()> {
        let result = sqlx::query(
            "UPDATE sessions SET status=?, completed_at_us=?, final_analysis=?,
             final_analysis_summary=?, error_message=? WHERE session_id=?",
        )
        .bind(Self::status_to_str(session.status))
        .bind(session.completed_at_us)
        .bind(&session.final_analysis)
        .bind(&session.final_analysis_summary)
        .bind(&session.error_message)
        .bind(&session.session_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("session {}", session.session_id)));
        }
        Ok(())
    }

    async fn get_session(&self, session_id: &SessionId) -> CoreResult<Option<AlertSession>> {
        let row = sqlx::query("SELECT * FROM sessions WHERE session_id = ?")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_session).transpose()
    }

    async fn create_stage(&self, stage: &StageExecution) -> CoreResult<()> {
        let stage_output_json = stage
            .stage_output
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| CoreError::Storage(e.to_string()))?;
        let strategy_str = stage
            .iteration_strategy
            .map(|s| serde_json::to_string(&s))
            .transpose()
            .map_err(|e| CoreError::Storage(e.to_string()))?
            .map(|s| s.trim_matches('"').to_string());
        sqlx::query(
            "INSERT INTO stage_executions
             (execution_id, session_id, stage_id, stage_index, stage_name, agent,
              iteration_strategy, status, started_at_us, paused_at_us, completed_at_us,
              duration_ms, stage_output_json, error_message, parent_execution_id)
             VALUES (?,?,?,?,?,?,?,?,?,?,?,?,?,?,?)",
        )
        .bind(&stage.execution_id)
        .bind(&stage.session_id)
        .bind(&stage.stage_id)
        .bind(stage.stage_index as i64)
        .bind(&stage.stage_name)
        .bind(&stage.agent)
        .bind(strategy_str)
        .bind(Self::stage_status_to_str(stage.status))
        .bind(stage.started_at_us)
        .bind(stage.paused_at_us)
        .bind(stage.completed_at_us)
        .bind(stage.duration_ms)
        .bind(stage_output_json)
        .bind(&stage.error_message)
        .bind(&stage.parent_execution_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_stage(&self, stage: &StageExecution) -> CoreResult<()> {
        let stage_output_json = stage
            .stage_output
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| CoreError::Storage(e.to_string()))?;
        let result = sqlx::query(
            "UPDATE stage_executions SET status=?, started_at_us=?, paused_at_us=?,
             completed_at_us=?, duration_ms=?, stage_output_json=?, error_message=?
             WHERE execution_id=?",
        )
        .bind(Self::stage_status_to_str(stage.status))
        .bind(stage.started_at_us)
        .bind(stage.paused_at_us)
        .bind(stage.completed_at_us)
        .bind(stage.duration_ms)
        .bind(stage_output_json)
        .bind(&stage.error_message)
        .bind(&stage.execution_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("stage {}", stage.execution_id)));
        }
        Ok(())
    }

    async fn get_stages(&self, session_id: &SessionId) -> CoreResult<Vec<StageExecution>> {
        let rows = sqlx::query(
            "SELECT * FROM stage_executions WHERE session_id = ? ORDER BY stage_index ASC",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_stage).collect()
    }

    async fn record_interaction(&self, interaction: &Interaction) -> CoreResult<()> {
        let detail_json =
            serde_json::to_string(&interaction.detail).map_err(|e| CoreError::Storage(e.to_string()))?;
        sqlx::query(
            "INSERT INTO interactions
             (interaction_id, session_id, stage_execution_id, started_at_us, completed_at_us,
              duration_ms, success, error_message, detail_json)
             VALUES (?,?,?,?,?,?,?,?,?)",
        )
        .bind(&interaction.interaction_id)
        .bind(&interaction.session_id)
        .bind(&interaction.stage_execution_id)
        .bind(interaction.started_at_us)
        .bind(interaction.completed_at_us)
        .bind(interaction.duration_ms)
        .bind(interaction.success as i64)
        .bind(&interaction.error_message)
        .bind(detail_json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_sessions(
        &self,
        filter: &SessionFilter,
        sort_field: SortField,
        sort_order: SortOrder,
        pagination: &Pagination,
    ) -> CoreResult<SessionListPage> {
        pagination.validate().map_err(CoreError::Validation)?;

        let mut clauses: Vec<String> = Vec::new();
        if filter.status.is_some() {
            clauses.push("status = ?".into());
        }
        if filter.agent_type.is_some() {
            clauses.push("agent_type = ?".into());
        }
        if filter.alert_type.is_some() {
            clauses.push("alert_type = ?".into());
        }
        if filter.author.is_some() {
            clauses.push("author = ?".into());
        }
        if filter.free_text.is_some() {
            clauses.push("(alert_type LIKE ? OR final_analysis LIKE ?)".into());
        }
        if filter.started_after_us.is_some() {
            clauses.push("started_at_us >= ?".into());
        }
        if filter.started_before_us.is_some() {
            clauses.push("started_at_us <= ?".into());
        }
        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };

        let sort_col = match sort_field {
            SortField::Status => "status",
            SortField::AlertType => "alert_type",
            SortField::AgentType => "agent_type",
            SortField::Author => "author",
            SortField::StartedAt => "started_at_us",
            SortField::DurationMs => "(completed_at_us - started_at_us)",
        };
        let order = match sort_order {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        };

        let mut bind_count_query = sqlx::query(&format!("SELECT COUNT(*) as c FROM sessions {where_clause}"));
        bind_count_query = Self::bind_filter(bind_count_query, filter);
        let total_count: i64 = bind_count_query.fetch_one(&self.pool).await?.try_get("c")?;

        let sql = format!(
            "SELECT * FROM sessions {where_clause} ORDER BY {sort_col} {order} LIMIT ? OFFSET ?"
        );
        let mut q = sqlx::query(&sql);
        q = Self::bind_filter(q, filter);
        q = q.bind(pagination.page_size as i64).bind(pagination.offset() as i64);
        let rows = q.fetch_all(&self.pool).await?;
        let sessions = rows.iter().map(Self::row_to_session).collect::<CoreResult<Vec<_>>>()?;

        Ok(SessionListPage {
            sessions,
            total_count: total_count as u64,
        })
    }

    async fn session_detail(&self, session_id: &SessionId) -> CoreResult<Option<SessionDetail>> {
        let Some(session) = self.get_session(session_id).await? else {
            return Ok(None);
        };
        let stages = self.get_stages(session_id).await?;
        let rows = sqlx::query(
            "SELECT * FROM interactions WHERE session_id = ? ORDER BY started_at_us ASC",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;
        let timeline = rows.iter().map(Self::row_to_interaction).collect::<CoreResult<Vec<_>>>()?;

        let mut per_stage = Vec::new();
        for stage in &stages {
            let usages = timeline
                .iter()
                .filter(|i| i.stage_execution_id.as_deref() == Some(stage.execution_id.as_str()))
                .filter_map(|i| match &i.detail {
                    InteractionDetail::Llm { token_usage: Some(u), .. } => Some(u.clone()),
                    _ => None,
                });
            per_stage.push((stage.stage_name.clone(), aggregate_tokens(usages)));
        }
        let session_total = aggregate_tokens(
            per_stage
                .iter()
                .filter_map(|(_, agg)| agg.as_ref())
                .map(|a| crate::model::TokenUsage {
                    input_tokens: a.input_tokens,
                    output_tokens: a.output_tokens,
                    total_tokens: a.total_tokens,
                }),
        );

        Ok(Some(SessionDetail {
            session,
            stages,
            timeline,
            token_summary: SessionTokenSummary { per_stage, session_total },
        }))
    }

    async fn delete_sessions_older_than(&self, cutoff_us: i64) -> CoreResult<u64> {
        let result = sqlx::query("DELETE FROM sessions WHERE started_at_us < ?")
            .bind(cutoff_us)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn mark_orphaned_sessions(&self, cutoff_us: i64) -> CoreResult<Vec<SessionId>> {
        let rows = sqlx::query(
            "SELECT session_id FROM sessions
             WHERE status IN ('PENDING','IN_PROGRESS','CANCELING','PAUSED')
             AND started_at_us < ?",
        )
        .bind(cutoff_us)
        .fetch_all(&self.pool)
        .await?;
        let ids: Vec<SessionId> = rows
            .iter()
            .map(|r| r.try_get::<String, _>("session_id"))
            .collect::<Result<_, _>>()?;

        for id in &ids {
            sqlx::query(
                "UPDATE sessions SET status = 'FAILED', error_message = ?, completed_at_us = ?
                 WHERE session_id = ?",
            )
            .bind(crate::state_machine::ORPHANED_ERROR_MESSAGE)
            .bind(cutoff_us)
            .bind(id)
            .execute(&self.pool)
            .await?;
        }
        Ok(ids)
    }
}

impl SqliteHistoryStore {
    fn bind_filter<'q>(
        mut q: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
        filter: &'q SessionFilter,
    ) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
        if let Some(status) = filter.status {
            q = q.bind(Self::status_to_str(status));
        }
        if let Some(agent_type) = &filter.agent_type {
            q = q.bind(agent_type);
        }
        if let Some(alert_type) = &filter.alert_type {
            q = q.bind(alert_type);
        }
        if let Some(author) = &filter.author {
            q = q.bind(author);
        }
        if let Some(text) = &filter.free_text {
            let pattern = format!("%{text}%");
            q = q.bind(pattern.clone()).bind(pattern);
        }
        if let Some(after) = filter.started_after_us {
            q = q.bind(after);
        }
        if let Some(before) = filter.started_before_us {
            q = q.bind(before);
        }
        q
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AlertSession, SessionStatus};

    async fn store() -> SqliteHistoryStore {
        SqliteHistoryStore::new("sqlite::memory:").await.unwrap()
    }

    fn session(id: &str, started_at_us: i64, status: SessionStatus) -> AlertSession {
        AlertSession {
            session_id: id.into(),
            chain_id: "chain-1".into(),
            alert_type: "NamespaceTerminating".into(),
            agent_type: "KubernetesAgent".into(),
            status,
            author: "api-client".into(),
            started_at_us,
            completed_at_us: None,
            final_analysis: None,
            final_analysis_summary: None,
            error_message: None,
            alert_data: serde_json::json!({"namespace": "stuck-ns"}).as_object().unwrap().clone(),
            slack_message_fingerprint: None,
        }
    }

    #[tokio::test]
    async fn create_and_get_roundtrip() {
        let store = store().await;
        let s = session("s1", 1_000, SessionStatus::Pending);
        store.create_session(&s).await.unwrap();
        let loaded = store.get_session(&"s1".to_string()).await.unwrap().unwrap();
        assert_eq!(loaded.session_id, "s1");
        assert_eq!(loaded.status, SessionStatus::Pending);
    }

    #[tokio::test]
    async fn list_sessions_default_sort_is_started_at_desc() {
        let store = store().await;
        store.create_session(&session("s1", 1_000, SessionStatus::Completed)).await.unwrap();
        store.create_session(&session("s2", 2_000, SessionStatus::Completed)).await.unwrap();
        let page = store
            .list_sessions(
                &SessionFilter::default(),
                SortField::default(),
                SortOrder::default(),
                &Pagination { page: 1, page_size: 10 },
            )
            .await
            .unwrap();
        assert_eq!(page.sessions[0].session_id, "s2");
        assert_eq!(page.total_count, 2);
    }

    #[tokio::test]
    async fn deleting_session_cascades_to_interactions() {
        let store = store().await;
        store.create_session(&session("s1", 1_000, SessionStatus::Completed)).await.unwrap();
        store
            .record_interaction(&Interaction {
                interaction_id: "i1".into(),
                session_id: "s1".into(),
                stage_execution_id: None,
                started_at_us: 0,
                completed_at_us: 1,
                duration_ms: 1,
                success: true,
                error_message: None,
                detail: InteractionDetail::Llm {
                    provider: "p".into(),
                    model: "m".into(),
                    token_usage: None,
                },
            })
            .await
            .unwrap();
        let deleted = store.delete_sessions_older_than(5_000).await.unwrap();
        assert_eq!(deleted, 1);
        let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM interactions")
            .fetch_one(&store.pool)
            .await
            .unwrap();
        assert_eq!(rows, 0);
    }

    #[tokio::test]
    async fn mark_orphaned_sessions_sets_failed_with_message() {
        let store = store().await;
        store.create_session(&session("s1", 0, SessionStatus::InProgress)).await.unwrap();
        let ids = store.mark_orphaned_sessions(1).await.unwrap();
        assert_eq!(ids, vec!["s1".to_string()]);
        let loaded = store.get_session(&"s1".to_string()).await.unwrap().unwrap();
        assert_eq!(loaded.status, SessionStatus::Failed);
        assert!(loaded.error_message.unwrap().contains("orphaned"));
    }
}
