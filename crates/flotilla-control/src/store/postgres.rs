//! PostgreSQL resource store implementation.
//!
//! Every resource is kept as a JSONB document in a single table keyed by
//! `(kind, id)`, with the deployment and blueprint ids lifted into columns for
//! filtering.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;

use crate::error::{ControlError, ControlResult};
use crate::state::ExecutionStatus;
use crate::types::{
    Blueprint, BlueprintId, Deployment, DeploymentId, Execution, ExecutionId, Node, NodeInstance,
};

use super::{ListFilter, ResourceStore};

const BLUEPRINT: &str = "blueprint";
const DEPLOYMENT: &str = "deployment";
const NODE: &str = "node";
const NODE_INSTANCE: &str = "node_instance";
const EXECUTION: &str = "execution";

/// Columns lifted out of a document.
struct DocumentKeys<'a> {
    kind: &'static str,
    id: String,
    deployment_id: Option<&'a str>,
    blueprint_id: Option<&'a str>,
    created_at: DateTime<Utc>,
}

/// PostgreSQL-backed resource store.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect to PostgreSQL and create a new store.
    ///
    /// The required table is created if it doesn't exist.
    pub async fn new(url: &str, max_connections: u32) -> ControlResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;

        Self::from_pool(pool).await
    }

    /// Create a store from an existing connection pool.
    pub async fn from_pool(pool: PgPool) -> ControlResult<Self> {
        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    /// Ensure the required table exists.
    async fn ensure_schema(&self) -> ControlResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS resources (
                kind TEXT NOT NULL,
                id TEXT NOT NULL,
                deployment_id TEXT,
                blueprint_id TEXT,
                body JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (kind, id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_resources_kind_deployment
            ON resources (kind, deployment_id)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_resources_kind_blueprint
            ON resources (kind, blueprint_id)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn put_document<T: Serialize>(&self, keys: DocumentKeys<'_>, doc: &T) -> ControlResult<()> {
        let body = serde_json::to_value(doc).map_err(|e| {
            ControlError::Serialisation(format!("failed to serialise {}: {e}", keys.kind))
        })?;

        sqlx::query(
            r#"
            INSERT INTO resources (kind, id, deployment_id, blueprint_id, body, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (kind, id) DO UPDATE
            SET deployment_id = EXCLUDED.deployment_id,
                blueprint_id = EXCLUDED.blueprint_id,
                body = EXCLUDED.body
            "#,
        )
        .bind(keys.kind)
        .bind(&keys.id)
        .bind(keys.deployment_id)
        .bind(keys.blueprint_id)
        .bind(&body)
        .bind(keys.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_document<T: DeserializeOwned>(
        &self,
        kind: &'static str,
        id: &str,
    ) -> ControlResult<Option<T>> {
        let row = sqlx::query("SELECT body FROM resources WHERE kind = $1 AND id = $2")
            .bind(kind)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| Self::decode(kind, &r)).transpose()
    }

    async fn list_documents<T: DeserializeOwned>(
        &self,
        kind: &'static str,
        filter: &ListFilter,
    ) -> ControlResult<Vec<T>> {
        let rows = sqlx::query(
            r#"
            SELECT body FROM resources
            WHERE kind = $1
              AND ($2::TEXT IS NULL OR deployment_id = $2)
              AND ($3::TEXT IS NULL OR blueprint_id = $3)
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(kind)
        .bind(filter.deployment_id.as_ref().map(DeploymentId::as_str))
        .bind(filter.blueprint_id.as_ref().map(BlueprintId::as_str))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(|r| Self::decode(kind, r)).collect()
    }

    async fn delete_document(&self, kind: &'static str, id: &str) -> ControlResult<()> {
        let result = sqlx::query("DELETE FROM resources WHERE kind = $1 AND id = $2")
            .bind(kind)
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(ControlError::not_found(label(kind), id));
        }

        Ok(())
    }

    /// Parse a row body into a document.
    fn decode<T: DeserializeOwned>(kind: &str, row: &sqlx::postgres::PgRow) -> ControlResult<T> {
        let body: serde_json::Value = row.get("body");
        serde_json::from_value(body)
            .map_err(|e| ControlError::Serialisation(format!("failed to deserialise {kind}: {e}")))
    }
}

fn label(kind: &'static str) -> &'static str {
    match kind {
        NODE_INSTANCE => "node instance",
        other => other,
    }
}

fn node_key(deployment_id: &DeploymentId, id: &str) -> String {
    format!("{deployment_id}/{id}")
}

#[async_trait]
impl ResourceStore for PostgresStore {
    async fn put_blueprint(&self, blueprint: &Blueprint) -> ControlResult<()> {
        let keys = DocumentKeys {
            kind: BLUEPRINT,
            id: blueprint.id.to_string(),
            deployment_id: None,
            blueprint_id: Some(blueprint.id.as_str()),
            created_at: blueprint.created_at,
        };
        self.put_document(keys, blueprint).await
    }

    async fn get_blueprint(&self, id: &BlueprintId) -> ControlResult<Option<Blueprint>> {
        self.get_document(BLUEPRINT, id.as_str()).await
    }

    async fn list_blueprints(&self, filter: &ListFilter) -> ControlResult<Vec<Blueprint>> {
        self.list_documents(BLUEPRINT, filter).await
    }

    async fn delete_blueprint(&self, id: &BlueprintId) -> ControlResult<()> {
        self.delete_document(BLUEPRINT, id.as_str()).await
    }

    async fn put_deployment(&self, deployment: &Deployment) -> ControlResult<()> {
        let keys = DocumentKeys {
            kind: DEPLOYMENT,
            id: deployment.id.to_string(),
            deployment_id: Some(deployment.id.as_str()),
            blueprint_id: Some(deployment.blueprint_id.as_str()),
            created_at: deployment.created_at,
        };
        self.put_document(keys, deployment).await
    }

    async fn get_deployment(&self, id: &DeploymentId) -> ControlResult<Option<Deployment>> {
        self.get_document(DEPLOYMENT, id.as_str()).await
    }

    async fn list_deployments(&self, filter: &ListFilter) -> ControlResult<Vec<Deployment>> {
        self.list_documents(DEPLOYMENT, filter).await
    }

    async fn delete_deployment(&self, id: &DeploymentId) -> ControlResult<()> {
        self.delete_document(DEPLOYMENT, id.as_str()).await
    }

    async fn put_node(&self, node: &Node) -> ControlResult<()> {
        let keys = DocumentKeys {
            kind: NODE,
            id: node_key(&node.deployment_id, &node.id),
            deployment_id: Some(node.deployment_id.as_str()),
            blueprint_id: Some(node.blueprint_id.as_str()),
            created_at: Utc::now(),
        };
        self.put_document(keys, node).await
    }

    async fn get_node(&self, deployment_id: &DeploymentId, id: &str) -> ControlResult<Option<Node>> {
        self.get_document(NODE, &node_key(deployment_id, id)).await
    }

    async fn list_nodes(&self, filter: &ListFilter) -> ControlResult<Vec<Node>> {
        self.list_documents(NODE, filter).await
    }

    async fn delete_node(&self, deployment_id: &DeploymentId, id: &str) -> ControlResult<()> {
        self.delete_document(NODE, &node_key(deployment_id, id)).await
    }

    async fn put_node_instance(&self, instance: &NodeInstance) -> ControlResult<()> {
        let keys = DocumentKeys {
            kind: NODE_INSTANCE,
            id: instance.id.clone(),
            deployment_id: Some(instance.deployment_id.as_str()),
            blueprint_id: None,
            created_at: Utc::now(),
        };
        self.put_document(keys, instance).await
    }

    async fn get_node_instance(&self, id: &str) -> ControlResult<Option<NodeInstance>> {
        self.get_document(NODE_INSTANCE, id).await
    }

    async fn list_node_instances(&self, filter: &ListFilter) -> ControlResult<Vec<NodeInstance>> {
        self.list_documents(NODE_INSTANCE, filter).await
    }

    async fn delete_node_instance(&self, id: &str) -> ControlResult<()> {
        self.delete_document(NODE_INSTANCE, id).await
    }

    async fn put_execution(&self, execution: &Execution) -> ControlResult<()> {
        let keys = DocumentKeys {
            kind: EXECUTION,
            id: execution.id.to_string(),
            deployment_id: Some(execution.deployment_id.as_str()),
            blueprint_id: Some(execution.blueprint_id.as_str()),
            created_at: execution.created_at,
        };
        self.put_document(keys, execution).await
    }

    async fn get_execution(&self, id: &ExecutionId) -> ControlResult<Option<Execution>> {
        self.get_document(EXECUTION, id.as_str()).await
    }

    async fn list_executions(&self, filter: &ListFilter) -> ControlResult<Vec<Execution>> {
        self.list_documents(EXECUTION, filter).await
    }

    async fn delete_execution(&self, id: &ExecutionId) -> ControlResult<()> {
        self.delete_document(EXECUTION, id.as_str()).await
    }

    async fn update_execution_status(
        &self,
        id: &ExecutionId,
        status: ExecutionStatus,
        error: &str,
    ) -> ControlResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE resources
            SET body = jsonb_set(
                jsonb_set(body, '{status}', to_jsonb($3::TEXT)),
                '{error}', to_jsonb($4::TEXT)
            )
            WHERE kind = $1 AND id = $2
            "#,
        )
        .bind(EXECUTION)
        .bind(id.as_str())
        .bind(status.as_str())
        .bind(error)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(ControlError::not_found("execution", id.as_str()));
        }

        Ok(())
    }
}

impl std::fmt::Debug for PostgresStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresStore").finish_non_exhaustive()
    }
}
