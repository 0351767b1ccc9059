//! Relational metadata consumed by the pipeline: prompt templates and
//! per-document records. Schema management beyond these two tables lives
//! elsewhere.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, PgPool};
use uuid::Uuid;

use crate::error::{RagError, RagResult};
use crate::models::{DocumentRecord, PromptTemplate};

#[async_trait]
pub trait Catalog: Send + Sync {
    async fn init_schema(&self) -> RagResult<()>;

    /// Unknown ids are `NotFound`.
    async fn get_template(&self, id: Uuid) -> RagResult<PromptTemplate>;

    async fn touch_template(&self, id: Uuid, at: DateTime<Utc>) -> RagResult<()>;

    async fn get_document(&self, workspace_id: &str, file_path: &str)
        -> RagResult<Option<DocumentRecord>>;

    /// Insert or update by `file_path`. A `None` chunk count or index time
    /// keeps the stored value.
    async fn upsert_document(&self, record: &DocumentRecord) -> RagResult<()>;
}

pub struct PgCatalog {
    pool: PgPool,
}

impl PgCatalog {
    pub async fn new(database_url: &str, max_connections: u32) -> RagResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        Ok(Self { pool })
    }
}

#[async_trait]
impl Catalog for PgCatalog {
    async fn init_schema(&self) -> RagResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ai_templates (
                id UUID PRIMARY KEY,
                workspace_id TEXT NOT NULL,
                name TEXT NOT NULL,
                llm_model TEXT,
                main_instructions TEXT,
                business_description TEXT,
                customer_profile TEXT,
                rules_and_filters TEXT,
                example_outputs TEXT,
                guidance_override TEXT,
                prompt TEXT,
                last_used_at TIMESTAMPTZ
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS files (
                file_path TEXT PRIMARY KEY,
                workspace_id TEXT NOT NULL,
                filename TEXT NOT NULL,
                file_size BIGINT NOT NULL,
                content_type TEXT,
                chunk_count INTEGER,
                indexed_at TIMESTAMPTZ,
                created_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_files_workspace ON files(workspace_id)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn get_template(&self, id: Uuid) -> RagResult<PromptTemplate> {
        sqlx::query_as::<_, PromptTemplate>("SELECT * FROM ai_templates WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| RagError::NotFound(format!("template {}", id)))
    }

    async fn touch_template(&self, id: Uuid, at: DateTime<Utc>) -> RagResult<()> {
        sqlx::query("UPDATE ai_templates SET last_used_at = $1 WHERE id = $2")
            .bind(at)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_document(
        &self,
        workspace_id: &str,
        file_path: &str,
    ) -> RagResult<Option<DocumentRecord>> {
        let record = sqlx::query_as::<_, DocumentRecord>(
            "SELECT * FROM files WHERE workspace_id = $1 AND file_path = $2",
        )
        .bind(workspace_id)
        .bind(file_path)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    async fn upsert_document(&self, record: &DocumentRecord) -> RagResult<()> {
        sqlx::query(
            r#"
            INSERT INTO files
            (file_path, workspace_id, filename, file_size, content_type, chunk_count, indexed_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (file_path) DO UPDATE SET
                filename = EXCLUDED.filename,
                file_size = EXCLUDED.file_size,
                content_type = COALESCE(EXCLUDED.content_type, files.content_type),
                chunk_count = COALESCE(EXCLUDED.chunk_count, files.chunk_count),
                indexed_at = COALESCE(EXCLUDED.indexed_at, files.indexed_at)
            "#,
        )
        .bind(&record.file_path)
        .bind(&record.workspace_id)
        .bind(&record.filename)
        .bind(record.file_size)
        .bind(&record.content_type)
        .bind(record.chunk_count)
        .bind(record.indexed_at)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Catalog used when no database is configured, and in tests.
#[derive(Default)]
pub struct MemoryCatalog {
    templates: RwLock<HashMap<Uuid, PromptTemplate>>,
    documents: RwLock<HashMap<String, DocumentRecord>>,
}

fn poisoned() -> RagError {
    RagError::Storage("catalog lock poisoned".into())
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_template(&self, template: PromptTemplate) -> RagResult<()> {
        self.templates
            .write()
            .map_err(|_| poisoned())?
            .insert(template.id, template);
        Ok(())
    }
}

#[async_trait]
impl Catalog for MemoryCatalog {
    async fn init_schema(&self) -> RagResult<()> {
        Ok(())
    }

    async fn get_template(&self, id: Uuid) -> RagResult<PromptTemplate> {
        self.templates
            .read()
            .map_err(|_| poisoned())?
            .get(&id)
            .cloned()
            .ok_or_else(|| RagError::NotFound(format!("template {}", id)))
    }

    async fn touch_template(&self, id: Uuid, at: DateTime<Utc>) -> RagResult<()> {
        if let Some(template) = self.templates.write().map_err(|_| poisoned())?.get_mut(&id) {
            template.last_used_at = Some(at);
        }
        Ok(())
    }

    async fn get_document(
        &self,
        workspace_id: &str,
        file_path: &str,
    ) -> RagResult<Option<DocumentRecord>> {
        Ok(self
            .documents
            .read()
            .map_err(|_| poisoned())?
            .get(file_path)
            .filter(|record| record.workspace_id == workspace_id)
            .cloned())
    }

    async fn upsert_document(&self, record: &DocumentRecord) -> RagResult<()> {
        let mut documents = self.documents.write().map_err(|_| poisoned())?;
        let mut merged = record.clone();
        if let Some(existing) = documents.get(&record.file_path) {
            merged.created_at = existing.created_at;
            merged.content_type = merged.content_type.or_else(|| existing.content_type.clone());
            merged.chunk_count = merged.chunk_count.or(existing.chunk_count);
            merged.indexed_at = merged.indexed_at.or(existing.indexed_at);
        }
        documents.insert(record.file_path.clone(), merged);
        Ok(())
    }
}
