//! Postgres Persistence
//!
//! Entity records owned by jobs: trained models, their photobooks and
//! generated images.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use darkroom_core::domain::artifact::ArtifactRef;
use darkroom_worker::collaborators::{Persistence, PhotobookOutput, TrainingCommit};
use sqlx::{Acquire, PgConnection, PgPool};
use tracing::{info, warn};

const STATUS_TRAINING: &str = "TRAINING";
const STATUS_COMPLETED: &str = "COMPLETED";
const STATUS_FAILED: &str = "FAILED";

/// Status a photobook is stored with after training
///
/// A theme whose generation failed arrives with no images.
fn photobook_status(photobook: &PhotobookOutput) -> &'static str {
    if photobook.images.is_empty() {
        STATUS_FAILED
    } else {
        STATUS_COMPLETED
    }
}

pub struct PgPersistence {
    pool: PgPool,
}

impl PgPersistence {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Insert one training photobook, returning its id
async fn insert_photobook(
    conn: &mut PgConnection,
    model_id: i64,
    owner_id: i64,
    photobook: &PhotobookOutput,
    images: serde_json::Value,
) -> Result<i64, sqlx::Error> {
    let now = chrono::Utc::now();
    let error_message = photobook
        .images
        .is_empty()
        .then(|| "Generation failed for this theme".to_string());

    sqlx::query_scalar::<_, i64>(
        r#"
        INSERT INTO photobooks (model_id, owner_id, theme_name, status, images, error_message, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $7)
        RETURNING id
        "#,
    )
    .bind(model_id)
    .bind(owner_id)
    .bind(&photobook.theme_name)
    .bind(photobook_status(photobook))
    .bind(images)
    .bind(error_message)
    .bind(now)
    .fetch_one(conn)
    .await
}

#[async_trait]
impl Persistence for PgPersistence {
    async fn start_training(&self, model_id: i64) -> Result<()> {
        let now = chrono::Utc::now();

        sqlx::query(
            r#"
            INSERT INTO trained_models (id, status, created_at, updated_at)
            VALUES ($1, $2, $3, $3)
            ON CONFLICT (id) DO UPDATE
            SET status = EXCLUDED.status, error_message = NULL, updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(model_id)
        .bind(STATUS_TRAINING)
        .bind(now)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to mark model {} as training", model_id))?;

        Ok(())
    }

    async fn complete_training(
        &self,
        model_id: i64,
        owner_id: i64,
        weights: &ArtifactRef,
        photobooks: &[PhotobookOutput],
    ) -> Result<TrainingCommit> {
        let now = chrono::Utc::now();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO trained_models (id, owner_id, status, weights, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $5)
            ON CONFLICT (id) DO UPDATE
            SET owner_id = EXCLUDED.owner_id, status = EXCLUDED.status,
                weights = EXCLUDED.weights, error_message = NULL,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(model_id)
        .bind(owner_id)
        .bind(STATUS_COMPLETED)
        .bind(serde_json::to_value(weights)?)
        .bind(now)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("Failed to complete model {}", model_id))?;

        let mut commit = TrainingCommit::default();
        for photobook in photobooks {
            let images = serde_json::to_value(&photobook.images)?;

            // Each photobook gets its own savepoint
            let mut savepoint = tx.begin().await?;
            match insert_photobook(&mut *savepoint, model_id, owner_id, photobook, images).await {
                Ok(id) => {
                    savepoint.commit().await?;
                    commit.photobook_ids.push(id);
                }
                Err(e) => {
                    warn!(
                        model_id,
                        theme = %photobook.theme_name,
                        "Failed to store photobook: {}",
                        e
                    );
                    savepoint.rollback().await?;
                    commit.failed_themes.push(photobook.theme_name.clone());
                }
            }
        }

        tx.commit().await?;

        info!(
            model_id,
            photobooks = commit.photobook_ids.len(),
            failed = commit.failed_themes.len(),
            "Committed trained model"
        );
        Ok(commit)
    }

    async fn fail_training(&self, model_id: i64, error: &str) -> Result<()> {
        let now = chrono::Utc::now();

        sqlx::query(
            r#"
            INSERT INTO trained_models (id, status, error_message, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $4)
            ON CONFLICT (id) DO UPDATE
            SET status = EXCLUDED.status, error_message = EXCLUDED.error_message,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(model_id)
        .bind(STATUS_FAILED)
        .bind(error)
        .bind(now)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to mark model {} as failed", model_id))?;

        Ok(())
    }

    async fn record_generated_image(
        &self,
        owner_id: i64,
        model_id: i64,
        prompt: &str,
        image: &ArtifactRef,
    ) -> Result<i64> {
        let now = chrono::Utc::now();

        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO generated_images (owner_id, model_id, prompt, image, created_at)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id
            "#,
        )
        .bind(owner_id)
        .bind(model_id)
        .bind(prompt)
        .bind(serde_json::to_value(image)?)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .context("Failed to record generated image")?;

        Ok(id)
    }

    async fn complete_photobook(&self, photobook_id: i64, images: &[ArtifactRef]) -> Result<()> {
        let now = chrono::Utc::now();

        let result = sqlx::query(
            r#"
            UPDATE photobooks
            SET status = $2, images = $3, error_message = NULL, updated_at = $4
            WHERE id = $1
            "#,
        )
        .bind(photobook_id)
        .bind(STATUS_COMPLETED)
        .bind(serde_json::to_value(images)?)
        .bind(now)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to complete photobook {}", photobook_id))?;

        if result.rows_affected() == 0 {
            bail!("Photobook {} not found", photobook_id);
        }
        Ok(())
    }

    async fn fail_photobook(&self, photobook_id: i64, error: &str) -> Result<()> {
        let now = chrono::Utc::now();

        let result = sqlx::query(
            r#"
            UPDATE photobooks
            SET status = $2, error_message = $3, updated_at = $4
            WHERE id = $1
            "#,
        )
        .bind(photobook_id)
        .bind(STATUS_FAILED)
        .bind(error)
        .bind(now)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to mark photobook {} as failed", photobook_id))?;

        if result.rows_affected() == 0 {
            bail!("Photobook {} not found", photobook_id);
        }
        Ok(())
    }
}
