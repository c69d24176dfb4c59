use sqlx::{PgPool, postgres::PgPoolOptions};
use std::time::Duration;

pub async fn create_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    // Trained models; rows may be created by the account layer before training starts
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS trained_models (
            id BIGINT PRIMARY KEY,
            owner_id BIGINT,
            status VARCHAR(50) NOT NULL,
            weights JSONB,
            error_message TEXT,
            created_at TIMESTAMPTZ NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS photobooks (
            id BIGSERIAL PRIMARY KEY,
            model_id BIGINT REFERENCES trained_models(id) ON DELETE CASCADE,
            owner_id BIGINT,
            theme_name VARCHAR(255) NOT NULL,
            status VARCHAR(50) NOT NULL,
            images JSONB NOT NULL DEFAULT '[]',
            error_message TEXT,
            created_at TIMESTAMPTZ NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS generated_images (
            id BIGSERIAL PRIMARY KEY,
            owner_id BIGINT NOT NULL,
            model_id BIGINT NOT NULL,
            prompt TEXT NOT NULL,
            image JSONB NOT NULL,
            created_at TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_trained_models_owner ON trained_models(owner_id)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_photobooks_model_id ON photobooks(model_id)")
        .execute(pool)
        .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_generated_images_owner ON generated_images(owner_id, created_at DESC)",
    )
    .execute(pool)
    .await?;

    tracing::info!("Database migrations completed successfully");
    Ok(())
}
