//! Persistence collaborator

use anyhow::Result;
use async_trait::async_trait;
use darkroom_core::domain::artifact::ArtifactRef;
use serde::{Deserialize, Serialize};

/// Images generated for one theme during training
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhotobookOutput {
    pub theme_name: String,
    /// Empty when generation failed for this theme
    pub images: Vec<ArtifactRef>,
}

/// What a training commit persisted
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingCommit {
    pub photobook_ids: Vec<i64>,
    /// Themes whose photobook could not be stored
    pub failed_themes: Vec<String>,
}

/// Entity records owned by jobs
///
/// `complete_training` commits each photobook on its own savepoint inside
/// the model's transaction, so one bad photobook does not roll back the
/// model or its siblings.
#[async_trait]
pub trait Persistence: Send + Sync {
    /// Marks a trained model as in progress
    async fn start_training(&self, model_id: i64) -> Result<()>;

    /// Stores the weights, marks the model completed and attaches its photobooks
    async fn complete_training(
        &self,
        model_id: i64,
        owner_id: i64,
        weights: &ArtifactRef,
        photobooks: &[PhotobookOutput],
    ) -> Result<TrainingCommit>;

    async fn fail_training(&self, model_id: i64, error: &str) -> Result<()>;

    /// Records one generated image, returning its id
    async fn record_generated_image(
        &self,
        owner_id: i64,
        model_id: i64,
        prompt: &str,
        image: &ArtifactRef,
    ) -> Result<i64>;

    /// Attaches the images to the photobook and marks it completed
    async fn complete_photobook(&self, photobook_id: i64, images: &[ArtifactRef]) -> Result<()>;

    async fn fail_photobook(&self, photobook_id: i64, error: &str) -> Result<()>;
}
