//! GPU job handlers
//!
//! One handler for all three job types:
//! - Training: dataset preparation runs while the instance boots, then the
//!   model is trained and every applicable theme is rendered into an initial
//!   photobook on the same instance
//! - Single generation: one image from cached weights
//! - Batch generation: a photobook from cached weights
//!
//! Instances are only reached through [`with_instance`] and
//! [`run_on_instance`], so each one is terminated exactly once. Uploads to
//! storage and persistence happen after termination.

use anyhow::{Context, Result};
use async_trait::async_trait;
use darkroom_core::domain::artifact::ArtifactRef;
use darkroom_core::domain::job::{
    BatchGenerationPayload, Job, JobPayload, SingleGenerationPayload, SubjectProfile,
    TrainingPayload,
};
use serde_json::{Value as JsonValue, json};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::cache::ModelCache;
use crate::collaborators::{Persistence, PhotobookOutput, Storage};
use crate::pool::JobHandler;
use crate::remote::{GenerationRequest, Workflow, run_on_instance, with_instance};
use crate::themes::ThemeCatalog;

/// Bucket holding trained weights
pub const MODELS_BUCKET: &str = "models";

/// Bucket holding generated images
pub const IMAGES_BUCKET: &str = "images";

/// Local outputs of a training run
struct TrainingOutput {
    weights: PathBuf,
    themes: Vec<(String, Vec<PathBuf>)>,
}

pub struct GpuJobHandler {
    workflow: Arc<Workflow>,
    cache: Arc<ModelCache>,
    storage: Arc<dyn Storage>,
    persistence: Arc<dyn Persistence>,
    themes: Arc<ThemeCatalog>,
}

impl GpuJobHandler {
    pub fn new(
        workflow: Arc<Workflow>,
        cache: Arc<ModelCache>,
        storage: Arc<dyn Storage>,
        persistence: Arc<dyn Persistence>,
        themes: Arc<ThemeCatalog>,
    ) -> Self {
        Self {
            workflow,
            cache,
            storage,
            persistence,
            themes,
        }
    }

    fn job_dir(&self, job: &Job) -> PathBuf {
        self.workflow.config().work_dir.join("jobs").join(&job.job_id)
    }

    async fn train(&self, job: &Job, payload: &TrainingPayload) -> Result<JsonValue> {
        self.persistence
            .start_training(payload.model_id)
            .await
            .context("Failed to mark model as training")?;

        let run_name = format!("model_{}", payload.model_id);
        let job_dir = self.job_dir(job);
        let images: Vec<PathBuf> = payload.images.iter().map(PathBuf::from).collect();

        let backend = self.workflow.backend();
        let (launched, dataset) = tokio::join!(
            backend.launch(),
            self.workflow.prepare_dataset(&run_name, &images)
        );

        let dataset_dir = dataset.as_ref().ok().cloned();
        let instance = match launched {
            Ok(instance) => instance,
            Err(e) => {
                if let Some(dir) = &dataset_dir {
                    remove_dir_quietly(dir).await;
                }
                return Err(e).context("Failed to launch GPU instance");
            }
        };

        let workflow = Arc::clone(&self.workflow);
        let themes = Arc::clone(&self.themes);
        let subject = payload.subject.clone();
        let output_dir = job_dir.clone();
        let outcome = with_instance(backend, instance, move |instance| async move {
            let dataset = dataset?;
            workflow.setup_environment(&instance).await?;
            workflow.upload_dataset(&instance, &dataset).await?;
            let remote_weights = workflow.run_training(&instance, &run_name).await?;

            tokio::fs::create_dir_all(&output_dir)
                .await
                .context("Failed to create job directory")?;
            let weights = output_dir.join(format!("{}.safetensors", run_name));
            workflow
                .backend()
                .download(&instance, &remote_weights, &weights)
                .await
                .context("Failed to download trained weights")?;

            let themes = render_themes(
                &workflow,
                &instance,
                &themes,
                &subject,
                &remote_weights,
                &output_dir,
            )
            .await;

            Ok(TrainingOutput { weights, themes })
        })
        .await;

        if let Some(dir) = &dataset_dir {
            remove_dir_quietly(dir).await;
        }

        let result = match outcome {
            Ok(output) => self.commit_training(job, payload, output).await,
            Err(e) => Err(e),
        };
        remove_dir_quietly(&job_dir).await;
        result
    }

    async fn commit_training(
        &self,
        job: &Job,
        payload: &TrainingPayload,
        output: TrainingOutput,
    ) -> Result<JsonValue> {
        let destination = ArtifactRef::new(
            MODELS_BUCKET,
            format!(
                "users/{}/models/model_{}.safetensors",
                job.owner_id, payload.model_id
            ),
        );
        let weights = self
            .upload_file(&output.weights, &destination)
            .await
            .context("Failed to store trained weights")?;

        let mut photobooks = Vec::with_capacity(output.themes.len());
        for (theme_name, images) in output.themes {
            let prefix = format!(
                "users/{}/photobooks/model_{}/{}",
                job.owner_id,
                payload.model_id,
                label_for(&theme_name)
            );
            let images = match self.upload_images(&images, &prefix).await {
                Ok(images) => images,
                Err(e) => {
                    warn!(theme = %theme_name, "Failed to store photobook images: {:#}", e);
                    Vec::new()
                }
            };
            photobooks.push(PhotobookOutput { theme_name, images });
        }

        let commit = self
            .persistence
            .complete_training(payload.model_id, job.owner_id, &weights, &photobooks)
            .await
            .context("Failed to record trained model")?;

        info!(
            job_id = %job.job_id,
            model_id = payload.model_id,
            photobooks = commit.photobook_ids.len(),
            "Training committed"
        );
        Ok(json!({
            "model_id": payload.model_id,
            "weights": weights,
            "photobook_ids": commit.photobook_ids,
            "failed_themes": commit.failed_themes,
        }))
    }

    async fn generate_single(
        &self,
        job: &Job,
        payload: &SingleGenerationPayload,
    ) -> Result<JsonValue> {
        let prompts = vec![payload.prompt.clone()];
        let images = self
            .generate(job, &payload.weights, prompts, payload.parameters.clone())
            .await?;
        let image = images.first().context("Generation produced no image")?;

        let destination = ArtifactRef::new(
            IMAGES_BUCKET,
            format!("users/{}/generated/{}.png", job.owner_id, job.job_id),
        );
        let stored = self.upload_file(image, &destination).await;
        remove_dir_quietly(&self.job_dir(job)).await;
        let stored = stored.context("Failed to store generated image")?;

        let image_id = self
            .persistence
            .record_generated_image(job.owner_id, payload.model_id, &payload.prompt, &stored)
            .await
            .context("Failed to record generated image")?;

        Ok(json!({
            "image_id": image_id,
            "image": stored,
            "url": self.storage.public_url(&stored),
        }))
    }

    async fn generate_batch(
        &self,
        job: &Job,
        payload: &BatchGenerationPayload,
    ) -> Result<JsonValue> {
        let images = self
            .generate(job, &payload.weights, payload.prompts.clone(), Default::default())
            .await?;

        let prefix = format!(
            "users/{}/photobooks/{}",
            job.owner_id, payload.photobook_id
        );
        let stored = self.upload_images(&images, &prefix).await;
        remove_dir_quietly(&self.job_dir(job)).await;
        let stored = stored.context("Failed to store photobook images")?;

        self.persistence
            .complete_photobook(payload.photobook_id, &stored)
            .await
            .context("Failed to complete photobook")?;

        info!(
            job_id = %job.job_id,
            photobook_id = payload.photobook_id,
            theme = %payload.theme_name,
            "Photobook generated with {} image(s)", stored.len()
        );
        Ok(json!({
            "photobook_id": payload.photobook_id,
            "images": stored,
        }))
    }

    /// Renders `prompts` with cached weights on a fresh instance
    async fn generate(
        &self,
        job: &Job,
        weights: &ArtifactRef,
        prompts: Vec<String>,
        parameters: serde_json::Map<String, JsonValue>,
    ) -> Result<Vec<PathBuf>> {
        if prompts.is_empty() {
            anyhow::bail!("No prompts to generate");
        }

        let local_weights = self.cache.get_or_fetch(weights).await?;
        let workflow = Arc::clone(&self.workflow);
        let label = format!("job_{}", label_for(&job.job_id));
        let local_dir = self.job_dir(job).join("images");

        run_on_instance(self.workflow.backend(), move |instance| async move {
            workflow.setup_environment(&instance).await?;
            let remote_weights = workflow.upload_model(&instance, &local_weights).await?;
            workflow
                .run_generation(
                    &instance,
                    GenerationRequest {
                        model_path: &remote_weights,
                        label: &label,
                        prompts: &prompts,
                        parameters: Some(&parameters),
                        local_dir: &local_dir,
                    },
                )
                .await
        })
        .await
    }

    async fn upload_file(&self, local: &Path, destination: &ArtifactRef) -> Result<ArtifactRef> {
        let bytes = tokio::fs::read(local)
            .await
            .with_context(|| format!("Failed to read {}", local.display()))?;
        self.storage.upload(bytes, destination).await
    }

    async fn upload_images(&self, images: &[PathBuf], prefix: &str) -> Result<Vec<ArtifactRef>> {
        let mut stored = Vec::with_capacity(images.len());
        for (idx, image) in images.iter().enumerate() {
            let destination = ArtifactRef::new(IMAGES_BUCKET, format!("{}/{:03}.png", prefix, idx));
            stored.push(self.upload_file(image, &destination).await?);
        }
        Ok(stored)
    }
}

#[async_trait]
impl JobHandler for GpuJobHandler {
    async fn handle(&self, job: &Job) -> Result<JsonValue> {
        match &job.payload {
            JobPayload::Training(payload) => self.train(job, payload).await,
            JobPayload::SingleGeneration(payload) => self.generate_single(job, payload).await,
            JobPayload::BatchGeneration(payload) => self.generate_batch(job, payload).await,
        }
    }

    async fn on_terminal_failure(&self, job: &Job, error: &str) {
        let recorded = match &job.payload {
            JobPayload::Training(payload) => {
                self.persistence.fail_training(payload.model_id, error).await
            }
            JobPayload::BatchGeneration(payload) => {
                self.persistence
                    .fail_photobook(payload.photobook_id, error)
                    .await
            }
            JobPayload::SingleGeneration(_) => Ok(()),
        };

        if let Err(e) = recorded {
            error!(job_id = %job.job_id, "Failed to record job failure: {:#}", e);
        }
    }
}

/// Renders every applicable theme, leaving a failed theme with no images
async fn render_themes(
    workflow: &Workflow,
    instance: &darkroom_core::domain::instance::Instance,
    catalog: &ThemeCatalog,
    subject: &SubjectProfile,
    remote_weights: &str,
    output_dir: &Path,
) -> Vec<(String, Vec<PathBuf>)> {
    let mut rendered = Vec::new();

    for (name, theme) in catalog.applicable(subject) {
        let prompts = theme.expand_prompts(subject);
        let label = label_for(name);
        info!(theme = %name, "Generating {} theme image(s)", prompts.len());

        let request = GenerationRequest {
            model_path: remote_weights,
            label: &label,
            prompts: &prompts,
            parameters: None,
            local_dir: &output_dir.join("themes").join(&label),
        };
        let images = match workflow.run_generation(instance, request).await {
            Ok(images) => images,
            Err(e) => {
                error!(theme = %name, "Failed to generate theme: {:#}", e);
                Vec::new()
            }
        };
        rendered.push((name.to_string(), images));
    }

    rendered
}

/// Path-safe form of a name
fn label_for(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

async fn remove_dir_quietly(dir: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(dir).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!(dir = %dir.display(), "Failed to remove working directory: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::LocalStorage;
    use crate::config::RemoteConfig;
    use crate::remote::GpuBackend;
    use crate::testing::{MemoryPersistence, ScriptedProvider, ScriptedShell, test_provider_config};
    use darkroom_core::domain::job::Sex;
    use tempfile::TempDir;

    const THEMES: &str = r#"{
        "beach": {
            "gender": "U", "age_min": 0, "age_max": 12,
            "prompts": [{ "prompt": "a {GENDER_NOUN} on the beach", "count": 2 }]
        },
        "space": {
            "gender": "U", "age_min": 0, "age_max": 12,
            "prompts": [{ "prompt": "a {GENDER_NOUN} astronaut", "count": 1 }]
        },
        "teen": {
            "gender": "U", "age_min": 13, "age_max": 19,
            "prompts": [{ "prompt": "a teenager", "count": 1 }]
        }
    }"#;

    struct Fixture {
        dir: TempDir,
        provider: Arc<ScriptedProvider>,
        shell: Arc<ScriptedShell>,
        storage: Arc<LocalStorage>,
        persistence: Arc<MemoryPersistence>,
        handler: GpuJobHandler,
    }

    async fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let provider = Arc::new(ScriptedProvider::new());
        let shell = Arc::new(ScriptedShell::new());
        let storage = Arc::new(LocalStorage::new(dir.path().join("storage")));
        let persistence = Arc::new(MemoryPersistence::new());

        let backend = Arc::new(GpuBackend::new(
            provider.clone(),
            shell.clone(),
            test_provider_config(),
        ));
        let workflow = Arc::new(Workflow::new(
            backend,
            RemoteConfig {
                work_dir: dir.path().join("work"),
                ..RemoteConfig::default()
            },
        ));
        let cache = Arc::new(
            ModelCache::open(dir.path().join("cache"), 1024 * 1024, storage.clone())
                .await
                .unwrap(),
        );
        let handler = GpuJobHandler::new(
            workflow,
            cache,
            storage.clone(),
            persistence.clone(),
            Arc::new(ThemeCatalog::from_json(THEMES).unwrap()),
        );

        Fixture {
            dir,
            provider,
            shell,
            storage,
            persistence,
            handler,
        }
    }

    fn training_job(dir: &Path) -> Job {
        let image = dir.join("upload.jpg");
        std::fs::write(&image, b"jpeg").unwrap();
        Job::new(
            5,
            JobPayload::Training(TrainingPayload {
                model_id: 9,
                images: vec![image.display().to_string()],
                subject: SubjectProfile {
                    sex: Sex::Female,
                    age_years: Some(3),
                    age_months: None,
                },
            }),
        )
    }

    #[tokio::test]
    async fn test_training_commits_model_and_photobooks() {
        let f = fixture().await;
        f.provider.push_launch(Ok("i-train".into()));
        f.shell.respond("generated_images/space'", "Traceback: out of memory", "", 0);

        let job = training_job(f.dir.path());
        let result = f.handler.handle(&job).await.unwrap();

        assert_eq!(result["model_id"], 9);
        assert_eq!(f.provider.terminated(), vec!["i-train".to_string()]);

        let weights = ArtifactRef::new(MODELS_BUCKET, "users/5/models/model_9.safetensors");
        assert!(f.storage.download(&weights).await.is_ok());

        let photobooks = f.persistence.photobooks();
        assert_eq!(photobooks.len(), 2);
        assert_eq!(photobooks[0].theme_name, "beach");
        assert_eq!(photobooks[0].images.len(), 2);
        assert_eq!(photobooks[1].theme_name, "space");
        assert!(photobooks[1].images.is_empty());

        assert!(
            f.shell
                .commands()
                .iter()
                .any(|c| c.contains("a girl on the beach"))
        );
        assert!(!f.dir.path().join("work/jobs").join(&job.job_id).exists());
    }

    #[tokio::test]
    async fn test_training_failure_terminates_instance_and_marks_model_failed() {
        let f = fixture().await;
        f.provider.push_launch(Ok("i-bad".into()));
        f.shell.respond("python run.py", "Exception: CUDA error", "", 0);

        let job = training_job(f.dir.path());
        let err = f.handler.handle(&job).await.unwrap_err();
        assert!(format!("{:#}", err).contains("Training failed"));
        assert_eq!(f.provider.terminated(), vec!["i-bad".to_string()]);
        assert!(!f.dir.path().join("work/datasets/model_9").exists());
        assert!(!f.dir.path().join("work/jobs").join(&job.job_id).exists());

        f.handler.on_terminal_failure(&job, "Training failed").await;
        assert_eq!(
            f.persistence.events(),
            vec!["start_training 9", "fail_training 9: Training failed"]
        );
    }

    #[tokio::test]
    async fn test_failed_dataset_upload_removes_dataset() {
        let f = fixture().await;
        f.provider.push_launch(Ok("i-upload".into()));
        f.shell.respond("/dataset && mkdir", "", "connection reset", 1);

        let job = training_job(f.dir.path());
        assert!(f.handler.handle(&job).await.is_err());
        assert_eq!(f.provider.terminated(), vec!["i-upload".to_string()]);
        assert!(!f.dir.path().join("work/datasets/model_9").exists());
    }

    #[tokio::test]
    async fn test_missing_training_images_still_terminate_instance() {
        let f = fixture().await;
        f.provider.push_launch(Ok("i-early".into()));

        let job = Job::new(
            5,
            JobPayload::Training(TrainingPayload {
                model_id: 10,
                images: vec![f.dir.path().join("nope.jpg").display().to_string()],
                subject: SubjectProfile::default(),
            }),
        );

        assert!(f.handler.handle(&job).await.is_err());
        assert_eq!(f.provider.terminated(), vec!["i-early".to_string()]);
    }

    #[tokio::test]
    async fn test_single_generation_uses_cached_weights_and_records_image() {
        let f = fixture().await;
        let weights = f
            .storage
            .upload(
                b"weights".to_vec(),
                &ArtifactRef::new(MODELS_BUCKET, "users/5/models/model_9.safetensors"),
            )
            .await
            .unwrap();

        for round in 0..2 {
            f.provider.push_launch(Ok(format!("i-gen-{}", round)));
            let job = Job::new(
                5,
                JobPayload::SingleGeneration(SingleGenerationPayload {
                    model_id: 9,
                    weights: weights.clone(),
                    prompt: "a portrait".to_string(),
                    parameters: Default::default(),
                }),
            );

            let result = f.handler.handle(&job).await.unwrap();
            assert_eq!(result["image_id"], round + 1);
            assert!(result["url"].as_str().unwrap().starts_with("file://"));
        }

        assert_eq!(f.handler.cache.stats().await.entries, 1);
        assert_eq!(f.provider.terminated().len(), 2);
    }

    #[tokio::test]
    async fn test_batch_generation_completes_photobook() {
        let f = fixture().await;
        let weights = f
            .storage
            .upload(b"weights".to_vec(), &ArtifactRef::new(MODELS_BUCKET, "m.safetensors"))
            .await
            .unwrap();
        f.provider.push_launch(Ok("i-book".into()));

        let job = Job::new(
            5,
            JobPayload::BatchGeneration(BatchGenerationPayload {
                photobook_id: 3,
                model_id: 9,
                theme_name: "beach".to_string(),
                prompts: vec!["one".to_string(), "two".to_string(), "three".to_string()],
                weights,
            }),
        );

        let result = f.handler.handle(&job).await.unwrap();

        assert_eq!(result["images"].as_array().unwrap().len(), 3);
        assert_eq!(f.persistence.events(), vec!["complete_photobook 3: 3 image(s)"]);
        assert_eq!(f.provider.terminated(), vec!["i-book".to_string()]);

        f.handler.on_terminal_failure(&job, "boom").await;
        assert_eq!(f.persistence.events().last().unwrap(), "fail_photobook 3: boom");
    }

    #[test]
    fn test_label_for_replaces_unsafe_characters() {
        assert_eq!(label_for("Under the sea!"), "Under_the_sea_");
        assert_eq!(label_for("training_5_1_ab"), "training_5_1_ab");
    }
}
