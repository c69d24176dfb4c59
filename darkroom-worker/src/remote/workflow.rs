//! Training and generation workflow
//!
//! Thin compositions of `execute`, `upload` and `download` that prepare an
//! instance and run the opaque toolkit programs on it. The toolkit reports
//! some failures only as text in its output, so outputs are scanned for
//! failure markers and turned into errors.

use anyhow::{Context, Result, bail};
use darkroom_core::domain::instance::Instance;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::backend::RemoteBackend;
use crate::config::RemoteConfig;

/// Caption written next to every training image
const CAPTION: &str = "an image of [trigger]";

/// Text that marks a failed toolkit run even when it exits 0
const FAILURE_MARKERS: [&str; 3] = ["Error", "Exception", "Traceback"];

/// Where the toolkit checkout is mounted inside the container
const CONTAINER_ROOT: &str = "/app";

pub fn has_failure_marker(output: &str) -> bool {
    FAILURE_MARKERS.iter().any(|marker| output.contains(marker))
}

/// Quotes a value for a POSIX shell
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// One generation run
pub struct GenerationRequest<'a> {
    /// Weights path on the instance
    pub model_path: &'a str,
    /// Output sub-directory name, unique per run on the instance
    pub label: &'a str,
    pub prompts: &'a [String],
    pub parameters: Option<&'a serde_json::Map<String, serde_json::Value>>,
    /// Where the images are downloaded to
    pub local_dir: &'a Path,
}

/// Remote toolkit workflow
pub struct Workflow {
    backend: Arc<dyn RemoteBackend>,
    config: RemoteConfig,
}

impl Workflow {
    pub fn new(backend: Arc<dyn RemoteBackend>, config: RemoteConfig) -> Self {
        Self { backend, config }
    }

    pub fn backend(&self) -> Arc<dyn RemoteBackend> {
        Arc::clone(&self.backend)
    }

    pub fn config(&self) -> &RemoteConfig {
        &self.config
    }

    /// Copies the training images into a fresh local dataset directory
    ///
    /// Images are renamed `image_NNNN.jpg` and each gets a caption file. The
    /// directory is removed again if any image cannot be copied.
    pub async fn prepare_dataset(&self, name: &str, images: &[PathBuf]) -> Result<PathBuf> {
        if images.is_empty() {
            bail!("No training images for {}", name);
        }

        let dataset = self.config.work_dir.join("datasets").join(name);
        if tokio::fs::try_exists(&dataset).await.unwrap_or(false) {
            tokio::fs::remove_dir_all(&dataset)
                .await
                .context("Failed to clear previous dataset")?;
        }
        tokio::fs::create_dir_all(&dataset)
            .await
            .context("Failed to create dataset directory")?;

        if let Err(e) = Self::fill_dataset(&dataset, images).await {
            error!("Dataset preparation failed: {:#}", e);
            if let Err(cleanup) = tokio::fs::remove_dir_all(&dataset).await {
                warn!("Failed to remove partial dataset: {}", cleanup);
            }
            return Err(e);
        }

        info!("Prepared dataset of {} image(s) at {}", images.len(), dataset.display());
        Ok(dataset)
    }

    async fn fill_dataset(dataset: &Path, images: &[PathBuf]) -> Result<()> {
        for (idx, source) in images.iter().enumerate() {
            let image = dataset.join(format!("image_{:04}.jpg", idx));
            tokio::fs::copy(source, &image)
                .await
                .with_context(|| format!("Source file not found: {}", source.display()))?;

            let caption = dataset.join(format!("image_{:04}.txt", idx));
            tokio::fs::write(&caption, CAPTION)
                .await
                .context("Failed to write caption")?;
        }
        Ok(())
    }

    /// Fetches the toolkit and its container image
    ///
    /// Safe to run on an instance that already has a checkout.
    pub async fn setup_environment(&self, instance: &Instance) -> Result<()> {
        info!(instance_id = %instance.instance_id, "Setting up remote environment");

        let workspace = self.config.workspace();
        let checkout = format!(
            "cd {base} && (test -d {dir}/.git || git clone {repo} {dir}) && \
             cd {dir} && git submodule update --init --recursive",
            base = self.config.base_dir,
            dir = self.config.toolkit_dir,
            repo = shell_quote(&self.config.toolkit_repo),
        );
        let output = self
            .backend
            .execute(instance, &checkout)
            .await
            .context("Environment setup failed")?;
        debug!("Setup output: {}", output);

        let pull = format!("sudo docker pull {}", shell_quote(&self.config.container_image));
        self.backend
            .execute(instance, &pull)
            .await
            .context("Failed to pull container image")?;

        info!(instance_id = %instance.instance_id, %workspace, "Remote environment ready");
        Ok(())
    }

    /// Uploads every file of a local dataset, returning the remote directory
    pub async fn upload_dataset(&self, instance: &Instance, dataset: &Path) -> Result<String> {
        let remote_dir = format!("{}/dataset", self.config.workspace());
        self.backend
            .execute(instance, &format!("rm -rf {0} && mkdir -p {0}", remote_dir))
            .await
            .context("Failed to create remote dataset directory")?;

        let mut files = Vec::new();
        let mut entries = tokio::fs::read_dir(dataset)
            .await
            .context("Failed to read dataset directory")?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                files.push(entry.path());
            }
        }
        files.sort();

        info!("Uploading {} dataset file(s)", files.len());
        for file in &files {
            let name = file
                .file_name()
                .and_then(|n| n.to_str())
                .context("Dataset file name is not valid UTF-8")?;
            self.backend
                .upload(instance, file, &format!("{}/{}", remote_dir, name))
                .await
                .with_context(|| format!("Failed to upload {}", file.display()))?;
        }

        Ok(remote_dir)
    }

    /// Trains a model named `run_name` on the uploaded dataset
    ///
    /// Returns the path of the trained weights on the instance.
    pub async fn run_training(&self, instance: &Instance, run_name: &str) -> Result<String> {
        let workspace = self.config.workspace();

        let configure = format!(
            "cd {} && sed -i 's/name: \".*\"/name: \"{}\"/' {}",
            workspace, run_name, self.config.training_config
        );
        self.backend
            .execute(instance, &configure)
            .await
            .context("Failed to update training configuration")?;

        info!(instance_id = %instance.instance_id, run_name, "Starting training");
        let train = format!(
            "sudo docker run --gpus all --rm \
             -v {workspace}:{container} \
             --workdir {container} \
             -e HF_TOKEN={token} \
             {image} \
             python run.py {config}",
            workspace = workspace,
            container = self.container_workspace(),
            token = shell_quote(&self.config.access_token),
            image = shell_quote(&self.config.container_image),
            config = self.config.training_config,
        );

        let failure = match self.backend.execute(instance, &train).await {
            Ok(output) if !has_failure_marker(&output) => None,
            Ok(output) => Some(output),
            Err(e) => Some(e.to_string()),
        };

        if let Some(output) = failure {
            error!(run_name, "Training failed: {}", output.trim());
            let log = self
                .backend
                .execute(instance, &format!("cat {}/training.log", workspace))
                .await
                .unwrap_or_else(|e| format!("(training log unavailable: {})", e));
            bail!("Training failed with log:\n{}", log);
        }

        let weights = format!("{}/output/{}/{}.safetensors", workspace, run_name, run_name);
        info!(run_name, %weights, "Training finished");
        Ok(weights)
    }

    /// Uploads local weights to the instance, returning their remote path
    pub async fn upload_model(&self, instance: &Instance, weights: &Path) -> Result<String> {
        let remote_dir = format!("{}/models", self.config.workspace());
        self.backend
            .execute(instance, &format!("mkdir -p {}", remote_dir))
            .await
            .context("Failed to create remote model directory")?;

        let name = weights
            .file_name()
            .and_then(|n| n.to_str())
            .context("Weights file name is not valid UTF-8")?;
        let remote = format!("{}/{}", remote_dir, name);

        self.backend
            .upload(instance, weights, &remote)
            .await
            .context("Failed to upload model weights")?;
        Ok(remote)
    }

    /// Generates one image per prompt and downloads them
    ///
    /// Images come back as `gen_NNN.png` in prompt order.
    pub async fn run_generation(
        &self,
        instance: &Instance,
        request: GenerationRequest<'_>,
    ) -> Result<Vec<PathBuf>> {
        let host_output = format!("{}/generated_images/{}", self.config.base_dir, request.label);
        self.backend
            .execute(instance, &format!("rm -rf {0} && mkdir -p {0}", host_output))
            .await
            .context("Failed to create remote output directory")?;

        let container_images = format!("{}/generated_images", self.container_workspace());
        let prompts = serde_json::to_string(request.prompts)?;
        let parameters = match request.parameters {
            Some(parameters) if !parameters.is_empty() => format!(
                "-e PARAMETERS={} ",
                shell_quote(&serde_json::to_string(parameters)?)
            ),
            _ => String::new(),
        };

        let generate = format!(
            "sudo docker run --gpus all --rm \
             -v {workspace}:{container} \
             -v {base}/generated_images:{container_images} \
             --workdir {container} \
             -e HF_TOKEN={token} \
             -e PROMPTS={prompts} \
             -e OUTPUT_DIR={output} \
             -e MODEL_PATH={model} \
             {parameters}{image} \
             python generation/generate_batch.py",
            workspace = self.config.workspace(),
            container = self.container_workspace(),
            base = self.config.base_dir,
            container_images = container_images,
            token = shell_quote(&self.config.access_token),
            prompts = shell_quote(&prompts),
            output = shell_quote(&format!("{}/{}", container_images, request.label)),
            model = shell_quote(&self.container_path(request.model_path)),
            parameters = parameters,
            image = shell_quote(&self.config.container_image),
        );

        info!(
            instance_id = %instance.instance_id,
            label = request.label,
            "Generating {} image(s)", request.prompts.len()
        );
        let output = self
            .backend
            .execute(instance, &generate)
            .await
            .with_context(|| format!("Generation failed for {}", request.label))?;

        if has_failure_marker(&output) {
            error!(label = request.label, "Generation output: {}", output.trim());
            bail!("Generation failed for {}", request.label);
        }

        tokio::fs::create_dir_all(request.local_dir)
            .await
            .context("Failed to create local image directory")?;

        let mut images = Vec::with_capacity(request.prompts.len());
        for idx in 0..request.prompts.len() {
            let name = format!("gen_{:03}.png", idx);
            let local = request.local_dir.join(&name);
            self.backend
                .download(instance, &format!("{}/{}", host_output, name), &local)
                .await
                .with_context(|| format!("Failed to download {}", name))?;
            images.push(local);
        }

        Ok(images)
    }

    fn container_workspace(&self) -> String {
        format!("{}/{}", CONTAINER_ROOT, self.config.toolkit_dir)
    }

    /// Maps a path under the host workspace to the same file inside the container
    fn container_path(&self, host_path: &str) -> String {
        let workspace = self.config.workspace();
        match host_path.strip_prefix(&workspace) {
            Some(rest) => format!("{}{}", self.container_workspace(), rest),
            None => host_path.to_string(),
        }
    }
}
