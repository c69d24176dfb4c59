//! Job command handlers
//!
//! Submission of training and generation jobs, listing, details and the
//! administrative reset.

use anyhow::{Context, Result, bail};
use clap::Subcommand;
use colored::*;
use darkroom_client::DarkroomClient;
use darkroom_core::domain::artifact::ArtifactRef;
use darkroom_core::domain::job::{
    Job, JobPayload, JobStatus, Sex, SingleGenerationPayload, SubjectProfile, TrainingPayload,
};

use crate::config::Config;

/// Job subcommands
#[derive(Subcommand)]
pub enum JobCommands {
    /// Train a model from uploaded images
    Train {
        /// Owner of the job
        #[arg(short, long)]
        owner: i64,

        /// Trained model record to fill in
        #[arg(short, long)]
        model_id: i64,

        /// Paths of the training images on the server
        #[arg(short, long, required = true)]
        image: Vec<String>,

        /// Subject sex (M, F or U)
        #[arg(long, value_parser = parse_sex, default_value = "U")]
        sex: Sex,

        #[arg(long)]
        age_years: Option<u32>,

        #[arg(long)]
        age_months: Option<u32>,
    },
    /// Generate one image from a trained model
    Generate {
        #[arg(short, long)]
        owner: i64,

        #[arg(short, long)]
        model_id: i64,

        /// Stored weights as bucket/path
        #[arg(short, long, value_parser = parse_artifact)]
        weights: ArtifactRef,

        /// Prompt text
        prompt: String,
    },
    /// Submit any payload from a JSON file
    Submit {
        #[arg(short, long)]
        owner: i64,

        /// JSON file holding the payload (with its "kind" tag)
        file: String,
    },
    /// List jobs
    List {
        /// Only jobs of this owner
        #[arg(short, long)]
        owner: Option<i64>,
    },
    /// Get job details
    Get {
        /// Job ID
        id: String,
    },
    /// Remove every job and empty every queue
    Reset {
        /// Confirm the reset
        #[arg(long)]
        yes: bool,
    },
}

fn parse_sex(s: &str) -> Result<Sex, String> {
    match s.to_ascii_uppercase().as_str() {
        "M" => Ok(Sex::Male),
        "F" => Ok(Sex::Female),
        "U" => Ok(Sex::Unspecified),
        other => Err(format!("invalid sex `{}`, expected M, F or U", other)),
    }
}

/// Parse `bucket/path` into an artifact reference
fn parse_artifact(s: &str) -> Result<ArtifactRef, String> {
    match s.split_once('/') {
        Some((bucket, path)) if !bucket.is_empty() && !path.is_empty() => {
            Ok(ArtifactRef::new(bucket, path))
        }
        _ => Err(format!("invalid artifact `{}`, expected bucket/path", s)),
    }
}

/// Handle job commands
pub async fn handle_job_command(command: JobCommands, config: &Config) -> Result<()> {
    let client = DarkroomClient::new(&config.server_url);

    match command {
        JobCommands::Train {
            owner,
            model_id,
            image,
            sex,
            age_years,
            age_months,
        } => {
            let payload = JobPayload::Training(TrainingPayload {
                model_id,
                images: image,
                subject: SubjectProfile {
                    sex,
                    age_years,
                    age_months,
                },
            });
            submit(&client, owner, payload).await
        }
        JobCommands::Generate {
            owner,
            model_id,
            weights,
            prompt,
        } => {
            let payload = JobPayload::SingleGeneration(SingleGenerationPayload {
                model_id,
                weights,
                prompt,
                parameters: Default::default(),
            });
            submit(&client, owner, payload).await
        }
        JobCommands::Submit { owner, file } => {
            let json = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read payload file: {}", file))?;
            let payload: JobPayload =
                serde_json::from_str(&json).context("Payload file is not a valid job payload")?;
            submit(&client, owner, payload).await
        }
        JobCommands::List { owner } => list_jobs(&client, owner).await,
        JobCommands::Get { id } => get_job(&client, &id).await,
        JobCommands::Reset { yes } => reset(&client, yes).await,
    }
}

async fn submit(client: &DarkroomClient, owner: i64, payload: JobPayload) -> Result<()> {
    let job_type = payload.job_type();
    let job_id = client.enqueue_job(owner, payload).await?;

    println!("{}", "✓ Job enqueued".green().bold());
    println!("  ID:   {}", job_id.cyan());
    println!("  Type: {}", job_type.as_str());

    Ok(())
}

async fn list_jobs(client: &DarkroomClient, owner: Option<i64>) -> Result<()> {
    let jobs = match owner {
        Some(owner) => client.list_owner_jobs(owner).await?,
        None => client.list_jobs().await?,
    };

    if jobs.is_empty() {
        println!("{}", "No jobs found.".yellow());
    } else {
        println!("{}", format!("Found {} job(s):", jobs.len()).bold());
        println!();
        for job in jobs {
            print_job_summary(&job);
        }
    }

    Ok(())
}

async fn get_job(client: &DarkroomClient, id: &str) -> Result<()> {
    let job = match client.get_job(id).await {
        Ok(job) => job,
        Err(e) if e.is_not_found() => bail!("Job {} not found", id),
        Err(e) => return Err(e.into()),
    };

    print_job_details(&job);
    Ok(())
}

async fn reset(client: &DarkroomClient, yes: bool) -> Result<()> {
    if !yes {
        println!(
            "{}",
            "This removes every job. Re-run with --yes to confirm.".yellow()
        );
        return Ok(());
    }

    let removed = client.reset_all().await?;
    println!("{}", format!("✓ Removed {} job(s)", removed).green());

    Ok(())
}

fn print_job_summary(job: &Job) {
    println!("  {} Job {}", "▸".cyan(), job.job_id.dimmed());
    println!("    Type:     {}", job.job_type.as_str());
    println!("    Owner:    {}", job.owner_id);
    println!("    Status:   {}", colorize_status(&job.status));
    println!(
        "    Created:  {}",
        job.created_at
            .format("%Y-%m-%d %H:%M:%S")
            .to_string()
            .dimmed()
    );
    println!();
}

fn print_job_details(job: &Job) {
    println!("{}", "Job Details:".bold());
    println!("  ID:          {}", job.job_id.cyan());
    println!("  Type:        {}", job.job_type.as_str());
    println!("  Owner:       {}", job.owner_id);
    println!("  Status:      {}", colorize_status(&job.status));
    println!("  Retries:     {}", job.retries);
    println!("  Created:     {}", job.created_at.format("%Y-%m-%d %H:%M:%S"));

    if let Some(started) = job.started_at {
        println!("  Started:     {}", started.format("%Y-%m-%d %H:%M:%S"));
    }

    if let Some(completed) = job.completed_at {
        println!("  Completed:   {}", completed.format("%Y-%m-%d %H:%M:%S"));

        if let Some(elapsed) = job.processing_time() {
            println!("  Duration:    {}s", elapsed.num_seconds());
        }
    }

    if let Some(result) = &job.result {
        println!("\n{}", "Result:".bold());
        match serde_json::to_string_pretty(result) {
            Ok(pretty) => println!("{}", pretty),
            Err(_) => println!("{:?}", result),
        }
    }

    if let Some(error) = &job.error {
        println!("\n{}", "Error:".bold());
        println!("{}", error.red());
    }
}

fn colorize_status(status: &JobStatus) -> colored::ColoredString {
    let status_str = status.to_string();
    match status {
        JobStatus::Pending => status_str.yellow(),
        JobStatus::Processing => status_str.cyan(),
        JobStatus::Completed => status_str.green(),
        JobStatus::Failed => status_str.red(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sex() {
        assert_eq!(parse_sex("m").unwrap(), Sex::Male);
        assert_eq!(parse_sex("F").unwrap(), Sex::Female);
        assert_eq!(parse_sex("U").unwrap(), Sex::Unspecified);
        assert!(parse_sex("x").is_err());
    }

    #[test]
    fn test_parse_artifact() {
        let weights = parse_artifact("models/users/1/models/model_2.safetensors").unwrap();
        assert_eq!(weights.bucket, "models");
        assert_eq!(weights.path, "users/1/models/model_2.safetensors");

        assert!(parse_artifact("models").is_err());
        assert!(parse_artifact("/path").is_err());
        assert!(parse_artifact("models/").is_err());
    }
}
