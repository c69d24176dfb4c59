//! GPU cloud control API
//!
//! Speaks the provider's REST API:
//! - `POST instance-operations/launch`
//! - `GET instances/{id}`
//! - `POST instance-operations/terminate`
//!
//! Launch rejections are classified from the error code in the response
//! body so the backend can decide between the next region and the next
//! instance type.

use async_trait::async_trait;
use darkroom_core::domain::instance::{Instance, InstanceStatus};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::config::ProviderConfig;
use crate::error::ProviderError;

/// Control API of a GPU cloud
#[async_trait]
pub trait ComputeProvider: Send + Sync {
    /// Requests one instance, returning its id
    async fn launch(&self, instance_type: &str, region: &str) -> Result<String, ProviderError>;

    /// Current view of an instance
    async fn instance(&self, instance_id: &str) -> Result<Instance, ProviderError>;

    async fn terminate(&self, instance_id: &str) -> Result<(), ProviderError>;
}

/// Classifies a rejected launch request
pub fn classify_launch_error(status: u16, body: &str) -> ProviderError {
    if status == StatusCode::BAD_REQUEST.as_u16() {
        if body.contains("insufficient-capacity") {
            return ProviderError::InsufficientCapacity(body.to_string());
        }
        if body.contains("invalid-instance-type") {
            return ProviderError::InvalidInstanceType(body.to_string());
        }
        if body.contains("invalid-region") {
            return ProviderError::InvalidRegion(body.to_string());
        }
    }

    ProviderError::Api {
        status,
        message: body.to_string(),
    }
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct LaunchData {
    instance_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct InstanceData {
    id: Option<String>,
    #[serde(default)]
    status: String,
    ip: Option<String>,
    region: Option<RegionData>,
    instance_type: Option<InstanceTypeData>,
}

#[derive(Debug, Deserialize)]
struct RegionData {
    name: String,
}

#[derive(Debug, Deserialize)]
struct InstanceTypeData {
    name: String,
}

/// HTTP implementation of ComputeProvider
pub struct HttpComputeProvider {
    client: Client,
    base_url: String,
    api_key: String,
    ssh_key_name: String,
}

impl HttpComputeProvider {
    /// Creates a provider client with the configured request timeout
    pub fn new(config: &ProviderConfig) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self {
            client,
            base_url: config.api_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            ssh_key_name: config.ssh_key_name.clone(),
        })
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/{}", self.base_url, endpoint)
    }

    async fn read_body<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ProviderError> {
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            return Err(ProviderError::Api {
                status: status.as_u16(),
                message: text,
            });
        }

        serde_json::from_str(&text).map_err(|e| ProviderError::InvalidResponse(e.to_string()))
    }
}

#[async_trait]
impl ComputeProvider for HttpComputeProvider {
    async fn launch(&self, instance_type: &str, region: &str) -> Result<String, ProviderError> {
        let body = json!({
            "region_name": region,
            "instance_type_name": instance_type,
            "quantity": 1,
            "ssh_key_names": [self.ssh_key_name],
        });

        let response = self
            .client
            .post(self.url("instance-operations/launch"))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_launch_error(status.as_u16(), &text));
        }

        let envelope: Envelope<LaunchData> = Self::read_body(response).await?;
        envelope
            .data
            .instance_ids
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::InvalidResponse("launch returned no instance id".into()))
    }

    async fn instance(&self, instance_id: &str) -> Result<Instance, ProviderError> {
        let response = self
            .client
            .get(self.url(&format!("instances/{}", instance_id)))
            .bearer_auth(&self.api_key)
            .send()
            .await?;

        let envelope: Envelope<InstanceData> = Self::read_body(response).await?;
        let data = envelope.data;
        debug!(instance_id, status = %data.status, "Instance status");

        Ok(Instance {
            instance_id: data.id.unwrap_or_else(|| instance_id.to_string()),
            ip: data.ip.filter(|ip| !ip.is_empty()),
            status: InstanceStatus::from_provider(&data.status),
            region: data.region.map(|r| r.name).unwrap_or_default(),
            instance_type: data.instance_type.map(|t| t.name).unwrap_or_default(),
        })
    }

    async fn terminate(&self, instance_id: &str) -> Result<(), ProviderError> {
        let response = self
            .client
            .post(self.url("instance-operations/terminate"))
            .bearer_auth(&self.api_key)
            .json(&json!({ "instance_ids": [instance_id] }))
            .send()
            .await?;

        let _: serde_json::Value = Self::read_body(response).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_launch_error() {
        let body = r#"{"error":{"code":"instance-operations/launch/insufficient-capacity"}}"#;
        assert!(matches!(
            classify_launch_error(400, body),
            ProviderError::InsufficientCapacity(_)
        ));

        let body = r#"{"error":{"code":"global/invalid-instance-type"}}"#;
        assert!(matches!(
            classify_launch_error(400, body),
            ProviderError::InvalidInstanceType(_)
        ));

        let body = r#"{"error":{"code":"global/invalid-region"}}"#;
        assert!(matches!(
            classify_launch_error(400, body),
            ProviderError::InvalidRegion(_)
        ));

        assert!(matches!(
            classify_launch_error(400, "quota exceeded"),
            ProviderError::Api { status: 400, .. }
        ));
        assert!(matches!(
            classify_launch_error(500, "insufficient-capacity"),
            ProviderError::Api { status: 500, .. }
        ));
    }

    #[test]
    fn test_instance_payload_parsing() {
        let body = r#"{"data":{"id":"i-1","status":"active","ip":"10.0.0.2",
            "region":{"name":"us-west-1"},"instance_type":{"name":"gpu_1x_a10"}}}"#;
        let envelope: Envelope<InstanceData> = serde_json::from_str(body).unwrap();

        assert_eq!(envelope.data.status, "active");
        assert_eq!(envelope.data.ip.as_deref(), Some("10.0.0.2"));
        assert_eq!(envelope.data.region.unwrap().name, "us-west-1");
    }
}
