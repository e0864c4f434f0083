//! Compute Engine REST client.
//!
//! Uses three API surfaces:
//! - `instanceGroups.listInstances` to count live members
//! - `instances.insert` + `instanceGroups.addInstances` to launch
//! - `zoneOperations.get` to wait for both launch steps

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use gce_scaler_reconcile::{BackoffPolicy, OperationIssue, OperationObservation, OperationStatus};
use reqwest::RequestBuilder;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::auth::TokenSource;
use super::operation::{wait_for_operation, OperationPoller};
use super::{instance_name, is_live_status, FleetClient, FleetError, LaunchRequest};

/// Compute Engine API client.
pub struct ComputeClient {
    client: reqwest::Client,
    endpoint: String,
    tokens: TokenSource,
    backoff: BackoffPolicy,
}

impl ComputeClient {
    /// Create a client against `endpoint` (e.g. `https://compute.googleapis.com/compute/v1`).
    pub fn new(
        endpoint: &str,
        tokens: TokenSource,
        backoff: BackoffPolicy,
    ) -> Result<Self, FleetError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("gce-scaler/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|source| FleetError::Request {
                action: "build client",
                target: endpoint.to_string(),
                source,
            })?;

        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            tokens,
            backoff,
        })
    }

    fn zone_url(&self, project: &str, zone: &str, path: &str) -> String {
        format!("{}/projects/{}/zones/{}/{}", self.endpoint, project, zone, path)
    }

    /// Send an authenticated request and decode the JSON response.
    async fn send<T: DeserializeOwned>(
        &self,
        action: &'static str,
        target: &str,
        request: RequestBuilder,
    ) -> Result<T, FleetError> {
        let token = self.tokens.token().await?;
        let request_error = |source| FleetError::Request {
            action,
            target: target.to_string(),
            source,
        };

        let response = request
            .bearer_auth(token)
            .send()
            .await
            .map_err(request_error)?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(FleetError::Api {
                action,
                target: target.to_string(),
                status,
                body,
            });
        }

        response.json().await.map_err(request_error)
    }

    async fn insert_instance(
        &self,
        request: &LaunchRequest,
        name: &str,
    ) -> Result<Operation, FleetError> {
        let url = self.zone_url(&request.project, &request.zone, "instances");
        let template = format!(
            "projects/{}/global/instanceTemplates/{}",
            request.project, request.template
        );
        let body = InstanceInsert {
            name: name.to_string(),
            scheduling: Scheduling {
                instance_termination_action: "DELETE",
                max_run_duration: ApiDuration {
                    seconds: request.max_run_duration_secs.to_string(),
                },
            },
        };

        let builder = self
            .client
            .post(&url)
            .query(&[("sourceInstanceTemplate", template.as_str())])
            .json(&body);

        self.send("create instance", name, builder).await
    }

    async fn add_to_group(
        &self,
        request: &LaunchRequest,
        instance_link: &str,
    ) -> Result<Operation, FleetError> {
        let url = self.zone_url(
            &request.project,
            &request.zone,
            &format!("instanceGroups/{}/addInstances", request.group),
        );
        let body = AddInstancesRequest {
            instances: vec![InstanceReference {
                instance: instance_link.to_string(),
            }],
        };

        let builder = self.client.post(&url).json(&body);
        self.send("add instance to group", &request.group, builder).await
    }

    /// Best-effort delete of an instance that never joined the group.
    async fn discard_instance(&self, request: &LaunchRequest, name: &str) {
        let url = self.zone_url(
            &request.project,
            &request.zone,
            &format!("instances/{}", name),
        );
        let builder = self.client.delete(&url);

        match self.send::<Operation>("delete instance", name, builder).await {
            Ok(_) => warn!(
                name = %name,
                group = %request.group,
                "Deleting instance that was created but never added to the group"
            ),
            Err(e) => warn!(
                name = %name,
                group = %request.group,
                error = %e,
                "Instance may be running outside the group"
            ),
        }
    }

    async fn wait(
        &self,
        project: &str,
        zone: &str,
        operation: &Operation,
        cancel: &CancellationToken,
    ) -> Result<(), FleetError> {
        let poller = ZoneOperations {
            client: self,
            project,
            zone,
        };
        wait_for_operation(&poller, &operation.name, &self.backoff, cancel).await
    }
}

#[async_trait]
impl FleetClient for ComputeClient {
    async fn live_instance_count(
        &self,
        project: &str,
        zone: &str,
        group: &str,
    ) -> Result<i64, FleetError> {
        let url = self.zone_url(
            project,
            zone,
            &format!("instanceGroups/{}/listInstances", group),
        );

        let mut count = 0i64;
        let mut total = 0usize;
        let mut page_token: Option<String> = None;

        loop {
            let mut builder = self
                .client
                .post(&url)
                .json(&ListInstancesRequest { instance_state: "ALL" });
            if let Some(token) = &page_token {
                builder = builder.query(&[("pageToken", token.as_str())]);
            }

            let page: InstanceGroupInstances =
                self.send("list group instances", group, builder).await?;

            total += page.items.len();
            count += page
                .items
                .iter()
                .filter(|item| is_live_status(&item.status))
                .count() as i64;

            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        debug!(group, total, live = count, "Counted group instances");
        Ok(count)
    }

    async fn launch_instance(
        &self,
        cancel: &CancellationToken,
        request: &LaunchRequest,
    ) -> Result<(), FleetError> {
        let name = instance_name(&request.template);
        info!(name = %name, group = %request.group, "Creating instance");

        let insert = match until_cancelled(cancel, self.insert_instance(request, &name)).await {
            Ok(op) => op,
            Err(e) => {
                if e.is_cancelled() {
                    self.discard_instance(request, &name).await;
                }
                return Err(e);
            }
        };

        // From here on the instance exists, or will. Anything short of a
        // reported insert failure leaves it outside the group.
        let attached = async {
            self.wait(&request.project, &request.zone, &insert, cancel).await?;

            let instance_link = match &insert.target_link {
                Some(link) if !link.is_empty() => link.clone(),
                _ => self.zone_url(
                    &request.project,
                    &request.zone,
                    &format!("instances/{}", name),
                ),
            };
            until_cancelled(cancel, self.add_to_group(request, &instance_link)).await
        }
        .await;

        let attach = match attached {
            Ok(op) => op,
            Err(e) => {
                if !matches!(e, FleetError::Operation { .. }) {
                    self.discard_instance(request, &name).await;
                }
                return Err(e);
            }
        };

        self.wait(&request.project, &request.zone, &attach, cancel).await?;

        info!(name = %name, group = %request.group, "Instance launched");
        Ok(())
    }
}

/// Run `request` unless `cancel` fires first.
async fn until_cancelled<T>(
    cancel: &CancellationToken,
    request: impl Future<Output = Result<T, FleetError>>,
) -> Result<T, FleetError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(FleetError::Cancelled),
        result = request => result,
    }
}

/// Polls zone operations for one project/zone.
struct ZoneOperations<'a> {
    client: &'a ComputeClient,
    project: &'a str,
    zone: &'a str,
}

#[async_trait]
impl OperationPoller for ZoneOperations<'_> {
    async fn poll(&self, operation: &str) -> Result<OperationObservation, FleetError> {
        let url = self.client.zone_url(
            self.project,
            self.zone,
            &format!("operations/{}", operation),
        );
        let builder = self.client.client.get(&url);
        let op: Operation = self.client.send("get operation", operation, builder).await?;
        Ok(op.observation())
    }
}

// =============================================================================
// Wire types
// =============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InstanceInsert {
    name: String,
    scheduling: Scheduling,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Scheduling {
    instance_termination_action: &'static str,
    max_run_duration: ApiDuration,
}

/// int64 fields are strings on the wire.
#[derive(Debug, Serialize)]
struct ApiDuration {
    seconds: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ListInstancesRequest {
    instance_state: &'static str,
}

#[derive(Debug, Serialize)]
struct AddInstancesRequest {
    instances: Vec<InstanceReference>,
}

#[derive(Debug, Serialize)]
struct InstanceReference {
    instance: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstanceGroupInstances {
    #[serde(default)]
    items: Vec<InstanceWithStatus>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InstanceWithStatus {
    #[serde(default)]
    status: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Operation {
    name: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    target_link: Option<String>,
    #[serde(default)]
    error: Option<OperationErrors>,
}

#[derive(Debug, Default, Deserialize)]
struct OperationErrors {
    #[serde(default)]
    errors: Vec<OperationErrorEntry>,
}

#[derive(Debug, Deserialize)]
struct OperationErrorEntry {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

impl Operation {
    fn observation(&self) -> OperationObservation {
        let issues = self
            .error
            .as_ref()
            .map(|e| {
                e.errors
                    .iter()
                    .map(|entry| OperationIssue {
                        code: entry.code.clone(),
                        message: entry.message.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();

        OperationObservation {
            status: OperationStatus::parse(&self.status),
            issues,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_observation() {
        let json = r#"{
            "kind": "compute#operation",
            "name": "operation-1700000000000-abc",
            "operationType": "insert",
            "status": "DONE",
            "targetLink": "https://www.googleapis.com/compute/v1/projects/p/zones/z/instances/agent-a1b2c3",
            "error": {
                "errors": [
                    {"code": "QUOTA_EXCEEDED", "message": "Quota 'CPUS' exceeded."}
                ]
            }
        }"#;

        let op: Operation = serde_json::from_str(json).unwrap();
        let observation = op.observation();

        assert_eq!(observation.status, OperationStatus::Done);
        assert_eq!(observation.issues.len(), 1);
        assert_eq!(observation.issues[0].code, "QUOTA_EXCEEDED");
        assert!(op.target_link.unwrap().ends_with("/instances/agent-a1b2c3"));
    }

    #[test]
    fn test_operation_without_error() {
        let op: Operation =
            serde_json::from_str(r#"{"name": "operation-2", "status": "RUNNING"}"#).unwrap();
        let observation = op.observation();

        assert_eq!(observation.status, OperationStatus::Running);
        assert!(observation.issues.is_empty());
    }

    #[test]
    fn test_insert_body_serialization() {
        let body = InstanceInsert {
            name: "agent-a1b2c3".to_string(),
            scheduling: Scheduling {
                instance_termination_action: "DELETE",
                max_run_duration: ApiDuration {
                    seconds: 3600.to_string(),
                },
            },
        };

        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "name": "agent-a1b2c3",
                "scheduling": {
                    "instanceTerminationAction": "DELETE",
                    "maxRunDuration": {"seconds": "3600"}
                }
            })
        );
    }
}
