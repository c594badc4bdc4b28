//! Server listing, creation, tagging, user data, and termination.
//!
//! Servers are created stopped so their boot payload is in place before
//! the first boot, then powered on.

use reqwest::StatusCode;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::types::{
    KEY_TAG_PREFIX, ROLE_TAG_PREFIX, Server, ServerEnvelope, ServerPage, ServerRef, map_state,
};
use super::{API_BASE, HTTP_CLIENT, ScalewayProvider, error};
use crate::instance::InstanceState;
use crate::payload;
use crate::provider::{CreateSpec, ProviderError, Tag};

/// Tag marking servers created by this tool.
pub(crate) const FLEET_TAG: &str = "armada";
/// User-data key consumed by cloud-init on first boot.
pub(crate) const CLOUD_INIT_USER_DATA_KEY: &str = "cloud-init";
const NAME_TAG: &str = "Name";

#[derive(Debug, Serialize)]
pub(crate) struct CreateServerRequest {
    pub(crate) name: String,
    pub(crate) commercial_type: String,
    pub(crate) image: String,
    pub(crate) project: String,
    pub(crate) routed_ip_enabled: bool,
    pub(crate) dynamic_ip_required: bool,
    pub(crate) tags: Vec<String>,
    pub(crate) stopped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) security_group: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) organization: Option<String>,
}

#[derive(Debug, Default, Serialize)]
struct UpdateServerRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tags: Option<Vec<String>>,
}

pub(crate) fn servers_url(zone: &str) -> String {
    format!("{API_BASE}/instance/v1/zones/{zone}/servers")
}

fn server_url(server: &ServerRef) -> String {
    format!("{}/{}", servers_url(&server.zone), server.id)
}

pub(crate) fn user_data_url(server: &ServerRef, key: &str) -> String {
    format!("{}/user_data/{key}", server_url(server))
}

/// Tags recorded on a new server.
pub(crate) fn launch_tags(spec: &CreateSpec) -> Vec<String> {
    let mut tags = vec![String::from(FLEET_TAG)];
    if let Some(key) = &spec.key_name {
        tags.push(format!("{KEY_TAG_PREFIX}{key}"));
    }
    if let Some(role) = &spec.iam_role {
        tags.push(format!("{ROLE_TAG_PREFIX}{role}"));
    }
    tags
}

/// Merges `key=value` tags into `existing`, replacing earlier values for
/// the same key.
pub(crate) fn merge_tags(existing: &[String], tags: &[Tag]) -> Vec<String> {
    let mut merged: Vec<String> = existing
        .iter()
        .filter(|current| {
            !tags
                .iter()
                .any(|tag| current.strip_prefix(&tag.key).is_some_and(|rest| rest.starts_with('=')))
        })
        .cloned()
        .collect();
    merged.extend(tags.iter().map(|tag| format!("{}={}", tag.key, tag.value)));
    merged
}

impl ScalewayProvider {
    pub(crate) async fn list_servers(&self, zone: &str) -> Result<Vec<Server>, ProviderError> {
        let url = format!(
            "{}?project={}",
            servers_url(zone),
            self.config.default_project_id
        );
        self.list_all::<ServerPage>(&url).await
    }

    /// Fetches one server; `None` when it no longer exists.
    pub(crate) async fn fetch_server(&self, server: &ServerRef) -> Result<Option<Server>, ProviderError> {
        let (status, body) = self.send_raw(HTTP_CLIENT.get(server_url(server))).await?;
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(error::response_failure(status, &body));
        }
        let envelope: ServerEnvelope =
            serde_json::from_slice(&body).map_err(|err| error::decode(&err))?;
        Ok(Some(envelope.server))
    }

    async fn security_group_id(&self, zone: &str, name: &str) -> Result<String, ProviderError> {
        self.security_groups_in(zone)
            .await?
            .into_iter()
            .find(|group| group.name == name || group.id == name)
            .map(|group| group.id)
            .ok_or_else(|| ProviderError::not_found("security group", name))
    }

    pub(crate) async fn create_servers(&self, spec: &CreateSpec) -> Result<Vec<String>, ProviderError> {
        let zone = spec.zone.as_deref().unwrap_or(&self.config.default_zone);
        let user_data = spec
            .boot_payload_base64
            .as_deref()
            .map(payload::decode)
            .transpose()
            .map_err(|err| ProviderError::Decode {
                message: err.to_string(),
            })?;
        let security_group = match spec.security_groups.as_slice() {
            [] => None,
            [first, rest @ ..] => {
                if !rest.is_empty() {
                    warn!(
                        used = %first,
                        ignored = rest.len(),
                        "servers accept one security group; extra groups ignored"
                    );
                }
                Some(self.security_group_id(zone, first).await?)
            }
        };

        let mut created = Vec::new();
        for _ in 0..spec.count {
            let request = CreateServerRequest {
                name: format!("{FLEET_TAG}-{}", Uuid::new_v4().simple()),
                commercial_type: spec
                    .instance_type
                    .clone()
                    .unwrap_or_else(|| self.config.default_instance_type.clone()),
                image: spec.image_id.clone(),
                project: self.config.default_project_id.clone(),
                routed_ip_enabled: true,
                dynamic_ip_required: true,
                tags: launch_tags(spec),
                stopped: true,
                security_group: security_group.clone(),
                organization: self.config.default_organization_id.clone(),
            };
            let envelope: ServerEnvelope = match self
                .send_json(HTTP_CLIENT.post(servers_url(zone)).json(&request))
                .await
            {
                Ok(envelope) => envelope,
                Err(err) => return Err(ProviderError::partial_create(created, err)),
            };
            let server = ServerRef::new(zone, &envelope.server.id);
            created.push(server.to_string());
            if let Err(err) = self.boot_server(&server, user_data.as_deref()).await {
                return Err(ProviderError::partial_create(created, err));
            }
            info!(id = %server, image = %spec.image_id, "created server");
        }
        Ok(created)
    }

    async fn boot_server(
        &self,
        server: &ServerRef,
        user_data: Option<&[u8]>,
    ) -> Result<(), ProviderError> {
        if let Some(data) = user_data {
            self.send(
                HTTP_CLIENT
                    .patch(user_data_url(server, CLOUD_INIT_USER_DATA_KEY))
                    .header(reqwest::header::CONTENT_TYPE, "text/plain")
                    .body(data.to_vec()),
            )
            .await?;
        }
        self.api
            .perform_instance_action_async(&server.zone, &server.id, "poweron")
            .await?;
        Ok(())
    }

    pub(crate) async fn tag_server(&self, id: &str, tags: &[Tag]) -> Result<(), ProviderError> {
        let server = ServerRef::parse(id, &self.config.default_zone)?;
        let name = tags
            .iter()
            .rev()
            .find(|tag| tag.key == NAME_TAG)
            .map(|tag| tag.value.clone());
        let others: Vec<Tag> = tags
            .iter()
            .filter(|tag| tag.key != NAME_TAG)
            .cloned()
            .collect();
        let tag_list = if others.is_empty() {
            None
        } else {
            let current = self
                .fetch_server(&server)
                .await?
                .ok_or_else(|| ProviderError::not_found("server", id))?;
            Some(merge_tags(&current.tags, &others))
        };
        if name.is_none() && tag_list.is_none() {
            return Ok(());
        }
        let update = UpdateServerRequest {
            name,
            tags: tag_list,
        };
        self.send(HTTP_CLIENT.patch(server_url(&server)).json(&update))
            .await?;
        debug!(id = %server, "tagged server");
        Ok(())
    }

    pub(crate) async fn boot_payload(&self, id: &str) -> Result<Option<String>, ProviderError> {
        let server = ServerRef::parse(id, &self.config.default_zone)?;
        let (status, body) = self
            .send_raw(HTTP_CLIENT.get(user_data_url(&server, CLOUD_INIT_USER_DATA_KEY)))
            .await?;
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(error::response_failure(status, &body));
        }
        Ok((!body.is_empty()).then(|| payload::encode(&body)))
    }

    pub(crate) async fn terminate_server(&self, id: &str) -> Result<InstanceState, ProviderError> {
        let server = ServerRef::parse(id, &self.config.default_zone)?;
        self.api
            .perform_instance_action_async(&server.zone, &server.id, "terminate")
            .await?;
        let state = self
            .fetch_server(&server)
            .await?
            .map_or(InstanceState::Terminated, |current| {
                match map_state(&current.state) {
                    InstanceState::Running | InstanceState::Stopped => {
                        InstanceState::ShuttingDown
                    }
                    other => other,
                }
            });
        info!(id = %server, %state, "terminated server");
        Ok(state)
    }
}
