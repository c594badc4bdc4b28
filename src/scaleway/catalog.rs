//! Names of the resources a launch may reference.

use super::types::{NamedResource, ROLE_TAG_PREFIX, SecurityGroupPage, Server, SshKeyPage};
use super::{API_BASE, ScalewayProvider};
use crate::provider::ProviderError;

/// Sorts and removes duplicates, dropping blank names.
pub(crate) fn unique_sorted(names: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut unique: Vec<String> = names
        .into_iter()
        .filter(|name| !name.trim().is_empty())
        .collect();
    unique.sort();
    unique.dedup();
    unique
}

pub(crate) fn roles_of(servers: &[Server]) -> Vec<String> {
    unique_sorted(
        servers
            .iter()
            .filter_map(|server| server.tag_value(ROLE_TAG_PREFIX))
            .map(str::to_owned),
    )
}

impl ScalewayProvider {
    pub(crate) async fn security_groups_in(
        &self,
        zone: &str,
    ) -> Result<Vec<NamedResource>, ProviderError> {
        let url = format!(
            "{API_BASE}/instance/v1/zones/{zone}/security_groups?project={}",
            self.config.default_project_id
        );
        self.list_all::<SecurityGroupPage>(&url).await
    }

    pub(crate) async fn security_group_names(&self) -> Result<Vec<String>, ProviderError> {
        let groups = self
            .across_zones(|provider, zone| async move { provider.security_groups_in(&zone).await })
            .await?;
        Ok(unique_sorted(groups.into_iter().map(|group| group.name)))
    }

    pub(crate) async fn ssh_key_names(&self) -> Result<Vec<String>, ProviderError> {
        let url = format!(
            "{API_BASE}/iam/v1alpha1/ssh-keys?project_id={}",
            self.config.default_project_id
        );
        let keys = self.list_all::<SshKeyPage>(&url).await?;
        Ok(unique_sorted(keys.into_iter().map(|key| key.name)))
    }

    /// Roles are recorded as `role=` tags, so the known roles are the ones
    /// in use across the fleet.
    pub(crate) async fn role_names(&self) -> Result<Vec<String>, ProviderError> {
        let servers = self
            .across_zones(|provider, zone| async move { provider.list_servers(&zone).await })
            .await?;
        Ok(roles_of(&servers))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_sorted_and_unique() {
        let names = ["web-sg", "default", "", "web-sg", " "].map(String::from);

        assert_eq!(unique_sorted(names), ["default", "web-sg"]);
    }

    #[test]
    fn roles_come_from_role_tags() {
        let servers: Vec<Server> = serde_json::from_str(
            r#"[
                {"id": "a", "state": "running", "zone": "fr-par-1",
                 "creation_date": "2024-05-01T10:00:00Z", "tags": ["role=web", "key=deploy"]},
                {"id": "b", "state": "running", "zone": "fr-par-2",
                 "creation_date": "2024-05-01T10:00:00Z", "tags": ["role=db"]},
                {"id": "c", "state": "stopped", "zone": "fr-par-1",
                 "creation_date": "2024-05-01T10:00:00Z", "tags": ["role=web"]}
            ]"#,
        )
        .expect("servers parse");

        assert_eq!(roles_of(&servers), ["db", "web"]);
    }
}
