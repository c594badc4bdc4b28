//! Load balancer listing, membership, and registration.
//!
//! Scaleway load balancers route to backends whose pools hold server
//! addresses, so membership is reported by address.

use serde::Serialize;
use tracing::info;

use super::catalog::unique_sorted;
use super::types::{Backend, BackendPage, LoadBalancer, LoadBalancerPage, ServerRef};
use super::{API_BASE, HTTP_CLIENT, ScalewayProvider};
use crate::join::Join;
use crate::provider::{LoadBalancerMember, ProviderError};

#[derive(Debug, Serialize)]
struct AddBackendServers<'a> {
    server_ip: &'a [String],
}

/// Pairs every pool address with its load balancer.
pub(crate) fn members_of(load_balancer: &str, backends: &[Backend]) -> Vec<LoadBalancerMember> {
    backends
        .iter()
        .flat_map(|backend| backend.pool.iter())
        .map(|address| LoadBalancerMember {
            load_balancer: load_balancer.to_owned(),
            member: address.clone(),
        })
        .collect()
}

fn backend_servers_url(zone: &str, backend_id: &str) -> String {
    format!("{API_BASE}/lb/v1/zones/{zone}/backends/{backend_id}/servers")
}

impl ScalewayProvider {
    async fn load_balancers_in(&self, zone: &str) -> Result<Vec<LoadBalancer>, ProviderError> {
        let url = format!(
            "{API_BASE}/lb/v1/zones/{zone}/lbs?project_id={}",
            self.config.default_project_id
        );
        let mut found = self.list_all::<LoadBalancerPage>(&url).await?;
        for lb in &mut found {
            if lb.zone.is_empty() {
                zone.clone_into(&mut lb.zone);
            }
        }
        Ok(found)
    }

    async fn all_load_balancers(&self) -> Result<Vec<LoadBalancer>, ProviderError> {
        self.across_zones(|provider, zone| async move { provider.load_balancers_in(&zone).await })
            .await
    }

    async fn backends_of(&self, lb: &LoadBalancer) -> Result<Vec<Backend>, ProviderError> {
        let url = format!(
            "{API_BASE}/lb/v1/zones/{}/lbs/{}/backends",
            lb.zone, lb.id
        );
        self.list_all::<BackendPage>(&url).await
    }

    async fn named_load_balancers(&self, name: &str) -> Result<Vec<LoadBalancer>, ProviderError> {
        let matching: Vec<LoadBalancer> = self
            .all_load_balancers()
            .await?
            .into_iter()
            .filter(|lb| lb.name == name)
            .collect();
        if matching.is_empty() {
            return Err(ProviderError::not_found("load balancer", name));
        }
        Ok(matching)
    }

    pub(crate) async fn load_balancer_names(&self) -> Result<Vec<String>, ProviderError> {
        let lbs = self.all_load_balancers().await?;
        Ok(unique_sorted(lbs.into_iter().map(|lb| lb.name)))
    }

    pub(crate) async fn load_balancer_members(
        &self,
    ) -> Result<Vec<LoadBalancerMember>, ProviderError> {
        let join = Join::new();
        for lb in self.all_load_balancers().await? {
            let provider = self.clone();
            join.spawn(async move {
                let backends = provider.backends_of(&lb).await?;
                Ok(members_of(&lb.name, &backends))
            });
        }
        Ok(join.wait().await?.into_iter().flatten().collect())
    }

    pub(crate) async fn zones_of_load_balancer(
        &self,
        name: &str,
    ) -> Result<Vec<String>, ProviderError> {
        let lbs = self.named_load_balancers(name).await?;
        Ok(unique_sorted(lbs.into_iter().map(|lb| lb.zone)))
    }

    /// Adds the servers' addresses to every backend of the named load
    /// balancer.
    pub(crate) async fn register_servers(
        &self,
        name: &str,
        ids: &[String],
    ) -> Result<(), ProviderError> {
        let mut addresses = Vec::new();
        for id in ids {
            let server = ServerRef::parse(id, &self.config.default_zone)?;
            let current = self
                .fetch_server(&server)
                .await?
                .ok_or_else(|| ProviderError::not_found("server", id.as_str()))?;
            let address = current
                .private_ip
                .clone()
                .or_else(|| current.public_address().map(str::to_owned))
                .ok_or_else(|| ProviderError::not_found("server address", id.as_str()))?;
            addresses.push(address);
        }

        let mut registered = false;
        for lb in self.named_load_balancers(name).await? {
            for backend in self.backends_of(&lb).await? {
                self.send(
                    HTTP_CLIENT
                        .post(backend_servers_url(&lb.zone, &backend.id))
                        .json(&AddBackendServers {
                            server_ip: &addresses,
                        }),
                )
                .await?;
                registered = true;
            }
        }
        if !registered {
            return Err(ProviderError::not_found("load balancer backend", name));
        }
        info!(load_balancer = name, count = addresses.len(), "registered servers");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn members_are_reported_by_pool_address() {
        let backends = vec![
            Backend {
                id: String::from("b1"),
                pool: vec![String::from("10.0.0.1"), String::from("10.0.0.2")],
            },
            Backend {
                id: String::from("b2"),
                pool: vec![String::from("10.0.0.3")],
            },
        ];

        let members = members_of("front", &backends);

        let addresses: Vec<_> = members.iter().map(|entry| entry.member.as_str()).collect();
        assert_eq!(addresses, ["10.0.0.1", "10.0.0.2", "10.0.0.3"]);
        assert!(members.iter().all(|entry| entry.load_balancer == "front"));
    }

    #[test]
    fn backend_registration_targets_the_zone() {
        assert_eq!(
            backend_servers_url("fr-par-2", "b1"),
            "https://api.scaleway.com/lb/v1/zones/fr-par-2/backends/b1/servers"
        );
    }

    #[test]
    fn registration_body_lists_addresses() {
        let addresses = vec![String::from("10.0.0.9")];

        let json = serde_json::to_string(&AddBackendServers {
            server_ip: &addresses,
        })
        .expect("serialise body");

        assert_eq!(json, r#"{"server_ip":["10.0.0.9"]}"#);
    }
}
