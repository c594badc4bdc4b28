//! Scaleway implementation of [`CloudProvider`].
//!
//! Image lookups and server actions go through `scaleway_rs`. Listings,
//! creation, user data, and the Load Balancer and IAM endpoints are called
//! directly over a shared HTTP client. Every listing covers all zones in the
//! region of the configured default zone.

mod catalog;
mod error;
mod image;
mod lb;
mod servers;
mod types;

use std::future::Future;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use reqwest::{RequestBuilder, StatusCode};
use scaleway_rs::ScalewayApi;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::config::ScalewayConfig;
use crate::instance::{Instance, InstanceState};
use crate::join::Join;
use crate::provider::{
    CloudProvider, CreateSpec, LoadBalancerMember, ProviderError, ProviderFuture, Tag,
};
use types::Page;

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const API_BASE: &str = "https://api.scaleway.com";
const PER_PAGE: usize = 100;

static HTTP_CLIENT: LazyLock<reqwest::Client> = LazyLock::new(|| {
    reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
});

/// Provider backed by the Scaleway Instances, Load Balancer, and IAM APIs.
#[derive(Clone)]
pub struct ScalewayProvider {
    api: ScalewayApi,
    config: Arc<ScalewayConfig>,
}

impl ScalewayProvider {
    /// Constructs a provider from a profile.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Config`] when the profile fails validation.
    pub fn new(config: ScalewayConfig) -> Result<Self, ProviderError> {
        config.validate()?;
        Ok(Self {
            api: ScalewayApi::new(&config.secret_key),
            config: Arc::new(config),
        })
    }

    fn zones(&self) -> Vec<String> {
        types::sibling_zones(&self.config.default_zone)
    }

    /// Runs `fetch` once per zone concurrently and concatenates the results
    /// in zone order.
    async fn across_zones<T, F, Fut>(&self, fetch: F) -> Result<Vec<T>, ProviderError>
    where
        T: Send + 'static,
        F: Fn(Self, String) -> Fut,
        Fut: Future<Output = Result<Vec<T>, ProviderError>> + Send + 'static,
    {
        let join = Join::new();
        for zone in self.zones() {
            join.spawn(fetch(self.clone(), zone));
        }
        Ok(join.wait().await?.into_iter().flatten().collect())
    }

    async fn send_raw(&self, request: RequestBuilder) -> Result<(StatusCode, Vec<u8>), ProviderError> {
        let response = request
            .header("X-Auth-Token", &self.config.secret_key)
            .send()
            .await
            .map_err(|err| error::transport(&err))?;
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|err| error::transport(&err))?;
        Ok((status, body.to_vec()))
    }

    async fn send(&self, request: RequestBuilder) -> Result<Vec<u8>, ProviderError> {
        let (status, body) = self.send_raw(request).await?;
        if status.is_success() {
            Ok(body)
        } else {
            Err(error::response_failure(status, &body))
        }
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
    ) -> Result<T, ProviderError> {
        let body = self.send(request).await?;
        serde_json::from_slice(&body).map_err(|err| error::decode(&err))
    }

    /// Fetches every page of a listing.
    async fn list_all<P>(&self, url: &str) -> Result<Vec<P::Item>, ProviderError>
    where
        P: Page + DeserializeOwned,
    {
        let mut items = Vec::new();
        for page in 1_usize.. {
            let listing: P = self
                .send_json(HTTP_CLIENT.get(url).query(&[("page", page), ("per_page", PER_PAGE)]))
                .await?;
            let total = listing.total_count();
            let batch = listing.into_items();
            let fetched = batch.len();
            items.extend(batch);
            let exhausted = total.map_or(fetched < PER_PAGE, |count| {
                items.len() >= usize::try_from(count).unwrap_or(usize::MAX)
            });
            if exhausted || fetched == 0 {
                break;
            }
        }
        debug!(url, count = items.len(), "listed resources");
        Ok(items)
    }
}

impl CloudProvider for ScalewayProvider {
    fn list_instances(&self) -> ProviderFuture<'_, Vec<Instance>> {
        Box::pin(async move {
            let servers = self
                .across_zones(|provider, zone| async move { provider.list_servers(&zone).await })
                .await?;
            Ok(servers
                .into_iter()
                .map(types::Server::into_instance)
                .collect())
        })
    }

    fn list_zones(&self) -> ProviderFuture<'_, Vec<String>> {
        Box::pin(async move { Ok(self.zones()) })
    }

    fn list_security_groups(&self) -> ProviderFuture<'_, Vec<String>> {
        Box::pin(async move { self.security_group_names().await })
    }

    fn list_key_pairs(&self) -> ProviderFuture<'_, Vec<String>> {
        Box::pin(async move { self.ssh_key_names().await })
    }

    fn list_roles(&self) -> ProviderFuture<'_, Vec<String>> {
        Box::pin(async move { self.role_names().await })
    }

    fn list_load_balancers(&self) -> ProviderFuture<'_, Vec<String>> {
        Box::pin(async move { self.load_balancer_names().await })
    }

    fn load_balancer_attribution(&self) -> ProviderFuture<'_, Vec<LoadBalancerMember>> {
        Box::pin(async move { self.load_balancer_members().await })
    }

    fn load_balancer_zones<'a>(&'a self, name: &'a str) -> ProviderFuture<'a, Vec<String>> {
        Box::pin(async move { self.zones_of_load_balancer(name).await })
    }

    fn resolve_image<'a>(
        &'a self,
        image: &'a str,
        zone: Option<&'a str>,
    ) -> ProviderFuture<'a, String> {
        Box::pin(async move { self.resolve_image_id(image, zone).await })
    }

    fn create_instances<'a>(&'a self, spec: &'a CreateSpec) -> ProviderFuture<'a, Vec<String>> {
        Box::pin(async move { self.create_servers(spec).await })
    }

    fn tag_resources<'a>(&'a self, ids: &'a [String], tags: &'a [Tag]) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            for id in ids {
                self.tag_server(id, tags).await?;
            }
            Ok(())
        })
    }

    fn describe_boot_payload<'a>(&'a self, id: &'a str) -> ProviderFuture<'a, Option<String>> {
        Box::pin(async move { self.boot_payload(id).await })
    }

    fn terminate_instance<'a>(&'a self, id: &'a str) -> ProviderFuture<'a, InstanceState> {
        Box::pin(async move { self.terminate_server(id).await })
    }

    fn register_with_load_balancer<'a>(
        &'a self,
        name: &'a str,
        ids: &'a [String],
    ) -> ProviderFuture<'a, ()> {
        Box::pin(async move { self.register_servers(name, ids).await })
    }
}
