//! Filter resolution over the provider inventory.
//!
//! The directory fetches the inventory and, when requested, the load
//! balancer membership concurrently, merges the two, applies the filter,
//! and orders the result for display.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::instance::{Filter, Instance, sort_instances};
use crate::join::Join;
use crate::provider::{CloudProvider, LoadBalancerMember, ProviderError, ProviderFuture};

/// Options controlling [`InstanceDirectory::resolve`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ResolveOptions {
    /// Drop instances that are not running, after sorting.
    pub running_only: bool,
    /// Fetch load balancer membership and attach it to each instance.
    pub load_balancers: bool,
}

impl ResolveOptions {
    /// Options that keep only running instances.
    #[must_use]
    pub const fn running() -> Self {
        Self {
            running_only: true,
            load_balancers: false,
        }
    }

    /// Enables load balancer attribution.
    #[must_use]
    pub const fn with_load_balancers(mut self) -> Self {
        self.load_balancers = true;
        self
    }
}

/// Names of the resources a launch can reference.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct Capabilities {
    /// Availability zones.
    pub zones: Vec<String>,
    /// SSH key pair names.
    pub key_names: Vec<String>,
    /// Security group names.
    pub security_groups: Vec<String>,
    /// Role names.
    pub iam_roles: Vec<String>,
    /// Load balancer names.
    pub load_balancers: Vec<String>,
}

enum Lookup {
    Inventory(Vec<Instance>),
    Attribution(Vec<LoadBalancerMember>),
}

type ListLookup<P> = for<'a> fn(&'a P) -> ProviderFuture<'a, Vec<String>>;

/// Resolves filters into ordered instance records.
pub struct InstanceDirectory<P> {
    provider: Arc<P>,
}

impl<P> Clone for InstanceDirectory<P> {
    fn clone(&self) -> Self {
        Self {
            provider: Arc::clone(&self.provider),
        }
    }
}

impl<P: CloudProvider> InstanceDirectory<P> {
    /// Wraps a shared provider.
    #[must_use]
    pub const fn new(provider: Arc<P>) -> Self {
        Self { provider }
    }

    /// The underlying provider.
    #[must_use]
    pub const fn provider(&self) -> &Arc<P> {
        &self.provider
    }

    /// Resolves `filter` into matching instances, best first.
    ///
    /// # Errors
    ///
    /// Returns the first [`ProviderError`] raised by either lookup.
    pub async fn resolve(
        &self,
        filter: &Filter,
        options: ResolveOptions,
    ) -> Result<Vec<Instance>, ProviderError> {
        let join = Join::new();
        let inventory = Arc::clone(&self.provider);
        join.spawn(async move { inventory.list_instances().await.map(Lookup::Inventory) });
        if options.load_balancers {
            let attribution = Arc::clone(&self.provider);
            join.spawn(async move {
                attribution
                    .load_balancer_attribution()
                    .await
                    .map(Lookup::Attribution)
            });
        }

        let mut instances = Vec::new();
        let mut members = Vec::new();
        for lookup in join.wait().await? {
            match lookup {
                Lookup::Inventory(found) => instances = found,
                Lookup::Attribution(found) => members = found,
            }
        }

        attribute_load_balancers(&mut instances, &members);
        instances.retain(|instance| filter.matches(instance));
        sort_instances(&mut instances);
        if options.running_only {
            instances.retain(Instance::is_running);
        }
        debug!(%filter, matched = instances.len(), "resolved filter");
        Ok(instances)
    }

    /// Returns the best match for `filter`, if any.
    ///
    /// # Errors
    ///
    /// Propagates [`ProviderError`] from the inventory lookup.
    pub async fn first(
        &self,
        filter: &Filter,
        options: ResolveOptions,
    ) -> Result<Option<Instance>, ProviderError> {
        Ok(self.resolve(filter, options).await?.into_iter().next())
    }

    /// Public addresses of the running instances matching `filter`, in
    /// display order.
    ///
    /// # Errors
    ///
    /// Propagates [`ProviderError`] from the inventory lookup.
    pub async fn hostnames(&self, filter: &Filter) -> Result<Vec<String>, ProviderError> {
        let instances = self.resolve(filter, ResolveOptions::running()).await?;
        Ok(instances
            .iter()
            .filter_map(Instance::hostname)
            .map(str::to_owned)
            .collect())
    }

    /// Describes the zones, keys, groups, roles, and load balancers
    /// available for launches. All five lookups run concurrently and the
    /// first failure wins.
    ///
    /// # Errors
    ///
    /// Returns the first [`ProviderError`] raised by any lookup.
    pub async fn describe_capabilities(&self) -> Result<Capabilities, ProviderError> {
        let lookups: [ListLookup<P>; 5] = [
            P::list_zones,
            P::list_key_pairs,
            P::list_security_groups,
            P::list_roles,
            P::list_load_balancers,
        ];
        let join = Join::new();
        for lookup in lookups {
            let provider = Arc::clone(&self.provider);
            join.spawn(async move { lookup(provider.as_ref()).await });
        }

        let mut lists = join.wait().await?.into_iter();
        Ok(Capabilities {
            zones: lists.next().unwrap_or_default(),
            key_names: lists.next().unwrap_or_default(),
            security_groups: lists.next().unwrap_or_default(),
            iam_roles: lists.next().unwrap_or_default(),
            load_balancers: lists.next().unwrap_or_default(),
        })
    }
}

fn attribute_load_balancers(instances: &mut [Instance], members: &[LoadBalancerMember]) {
    if members.is_empty() {
        return;
    }
    let by_member: HashMap<&str, &str> = members
        .iter()
        .map(|entry| (entry.member.as_str(), entry.load_balancer.as_str()))
        .collect();
    for instance in instances {
        let found = [
            Some(instance.id.as_str()),
            instance.public_address.as_deref(),
            instance.private_address.as_deref(),
        ]
        .into_iter()
        .flatten()
        .find_map(|key| by_member.get(key));
        if let Some(name) = found {
            instance.load_balancer = Some((*name).to_owned());
        }
    }
}
