//! Launches named instances, cloning configuration from existing ones.
//!
//! A launch accumulates its configuration in a [`LaunchRequest`]: caller
//! options first, then attributes copied from a template instance, then a
//! zone chosen from the load balancer's zones, then the resolved image.
//! The frozen request becomes one creation call. Created instances are
//! tagged with their name, registered with the load balancer, and
//! optionally polled until they run. Every step is fail-fast and nothing is
//! rolled back.

use std::time::Duration;

use rand::Rng;
use rand::seq::SliceRandom;
use thiserror::Error;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use crate::directory::{InstanceDirectory, ResolveOptions};
use crate::instance::{Filter, Instance, InstanceName, InstanceState};
use crate::payload::{self, PayloadError};
use crate::provider::{CloudProvider, CreateSpec, ProviderError, Tag};

/// Delay between readiness polls while waiting for a launch.
pub const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(2000);

/// Where launch defaults come from.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub enum Defaults {
    /// Do not inherit anything.
    Disabled,
    /// Inherit from the best existing instance matching the launch name.
    #[default]
    FromTarget,
    /// Inherit from the best instance matching this filter.
    From(Filter),
}

impl Defaults {
    fn template_filter(&self, name: &str) -> Option<Filter> {
        match self {
            Self::Disabled => None,
            Self::FromTarget => Some(Filter::named(&InstanceName::parse(name))),
            Self::From(filter) => Some(filter.clone()),
        }
    }
}

/// Caller supplied launch options.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct LaunchOptions {
    /// Image identifier or label.
    pub image: Option<String>,
    /// Commercial type.
    pub instance_type: Option<String>,
    /// Placement zone.
    pub zone: Option<String>,
    /// SSH key pair name.
    pub key_name: Option<String>,
    /// Security group name.
    pub security_group: Option<String>,
    /// Role to attach.
    pub iam_role: Option<String>,
    /// Load balancer to register with.
    pub load_balancer: Option<String>,
    /// Boot payload bytes.
    pub boot_payload: Option<Vec<u8>>,
    /// Number of instances; defaults to one.
    pub count: Option<u32>,
    /// Poll until the first instance is running.
    pub wait: bool,
    /// Template selection.
    pub defaults: Defaults,
}

/// Launch configuration accumulated across the launch stages.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct LaunchRequest {
    /// Image identifier or label.
    pub image: Option<String>,
    /// Commercial type.
    pub instance_type: Option<String>,
    /// Placement zone.
    pub zone: Option<String>,
    /// SSH key pair name.
    pub key_name: Option<String>,
    /// Security group name.
    pub security_group: Option<String>,
    /// Role to attach.
    pub iam_role: Option<String>,
    /// Load balancer to register with.
    pub load_balancer: Option<String>,
    /// Boot payload bytes.
    pub boot_payload: Option<Vec<u8>>,
    /// Number of instances.
    pub count: u32,
}

impl LaunchRequest {
    /// Starts a request from caller options.
    ///
    /// # Errors
    ///
    /// Returns [`LaunchError::InvalidCount`] when `count` is zero.
    pub fn from_options(options: &LaunchOptions) -> Result<Self, LaunchError> {
        let count = options.count.unwrap_or(1);
        if count == 0 {
            return Err(LaunchError::InvalidCount);
        }
        Ok(Self {
            image: options.image.clone(),
            instance_type: options.instance_type.clone(),
            zone: options.zone.clone(),
            key_name: options.key_name.clone(),
            security_group: options.security_group.clone(),
            iam_role: options.iam_role.clone(),
            load_balancer: options.load_balancer.clone(),
            boot_payload: options.boot_payload.clone(),
            count,
        })
    }

    /// Copies descriptive attributes from `template` into fields the caller
    /// left unset. The template's zone is never copied.
    pub fn inherit(&mut self, template: &Instance) {
        fill(&mut self.image, template.image_id.as_deref());
        fill(&mut self.instance_type, template.instance_type.as_deref());
        fill(&mut self.key_name, template.key_name.as_deref());
        fill(&mut self.security_group, template.security_group.as_deref());
        fill(&mut self.iam_role, template.iam_role.as_deref());
        fill(&mut self.load_balancer, template.load_balancer.as_deref());
    }

    /// Picks a zone uniformly from `zones` when none was chosen.
    pub fn choose_zone<R: Rng + ?Sized>(&mut self, zones: &[String], rng: &mut R) {
        if self.zone.is_none() {
            self.zone = zones.choose(rng).cloned();
        }
    }

    /// Freezes the request into a creation spec.
    #[must_use]
    pub fn freeze(&self, image_id: String) -> CreateSpec {
        CreateSpec {
            image_id,
            count: self.count,
            key_name: self.key_name.clone(),
            security_groups: self.security_group.iter().cloned().collect(),
            boot_payload_base64: self.boot_payload.as_deref().map(payload::encode),
            instance_type: self.instance_type.clone(),
            zone: self.zone.clone(),
            iam_role: self.iam_role.clone(),
        }
    }
}

fn fill(slot: &mut Option<String>, inherited: Option<&str>) {
    if slot.is_none() {
        *slot = inherited.map(str::to_owned);
    }
}

/// Errors raised while launching.
#[derive(Debug, Error)]
pub enum LaunchError {
    /// The launch name was empty.
    #[error("a name is required to launch instances")]
    MissingName,
    /// No image was given or inherited.
    #[error("an image is required")]
    MissingImage,
    /// A count of zero was requested.
    #[error("instance count must be at least one")]
    InvalidCount,
    /// The template lookup failed.
    #[error("failed to look up launch defaults: {0}")]
    Template(#[source] ProviderError),
    /// The template's boot payload could not be read.
    #[error("failed to read the template boot payload: {0}")]
    BootPayload(#[source] PayloadError),
    /// The load balancer's zones could not be listed.
    #[error("failed to list zones for load balancer {load_balancer}: {source}")]
    Zone {
        /// Load balancer name.
        load_balancer: String,
        /// Provider error.
        #[source]
        source: ProviderError,
    },
    /// The image reference could not be resolved.
    #[error("failed to resolve image {image}: {source}")]
    Image {
        /// Image reference.
        image: String,
        /// Provider error.
        #[source]
        source: ProviderError,
    },
    /// The creation call failed. Instances created before the failure are
    /// listed in `created` and left in place.
    #[error("failed to create instances: {source}{}", left_in_place(.created))]
    Create {
        /// Instances created before the failure.
        created: Vec<String>,
        /// Provider error.
        #[source]
        source: ProviderError,
    },
    /// The creation call returned no identifiers.
    #[error("the provider created no instances")]
    NothingCreated,
    /// Tagging failed; the instances were left in place.
    #[error("failed to tag instances {}: {source}", .ids.join(", "))]
    Tag {
        /// Created instance ids.
        ids: Vec<String>,
        /// Provider error.
        #[source]
        source: ProviderError,
    },
    /// Load balancer registration failed; the instances were left in place.
    #[error("failed to register instances with {load_balancer}: {source}")]
    Register {
        /// Load balancer name.
        load_balancer: String,
        /// Provider error.
        #[source]
        source: ProviderError,
    },
    /// Reading the instance back failed.
    #[error("failed to read back instance {id}: {source}")]
    Poll {
        /// Instance id.
        id: String,
        /// Provider error.
        #[source]
        source: ProviderError,
    },
    /// The created instance was not visible on read-back.
    #[error("instance {id} was created but is not visible yet")]
    NotVisible {
        /// Instance id.
        id: String,
    },
    /// The instance did not reach `running` within the configured bound.
    #[error("instance {id} was not running after {} seconds", .waited.as_secs())]
    WaitTimeout {
        /// Instance id.
        id: String,
        /// Time spent waiting.
        waited: Duration,
    },
}

impl LaunchError {
    fn from_create_failure(err: ProviderError) -> Self {
        match err {
            ProviderError::PartialCreate { created, source } => Self::Create {
                created,
                source: *source,
            },
            source => Self::Create {
                created: Vec::new(),
                source,
            },
        }
    }
}

fn left_in_place(created: &[String]) -> String {
    if created.is_empty() {
        String::new()
    } else {
        format!(" (left in place: {})", created.join(", "))
    }
}

/// Drives the launch state machine.
pub struct LaunchOrchestrator<P> {
    directory: InstanceDirectory<P>,
    poll_interval: Duration,
    wait_timeout: Option<Duration>,
}

impl<P> Clone for LaunchOrchestrator<P> {
    fn clone(&self) -> Self {
        Self {
            directory: self.directory.clone(),
            poll_interval: self.poll_interval,
            wait_timeout: self.wait_timeout,
        }
    }
}

impl<P: CloudProvider> LaunchOrchestrator<P> {
    /// Creates an orchestrator that waits without a time bound.
    #[must_use]
    pub const fn new(directory: InstanceDirectory<P>) -> Self {
        Self {
            directory,
            poll_interval: WAIT_POLL_INTERVAL,
            wait_timeout: None,
        }
    }

    /// Overrides the readiness polling interval.
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Bounds the readiness wait.
    #[must_use]
    pub const fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = Some(timeout);
        self
    }

    /// Launches instances named `name` and returns the first one.
    ///
    /// # Errors
    ///
    /// Returns [`LaunchError`] for invalid input before any provider call,
    /// or for the first provider step that fails.
    pub async fn launch(&self, name: &str, options: &LaunchOptions) -> Result<Instance, LaunchError> {
        let instance_name = name.trim();
        if instance_name.is_empty() {
            return Err(LaunchError::MissingName);
        }
        let mut request = LaunchRequest::from_options(options)?;

        if let Some(filter) = options.defaults.template_filter(instance_name) {
            self.inherit_defaults(&mut request, &filter).await?;
        }

        let image = request.image.clone().ok_or(LaunchError::MissingImage)?;
        self.resolve_zone(&mut request).await?;

        let provider = self.directory.provider();
        let image_id = provider
            .resolve_image(&image, request.zone.as_deref())
            .await
            .map_err(|source| LaunchError::Image {
                image: image.clone(),
                source,
            })?;

        let spec = request.freeze(image_id);
        info!(name = instance_name, count = spec.count, image = %spec.image_id, zone = ?spec.zone, "creating instances");
        let ids = provider
            .create_instances(&spec)
            .await
            .map_err(LaunchError::from_create_failure)?;
        let Some(first) = ids.first().cloned() else {
            return Err(LaunchError::NothingCreated);
        };

        provider
            .tag_resources(&ids, &[Tag::name(instance_name)])
            .await
            .map_err(|source| LaunchError::Tag {
                ids: ids.clone(),
                source,
            })?;

        if let Some(load_balancer) = &request.load_balancer {
            info!(%load_balancer, "registering instances with load balancer");
            provider
                .register_with_load_balancer(load_balancer, &ids)
                .await
                .map_err(|source| LaunchError::Register {
                    load_balancer: load_balancer.clone(),
                    source,
                })?;
        }

        if options.wait {
            self.wait_until_running(&first).await
        } else {
            self.read_back(&first).await
        }
    }

    async fn inherit_defaults(
        &self,
        request: &mut LaunchRequest,
        filter: &Filter,
    ) -> Result<(), LaunchError> {
        let found = self
            .directory
            .first(filter, ResolveOptions::default().with_load_balancers())
            .await
            .map_err(LaunchError::Template)?;
        let Some(template) = found else {
            debug!(%filter, "no template instance; launching without defaults");
            return Ok(());
        };

        debug!(template = %template.id, "inheriting launch defaults");
        request.inherit(&template);
        if request.boot_payload.is_none() {
            let encoded = self
                .directory
                .provider()
                .describe_boot_payload(&template.id)
                .await
                .map_err(LaunchError::Template)?;
            request.boot_payload = encoded
                .as_deref()
                .map(payload::decode)
                .transpose()
                .map_err(LaunchError::BootPayload)?;
        }
        Ok(())
    }

    async fn resolve_zone(&self, request: &mut LaunchRequest) -> Result<(), LaunchError> {
        if request.zone.is_some() {
            return Ok(());
        }
        let Some(load_balancer) = request.load_balancer.clone() else {
            return Ok(());
        };
        let zones = self
            .directory
            .provider()
            .load_balancer_zones(&load_balancer)
            .await
            .map_err(|source| LaunchError::Zone {
                load_balancer: load_balancer.clone(),
                source,
            })?;
        if zones.is_empty() {
            warn!(%load_balancer, "load balancer reports no zones; using the provider default");
        }
        request.choose_zone(&zones, &mut rand::thread_rng());
        Ok(())
    }

    async fn read_back(&self, id: &str) -> Result<Instance, LaunchError> {
        self.lookup(id)
            .await?
            .ok_or_else(|| LaunchError::NotVisible { id: id.to_owned() })
    }

    async fn lookup(&self, id: &str) -> Result<Option<Instance>, LaunchError> {
        self.directory
            .first(&Filter::Id(id.to_owned()), ResolveOptions::default())
            .await
            .map_err(|source| LaunchError::Poll {
                id: id.to_owned(),
                source,
            })
    }

    async fn wait_until_running(&self, id: &str) -> Result<Instance, LaunchError> {
        let started = Instant::now();
        loop {
            if let Some(instance) = self.lookup(id).await?
                && instance.state == InstanceState::Running
            {
                info!(%id, "instance is running");
                return Ok(instance);
            }

            if let Some(limit) = self.wait_timeout
                && started.elapsed() + self.poll_interval > limit
            {
                return Err(LaunchError::WaitTimeout {
                    id: id.to_owned(),
                    waited: started.elapsed(),
                });
            }
            debug!(%id, "instance not running yet");
            sleep(self.poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests;
