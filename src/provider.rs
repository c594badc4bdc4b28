//! Cloud inventory abstraction consumed by the fleet operations.

use std::future::Future;
use std::pin::Pin;

use thiserror::Error;

use crate::instance::{Instance, InstanceState};
use crate::join::JoinError;

/// Future returned by provider operations.
pub type ProviderFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ProviderError>> + Send + 'a>>;

/// Parameters for one creation call.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CreateSpec {
    /// Resolved image identifier.
    pub image_id: String,
    /// Number of instances to create.
    pub count: u32,
    /// SSH key pair name.
    pub key_name: Option<String>,
    /// Security group names.
    pub security_groups: Vec<String>,
    /// Boot payload, base64 encoded.
    pub boot_payload_base64: Option<String>,
    /// Commercial type.
    pub instance_type: Option<String>,
    /// Placement zone; the provider default applies when unset.
    pub zone: Option<String>,
    /// Role to attach.
    pub iam_role: Option<String>,
}

/// Key/value tag applied to created resources.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Tag {
    /// Tag key.
    pub key: String,
    /// Tag value.
    pub value: String,
}

impl Tag {
    /// Builds the `Name` tag.
    #[must_use]
    pub fn name(value: impl Into<String>) -> Self {
        Self {
            key: String::from("Name"),
            value: value.into(),
        }
    }
}

/// One member of a load balancer, keyed by instance id or address.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LoadBalancerMember {
    /// Load balancer name.
    pub load_balancer: String,
    /// Instance id or network address of the member.
    pub member: String,
}

/// Errors reported by cloud providers.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ProviderError {
    /// The provider rejected or failed a request.
    #[error("provider request failed: {message}")]
    Api {
        /// Message returned by the provider.
        message: String,
    },
    /// A referenced resource does not exist.
    #[error("{kind} `{name}` not found")]
    NotFound {
        /// Resource kind, for example `load balancer`.
        kind: String,
        /// Name or identifier that was looked up.
        name: String,
    },
    /// A response could not be decoded.
    #[error("unexpected provider response: {message}")]
    Decode {
        /// Decoder message.
        message: String,
    },
    /// The provider is misconfigured.
    #[error("provider configuration error: {0}")]
    Config(String),
    /// Creation failed after some instances already existed. They are left
    /// in place.
    #[error("{source} (created before the failure: {})", .created.join(", "))]
    PartialCreate {
        /// Identifiers of the instances that were created.
        created: Vec<String>,
        /// The failure that stopped creation.
        #[source]
        source: Box<Self>,
    },
    /// A concurrent lookup was cancelled before it completed.
    #[error("provider lookup {index} was interrupted")]
    Interrupted {
        /// Position of the interrupted lookup.
        index: usize,
    },
}

impl ProviderError {
    /// Convenience constructor for [`ProviderError::NotFound`].
    #[must_use]
    pub fn not_found(kind: &str, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.to_owned(),
            name: name.into(),
        }
    }

    /// Attaches the ids created so far to a creation failure. With nothing
    /// created the failure is returned unchanged.
    #[must_use]
    pub fn partial_create(created: Vec<String>, source: Self) -> Self {
        if created.is_empty() {
            source
        } else {
            Self::PartialCreate {
                created,
                source: Box::new(source),
            }
        }
    }
}

impl From<JoinError<Self>> for ProviderError {
    fn from(value: JoinError<Self>) -> Self {
        match value {
            JoinError::Failed(err) => err,
            JoinError::Abandoned { index } => Self::Interrupted { index },
        }
    }
}

/// Inventory and lifecycle operations the fleet needs from a cloud.
///
/// Implementations are shared across concurrent lookups, so they must be
/// `Send + Sync + 'static`. Errors are surfaced to callers verbatim.
pub trait CloudProvider: Send + Sync + 'static {
    /// Lists every instance visible to the configured account.
    fn list_instances(&self) -> ProviderFuture<'_, Vec<Instance>>;

    /// Lists availability zones.
    fn list_zones(&self) -> ProviderFuture<'_, Vec<String>>;

    /// Lists security group names.
    fn list_security_groups(&self) -> ProviderFuture<'_, Vec<String>>;

    /// Lists SSH key pair names.
    fn list_key_pairs(&self) -> ProviderFuture<'_, Vec<String>>;

    /// Lists role names that can be attached to instances.
    fn list_roles(&self) -> ProviderFuture<'_, Vec<String>>;

    /// Lists load balancer names.
    fn list_load_balancers(&self) -> ProviderFuture<'_, Vec<String>>;

    /// Maps load balancer members to the load balancer they belong to.
    fn load_balancer_attribution(&self) -> ProviderFuture<'_, Vec<LoadBalancerMember>>;

    /// Zones served by the named load balancer.
    fn load_balancer_zones<'a>(&'a self, name: &'a str) -> ProviderFuture<'a, Vec<String>>;

    /// Resolves an image reference (identifier or label) to an identifier.
    fn resolve_image<'a>(
        &'a self,
        image: &'a str,
        zone: Option<&'a str>,
    ) -> ProviderFuture<'a, String>;

    /// Creates instances and returns their identifiers in creation order.
    fn create_instances<'a>(&'a self, spec: &'a CreateSpec) -> ProviderFuture<'a, Vec<String>>;

    /// Applies tags to the given resources.
    fn tag_resources<'a>(&'a self, ids: &'a [String], tags: &'a [Tag]) -> ProviderFuture<'a, ()>;

    /// Returns the instance's boot payload, base64 encoded, if it has one.
    fn describe_boot_payload<'a>(&'a self, id: &'a str) -> ProviderFuture<'a, Option<String>>;

    /// Terminates one instance and reports its new state.
    fn terminate_instance<'a>(&'a self, id: &'a str) -> ProviderFuture<'a, InstanceState>;

    /// Adds instances to a load balancer.
    fn register_with_load_balancer<'a>(
        &'a self,
        name: &'a str,
        ids: &'a [String],
    ) -> ProviderFuture<'a, ()>;
}
