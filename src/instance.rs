//! Instance read model, name tokens, filters, and display ordering.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use thiserror::Error;
use uuid::Uuid;

/// Lifecycle state reported for an instance.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceState {
    /// Booted and reachable.
    Running,
    /// Being created or started.
    Pending,
    /// Powered off but still allocated.
    Stopped,
    /// Being stopped or terminated.
    ShuttingDown,
    /// Gone.
    Terminated,
}

impl InstanceState {
    /// Display rank; higher ranks sort first.
    #[must_use]
    pub const fn rank(self) -> u8 {
        match self {
            Self::Running => 4,
            Self::Pending => 3,
            Self::Stopped => 2,
            Self::ShuttingDown => 1,
            Self::Terminated => 0,
        }
    }

    /// Wire name of the state.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Pending => "pending",
            Self::Stopped => "stopped",
            Self::ShuttingDown => "shutting-down",
            Self::Terminated => "terminated",
        }
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raised when a state name is not recognised.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("unknown instance state `{0}`")]
pub struct UnknownState(pub String);

impl FromStr for InstanceState {
    type Err = UnknownState;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "running" => Ok(Self::Running),
            "pending" => Ok(Self::Pending),
            "stopped" => Ok(Self::Stopped),
            "shutting-down" => Ok(Self::ShuttingDown),
            "terminated" => Ok(Self::Terminated),
            other => Err(UnknownState(other.to_owned())),
        }
    }
}

/// Instance name made of `+`-joined tokens, for example `web+blue`.
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq)]
pub struct InstanceName(Vec<String>);

impl InstanceName {
    /// Splits `raw` on `+`, dropping empty tokens.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        Self(name_tokens(raw))
    }

    /// Tokens in their original order.
    #[must_use]
    pub fn tokens(&self) -> &[String] {
        &self.0
    }

    /// Returns `true` when every token in `required` is present, in any
    /// order.
    #[must_use]
    pub fn contains_all(&self, required: &[String]) -> bool {
        required.iter().all(|token| self.0.contains(token))
    }

    /// Returns `true` when the name has no tokens.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for InstanceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("+"))
    }
}

impl Serialize for InstanceName {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

fn name_tokens(raw: &str) -> Vec<String> {
    raw.split('+')
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Projection of provider state for one instance at query time.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct Instance {
    /// Opaque provider identifier.
    pub id: String,
    /// Name tag, when set.
    pub name: Option<InstanceName>,
    /// Lifecycle state.
    pub state: InstanceState,
    /// Public address; the only execution target.
    pub public_address: Option<String>,
    /// Private address.
    pub private_address: Option<String>,
    /// Creation or last launch time.
    pub launch_time: DateTime<Utc>,
    /// Commercial type or flavour.
    #[serde(rename = "type")]
    pub instance_type: Option<String>,
    /// Security group name.
    pub security_group: Option<String>,
    /// Role attached to the instance.
    pub iam_role: Option<String>,
    /// Zone the instance lives in.
    pub availability_zone: Option<String>,
    /// SSH key pair name.
    pub key_name: Option<String>,
    /// Image the instance booted from.
    pub image_id: Option<String>,
    /// Load balancer the instance is registered with, when attribution was
    /// requested.
    pub load_balancer: Option<String>,
}

impl Instance {
    /// Returns `true` when the instance is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state == InstanceState::Running
    }

    /// Public address of a running instance.
    #[must_use]
    pub fn hostname(&self) -> Option<&str> {
        if self.is_running() {
            self.public_address.as_deref()
        } else {
            None
        }
    }
}

/// Selects instances by id, address, or name tokens.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Filter {
    /// Matches every instance.
    All,
    /// Matches one instance id.
    Id(String),
    /// Matches a public or private address, or DNS name.
    Address(String),
    /// Matches instances whose name contains every token.
    Name(Vec<String>),
    /// A value shaped like an id. Instances whose name carries the value as
    /// tokens match too.
    LikelyId(String),
    /// A value shaped like an address or DNS name. Instances whose name
    /// carries the value as tokens match too.
    LikelyAddress(String),
}

impl Filter {
    /// Parses a user supplied filter.
    ///
    /// `*` and the empty string match everything. The `id:`, `addr:` and
    /// `name:` prefixes force a kind. Without a prefix, UUIDs (optionally
    /// prefixed by a zone) and `i-` values are likely ids, IP addresses and
    /// dotted values are likely addresses, and anything else is a
    /// `+`-separated list of name tokens. Likely ids and addresses also
    /// match by name.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        let value = raw.trim();
        if value.is_empty() || value == "*" {
            return Self::All;
        }
        if let Some(id) = value.strip_prefix("id:") {
            return Self::Id(id.to_owned());
        }
        if let Some(address) = value.strip_prefix("addr:") {
            return Self::Address(address.to_owned());
        }
        if let Some(name) = value.strip_prefix("name:") {
            return Self::from_tokens(name_tokens(name));
        }
        if looks_like_id(value) {
            return Self::LikelyId(value.to_owned());
        }
        if value.parse::<std::net::IpAddr>().is_ok() || value.contains('.') {
            return Self::LikelyAddress(value.to_owned());
        }
        Self::from_tokens(name_tokens(value))
    }

    /// Matches instances carrying every token of `name`.
    #[must_use]
    pub fn named(name: &InstanceName) -> Self {
        Self::from_tokens(name.tokens().to_vec())
    }

    fn from_tokens(tokens: Vec<String>) -> Self {
        if tokens.is_empty() {
            Self::All
        } else {
            Self::Name(tokens)
        }
    }

    /// Returns `true` for the match-everything filter.
    #[must_use]
    pub const fn is_wildcard(&self) -> bool {
        matches!(self, Self::All)
    }

    /// Applies the filter to one instance.
    #[must_use]
    pub fn matches(&self, instance: &Instance) -> bool {
        match self {
            Self::All => true,
            Self::Id(id) => matches_id(instance, id),
            Self::Address(address) => matches_address(instance, address),
            Self::Name(tokens) => matches_name(instance, tokens),
            Self::LikelyId(value) => {
                matches_id(instance, value) || matches_name(instance, &name_tokens(value))
            }
            Self::LikelyAddress(value) => {
                matches_address(instance, value) || matches_name(instance, &name_tokens(value))
            }
        }
    }
}

fn matches_id(instance: &Instance, id: &str) -> bool {
    instance.id == id
        || instance
            .id
            .rsplit_once('/')
            .is_some_and(|(_, tail)| tail == id)
}

fn matches_address(instance: &Instance, address: &str) -> bool {
    [&instance.public_address, &instance.private_address]
        .into_iter()
        .flatten()
        .any(|candidate| candidate.eq_ignore_ascii_case(address))
}

fn matches_name(instance: &Instance, tokens: &[String]) -> bool {
    !tokens.is_empty()
        && instance
            .name
            .as_ref()
            .is_some_and(|name| name.contains_all(tokens))
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str("*"),
            Self::Id(id) => write!(f, "id:{id}"),
            Self::Address(address) => write!(f, "addr:{address}"),
            Self::Name(tokens) => write!(f, "name:{}", tokens.join("+")),
            Self::LikelyId(value) | Self::LikelyAddress(value) => f.write_str(value),
        }
    }
}

fn looks_like_id(value: &str) -> bool {
    let tail = value.rsplit_once('/').map_or(value, |(_, tail)| tail);
    Uuid::parse_str(tail).is_ok() || value.starts_with("i-")
}

/// Orders instances for display: higher state rank first, and among running
/// instances the most recently launched first. Other ties keep their input
/// order.
pub fn sort_instances(instances: &mut [Instance]) {
    instances.sort_by(display_order);
}

fn display_order(lhs: &Instance, rhs: &Instance) -> Ordering {
    rhs.state
        .rank()
        .cmp(&lhs.state.rank())
        .then_with(|| {
            if lhs.is_running() && rhs.is_running() {
                rhs.launch_time.cmp(&lhs.launch_time)
            } else {
                Ordering::Equal
            }
        })
}
