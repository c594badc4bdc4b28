//! Wire types and identifiers for the Scaleway APIs.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::instance::{Instance, InstanceName, InstanceState};
use crate::provider::ProviderError;

/// Tag prefix recording the SSH key a server was launched with.
pub(crate) const KEY_TAG_PREFIX: &str = "key=";
/// Tag prefix recording the role a server was launched with.
pub(crate) const ROLE_TAG_PREFIX: &str = "role=";

/// Zones offered by each region.
const REGION_ZONES: &[(&str, &[&str])] = &[
    ("fr-par", &["fr-par-1", "fr-par-2", "fr-par-3"]),
    ("nl-ams", &["nl-ams-1", "nl-ams-2", "nl-ams-3"]),
    ("pl-waw", &["pl-waw-1", "pl-waw-2", "pl-waw-3"]),
];

/// Region part of a zone name (`fr-par-1` is in `fr-par`).
pub(crate) fn region_of(zone: &str) -> &str {
    zone.rsplit_once('-').map_or(zone, |(region, _)| region)
}

/// Zones in the same region as `zone`. Unknown regions yield `zone` alone.
pub(crate) fn sibling_zones(zone: &str) -> Vec<String> {
    let region = region_of(zone);
    REGION_ZONES
        .iter()
        .find(|(name, _)| *name == region)
        .map_or_else(
            || vec![zone.to_owned()],
            |(_, zones)| zones.iter().map(|found| (*found).to_owned()).collect(),
        )
}

/// A server addressed by zone and UUID, written `zone/uuid`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct ServerRef {
    pub(crate) zone: String,
    pub(crate) id: String,
}

impl ServerRef {
    pub(crate) fn new(zone: &str, id: &str) -> Self {
        Self {
            zone: zone.to_owned(),
            id: id.to_owned(),
        }
    }

    /// Parses `zone/uuid`; a bare UUID is placed in `default_zone`.
    pub(crate) fn parse(raw: &str, default_zone: &str) -> Result<Self, ProviderError> {
        let (zone, id) = raw.split_once('/').unwrap_or((default_zone, raw));
        if zone.is_empty() || id.is_empty() {
            return Err(ProviderError::not_found("server", raw));
        }
        Ok(Self::new(zone, id))
    }
}

impl fmt::Display for ServerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.zone, self.id)
    }
}

/// A listing page that knows its total size.
pub(crate) trait Page {
    type Item;

    fn total_count(&self) -> Option<u32>;
    fn into_items(self) -> Vec<Self::Item>;
}

macro_rules! page {
    ($name:ident, $field:ident, $item:ty) => {
        #[derive(Debug, Deserialize)]
        pub(crate) struct $name {
            #[serde(default)]
            pub(crate) $field: Vec<$item>,
            #[serde(default)]
            pub(crate) total_count: Option<u32>,
        }

        impl Page for $name {
            type Item = $item;

            fn total_count(&self) -> Option<u32> {
                self.total_count
            }

            fn into_items(self) -> Vec<Self::Item> {
                self.$field
            }
        }
    };
}

page!(ServerPage, servers, Server);
page!(SecurityGroupPage, security_groups, NamedResource);
page!(SshKeyPage, ssh_keys, NamedResource);
page!(LoadBalancerPage, lbs, LoadBalancer);
page!(BackendPage, backends, Backend);

/// Any resource that carries an id and a name.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
pub(crate) struct NamedResource {
    #[serde(default)]
    pub(crate) id: String,
    #[serde(default)]
    pub(crate) name: String,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub(crate) struct IpAddress {
    pub(crate) address: String,
}

/// A server as returned by the Instances API.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub(crate) struct Server {
    pub(crate) id: String,
    #[serde(default)]
    pub(crate) name: String,
    pub(crate) state: String,
    #[serde(default)]
    pub(crate) commercial_type: Option<String>,
    pub(crate) creation_date: DateTime<Utc>,
    #[serde(default)]
    pub(crate) public_ip: Option<IpAddress>,
    #[serde(default)]
    pub(crate) public_ips: Vec<IpAddress>,
    #[serde(default)]
    pub(crate) private_ip: Option<String>,
    #[serde(default)]
    pub(crate) tags: Vec<String>,
    #[serde(default)]
    pub(crate) security_group: Option<NamedResource>,
    #[serde(default)]
    pub(crate) image: Option<NamedResource>,
    pub(crate) zone: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ServerEnvelope {
    pub(crate) server: Server,
}

/// Maps a Scaleway server state onto the fleet state model.
pub(crate) fn map_state(state: &str) -> InstanceState {
    match state {
        "running" => InstanceState::Running,
        "starting" => InstanceState::Pending,
        "stopping" => InstanceState::ShuttingDown,
        _ => InstanceState::Stopped,
    }
}

impl Server {
    pub(crate) fn tag_value(&self, prefix: &str) -> Option<&str> {
        self.tags.iter().find_map(|tag| tag.strip_prefix(prefix))
    }

    pub(crate) fn public_address(&self) -> Option<&str> {
        self.public_ip
            .as_ref()
            .or_else(|| self.public_ips.first())
            .map(|ip| ip.address.as_str())
    }

    pub(crate) fn into_instance(self) -> Instance {
        let name = Some(InstanceName::parse(&self.name)).filter(|parsed| !parsed.is_empty());
        Instance {
            id: ServerRef::new(&self.zone, &self.id).to_string(),
            name,
            state: map_state(&self.state),
            public_address: self.public_address().map(str::to_owned),
            private_address: self.private_ip.clone(),
            launch_time: self.creation_date,
            instance_type: self.commercial_type.clone(),
            security_group: self.security_group.as_ref().map(|group| group.name.clone()),
            iam_role: self.tag_value(ROLE_TAG_PREFIX).map(str::to_owned),
            availability_zone: Some(self.zone.clone()),
            key_name: self.tag_value(KEY_TAG_PREFIX).map(str::to_owned),
            image_id: self
                .image
                .as_ref()
                .map(|image| format!("{}/{}", self.zone, image.id)),
            load_balancer: None,
        }
    }
}

/// The fields of an image needed to find its counterpart in another zone.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub(crate) struct ImageSummary {
    pub(crate) name: String,
    pub(crate) arch: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ImageEnvelope {
    pub(crate) image: ImageSummary,
}

/// A load balancer as returned by the Load Balancer API.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub(crate) struct LoadBalancer {
    pub(crate) id: String,
    pub(crate) name: String,
    #[serde(default)]
    pub(crate) zone: String,
}

/// A load balancer backend and its server pool.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub(crate) struct Backend {
    pub(crate) id: String,
    #[serde(default)]
    pub(crate) pool: Vec<String>,
}
