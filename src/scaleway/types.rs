//! Wire types for the Scaleway Instances API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::provider::ResourceStatus;

#[derive(Serialize)]
pub(super) struct CreateServerBody<'a> {
    pub(super) name: &'a str,
    pub(super) commercial_type: &'a str,
    pub(super) image: &'a str,
    pub(super) project: &'a str,
    pub(super) public_ips: Vec<&'a str>,
    pub(super) dynamic_ip_required: bool,
    pub(super) routed_ip_enabled: bool,
    pub(super) tags: Vec<String>,
    pub(super) stopped: bool,
}

#[derive(Serialize)]
pub(super) struct CreateIpBody<'a> {
    pub(super) project: &'a str,
    #[serde(rename = "type")]
    pub(super) kind: &'a str,
    pub(super) tags: Vec<String>,
}

#[derive(Serialize)]
pub(super) struct ActionBody<'a> {
    pub(super) action: &'a str,
}

#[derive(Serialize)]
pub(super) struct ImportSnapshotBody<'a> {
    pub(super) name: &'a str,
    pub(super) project: &'a str,
    pub(super) bucket: &'a str,
    pub(super) key: &'a str,
    pub(super) volume_type: &'a str,
}

#[derive(Serialize)]
pub(super) struct CreateImageBody<'a> {
    pub(super) name: &'a str,
    pub(super) root_volume: &'a str,
    pub(super) arch: &'a str,
    pub(super) project: &'a str,
    pub(super) tags: Vec<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub(super) struct ServerRef {
    pub(super) id: String,
}

#[derive(Clone, Debug, Deserialize)]
pub(super) struct ServerIp {
    pub(super) id: String,
    pub(super) address: String,
}

#[derive(Clone, Debug, Deserialize)]
pub(super) struct Server {
    pub(super) id: String,
    pub(super) state: String,
    pub(super) creation_date: DateTime<Utc>,
    #[serde(default)]
    pub(super) allowed_actions: Vec<String>,
    #[serde(default)]
    pub(super) public_ips: Vec<ServerIp>,
    #[serde(default)]
    pub(super) private_ip: Option<String>,
}

impl Server {
    pub(super) fn status(&self) -> ResourceStatus {
        match self.state.as_str() {
            "running" => ResourceStatus::Running,
            "starting" => ResourceStatus::Pending,
            "locked" => ResourceStatus::Error,
            other => ResourceStatus::Other(other.to_owned()),
        }
    }
}

#[derive(Deserialize)]
pub(super) struct ServerEnvelope {
    pub(super) server: Server,
}

#[derive(Deserialize)]
pub(super) struct ServerList {
    pub(super) servers: Vec<Server>,
}

#[derive(Clone, Debug, Deserialize)]
pub(super) struct Ip {
    pub(super) id: String,
    pub(super) address: String,
    #[serde(default)]
    pub(super) server: Option<ServerRef>,
    #[serde(default)]
    pub(super) tags: Vec<String>,
}

#[derive(Deserialize)]
pub(super) struct IpEnvelope {
    pub(super) ip: Ip,
}

#[derive(Deserialize)]
pub(super) struct IpList {
    pub(super) ips: Vec<Ip>,
}

#[derive(Clone, Debug, Deserialize)]
pub(super) struct Image {
    pub(super) id: String,
    pub(super) name: String,
    pub(super) state: String,
    pub(super) creation_date: DateTime<Utc>,
    #[serde(default)]
    pub(super) public: bool,
}

impl Image {
    pub(super) fn status(&self) -> ResourceStatus {
        image_status(&self.state)
    }
}

pub(super) fn image_status(state: &str) -> ResourceStatus {
    match state {
        "available" => ResourceStatus::Available,
        "creating" => ResourceStatus::Pending,
        "error" => ResourceStatus::Error,
        other => ResourceStatus::Other(other.to_owned()),
    }
}

#[derive(Deserialize)]
pub(super) struct ImageEnvelope {
    pub(super) image: Image,
}

#[derive(Deserialize)]
pub(super) struct ImageList {
    pub(super) images: Vec<Image>,
}

#[derive(Clone, Debug, Deserialize)]
pub(super) struct Snapshot {
    pub(super) id: String,
    pub(super) state: String,
}

#[derive(Deserialize)]
pub(super) struct SnapshotEnvelope {
    pub(super) snapshot: Snapshot,
}
