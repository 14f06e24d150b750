//! Scaleway implementation of [`Provider`].
//!
//! Servers are created stopped so user-data can be attached before first
//! boot, then powered on and polled until they report a public address. A
//! server created without a pooled floating IP gets a fresh routed IP tagged
//! [`FRESH_IP_TAG`]; deleting the server deletes that IP too.

mod error;
mod image;
mod types;

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::LazyLock;
use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
use reqwest::{Method, RequestBuilder};
use scaleway_rs::ScalewayApi;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::config::ScalewayConfig;
use crate::provider::{
    FloatingIp, ImageHandle, ImageSummary, PRIVATE_IPV4_PLACEHOLDER, PUBLIC_IPV4_PLACEHOLDER,
    Provider, ProviderError, ProviderFuture, ServerHandle, ServerRequest, ServerSummary,
};
use crate::retry::{PollError, retry_conditional, wait_until_ready};
use types::{
    ActionBody, CreateIpBody, CreateServerBody, Ip, IpEnvelope, IpList, Server, ServerEnvelope,
    ServerList,
};

/// Tag applied to every resource this provider creates.
pub const RESOURCE_TAG: &str = "flotilla";

/// Tag marking a floating IP allocated for a single server.
pub const FRESH_IP_TAG: &str = "flotilla-fresh";

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const SCALEWAY_INSTANCE_API_BASE: &str = "https://api.scaleway.com/instance/v1";
const PAGE_SIZE: usize = 100;
const READ_ATTEMPTS: u32 = 3;
const READ_RETRY_DELAY: Duration = Duration::from_secs(2);
const POLL_INTERVAL: Duration = Duration::from_secs(5);
const WAIT_TIMEOUT: Duration = Duration::from_secs(300);

static HTTP_CLIENT: LazyLock<reqwest::Client> = LazyLock::new(|| {
    reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
});

/// Provider backed by the Scaleway Instances API.
#[derive(Clone)]
pub struct ScalewayProvider {
    api: ScalewayApi,
    config: ScalewayConfig,
    poll_interval: Duration,
    wait_timeout: Duration,
}

impl std::fmt::Debug for ScalewayProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScalewayProvider")
            .field("zone", &self.config.default_zone)
            .field("project", &self.config.default_project_id)
            .finish_non_exhaustive()
    }
}

impl ScalewayProvider {
    /// Constructs a provider from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Config`] when the configuration fails
    /// validation.
    pub fn new(config: ScalewayConfig) -> Result<Self, ProviderError> {
        config
            .validate()
            .map_err(|err| ProviderError::Config(err.to_string()))?;
        Ok(Self {
            api: ScalewayApi::new(&config.secret_key),
            config,
            poll_interval: POLL_INTERVAL,
            wait_timeout: WAIT_TIMEOUT,
        })
    }

    /// Zone every request targets.
    #[must_use]
    pub fn zone(&self) -> &str {
        &self.config.default_zone
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{SCALEWAY_INSTANCE_API_BASE}/zones/{}/{path}",
            self.config.default_zone
        )
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        HTTP_CLIENT
            .request(method, self.url(path))
            .header("X-Auth-Token", &self.config.secret_key)
    }

    async fn send(
        &self,
        builder: RequestBuilder,
        operation: &str,
        target: &str,
    ) -> Result<Vec<u8>, ProviderError> {
        let response = builder
            .send()
            .await
            .map_err(|err| error::from_transport(&err, operation))?;
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|err| error::from_transport(&err, operation))?;
        if status.is_success() {
            return Ok(body.to_vec());
        }
        Err(error::from_status(status, &body, operation, target))
    }

    async fn call<T: DeserializeOwned>(
        &self,
        builder: RequestBuilder,
        operation: &str,
        target: &str,
    ) -> Result<T, ProviderError> {
        let body = self.send(builder, operation, target).await?;
        serde_json::from_slice(&body).map_err(|err| ProviderError::Api {
            message: format!("{operation}: malformed response: {err}"),
        })
    }

    async fn post<B: Serialize + Sync, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
        operation: &str,
    ) -> Result<T, ProviderError> {
        self.call(self.request(Method::POST, path).json(body), operation, path)
            .await
    }

    async fn delete(&self, path: &str, operation: &str, target: &str) -> Result<(), ProviderError> {
        self.send(self.request(Method::DELETE, path), operation, target)
            .await
            .map(|_| ())
    }

    /// Idempotent reads are retried while the failure is transient.
    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        operation: &str,
        target: &str,
    ) -> Result<T, ProviderError> {
        retry_conditional(
            READ_ATTEMPTS,
            READ_RETRY_DELAY,
            ProviderError::is_transient,
            || self.call(self.request(Method::GET, path), operation, target),
        )
        .await
    }

    async fn list_pages<T, F>(
        &self,
        resource: &str,
        query: &str,
        extract: F,
    ) -> Result<Vec<T>, ProviderError>
    where
        T: Send,
        F: Fn(Vec<u8>) -> Result<Vec<T>, serde_json::Error>,
    {
        let mut items = Vec::new();
        for page in 1.. {
            let path = format!(
                "{resource}?project={}&per_page={PAGE_SIZE}&page={page}{query}",
                self.config.default_project_id
            );
            let operation = format!("list_{resource}");
            let body = retry_conditional(
                READ_ATTEMPTS,
                READ_RETRY_DELAY,
                ProviderError::is_transient,
                || self.send(self.request(Method::GET, &path), &operation, resource),
            )
            .await?;
            let batch = extract(body).map_err(|err| ProviderError::Api {
                message: format!("{operation}: malformed response: {err}"),
            })?;
            let done = batch.len() < PAGE_SIZE;
            items.extend(batch);
            if done {
                break;
            }
        }
        Ok(items)
    }

    async fn fetch_server(&self, id: &str) -> Result<Server, ProviderError> {
        let envelope: ServerEnvelope = self
            .get(&format!("servers/{id}"), "get_server", id)
            .await?;
        Ok(envelope.server)
    }

    async fn fetch_ip(&self, id: &str) -> Result<Ip, ProviderError> {
        let envelope: IpEnvelope = self.get(&format!("ips/{id}"), "get_ip", id).await?;
        Ok(envelope.ip)
    }

    async fn allocate_ip(&self, tags: Vec<String>) -> Result<Ip, ProviderError> {
        let body = CreateIpBody {
            project: &self.config.default_project_id,
            kind: "routed_ipv4",
            tags,
        };
        let envelope: IpEnvelope = self.post("ips", &body, "create_ip").await?;
        info!(floating_ip = %envelope.ip.id, address = %envelope.ip.address, "allocated floating IP");
        Ok(envelope.ip)
    }

    async fn perform_action(&self, id: &str, action: &str) -> Result<(), ProviderError> {
        let path = format!("servers/{id}/action");
        self.send(
            self.request(Method::POST, &path)
                .json(&ActionBody { action }),
            "server_action",
            id,
        )
        .await
        .map(|_| ())
    }

    async fn set_user_data(&self, id: &str, user_data: &str) -> Result<(), ProviderError> {
        let path = format!("servers/{id}/user_data/cloud-init");
        self.send(
            self.request(Method::PATCH, &path)
                .header(CONTENT_TYPE, "text/plain")
                .body(user_data.to_owned()),
            "set_user_data",
            id,
        )
        .await
        .map(|_| ())
    }

    async fn wait_for_address(&self, id: &str) -> Result<Server, ProviderError> {
        let poll = wait_until_ready(self.wait_timeout, self.poll_interval, || async move {
            let server = self.fetch_server(id).await?;
            debug!(server_id = %id, state = %server.state, "waiting for server");
            Ok(server.state == "running" && !server.public_ips.is_empty())
        })
        .await;
        match poll {
            Ok(()) => self.fetch_server(id).await,
            Err(PollError::TimeLimitExceeded { .. }) => Err(ProviderError::Timeout {
                action: String::from("server boot"),
                id: id.to_owned(),
            }),
            Err(PollError::Check(err)) => Err(err),
        }
    }

    async fn wait_until_gone(&self, id: &str) -> Result<(), ProviderError> {
        let poll = wait_until_ready(self.wait_timeout, self.poll_interval, || async move {
            match self.fetch_server(id).await {
                Err(ProviderError::NotFound { .. }) => Ok(true),
                Ok(_) => Ok(false),
                Err(err) => Err(err),
            }
        })
        .await;
        poll.map_err(|err| match err {
            PollError::TimeLimitExceeded { .. } => ProviderError::Timeout {
                action: String::from("server deletion"),
                id: id.to_owned(),
            },
            PollError::Check(inner) => inner,
        })
    }

    async fn boot(&self, server_id: &str, user_data: &str) -> Result<ServerHandle, ProviderError> {
        self.set_user_data(server_id, user_data).await?;
        self.perform_action(server_id, "poweron").await?;
        let server = self.wait_for_address(server_id).await?;
        let primary = server
            .public_ips
            .first()
            .ok_or_else(|| ProviderError::Api {
                message: format!("server {server_id} has no public address"),
            })?;
        let public_ip = parse_address(&primary.address, server_id)?;
        let private_ip = server
            .private_ip
            .as_deref()
            .and_then(|addr| addr.parse::<IpAddr>().ok());
        Ok(ServerHandle {
            id: server.id.clone(),
            public_ip,
            private_ip,
            floating_ip: Some(primary.id.clone()),
        })
    }

    async fn discard_fresh_ip(&self, ip: Option<&Ip>) {
        let Some(fresh) = ip else {
            return;
        };
        match self
            .delete(&format!("ips/{}", fresh.id), "delete_ip", &fresh.id)
            .await
        {
            Ok(()) => info!(floating_ip = %fresh.id, "released fresh floating IP"),
            Err(err) => {
                warn!(floating_ip = %fresh.id, error = %err, "failed to release fresh floating IP");
            }
        }
    }

    /// Deletes the fresh IPs a removed server held. Pooled IPs stay.
    /// Failures are logged; the server is already gone.
    async fn release_fresh_ips(&self, server: &Server) {
        for attached in &server.public_ips {
            let ip = match self.fetch_ip(&attached.id).await {
                Ok(ip) => ip,
                Err(ProviderError::NotFound { .. }) => continue,
                Err(err) => {
                    warn!(server_id = %server.id, floating_ip = %attached.id, error = %err, "failed to inspect floating IP");
                    continue;
                }
            };
            if ip.tags.iter().any(|tag| tag == FRESH_IP_TAG) {
                self.discard_fresh_ip(Some(&ip)).await;
            }
        }
    }

    async fn remove_server(&self, server: &Server) -> Result<(), ProviderError> {
        if server.allowed_actions.iter().any(|action| action == "terminate") {
            self.perform_action(&server.id, "terminate").await?;
        } else {
            self.delete(&format!("servers/{}", server.id), "delete_server", &server.id)
                .await?;
        }
        self.wait_until_gone(&server.id).await
    }
}

fn parse_address(address: &str, server_id: &str) -> Result<IpAddr, ProviderError> {
    address.parse().map_err(|_| ProviderError::Api {
        message: format!("server {server_id} reported unparsable address {address}"),
    })
}

impl Provider for ScalewayProvider {
    fn name(&self) -> &str {
        "scaleway"
    }

    fn create_server<'a>(
        &'a self,
        request: &'a ServerRequest,
    ) -> ProviderFuture<'a, ServerHandle> {
        Box::pin(async move {
            let image_id = self.resolve_image_id().await?;
            let fresh = match request.floating_ip {
                Some(_) => None,
                None => Some(
                    self.allocate_ip(vec![
                        String::from(RESOURCE_TAG),
                        String::from(FRESH_IP_TAG),
                    ])
                    .await?,
                ),
            };
            let ip_id = request
                .floating_ip
                .as_deref()
                .or_else(|| fresh.as_ref().map(|ip| ip.id.as_str()))
                .unwrap_or_default();

            let body = CreateServerBody {
                name: &request.name,
                commercial_type: &self.config.commercial_type,
                image: &image_id,
                project: &self.config.default_project_id,
                public_ips: vec![ip_id],
                dynamic_ip_required: false,
                routed_ip_enabled: true,
                tags: vec![String::from(RESOURCE_TAG)],
                stopped: true,
            };
            let created: Result<ServerEnvelope, _> =
                self.post("servers", &body, "create_server").await;
            let server = match created {
                Ok(envelope) => envelope.server,
                Err(err) => {
                    self.discard_fresh_ip(fresh.as_ref()).await;
                    return Err(err);
                }
            };
            info!(server_id = %server.id, name = %request.name, "created stopped server");

            match self.boot(&server.id, &request.user_data).await {
                Ok(handle) => Ok(handle),
                Err(err) => {
                    warn!(server_id = %server.id, error = %err, "boot failed; deleting server");
                    if let Err(cleanup) = self.remove_server(&server).await {
                        warn!(server_id = %server.id, error = %cleanup, "failed to delete unbooted server");
                    }
                    self.discard_fresh_ip(fresh.as_ref()).await;
                    Err(err)
                }
            }
        })
    }

    fn delete_server<'a>(&'a self, id: &'a str) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            let server = self.fetch_server(id).await?;
            self.remove_server(&server).await?;
            info!(server_id = %id, "deleted server");
            self.release_fresh_ips(&server).await;
            Ok(())
        })
    }

    fn create_image<'a>(
        &'a self,
        name: &'a str,
        source_url: &'a str,
    ) -> ProviderFuture<'a, ImageHandle> {
        Box::pin(async move { image::import_image(self, name, source_url).await })
    }

    fn describe_image<'a>(&'a self, id: &'a str) -> ProviderFuture<'a, ImageSummary> {
        Box::pin(async move {
            let envelope: types::ImageEnvelope = self
                .get(&format!("images/{id}"), "describe_image", id)
                .await?;
            Ok(image::summary(&envelope.image))
        })
    }

    fn delete_image<'a>(&'a self, id: &'a str) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            self.delete(&format!("images/{id}"), "delete_image", id)
                .await?;
            info!(image_id = %id, "deleted image");
            Ok(())
        })
    }

    fn list_servers(&self) -> ProviderFuture<'_, Vec<ServerSummary>> {
        Box::pin(async move {
            let servers = self
                .list_pages("servers", "", |body| {
                    serde_json::from_slice::<ServerList>(&body).map(|list| list.servers)
                })
                .await?;
            Ok(servers
                .into_iter()
                .map(|server| ServerSummary {
                    status: server.status(),
                    id: server.id,
                    created_at: server.creation_date,
                })
                .collect())
        })
    }

    fn list_images(&self) -> ProviderFuture<'_, Vec<ImageSummary>> {
        Box::pin(async move {
            let images = self
                .list_pages("images", "&public=false", |body| {
                    serde_json::from_slice::<types::ImageList>(&body).map(|list| list.images)
                })
                .await?;
            Ok(images.iter().map(image::summary).collect())
        })
    }

    fn console_output<'a>(&'a self, _id: &'a str) -> ProviderFuture<'a, String> {
        Box::pin(async move { Err(ProviderError::unsupported(self.name(), "console_output")) })
    }

    fn create_floating_ip(&self) -> ProviderFuture<'_, FloatingIp> {
        Box::pin(async move {
            let ip = self.allocate_ip(vec![String::from(RESOURCE_TAG)]).await?;
            to_floating_ip(ip)
        })
    }

    fn delete_floating_ip<'a>(&'a self, id: &'a str) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            self.delete(&format!("ips/{id}"), "delete_ip", id).await?;
            info!(floating_ip = %id, "deleted floating IP");
            Ok(())
        })
    }

    fn list_floating_ips(&self) -> ProviderFuture<'_, Vec<FloatingIp>> {
        Box::pin(async move {
            let ips = self
                .list_pages("ips", "", |body| {
                    serde_json::from_slice::<IpList>(&body).map(|list| list.ips)
                })
                .await?;
            ips.into_iter()
                .filter(|ip| !ip.tags.iter().any(|tag| tag == FRESH_IP_TAG))
                .map(to_floating_ip)
                .collect()
        })
    }

    fn placeholders(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (
                PUBLIC_IPV4_PLACEHOLDER.to_owned(),
                String::from("${AFTERBURN_SCALEWAY_IPV4_PUBLIC}"),
            ),
            (
                PRIVATE_IPV4_PLACEHOLDER.to_owned(),
                String::from("${AFTERBURN_SCALEWAY_IPV4_PRIVATE}"),
            ),
        ])
    }
}

fn to_floating_ip(ip: Ip) -> Result<FloatingIp, ProviderError> {
    let address = ip.address.parse().map_err(|_| ProviderError::Api {
        message: format!("floating IP {} has unparsable address {}", ip.id, ip.address),
    })?;
    Ok(FloatingIp {
        id: ip.id,
        address,
        server_id: ip.server.map(|server| server.id),
    })
}

#[cfg(test)]
mod tests;
