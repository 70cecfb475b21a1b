//! Hetzner Cloud servers.

use serde::Deserialize;
use serde_json::json;

use super::api::{send, send_json};
use super::lookup;
use super::{ProviderKind, ProvisionError, ProvisionFuture, Provisioner};
use crate::host::{
    HostDeleteRequest, HostDescriptor, HostStatus, ListFilter, ProvisionedHost, TAG_SSH_KEY,
};
use crate::transport::{ApiRequest, HttpTransport, Transport};

/// Default API root.
pub const API_BASE: &str = "https://api.hetzner.cloud/v1";

pub(super) const STATUS_TABLE: &[(&str, HostStatus)] = &[
    ("starting", HostStatus::Initializing),
    ("running", HostStatus::Active),
];

#[derive(Deserialize)]
struct ServerEnvelope {
    server: Server,
}

#[derive(Deserialize)]
struct ServerPage {
    #[serde(default)]
    servers: Vec<Server>,
    #[serde(default)]
    meta: Option<Meta>,
}

#[derive(Deserialize)]
struct Meta {
    pagination: Pagination,
}

#[derive(Deserialize)]
struct Pagination {
    #[serde(default)]
    next_page: Option<u32>,
}

#[derive(Deserialize)]
struct Server {
    id: u64,
    status: String,
    #[serde(default)]
    public_net: Option<PublicNet>,
}

#[derive(Deserialize)]
struct PublicNet {
    #[serde(default)]
    ipv4: Option<Ipv4>,
}

#[derive(Deserialize)]
struct Ipv4 {
    ip: String,
}

impl Server {
    fn into_host(self) -> ProvisionedHost {
        let ip = self
            .public_net
            .and_then(|net| net.ipv4)
            .map(|ipv4| ipv4.ip)
            .unwrap_or_default();
        ProvisionedHost::observed(
            self.id.to_string(),
            ip,
            HostStatus::map_native(&self.status, STATUS_TABLE),
        )
    }
}

/// Provisions servers through the Hetzner Cloud API.
#[derive(Clone, Debug)]
pub struct HetznerProvisioner<T = HttpTransport> {
    transport: T,
}

impl<T: Transport> HetznerProvisioner<T> {
    /// Creates an adapter that sends requests through `transport`.
    #[must_use]
    pub const fn new(transport: T) -> Self {
        Self { transport }
    }

    async fn create(&self, descriptor: &HostDescriptor) -> Result<ProvisionedHost, ProvisionError> {
        descriptor.validate()?;
        let mut body = json!({
            "name": descriptor.name,
            "server_type": descriptor.plan,
            "location": descriptor.region,
            "image": descriptor.os_image,
            "user_data": descriptor.boot_script,
            "start_after_create": true,
            "labels": {"inlets": "exit-node"},
        });
        if let Some(key) = descriptor.tag(TAG_SSH_KEY) {
            body["ssh_keys"] = json!([key]);
        }
        let envelope: ServerEnvelope = send_json(
            &self.transport,
            ApiRequest::post("/servers").json(body),
            "create server",
            &descriptor.name,
        )
        .await?;
        Ok(envelope.server.into_host())
    }

    async fn fetch(&self, id: &str) -> Result<ProvisionedHost, ProvisionError> {
        let envelope: ServerEnvelope = send_json(
            &self.transport,
            ApiRequest::get(format!("/servers/{id}")),
            "get server",
            &format!("server {id}"),
        )
        .await?;
        Ok(envelope.server.into_host())
    }

    async fn remove(&self, request: &HostDeleteRequest) -> Result<(), ProvisionError> {
        let id =
            lookup::target_id(self, request, ProviderKind::Hetzner.exit_node_marker()).await?;
        send(
            &self.transport,
            ApiRequest::delete(format!("/servers/{id}")),
            "delete server",
            &format!("server {id}"),
        )
        .await?;
        Ok(())
    }

    async fn list_all(&self, filter: &ListFilter) -> Result<Vec<ProvisionedHost>, ProvisionError> {
        let mut hosts = Vec::new();
        let mut page = 1_u32;
        loop {
            let mut request = ApiRequest::get("/servers")
                .query("page", page.to_string())
                .query("per_page", "50");
            if !filter.expression.is_empty() {
                request = request.query("label_selector", filter.expression.clone());
            }
            let listing: ServerPage =
                send_json(&self.transport, request, "list servers", "servers").await?;
            hosts.extend(listing.servers.into_iter().map(Server::into_host));
            match listing.meta.and_then(|meta| meta.pagination.next_page) {
                Some(next) if next > page => page = next,
                _ => return Ok(hosts),
            }
        }
    }
}

impl<T: Transport> Provisioner for HetznerProvisioner<T> {
    fn provision<'a>(
        &'a self,
        descriptor: &'a HostDescriptor,
    ) -> ProvisionFuture<'a, ProvisionedHost> {
        Box::pin(self.create(descriptor))
    }

    fn status<'a>(&'a self, id: &'a str) -> ProvisionFuture<'a, ProvisionedHost> {
        Box::pin(self.fetch(id))
    }

    fn delete<'a>(&'a self, request: &'a HostDeleteRequest) -> ProvisionFuture<'a, ()> {
        Box::pin(self.remove(request))
    }

    fn list<'a>(&'a self, filter: &'a ListFilter) -> ProvisionFuture<'a, Vec<ProvisionedHost>> {
        Box::pin(self.list_all(filter))
    }
}
