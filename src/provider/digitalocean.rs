//! `DigitalOcean` droplets.

use serde::Deserialize;
use serde_json::json;

use super::api::{send, send_json};
use super::lookup;
use super::{ProviderKind, ProvisionError, ProvisionFuture, Provisioner};
use crate::host::{
    HostDeleteRequest, HostDescriptor, HostStatus, ListFilter, ProvisionedHost, TAG_SSH_KEY,
    TAG_VPC,
};
use crate::transport::{ApiRequest, HttpTransport, Transport};

/// Default API root.
pub const API_BASE: &str = "https://api.digitalocean.com/v2";

const PAGE_SIZE: &str = "200";
pub(super) const STATUS_TABLE: &[(&str, HostStatus)] = &[("new", HostStatus::Creating)];

#[derive(Deserialize)]
struct DropletEnvelope {
    droplet: Droplet,
}

#[derive(Deserialize)]
struct DropletPage {
    #[serde(default)]
    droplets: Vec<Droplet>,
    #[serde(default)]
    links: Links,
}

#[derive(Default, Deserialize)]
struct Links {
    #[serde(default)]
    pages: Option<Pages>,
}

#[derive(Default, Deserialize)]
struct Pages {
    #[serde(default)]
    next: Option<String>,
}

#[derive(Deserialize)]
struct Droplet {
    id: u64,
    status: String,
    #[serde(default)]
    networks: Networks,
}

#[derive(Default, Deserialize)]
struct Networks {
    #[serde(default)]
    v4: Vec<NetworkV4>,
}

#[derive(Deserialize)]
struct NetworkV4 {
    ip_address: String,
    #[serde(rename = "type")]
    kind: String,
}

impl Droplet {
    fn into_host(self) -> ProvisionedHost {
        let ip = self
            .networks
            .v4
            .into_iter()
            .find(|network| network.kind == "public")
            .map(|network| network.ip_address)
            .unwrap_or_default();
        ProvisionedHost::observed(
            self.id.to_string(),
            ip,
            HostStatus::map_native(&self.status, STATUS_TABLE),
        )
    }
}

/// Provisions droplets through the `DigitalOcean` v2 API.
#[derive(Clone, Debug)]
pub struct DigitalOceanProvisioner<T = HttpTransport> {
    transport: T,
}

impl<T: Transport> DigitalOceanProvisioner<T> {
    /// Creates an adapter that sends requests through `transport`.
    #[must_use]
    pub const fn new(transport: T) -> Self {
        Self { transport }
    }

    async fn create(&self, descriptor: &HostDescriptor) -> Result<ProvisionedHost, ProvisionError> {
        descriptor.validate()?;
        let mut body = json!({
            "name": descriptor.name,
            "region": descriptor.region,
            "size": descriptor.plan,
            "image": descriptor.os_image,
            "user_data": descriptor.boot_script,
            "tags": [ProviderKind::DigitalOcean.exit_node_marker()],
        });
        if let Some(key) = descriptor.tag(TAG_SSH_KEY) {
            body["ssh_keys"] = json!([key]);
        }
        if let Some(vpc) = descriptor.tag(TAG_VPC) {
            body["vpc_uuid"] = json!(vpc);
        }
        let envelope: DropletEnvelope = send_json(
            &self.transport,
            ApiRequest::post("/droplets").json(body),
            "create droplet",
            &descriptor.name,
        )
        .await?;
        Ok(envelope.droplet.into_host())
    }

    async fn fetch(&self, id: &str) -> Result<ProvisionedHost, ProvisionError> {
        let resource = format!("droplet {id}");
        let envelope: DropletEnvelope = send_json(
            &self.transport,
            ApiRequest::get(format!("/droplets/{id}")),
            "get droplet",
            &resource,
        )
        .await?;
        Ok(envelope.droplet.into_host())
    }

    async fn remove(&self, request: &HostDeleteRequest) -> Result<(), ProvisionError> {
        let id = lookup::target_id(
            self,
            request,
            ProviderKind::DigitalOcean.exit_node_marker(),
        )
        .await?;
        let resource = format!("droplet {id}");
        send(
            &self.transport,
            ApiRequest::delete(format!("/droplets/{id}")),
            "delete droplet",
            &resource,
        )
        .await?;
        Ok(())
    }

    async fn list_all(&self, filter: &ListFilter) -> Result<Vec<ProvisionedHost>, ProvisionError> {
        let mut hosts = Vec::new();
        let mut page = 1_u32;
        loop {
            let mut request = ApiRequest::get("/droplets")
                .query("page", page.to_string())
                .query("per_page", PAGE_SIZE);
            if !filter.expression.is_empty() {
                request = request.query("tag_name", filter.expression.clone());
            }
            let listing: DropletPage =
                send_json(&self.transport, request, "list droplets", "droplets").await?;
            hosts.extend(listing.droplets.into_iter().map(Droplet::into_host));
            let has_next = listing
                .links
                .pages
                .and_then(|pages| pages.next)
                .is_some_and(|next| !next.is_empty());
            if !has_next {
                return Ok(hosts);
            }
            page += 1;
        }
    }
}

impl<T: Transport> Provisioner for DigitalOceanProvisioner<T> {
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
