//! Scaleway instances.
//!
//! Servers are created stopped so cloud-init user data can be attached before
//! first boot, then powered on. Host identifiers are `server|zone`. Deleting a
//! server powers it off, waits for it to stop, then removes the server and its
//! volumes. Power actions and server removal go through `scaleway-rs`.

mod image;

use std::collections::BTreeMap;

use scaleway_rs::ScalewayApi;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use super::api::{delete_if_present, rollback, send, send_json};
use super::lookup;
use super::{ProviderKind, ProvisionError, ProvisionFuture, Provisioner, WaitPolicy};
use crate::composite_id;
use crate::host::{
    HostDeleteRequest, HostDescriptor, HostStatus, ListFilter, ProvisionedHost, TAG_ARCHITECTURE,
    TAG_PROJECT_ID,
};
use crate::transport::{ApiRequest, HttpTransport, Transport};
use image::ImageQuery;

/// Default API root.
pub const API_BASE: &str = "https://api.scaleway.com/instance/v1";

const DEFAULT_ARCHITECTURE: &str = "x86_64";
const PAGE_SIZE: usize = 50;
pub(super) const STATUS_TABLE: &[(&str, HostStatus)] = &[
    ("stopped", HostStatus::Initializing),
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
}

#[derive(Deserialize)]
struct Server {
    id: String,
    #[serde(default)]
    state: String,
    #[serde(default)]
    public_ip: Option<PublicIp>,
    #[serde(default)]
    volumes: BTreeMap<String, Volume>,
}

#[derive(Deserialize)]
struct PublicIp {
    address: String,
}

#[derive(Deserialize)]
struct Volume {
    id: String,
}

impl Server {
    fn volume_ids(&self) -> Vec<String> {
        self.volumes.values().map(|volume| volume.id.clone()).collect()
    }

    fn into_host(self, zone: &str) -> Result<ProvisionedHost, ProvisionError> {
        let id = composite_id::encode(&[&self.id, zone])?;
        let ip = self.public_ip.map(|ip| ip.address).unwrap_or_default();
        Ok(ProvisionedHost::observed(
            id,
            ip,
            HostStatus::map_native(&self.state, STATUS_TABLE),
        ))
    }
}

/// Reports whether a rejected create blames the commercial type.
fn is_instance_type_error(body: &str, plan: &str) -> bool {
    serde_json::from_str::<scaleway_rs::ScalewayApiError>(body).is_ok_and(|api_err| {
        matches!(api_err.resource.as_deref(), Some("commercial_type"))
            || api_err.resource_id.as_deref().is_some_and(|id| id == plan)
    })
}

/// Power actions and server removal.
pub trait ServerControl: Send + Sync {
    /// Performs `action` (`poweron`, `poweroff`) on a server.
    fn perform_action<'a>(
        &'a self,
        zone: &'a str,
        server_id: &'a str,
        action: &'a str,
    ) -> ProvisionFuture<'a, ()>;

    /// Deletes a server, leaving its volumes behind.
    fn delete_server<'a>(&'a self, zone: &'a str, server_id: &'a str) -> ProvisionFuture<'a, ()>;
}

impl ServerControl for ScalewayApi {
    fn perform_action<'a>(
        &'a self,
        zone: &'a str,
        server_id: &'a str,
        action: &'a str,
    ) -> ProvisionFuture<'a, ()> {
        Box::pin(async move {
            self.perform_instance_action_async(zone, server_id, action)
                .await
                .map_err(|err| {
                    ProvisionError::api(action, format!("server {server_id}"), err.to_string())
                })?;
            Ok(())
        })
    }

    fn delete_server<'a>(&'a self, zone: &'a str, server_id: &'a str) -> ProvisionFuture<'a, ()> {
        Box::pin(async move {
            self.delete_instance_async(zone, server_id)
                .await
                .map_err(|err| {
                    ProvisionError::api("delete server", format!("server {server_id}"), err.to_string())
                })?;
            Ok(())
        })
    }
}

/// Provisions servers through the Scaleway Instances API.
#[derive(Clone)]
pub struct ScalewayProvisioner<T = HttpTransport, C = ScalewayApi> {
    transport: T,
    api: ScalewayApi,
    control: C,
    project_id: Option<String>,
    organisation_id: Option<String>,
    wait: WaitPolicy,
}

impl<T: Transport> ScalewayProvisioner<T> {
    /// Creates an adapter; `secret_key` authenticates the `scaleway-rs`
    /// client used for image lookups, power actions and server removal.
    #[must_use]
    pub fn new(transport: T, secret_key: &str) -> Self {
        let api = ScalewayApi::new(secret_key);
        Self {
            transport,
            control: api.clone(),
            api,
            project_id: None,
            organisation_id: None,
            wait: WaitPolicy::default(),
        }
    }
}

impl<T: Transport, C: ServerControl> ScalewayProvisioner<T, C> {
    /// Replaces the client used for power actions and server removal.
    #[must_use]
    pub fn with_control<D: ServerControl>(self, control: D) -> ScalewayProvisioner<T, D> {
        ScalewayProvisioner {
            transport: self.transport,
            api: self.api,
            control,
            project_id: self.project_id,
            organisation_id: self.organisation_id,
            wait: self.wait,
        }
    }

    /// Sets the project used when a descriptor carries none.
    #[must_use]
    pub fn with_project_id(mut self, project_id: Option<String>) -> Self {
        self.project_id = project_id.filter(|value| !value.trim().is_empty());
        self
    }

    /// Sets the organisation used to scope image lookups.
    #[must_use]
    pub fn with_organisation_id(mut self, organisation_id: Option<String>) -> Self {
        self.organisation_id = organisation_id.filter(|value| !value.trim().is_empty());
        self
    }

    /// Overrides how long delete waits for a server to stop.
    #[must_use]
    pub const fn with_wait_policy(mut self, wait: WaitPolicy) -> Self {
        self.wait = wait;
        self
    }

    fn project_for<'a>(&'a self, descriptor: &'a HostDescriptor) -> Result<&'a str, ProvisionError> {
        descriptor
            .tag(TAG_PROJECT_ID)
            .or(self.project_id.as_deref())
            .ok_or_else(|| ProvisionError::configuration("scaleway requires a project id"))
    }

    async fn create_server(
        &self,
        descriptor: &HostDescriptor,
        zone: &str,
        project: &str,
        image_id: &str,
    ) -> Result<Server, ProvisionError> {
        let body = json!({
            "name": descriptor.name,
            "commercial_type": descriptor.plan,
            "image": image_id,
            "project": project,
            "tags": [ProviderKind::Scaleway.exit_node_marker()],
            "dynamic_ip_required": true,
            "boot_type": "local",
        });
        let response = self
            .transport
            .send(ApiRequest::post(format!("/zones/{zone}/servers")).json(body))
            .await
            .map_err(|err| ProvisionError::transport("create server", &descriptor.name, &err))?;
        if !response.is_success() {
            if is_instance_type_error(&response.body, &descriptor.plan) {
                return Err(ProvisionError::configuration(format!(
                    "instance type '{}' not available in zone {zone}",
                    descriptor.plan
                )));
            }
            return Err(ProvisionError::api(
                "create server",
                &descriptor.name,
                format!("HTTP {}: {}", response.status, response.body.trim()),
            ));
        }
        let envelope: ServerEnvelope = response.json().map_err(|err| {
            ProvisionError::api("create server", &descriptor.name, err.to_string())
        })?;
        Ok(envelope.server)
    }

    async fn boot(&self, zone: &str, server_id: &str, user_data: &str) -> Result<(), ProvisionError> {
        let resource = format!("server {server_id}");
        send(
            &self.transport,
            ApiRequest::patch(format!("/zones/{zone}/servers/{server_id}/user_data/cloud-init"))
                .text(user_data),
            "set user data",
            &resource,
        )
        .await?;
        self.action(zone, server_id, "poweron").await
    }

    async fn action(&self, zone: &str, server_id: &str, action: &str) -> Result<(), ProvisionError> {
        info!(server = server_id, zone, action, "server action");
        self.control.perform_action(zone, server_id, action).await
    }

    async fn destroy(
        &self,
        zone: &str,
        server_id: &str,
        volumes: &[String],
    ) -> Result<(), ProvisionError> {
        self.control.delete_server(zone, server_id).await?;
        for volume in volumes {
            delete_if_present(
                &self.transport,
                ApiRequest::delete(format!("/zones/{zone}/volumes/{volume}")),
                "delete volume",
                &format!("volume {volume}"),
            )
            .await?;
        }
        Ok(())
    }

    async fn create(&self, descriptor: &HostDescriptor) -> Result<ProvisionedHost, ProvisionError> {
        descriptor.validate()?;
        let zone = descriptor.zone_or_region();
        let project = self.project_for(descriptor)?;
        let query = ImageQuery {
            label: &descriptor.os_image,
            arch: descriptor
                .tag(TAG_ARCHITECTURE)
                .unwrap_or(DEFAULT_ARCHITECTURE),
            zone,
            project_id: Some(project),
            organisation_id: self.organisation_id.as_deref(),
        };
        let image_id = self.resolve_image_id(&query).await?;

        let server = self
            .create_server(descriptor, zone, project, &image_id)
            .await?;
        info!(server = %server.id, zone, "server created, attaching user data");
        if let Err(err) = self.boot(zone, &server.id, &descriptor.boot_script).await {
            let volumes = server.volume_ids();
            return Err(rollback(err, self.destroy(zone, &server.id, &volumes)).await);
        }
        Ok(ProvisionedHost::creating(composite_id::encode(&[
            &server.id, zone,
        ])?))
    }

    async fn get_server(&self, zone: &str, server_id: &str) -> Result<Server, ProvisionError> {
        let envelope: ServerEnvelope = send_json(
            &self.transport,
            ApiRequest::get(format!("/zones/{zone}/servers/{server_id}")),
            "get server",
            &format!("server {server_id}"),
        )
        .await?;
        Ok(envelope.server)
    }

    async fn fetch(&self, id: &str) -> Result<ProvisionedHost, ProvisionError> {
        let [server_id, zone] = composite_id::decode::<2>(id)?;
        self.get_server(&zone, &server_id).await?.into_host(&zone)
    }

    async fn remove(&self, request: &HostDeleteRequest) -> Result<(), ProvisionError> {
        let id =
            lookup::target_id(self, request, ProviderKind::Scaleway.exit_node_marker()).await?;
        let [server_id, zone] = composite_id::decode::<2>(&id)?;
        let server = self.get_server(&zone, &server_id).await?;
        let volumes = server.volume_ids();
        if server.state != "stopped" {
            if server.state != "stopping" {
                self.action(&zone, &server_id, "poweroff").await?;
            }
            let resource = format!("server {server_id}");
            let (this, zone_ref, server_ref) = (self, zone.as_str(), server_id.as_str());
            self.wait
                .until("power off", &resource, move || async move {
                    let current = this.get_server(zone_ref, server_ref).await?;
                    Ok(current.state == "stopped")
                })
                .await?;
        }
        self.destroy(&zone, &server_id, &volumes).await
    }

    async fn list_all(&self, filter: &ListFilter) -> Result<Vec<ProvisionedHost>, ProvisionError> {
        let zone = filter
            .zone
            .as_deref()
            .or(filter.region.as_deref())
            .filter(|zone| !zone.trim().is_empty())
            .ok_or_else(|| ProvisionError::configuration("listing hosts requires a zone"))?;
        let mut hosts = Vec::new();
        let mut page = 1_u32;
        loop {
            let mut request = ApiRequest::get(format!("/zones/{zone}/servers"))
                .query("page", page.to_string())
                .query("per_page", PAGE_SIZE.to_string());
            if !filter.expression.is_empty() {
                request = request.query("tags", filter.expression.clone());
            }
            let listing: ServerPage =
                send_json(&self.transport, request, "list servers", zone).await?;
            let count = listing.servers.len();
            for server in listing.servers {
                hosts.push(server.into_host(zone)?);
            }
            if count < PAGE_SIZE {
                return Ok(hosts);
            }
            page += 1;
        }
    }
}

impl<T: Transport, C: ServerControl> Provisioner for ScalewayProvisioner<T, C> {
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
