//! Equinix Metal (formerly Packet) devices.

use serde::Deserialize;
use serde_json::json;

use super::api::{send, send_json};
use super::lookup;
use super::{ProviderKind, ProvisionError, ProvisionFuture, Provisioner};
use crate::host::{
    HostDeleteRequest, HostDescriptor, HostStatus, ListFilter, ProvisionedHost, TAG_PROJECT_ID,
};
use crate::transport::{ApiRequest, HttpTransport, Transport};

/// Default API root.
pub const API_BASE: &str = "https://api.equinix.com/metal/v1";

pub(super) const STATUS_TABLE: &[(&str, HostStatus)] = &[
    ("queued", HostStatus::Creating),
    ("provisioning", HostStatus::Creating),
    ("failed", HostStatus::Error),
];

#[derive(Deserialize)]
struct Device {
    id: String,
    #[serde(default)]
    state: String,
    #[serde(default)]
    ip_addresses: Vec<IpAssignment>,
    #[serde(default)]
    tags: Vec<String>,
}

#[derive(Deserialize)]
struct IpAssignment {
    address: String,
    #[serde(default)]
    public: bool,
    #[serde(default)]
    address_family: u8,
}

#[derive(Deserialize)]
struct DevicePage {
    #[serde(default)]
    devices: Vec<Device>,
    #[serde(default)]
    meta: Option<Meta>,
}

#[derive(Deserialize)]
struct Meta {
    #[serde(default)]
    current_page: u32,
    #[serde(default)]
    last_page: u32,
}

impl Device {
    fn into_host(self) -> ProvisionedHost {
        let ip = self
            .ip_addresses
            .into_iter()
            .find(|assignment| assignment.public && assignment.address_family == 4)
            .map(|assignment| assignment.address)
            .unwrap_or_default();
        ProvisionedHost::observed(self.id, ip, HostStatus::map_native(&self.state, STATUS_TABLE))
    }
}

/// Provisions devices through the Equinix Metal API.
#[derive(Clone, Debug)]
pub struct EquinixProvisioner<T = HttpTransport> {
    transport: T,
}

impl<T: Transport> EquinixProvisioner<T> {
    /// Creates an adapter that sends requests through `transport`.
    #[must_use]
    pub const fn new(transport: T) -> Self {
        Self { transport }
    }

    async fn create(&self, descriptor: &HostDescriptor) -> Result<ProvisionedHost, ProvisionError> {
        descriptor.validate()?;
        let project = descriptor.require_tag(TAG_PROJECT_ID)?;
        let body = json!({
            "hostname": descriptor.name,
            "plan": descriptor.plan,
            "metro": descriptor.region,
            "operating_system": descriptor.os_image,
            "billing_cycle": "hourly",
            "userdata": descriptor.boot_script,
            "tags": [ProviderKind::Equinix.exit_node_marker()],
        });
        let device: Device = send_json(
            &self.transport,
            ApiRequest::post(format!("/projects/{project}/devices")).json(body),
            "create device",
            &descriptor.name,
        )
        .await?;
        Ok(device.into_host())
    }

    async fn fetch(&self, id: &str) -> Result<ProvisionedHost, ProvisionError> {
        let device: Device = send_json(
            &self.transport,
            ApiRequest::get(format!("/devices/{id}")),
            "get device",
            &format!("device {id}"),
        )
        .await?;
        Ok(device.into_host())
    }

    async fn remove(&self, request: &HostDeleteRequest) -> Result<(), ProvisionError> {
        let id =
            lookup::target_id(self, request, ProviderKind::Equinix.exit_node_marker()).await?;
        send(
            &self.transport,
            ApiRequest::delete(format!("/devices/{id}")),
            "delete device",
            &format!("device {id}"),
        )
        .await?;
        Ok(())
    }

    async fn list_all(&self, filter: &ListFilter) -> Result<Vec<ProvisionedHost>, ProvisionError> {
        let project = filter.require_project()?;
        let mut hosts = Vec::new();
        let mut page = 1_u32;
        loop {
            let listing: DevicePage = send_json(
                &self.transport,
                ApiRequest::get(format!("/projects/{project}/devices"))
                    .query("page", page.to_string())
                    .query("per_page", "100"),
                "list devices",
                &format!("project {project}"),
            )
            .await?;
            hosts.extend(
                listing
                    .devices
                    .into_iter()
                    .filter(|device| {
                        filter.expression.is_empty() || device.tags.contains(&filter.expression)
                    })
                    .map(Device::into_host),
            );
            match listing.meta {
                Some(meta) if meta.current_page < meta.last_page => page = meta.current_page + 1,
                _ => return Ok(hosts),
            }
        }
    }
}

impl<T: Transport> Provisioner for EquinixProvisioner<T> {
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
