//! OVHcloud Public Cloud instances.
//!
//! Instances live inside a Public Cloud project, so host identifiers are
//! `instance|project`. Flavors and images may be given by name and are
//! resolved within the target region. Instances carry no tags, so exit nodes
//! are marked by an `inlets-` name prefix.

use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use super::api::{send, send_json};
use super::lookup;
use super::{ProviderKind, ProvisionError, ProvisionFuture, Provisioner};
use crate::composite_id;
use crate::host::{
    HostDeleteRequest, HostDescriptor, HostStatus, ListFilter, ProvisionedHost, TAG_PROJECT_ID,
    TAG_SSH_KEY,
};
use crate::transport::{ApiRequest, HttpTransport, Transport};

/// Default API root.
pub const API_BASE: &str = "https://eu.api.ovh.com/1.0";

pub(super) const STATUS_TABLE: &[(&str, HostStatus)] = &[
    ("BUILD", HostStatus::Creating),
    ("BUILDING", HostStatus::Creating),
    ("REBOOT", HostStatus::Initializing),
    ("ACTIVE", HostStatus::Active),
    ("ERROR", HostStatus::Error),
];

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Instance {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    ip_addresses: Vec<IpAddress>,
}

#[derive(Deserialize)]
struct IpAddress {
    ip: String,
    #[serde(default, rename = "type")]
    kind: String,
    #[serde(default)]
    version: u8,
}

#[derive(Deserialize)]
struct Named {
    id: String,
    #[serde(default)]
    name: String,
}

/// Returns the instance name for `name`, carrying the exit-node prefix.
fn exit_node_name(name: &str) -> String {
    let marker = ProviderKind::Ovh.exit_node_marker();
    if name.starts_with(marker) {
        name.to_owned()
    } else {
        format!("{marker}{name}")
    }
}

impl Instance {
    fn into_host(self, project: &str) -> Result<ProvisionedHost, ProvisionError> {
        let id = composite_id::encode(&[&self.id, project])?;
        let ip = self
            .ip_addresses
            .into_iter()
            .find(|address| address.kind == "public" && address.version == 4)
            .map(|address| address.ip)
            .unwrap_or_default();
        Ok(ProvisionedHost::observed(
            id,
            ip,
            HostStatus::map_native(&self.status, STATUS_TABLE),
        ))
    }
}

/// Provisions instances through the OVHcloud API.
#[derive(Clone, Debug)]
pub struct OvhProvisioner<T = HttpTransport> {
    transport: T,
}

impl<T: Transport> OvhProvisioner<T> {
    /// Creates an adapter that sends requests through `transport`.
    #[must_use]
    pub const fn new(transport: T) -> Self {
        Self { transport }
    }

    /// Returns `value` when it is already an identifier, otherwise the id of
    /// the catalogue entry named `value` in `region`.
    async fn resolve(
        &self,
        project: &str,
        catalogue: &str,
        value: &str,
        region: &str,
    ) -> Result<String, ProvisionError> {
        if Uuid::parse_str(value).is_ok() {
            return Ok(value.to_owned());
        }
        let mut request = ApiRequest::get(format!("/cloud/project/{project}/{catalogue}"))
            .query("region", region);
        if catalogue == "image" {
            request = request.query("osType", "linux");
        }
        let entries: Vec<Named> = send_json(
            &self.transport,
            request,
            &format!("list {catalogue}s"),
            &format!("project {project}"),
        )
        .await?;
        entries
            .into_iter()
            .find(|entry| entry.name == value)
            .map(|entry| entry.id)
            .ok_or_else(|| {
                ProvisionError::configuration(format!(
                    "no ovh {catalogue} named '{value}' in region {region}"
                ))
            })
    }

    async fn create(&self, descriptor: &HostDescriptor) -> Result<ProvisionedHost, ProvisionError> {
        descriptor.validate()?;
        let project = descriptor.require_tag(TAG_PROJECT_ID)?;
        let region = descriptor.region.as_str();
        let flavor = self
            .resolve(project, "flavor", &descriptor.plan, region)
            .await?;
        let image = self
            .resolve(project, "image", &descriptor.os_image, region)
            .await?;
        let mut body = json!({
            "name": exit_node_name(&descriptor.name),
            "region": region,
            "flavorId": flavor,
            "imageId": image,
            "userData": descriptor.boot_script,
            "monthlyBilling": false,
        });
        if let Some(key) = descriptor.tag(TAG_SSH_KEY) {
            body["sshKeyId"] = json!(key);
        }
        let instance: Instance = send_json(
            &self.transport,
            ApiRequest::post(format!("/cloud/project/{project}/instance")).json(body),
            "create instance",
            &descriptor.name,
        )
        .await?;
        instance.into_host(project)
    }

    async fn fetch(&self, id: &str) -> Result<ProvisionedHost, ProvisionError> {
        let [instance_id, project] = composite_id::decode::<2>(id)?;
        let instance: Instance = send_json(
            &self.transport,
            ApiRequest::get(format!("/cloud/project/{project}/instance/{instance_id}")),
            "get instance",
            &format!("instance {instance_id}"),
        )
        .await?;
        instance.into_host(&project)
    }

    async fn remove(&self, request: &HostDeleteRequest) -> Result<(), ProvisionError> {
        let id = lookup::target_id(self, request, ProviderKind::Ovh.exit_node_marker()).await?;
        let [instance_id, project] = composite_id::decode::<2>(&id)?;
        send(
            &self.transport,
            ApiRequest::delete(format!("/cloud/project/{project}/instance/{instance_id}")),
            "delete instance",
            &format!("instance {instance_id}"),
        )
        .await?;
        Ok(())
    }

    async fn list_all(&self, filter: &ListFilter) -> Result<Vec<ProvisionedHost>, ProvisionError> {
        let project = filter.require_project()?;
        if filter.expression.is_empty() {
            return Err(ProvisionError::configuration(
                "ovh listing needs an instance name prefix",
            ));
        }
        let mut request = ApiRequest::get(format!("/cloud/project/{project}/instance"));
        if let Some(region) = filter.region.as_deref() {
            request = request.query("region", region);
        }
        let instances: Vec<Instance> = send_json(
            &self.transport,
            request,
            "list instances",
            &format!("project {project}"),
        )
        .await?;
        instances
            .into_iter()
            .filter(|instance| instance.name.starts_with(&filter.expression))
            .map(|instance| instance.into_host(project))
            .collect()
    }
}

impl<T: Transport> Provisioner for OvhProvisioner<T> {
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
