//! Civo instances.
//!
//! Civo scopes instances by region, so host identifiers are `instance|region`.

use serde::Deserialize;

use super::api::{send, send_json};
use super::lookup;
use super::{ProviderKind, ProvisionError, ProvisionFuture, Provisioner};
use crate::composite_id;
use crate::host::{HostDeleteRequest, HostDescriptor, HostStatus, ListFilter, ProvisionedHost};
use crate::transport::{ApiRequest, HttpTransport, Transport};

/// Default API root.
pub const API_BASE: &str = "https://api.civo.com/v2";

pub(super) const STATUS_TABLE: &[(&str, HostStatus)] = &[
    ("BUILDING", HostStatus::Creating),
    ("BUILD_PENDING", HostStatus::Creating),
    ("ACTIVE", HostStatus::Active),
    ("FAILED", HostStatus::Error),
];

#[derive(Deserialize)]
struct Instance {
    id: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    public_ip: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
}

#[derive(Deserialize)]
struct InstancePage {
    #[serde(default)]
    page: u32,
    #[serde(default)]
    pages: u32,
    #[serde(default)]
    items: Vec<Instance>,
}

impl Instance {
    fn into_host(self, region: &str) -> Result<ProvisionedHost, ProvisionError> {
        let id = composite_id::encode(&[&self.id, region])?;
        Ok(ProvisionedHost::observed(
            id,
            self.public_ip.unwrap_or_default(),
            HostStatus::map_native(&self.status, STATUS_TABLE),
        ))
    }
}

/// Provisions instances through the Civo v2 API.
#[derive(Clone, Debug)]
pub struct CivoProvisioner<T = HttpTransport> {
    transport: T,
}

impl<T: Transport> CivoProvisioner<T> {
    /// Creates an adapter that sends requests through `transport`.
    #[must_use]
    pub const fn new(transport: T) -> Self {
        Self { transport }
    }

    async fn create(&self, descriptor: &HostDescriptor) -> Result<ProvisionedHost, ProvisionError> {
        descriptor.validate()?;
        let form = vec![
            (String::from("hostname"), descriptor.name.clone()),
            (String::from("size"), descriptor.plan.clone()),
            (String::from("region"), descriptor.region.clone()),
            (String::from("public_ip"), String::from("create")),
            (String::from("template_id"), descriptor.os_image.clone()),
            (String::from("initial_user"), String::from("civo")),
            (String::from("script"), descriptor.boot_script.clone()),
            (
                String::from("tags"),
                ProviderKind::Civo.exit_node_marker().to_owned(),
            ),
        ];
        let instance: Instance = send_json(
            &self.transport,
            ApiRequest::post("/instances").form(form),
            "create instance",
            &descriptor.name,
        )
        .await?;
        let id = composite_id::encode(&[&instance.id, &descriptor.region])?;
        Ok(ProvisionedHost::creating(id))
    }

    async fn fetch(&self, id: &str) -> Result<ProvisionedHost, ProvisionError> {
        let [instance_id, region] = composite_id::decode::<2>(id)?;
        let instance: Instance = send_json(
            &self.transport,
            ApiRequest::get(format!("/instances/{instance_id}")).query("region", region.clone()),
            "get instance",
            &format!("instance {instance_id}"),
        )
        .await?;
        instance.into_host(&region)
    }

    async fn remove(&self, request: &HostDeleteRequest) -> Result<(), ProvisionError> {
        let id = lookup::target_id(self, request, ProviderKind::Civo.exit_node_marker()).await?;
        let [instance_id, region] = composite_id::decode::<2>(&id)?;
        send(
            &self.transport,
            ApiRequest::delete(format!("/instances/{instance_id}")).query("region", region),
            "delete instance",
            &format!("instance {instance_id}"),
        )
        .await?;
        Ok(())
    }

    async fn list_all(&self, filter: &ListFilter) -> Result<Vec<ProvisionedHost>, ProvisionError> {
        let region = filter.require_region()?;
        let mut hosts = Vec::new();
        let mut page = 1_u32;
        loop {
            let listing: InstancePage = send_json(
                &self.transport,
                ApiRequest::get("/instances")
                    .query("region", region)
                    .query("page", page.to_string())
                    .query("per_page", "100"),
                "list instances",
                "instances",
            )
            .await?;
            for instance in listing.items {
                if filter.expression.is_empty() || instance.tags.contains(&filter.expression) {
                    hosts.push(instance.into_host(region)?);
                }
            }
            if listing.page >= listing.pages {
                return Ok(hosts);
            }
            page = listing.page + 1;
        }
    }
}

impl<T: Transport> Provisioner for CivoProvisioner<T> {
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
