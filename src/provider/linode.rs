//! Linode instances.
//!
//! The boot script travels as a private `StackScript` labelled with the host
//! name. Deleting a host removes the instance and then every `StackScript` of
//! the same label owned by the account.

use serde::Deserialize;
use serde_json::json;

use super::api::{delete_if_present, rollback, send, send_json};
use super::lookup;
use super::{ProviderKind, ProvisionError, ProvisionFuture, Provisioner};
use crate::host::{HostDeleteRequest, HostDescriptor, HostStatus, ListFilter, ProvisionedHost};
use crate::password;
use crate::transport::{ApiRequest, HttpTransport, Transport};

/// Default API root.
pub const API_BASE: &str = "https://api.linode.com/v4";

const FILTER_HEADER: &str = "X-Filter";
pub(super) const STATUS_TABLE: &[(&str, HostStatus)] = &[
    ("provisioning", HostStatus::Creating),
    ("booting", HostStatus::Initializing),
    ("running", HostStatus::Active),
];

#[derive(Deserialize)]
struct Instance {
    id: u64,
    #[serde(default)]
    label: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    ipv4: Vec<String>,
}

#[derive(Deserialize)]
struct StackScript {
    id: u64,
}

#[derive(Deserialize)]
struct Page<T> {
    #[serde(default = "Vec::new")]
    data: Vec<T>,
    #[serde(default)]
    page: u32,
    #[serde(default)]
    pages: u32,
}

impl Instance {
    fn into_host(self) -> ProvisionedHost {
        let ip = self.ipv4.into_iter().next().unwrap_or_default();
        ProvisionedHost::observed(
            self.id.to_string(),
            ip,
            HostStatus::map_native(&self.status, STATUS_TABLE),
        )
    }
}

/// Provisions instances through the Linode v4 API.
#[derive(Clone, Debug)]
pub struct LinodeProvisioner<T = HttpTransport> {
    transport: T,
}

impl<T: Transport> LinodeProvisioner<T> {
    /// Creates an adapter that sends requests through `transport`.
    #[must_use]
    pub const fn new(transport: T) -> Self {
        Self { transport }
    }

    async fn create(&self, descriptor: &HostDescriptor) -> Result<ProvisionedHost, ProvisionError> {
        descriptor.validate()?;
        let script: StackScript = send_json(
            &self.transport,
            ApiRequest::post("/linode/stackscripts").json(json!({
                "label": descriptor.name,
                "images": [descriptor.os_image],
                "script": descriptor.boot_script,
                "is_public": false,
            })),
            "create stackscript",
            &descriptor.name,
        )
        .await?;

        let body = json!({
            "label": descriptor.name,
            "region": descriptor.region,
            "type": descriptor.plan,
            "image": descriptor.os_image,
            "root_pass": password::generate(password::DEFAULT_LENGTH),
            "stackscript_id": script.id,
            "tags": [ProviderKind::Linode.exit_node_marker()],
            "booted": true,
        });
        let created = send_json::<Instance, _>(
            &self.transport,
            ApiRequest::post("/linode/instances").json(body),
            "create instance",
            &descriptor.name,
        )
        .await;
        match created {
            Ok(instance) => Ok(instance.into_host()),
            Err(err) => Err(rollback(err, self.delete_stackscript(script.id)).await),
        }
    }

    async fn delete_stackscript(&self, id: u64) -> Result<(), ProvisionError> {
        delete_if_present(
            &self.transport,
            ApiRequest::delete(format!("/linode/stackscripts/{id}")),
            "delete stackscript",
            &format!("stackscript {id}"),
        )
        .await
    }

    async fn get_instance(&self, id: &str) -> Result<Instance, ProvisionError> {
        send_json(
            &self.transport,
            ApiRequest::get(format!("/linode/instances/{id}")),
            "get instance",
            &format!("instance {id}"),
        )
        .await
    }

    async fn stackscripts_labelled(&self, label: &str) -> Result<Vec<u64>, ProvisionError> {
        let filter = json!({"label": label, "mine": true}).to_string();
        let mut ids = Vec::new();
        let mut page = 1_u32;
        loop {
            let listing: Page<StackScript> = send_json(
                &self.transport,
                ApiRequest::get("/linode/stackscripts")
                    .query("page", page.to_string())
                    .header(FILTER_HEADER, filter.clone()),
                "list stackscripts",
                label,
            )
            .await?;
            ids.extend(listing.data.into_iter().map(|script| script.id));
            if listing.page >= listing.pages {
                return Ok(ids);
            }
            page = listing.page + 1;
        }
    }

    async fn remove(&self, request: &HostDeleteRequest) -> Result<(), ProvisionError> {
        let id = lookup::target_id(self, request, ProviderKind::Linode.exit_node_marker()).await?;
        let instance = self.get_instance(&id).await?;
        send(
            &self.transport,
            ApiRequest::delete(format!("/linode/instances/{id}")),
            "delete instance",
            &format!("instance {id}"),
        )
        .await?;
        if instance.label.is_empty() {
            return Ok(());
        }
        for script in self.stackscripts_labelled(&instance.label).await? {
            self.delete_stackscript(script).await?;
        }
        Ok(())
    }

    async fn list_all(&self, filter: &ListFilter) -> Result<Vec<ProvisionedHost>, ProvisionError> {
        let mut hosts = Vec::new();
        let mut page = 1_u32;
        loop {
            let mut request =
                ApiRequest::get("/linode/instances").query("page", page.to_string());
            if !filter.expression.is_empty() {
                request = request.header(
                    FILTER_HEADER,
                    json!({"tags": filter.expression}).to_string(),
                );
            }
            let listing: Page<Instance> =
                send_json(&self.transport, request, "list instances", "instances").await?;
            hosts.extend(listing.data.into_iter().map(Instance::into_host));
            if listing.page >= listing.pages {
                return Ok(hosts);
            }
            page = listing.page + 1;
        }
    }
}

impl<T: Transport> Provisioner for LinodeProvisioner<T> {
    fn provision<'a>(
        &'a self,
        descriptor: &'a HostDescriptor,
    ) -> ProvisionFuture<'a, ProvisionedHost> {
        Box::pin(self.create(descriptor))
    }

    fn status<'a>(&'a self, id: &'a str) -> ProvisionFuture<'a, ProvisionedHost> {
        Box::pin(async move { Ok(self.get_instance(id).await?.into_host()) })
    }

    fn delete<'a>(&'a self, request: &'a HostDeleteRequest) -> ProvisionFuture<'a, ()> {
        Box::pin(self.remove(request))
    }

    fn list<'a>(&'a self, filter: &'a ListFilter) -> ProvisionFuture<'a, Vec<ProvisionedHost>> {
        Box::pin(self.list_all(filter))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedTransport;
    use rstest::{fixture, rstest};

    #[fixture]
    fn descriptor() -> HostDescriptor {
        HostDescriptor::builder()
            .name("exit-l")
            .region("eu-west")
            .plan("g6-nanode-1")
            .os_image("linode/ubuntu22.04")
            .boot_script("#!/bin/bash\n")
            .build()
            .expect("descriptor")
    }

    fn instance(status: &str, ips: &[&str]) -> serde_json::Value {
        json!({"id": 77, "label": "exit-l", "status": status, "ipv4": ips})
    }

    #[rstest]
    #[tokio::test]
    async fn provision_links_stackscript_and_random_root_password(descriptor: HostDescriptor) {
        let transport = ScriptedTransport::new();
        transport.push_json(200, &json!({"id": 5}));
        transport.push_json(200, &instance("provisioning", &[]));
        let adapter = LinodeProvisioner::new(transport.clone());

        let host = adapter.provision(&descriptor).await.expect("provision");

        assert_eq!(host, ProvisionedHost::creating("77"));
        let requests = transport.requests();
        let script = requests.first().and_then(ApiRequest::json_body).expect("script");
        assert_eq!(script["is_public"], false);
        assert_eq!(script["images"], json!(["linode/ubuntu22.04"]));
        let body = requests.get(1).and_then(ApiRequest::json_body).expect("instance");
        assert_eq!(body["stackscript_id"], 5);
        assert_eq!(body["tags"], json!(["inlets"]));
        let root_pass = body["root_pass"].as_str().expect("root password");
        assert_eq!(root_pass.len(), password::DEFAULT_LENGTH);
    }

    #[rstest]
    #[tokio::test]
    async fn failed_instance_create_removes_stackscript(descriptor: HostDescriptor) {
        let transport = ScriptedTransport::new();
        transport.push_json(200, &json!({"id": 5}));
        transport.push_json(400, &json!({"errors": [{"reason": "bad type"}]}));
        transport.push_status(500);
        let adapter = LinodeProvisioner::new(transport.clone());

        let err = adapter.provision(&descriptor).await.expect_err("fails");

        assert!(matches!(err, ProvisionError::RollbackFailed { .. }), "{err}");
        assert_eq!(
            transport.calls().last().map(String::as_str),
            Some("DELETE /linode/stackscripts/5")
        );
    }

    #[rstest]
    #[case("provisioning", &[], HostStatus::Creating)]
    #[case("booting", &["192.0.2.4"], HostStatus::Initializing)]
    #[case("running", &["192.0.2.4"], HostStatus::Active)]
    #[case("offline", &["192.0.2.4"], HostStatus::Other(String::from("offline")))]
    #[tokio::test]
    async fn status_maps_linode_states(
        #[case] native: &str,
        #[case] ips: &[&str],
        #[case] expected: HostStatus,
    ) {
        let transport = ScriptedTransport::new();
        transport.push_json(200, &instance(native, ips));
        let adapter = LinodeProvisioner::new(transport);
        assert_eq!(adapter.status("77").await.expect("status").status, expected);
    }

    #[rstest]
    #[tokio::test]
    async fn delete_removes_stackscripts_with_matching_label() {
        let transport = ScriptedTransport::new();
        transport.push_json(200, &instance("running", &["192.0.2.4"]));
        transport.push_json(200, &json!({}));
        transport.push_json(200, &json!({"data": [{"id": 5}, {"id": 6}], "page": 1, "pages": 1}));
        transport.push_json(200, &json!({}));
        transport.push_json(200, &json!({}));
        let adapter = LinodeProvisioner::new(transport.clone());

        adapter
            .delete(&HostDeleteRequest::by_id("77"))
            .await
            .expect("delete");

        assert_eq!(
            transport.calls(),
            vec![
                "GET /linode/instances/77",
                "DELETE /linode/instances/77",
                "GET /linode/stackscripts",
                "DELETE /linode/stackscripts/5",
                "DELETE /linode/stackscripts/6"
            ]
        );
        let requests = transport.requests();
        let filter = requests
            .get(2)
            .and_then(|request| request.headers.first())
            .map(|(_, value)| value.clone())
            .expect("filter header");
        let parsed: serde_json::Value = serde_json::from_str(&filter).expect("json filter");
        assert_eq!(parsed, json!({"label": "exit-l", "mine": true}));
    }

    #[rstest]
    #[tokio::test]
    async fn list_sends_tag_filter_header() {
        let transport = ScriptedTransport::new();
        transport.push_json(
            200,
            &json!({"data": [instance("running", &["192.0.2.4"])], "page": 1, "pages": 1}),
        );
        let adapter = LinodeProvisioner::new(transport.clone());
        let filter = HostDeleteRequest::by_ip("192.0.2.4").list_filter("inlets");

        let hosts = adapter.list(&filter).await.expect("list");

        assert_eq!(hosts.len(), 1);
        let requests = transport.requests();
        assert_eq!(
            requests.first().and_then(|request| request.headers.first()).cloned(),
            Some((String::from("X-Filter"), String::from(r#"{"tags":"inlets"}"#)))
        );
    }
}
