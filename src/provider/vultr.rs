//! Vultr instances.
//!
//! The boot script is uploaded as a startup script named after the host, so
//! deleting a host also removes the script with the matching name.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;
use serde_json::json;

use super::api::{delete_if_present, rollback, send, send_json};
use super::lookup;
use super::{ProviderKind, ProvisionError, ProvisionFuture, Provisioner};
use crate::host::{
    HostDeleteRequest, HostDescriptor, HostStatus, ListFilter, ProvisionedHost, TAG_SSH_KEY,
};
use crate::transport::{ApiRequest, HttpTransport, Transport};

/// Default API root.
pub const API_BASE: &str = "https://api.vultr.com/v2";

const UNASSIGNED_IP: &str = "0.0.0.0";

#[derive(Deserialize)]
struct InstanceEnvelope {
    instance: Instance,
}

#[derive(Deserialize)]
struct InstancePage {
    #[serde(default)]
    instances: Vec<Instance>,
    #[serde(default)]
    meta: Option<Meta>,
}

#[derive(Deserialize)]
struct Instance {
    id: String,
    #[serde(default)]
    label: String,
    #[serde(default)]
    main_ip: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    server_status: String,
}

#[derive(Deserialize)]
struct ScriptEnvelope {
    startup_script: Script,
}

#[derive(Deserialize)]
struct ScriptPage {
    #[serde(default)]
    startup_scripts: Vec<Script>,
    #[serde(default)]
    meta: Option<Meta>,
}

#[derive(Deserialize)]
struct Script {
    id: String,
    #[serde(default)]
    name: String,
}

#[derive(Deserialize)]
struct Meta {
    #[serde(default)]
    links: Option<Links>,
}

#[derive(Deserialize)]
struct Links {
    #[serde(default)]
    next: String,
}

impl Meta {
    fn next_cursor(self) -> Option<String> {
        self.links
            .map(|links| links.next)
            .filter(|cursor| !cursor.is_empty())
    }
}

/// Maps Vultr's `status` and `server_status` pair onto a canonical status.
pub(super) fn map_status(status: &str, server_status: &str) -> HostStatus {
    match (status, server_status) {
        ("pending", _) => HostStatus::Creating,
        ("active", "ok") => HostStatus::Active,
        ("active", _) => HostStatus::Initializing,
        (other, _) => HostStatus::map_native(other, &[]),
    }
}

impl Instance {
    fn into_host(self) -> ProvisionedHost {
        let ip = if self.main_ip == UNASSIGNED_IP {
            String::new()
        } else {
            self.main_ip
        };
        ProvisionedHost::observed(self.id, ip, map_status(&self.status, &self.server_status))
    }
}

/// Provisions instances through the Vultr v2 API.
#[derive(Clone, Debug)]
pub struct VultrProvisioner<T = HttpTransport> {
    transport: T,
}

impl<T: Transport> VultrProvisioner<T> {
    /// Creates an adapter that sends requests through `transport`.
    #[must_use]
    pub const fn new(transport: T) -> Self {
        Self { transport }
    }

    async fn create(&self, descriptor: &HostDescriptor) -> Result<ProvisionedHost, ProvisionError> {
        descriptor.validate()?;
        let os_id: u32 = descriptor.os_image.parse().map_err(|_| {
            ProvisionError::configuration(format!(
                "vultr expects a numeric os id, got '{}'",
                descriptor.os_image
            ))
        })?;

        let script: ScriptEnvelope = send_json(
            &self.transport,
            ApiRequest::post("/startup-scripts").json(json!({
                "name": descriptor.name,
                "type": "boot",
                "script": STANDARD.encode(descriptor.boot_script.as_bytes()),
            })),
            "create startup script",
            &descriptor.name,
        )
        .await?;
        let script_id = script.startup_script.id;

        let mut body = json!({
            "region": descriptor.region,
            "plan": descriptor.plan,
            "os_id": os_id,
            "label": descriptor.name,
            "hostname": descriptor.name,
            "script_id": script_id,
            "tags": [ProviderKind::Vultr.exit_node_marker()],
        });
        if let Some(key) = descriptor.tag(TAG_SSH_KEY) {
            body["sshkey_id"] = json!([key]);
        }
        let created = send_json::<InstanceEnvelope, _>(
            &self.transport,
            ApiRequest::post("/instances").json(body),
            "create instance",
            &descriptor.name,
        )
        .await;
        match created {
            Ok(envelope) => Ok(envelope.instance.into_host()),
            Err(err) => Err(rollback(err, self.delete_script(&script_id)).await),
        }
    }

    async fn delete_script(&self, script_id: &str) -> Result<(), ProvisionError> {
        delete_if_present(
            &self.transport,
            ApiRequest::delete(format!("/startup-scripts/{script_id}")),
            "delete startup script",
            &format!("startup script {script_id}"),
        )
        .await
    }

    async fn get_instance(&self, id: &str) -> Result<Instance, ProvisionError> {
        let envelope: InstanceEnvelope = send_json(
            &self.transport,
            ApiRequest::get(format!("/instances/{id}")),
            "get instance",
            &format!("instance {id}"),
        )
        .await?;
        Ok(envelope.instance)
    }

    async fn scripts_named(&self, name: &str) -> Result<Vec<String>, ProvisionError> {
        let mut ids = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let mut request = ApiRequest::get("/startup-scripts").query("per_page", "100");
            if let Some(next) = cursor.take() {
                request = request.query("cursor", next);
            }
            let page: ScriptPage =
                send_json(&self.transport, request, "list startup scripts", "startup scripts")
                    .await?;
            ids.extend(
                page.startup_scripts
                    .into_iter()
                    .filter(|script| script.name == name)
                    .map(|script| script.id),
            );
            cursor = page.meta.and_then(Meta::next_cursor);
            if cursor.is_none() {
                return Ok(ids);
            }
        }
    }

    async fn remove(&self, request: &HostDeleteRequest) -> Result<(), ProvisionError> {
        let id = lookup::target_id(self, request, ProviderKind::Vultr.exit_node_marker()).await?;
        let instance = self.get_instance(&id).await?;
        send(
            &self.transport,
            ApiRequest::delete(format!("/instances/{id}")),
            "delete instance",
            &format!("instance {id}"),
        )
        .await?;
        if instance.label.is_empty() {
            return Ok(());
        }
        for script_id in self.scripts_named(&instance.label).await? {
            self.delete_script(&script_id).await?;
        }
        Ok(())
    }

    async fn list_all(&self, filter: &ListFilter) -> Result<Vec<ProvisionedHost>, ProvisionError> {
        let mut hosts = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let mut request = ApiRequest::get("/instances").query("per_page", "100");
            if !filter.expression.is_empty() {
                request = request.query("tag", filter.expression.clone());
            }
            if let Some(next) = cursor.take() {
                request = request.query("cursor", next);
            }
            let page: InstancePage =
                send_json(&self.transport, request, "list instances", "instances").await?;
            hosts.extend(page.instances.into_iter().map(Instance::into_host));
            cursor = page.meta.and_then(Meta::next_cursor);
            if cursor.is_none() {
                return Ok(hosts);
            }
        }
    }
}

impl<T: Transport> Provisioner for VultrProvisioner<T> {
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
            .name("exit-v")
            .region("lhr")
            .plan("vc2-1c-1gb")
            .os_image("1743")
            .boot_script("#!/bin/bash\n")
            .build()
            .expect("descriptor")
    }

    fn instance(status: &str, server_status: &str, ip: &str) -> serde_json::Value {
        json!({"instance": {"id": "inst-1", "label": "exit-v", "main_ip": ip,
                            "status": status, "server_status": server_status}})
    }

    #[rstest]
    #[tokio::test]
    async fn provision_uploads_encoded_startup_script(descriptor: HostDescriptor) {
        let transport = ScriptedTransport::new();
        transport.push_json(201, &json!({"startup_script": {"id": "script-1", "name": "exit-v"}}));
        transport.push_json(202, &instance("pending", "none", "0.0.0.0"));
        let adapter = VultrProvisioner::new(transport.clone());

        let host = adapter.provision(&descriptor).await.expect("provision");

        assert_eq!(host, ProvisionedHost::creating("inst-1"));
        let requests = transport.requests();
        let script_body = requests.first().and_then(ApiRequest::json_body).expect("script");
        assert_eq!(script_body["script"], STANDARD.encode("#!/bin/bash\n"));
        let instance_body = requests.get(1).and_then(ApiRequest::json_body).expect("instance");
        assert_eq!(instance_body["script_id"], "script-1");
        assert_eq!(instance_body["os_id"], 1743);
    }

    #[rstest]
    #[tokio::test]
    async fn failed_instance_create_removes_startup_script(descriptor: HostDescriptor) {
        let transport = ScriptedTransport::new();
        transport.push_json(201, &json!({"startup_script": {"id": "script-1"}}));
        transport.push_json(400, &json!({"error": "invalid plan"}));
        transport.push_status(204);
        let adapter = VultrProvisioner::new(transport.clone());

        let err = adapter.provision(&descriptor).await.expect_err("create fails");

        assert!(matches!(err, ProvisionError::ProviderApi { .. }));
        assert_eq!(
            transport.calls(),
            vec![
                "POST /startup-scripts",
                "POST /instances",
                "DELETE /startup-scripts/script-1"
            ]
        );
    }

    #[rstest]
    #[tokio::test]
    async fn non_numeric_os_is_a_configuration_error() {
        let transport = ScriptedTransport::new();
        let adapter = VultrProvisioner::new(transport.clone());
        let descriptor = HostDescriptor::builder()
            .name("exit-v")
            .region("lhr")
            .plan("vc2-1c-1gb")
            .os_image("ubuntu")
            .build()
            .expect("descriptor");
        let err = adapter.provision(&descriptor).await.expect_err("bad os");
        assert!(matches!(err, ProvisionError::Configuration { .. }));
        assert!(transport.requests().is_empty());
    }

    #[rstest]
    #[case("pending", "none", "0.0.0.0", HostStatus::Creating)]
    #[case("active", "installingbooting", "203.0.113.8", HostStatus::Initializing)]
    #[case("active", "ok", "203.0.113.8", HostStatus::Active)]
    #[case("active", "ok", "0.0.0.0", HostStatus::Initializing)]
    #[case("suspended", "ok", "203.0.113.8", HostStatus::Other(String::from("suspended")))]
    fn status_pairs_map_to_canonical_states(
        #[case] status: &str,
        #[case] server_status: &str,
        #[case] ip: &str,
        #[case] expected: HostStatus,
    ) {
        let parsed: InstanceEnvelope =
            serde_json::from_value(instance(status, server_status, ip)).expect("parse");
        assert_eq!(parsed.instance.into_host().status, expected);
    }

    #[rstest]
    #[tokio::test]
    async fn delete_removes_instance_and_matching_script() {
        let transport = ScriptedTransport::new();
        transport.push_json(200, &instance("active", "ok", "203.0.113.8"));
        transport.push_status(204);
        transport.push_json(
            200,
            &json!({"startup_scripts": [
                {"id": "script-1", "name": "exit-v"},
                {"id": "script-2", "name": "other"}
            ], "meta": {"links": {"next": ""}}}),
        );
        transport.push_status(204);
        let adapter = VultrProvisioner::new(transport.clone());

        adapter
            .delete(&HostDeleteRequest::by_id("inst-1"))
            .await
            .expect("delete");

        assert_eq!(
            transport.calls(),
            vec![
                "GET /instances/inst-1",
                "DELETE /instances/inst-1",
                "GET /startup-scripts",
                "DELETE /startup-scripts/script-1"
            ]
        );
    }
}
