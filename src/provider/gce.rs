//! Google Compute Engine instances.
//!
//! Each host gets its own ingress firewall rule, targeted through a network
//! tag of the same name. The rule name is recorded in instance metadata so
//! delete can remove it without the original descriptor. Host identifiers are
//! `name|zone|project`.

use serde::Deserialize;
use serde_json::{Value, json};
use tracing::info;

use super::api::{delete_if_present, exists, rollback, send, send_json};
use super::lookup;
use super::{ProviderKind, ProvisionError, ProvisionFuture, Provisioner};
use crate::composite_id;
use crate::host::{
    HostDeleteRequest, HostDescriptor, HostStatus, ListFilter, ProvisionedHost,
    TAG_FIREWALL_NAME, TAG_PROJECT_ID,
};
use crate::transport::{ApiRequest, HttpTransport, Transport};

/// Default API root.
pub const API_BASE: &str = "https://compute.googleapis.com/compute/v1";

const DEFAULT_FIREWALL_PREFIX: &str = "inlets";
const FIREWALL_METADATA_KEY: &str = "inlets-firewall";
pub(super) const STATUS_TABLE: &[(&str, HostStatus)] = &[
    ("PROVISIONING", HostStatus::Creating),
    ("STAGING", HostStatus::Initializing),
    ("RUNNING", HostStatus::Active),
];

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Instance {
    name: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    network_interfaces: Vec<NetworkInterface>,
    #[serde(default)]
    metadata: Option<Metadata>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NetworkInterface {
    #[serde(default)]
    access_configs: Vec<AccessConfig>,
}

#[derive(Deserialize)]
struct AccessConfig {
    #[serde(default, rename = "natIP")]
    nat_ip: Option<String>,
}

#[derive(Deserialize)]
struct Metadata {
    #[serde(default)]
    items: Vec<MetadataItem>,
}

#[derive(Deserialize)]
struct MetadataItem {
    key: String,
    #[serde(default)]
    value: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstanceList {
    #[serde(default)]
    items: Vec<Instance>,
    #[serde(default)]
    next_page_token: Option<String>,
}

impl Instance {
    fn nat_ip(&self) -> String {
        self.network_interfaces
            .iter()
            .flat_map(|interface| &interface.access_configs)
            .find_map(|config| config.nat_ip.clone())
            .unwrap_or_default()
    }

    fn firewall_rule(&self) -> Option<String> {
        self.metadata
            .as_ref()?
            .items
            .iter()
            .find(|item| item.key == FIREWALL_METADATA_KEY)
            .map(|item| item.value.clone())
            .filter(|value| !value.is_empty())
    }

    fn into_host(self, zone: &str, project: &str) -> Result<ProvisionedHost, ProvisionError> {
        let ip = self.nat_ip();
        let id = composite_id::encode(&[&self.name, zone, project])?;
        Ok(ProvisionedHost::observed(
            id,
            ip,
            HostStatus::map_native(&self.status, STATUS_TABLE),
        ))
    }
}

/// Returns the per-host firewall rule name for `descriptor`.
fn firewall_rule_name(descriptor: &HostDescriptor) -> String {
    let prefix = descriptor
        .tag(TAG_FIREWALL_NAME)
        .unwrap_or(DEFAULT_FIREWALL_PREFIX);
    format!("{prefix}-{}", descriptor.name)
}

fn firewall_body(
    descriptor: &HostDescriptor,
    project: &str,
    rule: &str,
) -> Result<Value, ProvisionError> {
    let allowed = if descriptor.is_pro() {
        json!([{"IPProtocol": "tcp"}])
    } else {
        let control_port = descriptor.control_port()?.to_string();
        json!([{"IPProtocol": "tcp", "ports": [control_port, "80", "443"]}])
    };
    Ok(json!({
        "name": rule,
        "description": "Ingress for a tunnel exit node",
        "network": format!("projects/{project}/global/networks/default"),
        "direction": "INGRESS",
        "sourceRanges": ["0.0.0.0/0"],
        "allowed": allowed,
        "targetTags": [rule],
    }))
}

fn instance_body(descriptor: &HostDescriptor, zone: &str, rule: &str) -> Value {
    json!({
        "name": descriptor.name,
        "description": "Tunnel exit node",
        "machineType": format!("zones/{zone}/machineTypes/{}", descriptor.plan),
        "canIpForward": true,
        "disks": [{
            "autoDelete": true,
            "boot": true,
            "deviceName": descriptor.name,
            "mode": "READ_WRITE",
            "type": "PERSISTENT",
            "initializeParams": {
                "diskName": descriptor.name,
                "diskSizeGb": "15",
                "sourceImage": descriptor.os_image,
            },
        }],
        "metadata": {"items": [
            {"key": "startup-script", "value": descriptor.boot_script},
            {"key": FIREWALL_METADATA_KEY, "value": rule},
        ]},
        "labels": {"inlets": "exit-node"},
        "tags": {"items": ["http-server", "https-server", rule]},
        "scheduling": {
            "automaticRestart": true,
            "onHostMaintenance": "MIGRATE",
            "preemptible": false,
        },
        "networkInterfaces": [{
            "network": "global/networks/default",
            "accessConfigs": [{"type": "ONE_TO_ONE_NAT", "name": "External NAT"}],
        }],
        "serviceAccounts": [{
            "email": "default",
            "scopes": ["https://www.googleapis.com/auth/compute"],
        }],
    })
}

/// Provisions instances through the Compute Engine REST API.
#[derive(Clone, Debug)]
pub struct GceProvisioner<T = HttpTransport> {
    transport: T,
}

impl<T: Transport> GceProvisioner<T> {
    /// Creates an adapter that sends requests through `transport`.
    #[must_use]
    pub const fn new(transport: T) -> Self {
        Self { transport }
    }

    /// Creates the per-host firewall rule. A rule that already exists
    /// belongs to another host of the same name, so it is never reused.
    async fn create_firewall(
        &self,
        descriptor: &HostDescriptor,
        project: &str,
        rule: &str,
    ) -> Result<(), ProvisionError> {
        let body = firewall_body(descriptor, project, rule)?;
        let path = format!("/projects/{project}/global/firewalls");
        let resource = format!("firewall {rule}");
        let taken = exists(
            &self.transport,
            ApiRequest::get(format!("{path}/{rule}")),
            "get firewall",
            &resource,
        )
        .await?;
        if taken {
            return Err(ProvisionError::configuration(format!(
                "firewall rule {rule} already exists; choose another host name"
            )));
        }
        info!(rule, "creating firewall rule");
        send(
            &self.transport,
            ApiRequest::post(path).json(body),
            "create firewall",
            &resource,
        )
        .await?;
        Ok(())
    }

    async fn delete_firewall(&self, project: &str, rule: &str) -> Result<(), ProvisionError> {
        delete_if_present(
            &self.transport,
            ApiRequest::delete(format!("/projects/{project}/global/firewalls/{rule}")),
            "delete firewall",
            &format!("firewall {rule}"),
        )
        .await
    }

    async fn create(&self, descriptor: &HostDescriptor) -> Result<ProvisionedHost, ProvisionError> {
        descriptor.validate()?;
        let project = descriptor.require_tag(TAG_PROJECT_ID)?;
        let zone = descriptor.zone_or_region();
        let rule = firewall_rule_name(descriptor);

        self.create_firewall(descriptor, project, &rule).await?;
        let inserted = send(
            &self.transport,
            ApiRequest::post(format!("/projects/{project}/zones/{zone}/instances"))
                .json(instance_body(descriptor, zone, &rule)),
            "create instance",
            &descriptor.name,
        )
        .await;
        if let Err(err) = inserted {
            return Err(rollback(err, self.delete_firewall(project, &rule)).await);
        }
        let id = composite_id::encode(&[&descriptor.name, zone, project])?;
        Ok(ProvisionedHost::creating(id))
    }

    async fn get_instance(
        &self,
        name: &str,
        zone: &str,
        project: &str,
    ) -> Result<Instance, ProvisionError> {
        send_json(
            &self.transport,
            ApiRequest::get(format!("/projects/{project}/zones/{zone}/instances/{name}")),
            "get instance",
            &format!("instance {name}"),
        )
        .await
    }

    async fn fetch(&self, id: &str) -> Result<ProvisionedHost, ProvisionError> {
        let [name, zone, project] = composite_id::decode::<3>(id)?;
        self.get_instance(&name, &zone, &project)
            .await?
            .into_host(&zone, &project)
    }

    async fn remove(&self, request: &HostDeleteRequest) -> Result<(), ProvisionError> {
        let id = lookup::target_id(self, request, ProviderKind::Gce.exit_node_marker()).await?;
        let [name, zone, project] = composite_id::decode::<3>(&id)?;
        let instance = self.get_instance(&name, &zone, &project).await?;
        send(
            &self.transport,
            ApiRequest::delete(format!("/projects/{project}/zones/{zone}/instances/{name}")),
            "delete instance",
            &format!("instance {name}"),
        )
        .await?;
        if let Some(rule) = instance.firewall_rule() {
            self.delete_firewall(&project, &rule).await?;
        }
        Ok(())
    }

    async fn list_all(&self, filter: &ListFilter) -> Result<Vec<ProvisionedHost>, ProvisionError> {
        let project = filter.require_project()?;
        let zone = filter.require_zone()?;
        let mut hosts = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut request = ApiRequest::get(format!("/projects/{project}/zones/{zone}/instances"));
            if !filter.expression.is_empty() {
                request = request.query("filter", filter.expression.clone());
            }
            if let Some(token) = page_token.take() {
                request = request.query("pageToken", token);
            }
            let listing: InstanceList = send_json(
                &self.transport,
                request,
                "list instances",
                &format!("zone {zone}"),
            )
            .await?;
            for instance in listing.items {
                hosts.push(instance.into_host(zone, project)?);
            }
            page_token = listing.next_page_token.filter(|token| !token.is_empty());
            if page_token.is_none() {
                return Ok(hosts);
            }
        }
    }
}

impl<T: Transport> Provisioner for GceProvisioner<T> {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{TAG_CONTROL_PORT, TAG_PRO};
    use crate::test_support::ScriptedTransport;
    use rstest::{fixture, rstest};

    #[fixture]
    fn descriptor() -> HostDescriptor {
        HostDescriptor::builder()
            .name("exit-g")
            .region("us-central1")
            .zone(Some(String::from("us-central1-a")))
            .plan("e2-micro")
            .os_image("projects/debian-cloud/global/images/family/debian-12")
            .boot_script("#!/bin/bash\n")
            .tag(TAG_PROJECT_ID, "proj")
            .tag(TAG_CONTROL_PORT, "8123")
            .build()
            .expect("descriptor")
    }

    fn instance(status: &str, nat_ip: Option<&str>) -> Value {
        json!({
            "name": "exit-g",
            "status": status,
            "networkInterfaces": [{"accessConfigs": [{"natIP": nat_ip}]}],
            "metadata": {"items": [
                {"key": "startup-script", "value": "#!/bin/bash\n"},
                {"key": "inlets-firewall", "value": "inlets-exit-g"}
            ]}
        })
    }

    #[rstest]
    #[tokio::test]
    async fn provision_creates_firewall_then_instance(descriptor: HostDescriptor) {
        let transport = ScriptedTransport::new();
        transport.push_json(404, &json!({"error": "not found"}));
        transport.push_json(200, &json!({"name": "op-1"}));
        transport.push_json(200, &json!({"name": "op-2"}));
        let adapter = GceProvisioner::new(transport.clone());

        let host = adapter.provision(&descriptor).await.expect("provision");

        assert_eq!(host.id, "exit-g|us-central1-a|proj");
        assert_eq!(host.status, HostStatus::Creating);
        assert_eq!(
            transport.calls(),
            vec![
                "GET /projects/proj/global/firewalls/inlets-exit-g",
                "POST /projects/proj/global/firewalls",
                "POST /projects/proj/zones/us-central1-a/instances"
            ]
        );
        let requests = transport.requests();
        let firewall = requests.get(1).and_then(ApiRequest::json_body).expect("rule");
        assert_eq!(firewall["allowed"][0]["ports"], json!(["8123", "80", "443"]));
        assert_eq!(firewall["targetTags"], json!(["inlets-exit-g"]));
        let body = requests.get(2).and_then(ApiRequest::json_body).expect("instance");
        assert_eq!(body["labels"], json!({"inlets": "exit-node"}));
        assert_eq!(
            body["machineType"],
            "zones/us-central1-a/machineTypes/e2-micro"
        );
    }

    #[rstest]
    #[tokio::test]
    async fn existing_firewall_rejects_create_untouched(descriptor: HostDescriptor) {
        let transport = ScriptedTransport::new();
        transport.push_json(200, &json!({"name": "inlets-exit-g"}));
        let adapter = GceProvisioner::new(transport.clone());

        let err = adapter
            .provision(&descriptor)
            .await
            .expect_err("name already taken");

        assert!(matches!(err, ProvisionError::Configuration { .. }), "{err}");
        assert!(err.to_string().contains("inlets-exit-g"), "{err}");
        assert_eq!(
            transport.calls(),
            vec!["GET /projects/proj/global/firewalls/inlets-exit-g"],
            "the existing rule is neither rewritten nor deleted"
        );
    }

    #[rstest]
    fn pro_firewall_opens_every_tcp_port(descriptor: HostDescriptor) {
        let mut pro = descriptor;
        pro.tags.insert(String::from(TAG_PRO), String::from("true"));
        pro.tags
            .insert(String::from(TAG_FIREWALL_NAME), String::from("tunnels"));
        let rule = firewall_rule_name(&pro);
        let body = firewall_body(&pro, "proj", &rule).expect("body");
        assert_eq!(rule, "tunnels-exit-g");
        assert_eq!(body["allowed"], json!([{"IPProtocol": "tcp"}]));
    }

    #[rstest]
    #[tokio::test]
    async fn failed_instance_insert_removes_firewall(descriptor: HostDescriptor) {
        let transport = ScriptedTransport::new();
        transport.push_json(404, &json!({}));
        transport.push_json(200, &json!({}));
        transport.push_json(409, &json!({"error": {"message": "already exists"}}));
        transport.push_json(200, &json!({}));
        let adapter = GceProvisioner::new(transport.clone());

        let err = adapter.provision(&descriptor).await.expect_err("conflict");

        assert!(err.to_string().contains("409"), "{err}");
        assert_eq!(
            transport.calls().last().map(String::as_str),
            Some("DELETE /projects/proj/global/firewalls/inlets-exit-g")
        );
    }

    #[rstest]
    #[case("PROVISIONING", None, HostStatus::Creating)]
    #[case("STAGING", None, HostStatus::Initializing)]
    #[case("RUNNING", Some("35.1.2.3"), HostStatus::Active)]
    #[case("RUNNING", None, HostStatus::Initializing)]
    #[case("TERMINATED", None, HostStatus::Other(String::from("TERMINATED")))]
    #[tokio::test]
    async fn status_maps_instance_state(
        #[case] native: &str,
        #[case] nat_ip: Option<&str>,
        #[case] expected: HostStatus,
    ) {
        let transport = ScriptedTransport::new();
        transport.push_json(200, &instance(native, nat_ip));
        let adapter = GceProvisioner::new(transport.clone());
        let host = adapter
            .status("exit-g|us-central1-a|proj")
            .await
            .expect("status");
        assert_eq!(host.status, expected);
        assert_eq!(
            transport.calls(),
            vec!["GET /projects/proj/zones/us-central1-a/instances/exit-g"]
        );
    }

    #[rstest]
    #[tokio::test]
    async fn delete_removes_instance_and_recorded_firewall() {
        let transport = ScriptedTransport::new();
        transport.push_json(200, &instance("RUNNING", Some("35.1.2.3")));
        transport.push_json(200, &json!({}));
        transport.push_json(404, &json!({}));
        let adapter = GceProvisioner::new(transport.clone());

        adapter
            .delete(&HostDeleteRequest::by_id("exit-g|us-central1-a|proj"))
            .await
            .expect("delete tolerates a missing firewall");

        assert_eq!(
            transport.calls(),
            vec![
                "GET /projects/proj/zones/us-central1-a/instances/exit-g",
                "DELETE /projects/proj/zones/us-central1-a/instances/exit-g",
                "DELETE /projects/proj/global/firewalls/inlets-exit-g"
            ]
        );
    }

    #[rstest]
    #[tokio::test]
    async fn list_follows_page_tokens() {
        let transport = ScriptedTransport::new();
        transport.push_json(
            200,
            &json!({"items": [instance("RUNNING", Some("35.1.2.3"))], "nextPageToken": "t2"}),
        );
        transport.push_json(200, &json!({"items": [instance("RUNNING", Some("35.1.2.4"))]}));
        let adapter = GceProvisioner::new(transport.clone());
        let filter = ListFilter::exit_nodes(ProviderKind::Gce)
            .with_project_id(Some(String::from("proj")))
            .with_zone(Some(String::from("us-central1-a")));

        let hosts = adapter.list(&filter).await.expect("list");

        assert_eq!(hosts.len(), 2);
        let requests = transport.requests();
        assert_eq!(
            requests.get(1).and_then(|request| request.query_value("pageToken")),
            Some("t2")
        );
        assert_eq!(
            requests.first().and_then(|request| request.query_value("filter")),
            Some("labels.inlets=exit-node")
        );
    }

    #[rstest]
    #[tokio::test]
    async fn list_without_zone_is_rejected() {
        let adapter = GceProvisioner::new(ScriptedTransport::new());
        let filter =
            ListFilter::exit_nodes(ProviderKind::Gce).with_project_id(Some(String::from("proj")));
        let err = adapter.list(&filter).await.expect_err("zone required");
        assert!(matches!(err, ProvisionError::Configuration { .. }));
    }
}
