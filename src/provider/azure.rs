//! Azure virtual machines deployed through Resource Manager.
//!
//! Every host lives in its own resource group, `inlets-<name>`, populated by
//! a single ARM template deployment (security group, network, public IP, NIC
//! and VM). Deleting the group removes everything at once. Host identifiers
//! are `group|deployment`.

use serde::Deserialize;
use serde_json::{Value, json};
use tracing::info;
use uuid::Uuid;

use super::api::{delete_if_present, exists, rollback, send, send_json};
use super::lookup;
use super::{ProviderKind, ProvisionError, ProvisionFuture, Provisioner, WaitPolicy};
use crate::composite_id;
use crate::host::{
    HostDeleteRequest, HostDescriptor, HostStatus, ListFilter, ProvisionedHost,
    TAG_IMAGE_OFFER, TAG_IMAGE_PUBLISHER, TAG_IMAGE_SKU, TAG_IMAGE_VERSION,
};
use crate::password;
use crate::transport::{ApiRequest, HttpTransport, Transport};

/// Default API root.
pub const API_BASE: &str = "https://management.azure.com";

const API_VERSION: &str = "2021-04-01";
const GROUP_PREFIX: &str = "inlets-";
const DEPLOYMENT_PREFIX: &str = "inlets-deploy-";
const ADMIN_USER: &str = "inletsuser";
const ADMIN_PASSWORD_LENGTH: usize = 16;
pub(super) const STATUS_TABLE: &[(&str, HostStatus)] = &[
    ("Accepted", HostStatus::Creating),
    ("Running", HostStatus::Creating),
    ("Succeeded", HostStatus::Active),
    ("Failed", HostStatus::Error),
    ("Canceled", HostStatus::Error),
];

#[derive(Deserialize)]
struct Deployment {
    name: String,
    #[serde(default)]
    properties: DeploymentProperties,
}

#[derive(Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeploymentProperties {
    #[serde(default)]
    provisioning_state: String,
    #[serde(default)]
    outputs: Option<Outputs>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Outputs {
    #[serde(default)]
    public_ip: Option<OutputValue>,
}

#[derive(Deserialize)]
struct OutputValue {
    #[serde(default)]
    value: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Listing<T> {
    #[serde(default = "Vec::new")]
    value: Vec<T>,
    #[serde(default)]
    next_link: Option<String>,
}

#[derive(Deserialize)]
struct ResourceGroup {
    name: String,
}

impl Deployment {
    fn into_host(self, group: &str) -> Result<ProvisionedHost, ProvisionError> {
        let id = composite_id::encode(&[group, &self.name])?;
        let ip = self
            .properties
            .outputs
            .and_then(|outputs| outputs.public_ip)
            .map(|output| output.value)
            .unwrap_or_default();
        Ok(ProvisionedHost::observed(
            id,
            ip,
            HostStatus::map_native(&self.properties.provisioning_state, STATUS_TABLE),
        ))
    }
}

/// Publisher, offer, SKU and version of a marketplace image.
#[derive(Clone, Debug, Eq, PartialEq)]
struct ImageReference {
    publisher: String,
    offer: String,
    sku: String,
    version: String,
}

impl ImageReference {
    /// Parses a `publisher:offer:sku:version` URN, letting tags override each
    /// part.
    fn from_descriptor(descriptor: &HostDescriptor) -> Result<Self, ProvisionError> {
        let mut urn = descriptor.os_image.split(':').map(str::trim);
        let mut part = |tag: &str| {
            let fallback = urn.next().filter(|value| !value.is_empty());
            descriptor.tag(tag).or(fallback).map(str::to_owned)
        };
        let publisher = part(TAG_IMAGE_PUBLISHER);
        let offer = part(TAG_IMAGE_OFFER);
        let sku = part(TAG_IMAGE_SKU);
        let version = part(TAG_IMAGE_VERSION);
        match (publisher, offer, sku) {
            (Some(publisher), Some(offer), Some(sku)) => Ok(Self {
                publisher,
                offer,
                sku,
                version: version.unwrap_or_else(|| String::from("latest")),
            }),
            _ => Err(ProvisionError::configuration(format!(
                "azure image '{}' is not a publisher:offer:sku:version URN",
                descriptor.os_image
            ))),
        }
    }
}

fn security_rule(name: &str, priority: u16, ports: &str) -> Value {
    json!({
        "name": name,
        "properties": {
            "priority": priority,
            "protocol": "TCP",
            "access": "Allow",
            "direction": "Inbound",
            "sourceAddressPrefix": "*",
            "sourcePortRange": "*",
            "destinationAddressPrefix": "*",
            "destinationPortRange": ports,
        },
    })
}

fn security_rules(descriptor: &HostDescriptor) -> Result<Vec<Value>, ProvisionError> {
    let control_port = descriptor.control_port()?.to_string();
    let mut rules = vec![
        security_rule("SSH", 300, "22"),
        security_rule("HTTPS", 320, "443"),
        security_rule("HTTP", 340, "80"),
        security_rule("Control", 360, &control_port),
    ];
    if descriptor.is_pro() {
        rules.push(security_rule("Pro", 380, "1024-65535"));
    }
    Ok(rules)
}

fn template(image: &ImageReference) -> Value {
    let param = |kind: &str| json!({"type": kind});
    json!({
        "$schema": "https://schema.management.azure.com/schemas/2019-04-01/deploymentTemplate.json#",
        "contentVersion": "1.0.0.0",
        "parameters": {
            "location": param("string"),
            "securityRules": param("array"),
            "virtualMachineName": param("string"),
            "virtualMachineSize": param("string"),
            "adminUsername": param("string"),
            "adminPassword": param("secureString"),
            "customData": param("string"),
        },
        "variables": {
            "nsgId": "[resourceId('Microsoft.Network/networkSecurityGroups', 'inlets-vm-nsg')]",
            "subnetRef": "[concat(resourceId('Microsoft.Network/virtualNetworks', 'inlets-vnet'), '/subnets/default')]",
        },
        "resources": [
            {
                "name": "inlets-vm-nsg",
                "type": "Microsoft.Network/networkSecurityGroups",
                "apiVersion": "2019-02-01",
                "location": "[parameters('location')]",
                "properties": {"securityRules": "[parameters('securityRules')]"},
            },
            {
                "name": "inlets-vnet",
                "type": "Microsoft.Network/virtualNetworks",
                "apiVersion": "2019-04-01",
                "location": "[parameters('location')]",
                "properties": {
                    "addressSpace": {"addressPrefixes": ["10.0.0.0/24"]},
                    "subnets": [{"name": "default", "properties": {"addressPrefix": "10.0.0.0/24"}}],
                },
            },
            {
                "name": "inlets-ip",
                "type": "Microsoft.Network/publicIpAddresses",
                "apiVersion": "2019-02-01",
                "location": "[parameters('location')]",
                "properties": {"publicIpAllocationMethod": "Static"},
                "sku": {"name": "Basic"},
            },
            {
                "name": "inlets-vm-nic",
                "type": "Microsoft.Network/networkInterfaces",
                "apiVersion": "2019-07-01",
                "location": "[parameters('location')]",
                "dependsOn": [
                    "[resourceId('Microsoft.Network/networkSecurityGroups', 'inlets-vm-nsg')]",
                    "[resourceId('Microsoft.Network/virtualNetworks', 'inlets-vnet')]",
                    "[resourceId('Microsoft.Network/publicIpAddresses', 'inlets-ip')]",
                ],
                "properties": {
                    "ipConfigurations": [{
                        "name": "ipconfig1",
                        "properties": {
                            "subnet": {"id": "[variables('subnetRef')]"},
                            "privateIPAllocationMethod": "Dynamic",
                            "publicIpAddress": {
                                "id": "[resourceId('Microsoft.Network/publicIpAddresses', 'inlets-ip')]",
                            },
                        },
                    }],
                    "networkSecurityGroup": {"id": "[variables('nsgId')]"},
                },
            },
            {
                "name": "[parameters('virtualMachineName')]",
                "type": "Microsoft.Compute/virtualMachines",
                "apiVersion": "2019-07-01",
                "location": "[parameters('location')]",
                "dependsOn": ["[resourceId('Microsoft.Network/networkInterfaces', 'inlets-vm-nic')]"],
                "properties": {
                    "hardwareProfile": {"vmSize": "[parameters('virtualMachineSize')]"},
                    "storageProfile": {
                        "osDisk": {
                            "createOption": "fromImage",
                            "managedDisk": {"storageAccountType": "Standard_LRS"},
                        },
                        "imageReference": {
                            "publisher": image.publisher,
                            "offer": image.offer,
                            "sku": image.sku,
                            "version": image.version,
                        },
                    },
                    "networkProfile": {
                        "networkInterfaces": [{
                            "id": "[resourceId('Microsoft.Network/networkInterfaces', 'inlets-vm-nic')]",
                        }],
                    },
                    "osProfile": {
                        "computerName": "[parameters('virtualMachineName')]",
                        "adminUsername": "[parameters('adminUsername')]",
                        "adminPassword": "[parameters('adminPassword')]",
                        "customData": "[base64(parameters('customData'))]",
                    },
                },
            },
        ],
        "outputs": {
            "publicIP": {
                "type": "string",
                "value": "[reference(resourceId('Microsoft.Network/publicIPAddresses', 'inlets-ip'), '2019-02-01', 'Full').properties.ipAddress]",
            },
        },
    })
}

fn versioned(request: ApiRequest) -> ApiRequest {
    request.query("api-version", API_VERSION)
}

/// Provisions virtual machines through Azure Resource Manager.
#[derive(Clone, Debug)]
pub struct AzureProvisioner<T = HttpTransport> {
    transport: T,
    subscription: String,
    wait: WaitPolicy,
}

impl<T: Transport> AzureProvisioner<T> {
    /// Creates an adapter scoped to `subscription`.
    #[must_use]
    pub fn new(transport: T, subscription: impl Into<String>) -> Self {
        Self {
            transport,
            subscription: subscription.into(),
            wait: WaitPolicy::default(),
        }
    }

    /// Overrides how long delete waits for the resource group to disappear.
    #[must_use]
    pub const fn with_wait_policy(mut self, wait: WaitPolicy) -> Self {
        self.wait = wait;
        self
    }

    fn group_path(&self, group: &str) -> String {
        format!("/subscriptions/{}/resourcegroups/{group}", self.subscription)
    }

    fn deployments_path(&self, group: &str) -> String {
        format!(
            "{}/providers/Microsoft.Resources/deployments",
            self.group_path(group)
        )
    }

    async fn delete_group(&self, group: &str) -> Result<(), ProvisionError> {
        delete_if_present(
            &self.transport,
            versioned(ApiRequest::delete(self.group_path(group))),
            "delete resource group",
            group,
        )
        .await
    }

    async fn deploy(
        &self,
        descriptor: &HostDescriptor,
        group: &str,
        deployment: &str,
    ) -> Result<(), ProvisionError> {
        let image = ImageReference::from_descriptor(descriptor)?;
        let parameters = json!({
            "location": {"value": descriptor.region},
            "securityRules": {"value": security_rules(descriptor)?},
            "virtualMachineName": {"value": descriptor.name},
            "virtualMachineSize": {"value": descriptor.plan},
            "adminUsername": {"value": ADMIN_USER},
            "adminPassword": {"value": password::generate(ADMIN_PASSWORD_LENGTH)},
            "customData": {"value": descriptor.boot_script},
        });
        let body = json!({
            "properties": {
                "mode": "Complete",
                "template": template(&image),
                "parameters": parameters,
            },
        });
        send(
            &self.transport,
            versioned(
                ApiRequest::put(format!("{}/{deployment}", self.deployments_path(group)))
                    .json(body),
            ),
            "create deployment",
            deployment,
        )
        .await?;
        Ok(())
    }

    async fn create(&self, descriptor: &HostDescriptor) -> Result<ProvisionedHost, ProvisionError> {
        descriptor.validate()?;
        ImageReference::from_descriptor(descriptor)?;
        let group = format!("{GROUP_PREFIX}{}", descriptor.name);
        let deployment = format!("{DEPLOYMENT_PREFIX}{}", Uuid::new_v4());

        let taken = exists(
            &self.transport,
            versioned(ApiRequest::get(self.group_path(&group))),
            "get resource group",
            &group,
        )
        .await?;
        if taken {
            return Err(ProvisionError::configuration(format!(
                "resource group {group} already exists; choose another host name"
            )));
        }

        info!(group, deployment, "creating resource group");
        send(
            &self.transport,
            versioned(ApiRequest::put(self.group_path(&group)).json(json!({
                "location": descriptor.region,
                "tags": {"inlets": "exit-node"},
            }))),
            "create resource group",
            &group,
        )
        .await?;

        if let Err(err) = self.deploy(descriptor, &group, &deployment).await {
            return Err(rollback(err, self.delete_group(&group)).await);
        }
        Ok(ProvisionedHost::creating(composite_id::encode(&[
            &group,
            &deployment,
        ])?))
    }

    async fn fetch(&self, id: &str) -> Result<ProvisionedHost, ProvisionError> {
        let [group, deployment] = composite_id::decode::<2>(id)?;
        let found: Deployment = send_json(
            &self.transport,
            versioned(ApiRequest::get(format!(
                "{}/{deployment}",
                self.deployments_path(&group)
            ))),
            "get deployment",
            &deployment,
        )
        .await?;
        found.into_host(&group)
    }

    async fn remove(&self, request: &HostDeleteRequest) -> Result<(), ProvisionError> {
        let id = lookup::target_id(self, request, ProviderKind::Azure.exit_node_marker()).await?;
        let [group, _deployment] = composite_id::decode::<2>(&id)?;
        info!(group, "deleting resource group");
        send(
            &self.transport,
            versioned(ApiRequest::delete(self.group_path(&group))),
            "delete resource group",
            &group,
        )
        .await?;
        let path = self.group_path(&group);
        let (transport, path, name) = (&self.transport, path.as_str(), group.as_str());
        self.wait
            .until("delete resource group", name, move || async move {
                let present = exists(
                    transport,
                    versioned(ApiRequest::get(path)),
                    "get resource group",
                    name,
                )
                .await?;
                Ok(!present)
            })
            .await
    }

    async fn paged<R: serde::de::DeserializeOwned>(
        &self,
        first: ApiRequest,
        operation: &str,
        resource: &str,
    ) -> Result<Vec<R>, ProvisionError> {
        let mut items = Vec::new();
        let mut request = Some(first);
        while let Some(current) = request.take() {
            let page: Listing<R> = send_json(&self.transport, current, operation, resource).await?;
            items.extend(page.value);
            request = page
                .next_link
                .filter(|link| !link.is_empty())
                .map(ApiRequest::get);
        }
        Ok(items)
    }

    async fn list_all(&self, filter: &ListFilter) -> Result<Vec<ProvisionedHost>, ProvisionError> {
        let mut first = versioned(ApiRequest::get(format!(
            "/subscriptions/{}/resourcegroups",
            self.subscription
        )));
        if let Some((name, value)) = filter.expression.split_once('=') {
            first = first.query(
                "$filter",
                format!("tagName eq '{name}' and tagValue eq '{value}'"),
            );
        }
        let groups: Vec<ResourceGroup> = self
            .paged(first, "list resource groups", "resource groups")
            .await?;
        let mut hosts = Vec::new();
        for group in groups {
            let deployments: Vec<Deployment> = self
                .paged(
                    versioned(ApiRequest::get(self.deployments_path(&group.name))),
                    "list deployments",
                    &group.name,
                )
                .await?;
            for deployment in deployments
                .into_iter()
                .filter(|deployment| deployment.name.starts_with(DEPLOYMENT_PREFIX))
            {
                hosts.push(deployment.into_host(&group.name)?);
            }
        }
        Ok(hosts)
    }
}

impl<T: Transport> Provisioner for AzureProvisioner<T> {
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
