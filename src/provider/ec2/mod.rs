//! Amazon EC2 instances.
//!
//! Each host gets a dedicated security group opening 80, 443 and the control
//! port (plus 1024-65535 for pro tunnels). The AWS SDK sits behind the
//! [`Ec2Api`] seam so the provisioning flow can be exercised without AWS.

mod sdk;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use tracing::info;

use super::api::rollback;
use super::lookup;
use super::{ProviderKind, ProvisionError, ProvisionFuture, Provisioner, WaitPolicy};
use crate::host::{
    HostDeleteRequest, HostDescriptor, HostStatus, ListFilter, ProvisionedHost, TAG_SSH_KEY,
    TAG_SUBNET, TAG_VPC,
};

pub use sdk::SdkEc2Api;

/// Tag key and value applied to every instance.
pub const EXIT_NODE_TAG: (&str, &str) = ("inlets", "exit-node");

/// Inclusive TCP port range opened in a security group.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PortRange {
    /// First port.
    pub from: u16,
    /// Last port.
    pub to: u16,
}

impl PortRange {
    /// Range covering a single port.
    #[must_use]
    pub const fn single(port: u16) -> Self {
        Self {
            from: port,
            to: port,
        }
    }
}

/// Parameters for launching one instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LaunchSpec {
    /// AMI identifier.
    pub image_id: String,
    /// Instance type, e.g. `t3.nano`.
    pub instance_type: String,
    /// Base64-encoded user data.
    pub user_data: String,
    /// Security group attached to the primary interface.
    pub security_group_id: String,
    /// Optional subnet for the primary interface.
    pub subnet_id: Option<String>,
    /// Optional key pair name.
    pub key_name: Option<String>,
    /// Tags applied at launch.
    pub tags: Vec<(String, String)>,
}

/// Instance fields the adapter reads back.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct InstanceView {
    /// Instance id.
    pub id: String,
    /// Lifecycle state name (`pending`, `running`, `terminated`, ...).
    pub state: String,
    /// Public IPv4 address once assigned.
    pub public_ip: Option<String>,
    /// Security groups attached to the instance.
    pub security_groups: Vec<String>,
}

/// One page of [`Ec2Api::list_instances`].
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct InstancePage {
    /// Instances on this page.
    pub instances: Vec<InstanceView>,
    /// Token for the next page, if any.
    pub next_token: Option<String>,
}

/// EC2 operations used by [`Ec2Provisioner`].
pub trait Ec2Api: Send + Sync {
    /// Returns the newest AMI whose name matches `pattern`.
    fn find_image<'a>(&'a self, pattern: &'a str) -> ProvisionFuture<'a, String>;

    /// Creates a security group and returns its id.
    fn create_security_group<'a>(
        &'a self,
        name: &'a str,
        vpc_id: Option<&'a str>,
    ) -> ProvisionFuture<'a, String>;

    /// Opens `ports` to the world on `group_id`.
    fn authorize_ingress<'a>(&'a self, group_id: &'a str, ports: PortRange)
    -> ProvisionFuture<'a, ()>;

    /// Deletes a security group.
    fn delete_security_group<'a>(&'a self, group_id: &'a str) -> ProvisionFuture<'a, ()>;

    /// Launches one instance and returns its id.
    fn run_instance<'a>(&'a self, spec: &'a LaunchSpec) -> ProvisionFuture<'a, String>;

    /// Returns the instance status summary (`ok`, `initializing`, ...), or
    /// `None` while EC2 has not reported one yet.
    fn instance_health<'a>(&'a self, id: &'a str) -> ProvisionFuture<'a, Option<String>>;

    /// Describes one instance; a missing instance is [`ProvisionError::NotFound`].
    fn describe_instance<'a>(&'a self, id: &'a str) -> ProvisionFuture<'a, InstanceView>;

    /// Lists instances carrying `tag_key=tag_value`.
    fn list_instances<'a>(
        &'a self,
        tag_key: &'a str,
        tag_value: &'a str,
        next_token: Option<String>,
    ) -> ProvisionFuture<'a, InstancePage>;

    /// Terminates an instance.
    fn terminate_instance<'a>(&'a self, id: &'a str) -> ProvisionFuture<'a, ()>;
}

/// Instance states that still count as hosts. Terminated instances stay
/// visible in listings for a while after deletion.
const LIVE_STATES: [&str; 4] = ["pending", "running", "stopping", "stopped"];

const STOPPED_STATES: [&str; 4] = ["shutting-down", "terminated", "stopping", "stopped"];

/// Combines the instance state and status summary into a canonical status.
pub(super) fn map_status(state: &str, health: Option<&str>) -> HostStatus {
    if STOPPED_STATES.contains(&state) {
        return HostStatus::Other(state.to_owned());
    }
    match health {
        None => HostStatus::Creating,
        Some("ok") => HostStatus::Active,
        Some(_) => HostStatus::Initializing,
    }
}

/// Provisions EC2 instances through an [`Ec2Api`].
#[derive(Clone, Debug)]
pub struct Ec2Provisioner<A = SdkEc2Api> {
    api: A,
    wait: WaitPolicy,
}

impl<A: Ec2Api> Ec2Provisioner<A> {
    /// Creates an adapter over `api`.
    #[must_use]
    pub fn new(api: A) -> Self {
        Self {
            api,
            wait: WaitPolicy::default(),
        }
    }

    /// Overrides how long delete waits for termination.
    #[must_use]
    pub const fn with_wait_policy(mut self, wait: WaitPolicy) -> Self {
        self.wait = wait;
        self
    }

    async fn security_group(&self, descriptor: &HostDescriptor) -> Result<String, ProvisionError> {
        let control_port = descriptor.control_port()?;
        let name = format!("inlets-{}", descriptor.name);
        let group_id = self
            .api
            .create_security_group(&name, descriptor.tag(TAG_VPC))
            .await?;
        let mut ranges = vec![
            PortRange::single(80),
            PortRange::single(443),
            PortRange::single(control_port),
        ];
        if descriptor.is_pro() {
            ranges.push(PortRange {
                from: 1024,
                to: 65535,
            });
        }
        for range in ranges {
            if let Err(err) = self.api.authorize_ingress(&group_id, range).await {
                return Err(rollback(err, self.api.delete_security_group(&group_id)).await);
            }
        }
        Ok(group_id)
    }

    async fn create(&self, descriptor: &HostDescriptor) -> Result<ProvisionedHost, ProvisionError> {
        descriptor.validate()?;
        let image_id = if descriptor.os_image.starts_with("ami-") {
            descriptor.os_image.clone()
        } else {
            self.api.find_image(&descriptor.os_image).await?
        };
        let group_id = self.security_group(descriptor).await?;
        let spec = LaunchSpec {
            image_id,
            instance_type: descriptor.plan.clone(),
            user_data: STANDARD.encode(descriptor.boot_script.as_bytes()),
            security_group_id: group_id.clone(),
            subnet_id: descriptor.tag(TAG_SUBNET).map(str::to_owned),
            key_name: descriptor.tag(TAG_SSH_KEY).map(str::to_owned),
            tags: vec![
                (String::from("Name"), descriptor.name.clone()),
                (EXIT_NODE_TAG.0.to_owned(), EXIT_NODE_TAG.1.to_owned()),
            ],
        };
        match self.api.run_instance(&spec).await {
            Ok(id) => {
                info!(instance = %id, group = %group_id, "instance launched");
                Ok(ProvisionedHost::creating(id))
            }
            Err(err) => Err(rollback(err, self.api.delete_security_group(&group_id)).await),
        }
    }

    async fn fetch(&self, id: &str) -> Result<ProvisionedHost, ProvisionError> {
        let health = self.api.instance_health(id).await?;
        let instance = self.api.describe_instance(id).await?;
        Ok(ProvisionedHost::observed(
            instance.id,
            instance.public_ip.unwrap_or_default(),
            map_status(&instance.state, health.as_deref()),
        ))
    }

    async fn remove(&self, request: &HostDeleteRequest) -> Result<(), ProvisionError> {
        let id = lookup::target_id(self, request, ProviderKind::Ec2.exit_node_marker()).await?;
        let instance = self.api.describe_instance(&id).await?;
        self.api.terminate_instance(&id).await?;
        let (api, id_ref) = (&self.api, id.as_str());
        self.wait
            .until("terminate instance", &id, move || async move {
                match api.describe_instance(id_ref).await {
                    Ok(current) => Ok(current.state == "terminated"),
                    Err(err) if err.is_not_found() => Ok(true),
                    Err(err) => Err(err),
                }
            })
            .await?;
        for group in &instance.security_groups {
            self.api.delete_security_group(group).await?;
        }
        Ok(())
    }

    async fn list_all(&self, filter: &ListFilter) -> Result<Vec<ProvisionedHost>, ProvisionError> {
        let (key, value) = filter
            .expression
            .split_once('=')
            .unwrap_or((EXIT_NODE_TAG.0, EXIT_NODE_TAG.1));
        let mut hosts = Vec::new();
        let mut token = None;
        loop {
            let page = self.api.list_instances(key, value, token).await?;
            let live = page
                .instances
                .into_iter()
                .filter(|instance| LIVE_STATES.contains(&instance.state.as_str()));
            hosts.extend(live.map(|instance| {
                let status = if instance.state == "running" {
                    HostStatus::Active
                } else {
                    HostStatus::Other(instance.state)
                };
                ProvisionedHost::observed(instance.id, instance.public_ip.unwrap_or_default(), status)
            }));
            token = page.next_token.filter(|next| !next.is_empty());
            if token.is_none() {
                return Ok(hosts);
            }
        }
    }
}

impl<A: Ec2Api> Provisioner for Ec2Provisioner<A> {
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
mod tests;
