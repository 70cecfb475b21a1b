//! [`Ec2Api`] backed by the AWS SDK.

use std::error::Error as StdError;
use std::fmt::Debug;
use std::time::Duration;

use aws_config::timeout::TimeoutConfig;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_ec2::Client;
use aws_sdk_ec2::config::Credentials;
use aws_sdk_ec2::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_ec2::types::{
    Filter, Instance, InstanceNetworkInterfaceSpecification, InstanceType, IpPermission, IpRange,
    ResourceType, Tag, TagSpecification,
};

use super::{Ec2Api, InstancePage, InstanceView, LIVE_STATES, LaunchSpec, PortRange};
use crate::provider::{ProvisionError, ProvisionFuture};

/// EC2 client scoped to one region.
#[derive(Clone, Debug)]
pub struct SdkEc2Api {
    client: Client,
}

impl SdkEc2Api {
    /// Builds a client from static credentials.
    pub async fn connect(
        region: &str,
        access_key_id: &str,
        secret_access_key: &str,
        timeout: Duration,
    ) -> Self {
        let config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region.to_owned()))
            .credentials_provider(Credentials::new(
                access_key_id,
                secret_access_key,
                None,
                None,
                "waystation",
            ))
            .timeout_config(TimeoutConfig::builder().operation_timeout(timeout).build())
            .load()
            .await;
        Self {
            client: Client::new(&config),
        }
    }

    async fn newest_image(&self, pattern: &str) -> Result<String, ProvisionError> {
        let output = self
            .client
            .describe_images()
            .filters(Filter::builder().name("name").values(pattern).build())
            .send()
            .await
            .map_err(|err| sdk_error("describe images", pattern, &err))?;
        output
            .images()
            .iter()
            .filter_map(|image| Some((image.creation_date()?, image.image_id()?)))
            .max_by(|lhs, rhs| lhs.0.cmp(rhs.0))
            .map(|(_, id)| id.to_owned())
            .ok_or_else(|| ProvisionError::configuration(format!("no image matches '{pattern}'")))
    }

    async fn new_security_group(
        &self,
        name: &str,
        vpc_id: Option<&str>,
    ) -> Result<String, ProvisionError> {
        let output = self
            .client
            .create_security_group()
            .group_name(name)
            .description("inlets exit-node ingress")
            .set_vpc_id(vpc_id.map(str::to_owned))
            .send()
            .await
            .map_err(|err| sdk_error("create security group", name, &err))?;
        output
            .group_id()
            .map(str::to_owned)
            .ok_or_else(|| ProvisionError::api("create security group", name, "no group id returned"))
    }

    async fn open_ports(&self, group_id: &str, ports: PortRange) -> Result<(), ProvisionError> {
        let permission = IpPermission::builder()
            .ip_protocol("tcp")
            .from_port(i32::from(ports.from))
            .to_port(i32::from(ports.to))
            .ip_ranges(IpRange::builder().cidr_ip("0.0.0.0/0").build())
            .build();
        self.client
            .authorize_security_group_ingress()
            .group_id(group_id)
            .ip_permissions(permission)
            .send()
            .await
            .map_err(|err| sdk_error("authorize ingress", group_id, &err))?;
        Ok(())
    }

    async fn remove_security_group(&self, group_id: &str) -> Result<(), ProvisionError> {
        self.client
            .delete_security_group()
            .group_id(group_id)
            .send()
            .await
            .map_err(|err| sdk_error("delete security group", group_id, &err))?;
        Ok(())
    }

    async fn launch(&self, spec: &LaunchSpec) -> Result<String, ProvisionError> {
        let interface = InstanceNetworkInterfaceSpecification::builder()
            .device_index(0)
            .associate_public_ip_address(true)
            .delete_on_termination(true)
            .groups(&spec.security_group_id)
            .set_subnet_id(spec.subnet_id.clone())
            .build();
        let tags = spec
            .tags
            .iter()
            .map(|(key, value)| Tag::builder().key(key).value(value).build())
            .collect();
        let output = self
            .client
            .run_instances()
            .image_id(&spec.image_id)
            .instance_type(InstanceType::from(spec.instance_type.as_str()))
            .min_count(1)
            .max_count(1)
            .user_data(&spec.user_data)
            .network_interfaces(interface)
            .set_key_name(spec.key_name.clone())
            .tag_specifications(
                TagSpecification::builder()
                    .resource_type(ResourceType::Instance)
                    .set_tags(Some(tags))
                    .build(),
            )
            .send()
            .await
            .map_err(|err| sdk_error("run instance", &spec.image_id, &err))?;
        output
            .instances()
            .first()
            .and_then(Instance::instance_id)
            .map(str::to_owned)
            .ok_or_else(|| ProvisionError::api("run instance", &spec.image_id, "no instance returned"))
    }

    async fn health(&self, id: &str) -> Result<Option<String>, ProvisionError> {
        let output = self
            .client
            .describe_instance_status()
            .instance_ids(id)
            .send()
            .await
            .map_err(|err| sdk_error("describe instance status", id, &err))?;
        Ok(output
            .instance_statuses()
            .first()
            .and_then(|status| status.instance_status())
            .and_then(|summary| summary.status())
            .map(|status| status.as_str().to_owned()))
    }

    async fn describe(&self, id: &str) -> Result<InstanceView, ProvisionError> {
        let output = self
            .client
            .describe_instances()
            .instance_ids(id)
            .send()
            .await
            .map_err(|err| sdk_error("describe instance", id, &err))?;
        output
            .reservations()
            .iter()
            .flat_map(|reservation| reservation.instances())
            .next()
            .map(view)
            .ok_or_else(|| ProvisionError::NotFound {
                resource: format!("instance {id}"),
            })
    }

    async fn page(
        &self,
        tag_key: &str,
        tag_value: &str,
        next_token: Option<String>,
    ) -> Result<InstancePage, ProvisionError> {
        let output = self
            .client
            .describe_instances()
            .filters(
                Filter::builder()
                    .name(format!("tag:{tag_key}"))
                    .values(tag_value)
                    .build(),
            )
            .filters(
                Filter::builder()
                    .name("instance-state-name")
                    .set_values(Some(
                        LIVE_STATES.iter().map(|state| (*state).to_owned()).collect(),
                    ))
                    .build(),
            )
            .set_next_token(next_token)
            .send()
            .await
            .map_err(|err| sdk_error("list instances", tag_key, &err))?;
        Ok(InstancePage {
            instances: output
                .reservations()
                .iter()
                .flat_map(|reservation| reservation.instances())
                .map(view)
                .collect(),
            next_token: output.next_token().map(str::to_owned),
        })
    }

    async fn terminate(&self, id: &str) -> Result<(), ProvisionError> {
        self.client
            .terminate_instances()
            .instance_ids(id)
            .send()
            .await
            .map_err(|err| sdk_error("terminate instance", id, &err))?;
        Ok(())
    }
}

fn view(instance: &Instance) -> InstanceView {
    InstanceView {
        id: instance.instance_id().unwrap_or_default().to_owned(),
        state: instance
            .state()
            .and_then(|state| state.name())
            .map(|name| name.as_str().to_owned())
            .unwrap_or_default(),
        public_ip: instance.public_ip_address().map(str::to_owned),
        security_groups: instance
            .security_groups()
            .iter()
            .filter_map(|group| group.group_id().map(str::to_owned))
            .collect(),
    }
}

fn sdk_error<E, R>(operation: &str, resource: &str, err: &SdkError<E, R>) -> ProvisionError
where
    E: ProvideErrorMetadata + StdError + 'static,
    R: Debug,
{
    let code = err.as_service_error().and_then(ProvideErrorMetadata::code);
    if code.is_some_and(|value| value.ends_with(".NotFound")) {
        return ProvisionError::NotFound {
            resource: resource.to_owned(),
        };
    }
    ProvisionError::api(operation, resource, DisplayErrorContext(err).to_string())
}

impl Ec2Api for SdkEc2Api {
    fn find_image<'a>(&'a self, pattern: &'a str) -> ProvisionFuture<'a, String> {
        Box::pin(self.newest_image(pattern))
    }

    fn create_security_group<'a>(
        &'a self,
        name: &'a str,
        vpc_id: Option<&'a str>,
    ) -> ProvisionFuture<'a, String> {
        Box::pin(self.new_security_group(name, vpc_id))
    }

    fn authorize_ingress<'a>(
        &'a self,
        group_id: &'a str,
        ports: PortRange,
    ) -> ProvisionFuture<'a, ()> {
        Box::pin(self.open_ports(group_id, ports))
    }

    fn delete_security_group<'a>(&'a self, group_id: &'a str) -> ProvisionFuture<'a, ()> {
        Box::pin(self.remove_security_group(group_id))
    }

    fn run_instance<'a>(&'a self, spec: &'a LaunchSpec) -> ProvisionFuture<'a, String> {
        Box::pin(self.launch(spec))
    }

    fn instance_health<'a>(&'a self, id: &'a str) -> ProvisionFuture<'a, Option<String>> {
        Box::pin(self.health(id))
    }

    fn describe_instance<'a>(&'a self, id: &'a str) -> ProvisionFuture<'a, InstanceView> {
        Box::pin(self.describe(id))
    }

    fn list_instances<'a>(
        &'a self,
        tag_key: &'a str,
        tag_value: &'a str,
        next_token: Option<String>,
    ) -> ProvisionFuture<'a, InstancePage> {
        Box::pin(self.page(tag_key, tag_value, next_token))
    }

    fn terminate_instance<'a>(&'a self, id: &'a str) -> ProvisionFuture<'a, ()> {
        Box::pin(self.terminate(id))
    }
}
