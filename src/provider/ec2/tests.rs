//! Unit tests for the EC2 adapter, driven through a fake [`Ec2Api`].

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use rstest::{fixture, rstest};

use super::*;
use crate::janitor::{Janitor, JanitorConfig, SweepSummary};

#[derive(Debug, Default)]
struct FakeState {
    calls: Vec<String>,
    launched: Vec<LaunchSpec>,
    fail: Vec<&'static str>,
    health: Option<String>,
    described: VecDeque<InstanceView>,
    pages: VecDeque<InstancePage>,
}

#[derive(Debug, Default)]
struct FakeEc2 {
    state: Mutex<FakeState>,
}

impl FakeEc2 {
    fn with<R>(&self, f: impl FnOnce(&mut FakeState) -> R) -> R {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut state)
    }

    fn record(&self, operation: &'static str, call: String) -> Result<(), ProvisionError> {
        self.with(|state| {
            state.calls.push(call);
            if state.fail.contains(&operation) {
                Err(ProvisionError::api(operation, "fake", "boom"))
            } else {
                Ok(())
            }
        })
    }

    fn calls(&self) -> Vec<String> {
        self.with(|state| state.calls.clone())
    }
}

impl Ec2Api for FakeEc2 {
    fn find_image<'a>(&'a self, pattern: &'a str) -> ProvisionFuture<'a, String> {
        Box::pin(async move {
            self.record("find_image", format!("find_image {pattern}"))?;
            Ok(String::from("ami-found"))
        })
    }

    fn create_security_group<'a>(
        &'a self,
        name: &'a str,
        vpc_id: Option<&'a str>,
    ) -> ProvisionFuture<'a, String> {
        Box::pin(async move {
            self.record(
                "create_security_group",
                format!("create_security_group {name} {}", vpc_id.unwrap_or("-")),
            )?;
            Ok(String::from("sg-1"))
        })
    }

    fn authorize_ingress<'a>(
        &'a self,
        group_id: &'a str,
        ports: PortRange,
    ) -> ProvisionFuture<'a, ()> {
        Box::pin(async move {
            self.record(
                "authorize_ingress",
                format!("authorize_ingress {group_id} {}-{}", ports.from, ports.to),
            )
        })
    }

    fn delete_security_group<'a>(&'a self, group_id: &'a str) -> ProvisionFuture<'a, ()> {
        Box::pin(async move {
            self.record(
                "delete_security_group",
                format!("delete_security_group {group_id}"),
            )
        })
    }

    fn run_instance<'a>(&'a self, spec: &'a LaunchSpec) -> ProvisionFuture<'a, String> {
        Box::pin(async move {
            self.with(|state| state.launched.push(spec.clone()));
            self.record("run_instance", format!("run_instance {}", spec.image_id))?;
            Ok(String::from("i-123"))
        })
    }

    fn instance_health<'a>(&'a self, id: &'a str) -> ProvisionFuture<'a, Option<String>> {
        Box::pin(async move {
            self.record("instance_health", format!("instance_health {id}"))?;
            Ok(self.with(|state| state.health.clone()))
        })
    }

    fn describe_instance<'a>(&'a self, id: &'a str) -> ProvisionFuture<'a, InstanceView> {
        Box::pin(async move {
            self.record("describe_instance", format!("describe_instance {id}"))?;
            self.with(|state| state.described.pop_front()).ok_or_else(|| {
                ProvisionError::NotFound {
                    resource: id.to_owned(),
                }
            })
        })
    }

    fn list_instances<'a>(
        &'a self,
        tag_key: &'a str,
        tag_value: &'a str,
        next_token: Option<String>,
    ) -> ProvisionFuture<'a, InstancePage> {
        Box::pin(async move {
            self.record(
                "list_instances",
                format!(
                    "list_instances {tag_key}={tag_value} {}",
                    next_token.as_deref().unwrap_or("-")
                ),
            )?;
            Ok(self
                .with(|state| state.pages.pop_front())
                .unwrap_or_default())
        })
    }

    fn terminate_instance<'a>(&'a self, id: &'a str) -> ProvisionFuture<'a, ()> {
        Box::pin(async move { self.record("terminate_instance", format!("terminate_instance {id}")) })
    }
}

fn instance(id: &str, state: &str, ip: Option<&str>) -> InstanceView {
    InstanceView {
        id: id.to_owned(),
        state: state.to_owned(),
        public_ip: ip.map(str::to_owned),
        security_groups: vec![String::from("sg-1")],
    }
}

fn adapter(api: FakeEc2) -> Ec2Provisioner<FakeEc2> {
    Ec2Provisioner::new(api).with_wait_policy(WaitPolicy {
        interval: Duration::from_millis(1),
        timeout: Duration::from_millis(50),
    })
}

#[fixture]
fn descriptor() -> HostDescriptor {
    HostDescriptor::builder()
        .name("peaceful-turing4")
        .region("eu-west-1")
        .plan("t3.nano")
        .os_image("ubuntu/images/hvm-ssd/ubuntu-jammy-22.04-amd64-server-*")
        .boot_script("#!/bin/bash\necho hi\n")
        .tag(TAG_SUBNET, "subnet-9")
        .build()
        .expect("descriptor")
}

#[rstest]
#[tokio::test]
async fn provision_opens_ports_and_tags_instance(descriptor: HostDescriptor) {
    let provisioner = adapter(FakeEc2::default());
    let host = provisioner.provision(&descriptor).await.expect("provision");

    assert_eq!(host.id, "i-123");
    assert_eq!(host.status, HostStatus::Creating);
    assert_eq!(
        provisioner.api.calls(),
        vec![
            "find_image ubuntu/images/hvm-ssd/ubuntu-jammy-22.04-amd64-server-*",
            "create_security_group inlets-peaceful-turing4 -",
            "authorize_ingress sg-1 80-80",
            "authorize_ingress sg-1 443-443",
            "authorize_ingress sg-1 8080-8080",
            "run_instance ami-found",
        ]
    );
    let launched = provisioner.api.with(|state| state.launched.clone());
    let spec = launched.first().expect("launch spec");
    assert_eq!(spec.user_data, STANDARD.encode("#!/bin/bash\necho hi\n"));
    assert_eq!(spec.subnet_id.as_deref(), Some("subnet-9"));
    assert!(spec.tags.contains(&(String::from("inlets"), String::from("exit-node"))));
    assert!(spec.tags.contains(&(String::from("Name"), String::from("peaceful-turing4"))));
}

#[rstest]
#[tokio::test]
async fn ami_ids_skip_image_lookup_and_pro_opens_high_ports() {
    let pro = HostDescriptor::builder()
        .name("bold-hopper2")
        .region("eu-west-1")
        .plan("t3.nano")
        .os_image("ami-0abc")
        .boot_script("#!/bin/bash\n")
        .tag(crate::host::TAG_PRO, "true")
        .build()
        .expect("descriptor");
    let provisioner = adapter(FakeEc2::default());
    provisioner.provision(&pro).await.expect("provision");

    let calls = provisioner.api.calls();
    assert!(!calls.iter().any(|call| call.starts_with("find_image")));
    assert!(calls.contains(&String::from("authorize_ingress sg-1 1024-65535")));
    assert_eq!(calls.last().map(String::as_str), Some("run_instance ami-0abc"));
}

#[rstest]
#[tokio::test]
async fn failed_launch_removes_security_group(descriptor: HostDescriptor) {
    let api = FakeEc2::default();
    api.with(|state| state.fail.push("run_instance"));
    let provisioner = adapter(api);

    let err = provisioner
        .provision(&descriptor)
        .await
        .expect_err("launch fails");

    assert!(matches!(err, ProvisionError::ProviderApi { .. }));
    assert_eq!(
        provisioner.api.calls().last().map(String::as_str),
        Some("delete_security_group sg-1")
    );
}

#[rstest]
#[tokio::test]
async fn failed_rollback_reports_both_errors(descriptor: HostDescriptor) {
    let api = FakeEc2::default();
    api.with(|state| {
        state.fail.push("authorize_ingress");
        state.fail.push("delete_security_group");
    });
    let provisioner = adapter(api);

    let err = provisioner
        .provision(&descriptor)
        .await
        .expect_err("ingress fails");

    assert!(matches!(err, ProvisionError::RollbackFailed { .. }));
}

#[rstest]
#[case(None, "pending", HostStatus::Creating)]
#[case(Some("initializing"), "running", HostStatus::Initializing)]
#[case(Some("ok"), "running", HostStatus::Active)]
#[case(Some("ok"), "stopped", HostStatus::Other(String::from("stopped")))]
fn status_combines_state_and_health(
    #[case] health: Option<&str>,
    #[case] state: &str,
    #[case] expected: HostStatus,
) {
    assert_eq!(map_status(state, health), expected);
}

#[rstest]
#[tokio::test]
async fn status_reports_public_ip_once_healthy() {
    let api = FakeEc2::default();
    api.with(|state| {
        state.health = Some(String::from("ok"));
        state
            .described
            .push_back(instance("i-123", "running", Some("203.0.113.7")));
    });
    let provisioner = adapter(api);

    let host = provisioner.status("i-123").await.expect("status");

    assert_eq!(host.ip, "203.0.113.7");
    assert_eq!(host.status, HostStatus::Active);
}

#[rstest]
#[tokio::test]
async fn delete_terminates_then_drops_security_groups() {
    let api = FakeEc2::default();
    api.with(|state| {
        state.described.push_back(instance("i-123", "running", None));
        state.described.push_back(instance("i-123", "shutting-down", None));
        state.described.push_back(instance("i-123", "terminated", None));
    });
    let provisioner = adapter(api);

    provisioner
        .delete(&HostDeleteRequest::by_id("i-123"))
        .await
        .expect("delete");

    assert_eq!(
        provisioner.api.calls(),
        vec![
            "describe_instance i-123",
            "terminate_instance i-123",
            "describe_instance i-123",
            "describe_instance i-123",
            "delete_security_group sg-1",
        ]
    );
}

#[rstest]
#[tokio::test]
async fn delete_by_ip_resolves_through_tagged_listing() {
    let api = FakeEc2::default();
    api.with(|state| {
        state.pages.push_back(InstancePage {
            instances: vec![
                instance("i-1", "running", Some("198.51.100.1")),
                instance("i-2", "running", Some("198.51.100.2")),
            ],
            next_token: None,
        });
        state.described.push_back(instance("i-2", "running", None));
    });
    let provisioner = adapter(api);

    provisioner
        .delete(&HostDeleteRequest::by_ip("198.51.100.2"))
        .await
        .expect("delete");

    let calls = provisioner.api.calls();
    assert_eq!(
        calls.first().map(String::as_str),
        Some("list_instances inlets=exit-node -")
    );
    assert!(calls.contains(&String::from("terminate_instance i-2")));
}

#[rstest]
#[tokio::test]
async fn list_follows_next_token() {
    let api = FakeEc2::default();
    api.with(|state| {
        state.pages.push_back(InstancePage {
            instances: vec![instance("i-1", "running", Some("198.51.100.1"))],
            next_token: Some(String::from("tok")),
        });
        state.pages.push_back(InstancePage {
            instances: vec![instance("i-2", "stopped", None)],
            next_token: None,
        });
    });
    let provisioner = adapter(api);

    let hosts = provisioner
        .list(&ListFilter::exit_nodes(ProviderKind::Ec2))
        .await
        .expect("list");

    assert_eq!(hosts.len(), 2);
    assert_eq!(
        hosts.iter().map(|host| host.status.clone()).collect::<Vec<_>>(),
        vec![HostStatus::Active, HostStatus::Other(String::from("stopped"))]
    );
    assert_eq!(
        provisioner.api.calls(),
        vec!["list_instances inlets=exit-node -", "list_instances inlets=exit-node tok"]
    );
}

#[rstest]
#[tokio::test]
async fn list_skips_terminated_instances() {
    let api = FakeEc2::default();
    api.with(|state| {
        state.pages.push_back(InstancePage {
            instances: vec![
                instance("i-1", "terminated", None),
                instance("i-2", "shutting-down", None),
                instance("i-3", "pending", None),
            ],
            next_token: None,
        });
    });
    let provisioner = adapter(api);

    let hosts = provisioner
        .list(&ListFilter::exit_nodes(ProviderKind::Ec2))
        .await
        .expect("list");

    let ids: Vec<&str> = hosts.iter().map(|host| host.id.as_str()).collect();
    assert_eq!(ids, vec!["i-3"]);
}

#[rstest]
#[tokio::test]
async fn janitor_sweep_is_clean_once_instances_terminate() {
    let api = FakeEc2::default();
    api.with(|state| {
        state.pages.push_back(InstancePage {
            instances: vec![instance("i-1", "running", Some("198.51.100.1"))],
            next_token: None,
        });
        state.pages.push_back(InstancePage {
            instances: vec![instance("i-1", "terminated", None)],
            next_token: None,
        });
        state.described.push_back(instance("i-1", "running", None));
        state.described.push_back(instance("i-1", "terminated", None));
    });
    let config = JanitorConfig::new(ProviderKind::Ec2, None, None, None).expect("config");
    let janitor = Janitor::new(config, adapter(api));

    let summary = janitor.sweep().await.expect("terminated hosts do not remain");

    assert_eq!(
        summary,
        SweepSummary {
            deleted_hosts: 1,
            already_gone: 0
        }
    );
}
