//! Unit tests for the `waystation` CLI binary implementation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use super::*;
use rstest::{fixture, rstest};
use waystation::host::HostStatus;
use waystation::lifecycle::LifecycleConfig;
use waystation::test_support::FakeProvisioner;

#[fixture]
fn descriptor() -> HostDescriptor {
    Settings::default()
        .host_descriptor(ProviderKind::DigitalOcean, "test-vm", "s3cret")
        .expect("descriptor should build")
}

fn driver(fake: &FakeProvisioner, delete_on_cancel: bool) -> LifecycleDriver<FakeProvisioner> {
    LifecycleDriver::new(
        fake.clone(),
        LifecycleConfig {
            poll_interval: Duration::from_millis(20),
            max_attempts: 5,
            delete_on_cancel,
            teardown_timeout: Duration::from_secs(5),
        },
    )
}

fn session(descriptor: &HostDescriptor, hold: bool) -> CreateSession<'_> {
    CreateSession {
        kind: ProviderKind::DigitalOcean,
        descriptor,
        auth_token: "s3cret",
        control_port: 8080,
        pro: false,
        hold,
    }
}

fn scripted_active_host() -> FakeProvisioner {
    let fake = FakeProvisioner::new();
    fake.push_provisioned(Ok(ProvisionedHost::creating("do-1")));
    fake.push_status("do-1", "203.0.113.7", HostStatus::Active);
    fake
}

#[rstest]
fn provider_args_override_only_given_values() {
    let mut settings = Settings {
        region: Some(String::from("ams3")),
        zone: Some(String::from("kept")),
        ..Settings::default()
    };
    let args = ProviderArgs {
        provider: Some(String::from("hetzner")),
        region: Some(String::from("fsn1")),
        access_token: Some(String::from("token")),
        ..ProviderArgs::default()
    };

    apply_provider_args(&mut settings, &args);

    assert_eq!(settings.provider, "hetzner");
    assert_eq!(settings.region.as_deref(), Some("fsn1"));
    assert_eq!(settings.zone.as_deref(), Some("kept"));
    assert_eq!(settings.access_token.as_deref(), Some("token"));
}

#[rstest]
fn delete_request_prefers_id_over_ip() {
    let settings = Settings::default();
    let args = DeleteCommand {
        id: Some(String::from("do-1")),
        ip: Some(String::from("203.0.113.7")),
        ..DeleteCommand::default()
    };

    let request = delete_request(&settings, ProviderKind::DigitalOcean, &args);

    assert_eq!(request.id(), Some("do-1"));
    assert_eq!(request.ip(), None);
}

#[rstest]
fn delete_request_by_ip_carries_default_scope() {
    let settings = Settings {
        project_id: Some(String::from("proj")),
        ..Settings::default()
    };
    let args = DeleteCommand {
        ip: Some(String::from("203.0.113.7")),
        ..DeleteCommand::default()
    };

    let request = delete_request(&settings, ProviderKind::Gce, &args);

    assert_eq!(request.ip(), Some("203.0.113.7"));
    assert_eq!(request.project_id.as_deref(), Some("proj"));
    assert_eq!(
        request.zone.as_deref(),
        ProviderKind::Gce.defaults().zone,
        "zonal providers fall back to their default zone"
    );
}

#[rstest]
#[tokio::test]
async fn create_prints_connection_info_once_active(descriptor: HostDescriptor) {
    let fake = scripted_active_host();
    let mut out = Vec::new();

    let code = session(&descriptor, false)
        .drive(&mut out, &driver(&fake, false), std::future::pending::<()>)
        .await
        .expect("create should succeed");

    assert_eq!(code, 0);
    let rendered = String::from_utf8(out).expect("utf8");
    assert!(rendered.contains("do-1 is active at 203.0.113.7"), "{rendered}");
    assert!(rendered.contains("ws://203.0.113.7:8080"), "{rendered}");
    assert!(rendered.contains("--token \"s3cret\""), "{rendered}");
    assert!(
        rendered.contains("waystation delete --provider digitalocean --id \"do-1\""),
        "{rendered}"
    );
    assert!(fake.deleted().is_empty());
}

#[rstest]
#[tokio::test]
async fn interrupted_create_leaves_host_without_rm(descriptor: HostDescriptor) {
    let fake = scripted_active_host();
    let mut out = Vec::new();

    let code = session(&descriptor, false)
        .drive(&mut out, &driver(&fake, false), || async {})
        .await
        .expect("interrupt is not an error");

    assert_eq!(code, INTERRUPTED_EXIT_CODE);
    let rendered = String::from_utf8(out).expect("utf8");
    assert!(rendered.contains("do-1 is still running"), "{rendered}");
    assert!(rendered.contains("to delete:"), "{rendered}");
    assert!(fake.deleted().is_empty());
}

#[rstest]
#[tokio::test]
async fn interrupted_create_deletes_host_with_rm(descriptor: HostDescriptor) {
    let fake = scripted_active_host();
    let mut out = Vec::new();

    let code = session(&descriptor, true)
        .drive(&mut out, &driver(&fake, true), || async {})
        .await
        .expect("interrupt is not an error");

    assert_eq!(code, INTERRUPTED_EXIT_CODE);
    let deleted = fake.deleted();
    assert_eq!(deleted.len(), 1);
    assert_eq!(deleted.first().and_then(HostDeleteRequest::id), Some("do-1"));
}

#[rstest]
#[tokio::test]
async fn rm_holds_active_host_until_interrupted(descriptor: HostDescriptor) {
    let fake = scripted_active_host();
    let calls = AtomicUsize::new(0);
    let signal = || {
        let call = calls.fetch_add(1, Ordering::SeqCst);
        async move {
            if call == 0 {
                std::future::pending::<()>().await;
            }
        }
    };
    let mut out = Vec::new();

    let code = session(&descriptor, true)
        .drive(&mut out, &driver(&fake, true), signal)
        .await
        .expect("create should succeed");

    assert_eq!(code, 0);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    let rendered = String::from_utf8(out).expect("utf8");
    assert!(rendered.contains("press Ctrl+C"), "{rendered}");
    assert!(rendered.contains("deleted do-1"), "{rendered}");
    assert_eq!(fake.deleted().len(), 1);
}

#[rstest]
#[tokio::test]
async fn failed_host_surfaces_lifecycle_error(descriptor: HostDescriptor) {
    let fake = FakeProvisioner::new();
    fake.push_provisioned(Ok(ProvisionedHost::creating("do-1")));
    fake.push_status("do-1", "", HostStatus::Error);
    let mut out = Vec::new();

    let err = session(&descriptor, false)
        .drive(&mut out, &driver(&fake, false), std::future::pending::<()>)
        .await
        .expect_err("failed host should error");

    assert!(
        matches!(err, CliError::Lifecycle(LifecycleError::HostFailed { .. })),
        "unexpected error: {err}"
    );
}

#[rstest]
#[case::with_ip("203.0.113.7", "do-1\tactive\t203.0.113.7\n")]
#[case::without_ip("", "do-1\tinitializing\t-\n")]
fn write_status_renders_tab_separated_line(#[case] ip: &str, #[case] expected: &str) {
    let mut buf = Vec::new();
    write_status(&mut buf, &ProvisionedHost::observed("do-1", ip, HostStatus::Active))
        .expect("write");
    assert_eq!(String::from_utf8(buf).expect("utf8"), expected);
}

#[test]
fn write_error_writes_cli_error() {
    let mut buf = Vec::new();
    let err = CliError::Provider(ProvisionError::NoHostWithIp {
        ip: String::from("203.0.113.7"),
    });
    write_error(&mut buf, &err);
    let rendered = String::from_utf8(buf).expect("utf8");
    assert!(rendered.contains("203.0.113.7"), "rendered: {rendered}");
}
