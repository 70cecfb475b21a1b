//! Shared fixtures for delete-by-IP scenarios.

use rstest::fixture;
use serde_json::json;
use waystation::test_support::ScriptedTransport;

#[derive(Clone, Debug)]
pub struct DeleteContext {
    pub transport: ScriptedTransport,
    pub outcome: Option<Result<(), String>>,
}

#[fixture]
pub fn delete_context() -> DeleteContext {
    DeleteContext {
        transport: ScriptedTransport::new(),
        outcome: None,
    }
}

/// Renders a tagged droplet with one private and one public address.
pub fn droplet(id: u64, ip: &str) -> serde_json::Value {
    json!({
        "id": id,
        "status": "active",
        "networks": {"v4": [
            {"ip_address": "10.0.0.2", "type": "private"},
            {"ip_address": ip, "type": "public"}
        ]}
    })
}

/// Parses `id=ip` pairs separated by commas.
pub fn parse_droplets(spec: &str) -> Vec<(u64, String)> {
    spec.split(',')
        .filter_map(|pair| {
            let (id, ip) = pair.trim().split_once('=')?;
            Some((id.parse().ok()?, ip.to_owned()))
        })
        .collect()
}
