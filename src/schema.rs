use std::fs;
use std::path::Path;

use anyhow::Context;
use rpc_transport::jsonrpc::{Request, Response};
use schemars::{Schema, schema_for};
use tracing::info;

use crate::config::ConnectionSettings;
use crate::connection::{ConnectionSnapshot, StatusUpdate};
use crate::node::RequestNodeConfig;

fn schemas() -> Vec<(&'static str, Schema)> {
    vec![
        ("request", schema_for!(Request)),
        ("response", schema_for!(Response)),
        ("connection-settings", schema_for!(ConnectionSettings)),
        ("status-update", schema_for!(StatusUpdate)),
        ("connection-snapshot", schema_for!(ConnectionSnapshot)),
        ("request-node", schema_for!(RequestNodeConfig)),
    ]
}

/// The entry point invoked by `main.rs` for `Commands::Schema`.
/// Writes one `<name>.schema.json` per type into `out_dir`.
pub fn write_schema(out_dir: &Path) -> anyhow::Result<Vec<String>> {
    fs::create_dir_all(out_dir)
        .with_context(|| format!("could not create {}", out_dir.display()))?;

    let mut written = Vec::new();
    for (name, schema) in schemas() {
        let file = format!("{name}.schema.json");
        let json = serde_json::to_string_pretty(&schema)?;
        fs::write(out_dir.join(&file), json).with_context(|| format!("could not write {file}"))?;
        info!(file = %file, "schema written");
        written.push(file);
    }
    Ok(written)
}
