//! Project listing command: `kag-bridge projects`.

use std::path::Path;

use anyhow::{Context, Result};
use kag_bridge::config::{BridgeConfig, CliOverrides};
use kag_bridge::service::{OpenSpgProjectClient, ProjectClient, ProjectConfig};

pub async fn cmd_projects(config_path: Option<&Path>, overrides: &CliOverrides) -> Result<()> {
    let config = BridgeConfig::resolve(config_path, overrides)?;
    let client = OpenSpgProjectClient::new(&config.openspg.service_url)?;
    let mut records = client
        .list_projects()
        .await
        .with_context(|| format!("Failed to list projects from {}", config.openspg.service_url))?;
    records.sort_by(|a, b| a.name.cmp(&b.name));

    if records.is_empty() {
        println!("No projects found at {}", config.openspg.service_url);
        return Ok(());
    }

    println!("{:<8} {:<24} {:<24} PIPELINE", "ID", "NAME", "NAMESPACE");
    for record in &records {
        let pipeline = match ProjectConfig::from_record(record, client.host_addr()) {
            Ok(project) => project
                .solver_pipeline()
                .and_then(|p| p.get("type"))
                .and_then(|t| t.as_str())
                .unwrap_or("-")
                .to_string(),
            Err(_) => "(invalid config)".to_string(),
        };
        println!(
            "{:<8} {:<24} {:<24} {}",
            record.id,
            record.name,
            record.namespace.as_deref().unwrap_or("-"),
            pipeline
        );
    }
    Ok(())
}
