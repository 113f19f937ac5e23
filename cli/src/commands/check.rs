use anyhow::Result;
use chrono::Local;
use modelpack_core::ModelStatus;

use super::Overrides;

pub async fn execute(overrides: &Overrides, models: &[String], json: bool) -> Result<()> {
    let provisioner = super::open_provisioner(overrides)?;
    let ids = (!models.is_empty()).then(|| models.to_vec());
    let report = provisioner.check(ids).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let registry = provisioner.registry();
    println!("Model store: {}\n", registry.root().display());
    println!("{:<24} {:<32} {:<10} {}", "ID", "NAME", "STATUS", "VERIFIED");
    println!("{}", "-".repeat(80));

    for state in report.iter() {
        let name = registry
            .manifest()
            .get(&state.model_id)
            .map(|model| model.title().to_string())
            .unwrap_or_default();
        let verified = match state.status {
            ModelStatus::Missing => "-".to_string(),
            _ => registry
                .ledger_entry(&state.model_id)
                .map(|entry| {
                    entry
                        .verified_at
                        .with_timezone(&Local)
                        .format("%Y-%m-%d %H:%M")
                        .to_string()
                })
                .unwrap_or_else(|| "-".to_string()),
        };
        println!(
            "{:<24} {:<32} {:<10} {}",
            state.model_id,
            name,
            state.status.as_str(),
            verified
        );
    }

    if !report.all_installed() {
        println!("\nRun `modelpack download` to install missing or corrupt models.");
    }

    Ok(())
}
