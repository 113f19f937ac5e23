use anyhow::Result;

use super::Overrides;

pub async fn execute(overrides: &Overrides, model: &str) -> Result<()> {
    let provisioner = super::open_provisioner(overrides)?;
    let registry = provisioner.registry();

    let Some(descriptor) = registry.manifest().get(model) else {
        // Try fuzzy match
        let matches: Vec<_> = registry
            .manifest()
            .ids()
            .filter(|id| id.contains(model))
            .collect();

        if matches.is_empty() {
            println!("Model '{}' is not in the manifest.", model);
            println!("\nRun `modelpack check` to see declared models.");
        } else if matches.len() == 1 {
            println!("Did you mean '{}'?", matches[0]);
        } else {
            println!("Model '{}' not found. Similar models:", model);
            for id in matches {
                println!("  - {}", id);
            }
        }
        return Ok(());
    };

    let path = descriptor.path_in(registry.root());
    if provisioner.remove(model).await? {
        println!("Removed model files from {}", path.display());
        println!("Model '{}' removed.", model);
    } else {
        println!("Model '{}' is not installed.", model);
    }

    Ok(())
}
