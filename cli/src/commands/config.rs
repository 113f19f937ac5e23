use anyhow::Result;
use modelpack_core::Config;

pub async fn execute(key: Option<&str>, value: Option<&str>) -> Result<()> {
    let mut config = Config::load()?;

    match (key, value) {
        // Show all config
        (None, None) => {
            println!("Configuration file: {:?}\n", Config::config_path()?);
            println!("[store]");
            println!("  path = {:?}", config.store.path.display().to_string());
            println!();
            println!("[pack]");
            println!("  manifest = {:?}", config.pack.manifest.display().to_string());
            println!(
                "  url = {}",
                config
                    .pack
                    .url
                    .as_ref()
                    .map(|url| format!("{:?}", url))
                    .unwrap_or_else(|| "(from manifest)".to_string())
            );
            println!();
            println!("[download]");
            println!("  user_agent = {:?}", config.download.user_agent);
            println!(
                "  connect_timeout_secs = {}",
                config.download.connect_timeout_secs
            );
        }

        // Get a specific key
        (Some(key), None) => {
            let value = get_config_value(&config, key)?;
            println!("{}", value);
        }

        // Set a specific key
        (Some(key), Some(value)) => {
            set_config_value(&mut config, key, value)?;
            config.save()?;
            println!("Set {} = {}", key, value);
        }

        _ => unreachable!(),
    }

    Ok(())
}

fn get_config_value(config: &Config, key: &str) -> Result<String> {
    match key {
        "store.path" => Ok(config.store.path.display().to_string()),
        "pack.manifest" => Ok(config.pack.manifest.display().to_string()),
        "pack.url" => Ok(config.pack.url.clone().unwrap_or_default()),
        "download.user_agent" => Ok(config.download.user_agent.clone()),
        "download.connect_timeout_secs" => Ok(config.download.connect_timeout_secs.to_string()),
        _ => anyhow::bail!("Unknown config key: {}", key),
    }
}

fn set_config_value(config: &mut Config, key: &str, value: &str) -> Result<()> {
    match key {
        "store.path" => config.store.path = value.into(),
        "pack.manifest" => config.pack.manifest = value.into(),
        "pack.url" => {
            config.pack.url = if value.is_empty() {
                None
            } else {
                Some(value.to_string())
            }
        }
        "download.user_agent" => config.download.user_agent = value.to_string(),
        "download.connect_timeout_secs" => config.download.connect_timeout_secs = value.parse()?,
        _ => anyhow::bail!("Unknown config key: {}", key),
    }
    Ok(())
}
