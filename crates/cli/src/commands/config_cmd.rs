//! `chatloop config`: Configuration inspection commands.

use chatloop_config::AppConfig;

pub fn path_and_defaults() -> Result<(), Box<dyn std::error::Error>> {
    println!("# {}", AppConfig::config_path().display());
    println!();
    println!("{}", AppConfig::default_toml());
    Ok(())
}

pub fn show() -> Result<(), Box<dyn std::error::Error>> {
    let mut config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;
    for model in &mut config.models {
        if model.api_key.is_some() {
            model.api_key = Some("[REDACTED]".into());
        }
    }
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}
