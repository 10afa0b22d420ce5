//! `chatloop models`: List the configured model registry.

use chatloop_config::AppConfig;

pub fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;

    println!();
    println!("  Configured models ({}):", config.models.len());
    println!();
    for (index, model) in config.models.iter().enumerate() {
        let marker = if index == config.current_model { "*" } else { " " };
        let key = match model.api_key.as_deref() {
            Some(k) if !k.trim().is_empty() => "key set",
            _ => "no key",
        };
        println!(
            "  {marker} [{index}] {:<16} {:<24} {}  ({key})",
            model.id, model.model, model.base_url
        );
    }
    println!();
    println!("  Switch models with `current_model` in {}", AppConfig::config_path().display());
    println!();

    Ok(())
}
