use std::path::Path;

use usenetfs::UsenetConfig;

/// Reads `settings.json`, falling back to defaults when the file is missing
/// or unreadable.
pub fn load_settings(path: &Path) -> UsenetConfig {
    if path.exists() {
        match std::fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str::<UsenetConfig>(&content) {
                Ok(settings) => {
                    tracing::info!("Loaded settings from {:?}", path);
                    return settings;
                }
                Err(e) => tracing::warn!("Ignoring invalid settings file {:?}: {}", path, e),
            },
            Err(e) => tracing::warn!("Failed to read settings file {:?}: {}", path, e),
        }
    }

    tracing::info!("Using default settings");
    UsenetConfig::default()
}

pub async fn save_settings(path: &Path, settings: &UsenetConfig) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(settings)?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }

    tokio::fs::write(path, json).await?;
    tracing::info!("Settings saved to {:?}", path);
    Ok(())
}
