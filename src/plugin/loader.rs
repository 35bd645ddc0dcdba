use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use tracing::debug;

use super::Plugin;

/// Load every `*.yaml` / `*.yml` plugin in `dir`, sorted by file name.
///
/// A single invalid plugin fails the whole load so it can never be scheduled.
pub fn load_plugins_from_dir(dir: impl AsRef<Path>) -> Result<Vec<Plugin>> {
    let dir = dir.as_ref();
    let entries = fs::read_dir(dir)
        .with_context(|| format!("failed to read plugin directory: {}", dir.display()))?;

    let mut paths = Vec::new();
    for entry in entries {
        let path = entry?.path();
        let is_yaml = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e == "yaml" || e == "yml");
        if path.is_file() && is_yaml {
            paths.push(path);
        }
    }
    paths.sort();

    let mut plugins = Vec::with_capacity(paths.len());
    for path in paths {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("failed to read plugin: {}", path.display()))?;
        let plugin = Plugin::from_yaml_str(&content)
            .with_context(|| format!("invalid plugin: {}", path.display()))?;
        debug!(plugin = %plugin.id, path = %path.display(), "loaded plugin");
        plugins.push(plugin);
    }

    if plugins.is_empty() {
        bail!("no plugins found in {}", dir.display());
    }
    Ok(plugins)
}
