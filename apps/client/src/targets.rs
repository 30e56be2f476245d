//! Named connection targets.

use std::{collections::HashMap, path::Path};

use anyhow::{Context, bail};
use remote_exec_transport::TransportDescriptor;

/// Load a JSON object mapping target names to transport descriptors.
pub fn load_targets(path: &Path) -> anyhow::Result<HashMap<String, TransportDescriptor>> {
    let text = std::fs::read_to_string(path).with_context(|| format!("cannot read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("invalid targets file {}", path.display()))
}

/// Pick `name` out of the targets file at `path`.
pub fn resolve_target(path: &Path, name: &str) -> anyhow::Result<TransportDescriptor> {
    let mut targets = load_targets(path)?;
    let Some(descriptor) = targets.remove(name) else {
        let mut known: Vec<_> = targets.into_keys().collect();
        known.sort();
        bail!("unknown target {name:?}; known targets: {}", known.join(", "));
    };
    descriptor.validate()?;
    Ok(descriptor)
}
