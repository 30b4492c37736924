//! Regenerates the `KEY=value` env file that the compose file reads.

use std::path::Path;

use llamactl_common::{ModelProfile, Result};

/// Keys owned by llamactl. Lines for any other key are carried over.
pub const MANAGED_KEYS: [&str; 6] = ["MODEL", "CTX_SIZE", "N_GPU_LAYERS", "FIT", "FIT_TARGET", "EXTRA_ARGS"];

/// Non-empty profile fields in a fixed key order.
pub fn profile_entries(profile: &ModelProfile) -> Vec<(&'static str, String)> {
    let fields = [
        &profile.model,
        &profile.ctx_size,
        &profile.gpu_layers,
        &profile.fit,
        &profile.fit_target,
        &profile.extra_args,
    ];
    MANAGED_KEYS
        .iter()
        .zip(fields)
        .filter_map(|(key, value)| {
            // one entry per line, whatever the profile file contained
            let value = value.split_whitespace().collect::<Vec<_>>().join(" ");
            (!value.is_empty()).then_some((*key, value))
        })
        .collect()
}

/// Renders the new file: unmanaged lines from `existing` in their original
/// order, then the profile's entries.
pub fn render_env(existing: &str, profile: &ModelProfile) -> String {
    let mut out = String::new();
    for line in existing.lines() {
        let key = line.split_once('=').map(|(k, _)| k.trim());
        if key.is_some_and(|k| MANAGED_KEYS.contains(&k)) {
            continue;
        }
        out.push_str(line);
        out.push('\n');
    }
    for (key, value) in profile_entries(profile) {
        out.push_str(key);
        out.push('=');
        out.push_str(&value);
        out.push('\n');
    }
    out
}

/// Rewrites `path` for `profile`, replacing it atomically.
pub async fn write_env_file(path: &Path, profile: &ModelProfile) -> Result<()> {
    let existing = match tokio::fs::read_to_string(path).await {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e.into()),
    };
    let rendered = render_env(&existing, profile);
    let tmp = path.with_extension("llamactl.tmp");
    tokio::fs::write(&tmp, rendered).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}
