use anyhow::{anyhow, bail, Result};
use dialoguer::Confirm;
use std::path::{Path, PathBuf};

pub fn confirm_or_yes(yes: bool, prompt: &str) -> Result<()> {
    if yes {
        return Ok(());
    }
    let confirmed = Confirm::new()
        .with_prompt(prompt)
        .default(false)
        .interact()
        .map_err(|e| anyhow!("prompt failed: {e}"))?;
    if confirmed {
        Ok(())
    } else {
        bail!("aborted by user")
    }
}

/// Host location of a virtual path below `root`.
pub fn host_path(root: &Path, virtual_path: &str) -> PathBuf {
    virtual_path
        .split('/')
        .filter(|s| !s.is_empty())
        .fold(root.to_path_buf(), |acc, part| acc.join(part))
}

/// Virtual path of a host file below `root`, `/`-separated.
pub fn virtual_path(root: &Path, host: &Path) -> Result<String> {
    let rel = host
        .strip_prefix(root)
        .map_err(|_| anyhow!("{} is outside {}", host.display(), root.display()))?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect();
    Ok(parts.join("/"))
}

pub fn format_mib(bytes: u64) -> String {
    const MIB: u64 = 1024 * 1024;
    if bytes % MIB == 0 {
        format!("{}", bytes / MIB)
    } else {
        format!("{:.1}", bytes as f64 / MIB as f64)
    }
}
