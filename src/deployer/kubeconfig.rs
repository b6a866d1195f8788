//! Local kubeconfig write-out

use std::path::Path;

use tracing::info;

use crate::{Error, Result};

/// Write a kubeconfig to disk, creating parent directories
///
/// The file holds admin credentials, so on unix it is readable by the
/// owner only.
pub async fn write_kubeconfig(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, content).await.map_err(|e| {
        Error::Io(std::io::Error::new(
            e.kind(),
            format!("failed to write kubeconfig {}: {e}", path.display()),
        ))
    })?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    }

    info!(path = %path.display(), "Wrote kubeconfig");
    Ok(())
}
