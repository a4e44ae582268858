//! Platform that publishes the proxy settings as a shell environment file

use super::{NetworkPlatform, NetworkSettings};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

/// Writes `http_proxy`/`https_proxy` exports to a file on apply and removes
/// it on reset
///
/// Desktop environments without a settings API can `source` the file.
pub struct EnvFilePlatform {
    path: PathBuf,
    applied: Mutex<Option<NetworkSettings>>,
}

impl EnvFilePlatform {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        EnvFilePlatform {
            path: path.as_ref().to_path_buf(),
            applied: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Settings currently applied
    pub fn applied(&self) -> Option<NetworkSettings> {
        self.applied.lock().clone()
    }

    fn render(settings: &NetworkSettings) -> String {
        let url = settings.proxy_url();
        let mut out = String::new();
        if settings.proxy.http_enabled {
            out.push_str(&format!("export http_proxy={url}\nexport HTTP_PROXY={url}\n"));
        }
        if settings.proxy.https_enabled {
            out.push_str(&format!("export https_proxy={url}\nexport HTTPS_PROXY={url}\n"));
        }
        let no_proxy: Vec<String> = settings
            .excluded_routes
            .iter()
            .map(|net| net.addr().to_string())
            .chain(["localhost".to_string(), "127.0.0.1".to_string()])
            .collect();
        out.push_str(&format!("export no_proxy={}\n", no_proxy.join(",")));
        out
    }
}

#[async_trait]
impl NetworkPlatform for EnvFilePlatform {
    async fn apply(&self, settings: &NetworkSettings) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&self.path, Self::render(settings))
            .await
            .map_err(|e| Error::settings(format!("cannot write {}: {}", self.path.display(), e)))?;

        info!(
            "Proxy environment written to {} ({})",
            self.path.display(),
            settings.proxy_url()
        );
        *self.applied.lock() = Some(settings.clone());
        Ok(())
    }

    async fn reset(&self) -> Result<()> {
        if self.applied.lock().take().is_none() {
            debug!("No proxy environment to reset");
        }
        match fs::remove_file(&self.path).await {
            Ok(()) => {
                info!("Proxy environment removed from {}", self.path.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::settings(format!(
                "cannot remove {}: {}",
                self.path.display(),
                e
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[tokio::test]
    async fn test_apply_and_reset() {
        let dir = tempfile::tempdir().unwrap();
        let platform = EnvFilePlatform::new(dir.path().join("run").join("proxy.env"));
        let settings = NetworkSettings::for_tunnel(Some(Ipv4Addr::new(203, 0, 113, 5)), 10809);

        platform.apply(&settings).await.unwrap();
        let content = std::fs::read_to_string(platform.path()).unwrap();
        assert!(content.contains("export http_proxy=http://127.0.0.1:10809\n"));
        assert!(content.contains("export https_proxy=http://127.0.0.1:10809\n"));
        assert!(content.contains("no_proxy=203.0.113.5,localhost,127.0.0.1"));
        assert_eq!(platform.applied(), Some(settings));

        platform.reset().await.unwrap();
        assert!(!platform.path().exists());
        assert!(platform.applied().is_none());

        // Resetting twice is fine
        platform.reset().await.unwrap();
    }
}
