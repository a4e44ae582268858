//! Persistence of the last-used link and routing policy

use crate::config::descriptor::ConnectionDescriptor;
use crate::config::parser::{has_link_prefix, parse_link};
use crate::rule::RoutingPolicy;
use crate::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

/// What the client remembers between runs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Profile {
    /// Last-used proxy link
    pub link: Option<String>,

    pub routing: RoutingPolicy,
}

impl Profile {
    pub fn from_descriptor(descriptor: &ConnectionDescriptor, routing: RoutingPolicy) -> Self {
        Profile {
            link: Some(descriptor.to_link()),
            routing,
        }
    }

    /// Parse the saved link, if any
    pub fn descriptor(&self) -> Option<Result<ConnectionDescriptor>> {
        self.link.as_deref().map(parse_link)
    }
}

/// Load-at-start, save-on-change storage
#[async_trait]
pub trait ProfileStore: Send + Sync {
    /// The saved profile, `None` when nothing was saved yet
    async fn load(&self) -> Result<Option<Profile>>;

    async fn save(&self, profile: &Profile) -> Result<()>;
}

/// Profile kept in a YAML file
pub struct YamlProfileStore {
    path: PathBuf,
}

impl YamlProfileStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        YamlProfileStore {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ProfileStore for YamlProfileStore {
    async fn load(&self) -> Result<Option<Profile>> {
        let content = match fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No profile at {}", self.path.display());
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let profile: Profile = serde_yaml::from_str(&content)?;
        if let Some(link) = &profile.link {
            if !has_link_prefix(link.trim()) {
                return Err(Error::config(format!(
                    "profile {} holds an unsupported link",
                    self.path.display()
                )));
            }
        }
        debug!("Loaded profile from {}", self.path.display());
        Ok(Some(profile))
    }

    async fn save(&self, profile: &Profile) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let content = serde_yaml::to_string(profile)?;
        fs::write(&self.path, content).await?;
        info!("Profile saved to {}", self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LINK: &str = "vless://11111111-1111-1111-1111-111111111111@203.0.113.5:443?security=tls&sni=example.com#MyServer";

    #[tokio::test]
    async fn test_missing_profile_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = YamlProfileStore::new(dir.path().join("profile.yaml"));
        assert_eq!(store.load().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = YamlProfileStore::new(dir.path().join("nested").join("profile.yaml"));

        let descriptor = parse_link(LINK).unwrap();
        let profile = Profile::from_descriptor(
            &descriptor,
            RoutingPolicy {
                country_code: Some("DE".to_string()),
                bypass_tld: true,
                ..Default::default()
            },
        );
        tokio_test::assert_ok!(store.save(&profile).await);

        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded, profile);
        assert_eq!(loaded.descriptor().unwrap().unwrap(), descriptor);

        let raw = std::fs::read_to_string(store.path()).unwrap();
        assert!(raw.contains("country-code: DE"));
    }

    #[tokio::test]
    async fn test_foreign_link_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profile.yaml");
        std::fs::write(&path, "link: trojan://pw@host:443\n").unwrap();

        let store = YamlProfileStore::new(&path);
        let err = tokio_test::assert_err!(store.load().await);
        assert!(matches!(err, Error::Config(_)));
    }
}
