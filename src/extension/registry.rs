//! Secondary registry client (Open VSX REST API).
//!
//! - `GET {base}/api/{publisher}/{name}` → metadata, incl. per-platform downloads
//! - artifact URLs come from the metadata and are streamed to a temp file

use futures_util::StreamExt;
use serde::Deserialize;
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tempfile::NamedTempFile;

use super::platform::{candidates, UNIVERSAL};
use super::ExtensionError;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ArtifactFiles {
    #[serde(default)]
    pub download: Option<String>,
}

/// Subset of the registry's extension JSON.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExtensionMetadata {
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(rename = "targetPlatform", default)]
    pub target_platform: Option<String>,
    #[serde(default)]
    pub files: ArtifactFiles,
    /// platform tag → download URL
    #[serde(default)]
    pub downloads: HashMap<String, String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Download URL chosen for one platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactChoice {
    pub url: String,
    pub platform: String,
}

impl ExtensionMetadata {
    /// Pick the build for `platform` (or a universal one).
    pub fn select(&self, id: &str, platform: Option<&str>) -> Result<ArtifactChoice, ExtensionError> {
        let wanted = platform.map(candidates).unwrap_or_else(|| vec![UNIVERSAL.to_string()]);

        if !self.downloads.is_empty() {
            for tag in &wanted {
                if let Some(url) = self.downloads.get(tag) {
                    return Ok(ArtifactChoice {
                        url: url.clone(),
                        platform: tag.clone(),
                    });
                }
            }
        } else {
            let target = self.target_platform.as_deref().unwrap_or(UNIVERSAL);
            if wanted.iter().any(|t| t == target) {
                if let Some(url) = &self.files.download {
                    return Ok(ArtifactChoice {
                        url: url.clone(),
                        platform: target.to_string(),
                    });
                }
            }
        }

        Err(ExtensionError::IncompatiblePlatform {
            id: id.to_string(),
            platform: platform.unwrap_or("unknown").to_string(),
        })
    }
}

/// `publisher.name` → (`publisher`, `name`)
pub fn split_identifier(id: &str) -> Result<(&str, &str), ExtensionError> {
    match id.split_once('.') {
        Some((publisher, name)) if !publisher.is_empty() && !name.is_empty() => Ok((publisher, name)),
        _ => Err(ExtensionError::InvalidIdentifier(id.to_string())),
    }
}

pub struct SecondaryRegistry {
    http: reqwest::Client,
    /// 기본: "https://open-vsx.org". 테스트에서는 mock 서버 주소로 오버라이드
    base_url: String,
    download_dir: Option<PathBuf>,
}

impl SecondaryRegistry {
    pub fn new(base_url: &str, timeout: Duration, download_dir: Option<PathBuf>) -> Self {
        let http = reqwest::Client::builder()
            .user_agent(concat!("devtunnel-core/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!("Failed to build HTTP client ({}), using defaults", e);
                reqwest::Client::new()
            });
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            download_dir,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn query_metadata(&self, id: &str) -> Result<ExtensionMetadata, ExtensionError> {
        let (publisher, name) = split_identifier(id)?;
        let url = format!("{}/api/{}/{}", self.base_url, publisher, name);
        tracing::debug!("Querying {}", url);

        let response = self
            .http
            .get(&url)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| unreachable_error(&self.base_url, &e))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(ExtensionError::NotFound(id.to_string()));
        }
        if !status.is_success() {
            return Err(ExtensionError::RegistryUnreachable(format!(
                "{} returned {}",
                self.base_url, status
            )));
        }

        let meta: ExtensionMetadata = response
            .json()
            .await
            .map_err(|e| ExtensionError::RegistryUnreachable(format!("invalid metadata for '{}': {}", id, e)))?;
        if meta.error.is_some() || meta.version.is_empty() {
            return Err(ExtensionError::NotFound(id.to_string()));
        }
        Ok(meta)
    }

    /// Stream `choice` into a temp file. The file is removed when the
    /// returned handle is dropped.
    pub async fn download_artifact(
        &self,
        id: &str,
        version: &str,
        choice: &ArtifactChoice,
    ) -> Result<NamedTempFile, ExtensionError> {
        tracing::info!("Downloading {} v{} ({}) from {}", id, version, choice.platform, choice.url);

        let response = self
            .http
            .get(&choice.url)
            .send()
            .await
            .map_err(|e| unreachable_error(&self.base_url, &e))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(ExtensionError::NotFound(format!("{}@{}", id, version)));
        }
        if !response.status().is_success() {
            return Err(ExtensionError::RegistryUnreachable(format!(
                "artifact download returned {}",
                response.status()
            )));
        }

        let prefix = format!("{}-{}-", id, version);
        let mut builder = tempfile::Builder::new();
        builder.prefix(&prefix).suffix(".vsix");
        let mut file = match &self.download_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir).map_err(|e| ExtensionError::Io(e.to_string()))?;
                builder.tempfile_in(dir)
            }
            None => builder.tempfile(),
        }
        .map_err(|e| ExtensionError::Io(e.to_string()))?;

        let mut stream = response.bytes_stream();
        let mut written: u64 = 0;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| unreachable_error(&self.base_url, &e))?;
            file.write_all(&chunk).map_err(|e| ExtensionError::Io(e.to_string()))?;
            written += chunk.len() as u64;
        }
        file.flush().map_err(|e| ExtensionError::Io(e.to_string()))?;

        if written == 0 {
            return Err(ExtensionError::InstallFailed {
                id: id.to_string(),
                reason: "downloaded artifact is empty".to_string(),
            });
        }
        tracing::debug!("Downloaded {} bytes to {}", written, file.path().display());
        Ok(file)
    }
}

fn unreachable_error(base: &str, err: &reqwest::Error) -> ExtensionError {
    if err.is_timeout() {
        ExtensionError::RegistryUnreachable(format!("{}: request timed out", base))
    } else if err.is_connect() {
        ExtensionError::RegistryUnreachable(format!("{}: connection failed", base))
    } else {
        ExtensionError::RegistryUnreachable(format!("{}: {}", base, err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(downloads: &[(&str, &str)]) -> ExtensionMetadata {
        ExtensionMetadata {
            version: "1.0.0".into(),
            files: ArtifactFiles {
                download: Some("https://r/default.vsix".into()),
            },
            downloads: downloads.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_select_platform_build() {
        let m = meta(&[("linux-x64", "https://r/lx.vsix"), ("darwin-arm64", "https://r/da.vsix")]);
        assert_eq!(m.select("a.b", Some("darwin-arm64")).unwrap().url, "https://r/da.vsix");
        assert!(matches!(
            m.select("a.b", Some("win32-arm64")),
            Err(ExtensionError::IncompatiblePlatform { .. })
        ));
    }

    #[test]
    fn test_select_universal() {
        let m = meta(&[]);
        let choice = m.select("a.b", Some("linux-arm64")).unwrap();
        assert_eq!(choice.url, "https://r/default.vsix");
        assert_eq!(choice.platform, "universal");

        let m = meta(&[("universal", "https://r/u.vsix")]);
        assert_eq!(m.select("a.b", None).unwrap().url, "https://r/u.vsix");
    }

    #[test]
    fn test_split_identifier() {
        assert_eq!(split_identifier("augment.vscode-augment").unwrap(), ("augment", "vscode-augment"));
        assert!(split_identifier("noseparator").is_err());
        assert!(split_identifier(".name").is_err());
    }

    #[tokio::test]
    async fn test_unreachable_registry() {
        // 닫힌 포트
        let reg = SecondaryRegistry::new("http://127.0.0.1:9", Duration::from_secs(2), None);
        let err = reg.query_metadata("a.b").await.unwrap_err();
        assert!(matches!(err, ExtensionError::RegistryUnreachable(_)));
    }
}
