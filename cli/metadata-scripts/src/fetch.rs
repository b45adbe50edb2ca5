//! Turning a script entry into a runnable file on disk.

use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::Url;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::script::{ScriptEntry, Suffix};

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("{key}: url {url} does not end in .ps1, .cmd or .bat")]
    UnknownExtension { key: String, url: String },

    #[error("gsutil failed to copy {url}: {stderr}")]
    Gsutil { url: String, stderr: String },

    #[error("download of {url} failed after {attempts} attempts: {last}")]
    Download {
        url: String,
        attempts: u32,
        last: String,
    },

    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A script written to disk and ready to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalScript {
    pub key: String,
    /// Never [`Suffix::Url`].
    pub suffix: Suffix,
    pub path: PathBuf,
}

/// Rewrite a Cloud Storage location to its `gs://bucket/object` form.
///
/// Accepts `gs://` URLs, virtual-host style
/// `https://bucket.storage.googleapis.com/object`, and path style
/// `https://storage.googleapis.com/bucket/object` (also on
/// `commondatastorage.googleapis.com`). Anything else yields `None`.
pub fn gcs_location(raw: &str) -> Option<String> {
    let url = Url::parse(raw).ok()?;
    let host = url.host_str()?;
    let path = url.path().trim_start_matches('/');

    let (bucket, object) = match url.scheme() {
        "gs" => (host.to_string(), path.to_string()),
        "http" | "https" => {
            if let Some(bucket) = host.strip_suffix(".storage.googleapis.com") {
                (bucket.to_string(), path.to_string())
            } else if host == "storage.googleapis.com" || host == "commondatastorage.googleapis.com"
            {
                let (bucket, object) = path.split_once('/')?;
                (bucket.to_string(), object.to_string())
            } else {
                return None;
            }
        }
        _ => return None,
    };

    if !is_bucket_name(&bucket) || object.is_empty() {
        return None;
    }
    Some(format!("gs://{}/{}", bucket, object))
}

fn is_bucket_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() || c.is_ascii_digit() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '-' | '_' | '.'))
}

/// Fetcher configuration.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Directory scripts are written into.
    pub dir: PathBuf,
    /// Program used for Cloud Storage copies.
    pub gsutil: String,
    pub download_attempts: u32,
    pub retry_delay: Duration,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            dir: std::env::temp_dir(),
            gsutil: "gsutil".to_string(),
            download_attempts: 5,
            retry_delay: Duration::from_secs(1),
        }
    }
}

pub struct Fetcher {
    http: reqwest::Client,
    config: FetchConfig,
}

impl Fetcher {
    pub fn new(config: FetchConfig) -> Result<Self, FetchError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .map_err(FetchError::Client)?;
        Ok(Self { http, config })
    }

    /// Write the script to a uniquely named file in the configured directory.
    pub async fn materialize(&self, entry: &ScriptEntry) -> Result<LocalScript, FetchError> {
        let suffix = match entry.suffix {
            Suffix::Url => {
                Suffix::from_url(entry.value.trim()).ok_or_else(|| FetchError::UnknownExtension {
                    key: entry.key.clone(),
                    url: entry.value.clone(),
                })?
            }
            other => other,
        };

        let path = self
            .config
            .dir
            .join(format!("{}.{}", Uuid::new_v4(), suffix.as_str()));

        if entry.suffix == Suffix::Url {
            if let Err(e) = self.download(entry.value.trim(), &path).await {
                let _ = tokio::fs::remove_file(&path).await;
                return Err(e);
            }
        } else {
            tokio::fs::write(&path, entry.value.as_bytes()).await?;
        }

        debug!(key = %entry.key, path = %path.display(), "Script written");
        Ok(LocalScript {
            key: entry.key.clone(),
            suffix,
            path,
        })
    }

    async fn download(&self, url: &str, dest: &Path) -> Result<(), FetchError> {
        match gcs_location(url) {
            Some(gs) if url.starts_with("gs://") => self.gsutil_copy(&gs, dest).await,
            Some(gs) => match self.gsutil_copy(&gs, dest).await {
                Ok(()) => Ok(()),
                Err(e) => {
                    info!(error = %e, url = %url, "gsutil copy failed, downloading over HTTP");
                    self.http_download(url, dest).await
                }
            },
            None => self.http_download(url, dest).await,
        }
    }

    async fn gsutil_copy(&self, gs: &str, dest: &Path) -> Result<(), FetchError> {
        info!(url = %gs, "Copying script with gsutil");
        let output = Command::new(&self.config.gsutil)
            .arg("-q")
            .arg("cp")
            .arg(gs)
            .arg(dest)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| FetchError::Gsutil {
                url: gs.to_string(),
                stderr: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(FetchError::Gsutil {
                url: gs.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }

    async fn http_download(&self, url: &str, dest: &Path) -> Result<(), FetchError> {
        let attempts = self.config.download_attempts.max(1);
        let mut last = String::new();

        for attempt in 1..=attempts {
            match self.try_download(url).await {
                Ok(body) => {
                    tokio::fs::write(dest, &body).await?;
                    return Ok(());
                }
                Err(e) => {
                    warn!(url = %url, attempt, error = %e, "Script download failed");
                    last = e.to_string();
                }
            }
            if attempt < attempts {
                tokio::time::sleep(self.config.retry_delay).await;
            }
        }

        Err(FetchError::Download {
            url: url.to_string(),
            attempts,
            last,
        })
    }

    async fn try_download(&self, url: &str) -> reqwest::Result<Vec<u8>> {
        let response = self.http.get(url).send().await?.error_for_status()?;
        Ok(response.bytes().await?.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    #[rstest]
    #[case("gs://my-bucket/dir/run.ps1", Some("gs://my-bucket/dir/run.ps1"))]
    #[case(
        "https://my-bucket.storage.googleapis.com/run.cmd",
        Some("gs://my-bucket/run.cmd")
    )]
    #[case(
        "http://storage.googleapis.com/my-bucket/a/b.bat",
        Some("gs://my-bucket/a/b.bat")
    )]
    #[case(
        "https://commondatastorage.googleapis.com/my-bucket/run.ps1",
        Some("gs://my-bucket/run.ps1")
    )]
    #[case("https://storage.googleapis.com/only-bucket", None)]
    #[case("https://example.com/run.ps1", None)]
    #[case("ftp://my-bucket.storage.googleapis.com/run.ps1", None)]
    #[case("not a url", None)]
    fn test_gcs_location(#[case] raw: &str, #[case] expected: Option<&str>) {
        assert_eq!(gcs_location(raw).as_deref(), expected);
    }

    fn fetcher(dir: &Path) -> Fetcher {
        Fetcher::new(FetchConfig {
            dir: dir.to_path_buf(),
            gsutil: "gsutil-not-installed-for-tests".to_string(),
            download_attempts: 5,
            retry_delay: Duration::from_millis(10),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_inline_script_written_with_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let entry = ScriptEntry {
            key: "windows-startup-script-cmd".to_string(),
            suffix: Suffix::Cmd,
            value: "echo hello".to_string(),
        };

        let local = fetcher(dir.path()).materialize(&entry).await.unwrap();

        assert_eq!(local.suffix, Suffix::Cmd);
        assert_eq!(local.path.extension().unwrap(), "cmd");
        assert_eq!(local.path.parent().unwrap(), dir.path());
        assert_eq!(std::fs::read_to_string(&local.path).unwrap(), "echo hello");
    }

    #[tokio::test]
    async fn test_url_download_retries_transient_failures() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/setup.ps1"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/setup.ps1"))
            .respond_with(ResponseTemplate::new(200).set_body_string("Write-Host ok"))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let entry = ScriptEntry {
            key: "windows-startup-script-url".to_string(),
            suffix: Suffix::Url,
            value: format!("{}/setup.ps1", server.uri()),
        };

        let local = fetcher(dir.path()).materialize(&entry).await.unwrap();

        assert_eq!(local.suffix, Suffix::Ps1);
        assert_eq!(std::fs::read_to_string(&local.path).unwrap(), "Write-Host ok");
    }

    #[tokio::test]
    async fn test_url_download_gives_up_after_attempts() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .expect(5)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let entry = ScriptEntry {
            key: "windows-startup-script-url".to_string(),
            suffix: Suffix::Url,
            value: format!("{}/missing.bat", server.uri()),
        };

        let err = fetcher(dir.path()).materialize(&entry).await.unwrap_err();

        assert!(matches!(err, FetchError::Download { attempts: 5, .. }));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_url_without_known_extension_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let entry = ScriptEntry {
            key: "windows-startup-script-url".to_string(),
            suffix: Suffix::Url,
            value: "https://example.com/run.sh".to_string(),
        };

        let err = fetcher(dir.path()).materialize(&entry).await.unwrap_err();
        assert!(matches!(err, FetchError::UnknownExtension { .. }));
    }

    #[tokio::test]
    async fn test_gs_url_without_gsutil_fails() {
        let dir = tempfile::tempdir().unwrap();
        let entry = ScriptEntry {
            key: "windows-startup-script-url".to_string(),
            suffix: Suffix::Url,
            value: "gs://my-bucket/run.ps1".to_string(),
        };

        let err = fetcher(dir.path()).materialize(&entry).await.unwrap_err();
        assert!(matches!(err, FetchError::Gsutil { .. }));
    }
}
