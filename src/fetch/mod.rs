//! Input retrieval from HTTP, S3 and local disk.

mod http;
pub mod retry;
pub mod s3;

pub use http::{BasicClient, HttpClient, fetch_bytes};

use anyhow::{Context, Result, bail};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::config::RetryConfig;

/// Makes `url` available as a local file.
///
/// Local paths are returned as-is. `http(s)://` and `s3://` inputs are
/// downloaded into `cache_dir` under their file name, unless already there.
/// `region` is the bucket region for `s3://` inputs.
#[tracing::instrument(skip(retry))]
pub async fn resolve_input(
    url: &str,
    cache_dir: &Path,
    region: &str,
    retry: RetryConfig,
) -> Result<PathBuf> {
    let is_http = url.starts_with("http://") || url.starts_with("https://");
    let is_s3 = url.starts_with("s3://");
    if !is_http && !is_s3 {
        let path = PathBuf::from(url);
        if !path.exists() {
            bail!("input {} does not exist", path.display());
        }
        return Ok(path);
    }

    let file_name = url
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|n| !n.is_empty())
        .with_context(|| format!("no file name in {url}"))?;
    let target = cache_dir.join(file_name);
    if target.exists() {
        debug!(path = %target.display(), "Using cached input");
        return Ok(target);
    }
    std::fs::create_dir_all(cache_dir)
        .with_context(|| format!("creating {}", cache_dir.display()))?;

    if is_s3 {
        let location = s3::S3Location::parse(url)?;
        let client = s3::anonymous_client(region).await;
        retry::with_retry(url, retry, || s3::download_to(&client, &location, &target)).await?;
    } else {
        let client = BasicClient::new();
        let bytes = retry::with_retry(url, retry, || fetch_bytes(&client, url)).await?;
        std::fs::write(&target, bytes)
            .with_context(|| format!("writing {}", target.display()))?;
    }
    info!(path = %target.display(), "Downloaded input");
    Ok(target)
}
