//! Anonymous access to public S3 buckets, plus optional output upload.

use anyhow::{Context, Result, anyhow, bail};
use aws_sdk_s3::primitives::ByteStream;
use flate2::Compression;
use flate2::write::GzEncoder;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const DEFAULT_REGION: &str = "us-east-1";

/// `s3://bucket/key`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Location {
    pub bucket: String,
    pub key: String,
}

impl S3Location {
    pub fn parse(url: &str) -> Result<Self> {
        let rest = url
            .strip_prefix("s3://")
            .ok_or_else(|| anyhow!("'{url}' is not an s3:// URL"))?;
        let (bucket, key) = rest.split_once('/').unwrap_or((rest, ""));
        if bucket.is_empty() {
            bail!("'{url}' has no bucket");
        }
        Ok(Self {
            bucket: bucket.to_string(),
            key: key.to_string(),
        })
    }

    /// The key's directory, with a trailing `/` (empty at the bucket root).
    pub fn parent_prefix(&self) -> String {
        match self.key.trim_end_matches('/').rsplit_once('/') {
            Some((parent, _)) => format!("{parent}/"),
            None => String::new(),
        }
    }

    /// The last path segment of the key.
    pub fn file_name(&self) -> &str {
        self.key.trim_end_matches('/').rsplit('/').next().unwrap_or("")
    }
}

impl fmt::Display for S3Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s3://{}/{}", self.bucket, self.key)
    }
}

/// Region to use for a bucket: `AWS_REGION` when set, else `default`.
pub fn resolve_region(default: &str) -> String {
    std::env::var("AWS_REGION").unwrap_or_else(|_| default.to_string())
}

/// An S3 client that sends unsigned requests, for public data buckets.
pub async fn anonymous_client(region: &str) -> aws_sdk_s3::Client {
    let config = aws_config::defaults(aws_config::BehaviorVersion::latest())
        .region(aws_config::Region::new(resolve_region(region)))
        .no_credentials()
        .load()
        .await;
    aws_sdk_s3::Client::new(&config)
}

/// Every object key under `prefix`.
pub async fn list_keys(client: &aws_sdk_s3::Client, bucket: &str, prefix: &str) -> Result<Vec<String>> {
    let mut keys = Vec::new();
    let mut token: Option<String> = None;
    loop {
        let resp = client
            .list_objects_v2()
            .bucket(bucket)
            .prefix(prefix)
            .set_continuation_token(token.take())
            .send()
            .await
            .with_context(|| format!("listing s3://{bucket}/{prefix}"))?;
        keys.extend(
            resp.contents()
                .iter()
                .filter_map(|o| o.key().map(str::to_string)),
        );
        match resp.next_continuation_token() {
            Some(next) => token = Some(next.to_string()),
            None => break,
        }
    }
    debug!(bucket, prefix, count = keys.len(), "Listed keys");
    Ok(keys)
}

/// The immediate "sub-directories" of `prefix` (delimiter listing).
pub async fn list_prefixes(
    client: &aws_sdk_s3::Client,
    bucket: &str,
    prefix: &str,
) -> Result<Vec<String>> {
    let mut prefixes = Vec::new();
    let mut token: Option<String> = None;
    loop {
        let resp = client
            .list_objects_v2()
            .bucket(bucket)
            .prefix(prefix)
            .delimiter("/")
            .set_continuation_token(token.take())
            .send()
            .await
            .with_context(|| format!("listing s3://{bucket}/{prefix}"))?;
        prefixes.extend(
            resp.common_prefixes()
                .iter()
                .filter_map(|p| p.prefix().map(|s| s.trim_end_matches('/').to_string())),
        );
        match resp.next_continuation_token() {
            Some(next) => token = Some(next.to_string()),
            None => break,
        }
    }
    debug!(bucket, prefix, count = prefixes.len(), "Listed prefixes");
    Ok(prefixes)
}

/// Writes `bytes` beside `path` and renames into place, so an interrupted
/// write never leaves a truncated file under the final name.
fn write_atomically(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".part");
    let tmp = PathBuf::from(tmp);
    std::fs::write(&tmp, bytes).with_context(|| format!("writing {}", tmp.display()))?;
    std::fs::rename(&tmp, path).with_context(|| format!("renaming {} to {}", tmp.display(), path.display()))?;
    Ok(())
}

/// Downloads one object to `path`, creating parent directories.
pub async fn download_to(client: &aws_sdk_s3::Client, location: &S3Location, path: &Path) -> Result<()> {
    let resp = client
        .get_object()
        .bucket(&location.bucket)
        .key(&location.key)
        .send()
        .await
        .with_context(|| format!("downloading {location}"))?;
    let bytes = resp
        .body
        .collect()
        .await
        .with_context(|| format!("reading body of {location}"))?
        .into_bytes();
    write_atomically(path, &bytes)?;
    debug!(%location, bytes = bytes.len(), "Downloaded object");
    Ok(())
}

/// Files under `dir`, recursively, in a stable order.
fn files_under(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        for entry in std::fs::read_dir(&current)
            .with_context(|| format!("reading {}", current.display()))?
        {
            let path = entry?.path();
            if path.is_dir() {
                pending.push(path);
            } else {
                files.push(path);
            }
        }
    }
    files.sort();
    Ok(files)
}

/// Object key for `file` below `dir`, under `prefix`.
fn upload_key(prefix: &str, dir: &Path, file: &Path, gzip: bool) -> Result<String> {
    let relative = file
        .strip_prefix(dir)?
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");
    let base = dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let mut key = [prefix.trim_matches('/'), base.as_str(), relative.as_str()]
        .iter()
        .filter(|s| !s.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join("/");
    if gzip {
        key.push_str(".gz");
    }
    Ok(key)
}

/// Uploads every file in `dir` to `s3://bucket/prefix/<dir name>/...`,
/// optionally gzip-compressing each file.
#[tracing::instrument(skip(client), fields(dir = %dir.display()))]
pub async fn upload_dir(
    client: &aws_sdk_s3::Client,
    bucket: &str,
    prefix: &str,
    dir: &Path,
    gzip: bool,
) -> Result<usize> {
    let mut upload_count = 0;
    for path in files_under(dir)? {
        let file_contents = std::fs::read(&path)?;

        let body = if gzip {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&file_contents)?;
            encoder.finish()?
        } else {
            file_contents
        };
        let key = upload_key(prefix, dir, &path, gzip)?;

        client
            .put_object()
            .bucket(bucket)
            .key(&key)
            .body(ByteStream::from(body))
            .send()
            .await
            .with_context(|| format!("uploading s3://{bucket}/{key}"))?;

        upload_count += 1;
    }

    info!(upload_count, bucket, "S3 upload complete");
    Ok(upload_count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_location() {
        let loc = S3Location::parse("s3://lynker-spatial/hydrofabric/v20.1/camels/Gage_1022500.gpkg")
            .unwrap();
        assert_eq!(loc.bucket, "lynker-spatial");
        assert_eq!(loc.key, "hydrofabric/v20.1/camels/Gage_1022500.gpkg");
        assert_eq!(loc.parent_prefix(), "hydrofabric/v20.1/camels/");
        assert_eq!(loc.file_name(), "Gage_1022500.gpkg");
        assert_eq!(loc.to_string(), "s3://lynker-spatial/hydrofabric/v20.1/camels/Gage_1022500.gpkg");
    }

    #[test]
    fn test_parse_bucket_only() {
        let loc = S3Location::parse("s3://hrrrzarr").unwrap();
        assert_eq!(loc.key, "");
        assert_eq!(loc.parent_prefix(), "");
        assert!(S3Location::parse("https://example.com/x").is_err());
        assert!(S3Location::parse("s3:///key").is_err());
    }

    #[test]
    fn test_upload_key() {
        let dir = Path::new("/data/2000_to_2001/camels_1022500_2000_to_2001");
        let file = dir.join("cat-1_1022500_2000_to_2001.csv");
        assert_eq!(
            upload_key("forcings/", dir, &file, true).unwrap(),
            "forcings/camels_1022500_2000_to_2001/cat-1_1022500_2000_to_2001.csv.gz"
        );
        assert_eq!(
            upload_key("", dir, &file, false).unwrap(),
            "camels_1022500_2000_to_2001/cat-1_1022500_2000_to_2001.csv"
        );
    }

    #[test]
    fn test_files_under_recurses() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("nested")).unwrap();
        std::fs::write(dir.path().join("a.csv"), "a").unwrap();
        std::fs::write(dir.path().join("nested/b.csv"), "b").unwrap();
        let files = files_under(dir.path()).unwrap();
        assert_eq!(files.len(), 2);
    }

    #[test]
    fn test_write_atomically_replaces_whole_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("camels").join("Gage_1022500.gpkg");
        write_atomically(&path, b"first version").unwrap();
        write_atomically(&path, b"second").unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"second");
        let names: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("Gage_1022500.gpkg")]);
    }
}
