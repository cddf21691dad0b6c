//! Blocking byte access to local paths and `s3://` URIs.
//!
//! Remote calls go through `object_store` on a private current-thread tokio
//! runtime, so callers stay synchronous. Credentials come from the default
//! AWS session installed by `AwsService`, or from the environment.

use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use futures::TryStreamExt;
use object_store::aws::{AmazonS3, AmazonS3Builder};
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutMode, PutPayload};

use crate::error::{Error, Result};
use crate::io::services;

/// A file or directory on local disk or in an S3 bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    Local(PathBuf),
    S3 { bucket: String, key: String },
}

impl Location {
    pub fn parse(uri: &str) -> Result<Self> {
        if let Some(rest) = uri.strip_prefix("s3://").or_else(|| uri.strip_prefix("s3a://")) {
            let (bucket, key) = rest.split_once('/').unwrap_or((rest, ""));
            if bucket.is_empty() {
                return Err(Error::config(format!("Missing bucket in URI: {}", uri)));
            }
            return Ok(Location::S3 {
                bucket: bucket.to_string(),
                key: key.trim_matches('/').to_string(),
            });
        }
        let path = uri.strip_prefix("file://").unwrap_or(uri);
        Ok(Location::Local(PathBuf::from(path)))
    }

    pub fn join(&self, child: &str) -> Location {
        match self {
            Location::Local(p) => Location::Local(p.join(child)),
            Location::S3 { bucket, key } => Location::S3 {
                bucket: bucket.clone(),
                key: if key.is_empty() {
                    child.to_string()
                } else {
                    format!("{}/{}", key, child.trim_start_matches('/'))
                },
            },
        }
    }

    /// Last path segment.
    pub fn file_name(&self) -> Option<String> {
        match self {
            Location::Local(p) => p.file_name().map(|n| n.to_string_lossy().into_owned()),
            Location::S3 { key, .. } => key.rsplit('/').next().filter(|s| !s.is_empty()).map(String::from),
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, Location::S3 { .. })
    }

    /// Path of `self` relative to `base`, with `/` separators.
    pub fn relative_to(&self, base: &Location) -> Option<String> {
        match (self, base) {
            (Location::Local(p), Location::Local(b)) => p
                .strip_prefix(b)
                .ok()
                .map(|r| r.to_string_lossy().replace('\\', "/")),
            (Location::S3 { bucket, key }, Location::S3 { bucket: bb, key: bk }) if bucket == bb => {
                if bk.is_empty() {
                    Some(key.clone())
                } else {
                    key.strip_prefix(bk.as_str()).map(|r| r.trim_start_matches('/').to_string())
                }
            }
            _ => None,
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Location::Local(p) => write!(f, "{}", p.display()),
            Location::S3 { bucket, key } => write!(f, "s3://{}/{}", bucket, key),
        }
    }
}

fn block_on<F: std::future::Future>(future: F) -> Result<F::Output> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    Ok(runtime.block_on(future))
}

fn s3_store(bucket: &str) -> Result<AmazonS3> {
    let mut builder = AmazonS3Builder::from_env().with_bucket_name(bucket);
    if let Some(session) = services::default_session() {
        builder = builder.with_region(session.region_name.clone());
        if let Some(creds) = session.credentials.as_ref() {
            builder = builder
                .with_access_key_id(creds.access_key_id.clone())
                .with_secret_access_key(creds.secret_access_key.clone());
            if let Some(token) = creds.session_token.as_ref() {
                builder = builder.with_token(token.clone());
            }
        }
    }
    Ok(builder.build()?)
}

pub fn read_bytes(location: &Location) -> Result<Bytes> {
    match location {
        Location::Local(p) => Ok(Bytes::from(fs::read(p)?)),
        Location::S3 { bucket, key } => {
            let store = s3_store(bucket)?;
            let path = ObjectPath::from(key.as_str());
            block_on(async move { store.get(&path).await?.bytes().await })?.map_err(Error::from)
        }
    }
}

pub fn read_to_string(location: &Location) -> Result<String> {
    let bytes = read_bytes(location)?;
    String::from_utf8(bytes.to_vec())
        .map_err(|e| Error::value(format!("{} is not valid UTF-8: {}", location, e)))
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

/// Write `data`, replacing any existing object.
pub fn write_bytes(location: &Location, data: Bytes) -> Result<()> {
    match location {
        Location::Local(p) => {
            ensure_parent(p)?;
            fs::write(p, &data)?;
            Ok(())
        }
        Location::S3 { bucket, key } => {
            let store = s3_store(bucket)?;
            let path = ObjectPath::from(key.as_str());
            block_on(async move { store.put(&path, PutPayload::from(data)).await })??;
            Ok(())
        }
    }
}

/// Write `data` only if nothing exists at `location`. Returns `false` when
/// the object already exists.
pub fn write_new(location: &Location, data: Bytes) -> Result<bool> {
    match location {
        Location::Local(p) => {
            ensure_parent(p)?;
            match fs::OpenOptions::new().write(true).create_new(true).open(p) {
                Ok(mut file) => {
                    file.write_all(&data)?;
                    Ok(true)
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
                Err(e) => Err(e.into()),
            }
        }
        Location::S3 { bucket, key } => {
            let store = s3_store(bucket)?;
            let path = ObjectPath::from(key.as_str());
            let outcome =
                block_on(async move { store.put_opts(&path, PutPayload::from(data), PutMode::Create.into()).await })?;
            match outcome {
                Ok(_) => Ok(true),
                Err(object_store::Error::AlreadyExists { .. }) => Ok(false),
                Err(e) => Err(e.into()),
            }
        }
    }
}

pub fn exists(location: &Location) -> Result<bool> {
    match location {
        Location::Local(p) => Ok(p.exists()),
        Location::S3 { bucket, key } => {
            let store = s3_store(bucket)?;
            let path = ObjectPath::from(key.as_str());
            match block_on(async move { store.head(&path).await })? {
                Ok(_) => Ok(true),
                Err(object_store::Error::NotFound { .. }) => Ok(false),
                Err(e) => Err(e.into()),
            }
        }
    }
}

/// Every file under `prefix`, sorted.
pub fn list_files(prefix: &Location) -> Result<Vec<Location>> {
    match prefix {
        Location::Local(p) => {
            let mut out = Vec::new();
            if p.is_file() {
                out.push(Location::Local(p.clone()));
            } else if p.is_dir() {
                walk(p, &mut out)?;
            }
            out.sort_by_key(|l| l.to_string());
            Ok(out)
        }
        Location::S3 { bucket, key } => {
            let store = s3_store(bucket)?;
            let path = ObjectPath::from(key.as_str());
            let metas = block_on(async move { store.list(Some(&path)).try_collect::<Vec<_>>().await })??;
            let mut out: Vec<Location> = metas
                .into_iter()
                .map(|m| Location::S3 {
                    bucket: bucket.clone(),
                    key: m.location.to_string(),
                })
                .collect();
            out.sort_by_key(|l| l.to_string());
            Ok(out)
        }
    }
}

fn walk(dir: &Path, out: &mut Vec<Location>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            walk(&path, out)?;
        } else {
            out.push(Location::Local(path));
        }
    }
    Ok(())
}

pub fn delete(location: &Location) -> Result<()> {
    match location {
        Location::Local(p) => {
            if p.is_dir() {
                fs::remove_dir_all(p)?;
            } else if p.exists() {
                fs::remove_file(p)?;
            }
            Ok(())
        }
        Location::S3 { bucket, key } => {
            let store = s3_store(bucket)?;
            let path = ObjectPath::from(key.as_str());
            block_on(async move { store.delete(&path).await })??;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_local_and_remote_uris() {
        assert_eq!(
            Location::parse("s3://bucket/data/inputs.parquet").unwrap(),
            Location::S3 {
                bucket: "bucket".into(),
                key: "data/inputs.parquet".into()
            }
        );
        assert_eq!(
            Location::parse("file:///tmp/x.csv").unwrap(),
            Location::Local(PathBuf::from("/tmp/x.csv"))
        );
        assert!(Location::parse("s3:///key").is_err());
    }

    #[test]
    fn joins_and_relativizes_remote_keys() {
        let base = Location::parse("s3://bucket/warehouse").unwrap();
        let file = base.join("db/table/part-0.parquet");
        assert_eq!(file.to_string(), "s3://bucket/warehouse/db/table/part-0.parquet");
        assert_eq!(file.relative_to(&base).unwrap(), "db/table/part-0.parquet");
        assert_eq!(file.file_name().unwrap(), "part-0.parquet");
    }

    #[test]
    fn write_new_refuses_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let target = Location::Local(dir.path().join("log/00.json"));
        assert!(write_new(&target, Bytes::from_static(b"a")).unwrap());
        assert!(!write_new(&target, Bytes::from_static(b"b")).unwrap());
        assert_eq!(read_to_string(&target).unwrap(), "a");
    }

    #[test]
    fn lists_files_recursively_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let base = Location::Local(dir.path().to_path_buf());
        write_bytes(&base.join("b/2.txt"), Bytes::from_static(b"2")).unwrap();
        write_bytes(&base.join("a.txt"), Bytes::from_static(b"1")).unwrap();
        let files: Vec<String> = list_files(&base)
            .unwrap()
            .iter()
            .map(|l| l.relative_to(&base).unwrap())
            .collect();
        assert_eq!(files, vec!["a.txt", "b/2.txt"]);
        delete(&base.join("b")).unwrap();
        assert!(!exists(&base.join("b/2.txt")).unwrap());
    }
}
