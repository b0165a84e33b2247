//! The validated parameters of one export.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{Error, Result};

/// A gzip compression level in `1..=9`.
///
/// 1 is fastest with the worst ratio, 9 is slowest with the best ratio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionLevel(u32);

impl CompressionLevel {
    pub const FASTEST: CompressionLevel = CompressionLevel(1);
    pub const BEST: CompressionLevel = CompressionLevel(9);

    /// Validate a level, rejecting anything outside `1..=9`.
    pub fn new(level: u32) -> Result<Self> {
        if !(1..=9).contains(&level) {
            return Err(Error::config(format!(
                "compression level {level} is outside 1..=9"
            )));
        }
        Ok(Self(level))
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

impl Default for CompressionLevel {
    fn default() -> Self {
        Self(6)
    }
}

/// An object-storage address of the form `scheme://bucket/object-key`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectPath {
    scheme: String,
    bucket: String,
    key: String,
}

impl ObjectPath {
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl FromStr for ObjectPath {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = |why: &str| Error::config(format!("invalid destination '{s}': {why}"));

        let (scheme, rest) = s
            .split_once("://")
            .ok_or_else(|| invalid("expected scheme://bucket/object-key"))?;
        if scheme.is_empty() {
            return Err(invalid("missing scheme"));
        }
        if !scheme
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
        {
            return Err(invalid("scheme contains invalid characters"));
        }

        let (bucket, key) = rest
            .split_once('/')
            .ok_or_else(|| invalid("missing object key"))?;
        if bucket.is_empty() {
            return Err(invalid("missing bucket"));
        }
        if key.is_empty() {
            return Err(invalid("missing object key"));
        }
        if key.ends_with('/') {
            return Err(invalid("object key must not end with '/'"));
        }

        Ok(Self {
            scheme: scheme.to_string(),
            bucket: bucket.to_string(),
            key: key.to_string(),
        })
    }
}

impl fmt::Display for ObjectPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}/{}", self.scheme, self.bucket, self.key)
    }
}

/// Everything an export needs, validated once and never mutated.
#[derive(Debug, Clone)]
pub struct ExportRequest {
    device: PathBuf,
    destination: ObjectPath,
    licenses: Vec<String>,
    level: CompressionLevel,
    confirm: bool,
}

impl ExportRequest {
    /// Build a request from raw values.
    ///
    /// The destination and the compression level are validated here, so a bad value
    /// is reported before the device is ever opened. Blank license entries are
    /// dropped; the order of the remaining ones is kept.
    pub fn new(
        device: impl Into<PathBuf>,
        destination: &str,
        licenses: Vec<String>,
        level: u32,
        confirm: bool,
    ) -> Result<Self> {
        let destination = destination.parse()?;
        let level = CompressionLevel::new(level)?;
        let device = device.into();
        if device.as_os_str().is_empty() {
            return Err(Error::config("device path is empty"));
        }

        let licenses = licenses
            .into_iter()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect();

        Ok(Self {
            device,
            destination,
            licenses,
            level,
            confirm,
        })
    }

    pub fn device(&self) -> &Path {
        &self.device
    }

    pub fn destination(&self) -> &ObjectPath {
        &self.destination
    }

    pub fn licenses(&self) -> &[String] {
        &self.licenses
    }

    pub fn level(&self) -> CompressionLevel {
        self.level
    }

    /// Whether the user must confirm before the destination is written.
    pub fn confirm(&self) -> bool {
        self.confirm
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compression_level_bounds() {
        assert!(CompressionLevel::new(0).is_err());
        assert!(CompressionLevel::new(10).is_err());
        assert_eq!(CompressionLevel::new(1).unwrap(), CompressionLevel::FASTEST);
        assert_eq!(CompressionLevel::new(9).unwrap(), CompressionLevel::BEST);
        assert_eq!(CompressionLevel::default().get(), 6);
    }

    #[test]
    fn test_parse_object_path() {
        let path: ObjectPath = "gs://my-bucket/images/disk.tar.gz".parse().unwrap();
        assert_eq!(path.scheme(), "gs");
        assert_eq!(path.bucket(), "my-bucket");
        assert_eq!(path.key(), "images/disk.tar.gz");
        assert_eq!(path.to_string(), "gs://my-bucket/images/disk.tar.gz");
    }

    #[test]
    fn test_reject_malformed_object_paths() {
        for bad in [
            "",
            "my-bucket/disk.tar.gz",
            "://bucket/key",
            "g s://bucket/key",
            "gs://",
            "gs://bucket",
            "gs://bucket/",
            "gs:///key",
            "gs://bucket/dir/",
        ] {
            let err = bad.parse::<ObjectPath>().unwrap_err();
            assert!(matches!(err, Error::Config { .. }), "accepted {bad:?}");
        }
    }

    #[test]
    fn test_request_rejects_bad_level() {
        let err = ExportRequest::new("/dev/sdb", "gs://b/k", vec![], 12, false).unwrap_err();
        assert!(err.to_string().contains("compression level 12"));
    }

    #[test]
    fn test_request_rejects_bad_destination() {
        let err = ExportRequest::new("/dev/sdb", "bucket/key", vec![], 6, false).unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
    }

    #[test]
    fn test_request_keeps_license_order() {
        let request = ExportRequest::new(
            "/dev/sdb",
            "s3://bucket/disk.tar.gz",
            vec!["LIC-B".into(), " ".into(), " LIC-A ".into()],
            6,
            true,
        )
        .unwrap();
        assert_eq!(request.licenses(), ["LIC-B", "LIC-A"]);
        assert!(request.confirm());
        assert_eq!(request.device(), Path::new("/dev/sdb"));
    }
}
