//! Destination handles for the compressed stream.
//!
//! Constructing real cloud clients is left to the caller: anything that can hand
//! out an [`UploadSink`] for an [`ObjectPath`] can be an [`ObjectStore`].
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};

use tempfile::NamedTempFile;

use crate::error::{Error, Result, Stage};
use crate::request::ObjectPath;

/// A write handle for one destination object.
///
/// Bytes written are not guaranteed to be visible until [`UploadSink::commit`]
/// returns. Dropping a sink without committing is the same as aborting it.
pub trait UploadSink: Write {
    /// Finish the upload and make the object visible at its destination.
    fn commit(self) -> io::Result<()>
    where
        Self: Sized;

    /// Give up on the upload.
    fn abort(self)
    where
        Self: Sized;
}

/// Something that opens sinks for object paths.
pub trait ObjectStore {
    type Sink: UploadSink;

    fn create(&self, path: &ObjectPath) -> Result<Self::Sink>;
}

/// An object store backed by a local directory, such as a mounted bucket.
///
/// `scheme://bucket/key` maps to `<root>/<bucket>/<key>`; the scheme is ignored.
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The file an object path resolves to.
    pub fn resolve(&self, path: &ObjectPath) -> Result<PathBuf> {
        let relative = Path::new(path.bucket()).join(path.key());
        if !relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
        {
            return Err(Error::config(format!(
                "destination '{path}' escapes the store root"
            )));
        }
        Ok(self.root.join(relative))
    }
}

impl ObjectStore for LocalObjectStore {
    type Sink = StagedObject;

    fn create(&self, path: &ObjectPath) -> Result<StagedObject> {
        let target = self.resolve(path)?;
        let parent = target
            .parent()
            .ok_or_else(|| Error::config(format!("destination '{path}' has no parent")))?;

        std::fs::create_dir_all(parent).map_err(|e| Error::stream(Stage::Sink, e))?;
        let staging = NamedTempFile::new_in(parent).map_err(|e| Error::stream(Stage::Sink, e))?;

        tracing::debug!(
            object = %target.display(),
            staging = %staging.path().display(),
            "opened staged object"
        );
        Ok(StagedObject { staging, target })
    }
}

/// A sink that writes into a temporary file next to its target and renames it
/// into place on commit.
#[derive(Debug)]
pub struct StagedObject {
    staging: NamedTempFile,
    target: PathBuf,
}

impl StagedObject {
    pub fn target(&self) -> &Path {
        &self.target
    }
}

impl Write for StagedObject {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.staging.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.staging.flush()
    }
}

impl UploadSink for StagedObject {
    fn commit(mut self) -> io::Result<()> {
        self.staging.flush()?;
        self.staging.as_file().sync_all()?;
        self.staging.persist(&self.target).map_err(|e| e.error)?;
        Ok(())
    }

    fn abort(self) {
        tracing::debug!(object = %self.target.display(), "discarding staged object");
    }
}
