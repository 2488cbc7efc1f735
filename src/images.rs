//! Content-addressed image store.
//!
//! Images live under `<root>/<b0>/<b1>/<hex-hash>` where `b0` and `b1` are
//! the first two bytes of the SHA256 hash as two-char uppercase hex. Uploads
//! are staged into the temp folder keyed by their declared hash and moved
//! into place atomically when the surrounding profile update commits.

use crate::crypto::sha256;
use crate::error::{ServerError, ServerResult};
use crate::types::{Hash, MAX_IMAGE_BYTES};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Pluggable image acceptance predicate.
pub type ImageValidator = fn(&[u8]) -> bool;

/// Default predicate: non-empty and within the size cap. Format checks are
/// deliberately out of scope.
pub fn default_validator(data: &[u8]) -> bool {
    !data.is_empty() && data.len() <= MAX_IMAGE_BYTES
}

/// An upload accepted into staging but not yet visible.
#[derive(Debug)]
pub struct StagedImage {
    pub hash: Hash,
    temp_path: PathBuf,
}

#[derive(Clone)]
pub struct ImageStore {
    root: PathBuf,
    temp: PathBuf,
    validator: ImageValidator,
}

impl ImageStore {
    pub fn open(root: &Path, temp: &Path) -> ServerResult<Self> {
        std::fs::create_dir_all(root)?;
        std::fs::create_dir_all(temp)?;
        Ok(Self {
            root: root.to_path_buf(),
            temp: temp.to_path_buf(),
            validator: default_validator,
        })
    }

    pub fn with_validator(mut self, validator: ImageValidator) -> Self {
        self.validator = validator;
        self
    }

    fn final_path(&self, hash: &Hash) -> PathBuf {
        let hex = hex::encode_upper(hash);
        self.root.join(&hex[0..2]).join(&hex[2..4]).join(&hex)
    }

    fn staging_path(&self, hash: &Hash) -> PathBuf {
        self.temp.join(hex::encode_upper(hash))
    }

    /// Verify the declared hash and the acceptance predicate, then write the
    /// bytes to the staging path.
    pub fn stage(&self, declared_hash: &Hash, data: &[u8]) -> ServerResult<StagedImage> {
        if !(self.validator)(data) {
            return Err(ServerError::invalid_value("image rejected"));
        }
        if sha256(data) != *declared_hash {
            return Err(ServerError::invalid_value("image hash mismatch"));
        }

        let temp_path = self.staging_path(declared_hash);
        std::fs::write(&temp_path, data)?;
        Ok(StagedImage { hash: *declared_hash, temp_path })
    }

    /// Move a staged image into its content address.
    pub fn commit(&self, staged: StagedImage) -> ServerResult<()> {
        let target = self.final_path(&staged.hash);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::rename(&staged.temp_path, &target)?;
        debug!("Committed image {}", hex::encode(&staged.hash[..8]));
        Ok(())
    }

    pub fn discard(&self, staged: StagedImage) {
        let _ = std::fs::remove_file(&staged.temp_path);
    }

    pub fn get(&self, hash: &Hash) -> ServerResult<Option<Vec<u8>>> {
        match std::fs::read(self.final_path(hash)) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.final_path(hash).exists()
    }

    pub fn delete(&self, hash: &Hash) -> ServerResult<bool> {
        match std::fs::remove_file(self.final_path(hash)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
