//! Certificate and account storage for ACME
//!
//! Provides persistent storage for ACME account credentials and issued certificates.
//!
//! # Directory Structure
//!
//! ```text
//! storage/
//! ├── account.json          # ACME account credentials (opaque, serialized)
//! └── domains/
//!     └── example.com.json  # Chain, key and validity of one certificate
//! ```
//!
//! Every file is replaced with write-to-temp, fsync, rename. A reader sees
//! either the previous file or the new one, never a mix, and a crash leaves
//! at most an orphaned temp file that reads and listings skip. Several
//! processes may share one directory; the last rename wins.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, trace, warn};

use super::error::StorageError;
use super::record::CertificateRecord;

const RECORD_EXTENSION: &str = "json";
const TEMP_PREFIX: &str = ".tmp-";

/// Certificate storage manager
///
/// Handles persistent storage of ACME account credentials and certificates.
/// Uses a simple filesystem-based storage with restrictive permissions.
#[derive(Debug)]
pub struct CertificateStorage {
    /// Base storage directory
    base_path: PathBuf,
}

impl CertificateStorage {
    /// Create a new certificate storage at the given path
    ///
    /// Creates the directory structure if it doesn't exist and sets
    /// restrictive permissions (0700 on Unix).
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or permissions
    /// cannot be set.
    pub fn new(base_path: &Path) -> Result<Self, StorageError> {
        fs::create_dir_all(base_path)?;

        let domains_path = base_path.join("domains");
        fs::create_dir_all(&domains_path)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o700);
            fs::set_permissions(base_path, perms.clone())?;
            fs::set_permissions(&domains_path, perms)?;
        }

        info!(
            storage_path = %base_path.display(),
            "Initialized ACME certificate storage"
        );

        Ok(Self {
            base_path: base_path.to_path_buf(),
        })
    }

    /// Get the storage base path
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Run `op` against this store on the blocking thread pool
    ///
    /// Reads and writes are plain `std::fs` calls with fsync, so callers on
    /// async tasks go through here.
    pub async fn run_blocking<T, F>(self: &Arc<Self>, op: F) -> Result<T, StorageError>
    where
        F: FnOnce(&CertificateStorage) -> Result<T, StorageError> + Send + 'static,
        T: Send + 'static,
    {
        let storage = Arc::clone(self);
        tokio::task::spawn_blocking(move || op(&storage))
            .await
            .map_err(|e| StorageError::Io(std::io::Error::other(e)))?
    }

    // =========================================================================
    // Account Operations
    // =========================================================================

    /// Load raw credentials JSON (for instant_acme::AccountCredentials)
    pub fn load_credentials_json(&self) -> Result<Option<String>, StorageError> {
        let creds_path = self.base_path.join("account.json");

        match fs::read_to_string(&creds_path) {
            Ok(content) => {
                debug!("Loaded ACME credentials JSON");
                Ok(Some(content))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                trace!("No stored ACME credentials found");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Save raw credentials JSON (for instant_acme::AccountCredentials)
    pub fn save_credentials_json(&self, json: &str) -> Result<(), StorageError> {
        let creds_path = self.base_path.join("account.json");
        write_atomic(&creds_path, json.as_bytes())?;
        info!("Saved ACME credentials JSON");
        Ok(())
    }

    // =========================================================================
    // Certificate Operations
    // =========================================================================

    /// Path of a domain's record file
    fn record_path(&self, domain: &str) -> Result<PathBuf, StorageError> {
        if domain.is_empty()
            || domain.starts_with('.')
            || domain.contains(['/', '\\'])
            || domain.contains("..")
        {
            return Err(StorageError::InvalidName(domain.to_string()));
        }
        Ok(self
            .base_path
            .join("domains")
            .join(format!("{}.{}", domain, RECORD_EXTENSION)))
    }

    /// Load the most recently stored record for a domain
    ///
    /// Returns `Ok(None)` if no record was ever stored.
    pub fn get(&self, domain: &str) -> Result<Option<CertificateRecord>, StorageError> {
        let path = self.record_path(domain)?;

        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                trace!(domain = %domain, "No stored certificate found");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        let record: CertificateRecord = serde_json::from_str(&content)?;

        debug!(
            domain = %domain,
            expires = %record.not_after,
            "Loaded stored certificate"
        );
        Ok(Some(record))
    }

    /// Store a record for a domain, replacing any previous one atomically
    pub fn put(&self, domain: &str, record: &CertificateRecord) -> Result<(), StorageError> {
        let path = self.record_path(domain)?;
        let content = serde_json::to_vec_pretty(record)?;
        write_atomic(&path, &content)?;

        info!(
            domain = %domain,
            expires = %record.not_after,
            "Saved certificate to storage"
        );
        Ok(())
    }

    /// List all stored domains
    pub fn list_domains(&self) -> Result<Vec<String>, StorageError> {
        let domains_path = self.base_path.join("domains");

        if !domains_path.exists() {
            return Ok(Vec::new());
        }

        let mut domains = Vec::new();
        for entry in fs::read_dir(&domains_path)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            if name.starts_with(TEMP_PREFIX) {
                trace!(file = %name, "Skipping leftover temp file");
                continue;
            }
            if let Some(domain) = name.strip_suffix(&format!(".{}", RECORD_EXTENSION)) {
                domains.push(domain.to_string());
            }
        }

        Ok(domains)
    }
}

/// Replace `path` with `contents` without ever exposing a partial file
fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), StorageError> {
    let dir = path
        .parent()
        .ok_or_else(|| StorageError::InvalidName(path.display().to_string()))?;

    let mut temp = tempfile::Builder::new()
        .prefix(TEMP_PREFIX)
        .suffix(".partial")
        .tempfile_in(dir)?;
    temp.write_all(contents)?;
    temp.as_file().sync_all()?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(temp.path(), fs::Permissions::from_mode(0o600))?;
    }

    temp.persist(path).map_err(|e| StorageError::Io(e.error))?;

    // Make the rename itself durable
    #[cfg(unix)]
    if let Err(e) = fs::File::open(dir).and_then(|d| d.sync_all()) {
        warn!(dir = %dir.display(), error = %e, "Failed to sync storage directory");
    }

    Ok(())
}
