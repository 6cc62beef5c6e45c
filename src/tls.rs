use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::files::write_atomically;
use crate::types::TlsBinding;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to create TLS directory {}: {source}", .path.display())]
    CreateDirectoryFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to write {}: {source}", .path.display())]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Content-addressed store for certificate and key files.
///
/// Files are named after a digest of the sorted host list, the certificate and
/// the key. A file that already exists is never written again, so the
/// filesystem itself tells which material has been materialized.
#[derive(Clone, Debug)]
pub struct MaterialCache {
    dir: PathBuf,
}

impl MaterialCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        MaterialCache { dir: dir.into() }
    }

    pub fn materialize(
        &self,
        hosts: &[String],
        certificate: &[u8],
        key: &[u8],
    ) -> Result<TlsBinding, Error> {
        let mut hosts = hosts.to_vec();
        hosts.sort();
        let digest = fingerprint(&hosts, certificate, key);

        fs::create_dir_all(&self.dir).map_err(|source| Error::CreateDirectoryFailed {
            path: self.dir.clone(),
            source,
        })?;

        let cert_path = self.dir.join(format!("cert-{}.pem", digest));
        let key_path = self.dir.join(format!("key-{}.pem", digest));
        write_once(&cert_path, certificate, 0o644)?;
        write_once(&key_path, key, 0o600)?;

        Ok(TlsBinding {
            hosts,
            cert_path,
            key_path,
        })
    }
}

/// Hex SHA-256 over `sorted_hosts`, then the certificate, then the key.
pub fn fingerprint(sorted_hosts: &[String], certificate: &[u8], key: &[u8]) -> String {
    let mut hasher = Sha256::new();
    for host in sorted_hosts {
        hasher.update(host.as_bytes());
        hasher.update(b"\n");
    }
    hasher.update(certificate);
    hasher.update(key);
    hex::encode(hasher.finalize())
}

fn write_once(path: &Path, contents: &[u8], mode: u32) -> Result<(), Error> {
    if path.exists() {
        return Ok(());
    }
    tracing::debug!(path = %path.display(), "writing TLS material");
    write_atomically(path, contents, mode).map_err(|source| Error::WriteFailed {
        path: path.to_path_buf(),
        source,
    })
}
