use std::fs::File;
use std::io::{self, ErrorKind, Read};
use std::path::Path;

use md5::{Digest, Md5};
use tracing::{debug, warn};

use crate::domain::Md5Hex;
use crate::error::IngestError;
use crate::object_store::ObjectStore;

pub const CHUNK_SIZE: usize = 10 * 1024 * 1024;

pub const REMOTE_VERIFY_ATTEMPTS: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Md5Digest {
    pub md5: Md5Hex,
    pub length: u64,
}

pub fn md5_reader<R: Read + ?Sized>(reader: &mut R) -> io::Result<Md5Digest> {
    let mut hasher = Md5::new();
    let mut buffer = vec![0u8; CHUNK_SIZE];
    let mut length = 0u64;
    loop {
        let read = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(read) => read,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        };
        hasher.update(&buffer[..read]);
        length += read as u64;
    }
    Ok(Md5Digest {
        md5: Md5Hex::from_digest(&hasher.finalize()),
        length,
    })
}

pub fn md5_local(path: &Path) -> Result<Md5Digest, IngestError> {
    let mut file = File::open(path)
        .map_err(|err| IngestError::Filesystem(format!("open {}: {err}", path.display())))?;
    md5_reader(&mut file)
        .map_err(|err| IngestError::Filesystem(format!("read {}: {err}", path.display())))
}

pub fn md5_remote(
    store: &dyn ObjectStore,
    bucket: &str,
    key: &str,
) -> Result<Md5Digest, IngestError> {
    let mut reader = store.open(bucket, key)?;
    md5_reader(&mut reader).map_err(|err| IngestError::ObjectStore(format!("read {key}: {err}")))
}

// Short streams are retried; only a persistent short read or a digest
// mismatch is an `InvalidChecksum`.
pub fn verify_remote(
    store: &dyn ObjectStore,
    bucket: &str,
    key: &str,
    expected_md5: &str,
    expected_size: u64,
) -> Result<Md5Digest, IngestError> {
    let invalid = |message: String| IngestError::InvalidChecksum {
        key: key.to_string(),
        message,
    };

    let Some(info) = store.head(bucket, key)? else {
        return Err(invalid("object does not exist".to_string()));
    };
    if info.size != expected_size {
        return Err(invalid(format!(
            "object is {} bytes, expected {expected_size}",
            info.size
        )));
    }

    let mut digest = None;
    for attempt in 1..=REMOTE_VERIFY_ATTEMPTS {
        match md5_remote(store, bucket, key) {
            Ok(read) if read.length == info.size => {
                digest = Some(read);
                break;
            }
            Ok(read) => {
                warn!(key, attempt, streamed = read.length, declared = info.size, "short read");
            }
            Err(IngestError::ObjectStore(message)) => {
                warn!(key, attempt, error = %message, "stream failed");
            }
            Err(err) => return Err(err),
        }
    }
    let Some(digest) = digest else {
        return Err(invalid(format!(
            "stream truncated on {REMOTE_VERIFY_ATTEMPTS} attempts"
        )));
    };

    let matches = expected_md5
        .parse::<Md5Hex>()
        .map(|expected| expected == digest.md5)
        .unwrap_or(false);
    if !matches {
        return Err(invalid(format!(
            "computed {}, declared {expected_md5}",
            digest.md5
        )));
    }
    debug!(key, md5 = %digest.md5, "remote checksum verified");
    Ok(digest)
}
