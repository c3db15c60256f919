// Identity record on disk
//
// One file, written once. If it is there we use it, whatever state it is in:
// a record we cannot read is an error, never a reason to mint a new peer ID.

use super::{IdentityError, PeerIdentity, ResolvedIdentity};
use std::fs;
use std::io::{self, Write};
use std::path::Path;
use zeroize::Zeroizing;

/// Load the identity stored at `path`, or create and persist a new one if
/// nothing exists there yet.
pub fn resolve_identity(path: impl AsRef<Path>) -> Result<ResolvedIdentity, IdentityError> {
    let path = path.as_ref();

    match read_record(path)? {
        Some(bytes) => {
            let identity =
                PeerIdentity::from_record(&bytes).map_err(|e| IdentityError::Corrupt {
                    path: path.to_path_buf(),
                    reason: e.to_string(),
                })?;
            tracing::info!(peer_id = %identity.peer_id(), path = %path.display(), "🔑 Loaded existing identity");
            Ok(ResolvedIdentity::Loaded(identity))
        }
        None => {
            let identity = PeerIdentity::generate();
            write_record(path, &identity)?;
            tracing::info!(peer_id = %identity.peer_id(), path = %path.display(), "🔑 Generated new identity");
            Ok(ResolvedIdentity::Created(identity))
        }
    }
}

/// `Ok(None)` only when the file does not exist.
fn read_record(path: &Path) -> Result<Option<Zeroizing<Vec<u8>>>, IdentityError> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(Zeroizing::new(bytes))),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(IdentityError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn write_record(path: &Path, identity: &PeerIdentity) -> Result<(), IdentityError> {
    let record = identity.to_record().map_err(|e| IdentityError::Encode(e.to_string()))?;
    publish_record(path, |file| file.write_all(&record))
}

/// Write a record next to `path` and move it into place only once it is
/// complete and synced. A failed write leaves nothing at `path`; an existing
/// file at `path` is never replaced.
fn publish_record<W>(path: &Path, write: W) -> Result<(), IdentityError>
where
    W: FnOnce(&mut fs::File) -> io::Result<()>,
{
    let io_err = |source: io::Error| IdentityError::Io {
        path: path.to_path_buf(),
        source,
    };

    let parent = match path.parent().filter(|p| !p.as_os_str().is_empty()) {
        Some(parent) => {
            fs::create_dir_all(parent).map_err(io_err)?;
            parent
        }
        None => Path::new("."),
    };

    // created 0600 on unix, removed on drop unless persisted
    let mut tmp = tempfile::Builder::new()
        .prefix(".identity-")
        .suffix(".tmp")
        .tempfile_in(parent)
        .map_err(io_err)?;
    write(tmp.as_file_mut()).map_err(io_err)?;
    tmp.as_file().sync_all().map_err(io_err)?;

    tmp.persist_noclobber(path).map_err(|e| io_err(e.error))?;
    Ok(())
}
