//! Stable server identity persisted in the data directory.

use crate::error::{ClusterError, ClusterResult};
use crate::persist::write_bytes_atomic;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

/// Name of the identity file inside the data directory.
pub const ID_FILE: &str = "id";

/// Establish the server id for `data_dir`.
///
/// An existing id file wins, and a `supplied` id that disagrees with it is an
/// [`ClusterError::Identity`]. Without a file the supplied id, or a fresh
/// UUID, is written once and returned.
pub fn initialize_id(data_dir: &Path, supplied: Option<&str>) -> ClusterResult<String> {
    let path = data_dir.join(ID_FILE);

    match fs::read_to_string(&path) {
        Ok(contents) => {
            let persisted = contents.trim().to_string();
            if persisted.is_empty() {
                return Err(ClusterError::Config(format!(
                    "identity file {} is empty",
                    path.display()
                )));
            }
            if let Some(supplied) = supplied {
                if supplied != persisted {
                    return Err(ClusterError::Identity {
                        persisted,
                        supplied: supplied.to_string(),
                    });
                }
            }
            tracing::debug!(server_id = %persisted, "loaded server id");
            Ok(persisted)
        }
        Err(e) if e.kind() == ErrorKind::NotFound => {
            let id = supplied
                .map(str::to_string)
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            write_bytes_atomic(&path, id.as_bytes())?;
            restrict_permissions(&path)?;
            tracing::info!(server_id = %id, "created server id");
            Ok(id)
        }
        Err(e) => Err(e.into()),
    }
}

/// Create the data directory, readable only by the owner.
pub fn prepare_data_dir(data_dir: &Path) -> ClusterResult<()> {
    fs::create_dir_all(data_dir)?;
    set_mode(data_dir, 0o700)
}

fn restrict_permissions(path: &Path) -> ClusterResult<()> {
    set_mode(path, 0o600)
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> ClusterResult<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> ClusterResult<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_generated_id_is_stable() {
        let dir = TempDir::new().expect("tempdir");
        let first = initialize_id(dir.path(), None).expect("first");
        let second = initialize_id(dir.path(), None).expect("second");
        assert_eq!(first, second);
        assert!(uuid::Uuid::parse_str(&first).is_ok());
    }

    #[test]
    fn test_supplied_id_is_persisted() {
        let dir = TempDir::new().expect("tempdir");
        assert_eq!(initialize_id(dir.path(), Some("ctrl-1")).expect("init"), "ctrl-1");
        assert_eq!(initialize_id(dir.path(), None).expect("reload"), "ctrl-1");
        assert_eq!(
            initialize_id(dir.path(), Some("ctrl-1")).expect("matching"),
            "ctrl-1"
        );
        assert_eq!(
            fs::read_to_string(dir.path().join(ID_FILE)).expect("read"),
            "ctrl-1"
        );
    }

    #[test]
    fn test_mismatched_id_is_rejected() {
        let dir = TempDir::new().expect("tempdir");
        initialize_id(dir.path(), Some("ctrl-1")).expect("init");
        let err = initialize_id(dir.path(), Some("ctrl-2")).expect_err("mismatch");
        assert!(matches!(
            err,
            ClusterError::Identity { ref persisted, ref supplied }
                if persisted == "ctrl-1" && supplied == "ctrl-2"
        ));
    }

    #[test]
    fn test_trailing_newline_is_ignored() {
        let dir = TempDir::new().expect("tempdir");
        fs::write(dir.path().join(ID_FILE), "ctrl-9\n").expect("write");
        assert_eq!(
            initialize_id(dir.path(), Some("ctrl-9")).expect("match"),
            "ctrl-9"
        );
    }

    #[test]
    fn test_prepare_creates_nested_dir() {
        let dir = TempDir::new().expect("tempdir");
        let nested = dir.path().join("a").join("b");
        prepare_data_dir(&nested).expect("prepare");
        assert!(nested.is_dir());
        prepare_data_dir(&nested).expect("idempotent");
    }

    #[cfg(unix)]
    #[test]
    fn test_id_file_is_private() {
        use std::os::unix::fs::PermissionsExt;
        let dir = TempDir::new().expect("tempdir");
        initialize_id(dir.path(), None).expect("init");
        let mode = fs::metadata(dir.path().join(ID_FILE))
            .expect("metadata")
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
