use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use rand::rngs::OsRng;
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::error::{PipelineError, PipelineResult};

/// Write `value` as pretty JSON through a temp file in the same directory,
/// fsync it and rename it over `path`.
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> PipelineResult<()> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|err| PipelineError::json(path, err))?;
    write_atomic(path, &bytes)
}

pub fn write_atomic(path: &Path, bytes: &[u8]) -> PipelineResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|err| PipelineError::io(parent, err))?;
    }
    let tmp_id = OsRng.next_u64();
    let tmp = path.with_extension(format!("tmp-{tmp_id:x}"));
    let result = (|| {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();
    if let Err(err) = result {
        let _ = fs::remove_file(&tmp);
        return Err(PipelineError::io(path, err));
    }
    sync_parent(path)?;
    debug!(path = %path.display(), bytes = bytes.len(), "wrote file");
    Ok(())
}

/// Flush the directory entry of `path` so a completed rename survives a crash.
#[cfg(unix)]
fn sync_parent(path: &Path) -> PipelineResult<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    File::open(parent)
        .and_then(|dir| dir.sync_all())
        .map_err(|err| PipelineError::io(parent, err))
}

#[cfg(not(unix))]
fn sync_parent(_path: &Path) -> PipelineResult<()> {
    Ok(())
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> PipelineResult<T> {
    let bytes = fs::read(path).map_err(|err| {
        if err.kind() == std::io::ErrorKind::NotFound {
            PipelineError::NotFound(path.display().to_string())
        } else {
            PipelineError::io(path, err)
        }
    })?;
    serde_json::from_slice(&bytes).map_err(|err| PipelineError::json(path, err))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_write_replaces_and_leaves_no_temp_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("value.json");
        write_json_atomic(&path, &vec![1, 2, 3]).expect("first write");
        write_json_atomic(&path, &vec![4]).expect("second write");
        let value: Vec<u32> = read_json(&path).expect("read");
        assert_eq!(value, vec![4]);
        let entries = fs::read_dir(dir.path()).expect("read_dir").count();
        assert_eq!(entries, 1);
    }

    #[test]
    fn atomic_write_into_fresh_directory_syncs_and_lands() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("run_x").join("slice_0").join("proof.json");
        write_atomic(&path, b"{}").expect("write");
        assert_eq!(fs::read(&path).expect("read"), b"{}");
        sync_parent(&path).expect("parent directory syncs");
        let entries = fs::read_dir(path.parent().expect("parent"))
            .expect("read_dir")
            .count();
        assert_eq!(entries, 1);
    }

    #[test]
    fn failed_rename_surfaces_io_and_removes_the_temp_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("occupied");
        fs::create_dir_all(path.join("child")).expect("directory in the way");
        let err = write_atomic(&path, b"[]").expect_err("rename over a non-empty directory");
        assert!(matches!(err, PipelineError::Io { .. }));
        assert_eq!(fs::read_dir(dir.path()).expect("read_dir").count(), 1);
    }

    #[test]
    fn missing_file_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = read_json::<Vec<u32>>(&dir.path().join("absent.json")).expect_err("missing");
        assert!(matches!(err, PipelineError::NotFound(_)));
    }
}
