//! Local filesystem capability used by the indexer and the action applier.

use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use peersync_chunk::{file_checksum_reader, FileChecksum};
use peersync_meta::{FileType, FileVersion, Timestamp};
use uuid::Uuid;

/// Prefix of files being written before their atomic rename
pub const TEMP_FILE_PREFIX: &str = ".peersync-tmp-";

/// What is on disk at a path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskEntry {
    /// Entry kind
    pub file_type: FileType,
    /// Size in bytes (0 for folders)
    pub size: u64,
    /// Modification time
    pub modified: Timestamp,
    /// POSIX permission bits, where the platform has them
    pub permissions: Option<u32>,
    /// Symlink target
    pub link_target: Option<String>,
}

/// Path-addressed operations on the synced folder.
pub trait LocalFileSystem: Send + Sync {
    /// Entry at `path` without following symlinks; `None` if absent
    fn stat(&self, path: &Path) -> io::Result<Option<DiskEntry>>;

    /// Checksum of a regular file
    fn checksum(&self, path: &Path) -> io::Result<FileChecksum>;

    /// Open a regular file for reading
    fn open(&self, path: &Path) -> io::Result<Box<dyn Read + Send>>;

    /// Create a folder and its parents
    fn create_dir_all(&self, path: &Path) -> io::Result<()>;

    /// Replace `path` with the bytes of `source` through a temp file and rename
    fn write_file(&self, path: &Path, source: &mut dyn Read) -> io::Result<u64>;

    /// Move an entry
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;

    /// Remove a file or symlink
    fn remove_file(&self, path: &Path) -> io::Result<()>;

    /// Remove an empty folder
    fn remove_dir(&self, path: &Path) -> io::Result<()>;

    /// Create a symlink at `link` pointing to `target`
    fn symlink(&self, target: &str, link: &Path) -> io::Result<()>;

    /// Set POSIX permission bits
    fn set_permissions(&self, path: &Path, mode: u32) -> io::Result<()>;

    /// Set the modification time of a regular file
    fn set_modified(&self, path: &Path, time: SystemTime) -> io::Result<()>;
}

/// [`LocalFileSystem`] over `std::fs`
#[derive(Debug, Clone, Copy, Default)]
pub struct StdFileSystem;

#[cfg(unix)]
fn mode_of(meta: &fs::Metadata) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;
    Some(meta.permissions().mode() & 0o7777)
}

#[cfg(not(unix))]
fn mode_of(_meta: &fs::Metadata) -> Option<u32> {
    None
}

fn temp_sibling(path: &Path) -> PathBuf {
    let name = format!("{}{}", TEMP_FILE_PREFIX, Uuid::new_v4().simple());
    match path.parent() {
        Some(parent) => parent.join(name),
        None => PathBuf::from(name),
    }
}

impl LocalFileSystem for StdFileSystem {
    fn stat(&self, path: &Path) -> io::Result<Option<DiskEntry>> {
        let meta = match fs::symlink_metadata(path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        let modified = meta
            .modified()
            .map(Timestamp::from_system_time)
            .unwrap_or_default();
        let entry = if meta.file_type().is_symlink() {
            DiskEntry {
                file_type: FileType::Symlink,
                size: 0,
                modified,
                permissions: None,
                link_target: Some(fs::read_link(path)?.to_string_lossy().into_owned()),
            }
        } else if meta.is_dir() {
            DiskEntry {
                file_type: FileType::Folder,
                size: 0,
                modified,
                permissions: mode_of(&meta),
                link_target: None,
            }
        } else {
            DiskEntry {
                file_type: FileType::File,
                size: meta.len(),
                modified,
                permissions: mode_of(&meta),
                link_target: None,
            }
        };
        Ok(Some(entry))
    }

    fn checksum(&self, path: &Path) -> io::Result<FileChecksum> {
        let file = fs::File::open(path)?;
        file_checksum_reader(io::BufReader::new(file)).map_err(|e| io::Error::other(e.to_string()))
    }

    fn open(&self, path: &Path) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(io::BufReader::new(fs::File::open(path)?)))
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        fs::create_dir_all(path)
    }

    fn write_file(&self, path: &Path, source: &mut dyn Read) -> io::Result<u64> {
        let tmp = temp_sibling(path);
        let written = (|| -> io::Result<u64> {
            let mut file = fs::File::create(&tmp)?;
            let n = io::copy(source, &mut file)?;
            file.flush()?;
            file.sync_all()?;
            fs::rename(&tmp, path)?;
            Ok(n)
        })();
        if written.is_err() {
            let _ = fs::remove_file(&tmp);
        }
        written
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::rename(from, to)
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(path)
    }

    fn remove_dir(&self, path: &Path) -> io::Result<()> {
        fs::remove_dir(path)
    }

    #[cfg(unix)]
    fn symlink(&self, target: &str, link: &Path) -> io::Result<()> {
        std::os::unix::fs::symlink(target, link)
    }

    #[cfg(not(unix))]
    fn symlink(&self, _target: &str, _link: &Path) -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "symlinks are not supported here"))
    }

    #[cfg(unix)]
    fn set_permissions(&self, path: &Path, mode: u32) -> io::Result<()> {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(mode))
    }

    #[cfg(not(unix))]
    fn set_permissions(&self, _path: &Path, _mode: u32) -> io::Result<()> {
        Ok(())
    }

    fn set_modified(&self, path: &Path, time: SystemTime) -> io::Result<()> {
        fs::File::options().write(true).open(path)?.set_modified(time)
    }
}

/// True if the disk entry has the type and content recorded in `version`.
///
/// Regular files compare size and modification time first and fall back to
/// the content checksum when the times differ.
pub fn disk_matches(
    fs: &dyn LocalFileSystem,
    path: &Path,
    entry: &DiskEntry,
    version: &FileVersion,
) -> io::Result<bool> {
    if entry.file_type != version.file_type {
        return Ok(false);
    }
    match version.file_type {
        FileType::Folder => Ok(true),
        FileType::Symlink => Ok(entry.link_target == version.link_target),
        FileType::File => {
            if entry.size != version.size {
                return Ok(false);
            }
            if entry.modified.as_millis() == version.last_modified.as_millis() {
                return Ok(true);
            }
            Ok(version.checksum == Some(fs.checksum(path)?))
        }
    }
}

/// Convert a stored timestamp for `set_modified`
pub fn to_system_time(ts: Timestamp) -> SystemTime {
    SystemTime::UNIX_EPOCH + std::time::Duration::new(ts.secs, ts.nanos)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stat_reports_kinds() {
        let dir = tempfile::tempdir().unwrap();
        let fs = StdFileSystem;
        assert!(fs.stat(&dir.path().join("missing")).unwrap().is_none());

        fs.create_dir_all(&dir.path().join("a/b")).unwrap();
        let folder = fs.stat(&dir.path().join("a/b")).unwrap().unwrap();
        assert_eq!(folder.file_type, FileType::Folder);

        let written = fs
            .write_file(&dir.path().join("a/f.txt"), &mut &b"hello"[..])
            .unwrap();
        assert_eq!(written, 5);
        let file = fs.stat(&dir.path().join("a/f.txt")).unwrap().unwrap();
        assert_eq!(file.file_type, FileType::File);
        assert_eq!(file.size, 5);
        assert_eq!(
            fs.checksum(&dir.path().join("a/f.txt")).unwrap(),
            peersync_chunk::file_checksum(b"hello")
        );
    }

    #[test]
    fn write_file_replaces_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let fs = StdFileSystem;
        let path = dir.path().join("f");
        fs.write_file(&path, &mut &b"one"[..]).unwrap();
        fs.write_file(&path, &mut &b"two!"[..]).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"two!");
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(TEMP_FILE_PREFIX))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_and_permissions() {
        let dir = tempfile::tempdir().unwrap();
        let fs = StdFileSystem;
        let link = dir.path().join("link");
        fs.symlink("target/elsewhere", &link).unwrap();
        let entry = fs.stat(&link).unwrap().unwrap();
        assert_eq!(entry.file_type, FileType::Symlink);
        assert_eq!(entry.link_target.as_deref(), Some("target/elsewhere"));

        let file = dir.path().join("f");
        fs.write_file(&file, &mut &b"x"[..]).unwrap();
        fs.set_permissions(&file, 0o600).unwrap();
        assert_eq!(fs.stat(&file).unwrap().unwrap().permissions, Some(0o600));
    }

    #[test]
    fn set_modified_is_visible_to_stat() {
        let dir = tempfile::tempdir().unwrap();
        let fs = StdFileSystem;
        let file = dir.path().join("f");
        fs.write_file(&file, &mut &b"x"[..]).unwrap();
        let ts = Timestamp::from_millis(1_600_000_000_123);
        fs.set_modified(&file, to_system_time(ts)).unwrap();
        assert_eq!(fs.stat(&file).unwrap().unwrap().modified.as_millis(), ts.as_millis());
    }
}
