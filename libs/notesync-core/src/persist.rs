//! Crash-safe file replacement.

use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Replace `path` with `contents`.
///
/// The new text goes to `<path>.tmp`, the old file is rotated to
/// `<path>.bak`, the temp file is renamed into place and read back. The
/// backup is only deleted once the read-back matches, so a failure at any
/// step leaves either the original or the backup on disk.
pub fn write_safe(path: &Path, contents: &str) -> io::Result<()> {
    let tmp = sibling(path, "tmp");
    let bak = sibling(path, "bak");

    fs::write(&tmp, contents)?;

    let had_original = path.exists();
    if had_original {
        fs::rename(path, &bak)?;
    }
    fs::rename(&tmp, path)?;

    let written = fs::read_to_string(path)?;
    if written != contents {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "{} did not read back as written; previous contents kept in {}",
                path.display(),
                bak.display()
            ),
        ));
    }

    if had_original {
        fs::remove_file(&bak)?;
    }
    Ok(())
}

fn sibling(path: &Path, extension: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".");
    name.push(extension);
    PathBuf::from(name)
}
