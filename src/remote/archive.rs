use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use log::{debug, info};
use walkdir::WalkDir;

/// Name of the archive a folder is shipped in
pub fn archive_name(dir: &Path) -> io::Result<String> {
    Ok(format!("{}.tar", folder_name(dir)?))
}

pub fn folder_name(dir: &Path) -> io::Result<String> {
    dir.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} has no folder name", dir.display()),
            )
        })
}

/// Write `dir` into a tar archive inside `out_dir`, the archive holds a single top level folder
pub fn pack(dir: &Path, out_dir: &Path) -> io::Result<PathBuf> {
    let name = folder_name(dir)?;
    let archive_path = out_dir.join(archive_name(dir)?);
    info!("Compressing {} into {}", dir.display(), archive_path.display());

    let file = File::create(&archive_path)?;
    let mut builder = tar::Builder::new(file);
    builder.follow_symlinks(false);
    builder.append_dir_all(&name, dir)?;
    builder.into_inner()?;

    debug!(
        "Archive {} is {} bytes",
        archive_path.display(),
        fs::metadata(&archive_path)?.len()
    );
    Ok(archive_path)
}

/// Unpack a tar stream holding the folder `source_name` and merge its content into `dest`
///
/// Files are extracted next to `dest` first and moved in once the whole stream was read, so a
/// broken transfer never leaves a half written tree behind. Existing files in `dest` that are not
/// part of the archive are kept.
pub fn unpack_merge<R: Read>(stream: R, source_name: &str, dest: &Path) -> io::Result<()> {
    let parent = match dest.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)?;
    let staging = tempfile::Builder::new()
        .prefix(".slurmferry-download")
        .tempdir_in(&parent)?;

    tar::Archive::new(stream).unpack(staging.path())?;

    let staged_root = staging.path().join(source_name);
    if !staged_root.exists() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("archive does not contain {source_name}"),
        ));
    }

    for entry in WalkDir::new(&staged_root) {
        let entry = entry?;
        let relative = entry
            .path()
            .strip_prefix(&staged_root)
            .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;
        let target = dest.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            fs::rename(entry.path(), &target)?;
        }
    }
    debug!("Merged {} into {}", source_name, dest.display());
    Ok(())
}
