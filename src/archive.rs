//! tar.gz packing and unpacking, plus file hashing.
//!
//! All functions are blocking; async callers run them on the blocking pool.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};

/// Pack `dirs` (relative to `base`) into a gzip-compressed tarball at `archive`.
///
/// Entry names keep the directory names as given, so `v3_install/bin/x` stays
/// `v3_install/bin/x` inside the archive. A partially written archive is
/// removed on failure so the next attempt does not mistake it for a finished one.
pub fn pack(archive: &Path, base: &Path, dirs: &[PathBuf]) -> io::Result<()> {
    let result = write_archive(archive, base, dirs);
    if result.is_err() {
        let _ = std::fs::remove_file(archive);
    }
    result
}

fn write_archive(archive: &Path, base: &Path, dirs: &[PathBuf]) -> io::Result<()> {
    let file = File::create(archive)?;
    let encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);

    for dir in dirs {
        let src = base.join(dir);
        if !src.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} is not a directory", src.display()),
            ));
        }
        builder.append_dir_all(dir, &src)?;
    }

    let encoder = builder.into_inner()?;
    let mut writer = encoder.finish()?;
    io::Write::flush(&mut writer)?;
    Ok(())
}

/// Unpack a tar.gz into `dest`, creating it if needed.
///
/// Entries that would escape `dest` are skipped by `tar`.
pub fn unpack(archive: &Path, dest: &Path) -> io::Result<()> {
    std::fs::create_dir_all(dest)?;
    let file = File::open(archive)?;
    let mut tar = tar::Archive::new(GzDecoder::new(file));
    tar.set_preserve_permissions(true);
    tar.unpack(dest)
}

/// Hex SHA-256 of a file.
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}
