//! Tarball download, integrity verification and extraction.

use super::error::PkgError;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use flate2::read::GzDecoder;
use reqwest::Client;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};
use std::fs::{self, File};
use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tar::Archive;

/// Maximum tarball size (200 MB).
pub const MAX_TARBALL_SIZE: u64 = 200 * 1024 * 1024;

const DOWNLOAD_TIMEOUT_SECS: u64 = 60;

/// Download a tarball.
///
/// # Errors
/// Returns an error if the download fails or exceeds `max_bytes`.
pub async fn download_tarball(client: &Client, url: &str, max_bytes: u64) -> Result<Bytes, PkgError> {
    let too_large = |len: u64| {
        PkgError::download_failed(format!("Tarball too large: {len} bytes (max: {max_bytes})"))
    };

    let response = client
        .get(url)
        .timeout(Duration::from_secs(DOWNLOAD_TIMEOUT_SECS))
        .send()
        .await
        .map_err(|e| PkgError::download_failed(format!("Failed to download '{url}': {e}")))?;

    if !response.status().is_success() {
        return Err(PkgError::download_failed(format!(
            "Download failed with status {} for '{url}'",
            response.status()
        )));
    }

    if let Some(len) = response.content_length().filter(|len| *len > max_bytes) {
        return Err(too_large(len));
    }

    let bytes = response
        .bytes()
        .await
        .map_err(|e| PkgError::download_failed(format!("Failed to read body of '{url}': {e}")))?;

    if bytes.len() as u64 > max_bytes {
        return Err(too_large(bytes.len() as u64));
    }

    Ok(bytes)
}

/// Verify tarball bytes against an npm integrity string.
///
/// Accepts subresource integrity (`sha512-<base64>`, `sha256-...`,
/// `sha1-...`, possibly several separated by spaces) or a legacy hex sha1
/// `shasum`. Unknown algorithms are rejected.
///
/// # Errors
/// Returns `PKG_INTEGRITY_MISMATCH` if no listed digest matches.
pub fn verify_integrity(pkg_id: &str, data: &[u8], integrity: &str) -> Result<(), PkgError> {
    let integrity = integrity.trim();

    if !integrity.contains('-') {
        let actual = hex_sha1(data);
        if actual.eq_ignore_ascii_case(integrity) {
            return Ok(());
        }
        return Err(PkgError::integrity_mismatch(pkg_id, integrity, &actual));
    }

    let mut last_actual = String::new();
    for entry in integrity.split_whitespace() {
        let Some((algo, expected)) = entry.split_once('-') else {
            continue;
        };
        // Options after `?` are ignored
        let expected = expected.split('?').next().unwrap_or_default();
        let digest = match algo {
            "sha512" => Sha512::digest(data).to_vec(),
            "sha256" => Sha256::digest(data).to_vec(),
            "sha1" => Sha1::digest(data).to_vec(),
            _ => continue,
        };
        let actual = BASE64.encode(digest);
        if actual == expected {
            return Ok(());
        }
        last_actual = format!("{algo}-{actual}");
    }

    if last_actual.is_empty() {
        return Err(PkgError::integrity_mismatch(
            pkg_id,
            integrity,
            "no supported algorithm",
        ));
    }
    Err(PkgError::integrity_mismatch(pkg_id, integrity, &last_actual))
}

fn hex_sha1(data: &[u8]) -> String {
    Sha1::digest(data)
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Extract a `.tgz` into `dest` atomically.
///
/// Entries are unpacked into a sibling temp directory whose single
/// top-level directory (`package/` for most packages) is then renamed into
/// place. An existing `dest` is left untouched.
///
/// # Errors
/// Returns an error if the archive is malformed or tries to escape `dest`.
pub fn extract_tgz_atomic(bytes: &[u8], dest: &Path) -> Result<(), PkgError> {
    let parent = dest
        .parent()
        .ok_or_else(|| PkgError::extract_failed("Destination has no parent"))?;
    fs::create_dir_all(parent)?;

    if dest.exists() {
        return Ok(());
    }

    let staging = parent.join(format!(".tmp-{}-{}", std::process::id(), rand_u32()));
    if staging.exists() {
        let _ = fs::remove_dir_all(&staging);
    }
    fs::create_dir_all(&staging)?;

    let result = unpack(bytes, &staging)
        .and_then(|()| single_root(&staging))
        .and_then(|root| move_into_place(&root, dest));

    let _ = fs::remove_dir_all(&staging);
    result
}

fn move_into_place(root: &Path, dest: &Path) -> Result<(), PkgError> {
    match fs::rename(root, dest) {
        Ok(()) => Ok(()),
        // Another extraction won the race
        Err(_) if dest.exists() => Ok(()),
        Err(rename_err) => copy_dir_all(root, dest).map_err(|copy_err| {
            PkgError::extract_failed(format!(
                "Failed to move extracted package: rename={rename_err}, copy={copy_err}"
            ))
        }),
    }
}

/// The one top-level directory of an unpacked archive.
///
/// Usually `package/`; some publishers (e.g. `@types/*`) use the bare name.
fn single_root(staging: &Path) -> Result<PathBuf, PkgError> {
    let package = staging.join("package");
    if package.is_dir() {
        return Ok(package);
    }

    let mut dirs: Vec<PathBuf> = fs::read_dir(staging)
        .map_err(|e| PkgError::extract_failed(format!("Failed to read extracted dir: {e}")))?
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_ok_and(|t| t.is_dir()))
        .filter(|e| !e.file_name().to_string_lossy().starts_with('.'))
        .map(|e| e.path())
        .collect();

    match dirs.len() {
        1 => Ok(dirs.remove(0)),
        0 => Err(PkgError::extract_failed(
            "Tarball does not contain any top-level directory",
        )),
        n => Err(PkgError::extract_failed(format!(
            "Tarball contains {n} top-level directories, expected 1"
        ))),
    }
}

fn unpack(bytes: &[u8], dest: &Path) -> Result<(), PkgError> {
    let read_err = |e: io::Error| PkgError::extract_failed(format!("Failed to read tarball: {e}"));
    let mut archive = Archive::new(GzDecoder::new(bytes));

    for entry in archive.entries().map_err(read_err)? {
        let mut entry = entry.map_err(read_err)?;
        let path = entry.path().map_err(read_err)?.into_owned();

        let escapes = path.is_absolute()
            || path
                .components()
                .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)));
        if escapes {
            return Err(PkgError::extract_failed(format!(
                "Tarball entry escapes destination: {}",
                path.display()
            )));
        }

        let target = dest.join(&path);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }

        let kind = entry.header().entry_type();
        if kind.is_dir() {
            fs::create_dir_all(&target)?;
        } else if kind.is_file() {
            let mut file = File::create(&target)?;
            io::copy(&mut entry, &mut file)?;

            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                if let Ok(mode) = entry.header().mode() {
                    let _ = fs::set_permissions(&target, fs::Permissions::from_mode(mode | 0o600));
                }
            }
        }
        // Links and special entries are skipped
    }

    Ok(())
}

/// Recursively copy a directory, skipping symlinks.
pub(crate) fn copy_dir_all(src: &Path, dst: &Path) -> io::Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let ty = entry.file_type()?;
        let to = dst.join(entry.file_name());
        if ty.is_dir() {
            copy_dir_all(&entry.path(), &to)?;
        } else if ty.is_file() {
            fs::copy(entry.path(), &to)?;
        }
    }
    Ok(())
}

#[allow(clippy::cast_possible_truncation)]
fn rand_u32() -> u32 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    let mut hasher = RandomState::new().build_hasher();
    hasher.write_u64(
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0),
    );
    hasher.finish() as u32
}
