// src/packages/arch.rs

//! Arch Linux package archive loader
//!
//! Reads package metadata from the `.PKGINFO` entry of .pkg.tar.zst,
//! .pkg.tar.xz and .pkg.tar.gz archives.

use crate::engine::{EngineError, Package, PackageOrigin};
use flate2::read::GzDecoder;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use tar::Archive;
use tracing::debug;
use xz2::read::XzDecoder;

/// Package compression format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompressionFormat {
    Zstd,
    Xz,
    Gzip,
}

/// Parsed .PKGINFO metadata
#[derive(Default)]
struct PkgInfo {
    name: Option<String>,
    version: Option<String>,
    description: Option<String>,
    architecture: Option<String>,
    size: Option<u64>,
    groups: Vec<String>,
    dependencies: Vec<String>,
    conflicts: Vec<String>,
}

fn archive_error(path: &Path, reason: impl Into<String>) -> EngineError {
    EngineError::Archive {
        path: path.display().to_string(),
        reason: reason.into(),
    }
}

/// Detect compression format from file extension
fn detect_compression(path: &Path) -> Result<CompressionFormat, EngineError> {
    let name = path.to_string_lossy();
    if name.ends_with(".pkg.tar.zst") {
        Ok(CompressionFormat::Zstd)
    } else if name.ends_with(".pkg.tar.xz") {
        Ok(CompressionFormat::Xz)
    } else if name.ends_with(".pkg.tar.gz") {
        Ok(CompressionFormat::Gzip)
    } else {
        Err(archive_error(
            path,
            "unsupported format, expected .pkg.tar.zst, .pkg.tar.xz, or .pkg.tar.gz",
        ))
    }
}

/// Open and decompress the package archive
fn open_archive(path: &Path) -> Result<Archive<Box<dyn Read>>, EngineError> {
    let compression = detect_compression(path)?;

    let file = File::open(path)
        .map_err(|e| archive_error(path, format!("failed to open package file: {}", e)))?;

    let reader: Box<dyn Read> = match compression {
        CompressionFormat::Zstd => {
            let decoder = zstd::Decoder::new(file)
                .map_err(|e| archive_error(path, format!("failed to create zstd decoder: {}", e)))?;
            Box::new(decoder)
        }
        CompressionFormat::Xz => Box::new(XzDecoder::new(file)),
        CompressionFormat::Gzip => Box::new(GzDecoder::new(file)),
    };

    Ok(Archive::new(reader))
}

/// Parse .PKGINFO file content
fn parse_pkginfo(content: &str) -> PkgInfo {
    let mut info = PkgInfo::default();

    for line in content.lines() {
        let line = line.trim();

        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if let Some((key, value)) = line.split_once('=') {
            let value = value.trim().to_string();
            match key.trim() {
                "pkgname" => info.name = Some(value),
                "pkgver" => info.version = Some(value),
                "pkgdesc" => info.description = Some(value),
                "arch" => info.architecture = Some(value),
                "size" => info.size = value.parse().ok(),
                "group" => info.groups.push(value),
                "depend" => info.dependencies.push(value),
                "conflict" => info.conflicts.push(value),
                _ => {}
            }
        }
    }

    info
}

/// Read the `.PKGINFO` entry out of a package archive
fn read_pkginfo(path: &Path) -> Result<String, EngineError> {
    let mut archive = open_archive(path)?;

    let entries = archive
        .entries()
        .map_err(|e| archive_error(path, format!("failed to read archive: {}", e)))?;

    for entry in entries {
        let mut entry =
            entry.map_err(|e| archive_error(path, format!("failed to read entry: {}", e)))?;

        let entry_path = entry
            .path()
            .map_err(|e| archive_error(path, format!("failed to get entry path: {}", e)))?
            .to_string_lossy()
            .to_string();

        if entry_path == ".PKGINFO" {
            let mut content = String::new();
            entry
                .read_to_string(&mut content)
                .map_err(|e| archive_error(path, format!("failed to read .PKGINFO: {}", e)))?;
            return Ok(content);
        }
    }

    Err(archive_error(path, "no .PKGINFO file found in package"))
}

/// Load a package from an archive on disk
pub fn load(path: &Path) -> Result<Package, EngineError> {
    debug!("Loading package archive: {}", path.display());

    let info = parse_pkginfo(&read_pkginfo(path)?);

    let name = info
        .name
        .ok_or_else(|| archive_error(path, "package name not found in .PKGINFO"))?;
    let version = info
        .version
        .ok_or_else(|| archive_error(path, "package version not found in .PKGINFO"))?;

    let download_size = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);

    let mut package = Package::new(name, version);
    package.description = info.description;
    package.architecture = info.architecture;
    package.installed_size = info.size.unwrap_or(0);
    package.download_size = download_size;
    package.depends = info.dependencies;
    package.conflicts = info.conflicts;
    package.groups = info.groups;
    package.filename = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string());
    package.origin = PackageOrigin::File;

    debug!(
        "Loaded package {} version {} ({} dependencies)",
        package.name,
        package.version,
        package.depends.len()
    );

    Ok(package)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use xz2::write::XzEncoder;

    const PKGINFO: &str = r#"
# Generated by makepkg
pkgname = test-package
pkgver = 1.0.0-1
pkgdesc = A test package
url = https://example.com
arch = x86_64
size = 4096
license = MIT
group = utils
depend = glibc>=2.34
depend = zlib
conflict = old-package
optdepend = python: for scripts
"#;

    fn write_xz_package(dir: &Path, name: &str, pkginfo: Option<&str>) -> std::path::PathBuf {
        let path = dir.join(name);
        let file = File::create(&path).unwrap();
        let mut builder = tar::Builder::new(XzEncoder::new(file, 6));

        if let Some(pkginfo) = pkginfo {
            let mut header = tar::Header::new_gnu();
            header.set_size(pkginfo.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, ".PKGINFO", pkginfo.as_bytes())
                .unwrap();
        }

        let body = b"#!/bin/sh\necho hello\n";
        let mut header = tar::Header::new_gnu();
        header.set_size(body.len() as u64);
        header.set_mode(0o755);
        header.set_cksum();
        builder
            .append_data(&mut header, "usr/bin/hello", &body[..])
            .unwrap();

        let mut encoder = builder.into_inner().unwrap();
        encoder.flush().unwrap();
        encoder.finish().unwrap();
        path
    }

    #[test]
    fn test_compression_detection() {
        assert_eq!(
            detect_compression(Path::new("test.pkg.tar.zst")).unwrap(),
            CompressionFormat::Zstd
        );
        assert_eq!(
            detect_compression(Path::new("test.pkg.tar.xz")).unwrap(),
            CompressionFormat::Xz
        );
        assert_eq!(
            detect_compression(Path::new("test.pkg.tar.gz")).unwrap(),
            CompressionFormat::Gzip
        );
        assert!(detect_compression(Path::new("test.rpm")).is_err());
    }

    #[test]
    fn test_pkginfo_parsing() {
        let info = parse_pkginfo(PKGINFO);
        assert_eq!(info.name, Some("test-package".to_string()));
        assert_eq!(info.version, Some("1.0.0-1".to_string()));
        assert_eq!(info.description, Some("A test package".to_string()));
        assert_eq!(info.architecture, Some("x86_64".to_string()));
        assert_eq!(info.size, Some(4096));
        assert_eq!(info.groups, vec!["utils"]);
        assert_eq!(info.dependencies.len(), 2);
        assert_eq!(info.conflicts, vec!["old-package"]);
    }

    #[test]
    fn test_load_xz_archive() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_xz_package(dir.path(), "test-package-1.0.0-1-x86_64.pkg.tar.xz", Some(PKGINFO));

        let package = load(&path).unwrap();
        assert_eq!(package.name, "test-package");
        assert_eq!(package.version, "1.0.0-1");
        assert_eq!(package.installed_size, 4096);
        assert_eq!(package.depends, vec!["glibc>=2.34", "zlib"]);
        assert_eq!(package.origin, PackageOrigin::File);
        assert_eq!(
            package.filename.as_deref(),
            Some("test-package-1.0.0-1-x86_64.pkg.tar.xz")
        );
        assert!(package.download_size > 0);
    }

    #[test]
    fn test_load_archive_without_pkginfo() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_xz_package(dir.path(), "broken-1.0-1-any.pkg.tar.xz", None);

        let err = load(&path).unwrap_err();
        assert!(matches!(err, EngineError::Archive { .. }));
    }

    #[test]
    fn test_load_archive_missing_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_xz_package(dir.path(), "noversion.pkg.tar.xz", Some("pkgname = noversion\n"));

        let err = load(&path).unwrap_err();
        assert!(err.to_string().contains("version"));
    }

    #[test]
    fn test_load_missing_file() {
        let err = load(Path::new("/nonexistent/foo-1.0-1-any.pkg.tar.zst")).unwrap_err();
        assert!(matches!(err, EngineError::Archive { .. }));
    }
}
