//! Provider package codec
//!
//! A provider package (CBP) is a zip archive with four required entries:
//!
//! ```text
//! meta/manifest.json     Manifest, JSON
//! meta/watermark.json    Watermark, JSON
//! signature.sig          detached signature (64 raw bytes or base64 text)
//! bin/provider.enc       provider executable encrypted under the master key
//! ```
//!
//! `meta/schema.json` is optional. Any other entry is ignored.
//!
//! # Signed payload
//!
//! The publisher signs `manifest.json bytes || '\n' || bin/provider.enc`.
//! The watermark is stamped per download and is not part of the payload.

use crate::schema::ProviderSchema;
use sdk::errors::EngineError;
use sdk::manifest::{Manifest, Watermark};
use std::fs::{self, File};
use std::io::{self, BufReader, Read, Seek, Write};
use std::path::{Path, PathBuf};
use zip::result::ZipError;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

pub const MANIFEST_ENTRY: &str = "meta/manifest.json";
pub const WATERMARK_ENTRY: &str = "meta/watermark.json";
pub const SCHEMA_ENTRY: &str = "meta/schema.json";
pub const SIGNATURE_ENTRY: &str = "signature.sig";
pub const BINARY_ENTRY: &str = "bin/provider.enc";

/// Upper bound on any single entry, to refuse decompression bombs
const MAX_ENTRY_SIZE: u64 = 512 * 1024 * 1024;

/// A parsed provider package
#[derive(Debug, Clone)]
pub struct ProviderPackage {
    pub manifest: Manifest,
    pub watermark: Watermark,
    pub schema: Option<ProviderSchema>,
    pub signature: Vec<u8>,
    pub encrypted_binary: Vec<u8>,
    manifest_bytes: Vec<u8>,
}

impl ProviderPackage {
    /// The manifest entry exactly as stored in the archive
    pub fn manifest_bytes(&self) -> &[u8] {
        &self.manifest_bytes
    }

    /// The bytes covered by the publisher signature
    pub fn signed_payload(&self) -> Vec<u8> {
        signed_payload(&self.manifest_bytes, &self.encrypted_binary)
    }
}

/// Build the signed payload from its parts
pub fn signed_payload(manifest_bytes: &[u8], encrypted_binary: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(manifest_bytes.len() + 1 + encrypted_binary.len());
    payload.extend_from_slice(manifest_bytes);
    payload.push(b'\n');
    payload.extend_from_slice(encrypted_binary);
    payload
}

/// Parse a package file
///
/// # Errors
///
/// Returns `EngineError::CorruptPackage` if the archive cannot be opened or
/// an entry cannot be read or decoded, and `EngineError::MissingField` if
/// the manifest id, watermark, signature, or binary is absent or empty.
pub fn parse(path: &Path) -> Result<ProviderPackage, EngineError> {
    tracing::debug!("Parsing provider package {}", path.display());

    let file = File::open(path).map_err(|e| {
        EngineError::CorruptPackage(format!("cannot open {}: {}", path.display(), e))
    })?;

    parse_reader(BufReader::new(file))
}

/// Parse a package from any seekable reader
pub fn parse_reader<R: Read + Seek>(reader: R) -> Result<ProviderPackage, EngineError> {
    let mut archive = ZipArchive::new(reader).map_err(corrupt)?;

    let mut manifest_bytes = Vec::new();
    let mut watermark = None;
    let mut schema = None;
    let mut signature = Vec::new();
    let mut encrypted_binary = Vec::new();

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).map_err(corrupt)?;
        let name = entry.name().to_string();

        match name.as_str() {
            MANIFEST_ENTRY => manifest_bytes = read_entry(&mut entry, &name)?,
            WATERMARK_ENTRY => {
                let bytes = read_entry(&mut entry, &name)?;
                watermark = Some(serde_json::from_slice::<Watermark>(&bytes).map_err(|e| {
                    EngineError::CorruptPackage(format!("invalid {}: {}", name, e))
                })?);
            }
            SCHEMA_ENTRY => {
                let bytes = read_entry(&mut entry, &name)?;
                schema = Some(ProviderSchema::from_json_bytes(&bytes).map_err(|e| {
                    EngineError::CorruptPackage(format!("invalid {}: {}", name, e))
                })?);
            }
            SIGNATURE_ENTRY => signature = read_entry(&mut entry, &name)?,
            BINARY_ENTRY => encrypted_binary = read_entry(&mut entry, &name)?,
            _ => tracing::debug!("Ignoring unknown package entry {}", name),
        }
    }

    let manifest = if manifest_bytes.is_empty() {
        Manifest::default()
    } else {
        Manifest::from_json_bytes(&manifest_bytes).map_err(|e| {
            EngineError::CorruptPackage(format!("invalid {}: {}", MANIFEST_ENTRY, e))
        })?
    };

    if manifest.id.trim().is_empty() {
        return Err(EngineError::MissingField("manifest.id"));
    }
    let watermark = watermark.ok_or(EngineError::MissingField("watermark"))?;
    if signature.is_empty() {
        return Err(EngineError::MissingField("signature"));
    }
    if encrypted_binary.is_empty() {
        return Err(EngineError::MissingField("binary"));
    }

    tracing::info!(
        "Parsed package {} v{} ({} bytes encrypted)",
        manifest.id,
        manifest.version,
        encrypted_binary.len()
    );

    Ok(ProviderPackage {
        manifest,
        watermark,
        schema,
        signature,
        encrypted_binary,
        manifest_bytes,
    })
}

/// Write a package archive
///
/// Used by build tooling; the runtime import path only parses.
pub fn create(
    manifest: &Manifest,
    watermark: &Watermark,
    encrypted_binary: &[u8],
    signature: &[u8],
    out_path: &Path,
) -> Result<(), EngineError> {
    create_with_schema(manifest, watermark, None, encrypted_binary, signature, out_path)
}

/// Write a package archive that also carries a configuration schema
pub fn create_with_schema(
    manifest: &Manifest,
    watermark: &Watermark,
    schema: Option<&ProviderSchema>,
    encrypted_binary: &[u8],
    signature: &[u8],
    out_path: &Path,
) -> Result<(), EngineError> {
    let manifest_bytes = manifest
        .to_json_bytes()
        .map_err(|e| EngineError::CorruptPackage(format!("cannot encode manifest: {}", e)))?;
    let watermark_bytes = serde_json::to_vec_pretty(watermark)
        .map_err(|e| EngineError::CorruptPackage(format!("cannot encode watermark: {}", e)))?;

    if let Some(parent) = out_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let file = File::create(out_path)?;
    let mut zip = ZipWriter::new(file);

    let deflated = FileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .unix_permissions(0o644);
    let stored = FileOptions::default()
        .compression_method(CompressionMethod::Stored)
        .unix_permissions(0o644);

    write_entry(&mut zip, MANIFEST_ENTRY, deflated, &manifest_bytes)?;
    write_entry(&mut zip, WATERMARK_ENTRY, deflated, &watermark_bytes)?;
    if let Some(schema) = schema {
        let schema_bytes = serde_json::to_vec_pretty(schema)
            .map_err(|e| EngineError::CorruptPackage(format!("cannot encode schema: {}", e)))?;
        write_entry(&mut zip, SCHEMA_ENTRY, deflated, &schema_bytes)?;
    }
    write_entry(&mut zip, SIGNATURE_ENTRY, stored, signature)?;
    write_entry(&mut zip, BINARY_ENTRY, stored, encrypted_binary)?;

    zip.finish().map_err(io_error)?;

    tracing::info!("Wrote package {} to {}", manifest.id, out_path.display());
    Ok(())
}

/// Expand every entry of a package onto disk under `dest_dir`
///
/// Entries whose paths would escape `dest_dir` are refused.
pub fn extract(path: &Path, dest_dir: &Path) -> Result<Vec<PathBuf>, EngineError> {
    let file = File::open(path).map_err(|e| {
        EngineError::CorruptPackage(format!("cannot open {}: {}", path.display(), e))
    })?;
    let mut archive = ZipArchive::new(BufReader::new(file)).map_err(corrupt)?;

    fs::create_dir_all(dest_dir)?;
    let mut written = Vec::with_capacity(archive.len());

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).map_err(corrupt)?;
        let relative = entry.enclosed_name().map(Path::to_path_buf).ok_or_else(|| {
            EngineError::CorruptPackage(format!("unsafe entry path: {}", entry.name()))
        })?;
        let target = dest_dir.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            let name = entry.name().to_string();
            let mut out = File::create(&target)?;
            if let Err(e) = copy_bounded(&mut entry, &mut out, MAX_ENTRY_SIZE, &name) {
                drop(out);
                let _ = fs::remove_file(&target);
                return Err(e);
            }
        }

        written.push(target);
    }

    tracing::debug!("Extracted {} entries to {}", written.len(), dest_dir.display());
    Ok(written)
}

fn read_entry<R: Read>(entry: &mut R, name: &str) -> Result<Vec<u8>, EngineError> {
    let mut buf = Vec::new();
    entry
        .take(MAX_ENTRY_SIZE + 1)
        .read_to_end(&mut buf)
        .map_err(|e| EngineError::CorruptPackage(format!("cannot read {}: {}", name, e)))?;

    if buf.len() as u64 > MAX_ENTRY_SIZE {
        return Err(EngineError::CorruptPackage(format!(
            "entry {} exceeds {} bytes",
            name, MAX_ENTRY_SIZE
        )));
    }
    Ok(buf)
}

/// Copy at most `limit` bytes, failing instead of truncating a larger entry
fn copy_bounded<R: Read, W: Write>(
    entry: &mut R,
    out: &mut W,
    limit: u64,
    name: &str,
) -> Result<u64, EngineError> {
    let copied = io::copy(&mut entry.take(limit + 1), out)?;
    if copied > limit {
        return Err(EngineError::CorruptPackage(format!(
            "entry {} exceeds {} bytes",
            name, limit
        )));
    }
    Ok(copied)
}

fn write_entry<W: Write + Seek>(
    zip: &mut ZipWriter<W>,
    name: &str,
    options: FileOptions,
    data: &[u8],
) -> Result<(), EngineError> {
    zip.start_file(name, options).map_err(io_error)?;
    zip.write_all(data)?;
    Ok(())
}

fn corrupt(err: ZipError) -> EngineError {
    EngineError::CorruptPackage(err.to_string())
}

fn io_error(err: ZipError) -> EngineError {
    match err {
        ZipError::Io(e) => EngineError::Io(e),
        other => EngineError::CorruptPackage(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manifest() -> Manifest {
        Manifest {
            id: "raid-lsi".to_string(),
            name: "LSI MegaRAID".to_string(),
            version: "1.2.0".to_string(),
            vendor: "Broadcom".to_string(),
            model: "3108".to_string(),
            ..Default::default()
        }
    }

    fn watermark() -> Watermark {
        Watermark {
            license_id: "lic-1".to_string(),
            downloader_id: "user-9".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_oversized_entry_is_refused_not_truncated() {
        let mut out = Vec::new();
        let err = copy_bounded(&mut &b"0123456789"[..], &mut out, 4, "bin/provider.enc")
            .unwrap_err();
        assert!(matches!(err, EngineError::CorruptPackage(msg) if msg.contains("exceeds")));

        let mut exact = Vec::new();
        assert_eq!(
            copy_bounded(&mut &b"0123"[..], &mut exact, 4, "bin/provider.enc").unwrap(),
            4
        );
        assert_eq!(exact, b"0123");
    }

    #[test]
    fn test_create_then_parse() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("raid.cbp");

        create(&manifest(), &watermark(), b"ciphertext", b"sig", &path).unwrap();
        let pkg = parse(&path).unwrap();

        assert_eq!(pkg.manifest, manifest());
        assert_eq!(pkg.watermark, watermark());
        assert_eq!(pkg.signature, b"sig");
        assert_eq!(pkg.encrypted_binary, b"ciphertext");
        assert!(pkg.schema.is_none());
        assert_eq!(
            pkg.signed_payload(),
            signed_payload(&manifest().to_json_bytes().unwrap(), b"ciphertext")
        );
    }

    #[test]
    fn test_not_an_archive() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("junk.cbp");
        fs::write(&path, b"definitely not a zip").unwrap();

        assert!(matches!(parse(&path), Err(EngineError::CorruptPackage(_))));
        assert!(matches!(
            parse(&dir.path().join("absent.cbp")),
            Err(EngineError::CorruptPackage(_))
        ));
    }

    #[test]
    fn test_missing_fields() {
        let dir = TempDir::new().unwrap();

        let path = dir.path().join("no-id.cbp");
        let mut m = manifest();
        m.id.clear();
        create(&m, &watermark(), b"ciphertext", b"sig", &path).unwrap();
        assert!(matches!(
            parse(&path),
            Err(EngineError::MissingField("manifest.id"))
        ));

        let path = dir.path().join("no-sig.cbp");
        create(&manifest(), &watermark(), b"ciphertext", b"", &path).unwrap();
        assert!(matches!(
            parse(&path),
            Err(EngineError::MissingField("signature"))
        ));

        let path = dir.path().join("no-bin.cbp");
        create(&manifest(), &watermark(), b"", b"sig", &path).unwrap();
        assert!(matches!(parse(&path), Err(EngineError::MissingField("binary"))));
    }

    #[test]
    fn test_unknown_entries_ignored() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("extra.cbp");

        let file = File::create(&path).unwrap();
        let mut zip = ZipWriter::new(file);
        let opts = FileOptions::default();
        for (name, data) in [
            (MANIFEST_ENTRY, manifest().to_json_bytes().unwrap()),
            (WATERMARK_ENTRY, serde_json::to_vec(&watermark()).unwrap()),
            (SIGNATURE_ENTRY, b"sig".to_vec()),
            (BINARY_ENTRY, b"bin".to_vec()),
            ("docs/README.md", b"future entry".to_vec()),
        ] {
            zip.start_file(name, opts).unwrap();
            zip.write_all(&data).unwrap();
        }
        zip.finish().unwrap();

        let pkg = parse(&path).unwrap();
        assert_eq!(pkg.manifest.id, "raid-lsi");
    }

    #[test]
    fn test_extract_preserves_tree() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("raid.cbp");
        create(&manifest(), &watermark(), b"ciphertext", b"sig", &path).unwrap();

        let out = dir.path().join("out");
        let written = extract(&path, &out).unwrap();

        assert_eq!(written.len(), 4);
        assert!(out.join(MANIFEST_ENTRY).is_file());
        assert_eq!(fs::read(out.join(BINARY_ENTRY)).unwrap(), b"ciphertext");
    }
}
