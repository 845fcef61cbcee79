//! Integration tests for the provider import pipeline and registry

mod common;

use common::{manifest, mock_provider_bytes, watermark, Fixture, LICENSE_ID};
use provisio_engine::audit::Severity;
use provisio_engine::crypto::{generate_signing_key, sha256_hex, sign_package_data};
use provisio_engine::package;
use provisio_engine::plugins::{PluginManager, WatermarkPolicy};
use sdk::errors::EngineError;
use std::fs;
use std::sync::Arc;

#[test]
fn test_import_installs_executable() {
    let fixture = Fixture::new();
    let manager = fixture.manager();

    let info = manager.import(&fixture.mock_package("raid")).unwrap();

    assert_eq!(info.id, "raid");
    assert_eq!(info.version, "1.0.0");
    assert_eq!(info.vendor, "Acme");
    assert!(info.violation.is_none());
    assert_eq!(info.path, fixture.store_dir().join("raid"));
    assert_eq!(fs::read(&info.path).unwrap(), mock_provider_bytes());
    assert_eq!(info.checksum, sha256_hex(&mock_provider_bytes()));
    assert!(fixture.store_dir().join("raid.json").is_file());

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = fs::metadata(&info.path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }

    assert_eq!(manager.get("raid").unwrap(), info);
    assert_eq!(manager.list().len(), 1);
}

#[test]
fn test_bad_signature_writes_nothing() {
    let fixture = Fixture::new();
    let manager = fixture.manager();

    let good = package::parse(&fixture.mock_package("raid")).unwrap();
    let impostor = generate_signing_key();
    let forged = sign_package_data(&good.signed_payload(), &impostor).unwrap();

    let path = fixture.path().join("forged.cbp");
    package::create(
        &good.manifest,
        &good.watermark,
        &good.encrypted_binary,
        forged.as_bytes(),
        &path,
    )
    .unwrap();

    assert!(matches!(
        manager.import(&path),
        Err(EngineError::SignatureInvalid)
    ));
    assert!(manager.list().is_empty());
    assert_eq!(fs::read_dir(fixture.store_dir()).unwrap().count(), 0);
    assert!(!fixture.audit_path().exists());
}

#[test]
fn test_undecodable_signature_fails_closed() {
    let fixture = Fixture::new();
    let manager = fixture.manager();

    let good = package::parse(&fixture.mock_package("raid")).unwrap();
    let path = fixture.path().join("garbled.cbp");
    package::create(
        &good.manifest,
        &good.watermark,
        &good.encrypted_binary,
        b"%%% not base64 %%%",
        &path,
    )
    .unwrap();

    assert!(matches!(
        manager.import(&path),
        Err(EngineError::SignatureInvalid)
    ));
}

#[test]
fn test_mismatched_watermark_is_flagged_and_installed() {
    let fixture = Fixture::new();
    let manager = fixture.manager();

    let path = fixture.package(
        &manifest("raid", "1.0.0"),
        &watermark("lic-leaked", ""),
        b"#!/bin/sh\n",
        None,
    );
    let info = manager.import(&path).unwrap();

    let violation = info.violation.clone().unwrap();
    assert_eq!(violation.expected_license_id, LICENSE_ID);
    assert_eq!(violation.actual_license_id, "lic-leaked");
    assert_eq!(violation.severity, Severity::Critical);
    assert!(info.path.exists());

    let recorded = manager.violations_for("raid").unwrap();
    assert_eq!(recorded, vec![violation]);
}

#[test]
fn test_reject_policy_refuses_after_recording() {
    let fixture = Fixture::new();
    let manager = fixture
        .manager()
        .with_watermark_policy(WatermarkPolicy::Reject);

    let path = fixture.package(
        &manifest("raid", "1.0.0"),
        &watermark("lic-leaked", "org-acme"),
        b"#!/bin/sh\n",
        None,
    );

    assert!(matches!(
        manager.import(&path),
        Err(EngineError::WatermarkRejected { ref provider_id, .. }) if provider_id == "raid"
    ));
    assert!(manager.list().is_empty());
    assert!(!fixture.store_dir().join("raid").exists());

    let violations = manager.validator().get_violations().unwrap();
    assert_eq!(violations.len(), 1);
    assert_eq!(violations[0].severity, Severity::Warning);
}

#[test]
fn test_wrong_master_key_fails_import() {
    let fixture = Fixture::new();
    let path = fixture.mock_package("raid");

    let other = provisio_engine::crypto::DrmEngine::new(
        &[0x11; 32],
        Some(provisio_engine::crypto::VerifyingKey::from(&fixture.signing_key)),
    )
    .unwrap();
    let manager = PluginManager::new(fixture.store_dir(), other, fixture.validator()).unwrap();

    assert!(matches!(
        manager.import(&path),
        Err(EngineError::DecryptionFailed)
    ));
    assert!(manager.list().is_empty());
}

#[test]
fn test_reimport_replaces_entry() {
    let fixture = Fixture::new();
    let manager = fixture.manager();
    let wm = watermark(LICENSE_ID, "org-acme");

    manager
        .import(&fixture.package(&manifest("raid", "1.0.0"), &wm, b"v1", None))
        .unwrap();
    let second = manager
        .import(&fixture.package(&manifest("raid", "2.0.0"), &wm, b"v2", None))
        .unwrap();

    assert_eq!(manager.list().len(), 1);
    assert_eq!(manager.get("raid").unwrap().version, "2.0.0");
    assert_eq!(fs::read(second.path).unwrap(), b"v2");
}

#[test]
fn test_restart_recovers_registry() {
    let fixture = Fixture::new();
    {
        let manager = fixture.manager();
        manager.import(&fixture.mock_package("raid")).unwrap();
    }
    fs::write(fixture.store_dir().join("hand-copied"), b"binary").unwrap();

    let manager = fixture.manager();
    let ids: Vec<String> = manager.list().into_iter().map(|p| p.id).collect();
    assert_eq!(ids, vec!["hand-copied", "raid"]);

    let raid = manager.get("raid").unwrap();
    assert_eq!(raid.version, "1.0.0");
    assert_eq!(raid.checksum, sha256_hex(&mock_provider_bytes()));

    let loose = manager.get("hand-copied").unwrap();
    assert_eq!(loose.version, "unknown");
    assert_eq!(loose.name, "hand-copied");
}

#[test]
fn test_delete_removes_files() {
    let fixture = Fixture::new();
    let manager = fixture.manager();
    let info = manager.import(&fixture.mock_package("raid")).unwrap();

    manager.delete("raid").unwrap();

    assert!(!info.path.exists());
    assert!(!fixture.store_dir().join("raid.json").exists());
    assert!(matches!(
        manager.get("raid"),
        Err(EngineError::ProviderNotFound(_))
    ));
    assert!(matches!(
        manager.delete("raid"),
        Err(EngineError::ProviderNotFound(_))
    ));
}

#[test]
fn test_concurrent_imports_and_reads() {
    let fixture = Fixture::new();
    let paths: Vec<_> = (0..4)
        .map(|i| {
            fixture.package(
                &manifest(&format!("p{}", i), "1.0.0"),
                &watermark(LICENSE_ID, "org-acme"),
                format!("binary {}", i).as_bytes(),
                None,
            )
        })
        .collect();
    let manager = Arc::new(fixture.manager());

    let handles: Vec<_> = paths
        .into_iter()
        .map(|path| {
            let manager = Arc::clone(&manager);
            std::thread::spawn(move || {
                manager.import(&path).unwrap();
                manager.list().len()
            })
        })
        .collect();
    for handle in handles {
        assert!(handle.join().unwrap() >= 1);
    }

    assert_eq!(manager.list().len(), 4);
}
