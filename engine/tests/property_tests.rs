use proptest::prelude::*;
use provisio_engine::audit::{AuditLog, WatermarkValidator};
use provisio_engine::crypto::{generate_signing_key, sign_package_data, DrmEngine, VerifyingKey};
use provisio_engine::orchestrator::convergence::{find_match, ConvergencePolicy};
use provisio_engine::package;
use sdk::errors::EngineError;
use sdk::manifest::{Manifest, Watermark};
use sdk::protocol::DesiredState;
use serde_json::json;
use tempfile::TempDir;

fn drm(master: [u8; 32]) -> (DrmEngine, provisio_engine::crypto::SigningKey) {
    let signing = generate_signing_key();
    let drm = DrmEngine::new(&master, Some(VerifyingKey::from(&signing))).unwrap();
    (drm, signing)
}

// Whatever is encrypted under the master key decrypts to the same bytes,
// and any single-byte corruption is detected rather than decrypted.
proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn test_master_key_envelope(
        plaintext in proptest::collection::vec(any::<u8>(), 0..2048),
        flip in any::<prop::sample::Index>(),
    ) {
        let (drm, _) = drm([7u8; 32]);
        let ciphertext = drm.encrypt_with_master_key(&plaintext).unwrap();
        let decrypted = drm.decrypt_with_master_key(&ciphertext).unwrap();
        prop_assert_eq!(decrypted.as_slice(), plaintext.as_slice());

        let mut corrupted = ciphertext.clone();
        let i = flip.index(corrupted.len());
        corrupted[i] ^= 0x80;
        prop_assert!(matches!(
            drm.decrypt_with_master_key(&corrupted),
            Err(EngineError::DecryptionFailed)
        ));
    }
}

// A signature only verifies the exact bytes it was made over.
proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn test_signature_tamper_detection(
        data in proptest::collection::vec(any::<u8>(), 1..512),
        flip in any::<prop::sample::Index>(),
        bit in 0u8..8,
    ) {
        let (drm, signing) = drm([1u8; 32]);
        let signature = sign_package_data(&data, &signing).unwrap();
        prop_assert!(drm.verify_package_signature(&data, signature.as_bytes()).unwrap());

        let mut tampered = data.clone();
        let i = flip.index(tampered.len());
        tampered[i] ^= 1 << bit;
        prop_assert!(!drm.verify_package_signature(&tampered, signature.as_bytes()).unwrap());
    }
}

// Packages reproduce their manifest and watermark exactly.
proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn test_package_metadata_round_trip(
        id in "[a-z][a-z0-9-]{0,24}",
        name in "\\PC{0,40}",
        version in "[0-9]{1,2}\\.[0-9]{1,2}\\.[0-9]{1,2}",
        license in "[A-Za-z0-9-]{1,20}",
        org in "[a-z0-9-]{0,12}",
        binary in proptest::collection::vec(any::<u8>(), 1..256),
    ) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("p.cbp");
        let manifest = Manifest { id, name, version, ..Default::default() };
        let watermark = Watermark {
            license_id: license,
            organization_id: org,
            downloader_id: "d".to_string(),
            ..Default::default()
        };

        package::create(&manifest, &watermark, &binary, b"sig", &path).unwrap();
        let parsed = package::parse(&path).unwrap();

        prop_assert_eq!(parsed.manifest, manifest);
        prop_assert_eq!(parsed.watermark, watermark);
        prop_assert_eq!(parsed.encrypted_binary, binary);
    }
}

// N mismatched validations leave exactly N records, in call order.
proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn test_every_mismatch_is_logged(licenses in proptest::collection::vec("[a-z]{1,8}", 0..20)) {
        let dir = TempDir::new().unwrap();
        let validator = WatermarkValidator::new("LICENSE", AuditLog::new(dir.path().join("a.log")));

        for (i, license) in licenses.iter().enumerate() {
            let wm = Watermark { license_id: license.clone(), ..Default::default() };
            validator.validate(&format!("p{}", i), "P", &wm).unwrap();
        }

        let recorded = validator.get_violations().unwrap();
        prop_assert_eq!(recorded.len(), licenses.len());
        for (i, violation) in recorded.iter().enumerate() {
            prop_assert_eq!(&violation.provider_id, &format!("p{}", i));
            prop_assert_eq!(&violation.actual_license_id, &licenses[i]);
        }
    }
}

// Drive-set convergence ignores drive order.
proptest! {
    #[test]
    fn test_drive_set_order_insensitive(
        drives in proptest::collection::hash_set("d[0-9]{1,3}", 1..8),
    ) {
        let drives: Vec<String> = drives.into_iter().collect();
        let mut reversed = drives.clone();
        reversed.reverse();

        let desired = DesiredState::new("5", drives.iter().cloned());
        let probe = json!({"virtual_drives": [{"id": "vd_0", "level": "5", "drives": reversed}]});
        let probe = probe.as_object().unwrap();

        prop_assert!(find_match(&desired, probe, ConvergencePolicy::DriveSet).is_some());

        let mut fewer = drives.clone();
        fewer.pop();
        let desired_fewer = DesiredState::new("5", fewer);
        prop_assert!(find_match(&desired_fewer, probe, ConvergencePolicy::DriveSet).is_none());
    }
}
