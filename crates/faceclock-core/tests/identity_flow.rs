mod common;

use common::*;
use faceclock_core::enrollment::EnrollmentRejection;
use faceclock_core::image_check::ImageRejection;
use faceclock_core::matcher::ConfidenceTier;
use faceclock_core::service::{FaceIdentityService, ServiceConfig, ServiceError};
use faceclock_core::store::{SignatureStore, SqliteSignatureStore};
use faceclock_core::types::SignatureFormat;
use faceclock_core::verification::{
    VerificationOutcome, VerificationRejection, VerificationResult,
};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tempfile::TempDir;

fn service(
    dir: &TempDir,
    extractor: ScriptedExtractor,
) -> FaceIdentityService<ScriptedExtractor, SqliteSignatureStore> {
    let store = Arc::new(SqliteSignatureStore::open(dir.path()).unwrap());
    FaceIdentityService::new(extractor, store, ServiceConfig::default()).unwrap()
}

fn completed(outcome: VerificationOutcome) -> VerificationResult {
    match outcome {
        VerificationOutcome::Completed(result) => result,
        VerificationOutcome::Rejected(reason) => panic!("verification rejected: {reason}"),
    }
}

fn rejected(outcome: VerificationOutcome) -> VerificationRejection {
    match outcome {
        VerificationOutcome::Rejected(reason) => reason,
        VerificationOutcome::Completed(result) => panic!("verification completed: {result:?}"),
    }
}

#[test]
fn test_enroll_then_verify_end_to_end() {
    let dir = TempDir::new().unwrap();
    let alice = face_image(1);
    let bob = face_image(2);
    let extractor = ScriptedExtractor::new()
        .faces(&alice, vec![detected(0, 100)])
        .faces(&bob, vec![detected(1, 100)]);
    let mut svc = service(&dir, extractor);

    let enrolled = svc.enroll("emp-1", &alice).unwrap();
    assert!(enrolled.success, "{}", enrolled.message);
    assert!(svc.status("emp-1").unwrap().has_signature);

    let same = completed(svc.verify("emp-1", &alice).unwrap());
    assert!(same.verified);
    assert_eq!(same.distance, 0.0);
    assert_eq!(same.similarity_pct, 100.0);
    assert_eq!(same.confidence, ConfidenceTier::High);
    assert_eq!(same.tolerance_used, 0.6);

    let other = completed(svc.verify("emp-1", &bob).unwrap());
    assert!(other.distance > same.distance);
    assert!(!other.verified);
    assert_eq!(other.confidence, ConfidenceTier::Low);

    let stats = svc.statistics().unwrap();
    assert_eq!(stats.total, 1);
    assert_eq!(stats.by_format_version.get(FORMAT_VERSION), Some(&1));
}

#[test]
fn test_enroll_refuses_existing_identity() {
    let dir = TempDir::new().unwrap();
    let first = face_image(1);
    let second = face_image(2);
    let extractor = ScriptedExtractor::new()
        .faces(&first, vec![detected(0, 100)])
        .faces(&second, vec![detected(1, 100)]);
    let mut svc = service(&dir, extractor);

    assert!(svc.enroll("emp-1", &first).unwrap().success);
    let again = svc.enroll("emp-1", &second).unwrap();
    assert!(!again.success);
    assert_eq!(again.reason, Some(EnrollmentRejection::AlreadyRegistered));

    // The first enrollment is untouched.
    assert!(completed(svc.verify("emp-1", &first).unwrap()).verified);
    assert_eq!(svc.statistics().unwrap().total, 1);
}

#[test]
fn test_face_count_gate_leaves_nothing_stored() {
    let dir = TempDir::new().unwrap();
    let empty = face_image(3);
    let crowd = face_image(4);
    let extractor = ScriptedExtractor::new()
        .faces(&crowd, vec![detected(0, 100), detected(1, 90)]);
    let mut svc = service(&dir, extractor);

    let none = svc.enroll("emp-1", &empty).unwrap();
    assert_eq!(none.reason, Some(EnrollmentRejection::NoFace));
    assert!(!svc.status("emp-1").unwrap().has_signature);

    let many = svc.enroll("emp-1", &crowd).unwrap();
    assert_eq!(many.reason, Some(EnrollmentRejection::MultipleFaces { count: 2 }));
    assert!(!svc.status("emp-1").unwrap().has_signature);

    assert_eq!(artifact_files(&dir.path().join("artifacts")), 0);
}

#[test]
fn test_enroll_rejects_small_face() {
    let dir = TempDir::new().unwrap();
    let image = face_image(1);
    let mut svc = service(&dir, ScriptedExtractor::new().faces(&image, vec![detected(0, 30)]));

    let result = svc.enroll("emp-1", &image).unwrap();
    assert_eq!(
        result.reason,
        Some(EnrollmentRejection::FaceTooSmall { width: 30, height: 30, min: 50 })
    );
    assert!(!svc.status("emp-1").unwrap().has_signature);
}

#[test]
fn test_enroll_maps_extractor_failure() {
    let dir = TempDir::new().unwrap();
    let image = face_image(1);
    let mut svc = service(&dir, ScriptedExtractor::new().failure(&image, "model crashed"));

    let result = svc.enroll("emp-1", &image).unwrap();
    assert_eq!(result.reason.as_ref().map(|r| r.code()), Some("encoding_failed"));
    assert!(!svc.status("emp-1").unwrap().has_signature);
}

#[test]
fn test_verify_unknown_identity_skips_extractor() {
    let dir = TempDir::new().unwrap();
    let image = face_image(1);
    let extractor = ScriptedExtractor::new().faces(&image, vec![detected(0, 100)]);
    let calls = extractor.call_count();
    let mut svc = service(&dir, extractor);

    let reason = rejected(svc.verify("ghost", &image).unwrap());
    assert_eq!(reason, VerificationRejection::NotRegistered);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn test_verify_rejection_reasons_are_distinct() {
    let dir = TempDir::new().unwrap();
    let enrolled = face_image(1);
    let blank = face_image(5);
    let broken = face_image(6);
    let extractor = ScriptedExtractor::new()
        .faces(&enrolled, vec![detected(0, 100)])
        .failure(&broken, "encoder timeout");
    let calls = extractor.call_count();
    let mut svc = service(&dir, extractor);
    assert!(svc.enroll("emp-1", &enrolled).unwrap().success);

    let before = calls.load(Ordering::SeqCst);
    let not_an_image = vec![b'x'; 256];
    let invalid = rejected(svc.verify("emp-1", &not_an_image).unwrap());
    assert_eq!(invalid, VerificationRejection::InvalidImage(ImageRejection::UnsupportedFormat));
    assert_eq!(invalid.code(), "invalid_image");
    assert_eq!(calls.load(Ordering::SeqCst), before);

    assert_eq!(rejected(svc.verify("emp-1", &blank).unwrap()), VerificationRejection::NoFace);
    assert_eq!(rejected(svc.verify("emp-1", &broken).unwrap()).code(), "encoding_failed");
}

#[test]
fn test_verify_compares_largest_face() {
    let dir = TempDir::new().unwrap();
    let enrolled = face_image(1);
    let group = face_image(2);
    let extractor = ScriptedExtractor::new()
        .faces(&enrolled, vec![detected(0, 100)])
        .faces(&group, vec![detected(1, 60), detected(0, 140), detected(2, 80)]);
    let mut svc = service(&dir, extractor);
    assert!(svc.enroll("emp-1", &enrolled).unwrap().success);

    let result = completed(svc.verify("emp-1", &group).unwrap());
    assert!(result.verified);
    assert_eq!(result.distance, 0.0);
}

#[test]
fn test_replace_requires_existing_enrollment() {
    let dir = TempDir::new().unwrap();
    let image = face_image(1);
    let mut svc = service(&dir, ScriptedExtractor::new().faces(&image, vec![detected(0, 100)]));

    let result = svc.replace("emp-1", &image).unwrap();
    assert_eq!(result.reason, Some(EnrollmentRejection::NotRegistered));
    assert!(!svc.status("emp-1").unwrap().has_signature);
}

#[test]
fn test_replace_swaps_signature() {
    let dir = TempDir::new().unwrap();
    let old = face_image(1);
    let new = face_image(2);
    let extractor = ScriptedExtractor::new()
        .faces(&old, vec![detected(0, 100)])
        .faces(&new, vec![detected(1, 100)]);
    let mut svc = service(&dir, extractor);

    assert!(svc.enroll("emp-1", &old).unwrap().success);
    let replaced = svc.replace("emp-1", &new).unwrap();
    assert!(replaced.success, "{}", replaced.message);

    assert!(completed(svc.verify("emp-1", &new).unwrap()).verified);
    assert!(!completed(svc.verify("emp-1", &old).unwrap()).verified);
    assert_eq!(artifact_files(&dir.path().join("artifacts")), 1);
}

#[test]
fn test_rejected_replace_keeps_previous_enrollment() {
    let dir = TempDir::new().unwrap();
    let old = face_image(1);
    let faceless = face_image(7);
    let mut svc = service(&dir, ScriptedExtractor::new().faces(&old, vec![detected(0, 100)]));

    assert!(svc.enroll("emp-1", &old).unwrap().success);
    let result = svc.replace("emp-1", &faceless).unwrap();
    assert_eq!(result.reason, Some(EnrollmentRejection::NoFace));

    assert!(svc.status("emp-1").unwrap().has_signature);
    assert!(completed(svc.verify("emp-1", &old).unwrap()).verified);
}

#[test]
fn test_failed_put_rolls_back_artifact() {
    let dir = TempDir::new().unwrap();
    let image = face_image(1);
    let store = Arc::new(FlakyStore::open(dir.path()));
    store.fail_put.store(true, Ordering::SeqCst);
    let extractor = ScriptedExtractor::new().faces(&image, vec![detected(0, 100)]);
    let mut svc =
        FaceIdentityService::new(extractor, Arc::clone(&store), ServiceConfig::default()).unwrap();

    let err = svc.enroll("emp-1", &image).unwrap_err();
    assert!(matches!(err, ServiceError::Store(_)));
    assert!(!store.exists("emp-1").unwrap());
    assert_eq!(artifact_files(store.inner.artifact_dir()), 0);
}

#[test]
fn test_failed_discard_surfaces_inconsistency() {
    let dir = TempDir::new().unwrap();
    let image = face_image(1);
    let store = Arc::new(FlakyStore::open(dir.path()));
    store.fail_put.store(true, Ordering::SeqCst);
    store.fail_discard.store(true, Ordering::SeqCst);
    let extractor = ScriptedExtractor::new().faces(&image, vec![detected(0, 100)]);
    let mut svc =
        FaceIdentityService::new(extractor, Arc::clone(&store), ServiceConfig::default()).unwrap();

    let err = svc.enroll("emp-1", &image).unwrap_err();
    assert!(matches!(err, ServiceError::StoreInconsistency { ref key, .. } if key == "emp-1"));
    assert!(!store.exists("emp-1").unwrap());
}

#[test]
fn test_signature_from_other_extractor_requires_reenrollment() {
    let dir = TempDir::new().unwrap();
    let image = face_image(1);
    {
        let mut svc = service(&dir, ScriptedExtractor::new().faces(&image, vec![detected(0, 100)]));
        assert!(svc.enroll("emp-1", &image).unwrap().success);
    }

    let upgraded = ScriptedExtractor::with_format(SignatureFormat::new("synthetic-v2", DIM))
        .faces(&image, vec![detected(0, 100)]);
    let mut svc = service(&dir, upgraded);
    let err = svc.verify("emp-1", &image).unwrap_err();
    assert!(matches!(err, ServiceError::IncompatibleSignatures { ref key, .. } if key == "emp-1"));
}

#[test]
fn test_remove_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let image = face_image(1);
    let mut svc = service(&dir, ScriptedExtractor::new().faces(&image, vec![detected(0, 100)]));
    assert!(svc.enroll("emp-1", &image).unwrap().success);

    assert!(svc.remove("emp-1").unwrap().removed);
    assert!(!svc.remove("emp-1").unwrap().removed);
    assert!(!svc.status("emp-1").unwrap().has_signature);
    assert_eq!(
        rejected(svc.verify("emp-1", &image).unwrap()),
        VerificationRejection::NotRegistered
    );
}

#[test]
fn test_invalid_identity_key_is_input_error() {
    let dir = TempDir::new().unwrap();
    let mut svc = service(&dir, ScriptedExtractor::new());
    for key in ["", "../etc/passwd", "emp\u{0}1"] {
        let err = svc.enroll(key, &face_image(1)).unwrap_err();
        assert!(err.is_input_error(), "{key:?} gave {err}");
    }
    assert!(svc.status("a\\b").unwrap_err().is_input_error());
}

#[test]
fn test_custom_tolerance_is_applied() {
    let dir = TempDir::new().unwrap();
    let enrolled = face_image(1);
    let near = face_image(2);
    let mut nearby = detected(0, 100);
    nearby.vector[0] += 0.25;
    let extractor = ScriptedExtractor::new()
        .faces(&enrolled, vec![detected(0, 100)])
        .faces(&near, vec![nearby]);
    let store = Arc::new(SqliteSignatureStore::open(dir.path()).unwrap());
    let strict = ServiceConfig { tolerance: 0.2, ..Default::default() };
    let mut svc = FaceIdentityService::new(extractor, store, strict).unwrap();
    assert!(svc.enroll("emp-1", &enrolled).unwrap().success);

    let result = completed(svc.verify("emp-1", &near).unwrap());
    assert!(!result.verified);
    assert_eq!(result.tolerance_used, 0.2);
    assert!((result.distance - 0.25).abs() < 1e-9);
    assert_eq!(result.similarity_pct, 75.0);
    assert_eq!(result.confidence, ConfidenceTier::Medium);
}
