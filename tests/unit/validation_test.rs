use chrono::{Duration as ChronoDuration, Utc};
use rsa::pss::SigningKey;
use rsa::signature::{RandomizedSigner, SignatureEncoding};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use std::collections::HashMap;

use oracle_control_plane::adapters::{DataPoint, DataValue, SourceKind};
use oracle_control_plane::config::ValidatorConfig;
use oracle_control_plane::services::signing_service::canonical_source_message;
use oracle_control_plane::validation::{
    AnomalyType, ValidationSeverity, ValidationStage, Validator,
};

fn numeric_point(source_id: &str, value: f64, timestamp: chrono::DateTime<Utc>) -> DataPoint {
    DataPoint {
        source_id: source_id.to_string(),
        source_type: SourceKind::Rest,
        value: DataValue::Numeric(value),
        timestamp,
        metadata: HashMap::new(),
        signature: None,
    }
}

fn config_with_short_history() -> ValidatorConfig {
    ValidatorConfig {
        min_history_points: 2,
        min_consensus_sources: 3,
        ..ValidatorConfig::default()
    }
}

/// Seed three sources with accepted history so consensus statistics exist.
async fn seed_three_sources(validator: &Validator) {
    let base = Utc::now() - ChronoDuration::seconds(600);

    // Source a carries enough spread that its own z-score check stays quiet
    // for the deviant value injected later.
    for (i, value) in [80.0, 120.0].iter().enumerate() {
        let (accepted, _) = validator
            .validate_data_point(&numeric_point(
                "src_a",
                *value,
                base + ChronoDuration::seconds(i as i64 * 60),
            ))
            .await;
        assert!(accepted);
    }
    for (i, value) in [100.1, 100.3].iter().enumerate() {
        let (accepted, _) = validator
            .validate_data_point(&numeric_point(
                "src_b",
                *value,
                base + ChronoDuration::seconds(i as i64 * 60),
            ))
            .await;
        assert!(accepted);
    }
    for (i, value) in [99.7, 99.9].iter().enumerate() {
        let (accepted, _) = validator
            .validate_data_point(&numeric_point(
                "src_c",
                *value,
                base + ChronoDuration::seconds(i as i64 * 60),
            ))
            .await;
        assert!(accepted);
    }
}

#[tokio::test]
async fn test_consensus_stage_rejects_deviant_source() {
    let validator = Validator::new(config_with_short_history());
    seed_three_sources(&validator).await;

    let (accepted, findings) = validator
        .validate_data_point(&numeric_point("src_a", 150.0, Utc::now()))
        .await;

    assert!(!accepted);
    let finding = findings
        .iter()
        .find(|f| f.stage == ValidationStage::Consensus)
        .expect("consensus finding present");
    assert_eq!(finding.severity, ValidationSeverity::High);
    assert_eq!(finding.anomaly_type, Some(AnomalyType::ConsensusDeviation));
}

#[tokio::test]
async fn test_agreeing_value_passes_consensus() {
    let validator = Validator::new(config_with_short_history());
    seed_three_sources(&validator).await;

    let (accepted, _) = validator
        .validate_data_point(&numeric_point("src_b", 100.2, Utc::now()))
        .await;
    assert!(accepted);
}

#[tokio::test]
async fn test_findings_query_filters() {
    let validator = Validator::new(config_with_short_history());

    // Negative value trips the default range rule.
    let (accepted, _) = validator
        .validate_data_point(&numeric_point("bad_src", -10.0, Utc::now()))
        .await;
    assert!(!accepted);

    let all = validator.get_findings(None, None, None).await;
    assert!(!all.is_empty());

    let for_source = validator.get_findings(Some("bad_src"), None, None).await;
    assert_eq!(for_source.len(), all.len());

    let critical = validator
        .get_findings(Some("bad_src"), Some(ValidationSeverity::Critical), None)
        .await;
    assert!(!critical.is_empty());

    assert!(validator
        .get_findings(Some("other"), None, None)
        .await
        .is_empty());
}

#[tokio::test]
async fn test_signature_verification_stage() {
    let validator = Validator::new(config_with_short_history());

    let mut rng = rand::thread_rng();
    let private_key = RsaPrivateKey::new(&mut rng, 2048).expect("keygen");
    let public_key = RsaPublicKey::from(&private_key);
    validator.register_source_key("signed_src", public_key).await;

    let timestamp = Utc::now();
    let value = DataValue::Numeric(42.0);
    let message = canonical_source_message("signed_src", &value, &timestamp);

    let signing_key = SigningKey::<Sha256>::new(private_key);
    let signature = signing_key.sign_with_rng(&mut rng, message.as_bytes());

    let mut point = numeric_point("signed_src", 42.0, timestamp);
    point.signature = Some(signature.to_vec());

    let (accepted, findings) = validator.validate_data_point(&point).await;
    assert!(accepted, "valid signature accepted: {:?}", findings);

    // Tampered value must fail with a critical finding.
    let mut forged = numeric_point("signed_src", 43.0, timestamp);
    forged.signature = Some(signature.to_vec());
    let (accepted, findings) = validator.validate_data_point(&forged).await;
    assert!(!accepted);
    assert!(findings
        .iter()
        .any(|f| f.stage == ValidationStage::Cryptographic
            && f.severity == ValidationSeverity::Critical));
}

#[tokio::test]
async fn test_unregistered_source_signature_is_ignored() {
    let validator = Validator::new(config_with_short_history());

    let mut point = numeric_point("unknown_src", 10.0, Utc::now());
    point.signature = Some(vec![0u8; 256]);

    let (accepted, _) = validator.validate_data_point(&point).await;
    assert!(accepted);
}
