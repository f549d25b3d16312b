//! Property-based tests for zrc-autoupdate.
//!
//! These tests use proptest to verify correctness properties across
//! randomly generated inputs.
//!
//! # Properties Tested
//!
//! - Property 1: Version ordering is a total order
//! - Property 2: Signed artifacts verify, tampered artifacts do not
//! - Property 3: Skip window is stable until it expires
//! - Property 4: Channel isolation

#![cfg(test)]

use std::cmp::Ordering;
use std::io::Cursor;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::Duration;
use proptest::prelude::*;
use sha2::{Digest, Sha256};

use crate::config::MemoryConfigStore;
use crate::crypto::{public_key_for, CryptoSigner, Ed25519Signer};
use crate::manifest::parse_items;
use crate::policy::{FixedClock, UpdatePolicy};
use crate::trust::TrustStore;
use crate::verify::{DeclaredSignature, HashAlgorithm, VerificationRequest, Verifier};
use crate::version::{compare_str, Version};

// =============================================================================
// Generators
// =============================================================================

/// Generate a version string from the characters dpkg cares about.
fn arb_version() -> impl Strategy<Value = String> {
    prop::string::string_regex("([0-9]{1,2}:)?[0-9]{1,3}(\\.[0-9a-z~+]{1,4}){0,3}(-[0-9a-z.~]{1,3})?")
        .unwrap()
}

/// Generate a random Ed25519 secret seed.
fn arb_seed() -> impl Strategy<Value = [u8; 32]> {
    prop::array::uniform32(any::<u8>())
}

/// Generate random artifact content (1 byte to 200KB, crossing chunk bounds).
fn arb_artifact_content() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 1..200_000)
}

/// Generate a channel name, including the release aliases.
fn arb_channel() -> impl Strategy<Value = String> {
    prop_oneof![
        Just(String::new()),
        Just("release".to_string()),
        Just("beta".to_string()),
        Just("nightly".to_string()),
    ]
}

// =============================================================================
// Helper Functions
// =============================================================================

fn signed_request(content: &[u8], seed: &[u8; 32]) -> (TrustStore, VerificationRequest) {
    let mut store = TrustStore::new();
    store
        .register_key(&STANDARD.encode(public_key_for(seed)), 1)
        .unwrap();

    let signature = Ed25519Signer.sign(content, seed);
    let request = VerificationRequest {
        declared_length: Some(content.len() as u64),
        declared_hash: Some((HashAlgorithm::Sha256, hex::encode(Sha256::digest(content)))),
        signature: Some(DeclaredSignature {
            key_version: "1".to_string(),
            signature: STANDARD.encode(signature),
        }),
        ..VerificationRequest::default()
    };
    (store, request)
}

fn channel_feed(channels: &[String]) -> String {
    let mut doc = String::from("<rss>");
    for (i, channel) in channels.iter().enumerate() {
        doc.push_str(&format!(
            "<channel name=\"{channel}\"><item><title>{i}</title></item></channel>"
        ));
    }
    doc.push_str("</rss>");
    doc
}

// =============================================================================
// Property 1: Version ordering is a total order
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_version_compare_reflexive(v in arb_version()) {
        prop_assert_eq!(compare_str(&v, &v), Ordering::Equal);
    }

    #[test]
    fn prop_version_compare_antisymmetric(a in arb_version(), b in arb_version()) {
        prop_assert_eq!(compare_str(&a, &b), compare_str(&b, &a).reverse());
    }

    #[test]
    fn prop_version_compare_transitive(
        a in arb_version(),
        b in arb_version(),
        c in arb_version(),
    ) {
        let (a, b, c) = (Version::parse(&a), Version::parse(&b), Version::parse(&c));
        if a <= b && b <= c {
            prop_assert!(a <= c);
        }
    }

    #[test]
    fn prop_tilde_sorts_before_release(base in "[0-9]{1,3}(\\.[0-9]{1,3}){0,2}", tag in "[a-z]{1,4}") {
        let pre = format!("{}~{}", base, tag);
        prop_assert_eq!(compare_str(&pre, &base), Ordering::Less);
    }

    #[test]
    fn prop_numeric_components_compare_numerically(major in 0u32..1000, minor in 0u32..1000) {
        let lower = format!("{}.{}", major, minor);
        let higher = format!("{}.{}", major, minor + 1);
        prop_assert_eq!(compare_str(&lower, &higher), Ordering::Less);
    }
}

// =============================================================================
// Property 2: Signed artifacts verify, tampered artifacts do not
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_signed_artifact_verifies(content in arb_artifact_content(), seed in arb_seed()) {
        let (store, request) = signed_request(&content, &seed);
        let verifier = Verifier::new(Arc::new(store));

        let result = verifier.verify(Cursor::new(&content), &request).unwrap();
        prop_assert!(result.is_trusted(), "result: {:?}", result);
        prop_assert_eq!(result.signature_ok, Some(true));
    }

    #[test]
    fn prop_tampered_artifact_rejected(
        content in arb_artifact_content(),
        seed in arb_seed(),
        flip in any::<prop::sample::Index>(),
    ) {
        let (store, request) = signed_request(&content, &seed);
        let verifier = Verifier::new(Arc::new(store));

        let mut tampered = content.clone();
        let at = flip.index(tampered.len());
        tampered[at] ^= 0x01;

        let result = verifier.verify(Cursor::new(&tampered), &request).unwrap();
        prop_assert!(!result.is_trusted());
        prop_assert!(!result.hash_ok);
        prop_assert_eq!(result.signature_ok, Some(false));
    }

    #[test]
    fn prop_wrong_key_rejected(
        content in arb_artifact_content(),
        seed in arb_seed(),
        other in arb_seed(),
    ) {
        prop_assume!(public_key_for(&seed) != public_key_for(&other));
        let (_, mut request) = signed_request(&content, &seed);
        request.declared_hash = None;
        let (store, _) = signed_request(&content, &other);
        let verifier = Verifier::new(Arc::new(store));

        let result = verifier.verify(Cursor::new(&content), &request).unwrap();
        prop_assert_eq!(result.signature_ok, Some(false));
    }
}

// =============================================================================
// Property 3: Skip window is stable until it expires
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_skip_stable_within_window(
        version in arb_version(),
        days in 1i32..=180,
        elapsed_secs in 0i64..86_400,
    ) {
        let clock = Arc::new(FixedClock::at(1_700_000_000));
        let policy = UpdatePolicy::new(Arc::new(MemoryConfigStore::new()), clock.clone());
        policy.set_skip_interval(days).unwrap();
        policy.skip(&version).unwrap();

        let inside = Duration::days(days as i64 - 1) + Duration::seconds(elapsed_secs);
        clock.advance(inside);
        prop_assert!(policy.is_skipped(&version).unwrap());
        prop_assert!(policy.is_skipped(&version).unwrap());

        clock.advance(Duration::days(1));
        prop_assert!(!policy.is_skipped(&version).unwrap());
        prop_assert_eq!(policy.state().skip_version, None);
    }

    #[test]
    fn prop_skip_applies_to_one_version(a in arb_version(), b in arb_version()) {
        prop_assume!(a.trim() != b.trim());
        let policy = UpdatePolicy::new(
            Arc::new(MemoryConfigStore::new()),
            Arc::new(FixedClock::at(1_700_000_000)),
        );
        policy.skip(&a).unwrap();
        prop_assert!(!policy.is_skipped(&b).unwrap());
    }
}

// =============================================================================
// Property 4: Channel isolation
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_items_never_leak_across_channels(
        channels in prop::collection::vec(arb_channel(), 1..8),
        wanted in arb_channel(),
    ) {
        let items = parse_items(&channel_feed(&channels), &wanted).unwrap();
        for item in &items {
            prop_assert!(crate::manifest::channel_matches(&item.channel, &wanted));
        }

        // Only the first matching container is read.
        let first = channels
            .iter()
            .position(|c| crate::manifest::channel_matches(c, &wanted));
        match first {
            Some(index) => {
                prop_assert_eq!(items.len(), 1);
                prop_assert_eq!(&items[0].title, &index.to_string());
            }
            None => prop_assert!(items.is_empty()),
        }
    }
}
