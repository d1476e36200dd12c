// tests/property/negotiation_test.rs

//! Property-based tests for version negotiation, on its own and over the wire

use crate::test_helpers::TestGateway;
use proptest::prelude::*;
use samgate::core::SamError;
use samgate::core::protocol::version::{SUPPORTED_VERSIONS, negotiate};
use samgate::core::protocol::Version;

fn version() -> impl Strategy<Value = Version> {
    (0u8..5, 0u8..4).prop_map(|(major, minor)| Version::new(major, minor))
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 300,
        ..ProptestConfig::default()
    })]

    #[test]
    fn test_negotiated_version_is_highest_in_range(min in version(), max in version()) {
        let min_s = min.to_string();
        let max_s = max.to_string();
        let in_range: Vec<Version> = SUPPORTED_VERSIONS
            .iter()
            .copied()
            .filter(|v| *v >= min && *v <= max)
            .collect();

        match negotiate(Some(&min_s), Some(&max_s)) {
            Ok(chosen) => {
                prop_assert!(SUPPORTED_VERSIONS.contains(&chosen));
                prop_assert!(chosen >= min && chosen <= max);
                prop_assert_eq!(Some(&chosen), in_range.iter().max());
            }
            Err(e) => {
                prop_assert_eq!(e, SamError::NoVersion);
                prop_assert!(in_range.is_empty());
            }
        }
    }

    #[test]
    fn test_missing_max_is_unbounded(min in version()) {
        let expected = SUPPORTED_VERSIONS.iter().copied().find(|v| *v >= min);
        let chosen = negotiate(Some(&min.to_string()), None).ok();
        prop_assert_eq!(chosen, expected);
    }
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 16, // Each case starts a gateway
        ..ProptestConfig::default()
    })]

    #[test]
    fn test_hello_reply_matches_negotiation(min in version(), max in version()) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let gw = TestGateway::new().await;
            let mut client = gw.connect().await;
            let reply = client
                .request(&format!("HELLO VERSION MIN={min} MAX={max}"))
                .await;

            match negotiate(Some(&min.to_string()), Some(&max.to_string())) {
                Ok(version) => {
                    assert_eq!(reply, format!("HELLO REPLY RESULT=OK VERSION={version}"));
                }
                Err(_) => {
                    assert!(reply.starts_with("HELLO REPLY RESULT=NOVERSION"), "{reply}");
                }
            }
        });
    }
}
