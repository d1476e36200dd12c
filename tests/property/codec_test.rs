// tests/property/codec_test.rs

//! Property-based tests for the line codec and reply rendering

use bytes::BytesMut;
use proptest::prelude::*;
use samgate::core::protocol::{CommandLine, Reply, SamCodec};
use std::collections::BTreeMap;
use tokio_util::codec::Decoder;

fn decode_all(chunks: &[&[u8]]) -> Vec<CommandLine> {
    let mut codec = SamCodec;
    let mut buf = BytesMut::new();
    let mut lines = Vec::new();
    for chunk in chunks {
        buf.extend_from_slice(chunk);
        while let Some(line) = codec.decode(&mut buf).unwrap() {
            lines.push(line);
        }
    }
    lines
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 200,
        ..ProptestConfig::default()
    })]

    #[test]
    fn test_rendered_reply_parses_back(
        fields in prop::collection::btree_map("[A-Z_]{1,12}", "[ -~]{0,40}", 0..8)
    ) {
        let mut reply = Reply::new("SESSION STATUS");
        for (key, value) in &fields {
            reply = reply.field(key.as_str(), value);
        }
        let rendered = reply.to_string();
        let parsed = CommandLine::parse(&rendered).unwrap();

        prop_assert_eq!(parsed.domain.as_str(), "SESSION");
        prop_assert_eq!(parsed.opcode.as_deref(), Some("STATUS"));
        let round_trip: BTreeMap<String, String> = parsed
            .props
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        prop_assert_eq!(round_trip, fields);
    }

    #[test]
    fn test_reply_is_always_one_line(value in "\\PC{0,40}[\r\n]\\PC{0,40}") {
        let line = Reply::new("STREAM STATUS").field("MESSAGE", &value).to_line();
        prop_assert_eq!(line.matches('\n').count(), 1);
        prop_assert!(line.ends_with('\n'));
        prop_assert!(!line.contains('\r'));
    }

    #[test]
    fn test_decoding_ignores_chunk_boundaries(
        ids in prop::collection::vec(0u32..100_000, 1..10),
        split in any::<prop::sample::Index>(),
    ) {
        let mut stream = Vec::new();
        for id in &ids {
            stream.extend_from_slice(format!("STREAM CLOSE ID={id}\r\n").as_bytes());
        }
        let at = split.index(stream.len() + 1);
        let (head, tail) = stream.split_at(at);

        let whole = decode_all(&[&stream]);
        let pieces = decode_all(&[head, tail]);
        prop_assert_eq!(&whole, &pieces);
        prop_assert_eq!(whole.len(), ids.len());
        for (line, id) in whole.iter().zip(&ids) {
            let expected = id.to_string();
            prop_assert_eq!(line.props.get("ID"), Some(expected.as_str()));
        }
    }

    #[test]
    fn test_domain_and_opcode_are_case_insensitive(
        domain in prop::sample::select(vec!["session", "Stream", "NAMING", "sEsSiOn", "dest"]),
        opcode in prop::sample::select(vec!["create", "Lookup", "CLOSE", "gEnErAtE"]),
    ) {
        let parsed = CommandLine::parse(&format!("{domain} {opcode} ID=x")).unwrap();
        prop_assert_eq!(parsed.domain, domain.to_ascii_uppercase());
        prop_assert_eq!(parsed.opcode, Some(opcode.to_ascii_uppercase()));
        prop_assert_eq!(parsed.props.get("ID"), Some("x"));
    }
}
