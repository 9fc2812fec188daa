//! Property-Based Tests for the Frame Codec
//!
//! # Test Properties
//!
//! 1. **Fidelity**: decode(encode(entry)) reproduces every field, with the
//!    compressed bit as the only difference
//! 2. **Robustness**: arbitrary bytes never panic the decoder
//! 3. **Length Accounting**: the returned frame length is what was appended
//! 4. **Key Uniqueness**: distinct identifiers render to distinct keys

#![cfg(test)]

use bytes::BytesMut;
use proptest::prelude::*;

use super::allocator::{KeyFormat, KeyRenderer};
use super::codec::{FrameCodec, HEADER_SIZE};
use super::compression::{CompressionConfig, PayloadCompressor};
use super::entry::{Entry, BIT_COMPRESSED};

// =============================================================================
// Property Strategies
// =============================================================================

/// Entries with caller-visible meta bits only
fn entry_strategy() -> impl Strategy<Value = Entry> {
    (
        prop::collection::vec(any::<u8>(), 0..64),
        prop_oneof![
            prop::collection::vec(any::<u8>(), 0..4096),
            // Long runs compress well
            (any::<u8>(), 1usize..8192).prop_map(|(b, n)| vec![b; n]),
        ],
        any::<u8>().prop_map(|m| m & !BIT_COMPRESSED),
        any::<u64>(),
        any::<u64>(),
    )
        .prop_map(|(key, value, meta, cas, check)| {
            Entry::new(key, value)
                .with_meta(meta)
                .with_counters(cas, check)
        })
}

fn codec_strategy() -> impl Strategy<Value = FrameCodec> {
    prop_oneof![
        Just(FrameCodec::new(PayloadCompressor::new(
            CompressionConfig::disabled()
        ))),
        (0usize..256, 1.0f64..3.0).prop_map(|(min_size_bytes, min_ratio)| {
            FrameCodec::new(PayloadCompressor::new(CompressionConfig {
                min_size_bytes,
                min_ratio,
                ..Default::default()
            }))
        }),
    ]
}

// =============================================================================
// Codec Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn prop_decode_reproduces_entry(entry in entry_strategy(), codec in codec_strategy()) {
        let mut frame = BytesMut::new();
        let len = codec.encode(&entry, &mut frame).unwrap();
        prop_assert_eq!(len, frame.len());

        let mut scratch = frame.to_vec();
        let decoded = codec.decode(&mut scratch).unwrap();
        prop_assert_eq!(decoded.key, &entry.key[..]);
        prop_assert_eq!(decoded.value, &entry.value[..]);
        prop_assert_eq!(decoded.meta & !BIT_COMPRESSED, entry.meta);
        prop_assert_eq!(decoded.cas_counter, entry.cas_counter);
        prop_assert_eq!(decoded.cas_counter_check, entry.cas_counter_check);

        if decoded.meta & BIT_COMPRESSED == 0 {
            prop_assert_eq!(len, HEADER_SIZE + entry.key.len() + entry.value.len());
        } else {
            prop_assert!(!entry.value.is_empty());
        }
    }

    #[test]
    fn prop_decode_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..512)) {
        let codec = FrameCodec::default();
        let mut scratch = bytes;
        let _ = codec.decode(&mut scratch);
    }

    #[test]
    fn prop_truncation_is_detected(entry in entry_strategy(), cut in 1usize..32) {
        let codec = FrameCodec::default();
        let mut frame = BytesMut::new();
        codec.encode(&entry, &mut frame).unwrap();

        let keep = frame.len().saturating_sub(cut);
        let mut scratch = frame[..keep].to_vec();
        prop_assert!(codec.decode(&mut scratch).is_err());
    }

    #[test]
    fn prop_rendered_keys_are_unique(a in 1u32.., b in 1u32.., binary in any::<bool>()) {
        prop_assume!(a != b);
        let format = if binary { KeyFormat::Binary } else { KeyFormat::Decimal };
        let renderer = KeyRenderer::new(format, "vlog:");
        prop_assert_ne!(renderer.render(a), renderer.render(b));
    }
}
