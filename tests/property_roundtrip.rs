//! Property-based checks for the property-list wire model.
//!
//! The parser and the verbatim snapshot are the two halves of the byte-exact
//! round-trip contract, so they get randomized coverage: any well-formed
//! list must parse, create, and query back bit-for-bit; common malformations
//! must be rejected with `InvalidProperty`.

use proptest::prelude::*;

use semaq::{
    Context, SemError, Semaphore, SemaphoreQuery, HANDLE_TYPE_SYNC_FD, PROP_DEVICE_HANDLE_LIST,
    PROP_EXPORT_HANDLE_TYPES, PROP_LIST_END, PROP_TYPE, TYPE_BINARY,
};

/// A well-formed property list over a context with `device_count` devices:
/// mandatory type pair, optional device sublist (any subset, any order),
/// optional export sublist.
fn assemble(
    device_words: &[u64],
    with_device_list: bool,
    with_export: bool,
) -> Vec<u64> {
    let mut words = vec![PROP_TYPE, TYPE_BINARY];
    if with_device_list {
        words.push(PROP_DEVICE_HANDLE_LIST);
        words.extend_from_slice(device_words);
        words.push(PROP_LIST_END);
    }
    if with_export {
        words.push(PROP_EXPORT_HANDLE_TYPES);
        words.push(HANDLE_TYPE_SYNC_FD);
        words.push(PROP_LIST_END);
    }
    words.push(PROP_LIST_END);
    words
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Any well-formed list round-trips byte-for-byte through creation and
    /// the Properties query, and the device list query mirrors the sublist.
    #[test]
    fn well_formed_lists_round_trip(
        device_count in 1usize..4,
        subset_mask in 0usize..16,
        with_device_list in any::<bool>(),
        with_export in any::<bool>(),
    ) {
        let ctx = Context::new(device_count);
        let devices: Vec<u64> = ctx
            .devices()
            .iter()
            .enumerate()
            .filter(|(i, _)| subset_mask & (1 << i) != 0)
            .map(|(_, d)| d.0)
            .collect();

        let words = assemble(&devices, with_device_list, with_export);
        let sem = Semaphore::create(&ctx, &words).unwrap();

        let size = sem.query_size(SemaphoreQuery::Properties).unwrap();
        prop_assert_eq!(size, words.len() * 8);
        let mut buf = vec![0u8; size];
        sem.query_into(SemaphoreQuery::Properties, &mut buf).unwrap();
        let expected: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        prop_assert_eq!(buf, expected);

        let dev_size = sem.query_size(SemaphoreQuery::DeviceHandleList).unwrap();
        let expected_devices = if with_device_list { devices.len() } else { 0 };
        prop_assert_eq!(dev_size, expected_devices * 8);

        prop_assert_eq!(sem.payload().unwrap(), 0);
        prop_assert_eq!(sem.reference_count(), 1);
    }

    /// Unknown keys are rejected wherever they appear at the top level.
    #[test]
    fn unknown_keys_are_rejected(key in 0x20u64..0x1_0000, value in any::<u64>()) {
        let ctx = Context::new(1);
        let words = [PROP_TYPE, TYPE_BINARY, key, value, PROP_LIST_END];
        let err = Semaphore::create(&ctx, &words).unwrap_err();
        prop_assert!(
            matches!(err, SemError::InvalidProperty { .. }),
            "expected SemError::InvalidProperty, got {:?}",
            err
        );
    }

    /// Truncating a well-formed list anywhere before its terminator makes
    /// it malformed.
    #[test]
    fn truncated_lists_are_rejected(cut in 0usize..6) {
        let ctx = Context::new(2);
        let dev = ctx.devices()[0].0;
        let words = [
            PROP_TYPE,
            TYPE_BINARY,
            PROP_DEVICE_HANDLE_LIST,
            dev,
            PROP_LIST_END,
            PROP_LIST_END,
        ];
        let err = Semaphore::create(&ctx, &words[..cut]).unwrap_err();
        prop_assert!(
            matches!(err, SemError::InvalidProperty { .. }),
            "expected SemError::InvalidProperty, got {:?}",
            err
        );
    }

    /// Query buffers of any wrong size yield SizeMismatch, never a partial
    /// write.
    #[test]
    fn wrong_query_buffer_sizes_are_rejected(len in 0usize..32) {
        let ctx = Context::new(1);
        let sem = Semaphore::create(&ctx, &[PROP_TYPE, TYPE_BINARY, PROP_LIST_END]).unwrap();
        let natural = sem.query_size(SemaphoreQuery::Payload).unwrap();
        prop_assume!(len != natural);

        let mut buf = vec![0u8; len];
        let err = sem.query_into(SemaphoreQuery::Payload, &mut buf).unwrap_err();
        prop_assert_eq!(
            err,
            SemError::SizeMismatch { expected: natural, got: len }
        );
    }
}
