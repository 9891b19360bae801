//! Property-based tests for the tracer's data structures
//!
//! Covers:
//! 1. Callback event caps and drop accounting
//! 2. Append-only buffer ordering and block layout
//! 3. Annotation string interning
//! 4. Activity buffer decoding on arbitrary bytes
//! 5. Memcpy size decoding

use gputrace::append_buffer::{AppendOnlyBuffer, MIN_BLOCK_SIZE};
use gputrace::collector::CollectorOptions;
use gputrace::driver::codec;
use gputrace::driver::records::{ActivityRecord, KernelRecord};
use gputrace::driver::{DriverApi, DriverCallArgs, MemoryType};
use gputrace::thread_buffer::{CallbackEventBuffer, EventLimits};
use proptest::prelude::*;
use std::sync::Arc;

fn limits(max_events: usize, max_strings: usize) -> Arc<EventLimits> {
    Arc::new(EventLimits::new(&CollectorOptions {
        max_callback_api_events: max_events,
        max_annotation_strings: max_strings,
        ..Default::default()
    }))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_cap_splits_calls_into_kept_and_dropped(cap in 0usize..64, calls in 0usize..128) {
        let mut buffer = CallbackEventBuffer::new(limits(cap, 0));
        for id in 0..calls {
            buffer.add(0, u32::try_from(id).unwrap(), "", "");
        }

        let expected_kept = if cap == 0 { calls } else { calls.min(cap) };
        prop_assert_eq!(buffer.len(), expected_kept);
        prop_assert_eq!(buffer.len() + buffer.num_dropped_events(), calls);
    }

    #[test]
    fn prop_cap_holds_across_buffers(cap in 1usize..32, per_buffer in prop::collection::vec(0usize..20, 1..6)) {
        let shared = limits(cap, 0);
        let mut buffers: Vec<CallbackEventBuffer> =
            per_buffer.iter().map(|_| CallbackEventBuffer::new(shared.clone())).collect();
        for (buffer, calls) in buffers.iter_mut().zip(&per_buffer) {
            for id in 0..*calls {
                buffer.add(0, u32::try_from(id).unwrap(), "", "");
            }
        }

        let calls: usize = per_buffer.iter().sum();
        let kept: usize = buffers.iter().map(CallbackEventBuffer::len).sum();
        prop_assert!(kept <= cap);
        prop_assert_eq!(kept, calls.min(cap));
        prop_assert_eq!(shared.recorded(), kept);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(50))]

    #[test]
    fn prop_append_buffer_preserves_order(values in prop::collection::vec(any::<u32>(), 0..5000)) {
        let mut buffer = AppendOnlyBuffer::with_block_size(MIN_BLOCK_SIZE);
        for value in &values {
            buffer.append(*value);
        }

        prop_assert_eq!(buffer.len(), values.len());
        let collected: Vec<u32> = buffer.iter().copied().collect();
        prop_assert_eq!(&collected, &values);
        prop_assert!(buffer.blocks().all(|block| block.len() <= buffer.block_size()));
        prop_assert_eq!(buffer.last(), values.last());
    }

    #[test]
    fn prop_annotations_interned_once(names in prop::collection::vec("[a-z]{1,6}", 1..40)) {
        let mut buffer = CallbackEventBuffer::new(limits(0, 0));
        for (id, name) in names.iter().enumerate() {
            buffer.add(0, u32::try_from(id).unwrap(), name, name);
        }

        let distinct: std::collections::HashSet<&String> = names.iter().collect();
        prop_assert_eq!(buffer.num_annotation_strings(), distinct.len());
        prop_assert_eq!(buffer.num_range_strings(), distinct.len());

        // Entries with the same text share one allocation
        let entries: Vec<_> = buffer.entries().collect();
        for a in &entries {
            for b in &entries {
                if let (Some(x), Some(y)) = (&a.annotation, &b.annotation) {
                    if x == y {
                        prop_assert!(Arc::ptr_eq(x, y));
                    }
                }
            }
        }
    }

    #[test]
    fn prop_string_cap_never_exceeded(max_strings in 1usize..8, names in prop::collection::vec("[a-z]{1,4}", 1..40)) {
        let mut buffer = CallbackEventBuffer::new(limits(0, max_strings));
        for (id, name) in names.iter().enumerate() {
            buffer.add(0, u32::try_from(id).unwrap(), name, "");
        }
        prop_assert!(buffer.num_annotation_strings() <= max_strings);
        prop_assert_eq!(buffer.len(), names.len());
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn prop_decoder_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..512)) {
        let mut cursor = 0;
        let mut steps = 0;
        while let Ok(Some(_)) = codec::next_record(&bytes, &mut cursor) {
            steps += 1;
            prop_assert!(cursor <= bytes.len());
            prop_assert!(steps <= bytes.len());
        }
    }

    #[test]
    fn prop_truncated_buffer_yields_prefix(count in 1usize..10, cut in 0usize..64) {
        let records: Vec<ActivityRecord> = (0..count)
            .map(|i| ActivityRecord::Kernel(KernelRecord {
                name: format!("k{i}"),
                correlation_id: u32::try_from(i).unwrap(),
                ..Default::default()
            }))
            .collect();
        let bytes = codec::encode_records(&records).unwrap();
        let truncated = &bytes[..bytes.len().saturating_sub(cut)];

        let mut cursor = 0;
        let mut decoded = Vec::new();
        while let Ok(Some(record)) = codec::next_record(truncated, &mut cursor) {
            decoded.push(record);
        }
        prop_assert!(decoded.len() <= records.len());
        prop_assert_eq!(&decoded[..], &records[..decoded.len()]);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_memcpy_3d_size_is_volume(width in 0u64..4096, height in 0u64..512, depth in 0u64..64) {
        let args = DriverCallArgs::Memcpy3D {
            width_in_bytes: width,
            height,
            depth,
            src_memory_type: MemoryType::Host,
            dst_memory_type: MemoryType::Device,
        };
        let decoded = gputrace::decode::decode_memcpy(Some(DriverApi::Memcpy3D), &args);
        prop_assert_eq!(decoded.num_bytes, width * height * depth);
    }
}
