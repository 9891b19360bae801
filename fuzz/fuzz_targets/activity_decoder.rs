#![no_main]

use gputrace::activity::convert_record;
use gputrace::collector::InMemoryCollector;
use gputrace::driver::codec;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Arbitrary bytes as a filled activity buffer; decoding must never panic
    let collector = InMemoryCollector::default();
    let mut cursor = 0;
    while let Ok(Some(record)) = codec::next_record(data, &mut cursor) {
        assert!(cursor <= data.len());
        let _ = convert_record(&record, &collector);
    }
});
