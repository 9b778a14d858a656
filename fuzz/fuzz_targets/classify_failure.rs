#![no_main]

use conductor::classify::{RawFailure, aggregate, classify};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: (String, Option<u16>, Option<i32>)| {
    let (message, http_status, exit_code) = data;
    let raw = RawFailure {
        message,
        exit_code,
        http_status,
        retry_after: None,
    };

    let classified = classify(&raw);
    assert!(!classified.signature.is_empty());

    // Aggregation of one element keeps its category.
    let agg = aggregate(&[classified.clone()]).unwrap();
    assert_eq!(agg.category, classified.category);
});
