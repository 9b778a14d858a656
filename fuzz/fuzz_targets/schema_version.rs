#![no_main]

use conductor::schema::{parse_schema_version, validate_receipt_version};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &str| {
    let _ = parse_schema_version(data);
    let _ = validate_receipt_version(data);
});
