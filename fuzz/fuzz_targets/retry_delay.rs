#![no_main]

use std::time::Duration;

use conductor_retry::{RetryBudget, hinted_delay, next_delay, transient_delay};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: (u32, u64, u8)| {
    let (attempt, hint_ms, which) = data;
    let attempt = attempt % 1000;

    let delay = transient_delay(attempt);
    assert!(delay <= Duration::from_secs(60));

    let budget = match which % 4 {
        0 => RetryBudget::transient(),
        1 => RetryBudget::retriable(),
        2 => RetryBudget::rate_limit(),
        _ => RetryBudget::none(),
    };

    let hint = Duration::from_millis(hint_ms % 1_000_000);
    let hinted = hinted_delay(&budget, attempt, Some(hint));
    assert!(hinted <= budget.delay_cap.max(hint));

    let _ = next_delay(&budget, attempt);
});
