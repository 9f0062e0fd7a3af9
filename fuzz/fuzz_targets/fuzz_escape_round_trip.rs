#![no_main]

use std::collections::BTreeMap;

use libfuzzer_sys::fuzz_target;
use sm_template::{escape_format_string, format_string};

fuzz_target!(|input: (u8, &str)| {
    let (times, value) = input;
    let times = usize::from(times % 4);
    let mut text = escape_format_string(value, times);
    for _ in 0..times {
        text = format_string(&text, &BTreeMap::new()).expect("escaped text formats");
    }
    assert_eq!(text, value);
});
