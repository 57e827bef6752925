#![no_main]

use libfuzzer_sys::fuzz_target;
use path_probe::packet::extension::parse_extensions;
use path_probe::packet::response::{parse_icmp4, parse_icmp6};

fuzz_target!(|data: &[u8]| {
    parse_icmp4(data);
    parse_icmp6(data);
    parse_extensions(data);
});
