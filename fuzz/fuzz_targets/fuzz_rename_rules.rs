//! Fuzz target for rename rule parsing.

#![no_main]

use index_sync::document::RenameRule;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|input: &str| {
    if let Ok(rules) = RenameRule::parse_list(input) {
        for rule in rules {
            assert!(!rule.from.is_empty());
            assert!(!rule.to.is_empty());
            assert!(!rule.from.contains(','));
        }
    }
});
