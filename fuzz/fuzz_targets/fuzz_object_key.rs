#![no_main]

use libfuzzer_sys::fuzz_target;

use babycare_predict::storage::object_key;

/// The derived key is a suffix of the reference and never contains a '/'.
fuzz_target!(|data: &[u8]| {
    let Ok(reference) = std::str::from_utf8(data) else {
        return;
    };
    let key = object_key(reference);
    assert!(reference.ends_with(key));
    assert!(!key.contains('/'));
    if !reference.contains('/') {
        assert_eq!(key, reference);
    }
});
