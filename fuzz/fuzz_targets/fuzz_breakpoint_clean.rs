#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(value) = serde_json::from_slice::<serde_json::Value>(data) else {
        return;
    };

    let cleaned = ppdbg_state::clean_for_persist(&value);
    if let Some(fields) = cleaned.as_object() {
        for key in ["code", "symbol", "hits"] {
            assert!(!fields.contains_key(key));
        }
    }

    // Cleaning is idempotent.
    assert_eq!(ppdbg_state::clean_for_persist(&cleaned), cleaned);
});
