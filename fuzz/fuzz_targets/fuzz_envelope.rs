//! Fuzz target for inbound frame parsing.
//!
//! Every text frame PPSSPP sends goes through `Envelope::parse` and, for the
//! state caches, `DebuggerEvent::from_envelope`. Neither may panic.

#![no_main]

use libfuzzer_sys::fuzz_target;
use ppdbg_client::{DebuggerEvent, Envelope};

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    let Ok(envelope) = Envelope::parse(text) else {
        return;
    };

    let _ = envelope.message();
    let _ = envelope.level();
    let _ = envelope.is_error();

    let event = DebuggerEvent::from_envelope(&envelope);
    let _ = event.pc();
    let _ = event.game_id();

    // Whatever parsed must serialize back and parse to the same envelope.
    let json = envelope.to_json().expect("parsed envelope serializes");
    assert_eq!(Envelope::parse(&json).ok().as_ref(), Some(&envelope));
});
