#![no_main]

use libfuzzer_sys::fuzz_target;
use rookline_client::protocol::{GameUpdate, ServerFrame};

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };

    // Push bodies arrive either as raw text or wrapped in a channel frame.
    let _ = GameUpdate::from_json(text);

    if let Ok(ServerFrame::Message { body, .. }) = serde_json::from_str::<ServerFrame>(text) {
        if let Ok(update) = GameUpdate::from_value(body) {
            let _ = update.kind();
            let _ = update.snapshot();
        }
    }
});
