use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde_json::json;

static ENABLED: AtomicBool = AtomicBool::new(false);
static SINK: Mutex<()> = Mutex::new(());

/// Turn the JSON event stream on or off.
pub fn set_events_enabled(enabled: bool) {
    ENABLED.store(enabled, Ordering::Relaxed);
}

pub fn events_enabled() -> bool {
    ENABLED.load(Ordering::Relaxed)
}

/// Emit `{ "type": ..., "path": ... }`.
pub fn event(kind: &str, path: &str) {
    if !events_enabled() {
        return;
    }
    emit(json!({ "type": kind, "path": path }));
}

/// Emit `{ "type": ..., "path": ..., "message": ... }`.
pub fn event_message(kind: &str, path: &str, message: &str) {
    if !events_enabled() {
        return;
    }
    emit(json!({ "type": kind, "path": path, "message": message }));
}

/// Emit `{ "type": ..., "path": ..., "value": ... }`.
pub fn event_value(kind: &str, path: &str, value: u64) {
    if !events_enabled() {
        return;
    }
    emit(json!({ "type": kind, "path": path, "value": value }));
}

// One locked write per record so concurrent workers never interleave lines.
fn emit(record: serde_json::Value) {
    let line = format!("{record}\n");
    let _guard = SINK.lock();
    let _ = std::io::stderr().write_all(line.as_bytes());
}
