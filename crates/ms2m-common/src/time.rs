//! ---
//! ms2m_section: "01-core-functionality"
//! ms2m_subsection: "module"
//! ms2m_type: "source"
//! ms2m_scope: "code"
//! ms2m_description: "Shared primitives and utilities for the migration runtime."
//! ms2m_version: "v0.0.0-prealpha"
//! ms2m_owner: "tbd"
//! ---
use std::time::Duration;

/// Render a duration in the compact form stored in phase timing records,
/// e.g. `850ms`, `12.4s`, `1m30s`, `1h2m3s`. Values of one second or more are
/// rounded to a tenth of a second.
pub fn format_duration(duration: Duration) -> String {
    let millis = duration.as_millis();
    if millis < 1_000 {
        return format!("{millis}ms");
    }
    let tenths = (millis + 50) / 100;
    let hours = tenths / 36_000;
    let minutes = (tenths % 36_000) / 600;
    let rem = tenths % 600;
    let seconds = if rem % 10 == 0 {
        format!("{}s", rem / 10)
    } else {
        format!("{}.{}s", rem / 10, rem % 10)
    };
    match (hours, minutes) {
        (0, 0) => seconds,
        (0, m) => format!("{m}m{seconds}"),
        (h, m) => format!("{h}h{m}m{seconds}"),
    }
}
