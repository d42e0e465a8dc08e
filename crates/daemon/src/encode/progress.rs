//! Parser for the encoder's `-progress` protocol
//!
//! With `-progress pipe:1` the encoder writes blocks of `key=value` lines to
//! stdout, each block closed by `progress=continue` or `progress=end`.

/// A single recognised progress field.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressField {
    /// Encoded output time in seconds
    OutTime(f64),
    Frame(u64),
    Fps(f64),
    /// Speed relative to realtime (`1.5x` -> 1.5)
    Speed(f64),
    /// Bytes written so far
    TotalSize(u64),
    /// End of a block; `true` for the final block
    Progress { end: bool },
}

/// Parse one line of the progress protocol.
///
/// Returns `None` for unknown keys, `N/A` values and anything that is not a
/// `key=value` pair.
pub fn parse_progress_line(line: &str) -> Option<ProgressField> {
    let (key, value) = line.trim().split_once('=')?;
    let value = value.trim();
    if value.eq_ignore_ascii_case("n/a") {
        return None;
    }
    match key.trim() {
        "out_time" => parse_timestamp(value).map(ProgressField::OutTime),
        // Despite the name, out_time_ms carries microseconds
        "out_time_us" | "out_time_ms" => value
            .parse::<i64>()
            .ok()
            .filter(|us| *us >= 0)
            .map(|us| ProgressField::OutTime(us as f64 / 1_000_000.0)),
        "frame" => value.parse().ok().map(ProgressField::Frame),
        "fps" => value.parse().ok().map(ProgressField::Fps),
        "speed" => value
            .trim_end_matches('x')
            .trim()
            .parse()
            .ok()
            .map(ProgressField::Speed),
        "total_size" => value.parse().ok().map(ProgressField::TotalSize),
        "progress" => Some(ProgressField::Progress { end: value == "end" }),
        _ => None,
    }
}

/// Parse `HH:MM:SS.ffffff` into seconds.
///
/// Negative timestamps, which the encoder prints before the first frame, are
/// rejected.
pub fn parse_timestamp(value: &str) -> Option<f64> {
    let value = value.trim();
    if value.starts_with('-') {
        return None;
    }
    let mut parts = value.split(':');
    let hours: f64 = parts.next()?.parse().ok()?;
    let minutes: f64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() || minutes >= 60.0 || seconds >= 60.0 {
        return None;
    }
    let total = hours * 3600.0 + minutes * 60.0 + seconds;
    total.is_finite().then_some(total)
}

/// Extract the source duration from the encoder's input banner
/// (`  Duration: 00:42:10.52, start: 0.000000, bitrate: ...`).
pub fn parse_duration_banner(line: &str) -> Option<f64> {
    let rest = line.trim_start().strip_prefix("Duration:")?;
    let stamp = rest.trim().split(',').next()?;
    parse_timestamp(stamp).filter(|d| *d > 0.0)
}
