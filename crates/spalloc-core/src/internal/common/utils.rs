use chrono::Utc;

/// Wall-clock time as fractional Unix seconds.
///
/// Job timestamps are persisted and reported to clients, so they use wall
/// time rather than `Instant`.
pub fn now() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

pub fn format_comma_delimited<I: IntoIterator<Item = T>, T: ToString>(iter: I) -> String {
    iter.into_iter()
        .map(|x| x.to_string())
        .collect::<Vec<_>>()
        .join(",")
}
