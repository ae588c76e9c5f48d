//! Station topic naming conventions shared by producers and consumers.

const STATION_SUFFIX: &str = ".final";

/// Sanitizes a station name into its broker-internal form: lowercase, with
/// periods replaced by pound signs.
pub(crate) fn internal_name(station: &str) -> String {
    station.to_lowercase().replace('.', "#")
}

/// Stream name for one partition of a station, e.g. `orders$3`. This is the
/// name the broker's consumer-metadata calls operate on.
pub(crate) fn partition_stream(station: &str, partition: u32) -> String {
    format!("{}${}", internal_name(station), partition)
}

/// Fully qualified publish/subscribe topic for one partition.
pub(crate) fn partition_topic(station: &str, partition: u32) -> String {
    format!("{}{}", partition_stream(station, partition), STATION_SUFFIX)
}
