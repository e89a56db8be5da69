use std::path::{Path, PathBuf};
use std::time::Duration;

pub const TABLE_EXTENSION: &str = "csv";

pub fn sanitize_filename(input: &str) -> String {
    input
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect::<String>()
        .trim()
        .to_string()
}

/// File name of the table harvested for one `{location, service}` pair.
pub fn location_table_name(location: &str, service: &str) -> String {
    let location = location.split_whitespace().collect::<Vec<_>>().join("_");
    format!(
        "{}_{}.{TABLE_EXTENSION}",
        sanitize_filename(&location),
        sanitize_filename(service.trim())
    )
}

/// `data/phuket_spa.csv` -> `data/phuket_spa_updated.csv`
pub fn updated_table_path(table: &Path, suffix: &str) -> PathBuf {
    let stem = table
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let extension = table
        .extension()
        .map(|e| e.to_string_lossy().into_owned())
        .unwrap_or_else(|| TABLE_EXTENSION.to_string());
    table.with_file_name(format!("{stem}{suffix}.{extension}"))
}

pub fn is_updated_table(table: &Path, suffix: &str) -> bool {
    table
        .file_stem()
        .map(|s| s.to_string_lossy().ends_with(suffix))
        .unwrap_or(false)
}

pub fn format_duration(duration: Duration) -> String {
    let total_seconds = duration.as_secs();
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;
    let millis = duration.subsec_millis();

    if hours > 0 {
        format!("{hours}h {minutes}m {seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else if seconds > 0 {
        format!("{}.{}s", seconds, millis / 100)
    } else {
        format!("{millis}ms")
    }
}

/// Split a comma-separated location list, dropping empty entries.
pub fn parse_location_list(input: &str) -> Vec<String> {
    input
        .split(',')
        .map(str::trim)
        .filter(|location| !location.is_empty())
        .map(str::to_string)
        .collect()
}
