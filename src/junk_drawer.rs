use std::io::Write;
use std::path::Path;

use tempfile::NamedTempFile;

/// Returns the extension of `filename` lowercased and with its leading dot, e.g. ".dcm".
/// The comparison against recognized formats is case-insensitive, so we normalize here once.
pub fn lowercase_extension(filename: &str) -> Option<String> {
    Path::new(filename)
        .extension()
        .map(|ext| format!(".{}", ext.to_string_lossy().to_lowercase()))
}

/// Rounds to the given number of decimal places, e.g. confidences are reported to 4.
pub fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

/// Writes an upload to a temporary file for decoders that only read from disk.
/// The file is deleted when the returned handle is dropped, so every exit path
/// (including `?` returns and panics unwinding through the caller) cleans it up.
pub fn stage_to_temp_file(bytes: &[u8], suffix: &str) -> std::io::Result<NamedTempFile> {
    let mut staged = tempfile::Builder::new()
        .prefix("nodule-viz-upload-")
        .suffix(suffix)
        .tempfile()?;
    staged.write_all(bytes)?;
    staged.flush()?;
    Ok(staged)
}
