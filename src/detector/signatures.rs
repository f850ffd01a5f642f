//! Static tables the detector pipeline tests observations against: bait
//! filenames, known file-header magic bytes, and extensions excluded from
//! entropy sampling because they are natively high-entropy.

/// Bait (canary) files deployed at startup with plausible content. Any
/// modification or deletion is confirmed-malicious (step 1 of the pipeline).
pub const BAIT_FILES: &[&str] = &[
    "!000_admin_passwords.txt",
    "~system_config_backup.ini",
    "zzz_do_not_delete.dat",
];

pub const BAIT_CONTENT: &str = "-- do not modify or remove this file --\n";

/// Known magic-byte headers, keyed by lowercase extension (without the dot).
pub const MAGIC_HEADERS: &[(&str, &[u8])] = &[
    ("pdf", b"%PDF"),
    ("png", b"\x89PNG"),
    ("zip", b"PK\x03\x04"),
    ("jpg", b"\xFF\xD8\xFF"),
    ("rar", b"Rar!\x1A\x07"),
    ("gz", b"\x1F\x8B"),
];

pub fn magic_header_for(extension: &str) -> Option<&'static [u8]> {
    MAGIC_HEADERS
        .iter()
        .find(|(ext, _)| ext.eq_ignore_ascii_case(extension))
        .map(|(_, magic)| *magic)
}

/// Extensions excluded from entropy sampling: natively high-entropy formats
/// (compressed media, already-compressed archives) whose entropy is
/// indistinguishable from ciphertext at rest.
pub const ENTROPY_EXCLUDED_EXTENSIONS: &[&str] = &[
    "jpeg", "gif", "bmp", "mp4", "mp3", "avi", "mov", "7z", "tar",
];

pub fn is_entropy_excluded(extension: &str) -> bool {
    ENTROPY_EXCLUDED_EXTENSIONS
        .iter()
        .any(|ext| ext.eq_ignore_ascii_case(extension))
}

pub fn is_bait_file(path: &std::path::Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|name| BAIT_FILES.contains(&name))
        .unwrap_or(false)
}
