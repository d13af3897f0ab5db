//! Output file naming.
//!
//! Titles come straight from the remote platform and may contain anything,
//! so they are cleaned before they become part of a path.

/// Characters rejected by at least one supported filesystem.
const FORBIDDEN_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Device names Windows refuses as a file stem.
const RESERVED_STEMS: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Longest stem we produce, in bytes. Leaves room for an extension and a
/// disambiguating suffix under the common 255-byte name limit.
const MAX_STEM_BYTES: usize = 200;

/// Turn arbitrary text into a single path component.
///
/// Runs of forbidden or control characters become one `_`, surrounding
/// spaces and dots are trimmed, reserved device names get a `_` prefix and
/// the result is cut to [`MAX_STEM_BYTES`] on a char boundary. Never
/// returns an empty string.
pub fn sanitize_filename(input: &str) -> String {
    let mut cleaned = String::with_capacity(input.len());
    let mut replaced = false;
    for c in input.chars() {
        if c.is_control() || FORBIDDEN_CHARS.contains(&c) {
            if !replaced {
                cleaned.push('_');
                replaced = true;
            }
        } else {
            cleaned.push(c);
            replaced = false;
        }
    }

    let mut stem = truncate_on_char_boundary(
        cleaned.trim_matches(|c| c == ' ' || c == '.'),
        MAX_STEM_BYTES,
    )
    .trim_end_matches([' ', '.'])
    .to_string();

    if stem.is_empty() {
        return "untitled".to_string();
    }

    let upper = stem.to_ascii_uppercase();
    let base = upper.split('.').next().unwrap_or_default();
    if RESERVED_STEMS.contains(&base) {
        stem.insert(0, '_');
    }
    stem
}

fn truncate_on_char_boundary(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// File name of a finished job: `<title> [<bvid>-<cid>].mp4`.
///
/// The identifier suffix keeps two jobs with the same title from writing to
/// the same path.
pub fn output_file_name(title: &str, bvid: &str, cid: i64) -> String {
    let title = if title.trim().is_empty() { bvid } else { title };
    format!(
        "{} [{}-{}].mp4",
        sanitize_filename(title),
        sanitize_filename(bvid),
        cid
    )
}
