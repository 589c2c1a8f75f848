#![forbid(unsafe_code)]

//! Filename hygiene for staged artifacts and the `Content-Disposition` header
//! that hands them back to the browser.

/// Characters that are illegal in a filename on at least one platform we
/// serve, plus line breaks which would corrupt response headers.
const ILLEGAL_FILENAME_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*', '\n', '\r'];

/// Replaces every illegal character with `_`. Idempotent because `_` is never
/// illegal itself.
pub fn sanitize_filename(name: &str) -> String {
    name.chars()
        .map(|c| {
            if ILLEGAL_FILENAME_CHARS.contains(&c) {
                '_'
            } else {
                c
            }
        })
        .collect()
}

/// Builds an `attachment` disposition for an already sanitized filename.
///
/// Titles are frequently non-ASCII, which a plain quoted `filename` cannot
/// carry, so an RFC 6266 `filename*` parameter with the UTF-8 percent-encoded
/// name is appended whenever the ASCII fallback had to lose information.
pub fn content_disposition(filename: &str) -> String {
    let fallback: String = filename
        .chars()
        .map(|c| {
            if c.is_ascii_graphic() || c == ' ' {
                c
            } else {
                '_'
            }
        })
        .collect();

    if fallback == filename {
        format!("attachment; filename=\"{fallback}\"")
    } else {
        format!(
            "attachment; filename=\"{fallback}\"; filename*=UTF-8''{}",
            urlencoding::encode(filename)
        )
    }
}
