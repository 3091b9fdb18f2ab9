//! Content-based MIME detection. Client-declared content types and file
//! extensions are never consulted.

/// Number of leading bytes inspected when sniffing.
pub const SNIFF_LEN: usize = 3072;

const TEXT_PLAIN: &str = "text/plain; charset=utf-8";
const OCTET_STREAM: &str = "application/octet-stream";

/// Detect the MIME type of `head`, the first bytes of a file.
///
/// Binary signatures come first; content with no known signature that is
/// valid UTF-8 without NUL bytes is reported as UTF-8 text, everything else
/// as `application/octet-stream`.
pub fn detect(head: &[u8]) -> String {
    if let Some(kind) = infer::get(head) {
        return kind.mime_type().to_string();
    }
    if !head.is_empty() && !head.contains(&0) && is_utf8_prefix(head) {
        return TEXT_PLAIN.to_string();
    }
    OCTET_STREAM.to_string()
}

/// UTF-8 check that tolerates a multi-byte sequence cut off by the sniff
/// window.
fn is_utf8_prefix(head: &[u8]) -> bool {
    match std::str::from_utf8(head) {
        Ok(_) => true,
        Err(err) => err.error_len().is_none() && head.len() - err.valid_up_to() < 4,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PNG_SIGNATURE: &[u8] = b"\x89PNG\r\n\x1a\n";

    #[test]
    fn detects_png_from_signature() {
        let mut head = PNG_SIGNATURE.to_vec();
        head.extend_from_slice(b"\0\0");
        assert_eq!(detect(&head), "image/png");
    }

    #[test]
    fn detects_pdf_and_jpeg() {
        assert_eq!(detect(b"%PDF-1.7\n%\xe2\xe3\xcf\xd3"), "application/pdf");
        assert_eq!(detect(&[0xFF, 0xD8, 0xFF, 0xE0, 0, 0x10]), "image/jpeg");
    }

    #[test]
    fn plain_text_carries_charset_parameter() {
        assert_eq!(detect(b"hello, world\n"), "text/plain; charset=utf-8");
    }

    #[test]
    fn truncated_multibyte_sequence_is_still_text() {
        let mut head = "café".as_bytes().to_vec();
        head.pop();
        assert_eq!(detect(&head), "text/plain; charset=utf-8");
    }

    #[test]
    fn unknown_binary_is_octet_stream() {
        assert_eq!(detect(&[0x00, 0x01, 0x02, 0xFE]), "application/octet-stream");
        assert_eq!(detect(&[]), "application/octet-stream");
    }
}
