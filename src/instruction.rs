//! The Guacamole wire format: length-prefixed, comma-separated,
//! semicolon-terminated instructions. `L` is always the *character*
//! count of the element, not its byte length — `guacd`'s own Java
//! implementation counts UTF-16 code units, but the wire dialect this
//! bridge speaks counts Unicode scalar values.

use crate::error::GuacError;

/// An ordered list of UTF-8 strings; element 0 is the opcode. Empty
/// strings are valid elements (e.g. a missing optional argument).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Instruction(pub Vec<String>);

impl Instruction {
    pub fn new(parts: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Instruction(parts.into_iter().map(Into::into).collect())
    }

    pub fn opcode(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    pub fn arg(&self, index: usize) -> Option<&str> {
        self.0.get(index).map(String::as_str)
    }

    /// Encode this instruction as a wire frame. `None` elements (rendered
    /// from e.g. a missing setting) become the empty string.
    pub fn encode(&self) -> Vec<u8> {
        encode(&self.0)
    }
}

impl From<Vec<String>> for Instruction {
    fn from(v: Vec<String>) -> Self {
        Instruction(v)
    }
}

/// Encodes a list of string parts into a wire frame. For each element,
/// render as a string, count its *characters*, and emit `"<n>.<p>"`;
/// join with `,`; terminate with `;`.
pub fn encode<S: AsRef<str>>(parts: &[S]) -> Vec<u8> {
    let mut rendered = String::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            rendered.push(',');
        }
        let p = part.as_ref();
        rendered.push_str(&p.chars().count().to_string());
        rendered.push('.');
        rendered.push_str(p);
    }
    rendered.push(';');
    rendered.into_bytes()
}

/// Decodes a single `;`-terminated wire frame into its list of string
/// elements (see [`StreamDecoder`] for pulling frames out of a growing
/// byte buffer). Returns an empty vector for any frame that isn't
/// `;`-terminated, or whose first segment fails to parse — callers MUST
/// treat an empty return as "malformed, drop".
///
/// This is length-driven, the way `guacd` itself reads the wire: each
/// element is `<digits>.` followed by *exactly* that many characters,
/// then a `,` (or the end of the frame for the last element). Elements
/// are never split on embedded `,` or `.` — the declared length is the
/// only thing that determines where one ends — so an element
/// containing `,`/`.` round-trips correctly. The parser is tolerant in
/// one sense only: if a segment's declared length doesn't land exactly
/// on the next `,`/end-of-frame, parsing stops and whatever elements
/// were already accepted are returned, rather than guessing at a resync
/// point into a frame that's desynced from here on.
pub fn decode(frame: &str) -> Vec<String> {
    let Some(body) = frame.strip_suffix(';') else {
        return Vec::new();
    };

    let chars: Vec<char> = body.chars().collect();
    let len = chars.len();
    let mut pos = 0;
    let mut elements = Vec::new();

    while pos < len {
        let digits_start = pos;
        while pos < len && chars[pos].is_ascii_digit() {
            pos += 1;
        }
        if pos == digits_start || pos >= len || chars[pos] != '.' {
            break;
        }
        let Ok(expected_len) = chars[digits_start..pos]
            .iter()
            .collect::<String>()
            .parse::<usize>()
        else {
            break;
        };
        pos += 1; // skip '.'

        if pos + expected_len > len {
            break;
        }
        let content_end = pos + expected_len;

        if content_end == len {
            elements.push(chars[pos..content_end].iter().collect());
            break;
        }
        if chars[content_end] != ',' {
            // The declared length didn't land on a separator: this
            // segment's content doesn't match its own length prefix.
            break;
        }
        elements.push(chars[pos..content_end].iter().collect());
        pos = content_end + 1;
    }

    elements
}

/// Default cap on the number of buffered bytes a [`StreamDecoder`] will
/// hold before a frame terminator shows up. The wire format itself is
/// unbounded; this crate always enforces a cap to bound memory use
/// against a client that never terminates a frame.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;

/// One complete wire frame pulled off the stream, paired with its
/// decoded instruction. Keeping the raw bytes alongside the parsed form
/// lets [`crate::upstream::UpstreamClient`] forward the exact bytes
/// `guacd` sent to the client link, untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedFrame {
    pub raw: Vec<u8>,
    pub instruction: Instruction,
}

/// Pulls complete `;`-terminated frames out of an append-only byte
/// buffer, decoding each as it completes. Bytes after the last `;` stay
/// buffered until more data arrives.
pub struct StreamDecoder {
    buffer: Vec<u8>,
    max_bytes: usize,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_FRAME_BYTES)
    }

    pub fn with_capacity(max_bytes: usize) -> Self {
        StreamDecoder {
            buffer: Vec::new(),
            max_bytes,
        }
    }

    /// Appends newly-read bytes (already UTF-8, replacement-decoded by
    /// the caller) and returns every complete frame now available, in
    /// order, paired with its decoded instruction. Raises
    /// [`GuacError`] only on buffer overflow; malformed individual frames
    /// are silently dropped per [`decode`]'s contract, not surfaced as an
    /// error (and not returned at all, since there is no instruction to
    /// pair their raw bytes with).
    pub fn push(&mut self, chunk: &str) -> Result<Vec<DecodedFrame>, GuacError> {
        self.buffer.extend_from_slice(chunk.as_bytes());
        if self.buffer.len() > self.max_bytes {
            let overflow = self.buffer.len();
            self.buffer.clear();
            return Err(GuacError::protocol_parsing(format!(
                "frame buffer exceeded {} bytes (got {overflow})",
                self.max_bytes
            ))
            .with_detail("max_bytes", self.max_bytes as i64));
        }

        let mut frames = Vec::new();
        loop {
            let Some(pos) = self.buffer.iter().position(|&b| b == b';') else {
                break;
            };
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            // The buffer only ever receives UTF-8 (decoded with
            // replacement upstream), so this can't fail; if it somehow
            // did, drop the frame rather than panic.
            let Ok(frame) = std::str::from_utf8(&raw) else {
                continue;
            };
            let parts = decode(frame);
            if !parts.is_empty() {
                frames.push(DecodedFrame {
                    raw,
                    instruction: Instruction(parts),
                });
            }
        }
        Ok(frames)
    }
}

impl Default for StreamDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_simple() {
        let parts = vec!["select".to_string(), "rdp".to_string()];
        let encoded = encode(&parts);
        assert_eq!(encoded, b"6.select,3.rdp;");
        assert_eq!(decode(std::str::from_utf8(&encoded).unwrap()), parts);
    }

    #[test]
    fn roundtrip_element_with_dots_and_commas() {
        let parts = vec!["a.b,c.d".to_string()];
        let encoded = encode(&parts);
        let decoded = decode(std::str::from_utf8(&encoded).unwrap());
        assert_eq!(decoded, parts);
    }

    #[test]
    fn decode_literal_select_rdp() {
        assert_eq!(decode("6.select,3.rdp;"), vec!["select", "rdp"]);
    }

    #[test]
    fn decode_element_containing_a_dot() {
        // "wor.ld" is 6 characters, not the 5 its length prefix declares;
        // the second segment's content never lands on the following `,`,
        // so only the first element is accepted.
        assert_eq!(decode("5.hello,5.wor.ld;"), vec!["hello"]);
    }

    #[test]
    fn decode_correctly_lengthed_dotted_element() {
        assert_eq!(decode("6.wor.ld;"), vec!["wor.ld"]);
    }

    #[test]
    fn decode_missing_semicolon_is_empty() {
        let empty: Vec<String> = Vec::new();
        assert_eq!(decode("abc"), empty);
    }

    #[test]
    fn decode_length_mismatch_skips_element() {
        let empty: Vec<String> = Vec::new();
        assert_eq!(decode("3.abcd;"), empty);
    }

    #[test]
    fn decode_empty_string_element_is_valid() {
        assert_eq!(decode("0.,3.rdp;"), vec!["", "rdp"]);
    }

    #[test]
    fn stream_decoder_handles_partial_frames() {
        let mut dec = StreamDecoder::new();
        assert!(dec.push("6.sel").unwrap().is_empty());
        let frames = dec.push("ect,3.rdp;").unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].instruction.0, vec!["select", "rdp"]);
        assert_eq!(frames[0].raw, b"6.select,3.rdp;");
    }

    #[test]
    fn stream_decoder_overflow_raises_and_resets() {
        let mut dec = StreamDecoder::with_capacity(4);
        let err = dec.push("12345").unwrap_err();
        assert_eq!(err.kind(), crate::error::GuacErrorKind::ProtocolFailure);
    }

    #[test]
    fn character_count_not_byte_count() {
        // "é" is 2 bytes in UTF-8 but one character; the length prefix
        // must reflect characters.
        let parts = vec!["é".to_string()];
        let encoded = encode(&parts);
        assert_eq!(encoded, "1.é;".as_bytes());
        assert_eq!(decode(std::str::from_utf8(&encoded).unwrap()), parts);
    }
}
