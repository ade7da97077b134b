//! Byte offset <-> LSP position conversion.
//!
//! LSP positions are `(line, UTF-16 code unit column)` pairs. Source text is
//! kept and scanned as UTF-8 bytes throughout the rest of the crate, so this
//! module is the only place that performs the conversion.

use std::cmp::Ordering;

/// A position expressed as `(line, UTF-16 code unit)`, matching `lsp_types::Position`
/// field-for-field but kept distinct so graph/analyzer code does not need to
/// depend on the `lsp_types` crate directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Position {
    pub line: u32,
    pub character: u32,
}

impl Ord for Position {
    fn cmp(&self, other: &Self) -> Ordering {
        self.line.cmp(&other.line).then(self.character.cmp(&other.character))
    }
}

impl PartialOrd for Position {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Range {
    pub start: Position,
    pub end: Position,
}

impl From<Position> for tower_lsp::lsp_types::Position {
    fn from(pos: Position) -> Self {
        tower_lsp::lsp_types::Position::new(pos.line, pos.character)
    }
}

impl From<tower_lsp::lsp_types::Position> for Position {
    fn from(pos: tower_lsp::lsp_types::Position) -> Self {
        Position { line: pos.line, character: pos.character }
    }
}

impl From<Range> for tower_lsp::lsp_types::Range {
    fn from(range: Range) -> Self {
        tower_lsp::lsp_types::Range::new(range.start.into(), range.end.into())
    }
}

/// Byte offsets of the start of every line in `text`, plus a sentinel one
/// past the end. Recognizes both `\n` and `\r\n` line endings.
pub fn line_starts(text: &str) -> Vec<usize> {
    let mut starts = vec![0];
    let bytes = text.as_bytes();
    for (i, &b) in bytes.iter().enumerate() {
        if b == b'\n' {
            starts.push(i + 1);
        }
    }
    starts
}

/// Convert a byte offset into `text` to a `(line, utf16_column)` position.
///
/// Mirrors `buxn_ls_convert_position`: walk codepoints of the containing
/// line, accumulating one UTF-16 code unit per codepoint below `0x10000` and
/// two for astral codepoints, stopping (and yielding whatever column was
/// reached) if invalid UTF-8 is encountered rather than panicking.
pub fn byte_offset_to_position(text: &str, starts: &[usize], byte_offset: usize) -> Position {
    let line = match starts.binary_search(&byte_offset) {
        Ok(idx) => idx,
        Err(idx) => idx.saturating_sub(1),
    };
    let line_start = starts[line];
    let line_end = starts.get(line + 1).copied().unwrap_or(text.len());
    let line_bytes = &text.as_bytes()[line_start..line_end.min(text.len())];

    let target = byte_offset.saturating_sub(line_start);
    let mut code_unit_offset = 0u32;
    let mut byte_pos = 0usize;
    while byte_pos < target && byte_pos < line_bytes.len() {
        match std::str::from_utf8(&line_bytes[byte_pos..]) {
            Ok(rest) => match rest.chars().next() {
                Some(ch) => {
                    code_unit_offset += ch.len_utf16() as u32;
                    byte_pos += ch.len_utf8();
                }
                None => break,
            },
            Err(_) => {
                // Invalid UTF-8: skip a single byte and keep going, matching
                // the original's warn-and-recover behavior.
                byte_pos += 1;
                code_unit_offset += 1;
            }
        }
    }

    Position {
        line: line as u32,
        character: code_unit_offset,
    }
}

/// Convert a `(line, utf16_column)` position back to a byte offset into `text`.
pub fn position_to_byte_offset(text: &str, starts: &[usize], pos: Position) -> usize {
    let Some(&line_start) = starts.get(pos.line as usize) else {
        return text.len();
    };
    let line_end = starts.get(pos.line as usize + 1).copied().unwrap_or(text.len());
    let line = &text[line_start..line_end.min(text.len())];

    let mut code_units = 0u32;
    let mut byte_pos = 0usize;
    for ch in line.chars() {
        if code_units >= pos.character {
            break;
        }
        code_units += ch.len_utf16() as u32;
        byte_pos += ch.len_utf8();
    }
    line_start + byte_pos
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascii_round_trip() {
        let text = "abc\ndef\n";
        let starts = line_starts(text);
        let pos = byte_offset_to_position(text, &starts, 5);
        assert_eq!(pos, Position { line: 1, character: 1 });
        assert_eq!(position_to_byte_offset(text, &starts, pos), 5);
    }

    #[test]
    fn astral_codepoint_counts_two_units() {
        let text = "a\u{1F600}b";
        let starts = line_starts(text);
        let pos = byte_offset_to_position(text, &starts, text.len());
        assert_eq!(pos.character, 1 + 2 + 1);
    }

    #[test]
    fn crlf_line_starts() {
        let text = "a\r\nb\r\n";
        let starts = line_starts(text);
        assert_eq!(starts, vec![0, 3, 6]);
    }
}
