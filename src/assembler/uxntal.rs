//! A deliberately small single-pass Uxntal scanner.
//!
//! This is not a conformant Uxn assembler: it does not know the opcode set
//! and never validates or emits real ROM bytes. It recognizes exactly the
//! textual forms the symbol-graph analyzer cares about (label/sub-label/
//! macro definitions, include directives, reference sigils, and annotation
//! comments) and turns them into the same ordered event stream a real
//! assembler's callbacks would produce. Stack-effect/type auditing is out of
//! scope entirely, matching the black-box stance the driver takes toward it.

use std::collections::HashSet;

use super::{AnnotationEvent, AssemblerEvent, AssemblerFrontend, FileResolver, SymbolEvent};
use crate::graph::{DiagnosticSeverity, SymbolKind};
use crate::position::{self, Range};

const REF_SIGILS: [char; 9] = [';', ',', '.', '/', '!', '?', '=', '-', '_'];

#[derive(Default)]
pub struct UxntalAssembler;

impl UxntalAssembler {
    pub fn new() -> Self {
        Self
    }
}

impl AssemblerFrontend for UxntalAssembler {
    fn assemble(&self, entry: &str, files: &mut dyn FileResolver) -> Vec<AssemblerEvent> {
        let mut events = Vec::new();
        let mut visited = HashSet::new();
        let mut macro_names = HashSet::new();
        process_file(entry, None, files, &mut events, &mut visited, &mut macro_names);
        events
    }
}

fn process_file(
    filename: &str,
    included_from: Option<String>,
    files: &mut dyn FileResolver,
    events: &mut Vec<AssemblerEvent>,
    visited: &mut HashSet<String>,
    macro_names: &mut HashSet<String>,
) {
    if !visited.insert(filename.to_string()) {
        return;
    }

    events.push(AssemblerEvent::FileOpened {
        filename: filename.to_string(),
        included_from,
    });

    let Some(content) = files.resolve(filename) else {
        events.push(AssemblerEvent::Report(super::ReportEvent {
            filename: filename.to_string(),
            range: Range::default(),
            severity: DiagnosticSeverity::Error,
            message: format!("could not open file: {filename}"),
        }));
        return;
    };

    scan_file(filename, &content, files, events, visited, macro_names);

    events.push(AssemblerEvent::FileClosed {
        filename: filename.to_string(),
    });
}

fn scan_file(
    filename: &str,
    content: &str,
    files: &mut dyn FileResolver,
    events: &mut Vec<AssemblerEvent>,
    visited: &mut HashSet<String>,
    macro_names: &mut HashSet<String>,
) {
    let starts = position::line_starts(content);
    let bytes = content.as_bytes();
    let len = bytes.len();
    let mut i = 0usize;
    let mut addr: u16 = 0x0100;
    let mut current_scope = "RESET".to_string();

    while i < len {
        let b = bytes[i];
        if b.is_ascii_whitespace() {
            i += 1;
            continue;
        }

        if b == b'(' {
            let comment_start = i;
            let mut depth = 1i32;
            let mut j = i + 1;
            while j < len && depth > 0 {
                match bytes[j] {
                    b'(' => depth += 1,
                    b')' => depth -= 1,
                    _ => {}
                }
                j += 1;
            }
            let inner_end = if j > comment_start + 1 { j - 1 } else { j };
            let inner = content
                .get(comment_start + 1..inner_end.min(len))
                .unwrap_or("")
                .trim();
            if let Some(event) = classify_comment(inner) {
                events.push(AssemblerEvent::Annotation(event));
            }
            i = j.max(comment_start + 1);
            continue;
        }

        let tok_start = i;
        let mut k = i;
        while k < len && !bytes[k].is_ascii_whitespace() && bytes[k] != b'(' {
            k += 1;
        }
        let token = &content[tok_start..k];
        i = k;
        if token.is_empty() {
            continue;
        }

        // The full token span, including its leading sigil byte, used only
        // for the sigil-less bare macro invocation below.
        let range = token_range(content, &starts, tok_start, k);
        // The name span, excluding a single-byte sigil prefix, matching
        // what a client actually wants selected/replaced for a definition
        // or reference (e.g. `@foo` ranges over just `foo`).
        let name_range = token_range(content, &starts, tok_start + 1, k);

        if let Some(name) = token.strip_prefix('@') {
            current_scope = name.to_string();
            events.push(symbol_event(name, SymbolKind::Label, name_range, tok_start, addr));
            addr = addr.wrapping_add(1);
        } else if let Some(name) = token.strip_prefix('&') {
            let full_name = format!("{current_scope}/{name}");
            events.push(symbol_event(&full_name, SymbolKind::Label, name_range, tok_start, addr));
            addr = addr.wrapping_add(1);
        } else if let Some(name) = token.strip_prefix('%') {
            macro_names.insert(name.to_string());
            events.push(symbol_event(name, SymbolKind::Macro, name_range, tok_start, 0));
        } else if let Some(name) = token.strip_prefix('~') {
            process_file(name, Some(filename.to_string()), files, events, visited, macro_names);
        } else if let Some(hex) = token.strip_prefix('|') {
            if let Ok(v) = u16::from_str_radix(hex, 16) {
                addr = v;
            }
        } else if let Some(n) = token.strip_prefix('$') {
            if let Ok(v) = n.parse::<u16>() {
                addr = addr.wrapping_add(v);
            }
        } else if let Some(name) = token.strip_prefix(|c: char| REF_SIGILS.contains(&c)) {
            if !name.is_empty() {
                let kind = if macro_names.contains(name) {
                    SymbolKind::MacroRef
                } else {
                    SymbolKind::LabelRef
                };
                events.push(symbol_event(name, kind, name_range, tok_start, 0));
            }
            addr = addr.wrapping_add(1);
        } else if macro_names.contains(token) {
            events.push(symbol_event(token, SymbolKind::MacroRef, range, tok_start, 0));
        } else {
            // Opcode mnemonic, bare numeric/hex literal, or unrecognized
            // text; only the address counter advances.
            addr = addr.wrapping_add(1);
        }
    }
}

fn symbol_event(name: &str, kind: SymbolKind, range: Range, byte_offset: usize, address: u16) -> AssemblerEvent {
    let event = SymbolEvent {
        name: name.to_string(),
        kind,
        range,
        byte_offset,
        address,
    };
    if kind.is_reference() {
        AssemblerEvent::SymbolReferenced(event)
    } else {
        AssemblerEvent::SymbolDefined(event)
    }
}

fn token_range(content: &str, starts: &[usize], start: usize, end: usize) -> Range {
    Range {
        start: position::byte_offset_to_position(content, starts, start),
        end: position::byte_offset_to_position(content, starts, end),
    }
}

fn classify_comment(inner: &str) -> Option<AnnotationEvent> {
    if inner == "buxn:device" {
        Some(AnnotationEvent::Device)
    } else if inner == "buxn:memory" {
        Some(AnnotationEvent::Memory)
    } else if inner == "buxn:enum" {
        Some(AnnotationEvent::Enum)
    } else if let Some(text) = inner.strip_prefix("doc") {
        Some(AnnotationEvent::Doc { text: text.trim().to_string() })
    } else if inner.contains("--") {
        Some(AnnotationEvent::StackEffect { signature: inner.to_string() })
    } else {
        None
    }
}
