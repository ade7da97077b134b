//! The callback/event boundary between the analysis driver and an assembler
//! front-end. The driver never parses Uxntal itself; it only reacts to the
//! event stream an `AssemblerFrontend` produces for an entry file.

pub mod uxntal;

use crate::graph::{DiagnosticSeverity, SymbolKind};
use crate::position::Range;

/// One symbol-related event: either a definition or a reference, depending
/// on `kind`.
#[derive(Debug, Clone)]
pub struct SymbolEvent {
    pub name: String,
    pub kind: SymbolKind,
    pub range: Range,
    pub byte_offset: usize,
    /// Labels only; zero for macros.
    pub address: u16,
}

/// A prefix/immediate annotation, attached by the driver to "the most
/// recently defined symbol" (prefix) or to the owning file (immediate).
#[derive(Debug, Clone)]
pub enum AnnotationEvent {
    Doc { text: String },
    Device,
    Memory,
    Enum,
    StackEffect { signature: String },
}

#[derive(Debug, Clone)]
pub struct ReportEvent {
    pub filename: String,
    pub range: Range,
    pub severity: DiagnosticSeverity,
    pub message: String,
}

#[derive(Debug, Clone)]
pub enum AssemblerEvent {
    /// A file was opened, either as the entry or via an include directive
    /// from `included_from`.
    FileOpened {
        filename: String,
        included_from: Option<String>,
    },
    /// Emitted once a file's content has been fully streamed; closes the
    /// "current file" context opened by the matching `FileOpened`.
    FileClosed {
        filename: String,
    },
    SymbolDefined(SymbolEvent),
    SymbolReferenced(SymbolEvent),
    Annotation(AnnotationEvent),
    Report(ReportEvent),
    /// The file currently being processed failed to parse past this byte
    /// offset; everything after it is missing from this run.
    ParseError { filename: String, byte_offset: usize },
}

/// Resolves a filename (as named by an include directive) to its content.
/// Implementations choose the priority order (already-loaded cache, open
/// workspace document, on-disk read); the assembler itself is agnostic.
pub trait FileResolver {
    fn resolve(&mut self, filename: &str) -> Option<String>;
}

/// The assembler front-end contract: given an entry filename and a resolver
/// for includes, produce the full ordered event stream for the whole
/// program reachable from that entry.
pub trait AssemblerFrontend {
    fn assemble(&self, entry: &str, files: &mut dyn FileResolver) -> Vec<AssemblerEvent>;
}

/// An in-memory resolver backed by a fixed map, used by tests and by the
/// analyzer when a mock emitter is wired in directly (spec §9's "mock
/// emitter producing a canned symbol stream").
pub struct StaticFiles(pub rustc_hash::FxHashMap<String, String>);

impl FileResolver for StaticFiles {
    fn resolve(&mut self, filename: &str) -> Option<String> {
        self.0.get(filename).cloned()
    }
}
