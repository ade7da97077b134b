//! The symbol graph: source nodes, symbol nodes, and the edges between them,
//! held in two alternating generational arenas so a full re-analysis run can
//! evict everything from a generation by simply starting a new one.

use rustc_hash::FxHashMap;

use crate::position::Range;

/// Classification of a symbol derived from the annotation/address-range
/// pass, independent of its raw assembler-reported type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolSemantics {
    Variable,
    Subroutine,
    DevicePort,
    Enum,
}

/// The raw kind of symbol as reported by the assembler front-end, before
/// semantic classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    Macro,
    Label,
    MacroRef,
    LabelRef,
}

impl SymbolKind {
    pub fn is_reference(self) -> bool {
        matches!(self, SymbolKind::MacroRef | SymbolKind::LabelRef)
    }

    pub fn is_definition(self) -> bool {
        !self.is_reference()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticSeverity {
    Error,
    Warning,
    Information,
    Hint,
}

#[derive(Debug, Clone)]
pub struct Location {
    pub uri: String,
    pub range: Range,
}

#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub location: Location,
    pub related_location: Option<Location>,
    pub severity: DiagnosticSeverity,
    pub source: String,
    pub message: String,
    pub related_message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SymbolId(pub usize);

/// Edges are directed source-to-source dependency links (an include or a
/// cross-file reference origin); tracked on both endpoints so traversal can
/// go either direction without a separate reverse index.
#[derive(Debug, Default, Clone)]
pub struct NodeBase {
    pub in_edges: Vec<SourceId>,
    pub out_edges: Vec<SourceId>,
}

#[derive(Debug, Clone)]
pub struct SymbolNode {
    pub name: String,
    pub documentation: String,
    pub signature: String,
    pub source: SourceId,
    pub kind: SymbolKind,
    pub semantics: SymbolSemantics,
    pub range: Range,
    /// Byte offset within its source; used for error-tolerance ordering and
    /// forward-declaration checks.
    pub byte_offset: usize,
    /// 16-bit address (labels only; unused/zero for macros).
    pub address: u16,
    /// For reference nodes only: the resolved definition, once wired.
    pub resolved: Option<SymbolId>,
    /// For definition nodes only: every reference node that resolved to
    /// this one, populated during reference wiring.
    pub referenced_by: Vec<SymbolId>,
}

#[derive(Debug, Clone)]
pub struct SourceNode {
    pub filename: String,
    pub uri: String,
    /// Indexes into the owning context's `symbols` slab.
    pub references: Vec<SymbolId>,
    pub definitions: Vec<SymbolId>,
    pub analyzed: bool,
    pub base: NodeBase,
}

/// One generation of the symbol graph: a slab of source nodes, a slab of
/// symbol nodes, and a path -> source lookup. Resetting a generation is
/// `Vec::clear` + `HashMap::clear`, an O(1)-amortized operation compared to
/// freeing each node individually.
#[derive(Debug, Default)]
pub struct AnalyzerContext {
    pub sources: Vec<SourceNode>,
    pub symbols: Vec<SymbolNode>,
    pub source_by_path: FxHashMap<String, SourceId>,
}

impl AnalyzerContext {
    pub fn reset(&mut self) {
        self.sources.clear();
        self.symbols.clear();
        self.source_by_path.clear();
    }

    pub fn add_source(&mut self, filename: String, uri: String) -> SourceId {
        let id = SourceId(self.sources.len());
        self.sources.push(SourceNode {
            filename: filename.clone(),
            uri,
            references: Vec::new(),
            definitions: Vec::new(),
            analyzed: false,
            base: NodeBase::default(),
        });
        self.source_by_path.insert(filename, id);
        id
    }

    pub fn source(&self, id: SourceId) -> &SourceNode {
        &self.sources[id.0]
    }

    pub fn source_mut(&mut self, id: SourceId) -> &mut SourceNode {
        &mut self.sources[id.0]
    }

    pub fn add_symbol(&mut self, symbol: SymbolNode) -> SymbolId {
        let id = SymbolId(self.symbols.len());
        self.symbols.push(symbol);
        id
    }

    pub fn symbol(&self, id: SymbolId) -> &SymbolNode {
        &self.symbols[id.0]
    }

    pub fn symbol_mut(&mut self, id: SymbolId) -> &mut SymbolNode {
        &mut self.symbols[id.0]
    }

    /// Record that reference `from` resolves to definition `to`.
    pub fn resolve_reference(&mut self, from: SymbolId, to: SymbolId) {
        self.symbols[from.0].resolved = Some(to);
        self.symbols[to.0].referenced_by.push(from);
    }

    /// Splice a dependency edge between two source nodes in this generation.
    pub fn add_edge(&mut self, from: SourceId, to: SourceId) {
        self.sources[from.0].base.out_edges.push(to);
        self.sources[to.0].base.in_edges.push(from);
    }

    /// Walk `in_edges` back to a root (a source with no incoming edges),
    /// used to bias re-analysis toward whole-program entry points rather
    /// than analyzing an included file in isolation.
    pub fn root_of(&self, mut id: SourceId) -> SourceId {
        let mut seen = std::collections::HashSet::new();
        while let Some(&parent) = self.sources[id.0].base.in_edges.first() {
            if !seen.insert(id) {
                break;
            }
            id = parent;
        }
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_clears_generation() {
        let mut ctx = AnalyzerContext::default();
        ctx.add_source("a.tal".into(), "file:///a.tal".into());
        assert_eq!(ctx.sources.len(), 1);
        ctx.reset();
        assert!(ctx.sources.is_empty());
        assert!(ctx.source_by_path.is_empty());
    }

    #[test]
    fn root_of_walks_back_through_includes() {
        let mut ctx = AnalyzerContext::default();
        let root = ctx.add_source("root.tal".into(), "file:///root.tal".into());
        let child = ctx.add_source("child.tal".into(), "file:///child.tal".into());
        ctx.add_edge(root, child);
        assert_eq!(ctx.root_of(child), root);
        assert_eq!(ctx.root_of(root), root);
    }
}
