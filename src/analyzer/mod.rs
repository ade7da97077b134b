//! The incremental analysis driver: the six-step per-run protocol described
//! in the component design (swap generations, seed the work queue, run the
//! assembler per queued file, carry error-tolerant definitions forward,
//! wire references to their definitions, sort diagnostics).

use rustc_hash::{FxHashMap, FxHashSet};

use crate::assembler::{AnnotationEvent, AssemblerEvent, AssemblerFrontend, FileResolver};
use crate::graph::{
    AnalyzerContext, Diagnostic, DiagnosticSeverity as GraphSeverity, Location, SourceId, SymbolId,
    SymbolKind, SymbolNode, SymbolSemantics,
};
use crate::position;
use crate::workspace::Workspace;

/// Per-file bookkeeping for one analysis run: raw content, its line table,
/// the zero-page semantic default set by `( buxn:device )` / `( buxn:memory )`
/// annotations, and the error-tolerance carry-over markers.
pub struct FileRecord {
    pub content: String,
    pub line_starts: Vec<usize>,
    pub zero_page_semantics: SymbolSemantics,
    pub has_error: bool,
    pub last_symbol_byte: usize,
}

pub struct Analyzer {
    ctx_a: AnalyzerContext,
    ctx_b: AnalyzerContext,
    current_is_a: bool,
    pub diagnostics: Vec<Diagnostic>,
    pub files: FxHashMap<String, FileRecord>,
    macro_defs: FxHashMap<String, SymbolId>,
    label_defs: FxHashMap<String, SymbolId>,
    root_dir: String,
}

/// Per-file scanning state threaded while replaying one file's event
/// sub-sequence: the most recently committed symbol (for trailing
/// stack-effect annotations) and the active enum scope (for
/// `( buxn:enum )` scope inheritance).
struct FileCtx {
    path: String,
    source_id: SourceId,
    last_symbol: Option<SymbolId>,
    pending_doc: Option<String>,
    pending_enum: bool,
    enum_scope: Option<String>,
    /// True when this file was already fully processed earlier in the same
    /// run (queued both directly and reached again via another entry's
    /// include chain); its symbol/annotation events are replayed for
    /// bookkeeping but must not be committed a second time.
    skip: bool,
}

impl Analyzer {
    pub fn new(root_dir: impl Into<String>) -> Self {
        Self {
            ctx_a: AnalyzerContext::default(),
            ctx_b: AnalyzerContext::default(),
            current_is_a: true,
            diagnostics: Vec::new(),
            files: FxHashMap::default(),
            macro_defs: FxHashMap::default(),
            label_defs: FxHashMap::default(),
            root_dir: root_dir.into(),
        }
    }

    pub fn current_ctx(&self) -> &AnalyzerContext {
        if self.current_is_a { &self.ctx_a } else { &self.ctx_b }
    }

    pub fn current_ctx_mut(&mut self) -> &mut AnalyzerContext {
        if self.current_is_a { &mut self.ctx_a } else { &mut self.ctx_b }
    }

    pub fn previous_ctx(&self) -> &AnalyzerContext {
        if self.current_is_a { &self.ctx_b } else { &self.ctx_a }
    }

    fn uri_for(&self, path: &str) -> String {
        format!("file://{}{}", self.root_dir, path)
    }

    /// Run one full analysis pass over the workspace's open documents.
    pub fn analyze(&mut self, workspace: &Workspace, assembler: &dyn AssemblerFrontend) {
        // Step 1: swap roles, then reset the generation that is now current
        // (the one that was previous two runs ago, safe to discard); the
        // generation that falls out of the swap as `previous_ctx()` keeps
        // last run's data intact for the carry-over and seed-queue steps
        // below.
        self.current_is_a = !self.current_is_a;
        self.current_ctx_mut().reset();

        self.diagnostics.clear();
        self.files.clear();
        self.macro_defs.clear();
        self.label_defs.clear();

        // Step 2: seed the work queue.
        let open_set: FxHashSet<String> = workspace.iter_open().map(|(p, _)| p.to_string()).collect();
        let queue = self.seed_queue(&open_set);

        // Step 3: run the assembler once per queued file, in order.
        for path in &queue {
            if let Some(&id) = self.current_ctx().source_by_path.get(path) {
                if self.current_ctx().source(id).analyzed {
                    continue;
                }
            }
            let mut resolver = WorkspaceResolver {
                workspace,
                files: &mut self.files,
                root_dir: &self.root_dir,
            };
            let events = assembler.assemble(path, &mut resolver);
            self.process_events(events);
        }

        // Step 4: error-tolerance carry-over.
        self.carry_over_stale_definitions();

        // Step 5: wire references to their definitions.
        self.wire_references();

        // Step 6: sort diagnostics by URI for per-file publish batching.
        self.diagnostics.sort_by(|a, b| a.location.uri.cmp(&b.location.uri));
    }

    fn seed_queue(&self, open_set: &FxHashSet<String>) -> Vec<String> {
        let mut queue = Vec::new();
        let mut queued: FxHashSet<String> = FxHashSet::default();
        let current = self.current_ctx();
        let previous = self.previous_ctx();

        for path in open_set {
            if current.source_by_path.contains_key(path) {
                continue;
            }
            if let Some(&prev_id) = previous.source_by_path.get(path) {
                let root = previous.root_of(prev_id);
                let mut stack = vec![root];
                let mut seen = FxHashSet::default();
                while let Some(id) = stack.pop() {
                    if !seen.insert(id) {
                        continue;
                    }
                    let node = previous.source(id);
                    if open_set.contains(&node.filename) && queued.insert(node.filename.clone()) {
                        queue.push(node.filename.clone());
                    }
                    for &child in &node.base.out_edges {
                        stack.push(child);
                    }
                }
            } else if queued.insert(path.clone()) {
                queue.push(path.clone());
            }
        }
        queue
    }

    fn ensure_source(&mut self, filename: &str) -> SourceId {
        if let Some(&id) = self.current_ctx().source_by_path.get(filename) {
            return id;
        }
        let uri = self.uri_for(filename);
        self.current_ctx_mut().add_source(filename.to_string(), uri)
    }

    fn process_events(&mut self, events: Vec<AssemblerEvent>) {
        let mut stack: Vec<FileCtx> = Vec::new();

        for event in events {
            match event {
                AssemblerEvent::FileOpened { filename, included_from } => {
                    let source_id = self.ensure_source(&filename);
                    let already_processed = self.current_ctx().source(source_id).analyzed;
                    if !already_processed {
                        if let Some(parent_path) = included_from.as_ref() {
                            if let Some(&parent_id) = self.current_ctx().source_by_path.get(parent_path) {
                                if parent_id != source_id {
                                    self.current_ctx_mut().add_edge(parent_id, source_id);
                                }
                            }
                        }
                        self.current_ctx_mut().source_mut(source_id).analyzed = true;
                    }
                    stack.push(FileCtx {
                        path: filename,
                        source_id,
                        last_symbol: None,
                        pending_doc: None,
                        pending_enum: false,
                        enum_scope: None,
                        skip: already_processed,
                    });
                }
                AssemblerEvent::FileClosed { filename } => {
                    if stack.last().is_some_and(|f| f.path == filename) {
                        stack.pop();
                    }
                }
                AssemblerEvent::SymbolDefined(sym) => {
                    let Some(fctx) = stack.last_mut() else { continue };
                    if fctx.skip {
                        continue;
                    }
                    let source_id = fctx.source_id;

                    if let Some(rec) = self.files.get_mut(&fctx.path) {
                        rec.last_symbol_byte = rec.last_symbol_byte.max(sym.byte_offset);
                    }
                    let zero_page_default = self
                        .files
                        .get(&fctx.path)
                        .map(|f| f.zero_page_semantics)
                        .unwrap_or(SymbolSemantics::Variable);

                    let semantics = match sym.kind {
                        SymbolKind::Macro => SymbolSemantics::Subroutine,
                        SymbolKind::Label => classify_label(fctx, sym.address, &sym.name, zero_page_default),
                        _ => unreachable!("SymbolDefined only carries definition kinds"),
                    };

                    let documentation = fctx.pending_doc.take().unwrap_or_default();

                    let node = SymbolNode {
                        name: sym.name.clone(),
                        documentation,
                        signature: String::new(),
                        source: source_id,
                        kind: sym.kind,
                        semantics,
                        range: sym.range,
                        byte_offset: sym.byte_offset,
                        address: sym.address,
                        resolved: None,
                        referenced_by: Vec::new(),
                    };
                    let id = self.current_ctx_mut().add_symbol(node);
                    self.current_ctx_mut().source_mut(source_id).definitions.push(id);

                    match sym.kind {
                        SymbolKind::Macro => {
                            self.macro_defs.insert(sym.name.clone(), id);
                        }
                        SymbolKind::Label => {
                            self.label_defs.insert(sym.name.clone(), id);
                        }
                        _ => {}
                    }

                    stack.last_mut().unwrap().last_symbol = Some(id);
                }
                AssemblerEvent::SymbolReferenced(sym) => {
                    let Some(fctx) = stack.last() else { continue };
                    if fctx.skip {
                        continue;
                    }
                    let source_id = fctx.source_id;
                    let node = SymbolNode {
                        name: sym.name.clone(),
                        documentation: String::new(),
                        signature: String::new(),
                        source: source_id,
                        kind: sym.kind,
                        semantics: SymbolSemantics::Variable,
                        range: sym.range,
                        byte_offset: sym.byte_offset,
                        address: sym.address,
                        resolved: None,
                        referenced_by: Vec::new(),
                    };
                    let id = self.current_ctx_mut().add_symbol(node);
                    self.current_ctx_mut().source_mut(source_id).references.push(id);
                }
                AssemblerEvent::Annotation(annotation) => {
                    let Some(fctx) = stack.last_mut() else { continue };
                    if fctx.skip {
                        continue;
                    }
                    match annotation {
                        AnnotationEvent::Doc { text } => fctx.pending_doc = Some(text),
                        AnnotationEvent::Enum => fctx.pending_enum = true,
                        AnnotationEvent::Device => {
                            if let Some(rec) = self.files.get_mut(&fctx.path) {
                                rec.zero_page_semantics = SymbolSemantics::DevicePort;
                            }
                        }
                        AnnotationEvent::Memory => {
                            if let Some(rec) = self.files.get_mut(&fctx.path) {
                                rec.zero_page_semantics = SymbolSemantics::Variable;
                            }
                        }
                        AnnotationEvent::StackEffect { signature } => {
                            if let Some(last) = fctx.last_symbol {
                                let sym = self.current_ctx_mut().symbol_mut(last);
                                sym.signature = signature;
                                sym.semantics = SymbolSemantics::Subroutine;
                            }
                        }
                    }
                }
                AssemblerEvent::Report(report) => {
                    let is_error = matches!(report.severity, GraphSeverity::Error);
                    if is_error {
                        if let Some(rec) = self.files.get_mut(&report.filename) {
                            rec.has_error = true;
                        }
                    }
                    self.diagnostics.push(Diagnostic {
                        location: Location {
                            uri: self.uri_for(&report.filename),
                            range: report.range,
                        },
                        related_location: None,
                        severity: report.severity,
                        source: "buxn-asm".to_string(),
                        message: report.message,
                        related_message: None,
                    });
                }
                AssemblerEvent::ParseError { filename, byte_offset } => {
                    if let Some(rec) = self.files.get_mut(&filename) {
                        rec.has_error = true;
                        rec.last_symbol_byte = rec.last_symbol_byte.max(byte_offset);
                    }
                }
            }
        }
    }

    /// For every file whose run ended in error, copy forward definitions
    /// from the previous generation that lie strictly past the furthest
    /// symbol this run managed to produce.
    fn carry_over_stale_definitions(&mut self) {
        let errored: Vec<String> = self
            .files
            .iter()
            .filter(|(_, rec)| rec.has_error)
            .map(|(path, _)| path.clone())
            .collect();

        for path in errored {
            let last_symbol_byte = self.files.get(&path).map(|r| r.last_symbol_byte).unwrap_or(0);
            let Some(&prev_source_id) = self.previous_ctx().source_by_path.get(&path) else { continue };
            let Some(&cur_source_id) = self.current_ctx().source_by_path.get(&path) else { continue };

            let stale: Vec<SymbolNode> = self
                .previous_ctx()
                .source(prev_source_id)
                .definitions
                .iter()
                .map(|&id| self.previous_ctx().symbol(id).clone())
                .filter(|def| def.byte_offset > last_symbol_byte)
                .collect();

            for mut def in stale {
                def.source = cur_source_id;
                def.resolved = None;
                def.referenced_by.clear();
                if def.kind == SymbolKind::Macro {
                    let id = self.current_ctx_mut().add_symbol(def.clone());
                    self.current_ctx_mut().source_mut(cur_source_id).definitions.push(id);
                    self.macro_defs.insert(def.name.clone(), id);
                } else {
                    let id = self.current_ctx_mut().add_symbol(def.clone());
                    self.current_ctx_mut().source_mut(cur_source_id).definitions.push(id);
                    self.label_defs.insert(def.name.clone(), id);
                }
            }
        }
    }

    /// Resolve every reference node against the per-run definition tables;
    /// unresolved references are left as-is (dropped from the navigable
    /// graph, never fatal), per the spec's explicit "look up or ignore"
    /// resolution of the unbounded-index open question.
    fn wire_references(&mut self) {
        let pending: Vec<(SymbolId, String, SymbolKind)> = self
            .current_ctx()
            .symbols
            .iter()
            .enumerate()
            .filter(|(_, s)| s.kind.is_reference())
            .map(|(i, s)| (SymbolId(i), s.name.clone(), s.kind))
            .collect();

        for (ref_id, name, kind) in pending {
            let target = match kind {
                SymbolKind::MacroRef => self.macro_defs.get(&name).copied(),
                SymbolKind::LabelRef => self.label_defs.get(&name).copied(),
                _ => None,
            };
            if let Some(target_id) = target {
                self.current_ctx_mut().resolve_reference(ref_id, target_id);
            }
        }
    }

    /// Lazily compute and cache a file's line table for position conversion.
    pub fn line_starts(&mut self, path: &str) -> &[usize] {
        let rec = self.files.get_mut(path).expect("file must be loaded before querying positions");
        if rec.line_starts.is_empty() && !rec.content.is_empty() {
            rec.line_starts = position::line_starts(&rec.content);
        }
        &rec.line_starts
    }
}

fn scope_of(name: &str) -> String {
    name.split('/').next().unwrap_or(name).to_string()
}

fn classify_label(
    fctx: &mut FileCtx,
    address: u16,
    name: &str,
    zero_page_default: SymbolSemantics,
) -> SymbolSemantics {
    if fctx.pending_enum {
        fctx.pending_enum = false;
        fctx.enum_scope = Some(scope_of(name));
        return SymbolSemantics::Enum;
    }

    if address <= 0x00FF {
        if let Some(scope) = &fctx.enum_scope {
            if *scope == scope_of(name) {
                return SymbolSemantics::Enum;
            }
        }
        fctx.enum_scope = None;
        zero_page_default
    } else {
        SymbolSemantics::Variable
    }
}

/// Resolves include-directive filenames in priority order: already loaded
/// this run, an open workspace document (copied defensively), then an
/// on-disk read relative to the workspace root.
struct WorkspaceResolver<'a> {
    workspace: &'a Workspace,
    files: &'a mut FxHashMap<String, FileRecord>,
    root_dir: &'a str,
}

impl FileResolver for WorkspaceResolver<'_> {
    fn resolve(&mut self, filename: &str) -> Option<String> {
        if let Some(rec) = self.files.get(filename) {
            return Some(rec.content.clone());
        }

        let content = if let Some(text) = self.workspace.get(filename) {
            text.to_string()
        } else {
            let path = std::path::Path::new(self.root_dir).join(filename);
            match std::fs::read_to_string(&path) {
                Ok(text) => text,
                Err(err) => {
                    tracing::warn!(?path, %err, "could not read include from disk");
                    return None;
                }
            }
        };

        self.files.insert(
            filename.to_string(),
            FileRecord {
                content: content.clone(),
                line_starts: Vec::new(),
                zero_page_semantics: SymbolSemantics::Variable,
                has_error: false,
                last_symbol_byte: 0,
            },
        );
        Some(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::uxntal::UxntalAssembler;

    fn analyzed(files: &[(&str, &str)], entry_open: &[&str]) -> Analyzer {
        let mut workspace = Workspace::new("/root");
        for path in entry_open {
            let text = files.iter().find(|(p, _)| p == path).unwrap().1;
            workspace.did_open((*path).to_string(), text.to_string());
        }
        let mut analyzer = Analyzer::new("/root/");
        for (path, content) in files {
            analyzer.files.insert(
                (*path).to_string(),
                FileRecord {
                    content: (*content).to_string(),
                    line_starts: Vec::new(),
                    zero_page_semantics: SymbolSemantics::Variable,
                    has_error: false,
                    last_symbol_byte: 0,
                },
            );
        }
        analyzer.analyze(&workspace, &UxntalAssembler::new());
        analyzer
    }

    #[test]
    fn resolves_same_file_reference() {
        let analyzer = analyzed(&[("a.tal", "@foo ADD ;foo JMP2")], &["a.tal"]);
        let ctx = analyzer.current_ctx();
        let source = ctx.source(*ctx.source_by_path.get("a.tal").unwrap());
        assert_eq!(source.definitions.len(), 1);
        let reference = ctx.symbol(source.references[0]);
        assert!(reference.resolved.is_some());
    }

    #[test]
    fn definition_range_excludes_leading_sigil() {
        let analyzer = analyzed(&[("a.tal", "@foo ADD ;foo JMP2")], &["a.tal"]);
        let ctx = analyzer.current_ctx();
        let source = ctx.source(*ctx.source_by_path.get("a.tal").unwrap());
        let def = ctx.symbol(source.definitions[0]);
        assert_eq!(def.range.start, position::Position { line: 0, character: 1 });
        assert_eq!(def.range.end, position::Position { line: 0, character: 4 });
    }

    /// A canned event stream standing in for two successive, independently
    /// controlled runs of the same entry file, used to drive the
    /// error-tolerance carry-over path without a real parse failure.
    struct ScenarioAssembler {
        call: std::cell::Cell<u32>,
    }

    impl AssemblerFrontend for ScenarioAssembler {
        fn assemble(&self, entry: &str, files: &mut dyn FileResolver) -> Vec<AssemblerEvent> {
            // Touch the resolver so the driver's per-file bookkeeping record
            // exists to carry `has_error`/`last_symbol_byte`, matching what a
            // real scan does on its first read of the entry file.
            files.resolve(entry);
            let n = self.call.get();
            self.call.set(n + 1);
            let def = |name: &str, byte_offset: usize| {
                AssemblerEvent::SymbolDefined(crate::assembler::SymbolEvent {
                    name: name.to_string(),
                    kind: SymbolKind::Label,
                    range: crate::position::Range::default(),
                    byte_offset,
                    address: 0x0100,
                })
            };
            let opened = AssemblerEvent::FileOpened { filename: "a.tal".to_string(), included_from: None };
            let closed = AssemblerEvent::FileClosed { filename: "a.tal".to_string() };
            if n == 0 {
                vec![opened, def("foo", 0), def("bar", 10), def("baz", 20), closed]
            } else {
                vec![
                    opened,
                    def("foo", 0),
                    AssemblerEvent::ParseError { filename: "a.tal".to_string(), byte_offset: 5 },
                    closed,
                ]
            }
        }
    }

    #[test]
    fn carries_over_definitions_past_the_last_successful_symbol_on_error() {
        let mut workspace = Workspace::new("/root");
        workspace.did_open("a.tal".to_string(), "placeholder".to_string());
        let mut analyzer = Analyzer::new("/root/");
        let assembler = ScenarioAssembler { call: std::cell::Cell::new(0) };

        analyzer.analyze(&workspace, &assembler);
        {
            let ctx = analyzer.current_ctx();
            let source = ctx.source(*ctx.source_by_path.get("a.tal").unwrap());
            assert_eq!(source.definitions.len(), 3);
        }

        analyzer.analyze(&workspace, &assembler);
        let ctx = analyzer.current_ctx();
        let source = ctx.source(*ctx.source_by_path.get("a.tal").unwrap());
        let names: Vec<&str> = source.definitions.iter().map(|&id| ctx.symbol(id).name.as_str()).collect();
        assert_eq!(names.len(), 3);
        assert!(names.contains(&"foo"));
        assert!(names.contains(&"bar"));
        assert!(names.contains(&"baz"));
    }

    #[test]
    fn resolves_cross_file_reference() {
        let analyzer = analyzed(
            &[("main.tal", "~lib.tal\n;target JMP2"), ("lib.tal", "@target BRK")],
            &["main.tal", "lib.tal"],
        );
        let ctx = analyzer.current_ctx();
        let main = ctx.source(*ctx.source_by_path.get("main.tal").unwrap());
        let reference = ctx.symbol(main.references[0]);
        let target = ctx.symbol(reference.resolved.unwrap());
        assert_eq!(target.name, "target");
    }

    #[test]
    fn device_annotation_marks_device_port_semantics() {
        let analyzer = analyzed(&[("dev.tal", "( buxn:device )\n@Console &write $1")], &["dev.tal"]);
        let ctx = analyzer.current_ctx();
        let source = ctx.source(*ctx.source_by_path.get("dev.tal").unwrap());
        let write = source
            .definitions
            .iter()
            .map(|&id| ctx.symbol(id))
            .find(|s| s.name == "Console/write")
            .unwrap();
        assert_eq!(write.semantics, SymbolSemantics::DevicePort);
    }
}
