//! End-to-end exercises of the public API, one per named scenario: open a
//! small workspace, run a full analysis pass, and check the resulting graph
//! the way a client's request handlers would read it. No LSP transport is
//! involved; the `Backend`'s per-method logic is thin enough (read the
//! current graph, format a response) that these lower-level checks already
//! cover its contract, and avoid standing up a subprocess/stdio harness for
//! a server with no incremental-sync surface to drive.

use buxn_ls::analyzer::Analyzer;
use buxn_ls::assembler::uxntal::UxntalAssembler;
use buxn_ls::assembler::{AssemblerEvent, AssemblerFrontend, FileResolver, SymbolEvent};
use buxn_ls::graph::{SymbolKind, SymbolSemantics};
use buxn_ls::position::{Position, Range};
use buxn_ls::workspace::Workspace;

fn open(root: &str, files: &[(&str, &str)]) -> Workspace {
    let mut workspace = Workspace::new(root);
    for (path, text) in files {
        workspace.did_open((*path).to_string(), (*text).to_string());
    }
    workspace
}

/// Definition jump: a `;foo` reference resolves to `@foo`'s name range,
/// excluding the leading sigil byte.
#[test]
fn definition_jump_resolves_to_the_bare_name_range() {
    let workspace = open("/root", &[("a.tal", "@foo ADD ;foo JMP2")]);
    let mut analyzer = Analyzer::new("/root/");
    analyzer.analyze(&workspace, &UxntalAssembler::new());

    let ctx = analyzer.current_ctx();
    let source = ctx.source(*ctx.source_by_path.get("a.tal").unwrap());
    let reference = ctx.symbol(source.references[0]);
    let target = ctx.symbol(reference.resolved.expect("reference should resolve"));

    assert_eq!(target.name, "foo");
    assert_eq!(target.range, Range {
        start: Position { line: 0, character: 1 },
        end: Position { line: 0, character: 4 },
    });
}

/// Cross-file reference: an include pulls in the defining file, and the
/// reference resolves across the file boundary with `referenced_by` wired
/// on the definition side too.
#[test]
fn cross_file_reference_resolves_through_an_include() {
    let workspace = open(
        "/root",
        &[("main.tal", "~lib.tal\n;target JMP2"), ("lib.tal", "@target BRK")],
    );
    let mut analyzer = Analyzer::new("/root/");
    analyzer.analyze(&workspace, &UxntalAssembler::new());

    let ctx = analyzer.current_ctx();
    let main = ctx.source(*ctx.source_by_path.get("main.tal").unwrap());
    let lib = ctx.source(*ctx.source_by_path.get("lib.tal").unwrap());

    let reference = ctx.symbol(main.references[0]);
    let target_id = reference.resolved.expect("cross-file reference should resolve");
    let target = ctx.symbol(target_id);
    assert_eq!(target.name, "target");
    assert_eq!(lib.definitions, vec![target_id]);
    assert_eq!(target.referenced_by, vec![main.references[0]]);
}

/// Device-port semantics: a `( buxn:device )` annotation makes zero-page
/// sub-labels in its scope device ports rather than plain variables.
#[test]
fn device_annotation_marks_zero_page_sub_labels_as_device_ports() {
    let workspace = open("/root", &[("dev.tal", "( buxn:device )\n@Console &write $1")]);
    let mut analyzer = Analyzer::new("/root/");
    analyzer.analyze(&workspace, &UxntalAssembler::new());

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

/// Error tolerance: a canned second run that fails mid-file after
/// redefining only the first symbol still surfaces the symbols that lay
/// past the failure point in the last successful run.
struct FlakyAssembler {
    fail_second_run: std::cell::Cell<bool>,
}

impl AssemblerFrontend for FlakyAssembler {
    fn assemble(&self, entry: &str, files: &mut dyn FileResolver) -> Vec<AssemblerEvent> {
        files.resolve(entry);
        let def = |name: &str, byte_offset: usize| {
            AssemblerEvent::SymbolDefined(SymbolEvent {
                name: name.to_string(),
                kind: SymbolKind::Label,
                range: Range::default(),
                byte_offset,
                address: 0x0100,
            })
        };
        let opened = AssemblerEvent::FileOpened { filename: entry.to_string(), included_from: None };
        let closed = AssemblerEvent::FileClosed { filename: entry.to_string() };
        if !self.fail_second_run.replace(true) {
            vec![opened, def("foo", 0), def("bar", 10), def("baz", 20), closed]
        } else {
            vec![
                opened,
                def("foo", 0),
                AssemblerEvent::ParseError { filename: entry.to_string(), byte_offset: 5 },
                closed,
            ]
        }
    }
}

#[test]
fn reanalysis_after_a_mid_file_error_keeps_definitions_past_the_failure_point() {
    let workspace = open("/root", &[("a.tal", "placeholder")]);
    let mut analyzer = Analyzer::new("/root/");
    let assembler = FlakyAssembler { fail_second_run: std::cell::Cell::new(false) };

    analyzer.analyze(&workspace, &assembler);
    analyzer.analyze(&workspace, &assembler);

    let ctx = analyzer.current_ctx();
    let source = ctx.source(*ctx.source_by_path.get("a.tal").unwrap());
    let mut names: Vec<&str> = source.definitions.iter().map(|&id| ctx.symbol(id).name.as_str()).collect();
    names.sort_unstable();
    assert_eq!(names, vec!["bar", "baz", "foo"]);
}
