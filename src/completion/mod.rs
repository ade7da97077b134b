//! Sigil-driven completion: the leading character of the prefix being typed
//! selects a match type (which symbols are candidates), a format type (full
//! name or scope-local name), and how many bytes of the prefix the sigil
//! itself consumes before the user's search text begins.

use rustc_hash::FxHashMap;
use tower_lsp::lsp_types::{
    CompletionItem, CompletionItemKind, CompletionTextEdit, Documentation, InsertTextFormat,
    InsertTextMode, TextEdit,
};

use crate::graph::{AnalyzerContext, SourceId, SymbolId, SymbolKind, SymbolNode, SymbolSemantics};
use crate::position::{self, Position};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MatchType {
    AnyLabel,
    SubroutineLabel,
    ZeroPageLabel,
    LocalLabel,
    SubLabel,
    PrecedingLabel,
    AnySymbol,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FormatType {
    Full,
    Local,
}

/// First-byte sigil dispatch table. Returns the match type, the display
/// format, and how many prefix bytes the sigil occupies (0 for the
/// catch-all "any symbol" case, which has no sigil to strip).
fn dispatch(first: char) -> Option<(MatchType, FormatType, usize)> {
    match first {
        ';' | '=' => Some((MatchType::AnyLabel, FormatType::Full, 1)),
        '!' | '?' => Some((MatchType::SubroutineLabel, FormatType::Full, 1)),
        '.' | '-' => Some((MatchType::ZeroPageLabel, FormatType::Full, 1)),
        ',' | '_' => Some((MatchType::LocalLabel, FormatType::Full, 1)),
        '/' => Some((MatchType::SubLabel, FormatType::Local, 1)),
        '&' => None,
        '|' | '$' => Some((MatchType::PrecedingLabel, FormatType::Full, 1)),
        _ => Some((MatchType::AnySymbol, FormatType::Full, 0)),
    }
}

struct Filter {
    prefix: String,
    labels_only: bool,
    subroutines_only: bool,
    addr_min: u16,
    addr_max: u16,
    preceding_only: bool,
    cursor: Position,
}

fn group_key(name: &str) -> &str {
    name.split('/').next().unwrap_or(name)
}

fn local_name(name: &str) -> &str {
    name.rsplit('/').next().unwrap_or(name)
}

fn is_subroutine(def: &SymbolNode) -> bool {
    def.semantics == SymbolSemantics::Subroutine || local_name(&def.name).starts_with('>')
}

fn match_symbol(def: &SymbolNode, filter: &Filter) -> bool {
    match def.kind {
        SymbolKind::Label => {
            if filter.preceding_only && def.range.start > filter.cursor {
                return false;
            }
            if def.address < filter.addr_min || def.address > filter.addr_max {
                return false;
            }
        }
        SymbolKind::Macro => {
            if filter.labels_only {
                return false;
            }
            // Macros cannot be forward-declared: only suggest ones already defined.
            if def.range.start >= filter.cursor {
                return false;
            }
        }
        SymbolKind::MacroRef | SymbolKind::LabelRef => return false,
    }

    if filter.subroutines_only && !is_subroutine(def) {
        return false;
    }

    def.name.len() >= filter.prefix.len() && def.name.starts_with(&filter.prefix)
}

fn visit_symbols(
    ctx: &AnalyzerContext,
    source_id: SourceId,
    filter: &Filter,
    visited: &mut rustc_hash::FxHashSet<SourceId>,
    out: &mut Vec<SymbolId>,
) {
    if !visited.insert(source_id) {
        return;
    }
    let node = ctx.source(source_id);
    for &id in &node.definitions {
        if match_symbol(ctx.symbol(id), filter) {
            out.push(id);
        }
    }
    for &child in &node.base.out_edges {
        visit_symbols(ctx, child, filter, visited, out);
    }
}

fn current_scope(ctx: &AnalyzerContext, source_id: SourceId, cursor: Position) -> String {
    let mut best: Option<&SymbolNode> = None;
    for &id in &ctx.source(source_id).definitions {
        let def = ctx.symbol(id);
        if def.kind != SymbolKind::Label || def.range.start >= cursor {
            continue;
        }
        if best.is_none_or(|b| def.range.start > b.range.start) {
            best = Some(def);
        }
    }
    match best {
        Some(def) => group_key(&def.name).to_string(),
        None => "RESET".to_string(),
    }
}

fn find_prefix_start(text: &str, cursor_byte: usize) -> usize {
    let bytes = text.as_bytes();
    let mut start = cursor_byte.min(bytes.len());
    while start > 0 && !bytes[start - 1].is_ascii_whitespace() {
        start -= 1;
    }
    start
}

fn kind_for_semantics(semantics: SymbolSemantics) -> CompletionItemKind {
    match semantics {
        SymbolSemantics::Variable => CompletionItemKind::VARIABLE,
        SymbolSemantics::Subroutine => CompletionItemKind::FUNCTION,
        SymbolSemantics::DevicePort => CompletionItemKind::CONSTANT,
        SymbolSemantics::Enum => CompletionItemKind::ENUM_MEMBER,
    }
}

fn detail_for(def: &SymbolNode) -> String {
    if def.semantics == SymbolSemantics::Subroutine {
        format!("( {} )", def.signature)
    } else if def.address <= 0x00ff {
        format!("|0x{:02X}", def.address)
    } else {
        format!("|0x{:04X}", def.address)
    }
}

fn sort_text(active_source: SourceId, source: SourceId, address: u16, name: &str) -> String {
    let is_remote = u8::from(source != active_source);
    format!("{is_remote}:{address:04x}:{name}")
}

fn build_item(
    ctx: &AnalyzerContext,
    active_source: SourceId,
    id: SymbolId,
    label: String,
    edit_range: tower_lsp::lsp_types::Range,
) -> CompletionItem {
    let def = ctx.symbol(id);
    let documentation = (!def.documentation.is_empty())
        .then(|| Documentation::String(def.documentation.clone()));
    CompletionItem {
        label: label.clone(),
        filter_text: Some(label.clone()),
        sort_text: Some(sort_text(active_source, def.source, def.address, &def.name)),
        insert_text_format: Some(InsertTextFormat::PLAIN_TEXT),
        insert_text_mode: Some(InsertTextMode::AS_IS),
        kind: Some(kind_for_semantics(def.semantics)),
        detail: Some(detail_for(def)),
        documentation,
        text_edit: Some(CompletionTextEdit::Edit(TextEdit { range: edit_range, new_text: label })),
        ..Default::default()
    }
}

fn build_module_item(
    ctx: &AnalyzerContext,
    active_source: SourceId,
    key: &str,
    members: &[SymbolId],
    edit_range: tower_lsp::lsp_types::Range,
) -> CompletionItem {
    let address = members.iter().map(|&id| ctx.symbol(id).address).min().unwrap_or(0);
    let source = members.first().map(|&id| ctx.symbol(id).source).unwrap_or(active_source);
    CompletionItem {
        label: key.to_string(),
        filter_text: Some(key.to_string()),
        sort_text: Some(sort_text(active_source, source, address, key)),
        insert_text_format: Some(InsertTextFormat::PLAIN_TEXT),
        insert_text_mode: Some(InsertTextMode::AS_IS),
        kind: Some(CompletionItemKind::MODULE),
        detail: Some(format!("( {} symbols )", members.len())),
        text_edit: Some(CompletionTextEdit::Edit(TextEdit {
            range: edit_range,
            new_text: key.to_string(),
        })),
        ..Default::default()
    }
}

/// Build the completion list for a cursor positioned at `cursor_byte` within
/// `document_text`. Returns an empty list wherever the original contract
/// does (empty prefix, a bare `&` sigil, or no matching symbols).
pub fn complete(
    ctx: &AnalyzerContext,
    active_source: SourceId,
    document_text: &str,
    line_starts: &[usize],
    cursor_byte: usize,
) -> Vec<CompletionItem> {
    let prefix_start = find_prefix_start(document_text, cursor_byte);
    let prefix = &document_text[prefix_start..cursor_byte];
    let Some(first) = prefix.chars().next() else { return Vec::new() };

    let Some((mut match_type, mut format_type, mut anchor)) = dispatch(first) else {
        return Vec::new();
    };
    // Only a literal leading '/' carries the subroutine-only restriction;
    // the second-byte override below produces the same match/format pair
    // for convenience but is not itself a subroutine request.
    let subroutine_restricted_sub_label = match_type == MatchType::SubLabel;

    if anchor == 1 && prefix.len() >= 2 {
        let second = prefix.as_bytes()[1];
        if second == b'&' || second == b'/' {
            match_type = MatchType::SubLabel;
            format_type = FormatType::Local;
            anchor = 2;
        }
    }

    let cursor = position::byte_offset_to_position(document_text, line_starts, cursor_byte);
    let search_text = &prefix[anchor..];
    let prefix = match match_type {
        MatchType::LocalLabel | MatchType::SubLabel => {
            format!("{}/{search_text}", current_scope(ctx, active_source, cursor))
        }
        _ => search_text.to_string(),
    };

    let filter = Filter {
        prefix,
        labels_only: !matches!(match_type, MatchType::AnySymbol),
        subroutines_only: matches!(match_type, MatchType::SubroutineLabel | MatchType::AnySymbol)
            || subroutine_restricted_sub_label,
        addr_min: 0,
        addr_max: if match_type == MatchType::ZeroPageLabel { 0x00ff } else { 0xffff },
        preceding_only: match_type == MatchType::PrecedingLabel,
        cursor,
    };

    let mut candidates = Vec::new();
    let mut visited = rustc_hash::FxHashSet::default();
    visit_symbols(ctx, active_source, &filter, &mut visited, &mut candidates);
    if candidates.is_empty() {
        return Vec::new();
    }

    let anchor_byte = prefix_start + anchor;
    let edit_range = tower_lsp::lsp_types::Range {
        start: position::byte_offset_to_position(document_text, line_starts, anchor_byte).into(),
        end: cursor.into(),
    };

    let display = |def: &SymbolNode| match format_type {
        FormatType::Full => def.name.clone(),
        FormatType::Local => local_name(&def.name).to_string(),
    };

    let grouped = !matches!(match_type, MatchType::LocalLabel | MatchType::SubLabel);
    if !grouped {
        return candidates
            .into_iter()
            .map(|id| build_item(ctx, active_source, id, display(ctx.symbol(id)), edit_range.clone()))
            .collect();
    }

    let mut order = Vec::new();
    let mut groups: FxHashMap<String, Vec<SymbolId>> = FxHashMap::default();
    for id in candidates {
        let key = group_key(&ctx.symbol(id).name).to_string();
        if !groups.contains_key(&key) {
            order.push(key.clone());
        }
        groups.entry(key).or_default().push(id);
    }

    let mut items = Vec::new();
    for key in order {
        let members = &groups[&key];
        if members.len() == 1 {
            let id = members[0];
            items.push(build_item(ctx, active_source, id, display(ctx.symbol(id)), edit_range.clone()));
            continue;
        }
        let root = members.iter().copied().find(|&id| ctx.symbol(id).name == key);
        match root {
            Some(root_id) => {
                let def = ctx.symbol(root_id);
                items.push(build_item(ctx, active_source, root_id, display(def), edit_range.clone()));
                if def.semantics != SymbolSemantics::Enum && def.semantics != SymbolSemantics::DevicePort {
                    items.push(build_module_item(ctx, active_source, &key, members, edit_range.clone()));
                }
            }
            None => items.push(build_module_item(ctx, active_source, &key, members, edit_range.clone())),
        }
    }
    items
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::Analyzer;
    use crate::assembler::uxntal::UxntalAssembler;
    use crate::workspace::Workspace;

    fn analyze_one(path: &str, content: &str) -> (Analyzer, String) {
        let mut workspace = Workspace::new("/root");
        workspace.did_open(path.to_string(), content.to_string());
        let mut analyzer = Analyzer::new("/root/");
        analyzer.analyze(&workspace, &UxntalAssembler::new());
        (analyzer, content.to_string())
    }

    #[test]
    fn sub_label_completion_after_second_byte_override() {
        let source = "@parent &child ADD\n,&c";
        let (analyzer, text) = analyze_one("a.tal", source);
        let ctx = analyzer.current_ctx();
        let source_id = *ctx.source_by_path.get("a.tal").unwrap();
        let starts = position::line_starts(&text);
        let cursor_byte = text.len();

        let items = complete(ctx, source_id, &text, &starts, cursor_byte);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].label, "child");
    }

    #[test]
    fn bare_ampersand_returns_no_suggestions() {
        let (analyzer, text) = analyze_one("a.tal", "@parent &child ADD\n&");
        let ctx = analyzer.current_ctx();
        let source_id = *ctx.source_by_path.get("a.tal").unwrap();
        let starts = position::line_starts(&text);
        let items = complete(ctx, source_id, &text, &starts, text.len());
        assert!(items.is_empty());
    }

    #[test]
    fn zero_page_group_emits_root_and_module() {
        let source = "|0000 @buf &a $1 &b $1\n.bu";
        let (analyzer, text) = analyze_one("a.tal", source);
        let ctx = analyzer.current_ctx();
        let source_id = *ctx.source_by_path.get("a.tal").unwrap();
        let starts = position::line_starts(&text);
        let items = complete(ctx, source_id, &text, &starts, text.len());
        assert!(items.iter().any(|i| i.label == "buf" && i.kind == Some(CompletionItemKind::VARIABLE)));
        assert!(items.iter().any(|i| i.kind == Some(CompletionItemKind::MODULE)));
    }
}
