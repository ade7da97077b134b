//! The `tower_lsp::LanguageServer` implementation: request/notification
//! dispatch, the 200ms debounce-and-reanalyze loop, and diagnostic
//! publication.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tower_lsp::jsonrpc::{Error as RpcError, ErrorCode, Result as RpcResult};
use tower_lsp::lsp_types::*;
use tower_lsp::{Client, LanguageServer};

use rustc_hash::FxHashSet;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::analyzer::Analyzer;
use crate::assembler::uxntal::UxntalAssembler;
use crate::completion;
use crate::graph::{AnalyzerContext, DiagnosticSeverity as GraphSeverity, SourceId, SymbolId, SymbolSemantics};
use crate::position::{self, Position as BytePosition};
use crate::workspace::Workspace;

const DEBOUNCE: Duration = Duration::from_millis(200);

#[derive(Clone)]
pub struct Backend {
    client: Client,
    workspace: Arc<RwLock<Workspace>>,
    analyzer: Arc<RwLock<Analyzer>>,
    assembler: Arc<UxntalAssembler>,
    debounce: Arc<Mutex<Option<JoinHandle<()>>>>,
    published: Arc<Mutex<FxHashSet<Url>>>,
    shutdown: Arc<AtomicBool>,
}

impl Backend {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            workspace: Arc::new(RwLock::new(Workspace::new(""))),
            analyzer: Arc::new(RwLock::new(Analyzer::new(""))),
            assembler: Arc::new(UxntalAssembler::new()),
            debounce: Arc::new(Mutex::new(None)),
            published: Arc::new(Mutex::new(FxHashSet::default())),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Reset the pending debounce timer and arm a new one, matching "reset
    /// rather than stacking". A no-op once `shutdown` has run: the spec's
    /// shutdown contract is "cancels pending analysis and stops arming new
    /// timers," not just a one-time cancel.
    async fn arm_debounce(&self) {
        if self.shutdown.load(Ordering::SeqCst) {
            return;
        }
        let mut slot = self.debounce.lock().await;
        if let Some(handle) = slot.take() {
            handle.abort();
        }
        let this = self.clone();
        *slot = Some(tokio::spawn(async move {
            tokio::time::sleep(DEBOUNCE).await;
            this.reanalyze_and_publish().await;
        }));
    }

    /// Cancel the pending timer without a replacement, used by `shutdown`
    /// and `textDocument/completion`.
    async fn cancel_debounce(&self) {
        let mut slot = self.debounce.lock().await;
        if let Some(handle) = slot.take() {
            handle.abort();
        }
    }

    async fn reanalyze_and_publish(&self) {
        let diagnostics_by_uri = {
            let workspace = self.workspace.read().await;
            let mut analyzer = self.analyzer.write().await;
            analyzer.analyze(&workspace, self.assembler.as_ref());
            group_by_uri(&analyzer.diagnostics)
        };

        let mut published = self.published.lock().await;
        let mut still_present = FxHashSet::default();
        for (uri, diags) in &diagnostics_by_uri {
            still_present.insert(uri.clone());
            self.client.publish_diagnostics(uri.clone(), diags.clone(), None).await;
        }
        for stale in published.difference(&still_present) {
            self.client.publish_diagnostics(stale.clone(), Vec::new(), None).await;
        }
        *published = still_present;
    }

    async fn resolve_path(&self, uri: &Url) -> Option<String> {
        let workspace = self.workspace.read().await;
        match workspace.resolve_path(uri.as_str()) {
            Ok(path) => Some(path),
            Err(err) => {
                tracing::warn!(%err, "document outside workspace root");
                None
            }
        }
    }
}

fn determine_root(params: &InitializeParams) -> Option<String> {
    if let Some(folders) = &params.workspace_folders {
        if let Some(first) = folders.first() {
            if first.uri.scheme() == "file" {
                return Some(first.uri.path().to_string());
            }
        }
    }
    if let Some(uri) = &params.root_uri {
        if uri.scheme() == "file" {
            return Some(uri.path().to_string());
        }
    }
    #[allow(deprecated)]
    if let Some(path) = &params.root_path {
        return Some(path.clone());
    }
    None
}

fn group_by_uri(diagnostics: &[crate::graph::Diagnostic]) -> Vec<(Url, Vec<Diagnostic>)> {
    let mut groups: Vec<(Url, Vec<Diagnostic>)> = Vec::new();
    for diag in diagnostics {
        let Ok(uri) = Url::parse(&diag.location.uri) else { continue };
        let lsp_diag = to_lsp_diagnostic(diag);
        match groups.last_mut() {
            Some((last_uri, items)) if *last_uri == uri => items.push(lsp_diag),
            _ => groups.push((uri, vec![lsp_diag])),
        }
    }
    groups
}

fn to_lsp_diagnostic(diag: &crate::graph::Diagnostic) -> Diagnostic {
    let severity = match diag.severity {
        GraphSeverity::Error => DiagnosticSeverity::ERROR,
        GraphSeverity::Warning => DiagnosticSeverity::WARNING,
        GraphSeverity::Information => DiagnosticSeverity::INFORMATION,
        GraphSeverity::Hint => DiagnosticSeverity::HINT,
    };
    let related_information = diag.related_location.as_ref().and_then(|loc| {
        let uri = Url::parse(&loc.uri).ok()?;
        Some(vec![DiagnosticRelatedInformation {
            location: Location { uri, range: loc.range.into() },
            message: diag.related_message.clone().unwrap_or_default(),
        }])
    });
    Diagnostic {
        range: diag.location.range.into(),
        severity: Some(severity),
        code: None,
        code_description: None,
        source: Some(diag.source.clone()),
        message: diag.message.clone(),
        related_information,
        tags: None,
        data: None,
    }
}

fn symbol_kind_for(semantics: SymbolSemantics) -> SymbolKind {
    match semantics {
        SymbolSemantics::Variable => SymbolKind::FIELD,
        SymbolSemantics::Subroutine => SymbolKind::FUNCTION,
        SymbolSemantics::DevicePort => SymbolKind::CONSTANT,
        SymbolSemantics::Enum => SymbolKind::ENUM_MEMBER,
    }
}

/// The definition/reference symbol whose range contains `pos`, if any.
fn symbol_at(ctx: &AnalyzerContext, source_id: SourceId, pos: BytePosition) -> Option<SymbolId> {
    let source = ctx.source(source_id);
    source
        .definitions
        .iter()
        .chain(source.references.iter())
        .copied()
        .find(|&id| {
            let sym = ctx.symbol(id);
            sym.range.start <= pos && pos <= sym.range.end
        })
}

/// The definition a symbol (whether itself a definition or a reference
/// resolving to one) stands for.
fn definition_for(ctx: &AnalyzerContext, id: SymbolId) -> Option<SymbolId> {
    let sym = ctx.symbol(id);
    if sym.kind.is_definition() { Some(id) } else { sym.resolved }
}

fn location_of(ctx: &AnalyzerContext, id: SymbolId) -> Option<Location> {
    let sym = ctx.symbol(id);
    let uri = Url::parse(&ctx.source(sym.source).uri).ok()?;
    Some(Location { uri, range: sym.range.into() })
}

fn source_line(content: &str, line: u32) -> String {
    let starts = position::line_starts(content);
    let Some(&start) = starts.get(line as usize) else { return String::new() };
    let end = starts.get(line as usize + 1).copied().unwrap_or(content.len());
    content[start..end.min(content.len())].trim_end_matches(['\n', '\r']).to_string()
}

#[tower_lsp::async_trait]
impl LanguageServer for Backend {
    async fn initialize(&self, params: InitializeParams) -> RpcResult<InitializeResult> {
        let Some(root_dir) = determine_root(&params) else {
            return Err(RpcError {
                code: ErrorCode::ServerError(-32602),
                message: "no workspace root could be determined".into(),
                data: None,
            });
        };

        *self.workspace.write().await = Workspace::new(root_dir.clone());
        *self.analyzer.write().await = Analyzer::new(root_dir);

        Ok(InitializeResult {
            capabilities: ServerCapabilities {
                text_document_sync: Some(TextDocumentSyncCapability::Kind(TextDocumentSyncKind::FULL)),
                hover_provider: Some(HoverProviderCapability::Simple(true)),
                definition_provider: Some(OneOf::Left(true)),
                references_provider: Some(OneOf::Left(true)),
                document_symbol_provider: Some(OneOf::Left(true)),
                workspace_symbol_provider: Some(OneOf::Left(true)),
                completion_provider: Some(CompletionOptions {
                    trigger_characters: Some(
                        [';', '=', '!', '?', '.', '-', ',', '_', '/', '&', '|', '`']
                            .iter()
                            .map(|c| c.to_string())
                            .collect(),
                    ),
                    ..Default::default()
                }),
                ..Default::default()
            },
            server_info: Some(ServerInfo {
                name: "buxn-ls".to_string(),
                version: Some(env!("CARGO_PKG_VERSION").to_string()),
            }),
        })
    }

    async fn initialized(&self, _params: InitializedParams) {
        tracing::info!("initialized");
    }

    async fn shutdown(&self) -> RpcResult<()> {
        tracing::info!("shutdown received");
        self.shutdown.store(true, Ordering::SeqCst);
        self.cancel_debounce().await;
        Ok(())
    }

    async fn did_open(&self, params: DidOpenTextDocumentParams) {
        let Some(path) = self.resolve_path(&params.text_document.uri).await else { return };
        self.workspace.write().await.did_open(path, params.text_document.text);
        self.arm_debounce().await;
    }

    async fn did_change(&self, mut params: DidChangeTextDocumentParams) {
        let Some(path) = self.resolve_path(&params.text_document.uri).await else { return };
        let Some(change) = params.content_changes.pop() else { return };
        self.workspace.write().await.did_change(path, change.text);
        self.arm_debounce().await;
    }

    async fn did_close(&self, params: DidCloseTextDocumentParams) {
        let Some(path) = self.resolve_path(&params.text_document.uri).await else { return };
        self.workspace.write().await.did_close(&path);
        self.arm_debounce().await;
    }

    async fn goto_definition(&self, params: GotoDefinitionParams) -> RpcResult<Option<GotoDefinitionResponse>> {
        let uri = params.text_document_position_params.text_document.uri;
        let Some(path) = self.resolve_path(&uri).await else { return Ok(None) };
        let pos: BytePosition = params.text_document_position_params.position.into();

        let analyzer = self.analyzer.read().await;
        let ctx = analyzer.current_ctx();
        let Some(&source_id) = ctx.source_by_path.get(&path) else { return Ok(None) };
        let Some(hit) = symbol_at(ctx, source_id, pos) else { return Ok(None) };
        let Some(def_id) = definition_for(ctx, hit) else { return Ok(None) };

        Ok(location_of(ctx, def_id).map(GotoDefinitionResponse::Scalar))
    }

    async fn references(&self, params: ReferenceParams) -> RpcResult<Option<Vec<Location>>> {
        let uri = params.text_document_position.text_document.uri;
        let Some(path) = self.resolve_path(&uri).await else { return Ok(None) };
        let pos: BytePosition = params.text_document_position.position.into();

        let analyzer = self.analyzer.read().await;
        let ctx = analyzer.current_ctx();
        let Some(&source_id) = ctx.source_by_path.get(&path) else { return Ok(None) };
        let Some(hit) = symbol_at(ctx, source_id, pos) else { return Ok(None) };
        let Some(def_id) = definition_for(ctx, hit) else { return Ok(None) };

        let locations: Vec<Location> = ctx
            .symbol(def_id)
            .referenced_by
            .iter()
            .filter_map(|&ref_id| location_of(ctx, ref_id))
            .collect();
        Ok(Some(locations))
    }

    async fn hover(&self, params: HoverParams) -> RpcResult<Option<Hover>> {
        let uri = params.text_document_position_params.text_document.uri;
        let Some(path) = self.resolve_path(&uri).await else { return Ok(None) };
        let pos: BytePosition = params.text_document_position_params.position.into();

        let analyzer = self.analyzer.read().await;
        let ctx = analyzer.current_ctx();
        let Some(&source_id) = ctx.source_by_path.get(&path) else { return Ok(None) };
        let Some(hit) = symbol_at(ctx, source_id, pos) else { return Ok(None) };
        let Some(def_id) = definition_for(ctx, hit) else { return Ok(None) };

        let def = ctx.symbol(def_id);
        let def_source = ctx.source(def.source);
        let Some(rec) = analyzer.files.get(&def_source.filename) else { return Ok(None) };
        let line = source_line(&rec.content, def.range.start.line);

        Ok(Some(Hover {
            contents: HoverContents::Scalar(MarkedString::String(line)),
            range: Some(def.range.into()),
        }))
    }

    #[allow(deprecated)]
    async fn document_symbol(&self, params: DocumentSymbolParams) -> RpcResult<Option<DocumentSymbolResponse>> {
        let Some(path) = self.resolve_path(&params.text_document.uri).await else { return Ok(None) };

        let analyzer = self.analyzer.read().await;
        let ctx = analyzer.current_ctx();
        let Some(&source_id) = ctx.source_by_path.get(&path) else { return Ok(None) };

        let symbols: Vec<DocumentSymbol> = ctx
            .source(source_id)
            .definitions
            .iter()
            .map(|&id| {
                let def = ctx.symbol(id);
                DocumentSymbol {
                    name: def.name.clone(),
                    detail: None,
                    kind: symbol_kind_for(def.semantics),
                    tags: None,
                    deprecated: None,
                    range: def.range.into(),
                    selection_range: def.range.into(),
                    children: None,
                }
            })
            .collect();

        Ok(Some(DocumentSymbolResponse::Nested(symbols)))
    }

    async fn completion(&self, params: CompletionParams) -> RpcResult<Option<CompletionResponse>> {
        self.cancel_debounce().await;

        let uri = params.text_document_position.text_document.uri;
        let Some(path) = self.resolve_path(&uri).await else { return Ok(None) };
        let cursor: BytePosition = params.text_document_position.position.into();

        let workspace = self.workspace.read().await;
        let Some(text) = workspace.get(&path) else { return Ok(None) };
        let line_starts = position::line_starts(text);
        let cursor_byte = position::position_to_byte_offset(text, &line_starts, cursor);

        let analyzer = self.analyzer.read().await;
        let ctx = analyzer.current_ctx();
        let Some(&source_id) = ctx.source_by_path.get(&path) else { return Ok(None) };

        let items = completion::complete(ctx, source_id, text, &line_starts, cursor_byte);
        Ok(Some(CompletionResponse::Array(items)))
    }

    #[allow(deprecated)]
    async fn symbol(&self, params: WorkspaceSymbolParams) -> RpcResult<Option<Vec<SymbolInformation>>> {
        let query = params.query;
        let analyzer = self.analyzer.read().await;
        let ctx = analyzer.current_ctx();

        let mut results = Vec::new();
        for source in &ctx.sources {
            for &id in &source.definitions {
                let def = ctx.symbol(id);
                if !def.name.starts_with(&query) {
                    continue;
                }
                let Ok(uri) = Url::parse(&source.uri) else { continue };
                results.push(SymbolInformation {
                    name: def.name.clone(),
                    kind: symbol_kind_for(def.semantics),
                    tags: None,
                    deprecated: None,
                    location: Location { uri, range: def.range.into() },
                    container_name: None,
                });
            }
        }
        Ok(Some(results))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::Range;

    /// A `Client` handle with nothing listening on the other end; safe to
    /// hold as long as nothing calls a method on it that actually sends a
    /// notification (which these tests never do).
    fn detached_client() -> Client {
        let captured: Arc<std::sync::Mutex<Option<Client>>> = Arc::new(std::sync::Mutex::new(None));
        let slot = captured.clone();
        let (_service, _socket) = tower_lsp::LspService::build(move |client| {
            *slot.lock().unwrap() = Some(client.clone());
            Backend::new(client)
        })
        .finish();
        let client = captured.lock().unwrap().take().unwrap();
        client
    }

    #[tokio::test]
    async fn shutdown_stops_arming_new_debounce_timers() {
        let backend = Backend::new(detached_client());
        backend.shutdown().await.unwrap();
        backend.arm_debounce().await;
        assert!(backend.debounce.lock().await.is_none());
    }

    #[test]
    fn symbol_kind_matches_the_documented_numeric_values() {
        // FIELD=8, FUNCTION=12, CONSTANT=14, ENUM_MEMBER=22 in the LSP spec's
        // own SymbolKind table; the last two are the pair spec.md names by
        // number rather than by the (misleading, for device ports and enum
        // members) prose label.
        assert_eq!(symbol_kind_for(SymbolSemantics::Variable), SymbolKind::FIELD);
        assert_eq!(symbol_kind_for(SymbolSemantics::Subroutine), SymbolKind::FUNCTION);
        assert_eq!(symbol_kind_for(SymbolSemantics::DevicePort), SymbolKind::CONSTANT);
        assert_eq!(symbol_kind_for(SymbolSemantics::Enum), SymbolKind::ENUM_MEMBER);
    }

    fn diag(uri: &str) -> crate::graph::Diagnostic {
        crate::graph::Diagnostic {
            location: crate::graph::Location { uri: uri.to_string(), range: Range::default() },
            related_location: None,
            severity: GraphSeverity::Error,
            source: "buxn-asm".to_string(),
            message: "bad".to_string(),
            related_message: None,
        }
    }

    #[test]
    fn group_by_uri_batches_adjacent_equal_uris() {
        let diagnostics = vec![diag("file:///a.tal"), diag("file:///a.tal"), diag("file:///b.tal")];
        let groups = group_by_uri(&diagnostics);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].1.len(), 2);
        assert_eq!(groups[1].1.len(), 1);
    }
}
