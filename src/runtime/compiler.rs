// Copyright Motia LLC and/or licensed to Motia LLC under one or more
// contributor license agreements. Licensed under the Elastic License 2.0;
// you may not use this file except in compliance with the Elastic License 2.0.
// This software is patent protected. We welcome discussions - reach out at support@motia.dev
// See LICENSE and PATENTS files for details.

//! TypeScript to CommonJS compiler.
//!
//! The source is parsed with swc and then rewritten textually: every type-only
//! construct is erased by span, TypeScript-only runtime constructs (enums,
//! parameter properties) are lowered, and ES module syntax is rewritten into
//! `require`/`exports` form. Everything else is emitted byte for byte, so the
//! output keeps the author's formatting and line structure.

use std::{
    collections::{HashMap, HashSet},
    fmt,
};

use serde::Serialize;
use swc_common::{BytePos, FileName, SourceMap, Span, Spanned, sync::Lrc};
use swc_ecma_ast::{
    AssignPat, CallExpr, Callee, Class, ClassMember, Constructor, Decl, DefaultDecl, ExportAll,
    ExportDecl, ExportDefaultDecl, ExportDefaultExpr, ExportSpecifier, Expr, Function, Ident,
    ImportDecl, ImportSpecifier, Lit, Module, ModuleDecl, ModuleExportName, ModuleItem,
    NamedExport, ObjectPatProp, Param, ParamOrTsParamProp, Pat, Stmt, TsAsExpr, TsConstAssertion,
    TsEnumDecl, TsEnumMemberId, TsExprWithTypeArgs, TsInstantiation, TsInterfaceDecl,
    TsNonNullExpr, TsParamPropParam, TsSatisfiesExpr, TsType, TsTypeAliasDecl, TsTypeAnn,
    TsTypeAssertion, TsTypeParamDecl, TsTypeParamInstantiation, UnaryOp, VarDeclarator,
};
use swc_ecma_parser::{Parser, StringInput, Syntax, TsSyntax};
use swc_ecma_visit::{Visit, VisitWith};

pub const DEFAULT_MAX_SOURCE_BYTES: usize = 512 * 1024;

const MODULE_HEADER: &str =
    "\"use strict\";\nObject.defineProperty(exports, \"__esModule\", { value: true });\n";

const IMPORT_DEFAULT_HELPER: &str =
    "function __importDefault(mod) { return mod && mod.__esModule ? mod.default : mod; }\n";

const EXPORT_STAR_HELPER: &str = "function __exportStar(mod, target) { for (const key in mod) { if (key !== \"default\" && !Object.prototype.hasOwnProperty.call(target, key)) target[key] = mod[key]; } }\n";

const DYNAMIC_IMPORT_HELPER: &str = "function __dynamicImport(specifier) { return new Promise(function (resolve) { resolve(require(specifier)); }); }\n";

const CLASS_MODIFIERS: &[&str] = &[
    "public",
    "private",
    "protected",
    "readonly",
    "abstract",
    "override",
    "declare",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompileError {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column: Option<usize>,
}

impl CompileError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            line: None,
            column: None,
        }
    }

    fn at(message: impl Into<String>, source: &str, offset: usize) -> Self {
        let (line, column) = location(source, offset);
        Self {
            message: message.into(),
            line: Some(line),
            column: Some(column),
        }
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.line, self.column) {
            (Some(line), Some(column)) => write!(f, "{} ({}:{})", self.message, line, column),
            _ => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for CompileError {}

/// Result of [`Compiler::safe_compile`], serialised as-is by the `/compile`
/// preview endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct CompileOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compiled: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<CompileError>,
}

#[derive(Debug, Clone)]
pub struct Compiler {
    max_source_bytes: usize,
}

impl Default for Compiler {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SOURCE_BYTES)
    }
}

impl Compiler {
    pub fn new(max_source_bytes: usize) -> Self {
        Self { max_source_bytes }
    }

    pub fn compile(&self, source: &str) -> Result<String, CompileError> {
        if source.len() > self.max_source_bytes {
            return Err(CompileError::new(format!(
                "source is {} bytes, the limit is {} bytes",
                source.len(),
                self.max_source_bytes
            )));
        }

        let cm: Lrc<SourceMap> = Default::default();
        let fm = cm.new_source_file(
            Lrc::new(FileName::Custom("function.ts".into())),
            source.to_string(),
        );
        let base = fm.start_pos;

        let syntax = Syntax::Typescript(TsSyntax {
            tsx: false,
            decorators: false,
            ..Default::default()
        });
        let input = StringInput::new(source, fm.start_pos, fm.end_pos);
        let mut parser = Parser::new(syntax, input, Default::default());

        let module = match parser.parse_module() {
            Ok(module) => module,
            Err(err) => {
                let offset = offset_of(base, err.span().lo());
                return Err(CompileError::at(err.kind().msg(), source, offset));
            }
        };
        if let Some(err) = parser.take_errors().into_iter().next() {
            let offset = offset_of(base, err.span().lo());
            return Err(CompileError::at(err.kind().msg(), source, offset));
        }

        let mut references = ReferenceCollector::default();
        module.visit_with(&mut references);

        let mut rewriter = Rewriter::new(source, base, references.counts);
        rewriter.collect_type_names(&module);
        rewriter.rewrite(&module);
        rewriter.finish()
    }

    pub fn safe_compile(&self, source: &str) -> CompileOutcome {
        match self.compile(source) {
            Ok(compiled) => CompileOutcome {
                success: true,
                compiled: Some(compiled),
                error: None,
            },
            Err(error) => CompileOutcome {
                success: false,
                compiled: None,
                error: Some(error),
            },
        }
    }
}

/// Compiles with the default source limit.
pub fn compile(source: &str) -> Result<String, CompileError> {
    Compiler::default().compile(source)
}

pub fn safe_compile(source: &str) -> CompileOutcome {
    Compiler::default().safe_compile(source)
}

fn offset_of(base: BytePos, pos: BytePos) -> usize {
    pos.0.saturating_sub(base.0) as usize
}

/// 1-based line and column of a byte offset.
fn location(source: &str, offset: usize) -> (usize, usize) {
    let offset = offset.min(source.len());
    let before = source.get(..offset).unwrap_or(source);
    let line = before.matches('\n').count() + 1;
    let line_start = before.rfind('\n').map(|i| i + 1).unwrap_or(0);
    let column = before[line_start..].chars().count() + 1;
    (line, column)
}

// =============================================================================
// Value references
// =============================================================================

/// Counts identifiers used in value positions, so imports that only feed type
/// positions can be dropped.
#[derive(Default)]
struct ReferenceCollector {
    counts: HashMap<String, usize>,
}

impl Visit for ReferenceCollector {
    fn visit_ident(&mut self, ident: &Ident) {
        *self.counts.entry(ident.sym.to_string()).or_default() += 1;
    }

    fn visit_import_decl(&mut self, _: &ImportDecl) {}
    fn visit_ts_type(&mut self, _: &TsType) {}
    fn visit_ts_type_ann(&mut self, _: &TsTypeAnn) {}
    fn visit_ts_type_param_decl(&mut self, _: &TsTypeParamDecl) {}
    fn visit_ts_type_param_instantiation(&mut self, _: &TsTypeParamInstantiation) {}
    fn visit_ts_interface_decl(&mut self, _: &TsInterfaceDecl) {}
    fn visit_ts_type_alias_decl(&mut self, _: &TsTypeAliasDecl) {}
    fn visit_ts_expr_with_type_args(&mut self, _: &TsExprWithTypeArgs) {}
}

// =============================================================================
// Rewriter
// =============================================================================

struct Edit {
    start: usize,
    end: usize,
    text: String,
}

#[derive(Default)]
struct Helpers {
    import_default: bool,
    export_star: bool,
    dynamic_import: bool,
}

struct Rewriter<'a> {
    src: &'a str,
    base: BytePos,
    references: HashMap<String, usize>,
    type_names: HashSet<String>,
    edits: Vec<Edit>,
    trailer: Vec<String>,
    helpers: Helpers,
    temps: usize,
    error: Option<CompileError>,
}

impl<'a> Rewriter<'a> {
    fn new(src: &'a str, base: BytePos, references: HashMap<String, usize>) -> Self {
        Self {
            src,
            base,
            references,
            type_names: HashSet::new(),
            edits: Vec::new(),
            trailer: Vec::new(),
            helpers: Helpers::default(),
            temps: 0,
            error: None,
        }
    }

    fn lo(&self, span: Span) -> usize {
        offset_of(self.base, span.lo())
    }

    fn hi(&self, span: Span) -> usize {
        offset_of(self.base, span.hi())
    }

    fn text(&self, span: Span) -> &'a str {
        let src: &'a str = self.src;
        src.get(self.lo(span)..self.hi(span)).unwrap_or_default()
    }

    fn replace(&mut self, start: usize, end: usize, text: impl Into<String>) {
        self.edits.push(Edit {
            start,
            end,
            text: text.into(),
        });
    }

    fn remove(&mut self, start: usize, end: usize) {
        if start < end {
            self.replace(start, end, "");
        }
    }

    fn remove_span(&mut self, span: Span) {
        let (start, end) = (self.lo(span), self.hi(span));
        self.remove(start, end);
    }

    /// Removes an erased declaration together with a leading `declare`.
    fn remove_declaration(&mut self, span: Span) {
        let mut start = self.lo(span);
        let before = self.src[..start].trim_end();
        if let Some(rest) = before.strip_suffix("declare") {
            if !rest.ends_with(|c: char| c.is_alphanumeric() || c == '_' || c == '$') {
                start = rest.len();
            }
        }
        let end = self.hi(span);
        self.remove(start, end);
    }

    fn insert(&mut self, at: usize, text: impl Into<String>) {
        self.replace(at, at, text);
    }

    fn fail(&mut self, span: Span, message: impl Into<String>) {
        if self.error.is_none() {
            self.error = Some(CompileError::at(message, self.src, self.lo(span)));
        }
    }

    fn temp(&mut self, prefix: &str) -> String {
        self.temps += 1;
        format!("{}{}", prefix, self.temps)
    }

    fn is_referenced(&self, name: &str) -> bool {
        self.references.get(name).is_some_and(|count| *count > 0)
    }

    /// Offset just past `words`, skipping whitespace around them.
    fn skip_words(&self, mut at: usize, words: &[&str]) -> usize {
        for word in words {
            at = self.skip_whitespace(at);
            if self.src[at..].starts_with(word) {
                at += word.len();
            }
        }
        self.skip_whitespace(at)
    }

    fn skip_whitespace(&self, at: usize) -> usize {
        let rest = &self.src[at..];
        at + (rest.len() - rest.trim_start().len())
    }

    /// Removes a single-character `?` or `!` marker following `at`.
    fn remove_marker_after(&mut self, at: usize, marker: char) {
        let at = self.skip_whitespace(at.min(self.src.len()));
        if self.src[at..].starts_with(marker) {
            self.remove(at, at + marker.len_utf8());
        }
    }

    /// Removes a type annotation including its leading colon.
    fn remove_type_annotation(&mut self, span: Span) {
        let mut start = self.lo(span);
        let end = self.hi(span);
        if !self.src[start..].starts_with(':') {
            let before = self.src[..start].trim_end();
            if before.ends_with(':') {
                start = before.len() - 1;
            }
        }
        self.remove(start, end);
    }

    /// Drops TypeScript-only modifier words between `start` and `end`.
    fn strip_modifiers(&mut self, start: usize, end: usize) {
        if start >= end {
            return;
        }
        let region = &self.src[start..end];
        let words: Vec<&str> = region.split_whitespace().collect();
        if !words.iter().any(|w| CLASS_MODIFIERS.contains(w)) {
            return;
        }
        let kept: Vec<&str> = words
            .into_iter()
            .filter(|w| !CLASS_MODIFIERS.contains(w))
            .collect();
        let text = if kept.is_empty() {
            String::new()
        } else {
            format!("{} ", kept.join(" "))
        };
        self.replace(start, end, text);
    }

    fn export_name(&self, name: &ModuleExportName) -> &'a str {
        match name {
            ModuleExportName::Ident(ident) => self.text(ident.span),
            ModuleExportName::Str(s) => self.text(s.span),
        }
    }

    fn collect_type_names(&mut self, module: &Module) {
        for item in &module.body {
            match item {
                ModuleItem::Stmt(Stmt::Decl(decl))
                | ModuleItem::ModuleDecl(ModuleDecl::ExportDecl(ExportDecl { decl, .. })) => {
                    match decl {
                        Decl::TsInterface(d) => {
                            self.type_names.insert(d.id.sym.to_string());
                        }
                        Decl::TsTypeAlias(d) => {
                            self.type_names.insert(d.id.sym.to_string());
                        }
                        _ => {}
                    }
                }
                ModuleItem::ModuleDecl(ModuleDecl::Import(import)) => {
                    for spec in &import.specifiers {
                        let (local, type_only) = match spec {
                            ImportSpecifier::Named(named) => (&named.local, named.is_type_only),
                            ImportSpecifier::Default(default) => (&default.local, false),
                            ImportSpecifier::Namespace(ns) => (&ns.local, false),
                        };
                        if import.type_only || type_only {
                            self.type_names.insert(local.sym.to_string());
                        }
                    }
                }
                _ => {}
            }
        }
    }

    fn rewrite(&mut self, module: &Module) {
        if module.shebang.is_some() {
            let end = self.src.find('\n').unwrap_or(self.src.len());
            self.remove(0, end);
        }
        for item in &module.body {
            match item {
                ModuleItem::ModuleDecl(decl) => self.module_decl(decl),
                ModuleItem::Stmt(stmt) => stmt.visit_with(self),
            }
        }
    }

    fn finish(mut self) -> Result<String, CompileError> {
        if let Some(error) = self.error.take() {
            return Err(error);
        }

        self.edits.sort_by_key(|edit| edit.start);

        let mut body = String::with_capacity(self.src.len() + 256);
        let mut cursor = 0;
        for edit in &self.edits {
            if edit.start < cursor {
                continue;
            }
            body.push_str(&self.src[cursor..edit.start]);
            body.push_str(&edit.text);
            cursor = edit.end;
        }
        body.push_str(&self.src[cursor..]);

        let mut out = String::with_capacity(body.len() + 512);
        out.push_str(MODULE_HEADER);
        if self.helpers.import_default {
            out.push_str(IMPORT_DEFAULT_HELPER);
        }
        if self.helpers.export_star {
            out.push_str(EXPORT_STAR_HELPER);
        }
        if self.helpers.dynamic_import {
            out.push_str(DYNAMIC_IMPORT_HELPER);
        }
        out.push_str(&body);
        if !self.trailer.is_empty() {
            if !out.ends_with('\n') {
                out.push('\n');
            }
            for line in &self.trailer {
                out.push_str(line);
                out.push('\n');
            }
        }
        Ok(out)
    }

    // -------------------------------------------------------------------------
    // Modules
    // -------------------------------------------------------------------------

    fn module_decl(&mut self, decl: &ModuleDecl) {
        match decl {
            ModuleDecl::Import(import) => self.import(import),
            ModuleDecl::ExportDecl(export) => self.export_decl(export),
            ModuleDecl::ExportDefaultDecl(export) => self.export_default_decl(export),
            ModuleDecl::ExportDefaultExpr(export) => self.export_default_expr(export),
            ModuleDecl::ExportNamed(export) => self.export_named(export),
            ModuleDecl::ExportAll(export) => self.export_all(export),
            ModuleDecl::TsImportEquals(import) => {
                if import.is_type_only {
                    self.remove_span(import.span);
                } else {
                    self.fail(
                        import.span,
                        "`import x = require()` is not supported, use an ES import",
                    );
                }
            }
            ModuleDecl::TsExportAssignment(export) => {
                self.fail(export.span, "`export =` is not supported, use `export default`");
            }
            ModuleDecl::TsNamespaceExport(export) => self.remove_span(export.span),
        }
    }

    fn import(&mut self, import: &ImportDecl) {
        if import.type_only {
            self.remove_span(import.span);
            return;
        }
        let source = self.text(import.src.span);
        let (start, end) = (self.lo(import.span), self.hi(import.span));

        if import.specifiers.is_empty() {
            self.replace(start, end, format!("require({});", source));
            return;
        }

        let mut default = None;
        let mut namespace = None;
        let mut named = Vec::new();
        for spec in &import.specifiers {
            match spec {
                ImportSpecifier::Named(spec) => {
                    let local = self.text(spec.local.span);
                    if spec.is_type_only || !self.is_referenced(local) {
                        continue;
                    }
                    let imported = spec.imported.as_ref().map(|name| self.export_name(name));
                    named.push(match imported {
                        Some(imported) if imported != local => format!("{}: {}", imported, local),
                        _ => local.to_string(),
                    });
                }
                ImportSpecifier::Default(spec) => {
                    let local = self.text(spec.local.span);
                    if self.is_referenced(local) {
                        default = Some(local);
                    }
                }
                ImportSpecifier::Namespace(spec) => {
                    let local = self.text(spec.local.span);
                    if self.is_referenced(local) {
                        namespace = Some(local);
                    }
                }
            }
        }

        let bindings =
            usize::from(default.is_some()) + usize::from(namespace.is_some()) + usize::from(!named.is_empty());
        if bindings == 0 {
            self.remove(start, end);
            return;
        }

        let mut statements = Vec::new();
        let module = if bindings > 1 {
            let temp = self.temp("__import");
            statements.push(format!("const {} = require({});", temp, source));
            temp
        } else {
            format!("require({})", source)
        };
        if let Some(local) = namespace {
            statements.push(format!("const {} = {};", local, module));
        }
        if let Some(local) = default {
            self.helpers.import_default = true;
            statements.push(format!("const {} = __importDefault({});", local, module));
        }
        if !named.is_empty() {
            statements.push(format!("const {{ {} }} = {};", named.join(", "), module));
        }
        self.replace(start, end, statements.join(" "));
    }

    fn export_decl(&mut self, export: &ExportDecl) {
        if decl_is_erased(&export.decl) {
            self.remove_span(export.span);
            return;
        }
        let start = self.lo(export.span);
        let decl_start = self.lo(export.decl.span());
        self.remove(start, decl_start);
        self.decl(&export.decl);

        let mut names = Vec::new();
        declared_names(&export.decl, &mut names);
        if names.is_empty() {
            return;
        }
        let end = self.hi(export.span);
        let separator = if self.src[..end].trim_end().ends_with([';', '}']) {
            "\n"
        } else {
            ";\n"
        };
        let assignments: Vec<String> = names
            .iter()
            .map(|name| format!("exports.{} = {};", name, name))
            .collect();
        self.insert(end, format!("{}{}", separator, assignments.join(" ")));
    }

    fn export_default_decl(&mut self, export: &ExportDefaultDecl) {
        let start = self.lo(export.span);
        let end = self.hi(export.span);
        let inner = self.skip_words(start, &["export", "default"]);

        match &export.decl {
            DefaultDecl::TsInterfaceDecl(_) => self.remove(start, end),
            DefaultDecl::Fn(f) if f.function.body.is_none() => self.remove(start, end),
            DefaultDecl::Fn(f) => {
                self.function(&f.function);
                self.assign_default(start, inner, end, f.ident.as_ref());
            }
            DefaultDecl::Class(c) => {
                self.class(&c.class);
                self.assign_default(start, inner, end, c.ident.as_ref());
            }
        }
    }

    fn assign_default(&mut self, start: usize, inner: usize, end: usize, ident: Option<&Ident>) {
        match ident {
            Some(ident) => {
                self.remove(start, inner);
                self.insert(end, format!("\nexports.default = {};", ident.sym));
            }
            None => {
                self.replace(start, inner, "exports.default = ");
                self.insert(end, ";");
            }
        }
    }

    fn export_default_expr(&mut self, export: &ExportDefaultExpr) {
        let start = self.lo(export.span);
        let end = self.hi(export.span);
        if let Expr::Ident(ident) = &*export.expr {
            if self.type_names.contains(ident.sym.as_ref()) {
                self.remove(start, end);
                return;
            }
        }
        let inner = self.skip_words(start, &["export", "default"]);
        self.replace(start, inner, "exports.default = ");
        export.expr.visit_with(self);
        if !self.text(export.span).trim_end().ends_with(';') {
            self.insert(end, ";");
        }
    }

    fn export_named(&mut self, export: &NamedExport) {
        let (start, end) = (self.lo(export.span), self.hi(export.span));
        if export.type_only {
            self.remove(start, end);
            return;
        }

        match &export.src {
            None => {
                for spec in &export.specifiers {
                    let ExportSpecifier::Named(spec) = spec else {
                        continue;
                    };
                    if spec.is_type_only {
                        continue;
                    }
                    let orig = self.export_name(&spec.orig);
                    if self.type_names.contains(orig) {
                        continue;
                    }
                    let exported = spec
                        .exported
                        .as_ref()
                        .map(|name| self.export_name(name))
                        .unwrap_or(orig);
                    self.trailer
                        .push(format!("exports{} = {};", member(exported), orig));
                }
                self.remove(start, end);
            }
            Some(src) => {
                let source = self.text(src.span);
                let temp = self.temp("__reexport");
                let mut statements = Vec::new();
                for spec in &export.specifiers {
                    match spec {
                        ExportSpecifier::Namespace(spec) => {
                            let name = self.export_name(&spec.name);
                            statements.push(format!("exports{} = {};", member(name), temp));
                        }
                        ExportSpecifier::Default(spec) => {
                            statements.push(format!(
                                "exports.{} = {}.default;",
                                spec.exported.sym, temp
                            ));
                        }
                        ExportSpecifier::Named(spec) => {
                            if spec.is_type_only {
                                continue;
                            }
                            let orig = self.export_name(&spec.orig);
                            let exported = spec
                                .exported
                                .as_ref()
                                .map(|name| self.export_name(name))
                                .unwrap_or(orig);
                            statements.push(format!(
                                "exports{} = {}{};",
                                member(exported),
                                temp,
                                member(orig)
                            ));
                        }
                    }
                }
                if statements.is_empty() {
                    self.remove(start, end);
                } else {
                    statements.insert(0, format!("const {} = require({});", temp, source));
                    self.replace(start, end, statements.join(" "));
                }
            }
        }
    }

    fn export_all(&mut self, export: &ExportAll) {
        if export.type_only {
            self.remove_span(export.span);
            return;
        }
        self.helpers.export_star = true;
        let source = self.text(export.src.span);
        let (start, end) = (self.lo(export.span), self.hi(export.span));
        self.replace(start, end, format!("__exportStar(require({}), exports);", source));
    }

    // -------------------------------------------------------------------------
    // Declarations
    // -------------------------------------------------------------------------

    fn decl(&mut self, decl: &Decl) {
        match decl {
            Decl::TsModule(module) if !module.declare && !module.global => {
                self.fail(module.span, "namespace declarations are not supported");
            }
            Decl::TsEnum(e) if !e.declare => {
                let lowered = self.lower_enum(e);
                let (start, end) = (self.lo(e.span), self.hi(e.span));
                self.replace(start, end, lowered);
            }
            decl if decl_is_erased(decl) => self.remove_declaration(decl.span()),
            Decl::Fn(f) => self.function(&f.function),
            Decl::Class(c) => self.class(&c.class),
            other => other.visit_children_with(self),
        }
    }

    fn lower_enum(&mut self, e: &TsEnumDecl) -> String {
        let name = e.id.sym.to_string();
        let mut body = String::new();
        let mut next = Some(0f64);
        let mut members = HashSet::new();

        for m in &e.members {
            let (key, member_name) = match &m.id {
                TsEnumMemberId::Ident(ident) => (quote(ident.sym.as_ref()), ident.sym.to_string()),
                TsEnumMemberId::Str(s) => (self.text(s.span).to_string(), s.value.to_string()),
            };
            match m.init.as_deref() {
                None => match next {
                    Some(value) => {
                        body.push_str(&numeric_member(&name, &key, &format_number(value)));
                        next = Some(value + 1.0);
                    }
                    None => {
                        self.fail(m.span, format!("enum member {} must have an initializer", key));
                        return String::new();
                    }
                },
                Some(Expr::Lit(Lit::Str(s))) => {
                    body.push_str(&format!("    {}[{}] = {};\n", name, key, self.text(s.span)));
                    next = None;
                }
                Some(init) => match numeric_literal(init) {
                    Some(value) => {
                        body.push_str(&numeric_member(&name, &key, &format_number(value)));
                        next = Some(value + 1.0);
                    }
                    None => {
                        let value = self.qualify_members(init, &name, &members);
                        body.push_str(&numeric_member(&name, &key, &value));
                        next = None;
                    }
                },
            }
            members.insert(member_name);
        }

        format!(
            "var {name};\n(function ({name}) {{\n{body}}})({name} || ({name} = {{}}));",
            name = name,
            body = body
        )
    }

    /// Source text of an enum initializer with bare references to earlier
    /// members rewritten to `Enum.member`.
    fn qualify_members(&self, init: &Expr, name: &str, members: &HashSet<String>) -> String {
        let mut collector = MemberReferences {
            members,
            spans: Vec::new(),
        };
        init.visit_with(&mut collector);

        let start = self.lo(init.span());
        let text = self.text(init.span());
        let mut out = String::with_capacity(text.len());
        let mut cursor = 0;
        let mut spans = collector.spans;
        spans.sort_by_key(|span| span.lo());
        for span in spans {
            let at = self.lo(span).saturating_sub(start);
            if at < cursor || at > text.len() {
                continue;
            }
            out.push_str(&text[cursor..at]);
            out.push_str(name);
            out.push('.');
            cursor = at;
        }
        out.push_str(&text[cursor..]);
        out
    }

    fn function(&mut self, function: &Function) {
        let mut params = function.params.as_slice();
        if let Some(first) = params.first().filter(|param| is_this_param(param)) {
            let start = self.lo(first.span);
            let end = match params.get(1) {
                Some(next) => self.lo(next.span),
                None => self.hi(first.span),
            };
            self.remove(start, end);
            params = &params[1..];
        }
        for param in params {
            param.visit_with(self);
        }
        if let Some(type_params) = &function.type_params {
            type_params.visit_with(self);
        }
        if let Some(return_type) = &function.return_type {
            return_type.visit_with(self);
        }
        if let Some(body) = &function.body {
            body.visit_with(self);
        }
    }

    fn class(&mut self, class: &Class) {
        if let Some(decorator) = class.decorators.first() {
            self.fail(decorator.span, "decorators are not supported");
            return;
        }
        if class.is_abstract {
            self.remove_abstract_keyword(class.span);
        }
        if let (Some(first), Some(last)) = (class.implements.first(), class.implements.last()) {
            let first_lo = self.lo(first.span);
            if let Some(keyword) = self.src[..first_lo].rfind("implements") {
                let start = self.src[..keyword].trim_end().len();
                let end = self.hi(last.span);
                self.remove(start, end);
            }
        }
        if let Some(type_params) = &class.type_params {
            type_params.visit_with(self);
        }
        if let Some(super_class) = &class.super_class {
            super_class.visit_with(self);
        }
        if let Some(type_args) = &class.super_type_params {
            type_args.visit_with(self);
        }
        for member in &class.body {
            self.class_member(member);
        }
    }

    fn remove_abstract_keyword(&mut self, class_span: Span) {
        let start = self.lo(class_span);
        if self.src[start..].starts_with("abstract") {
            let end = self.skip_whitespace(start + "abstract".len());
            self.remove(start, end);
            return;
        }
        let before = self.src[..start].trim_end();
        if before.ends_with("abstract") {
            let keyword = before.len() - "abstract".len();
            self.remove(keyword, start);
        }
    }

    fn class_member(&mut self, member: &ClassMember) {
        match member {
            ClassMember::Constructor(ctor) => self.constructor(ctor),
            ClassMember::Method(method) => {
                if method.function.body.is_none() || method.is_abstract {
                    self.remove_span(method.span);
                    return;
                }
                let key = method.key.span();
                self.strip_modifiers(self.lo(method.span), self.lo(key));
                if method.is_optional {
                    self.remove_marker_after(self.hi(key), '?');
                }
                method.key.visit_with(self);
                self.function(&method.function);
            }
            ClassMember::PrivateMethod(method) => {
                if method.function.body.is_none() || method.is_abstract {
                    self.remove_span(method.span);
                    return;
                }
                let key = method.key.span;
                self.strip_modifiers(self.lo(method.span), self.lo(key));
                if method.is_optional {
                    self.remove_marker_after(self.hi(key), '?');
                }
                self.function(&method.function);
            }
            ClassMember::ClassProp(prop) => {
                if prop.declare || prop.is_abstract {
                    self.remove_span(prop.span);
                    return;
                }
                if let Some(decorator) = prop.decorators.first() {
                    self.fail(decorator.span, "decorators are not supported");
                    return;
                }
                let key = prop.key.span();
                self.strip_modifiers(self.lo(prop.span), self.lo(key));
                if prop.is_optional {
                    self.remove_marker_after(self.hi(key), '?');
                }
                if prop.definite {
                    self.remove_marker_after(self.hi(key), '!');
                }
                prop.key.visit_with(self);
                if let Some(type_ann) = &prop.type_ann {
                    type_ann.visit_with(self);
                }
                if let Some(value) = &prop.value {
                    value.visit_with(self);
                }
            }
            ClassMember::PrivateProp(prop) => {
                let key = prop.key.span;
                self.strip_modifiers(self.lo(prop.span), self.lo(key));
                if prop.is_optional {
                    self.remove_marker_after(self.hi(key), '?');
                }
                if prop.definite {
                    self.remove_marker_after(self.hi(key), '!');
                }
                if let Some(type_ann) = &prop.type_ann {
                    type_ann.visit_with(self);
                }
                if let Some(value) = &prop.value {
                    value.visit_with(self);
                }
            }
            ClassMember::TsIndexSignature(signature) => self.remove_span(signature.span),
            ClassMember::AutoAccessor(accessor) => {
                self.fail(accessor.span, "auto-accessor fields are not supported");
            }
            ClassMember::StaticBlock(_) | ClassMember::Empty(_) => member.visit_children_with(self),
        }
    }

    fn constructor(&mut self, ctor: &Constructor) {
        let Some(body) = &ctor.body else {
            self.remove_span(ctor.span);
            return;
        };
        self.strip_modifiers(self.lo(ctor.span), self.lo(ctor.key.span()));

        let mut properties = Vec::new();
        for param in &ctor.params {
            match param {
                ParamOrTsParamProp::Param(param) => param.visit_with(self),
                ParamOrTsParamProp::TsParamProp(prop) => {
                    let (inner, name) = match &prop.param {
                        TsParamPropParam::Ident(binding) => {
                            (self.lo(binding.id.span), binding.id.sym.to_string())
                        }
                        TsParamPropParam::Assign(assign) => {
                            (self.lo(assign.span), assign_name(assign))
                        }
                    };
                    let start = self.lo(prop.span);
                    self.remove(start, inner);
                    prop.param.visit_with(self);
                    properties.push(name);
                }
            }
        }

        if !properties.is_empty() {
            let assignments: String = properties
                .iter()
                .map(|name| format!(" this.{} = {};", name, name))
                .collect();
            let at = match body.stmts.first() {
                Some(first) if is_super_call(first) => self.hi(first.span()),
                _ => self.lo(body.span) + 1,
            };
            self.insert(at, assignments);
        }
        body.visit_with(self);
    }
}

impl Visit for Rewriter<'_> {
    fn visit_decl(&mut self, decl: &Decl) {
        self.decl(decl);
    }

    fn visit_function(&mut self, function: &Function) {
        self.function(function);
    }

    fn visit_class(&mut self, class: &Class) {
        self.class(class);
    }

    fn visit_param(&mut self, param: &Param) {
        if let Some(decorator) = param.decorators.first() {
            self.fail(decorator.span, "decorators are not supported");
            return;
        }
        param.pat.visit_with(self);
    }

    fn visit_ts_type_ann(&mut self, type_ann: &TsTypeAnn) {
        self.remove_type_annotation(type_ann.span);
    }

    fn visit_ts_type_param_decl(&mut self, params: &TsTypeParamDecl) {
        self.remove_span(params.span);
    }

    fn visit_ts_type_param_instantiation(&mut self, args: &TsTypeParamInstantiation) {
        self.remove_span(args.span);
    }

    fn visit_binding_ident(&mut self, binding: &swc_ecma_ast::BindingIdent) {
        if binding.id.optional {
            let after_name = self.lo(binding.id.span) + binding.id.sym.len();
            self.remove_marker_after(after_name, '?');
        }
        if let Some(type_ann) = &binding.type_ann {
            type_ann.visit_with(self);
        }
    }

    fn visit_var_declarator(&mut self, declarator: &VarDeclarator) {
        if let (true, Pat::Ident(binding)) = (declarator.definite, &declarator.name) {
            let after_name = self.lo(binding.id.span) + binding.id.sym.len();
            self.remove_marker_after(after_name, '!');
        }
        declarator.visit_children_with(self);
    }

    fn visit_ts_as_expr(&mut self, expr: &TsAsExpr) {
        let (start, end) = (self.hi(expr.expr.span()), self.hi(expr.span));
        self.remove(start, end);
        expr.expr.visit_with(self);
    }

    fn visit_ts_satisfies_expr(&mut self, expr: &TsSatisfiesExpr) {
        let (start, end) = (self.hi(expr.expr.span()), self.hi(expr.span));
        self.remove(start, end);
        expr.expr.visit_with(self);
    }

    fn visit_ts_const_assertion(&mut self, expr: &TsConstAssertion) {
        let (start, end) = (self.hi(expr.expr.span()), self.hi(expr.span));
        self.remove(start, end);
        expr.expr.visit_with(self);
    }

    fn visit_ts_non_null_expr(&mut self, expr: &TsNonNullExpr) {
        let (start, end) = (self.hi(expr.expr.span()), self.hi(expr.span));
        self.remove(start, end);
        expr.expr.visit_with(self);
    }

    fn visit_ts_instantiation(&mut self, expr: &TsInstantiation) {
        let (start, end) = (self.hi(expr.expr.span()), self.hi(expr.span));
        self.remove(start, end);
        expr.expr.visit_with(self);
    }

    fn visit_ts_type_assertion(&mut self, expr: &TsTypeAssertion) {
        let (start, end) = (self.lo(expr.span), self.lo(expr.expr.span()));
        self.remove(start, end);
        expr.expr.visit_with(self);
    }

    fn visit_call_expr(&mut self, call: &CallExpr) {
        if let Callee::Import(import) = &call.callee {
            self.helpers.dynamic_import = true;
            let (start, end) = (self.lo(import.span), self.hi(import.span));
            self.replace(start, end, "__dynamicImport");
            if let Some(type_args) = &call.type_args {
                type_args.visit_with(self);
            }
            call.args.visit_with(self);
            return;
        }
        call.visit_children_with(self);
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Declarations that produce no runtime code.
fn decl_is_erased(decl: &Decl) -> bool {
    match decl {
        Decl::TsInterface(_) | Decl::TsTypeAlias(_) => true,
        Decl::TsEnum(e) => e.declare,
        Decl::TsModule(m) => m.declare || m.global,
        Decl::Fn(f) => f.declare || f.function.body.is_none(),
        Decl::Class(c) => c.declare,
        Decl::Var(v) => v.declare,
        Decl::Using(_) => false,
    }
}

fn declared_names(decl: &Decl, out: &mut Vec<String>) {
    match decl {
        Decl::Fn(f) => out.push(f.ident.sym.to_string()),
        Decl::Class(c) => out.push(c.ident.sym.to_string()),
        Decl::TsEnum(e) => out.push(e.id.sym.to_string()),
        Decl::Var(v) => {
            for declarator in &v.decls {
                binding_names(&declarator.name, out);
            }
        }
        _ => {}
    }
}

fn binding_names(pat: &Pat, out: &mut Vec<String>) {
    match pat {
        Pat::Ident(binding) => out.push(binding.id.sym.to_string()),
        Pat::Array(array) => {
            for element in array.elems.iter().flatten() {
                binding_names(element, out);
            }
        }
        Pat::Object(object) => {
            for prop in &object.props {
                match prop {
                    ObjectPatProp::KeyValue(kv) => binding_names(&kv.value, out),
                    ObjectPatProp::Assign(assign) => out.push(assign.key.sym.to_string()),
                    ObjectPatProp::Rest(rest) => binding_names(&rest.arg, out),
                }
            }
        }
        Pat::Rest(rest) => binding_names(&rest.arg, out),
        Pat::Assign(assign) => binding_names(&assign.left, out),
        Pat::Invalid(_) | Pat::Expr(_) => {}
    }
}

fn assign_name(assign: &AssignPat) -> String {
    let mut names = Vec::new();
    binding_names(&assign.left, &mut names);
    names.into_iter().next().unwrap_or_default()
}

fn is_this_param(param: &Param) -> bool {
    matches!(&param.pat, Pat::Ident(binding) if &*binding.id.sym == "this")
}

fn is_super_call(stmt: &Stmt) -> bool {
    let Stmt::Expr(expr) = stmt else {
        return false;
    };
    matches!(&*expr.expr, Expr::Call(call) if matches!(call.callee, Callee::Super(_)))
}

/// Identifier expressions naming an enum member declared earlier in the
/// same enum. Property names and object keys are not expressions and are
/// left alone.
struct MemberReferences<'m> {
    members: &'m HashSet<String>,
    spans: Vec<Span>,
}

impl Visit for MemberReferences<'_> {
    fn visit_expr(&mut self, expr: &Expr) {
        match expr {
            Expr::Ident(ident) if self.members.contains(ident.sym.as_ref()) => {
                self.spans.push(ident.span)
            }
            _ => expr.visit_children_with(self),
        }
    }

    fn visit_ts_type(&mut self, _: &TsType) {}
}

fn numeric_literal(expr: &Expr) -> Option<f64> {
    match expr {
        Expr::Lit(Lit::Num(n)) => Some(n.value),
        Expr::Unary(unary) if unary.op == UnaryOp::Minus => match &*unary.arg {
            Expr::Lit(Lit::Num(n)) => Some(-n.value),
            _ => None,
        },
        Expr::Paren(paren) => numeric_literal(&paren.expr),
        _ => None,
    }
}

fn numeric_member(name: &str, key: &str, value: &str) -> String {
    format!("    {name}[{name}[{key}] = {value}] = {key};\n")
}

fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{}", value)
    }
}

fn quote(text: &str) -> String {
    serde_json::to_string(text).unwrap_or_else(|_| format!("\"{}\"", text))
}

/// Property accessor for an export name given as source text.
fn member(name: &str) -> String {
    if name.starts_with('"') || name.starts_with('\'') {
        format!("[{}]", name)
    } else {
        format!(".{}", name)
    }
}
