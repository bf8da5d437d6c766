//! Single-pass compiler from script source to bytecode.
//!
//! There is no syntax tree: statements and expressions are emitted as they
//! are recognized, and control structures are lowered to jumps over
//! generated labels. Forward references are chained through the bytecode
//! and patched once their label is known.

mod expr;
mod syntax;

use std::ops::BitOr;
use std::rc::Rc;

use crate::config::ScriptConfig;

use super::bytecode::{get_u24, Op, ScriptBuf, NO_LINK};
use super::code::{ScriptCode, ScriptLabel};
use super::error::CompileError;
use super::lexer::{peek, skip_space_checked, skip_word};
use super::symbol::{SymId, SymbolKind, LABEL_NEXTLINE};
use super::ScriptDb;

/// Longest variable name accepted by the stores.
pub const SCRIPT_VARNAME_LENGTH: usize = 32;

/// Compile options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParseOptions(u8);

impl ParseOptions {
    pub const NONE: ParseOptions = ParseOptions(0);
    /// The source is not wrapped in `{ }`
    pub const IGNORE_EXTERNAL_BRACKETS: ParseOptions = ParseOptions(1);
    /// Return an empty unit instead of nothing for empty source
    pub const RETURN_EMPTY_SCRIPT: ParseOptions = ParseOptions(2);
    /// Export every label into the label table
    pub const USE_LABEL_DB: ParseOptions = ParseOptions(4);

    pub fn contains(self, other: ParseOptions) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for ParseOptions {
    type Output = ParseOptions;

    fn bitor(self, rhs: ParseOptions) -> ParseOptions {
        ParseOptions(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConstructKind {
    /// Plain `{ }` block
    Null,
    If,
    Switch,
    While,
    For,
    Do,
    UserFunc,
    ArgList,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ArgListMode {
    NoParen,
    Paren,
    /// `cmd (x...` may be either `cmd(x, y)` or `cmd (x) + 1, y`
    Undefined,
}

/// One entry of the nesting stack.
#[derive(Debug, Clone)]
pub(crate) struct Curly {
    pub kind: ConstructKind,
    pub index: u32,
    pub count: i32,
    /// `else` seen, `default` seen, or `continue` used inside `do`
    pub flag: bool,
    pub arglist: ArgListMode,
    pub cases: Vec<i64>,
}

impl Curly {
    fn new(kind: ConstructKind, index: u32) -> Self {
        Self {
            kind,
            index,
            count: 1,
            flag: false,
            arglist: ArgListMode::NoParen,
            cases: Vec::new(),
        }
    }

    fn null() -> Self {
        Self { count: -1, ..Self::new(ConstructKind::Null, 0) }
    }

    fn arglist(mode: ArgListMode) -> Self {
        Self { count: 0, arglist: mode, ..Self::new(ConstructKind::ArgList, 0) }
    }
}

pub(crate) type PResult<T> = Result<T, CompileError>;

pub(crate) struct Parser<'a> {
    pub(crate) db: &'a mut ScriptDb,
    pub(crate) config: &'a ScriptConfig,
    pub(crate) src: &'a [u8],
    file: &'a str,
    line: usize,
    options: ParseOptions,
    pub(crate) buf: ScriptBuf,
    pub(crate) curly: Vec<Curly>,
    pub(crate) syntax_index: u32,
    pub(crate) for_flag: bool,
}

/// Compiles `src`. `Ok(None)` means the source was empty and the caller did
/// not ask for an empty unit.
pub(crate) fn parse_script(
    db: &mut ScriptDb,
    config: &ScriptConfig,
    src: &str,
    file: &str,
    line: usize,
    options: ParseOptions,
) -> PResult<Option<Rc<ScriptCode>>> {
    let parser = Parser {
        db,
        config,
        src: src.as_bytes(),
        file,
        line,
        options,
        buf: ScriptBuf::new(),
        curly: Vec::new(),
        syntax_index: 0,
        for_flag: false,
    };
    parser.run()
}

impl<'a> Parser<'a> {
    fn run(mut self) -> PResult<Option<Rc<ScriptCode>>> {
        if self.options.contains(ParseOptions::USE_LABEL_DB) {
            self.db.label_db.clear();
        }
        self.db.symbols.reset_labels();
        self.parse_nextline(true, 0)?;

        let mut p = self.sp(0);
        let end: u8;
        if self.options.contains(ParseOptions::IGNORE_EXTERNAL_BRACKETS) {
            if peek(self.src, p) == 0 && !self.options.contains(ParseOptions::RETURN_EMPTY_SCRIPT) {
                return Ok(None);
            }
            end = 0;
        } else {
            if peek(self.src, p) != b'{' {
                return Err(self.error("not found '{'", p));
            }
            p = self.sp(p + 1);
            if peek(self.src, p) == b'}' && !self.options.contains(ParseOptions::RETURN_EMPTY_SCRIPT) {
                return Ok(None);
            }
            end = b'}';
        }

        while !self.curly.is_empty() || peek(self.src, p) != end {
            if p >= self.src.len() {
                return Err(self.error("unexpected end of script", p));
            }

            let wend = skip_word(self.src, p);
            let tmpp = self.sp(wend);
            if wend > p && peek(self.src, tmpp) == b':' && !self.word_is(p, wend, "default") {
                let l = self.add_word(p)?;
                self.set_label(l, self.buf.pos(), p)?;
                if self.options_use_label_db() {
                    let name = self.db.symbols.name(l).to_string();
                    self.db.label_db.push(ScriptLabel { name, pos: self.buf.pos() });
                }
                p = self.sp(tmpp + 1);
                continue;
            }

            p = self.parse_line(p)?;
            p = self.sp(p);
            self.parse_nextline(false, p)?;
        }

        self.buf.add_op(Op::Nop);

        self.resolve_names(p)?;

        let buf = std::mem::take(&mut self.buf).into_bytes();
        Ok(Some(ScriptCode::new(buf, self.file, self.line)))
    }

    /// Defaults every unresolved reference to a variable name.
    fn resolve_names(&mut self, p: usize) -> PResult<()> {
        let mut unresolved = false;
        for id in self.db.symbols.ids().collect::<Vec<_>>() {
            let (kind, mut j) = match self.db.symbols.get(id) {
                Some(sym) => (sym.kind, sym.backpatch),
                None => continue,
            };
            match kind {
                SymbolKind::Nop => {
                    while j != NO_LINK {
                        let next = get_u24(self.buf.as_bytes(), j as usize);
                        self.buf.set_u24(j as usize, id);
                        if next != NO_LINK && next >= j {
                            break;
                        }
                        j = next;
                    }
                    if let Some(sym) = self.db.symbols.get_mut(id) {
                        sym.kind = SymbolKind::Name;
                        sym.label = id;
                        sym.backpatch = NO_LINK;
                    }
                }
                SymbolKind::UserFunc => {
                    tracing::error!(
                        "[script] parse_script: function '{}' declared but not defined.",
                        self.db.symbols.name(id)
                    );
                    unresolved = true;
                }
                _ => {}
            }
        }
        if unresolved {
            return Err(self.error("parse_script: unresolved function references", p));
        }
        Ok(())
    }

    pub(crate) fn options_use_label_db(&self) -> bool {
        self.options.contains(ParseOptions::USE_LABEL_DB)
    }

    // ------------------------------------------------------------------
    // Diagnostics
    // ------------------------------------------------------------------

    fn line_col(&self, p: usize) -> (usize, usize, usize) {
        let p = p.min(self.src.len());
        let before = &self.src[..p];
        let line = self.line + before.iter().filter(|&&c| c == b'\n').count();
        let line_start = before.iter().rposition(|&c| c == b'\n').map(|i| i + 1).unwrap_or(0);
        (line, p - line_start + 1, line_start)
    }

    pub(crate) fn error(&self, message: impl Into<String>, p: usize) -> CompileError {
        let (line, column, line_start) = self.line_col(p);
        let line_end = self.src[line_start..]
            .iter()
            .position(|&c| c == b'\n')
            .map(|i| line_start + i)
            .unwrap_or(self.src.len());
        let current = String::from_utf8_lossy(&self.src[line_start..line_end]);

        let mut excerpt = String::new();
        if line_start > 0 {
            let prev_end = line_start - 1;
            let prev_start = self.src[..prev_end]
                .iter()
                .rposition(|&c| c == b'\n')
                .map(|i| i + 1)
                .unwrap_or(0);
            let prev = String::from_utf8_lossy(&self.src[prev_start..prev_end]);
            excerpt.push_str(&format!("  {:5}: {}\n", line - 1, prev.trim_end()));
        }
        excerpt.push_str(&format!("* {:5}: {}\n", line, current.trim_end()));
        excerpt.push_str(&format!("{}^", " ".repeat(column + 8)));

        CompileError {
            message: message.into(),
            file: self.file.to_string(),
            line,
            column,
            excerpt,
        }
    }

    pub(crate) fn warning(&self, message: &str, p: usize) {
        let (line, column, _) = self.line_col(p);
        tracing::warn!(
            "[script] script warning in file '{}' line {} column {}: {}",
            self.file,
            line,
            column,
            message
        );
    }

    // ------------------------------------------------------------------
    // Scanning
    // ------------------------------------------------------------------

    pub(crate) fn sp(&self, p: usize) -> usize {
        match skip_space_checked(self.src, p) {
            Ok(p) => p,
            Err(end) => {
                self.warning("end of file while parsing block comment. expected */", end);
                end
            }
        }
    }

    pub(crate) fn at(&self, p: usize) -> u8 {
        peek(self.src, p)
    }

    /// Case-insensitive match of `src[p..p2]` against a keyword.
    pub(crate) fn word_is(&self, p: usize, p2: usize, kw: &str) -> bool {
        p2 - p == kw.len() && self.src[p..p2].eq_ignore_ascii_case(kw.as_bytes())
    }

    pub(crate) fn expect(&self, p: usize, c: u8, message: &str) -> PResult<usize> {
        if self.at(p) != c {
            return Err(self.error(message, p));
        }
        Ok(p + 1)
    }

    // ------------------------------------------------------------------
    // Symbols and emission
    // ------------------------------------------------------------------

    pub(crate) fn add_word(&mut self, p: usize) -> PResult<SymId> {
        let end = skip_word(self.src, p);
        if end == p {
            return Err(self.error(
                "script:add_word: invalid word. A word consists of undercores and/or alphanumeric characters, and valid variable prefixes/postfixes.",
                p,
            ));
        }
        let word = String::from_utf8_lossy(&self.src[p..end]).into_owned();
        Ok(self.db.symbols.add(&word))
    }

    pub(crate) fn add_str(&mut self, name: &str) -> SymId {
        self.db.symbols.add(name)
    }

    /// Emits a reference to a symbol: a label position, a backpatch link,
    /// an inlined constant, or a name.
    pub(crate) fn add_scriptl(&mut self, l: SymId) {
        let Some(sym) = self.db.symbols.get(l) else {
            return;
        };
        match sym.kind {
            SymbolKind::Pos | SymbolKind::UserFuncPos => {
                let label = sym.label;
                self.buf.add_op(Op::Pos);
                self.buf.add_u24(label);
            }
            SymbolKind::Nop | SymbolKind::UserFunc => {
                let backpatch = sym.backpatch;
                self.buf.add_op(Op::Name);
                let at = self.buf.pos() as u32;
                self.buf.add_u24(backpatch);
                if let Some(sym) = self.db.symbols.get_mut(l) {
                    sym.backpatch = at;
                }
            }
            SymbolKind::Int => {
                let val = sym.val;
                self.buf.add_int(val);
            }
            SymbolKind::Param | SymbolKind::Func | SymbolKind::Name => {
                self.buf.add_op(Op::Name);
                self.buf.add_u24(l);
            }
        }
    }

    pub(crate) fn set_label(&mut self, l: SymId, pos: usize, p: usize) -> PResult<()> {
        if pos >= NO_LINK as usize {
            return Err(self.error("script is too large", p));
        }
        let Some(sym) = self.db.symbols.get(l) else {
            return Err(self.error("set_label: invalid label name", p));
        };
        if matches!(sym.kind, SymbolKind::Int | SymbolKind::Param | SymbolKind::Func) {
            return Err(self.error("set_label: invalid label name", p));
        }
        if sym.label != NO_LINK {
            return Err(self.error("set_label: dup label ", p));
        }
        let kind = if sym.kind == SymbolKind::UserFunc {
            SymbolKind::UserFuncPos
        } else {
            SymbolKind::Pos
        };
        let mut i = sym.backpatch;
        if let Some(sym) = self.db.symbols.get_mut(l) {
            sym.kind = kind;
            sym.label = pos as u32;
            sym.backpatch = NO_LINK;
        }
        while i != NO_LINK {
            let at = i as usize;
            let next = get_u24(self.buf.as_bytes(), at);
            self.buf.set_byte(at - 1, Op::Pos as u8);
            self.buf.set_u24(at, pos as u32);
            if next != NO_LINK && next >= i {
                break;
            }
            i = next;
        }
        Ok(())
    }

    /// Sets a label by name at the current position.
    pub(crate) fn define_label(&mut self, name: &str, p: usize) -> PResult<()> {
        let l = self.add_str(name);
        self.set_label(l, self.buf.pos(), p)
    }

    /// Ends a line: clears the stack at run time and resolves `-` labels.
    pub(crate) fn parse_nextline(&mut self, first: bool, p: usize) -> PResult<()> {
        if !first {
            self.buf.add_op(Op::Eol);
            self.set_label(LABEL_NEXTLINE, self.buf.pos(), p)?;
        }
        if let Some(sym) = self.db.symbols.get_mut(LABEL_NEXTLINE) {
            sym.kind = SymbolKind::Nop;
            sym.backpatch = NO_LINK;
            sym.label = NO_LINK;
        }
        Ok(())
    }

    /// `goto <label>`
    pub(crate) fn emit_goto(&mut self, label: &str) {
        let goto = self.db.refs.goto;
        self.add_scriptl(goto);
        self.buf.add_op(Op::Arg);
        let l = self.add_str(label);
        self.add_scriptl(l);
        self.buf.add_op(Op::Func);
    }

    /// `jump_zero <expr at p>, <label>`
    pub(crate) fn emit_jump_zero(&mut self, p: usize, label: &str) -> PResult<usize> {
        let jump_zero = self.db.refs.jump_zero;
        self.add_scriptl(jump_zero);
        self.buf.add_op(Op::Arg);
        let p = self.parse_expr(p)?;
        let p = self.sp(p);
        let l = self.add_str(label);
        self.add_scriptl(l);
        self.buf.add_op(Op::Func);
        Ok(p)
    }

    /// `set <var>, <value>`
    pub(crate) fn emit_set_int(&mut self, var: &str, value: i64) {
        let set = self.db.refs.set;
        self.add_scriptl(set);
        self.buf.add_op(Op::Arg);
        let l = self.add_str(var);
        self.add_scriptl(l);
        self.buf.add_int(value);
        self.buf.add_op(Op::Func);
    }

    /// `return`
    pub(crate) fn emit_return(&mut self) {
        let ret = self.db.refs.return_;
        self.add_scriptl(ret);
        self.buf.add_op(Op::Arg);
        self.buf.add_op(Op::Func);
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    pub(crate) fn parse_line(&mut self, p: usize) -> PResult<usize> {
        let p = self.sp(p);
        if self.at(p) == b';' {
            return self.parse_syntax_close(p + 1);
        }
        if self.at(p) == b')' && self.for_flag {
            return Ok(p + 1);
        }

        if self.at(p) == b'{' {
            self.curly.push(Curly::null());
            return Ok(p + 1);
        } else if self.at(p) == b'}' {
            return self.parse_curly_close(p);
        }

        if let Some(p2) = self.parse_syntax(p)? {
            return Ok(p2);
        }

        let p = match self.parse_variable(p)? {
            Some(p2) => p2,
            None => self.parse_callfunc(p, false, false)?,
        };
        let p = self.sp(p);

        if self.for_flag {
            if self.at(p) != b')' {
                return Err(self.error("parse_line: expected ')'", p));
            }
        } else if self.at(p) != b';' {
            return Err(self.error("parse_line: expected ';'", p));
        }

        self.parse_syntax_close(p + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::scripting::bytecode::{get_com, Fetched};
    use crate::game::scripting::ScriptEngine;

    fn compile(engine: &mut ScriptEngine, src: &str) -> PResult<Option<Rc<ScriptCode>>> {
        parse_script(
            &mut engine.db,
            &engine.config,
            src,
            "test",
            1,
            ParseOptions::IGNORE_EXTERNAL_BRACKETS,
        )
    }

    #[test]
    fn test_empty_script() {
        let mut engine = ScriptEngine::default();
        assert!(compile(&mut engine, "   // nothing\n").unwrap().is_none());

        let code = parse_script(
            &mut engine.db,
            &engine.config,
            "",
            "test",
            1,
            ParseOptions::IGNORE_EXTERNAL_BRACKETS | ParseOptions::RETURN_EMPTY_SCRIPT,
        )
        .unwrap()
        .unwrap();
        assert_eq!(code.buf, vec![Op::Nop as u8]);
    }

    #[test]
    fn test_brackets_required_by_default() {
        let mut engine = ScriptEngine::default();
        let err = parse_script(&mut engine.db, &engine.config, "end;", "t", 1, ParseOptions::NONE)
            .unwrap_err();
        assert!(err.message.contains("not found '{'"));

        let code = parse_script(&mut engine.db, &engine.config, "{ end; }", "t", 1, ParseOptions::NONE)
            .unwrap();
        assert!(code.is_some());
        assert!(parse_script(&mut engine.db, &engine.config, "{ }", "t", 1, ParseOptions::NONE)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_forward_labels_are_backpatched() {
        let mut engine = ScriptEngine::default();
        let code = compile(
            &mut engine,
            "goto L_End; goto L_End; mes \"skipped\"; L_End: end;",
        )
        .unwrap()
        .unwrap();

        // Every label operand resolves to the same position and no link survives.
        let buf = &code.buf;
        let mut pos = 0;
        let mut targets = Vec::new();
        while pos < buf.len() {
            match get_com(buf, &mut pos) {
                Fetched::Op(Op::Pos) => {
                    targets.push(get_u24(buf, pos));
                    pos += 3;
                }
                Fetched::Op(Op::Name) => {
                    assert_ne!(get_u24(buf, pos), NO_LINK);
                    pos += 3;
                }
                Fetched::Op(Op::Str) => {
                    while buf[pos] != 0 {
                        pos += 1;
                    }
                    pos += 1;
                }
                Fetched::Int => {
                    crate::game::scripting::bytecode::get_num(buf, &mut pos);
                }
                Fetched::Op(_) => {}
                Fetched::Unknown(c) => panic!("unknown opcode {c}"),
            }
        }
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0], targets[1]);
        assert_ne!(targets[0], NO_LINK);
    }

    #[test]
    fn test_duplicate_label() {
        let mut engine = ScriptEngine::default();
        let err = compile(&mut engine, "L_A: end; L_A: end;").unwrap_err();
        assert!(err.message.contains("dup label"));
    }

    #[test]
    fn test_declared_but_undefined_function() {
        let mut engine = ScriptEngine::default();
        let err = compile(&mut engine, "function F_Missing; F_Missing(); end;").unwrap_err();
        assert!(err.message.contains("unresolved function references"));
    }

    #[test]
    fn test_undeclared_function_call() {
        let mut engine = ScriptEngine::default();
        let err = compile(&mut engine, "no_such_command 1;").unwrap_err();
        assert!(err.message.contains("calling undeclared function"));
        assert_eq!(err.line, 1);
    }

    #[test]
    fn test_error_position() {
        let mut engine = ScriptEngine::default();
        let err = parse_script(
            &mut engine.db,
            &engine.config,
            "mes \"a\";\nmes \"b\"\nend;",
            "npc/test.txt",
            10,
            ParseOptions::IGNORE_EXTERNAL_BRACKETS,
        )
        .unwrap_err();
        assert_eq!(err.file, "npc/test.txt");
        assert_eq!(err.line, 12);
        assert!(err.message.contains("expected ';'"));
        assert!(err.excerpt.contains("mes \"b\""));
    }

    #[test]
    fn test_not_enough_arguments() {
        let mut engine = ScriptEngine::default();
        let err = compile(&mut engine, "setarray;").unwrap_err();
        assert!(err.message.contains("not enough arguments"));

        engine.config.warn_func_mismatch_paramnum = false;
        assert!(compile(&mut engine, "setarray;").is_ok());
    }

    #[test]
    fn test_label_db_export() {
        let mut engine = ScriptEngine::default();
        parse_script(
            &mut engine.db,
            &engine.config,
            "{ end; OnInit: end; function Local { return; } }",
            "t",
            1,
            ParseOptions::USE_LABEL_DB,
        )
        .unwrap()
        .unwrap();
        let names: Vec<&str> = engine.db.label_db.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names, vec!["Local", "OnInit"]);
    }

    #[test]
    fn test_unterminated_string() {
        let mut engine = ScriptEngine::default();
        let err = compile(&mut engine, "mes \"abc\nend;").unwrap_err();
        assert!(err.message.contains("unexpected newline"));
    }

    #[test]
    fn test_unary_plus_is_skipped() {
        let mut engine = ScriptEngine::default();
        let plus = compile(&mut engine, "$a = +5; end;").unwrap().unwrap();
        let bare = compile(&mut engine, "$a = 5; end;").unwrap().unwrap();
        assert_eq!(plus.buf, bare.buf);

        let code = compile(&mut engine, "$b = 3 - +2; $c = 2 * +0x10; end;").unwrap().unwrap();
        engine.run_script(&code, 0, 0, 0);
        assert_eq!(engine.get_val2_num(0, 0, "$b", 0).unwrap(), 1);
        assert_eq!(engine.get_val2_num(0, 0, "$c", 0).unwrap(), 32);
    }

    #[test]
    fn test_string_escapes_must_stay_utf8() {
        let mut engine = ScriptEngine::default();
        let err = compile(&mut engine, "$s$ = \"caf\\xE9\"; end;").unwrap_err();
        assert!(err.message.contains("invalid UTF-8"));
        let err = compile(&mut engine, "$s$ = \"a\\0b\"; end;").unwrap_err();
        assert!(err.message.contains("nul character"));

        let code = compile(&mut engine, "$s$ = \"caf\\xC3\\xA9\"; end;").unwrap().unwrap();
        engine.run_script(&code, 0, 0, 0);
        assert_eq!(engine.get_val2_str(0, 0, "$s$", 0).unwrap(), "caf\u{e9}");
    }
}
