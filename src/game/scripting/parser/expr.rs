//! Expressions, assignments and calls.

use crate::game::scripting::bytecode::Op;
use crate::game::scripting::lexer::{is_number, parse_number, skip_word};
use crate::game::scripting::symbol::{SymbolKind, LABEL_NEXTLINE};

use super::{ArgListMode, ConstructKind, Curly, PResult, Parser, SCRIPT_VARNAME_LENGTH};

/// Binary operator at `p`: opcode, precedence and length.
fn binary_op(src: &[u8], p: usize) -> Option<(Op, i32, usize)> {
    let c0 = src.get(p).copied().unwrap_or(0);
    let c1 = src.get(p + 1).copied().unwrap_or(0);
    Some(match (c0, c1) {
        (b'?', _) => (Op::Op3, 0, 1),
        (b'+', c) if c != b'+' => (Op::Add, 9, 1),
        (b'-', c) if c != b'-' => (Op::Sub, 9, 1),
        (b'*', _) => (Op::Mul, 10, 1),
        (b'/', _) => (Op::Div, 10, 1),
        (b'%', _) => (Op::Mod, 10, 1),
        (b'&', b'&') => (Op::Land, 2, 2),
        (b'&', _) => (Op::And, 5, 1),
        (b'|', b'|') => (Op::Lor, 1, 2),
        (b'|', _) => (Op::Or, 3, 1),
        (b'^', _) => (Op::Xor, 4, 1),
        (b'=', b'=') => (Op::Eq, 6, 2),
        (b'!', b'=') => (Op::Ne, 6, 2),
        (b'>', b'>') => (Op::RShift, 8, 2),
        (b'>', b'=') => (Op::Ge, 7, 2),
        (b'>', _) => (Op::Gt, 7, 1),
        (b'<', b'<') => (Op::LShift, 8, 2),
        (b'<', b'=') => (Op::Le, 7, 2),
        (b'<', _) => (Op::Lt, 7, 1),
        _ => return None,
    })
}

/// Assignment operator at `p` and its length.
fn assign_op(src: &[u8], p: usize) -> Option<(Op, usize)> {
    let c0 = src.get(p).copied().unwrap_or(0);
    let c1 = src.get(p + 1).copied().unwrap_or(0);
    let c2 = src.get(p + 2).copied().unwrap_or(0);
    Some(match (c0, c1) {
        (b'=', c) if c != b'=' => (Op::Eq, 1),
        (b'+', b'=') => (Op::Add, 2),
        (b'-', b'=') => (Op::Sub, 2),
        (b'^', b'=') => (Op::Xor, 2),
        (b'|', b'=') => (Op::Or, 2),
        (b'&', b'=') => (Op::And, 2),
        (b'*', b'=') => (Op::Mul, 2),
        (b'/', b'=') => (Op::Div, 2),
        (b'%', b'=') => (Op::Mod, 2),
        (b'+', b'+') => (Op::AddPost, 2),
        (b'-', b'-') => (Op::SubPost, 2),
        (b'<', b'<') if c2 == b'=' => (Op::LShift, 3),
        (b'>', b'>') if c2 == b'=' => (Op::RShift, 3),
        _ => return None,
    })
}

impl<'a> Parser<'a> {
    pub(crate) fn parse_expr(&mut self, p: usize) -> PResult<usize> {
        if matches!(self.at(p), b')' | b';' | b':' | b'[' | b']' | b'}') {
            return Err(self.error("parse_expr: unexpected char", p));
        }
        self.parse_subexpr(p, -1)
    }

    /// Parses operators binding tighter than `limit`.
    pub(crate) fn parse_subexpr(&mut self, p: usize, limit: i32) -> PResult<usize> {
        let mut p = self.sp(p);

        if self.at(p) == b'-' {
            let tmpp = self.sp(p + 1);
            if matches!(self.at(tmpp), b';' | b',') {
                self.add_scriptl(LABEL_NEXTLINE);
                return Ok(p + 1);
            }
        }

        let c0 = self.at(p);
        let c1 = self.at(p + 1);
        if (c0 == b'+' && c1 == b'+') || (c0 == b'-' && c1 == b'-') {
            p = match self.parse_variable(p)? {
                Some(p) => p,
                None => return Err(self.error("parse_subexpr: invalid use of ++/--", p)),
            };
        } else if matches!(c0, b'-' | b'!' | b'~') {
            let op = match c0 {
                b'-' => Op::Neg,
                b'!' => Op::Lnot,
                _ => Op::Not,
            };
            p = self.parse_subexpr(p + 1, 11)?;
            self.buf.add_op(op);
        } else {
            p = self.parse_simpleexpr(p)?;
        }

        p = self.sp(p);
        while let Some((op, opl, len)) = binary_op(self.src, p) {
            if opl <= limit {
                break;
            }
            p += len;
            if op == Op::Op3 {
                p = self.parse_subexpr(p, -1)?;
                p = self.sp(p);
                if self.at(p) != b':' {
                    return Err(self.error("parse_subexpr: need ':'", p));
                }
                p = self.parse_subexpr(p + 1, -1)?;
            } else {
                p = self.parse_subexpr(p, opl)?;
            }
            self.buf.add_op(op);
            p = self.sp(p);
        }

        Ok(p)
    }

    pub(crate) fn parse_simpleexpr(&mut self, p: usize) -> PResult<usize> {
        let mut p = self.sp(p);

        match self.at(p) {
            b';' | b',' => Err(self.error("parse_simpleexpr: unexpected end of expression", p)),
            b'(' => {
                if let Some(top) = self.curly.last_mut() {
                    if top.kind == ConstructKind::ArgList {
                        top.count += 1;
                    }
                }
                p = self.parse_subexpr(p + 1, -1)?;
                p = self.sp(p);
                if let Some(top) = self.curly.last_mut() {
                    if top.kind == ConstructKind::ArgList && top.arglist == ArgListMode::Undefined {
                        top.count -= 1;
                        if top.count == 0 {
                            if self.src.get(p) == Some(&b',') {
                                top.arglist = ArgListMode::Paren;
                                return Ok(p);
                            }
                            top.arglist = ArgListMode::NoParen;
                        }
                    }
                }
                if self.at(p) != b')' {
                    return Err(self.error("parse_simpleexpr: unmatched ')'", p));
                }
                Ok(p + 1)
            }
            _ if is_number(self.src, p) => {
                if self.at(p) == b'+' {
                    p += 1;
                }
                while self.at(p) == b'0' && self.at(p + 1).is_ascii_digit() {
                    p += 1;
                }
                let (value, np) = parse_number(self.src, p);
                self.buf.add_int(value);
                Ok(np)
            }
            b'"' => self.parse_string(p),
            _ => {
                if skip_word(self.src, p) == p {
                    return Err(self.error("parse_simpleexpr: unexpected character", p));
                }

                let l = self.add_word(p)?;
                let kind = self.db.symbols.kind(l);
                if matches!(kind, SymbolKind::Func | SymbolKind::UserFunc | SymbolKind::UserFuncPos) {
                    return self.parse_callfunc(p, true, false);
                }
                if self.db.userfunc_db.contains_key(&self.word_text(p)) {
                    return self.parse_callfunc(p, true, true);
                }

                if let Some(pv) = self.parse_variable(p)? {
                    return Ok(pv);
                }

                let deprecated = self.db.symbols.get(l).map(|s| s.deprecated).unwrap_or(false);
                if kind == SymbolKind::Int && deprecated {
                    self.warning(
                        "This constant is deprecated and it will be removed in a future version. Please see the script documentation and constants.conf for an alternative.",
                        p,
                    );
                }

                let wend = skip_word(self.src, p);
                self.check_varname_length(p, wend);
                p = wend;
                if self.at(p) == b'[' {
                    let getelementofarray = self.db.refs.getelementofarray;
                    self.add_scriptl(getelementofarray);
                    self.buf.add_op(Op::Arg);
                    self.add_scriptl(l);

                    p = self.parse_subexpr(p + 1, -1)?;
                    p = self.sp(p);
                    if self.at(p) != b']' {
                        return Err(self.error("parse_simpleexpr: unmatched ']'", p));
                    }
                    p += 1;
                    self.buf.add_op(Op::Func);
                } else {
                    self.add_scriptl(l);
                }
                Ok(p)
            }
        }
    }

    /// String literal with C-style escapes. Escapes must leave valid UTF-8
    /// without nul bytes.
    fn parse_string(&mut self, p: usize) -> PResult<usize> {
        let start = p;
        let mut text = Vec::new();
        let mut p = p + 1;
        while p < self.src.len() && self.src[p] != b'"' {
            let c = self.src[p];
            if c == b'\\' {
                let (byte, len) = unescape(&self.src[p..]);
                if byte == 0 {
                    return Err(self.error("parse_simpleexpr: nul character @ string", p));
                }
                text.push(byte);
                p += len;
                continue;
            }
            if c == b'\n' {
                return Err(self.error("parse_simpleexpr: unexpected newline @ string", p));
            }
            text.push(c);
            p += 1;
        }
        if p >= self.src.len() {
            return Err(self.error("parse_simpleexpr: unexpected eof @ string", p));
        }
        if std::str::from_utf8(&text).is_err() {
            return Err(self.error("parse_simpleexpr: invalid UTF-8 @ string", start));
        }
        self.buf.add_op(Op::Str);
        for b in text {
            self.buf.add_byte(b);
        }
        self.buf.add_byte(0);
        Ok(p + 1)
    }

    /// Source spelling of the word at `p`.
    fn word_text(&self, p: usize) -> String {
        let end = skip_word(self.src, p);
        String::from_utf8_lossy(&self.src[p..end]).into_owned()
    }

    fn check_varname_length(&self, p: usize, end: usize) {
        if end - p > SCRIPT_VARNAME_LENGTH {
            self.warning(
                &format!("variable name is longer than {SCRIPT_VARNAME_LENGTH} characters"),
                p,
            );
        }
    }

    /// Parses an assignment or increment statement. `Ok(None)` when the text
    /// at `p` is not one.
    pub(crate) fn parse_variable(&mut self, p: usize) -> PResult<Option<usize>> {
        let mut p = p;
        let mut var = p;
        let mut kind: Option<Op> = None;

        if self.at(p) == b'+' && self.at(p + 1) == b'+' {
            kind = Some(Op::AddPre);
        } else if self.at(p) == b'-' && self.at(p + 1) == b'-' {
            kind = Some(Op::SubPre);
        }
        if kind.is_some() {
            p = self.sp(p + 2);
            var = p;
        }

        let wend = skip_word(self.src, p);
        if wend == p {
            return Ok(None);
        }
        p = self.sp(wend);

        let mut index_at = None;
        if self.at(p) == b'[' {
            index_at = Some(p);
            let mut depth = 1;
            p += 1;
            loop {
                match self.at(p) {
                    0 if p >= self.src.len() => {
                        return Err(self.error(
                            "Missing right expression or closing bracket for variable.",
                            p,
                        ));
                    }
                    b'[' => depth += 1,
                    b']' => {
                        depth -= 1;
                        if depth == 0 {
                            p += 1;
                            break;
                        }
                    }
                    _ => {}
                }
                p += 1;
            }
            p = self.sp(p);
        }

        let op = match kind {
            Some(op) => op,
            None => match assign_op(self.src, p) {
                Some((op, len)) => {
                    p = self.sp(p + len);
                    op
                }
                None => return Ok(None),
            },
        };

        let set = self.db.refs.set;
        self.add_scriptl(set);
        self.buf.add_op(Op::Arg);

        self.curly.push(Curly::arglist(ArgListMode::Paren));

        let word = self.add_word(var)?;
        if matches!(
            self.db.symbols.kind(word),
            SymbolKind::Func | SymbolKind::UserFunc | SymbolKind::UserFuncPos
        ) {
            return Err(self.error(
                "Cannot modify a variable which has the same name as a function or label.",
                p,
            ));
        }
        self.check_varname_length(var, wend);

        if let Some(open) = index_at {
            let getelementofarray = self.db.refs.getelementofarray;
            self.add_scriptl(getelementofarray);
            self.buf.add_op(Op::Arg);
            self.add_scriptl(word);

            let p3 = self.parse_subexpr(open + 1, -1)?;
            let p3 = self.sp(p3);
            if self.at(p3) != b']' {
                return Err(self.error(
                    "Missing closing ']' parenthesis for the variable assignment.",
                    p3,
                ));
            }
            self.buf.add_op(Op::Func);
        } else {
            self.add_scriptl(word);
        }

        if op != Op::Eq {
            self.buf.add_op(Op::Ref);
        }

        match op {
            Op::AddPost | Op::SubPost | Op::AddPre | Op::SubPre => {
                self.buf.add_int(1);
                self.buf.add_op(if matches!(op, Op::AddPost | Op::AddPre) { Op::Add } else { Op::Sub });
            }
            _ => {
                p = self.parse_subexpr(p, -1)?;
                if op != Op::Eq {
                    self.buf.add_op(op);
                }
            }
        }

        self.curly.pop();
        self.buf.add_op(Op::Func);

        // `set` yields the new value; a postfix form must yield the old one.
        match op {
            Op::AddPost => {
                self.buf.add_int(1);
                self.buf.add_op(Op::Sub);
            }
            Op::SubPost => {
                self.buf.add_int(1);
                self.buf.add_op(Op::Add);
            }
            _ => {}
        }

        Ok(Some(p))
    }

    /// Parses a builtin, user function or `callfunc` shorthand call.
    pub(crate) fn parse_callfunc(&mut self, p: usize, require_paren: bool, is_custom: bool) -> PResult<usize> {
        let func = self.add_word(p)?;
        let sym_kind = self.db.symbols.kind(func);
        let mut arg: &'static [u8];

        match sym_kind {
            SymbolKind::Func => {
                self.add_scriptl(func);
                self.buf.add_op(Op::Arg);
                let (sig, deprecated) = self
                    .db
                    .symbols
                    .get(func)
                    .and_then(|s| s.func)
                    .and_then(|i| self.db.builtins.get(i))
                    .map(|def| (def.arg, def.deprecated.is_some()))
                    .unwrap_or(("", false));
                arg = sig.as_bytes();
                if deprecated {
                    self.warning(
                        "This command is deprecated and it will be removed in a future update. Please see the script documentation for an alternative.",
                        p,
                    );
                }
            }
            SymbolKind::UserFunc | SymbolKind::UserFuncPos => {
                let callsub = self.db.refs.callsub;
                self.add_scriptl(callsub);
                self.buf.add_op(Op::Arg);
                self.add_scriptl(func);
                arg = self.builtin_signature(callsub);
                if arg.is_empty() {
                    return Err(self.error(
                        "parse_callfunc: callsub has no arguments, please review its definition",
                        p,
                    ));
                }
                if arg[0] != b'*' {
                    arg = &arg[1..];
                }
            }
            _ => {
                let name = self.word_text(p);
                if !is_custom && !self.db.userfunc_db.contains_key(&name) {
                    return Err(self.error(
                        "parse_line: expect command, missing function name or calling undeclared function",
                        p,
                    ));
                }
                let callfunc = self.db.refs.callfunc;
                self.add_scriptl(callfunc);
                self.buf.add_op(Op::Arg);
                self.buf.add_op(Op::Str);
                self.buf.add_cstr(name.as_bytes());
                arg = self.builtin_signature(callfunc);
                if arg.first().is_some_and(|&c| c != b'*') {
                    arg = &arg[1..];
                }
            }
        }

        let mut p = self.sp(skip_word(self.src, p));
        let mut frame = Curly::arglist(ArgListMode::NoParen);

        if self.at(p) == b';' {
            frame.arglist = ArgListMode::NoParen;
        } else if self.at(p) == b'(' && self.at(self.sp(p + 1)) == b')' {
            frame.arglist = ArgListMode::Paren;
            p = self.sp(p + 1);
        } else {
            if require_paren {
                if self.at(p) != b'(' {
                    return Err(self.error("need '('", p));
                }
                p += 1;
                frame.arglist = ArgListMode::Paren;
            } else if self.at(p) == b'(' {
                frame.arglist = ArgListMode::Undefined;
            } else {
                frame.arglist = ArgListMode::NoParen;
            }

            self.curly.push(frame);
            while let Some(&c) = arg.first() {
                let p2 = self.parse_subexpr(p, -1)?;
                if p == p2 {
                    break;
                }
                if c != b'*' {
                    arg = &arg[1..];
                }
                p = self.sp(p2);
                if arg.is_empty() || self.at(p) != b',' {
                    break;
                }
                p += 1;
            }
            frame = match self.curly.pop() {
                Some(f) if f.kind == ConstructKind::ArgList => f,
                _ => return Err(self.error("parse_callfunc: DEBUG last curly is not an argument list", p)),
            };
        }

        if let Some(&c) = arg.first() {
            if c != b'?' && c != b'*' {
                if self.config.warn_func_mismatch_paramnum {
                    return Err(self.error("parse_callfunc: not enough arguments, expected ','", p));
                }
                self.warning("parse_callfunc: not enough arguments, expected ','", p);
            }
        }

        if frame.arglist == ArgListMode::Paren {
            if self.at(p) != b')' {
                return Err(self.error("parse_callfunc: expected ')' to close argument list", p));
            }
            p += 1;
        }
        self.buf.add_op(Op::Func);
        Ok(p)
    }

    fn builtin_signature(&self, id: u32) -> &'static [u8] {
        self.db
            .symbols
            .get(id)
            .and_then(|s| s.func)
            .and_then(|i| self.db.builtins.get(i))
            .map(|def| def.arg.as_bytes())
            .unwrap_or(b"")
    }
}

/// Decodes one escape sequence at the start of `s` (which begins with a
/// backslash). Returns the byte and the number of source bytes consumed.
fn unescape(s: &[u8]) -> (u8, usize) {
    let c = s.get(1).copied().unwrap_or(b'\\');
    match c {
        b'n' => (b'\n', 2),
        b't' => (b'\t', 2),
        b'r' => (b'\r', 2),
        b'a' => (0x07, 2),
        b'b' => (0x08, 2),
        b'f' => (0x0c, 2),
        b'v' => (0x0b, 2),
        b'x' => {
            let mut value: u32 = 0;
            let mut len = 2;
            while let Some(d) = s.get(len).and_then(|&b| (b as char).to_digit(16)) {
                value = (value << 4) | d;
                len += 1;
            }
            if len == 2 {
                (b'x', 2)
            } else {
                (value as u8, len)
            }
        }
        b'0'..=b'7' => {
            let mut value: u32 = 0;
            let mut len = 1;
            while len < 4 {
                match s.get(len) {
                    Some(&b) if (b'0'..=b'7').contains(&b) => {
                        value = (value << 3) | u32::from(b - b'0');
                        len += 1;
                    }
                    _ => break,
                }
            }
            (value as u8, len)
        }
        _ => (c, 2),
    }
}
