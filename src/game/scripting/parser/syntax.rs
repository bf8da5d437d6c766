//! Control structures lowered to labels and jumps.
//!
//! Generated labels are named after the construct's syntax index so nested
//! and sibling constructs never collide:
//!
//! | construct | labels |
//! |-----------|--------|
//! | `if`      | `__IF{i}_{n}`, `__IF{i}_FIN` |
//! | `switch`  | `__SW{i}_{n}`, `__SW{i}_{n}J`, `__SW{i}_DEF`, `__SW{i}_FIN`, variable `$@__SW{i}_VAL` |
//! | `while`   | `__WL{i}_NXT`, `__WL{i}_FIN` |
//! | `for`     | `__FR{i}_J`, `__FR{i}_NXT`, `__FR{i}_BGN`, `__FR{i}_FIN` |
//! | `do`      | `__DO{i}_BGN`, `__DO{i}_NXT`, `__DO{i}_FIN` |
//! | `function`| `__FN{i}_FIN` |

use crate::game::scripting::bytecode::Op;
use crate::game::scripting::code::ScriptLabel;
use crate::game::scripting::lexer::{is_number, parse_number, skip_word};
use crate::game::scripting::symbol::SymbolKind;

use super::{ConstructKind, Curly, PResult, Parser};

impl<'a> Parser<'a> {
    fn next_index(&mut self) -> u32 {
        let i = self.syntax_index;
        self.syntax_index += 1;
        i
    }

    /// Handles a keyword statement. `Ok(None)` when `p` is not at one.
    pub(crate) fn parse_syntax(&mut self, p: usize) -> PResult<Option<usize>> {
        let p2 = skip_word(self.src, p);
        if p2 == p {
            return Ok(None);
        }

        if self.word_is(p, p2, "break") {
            return self.parse_break(p, p2).map(Some);
        }
        if self.word_is(p, p2, "case") {
            return self.parse_case(p, p2).map(Some);
        }
        if self.word_is(p, p2, "continue") {
            return self.parse_continue(p, p2).map(Some);
        }
        if self.word_is(p, p2, "default") {
            return self.parse_default(p, p2).map(Some);
        }
        if self.word_is(p, p2, "do") {
            let p = self.sp(p2);
            let index = self.next_index();
            self.define_label(&format!("__DO{index:x}_BGN"), p)?;
            self.curly.push(Curly::new(ConstructKind::Do, index));
            return Ok(Some(p));
        }
        if self.word_is(p, p2, "for") {
            return self.parse_for(p2).map(Some);
        }
        if self.word_is(p, p2, "function") {
            return self.parse_function(p2).map(Some);
        }
        if self.word_is(p, p2, "if") {
            let p = self.sp(p2);
            if self.at(p) != b'(' {
                return Err(self.error("need '('", p));
            }
            let index = self.next_index();
            self.curly.push(Curly::new(ConstructKind::If, index));
            let p = self.emit_jump_zero(p, &format!("__IF{index:x}_1"))?;
            return Ok(Some(p));
        }
        if self.word_is(p, p2, "switch") {
            let p = self.sp(p2);
            if self.at(p) != b'(' {
                return Err(self.error("need '('", p));
            }
            let index = self.next_index();
            self.curly.push(Curly::new(ConstructKind::Switch, index));

            let set = self.db.refs.set;
            self.add_scriptl(set);
            self.buf.add_op(Op::Arg);
            let var = self.add_str(&format!("$@__SW{index:x}_VAL"));
            self.add_scriptl(var);
            let p = self.parse_expr(p)?;
            let p = self.sp(p);
            if self.at(p) != b'{' {
                return Err(self.error("parse_syntax: need '{'", p));
            }
            self.buf.add_op(Op::Func);
            return Ok(Some(p + 1));
        }
        if self.word_is(p, p2, "while") {
            let p = self.sp(p2);
            if self.at(p) != b'(' {
                return Err(self.error("need '('", p));
            }
            let index = self.next_index();
            self.define_label(&format!("__WL{index:x}_NXT"), p)?;
            self.curly.push(Curly::new(ConstructKind::While, index));
            let p = self.emit_jump_zero(p, &format!("__WL{index:x}_FIN"))?;
            return Ok(Some(p));
        }

        Ok(None)
    }

    fn parse_break(&mut self, p: usize, p2: usize) -> PResult<usize> {
        let target = self.curly.iter().rev().find_map(|c| match c.kind {
            ConstructKind::Do => Some(format!("__DO{:x}_FIN", c.index)),
            ConstructKind::For => Some(format!("__FR{:x}_FIN", c.index)),
            ConstructKind::While => Some(format!("__WL{:x}_FIN", c.index)),
            ConstructKind::Switch => Some(format!("__SW{:x}_FIN", c.index)),
            _ => None,
        });
        let Some(label) = target else {
            return Err(self.error("parse_syntax: unexpected 'break'", p));
        };
        self.emit_goto(&label);

        let p = self.sp(p2);
        if self.at(p) != b';' {
            return Err(self.error("parse_syntax: need ';'", p));
        }
        self.parse_syntax_close(p + 1)
    }

    fn parse_continue(&mut self, p: usize, p2: usize) -> PResult<usize> {
        let mut label = None;
        for c in self.curly.iter_mut().rev() {
            match c.kind {
                ConstructKind::Do => {
                    c.flag = true;
                    label = Some(format!("__DO{:x}_NXT", c.index));
                    break;
                }
                ConstructKind::For => {
                    label = Some(format!("__FR{:x}_NXT", c.index));
                    break;
                }
                ConstructKind::While => {
                    label = Some(format!("__WL{:x}_NXT", c.index));
                    break;
                }
                _ => {}
            }
        }
        let Some(label) = label else {
            return Err(self.error("parse_syntax: unexpected 'continue'", p));
        };
        self.emit_goto(&label);

        let p = self.sp(p2);
        if self.at(p) != b';' {
            return Err(self.error("parse_syntax: need ';'", p));
        }
        self.parse_syntax_close(p + 1)
    }

    fn current_switch(&self, p: usize, what: &str) -> PResult<usize> {
        match self.curly.last() {
            Some(c) if c.kind == ConstructKind::Switch => Ok(self.curly.len() - 1),
            _ => Err(self.error(format!("parse_syntax: unexpected '{what}'"), p)),
        }
    }

    fn parse_case(&mut self, p: usize, p2: usize) -> PResult<usize> {
        let pos = self.current_switch(p, "case")?;
        let (index, count) = (self.curly[pos].index, self.curly[pos].count);

        if count != 1 {
            // Falling through from the previous case skips this case's test.
            self.emit_goto(&format!("__SW{index:x}_{count:x}J"));
            self.define_label(&format!("__SW{index:x}_{count:x}"), p)?;
        }

        let mut p = self.sp(p2);
        if p == p2 {
            return Err(self.error("parse_syntax: expect space ' '", p));
        }

        let value = if is_number(self.src, p) {
            let negative = self.at(p) == b'-';
            if matches!(self.at(p), b'-' | b'+') {
                p += 1;
            }
            let (v, np) = parse_number(self.src, p);
            if np != skip_word(self.src, p) {
                return Err(self.error("parse_syntax: 'case' label is not an integer", np));
            }
            p = np;
            if negative {
                -v
            } else {
                v
            }
        } else {
            let wend = skip_word(self.src, p);
            let word = String::from_utf8_lossy(&self.src[p..wend]).into_owned();
            let Some(v) = self.db.symbols.get_constant(&word) else {
                return Err(self.error("parse_syntax: 'case' label is not an integer", p));
            };
            p = wend;
            v
        };

        p = self.sp(p);
        if self.at(p) != b':' {
            return Err(self.error("parse_syntax: expect ':'", p));
        }

        // jump_zero ($@__SW_VAL == value), next case
        let jump_zero = self.db.refs.jump_zero;
        self.add_scriptl(jump_zero);
        self.buf.add_op(Op::Arg);
        let var = self.add_str(&format!("$@__SW{index:x}_VAL"));
        self.add_scriptl(var);
        self.buf.add_int(value);
        self.buf.add_op(Op::Eq);
        let next = self.add_str(&format!("__SW{index:x}_{:x}", count + 1));
        self.add_scriptl(next);
        self.buf.add_op(Op::Func);

        if count != 1 {
            self.define_label(&format!("__SW{index:x}_{count:x}J"), p)?;
        }

        if self.curly[pos].cases.contains(&value) {
            return Err(self.error("parse_syntax: dup 'case'", p));
        }
        self.curly[pos].cases.push(value);

        self.emit_set_int(&format!("$@__SW{index:x}_VAL"), 0);
        self.curly[pos].count += 1;
        Ok(p + 1)
    }

    fn parse_default(&mut self, p: usize, p2: usize) -> PResult<usize> {
        let pos = self.current_switch(p, "default")?;
        if self.curly[pos].flag {
            return Err(self.error("parse_syntax: dup 'default'", p));
        }
        let (index, count) = (self.curly[pos].index, self.curly[pos].count);

        let p = self.sp(p2);
        if self.at(p) != b':' {
            return Err(self.error("parse_syntax: need ':'", p));
        }

        if count != 1 {
            // Let the previous case fall through into the default body.
            self.emit_goto(&format!("__SW{index:x}_DEF"));
        }
        self.define_label(&format!("__SW{index:x}_{count:x}"), p)?;
        self.emit_goto(&format!("__SW{index:x}_{:x}", count + 1));
        self.define_label(&format!("__SW{index:x}_DEF"), p)?;

        self.curly[pos].flag = true;
        self.curly[pos].count += 1;
        Ok(self.sp(p + 1))
    }

    fn parse_for(&mut self, p2: usize) -> PResult<usize> {
        let index = self.next_index();
        self.curly.push(Curly::new(ConstructKind::For, index));

        let mut p = self.sp(p2);
        if self.at(p) != b'(' {
            return Err(self.error("need '('", p));
        }
        p += 1;

        // initializer
        self.curly.push(Curly::null());
        p = self.parse_line(p)?;
        self.curly.pop();

        self.define_label(&format!("__FR{index:x}_J"), p)?;

        p = self.sp(p);
        if self.at(p) != b';' {
            p = self.emit_jump_zero(p, &format!("__FR{index:x}_FIN"))?;
        }
        if self.at(p) != b';' {
            return Err(self.error("parse_syntax: need ';'", p));
        }
        p += 1;

        self.emit_goto(&format!("__FR{index:x}_BGN"));
        self.define_label(&format!("__FR{index:x}_NXT"), p)?;

        // step, terminated by ')'
        self.for_flag = true;
        self.curly.push(Curly::null());
        let step = self.parse_line(p);
        self.curly.pop();
        self.for_flag = false;
        p = step?;

        self.emit_goto(&format!("__FR{index:x}_J"));
        self.define_label(&format!("__FR{index:x}_BGN"), p)?;
        Ok(p)
    }

    fn parse_function(&mut self, p2: usize) -> PResult<usize> {
        let func_name = self.sp(p2);
        let p = skip_word(self.src, func_name);
        if p == func_name {
            return Err(self.error("parse_syntax:function: function name is missing or invalid", p));
        }
        let p2 = self.sp(p);

        match self.at(p2) {
            b';' => {
                let l = self.add_word(func_name)?;
                match self.db.symbols.kind(l) {
                    SymbolKind::Nop => {
                        if let Some(sym) = self.db.symbols.get_mut(l) {
                            sym.kind = SymbolKind::UserFunc;
                        }
                    }
                    SymbolKind::UserFunc | SymbolKind::UserFuncPos => {}
                    _ => {
                        return Err(self.error(
                            "parse_syntax:function: function name is invalid",
                            func_name,
                        ));
                    }
                }
                self.parse_syntax_close(p2 + 1)
            }
            b'{' => {
                let index = self.next_index();
                self.curly.push(Curly::new(ConstructKind::UserFunc, index));
                self.emit_goto(&format!("__FN{index:x}_FIN"));

                let l = self.add_word(func_name)?;
                match self.db.symbols.kind(l) {
                    SymbolKind::Nop | SymbolKind::UserFunc => {
                        if let Some(sym) = self.db.symbols.get_mut(l) {
                            sym.kind = SymbolKind::UserFunc;
                        }
                        self.set_label(l, self.buf.pos(), p)?;
                        if self.options_use_label_db() {
                            let name = self.db.symbols.name(l).to_string();
                            let pos = self.buf.pos();
                            self.db.label_db.push(ScriptLabel { name, pos });
                        }
                    }
                    _ => {
                        return Err(self.error(
                            "parse_syntax:function: function name is invalid",
                            func_name,
                        ));
                    }
                }
                Ok(self.sp(p))
            }
            _ => Err(self.error("expect ';' or '{' at function syntax", p2)),
        }
    }

    /// Closes every construct the statement ending at `p` completes.
    pub(crate) fn parse_syntax_close(&mut self, mut p: usize) -> PResult<usize> {
        loop {
            let (next, more) = self.parse_syntax_close_sub(p)?;
            p = next;
            if !more {
                return Ok(p);
            }
        }
    }

    /// Closes the innermost construct if the statement just parsed was its
    /// body. The flag says whether the enclosing construct may close too.
    fn parse_syntax_close_sub(&mut self, p: usize) -> PResult<(usize, bool)> {
        let Some(top) = self.curly.last().cloned() else {
            return Ok((p, false));
        };
        let index = top.index;

        match top.kind {
            ConstructKind::If => {
                self.parse_nextline(false, p)?;
                self.emit_goto(&format!("__IF{index:x}_FIN"));
                self.define_label(&format!("__IF{index:x}_{:x}", top.count), p)?;

                let pos = self.curly.len() - 1;
                self.curly[pos].count += 1;
                let count = self.curly[pos].count;

                let mut p = self.sp(p);
                let p2 = skip_word(self.src, p);
                if !top.flag && self.word_is(p, p2, "else") {
                    p = self.sp(p2);
                    let p3 = skip_word(self.src, p);
                    if self.word_is(p, p3, "if") {
                        p = self.sp(p3);
                        if self.at(p) != b'(' {
                            return Err(self.error("need '('", p));
                        }
                        let p = self.emit_jump_zero(p, &format!("__IF{index:x}_{count:x}"))?;
                        return Ok((p, false));
                    }
                    self.curly[pos].flag = true;
                    return Ok((p, false));
                }

                self.curly.pop();
                self.define_label(&format!("__IF{index:x}_FIN"), p)?;
                Ok((p, true))
            }
            ConstructKind::Do => {
                if top.flag {
                    self.define_label(&format!("__DO{index:x}_NXT"), p)?;
                }

                let p = self.sp(p);
                let p2 = skip_word(self.src, p);
                if !self.word_is(p, p2, "while") {
                    return Err(self.error("parse_syntax: need 'while'", p));
                }
                let p = self.sp(p2);
                if self.at(p) != b'(' {
                    return Err(self.error("need '('", p));
                }

                self.parse_nextline(false, p)?;
                let p = self.emit_jump_zero(p, &format!("__DO{index:x}_FIN"))?;
                self.emit_goto(&format!("__DO{index:x}_BGN"));
                self.define_label(&format!("__DO{index:x}_FIN"), p)?;

                let p = self.sp(p);
                if self.at(p) != b';' {
                    return Err(self.error("parse_syntax: need ';'", p));
                }
                self.curly.pop();
                Ok((p + 1, true))
            }
            ConstructKind::For => {
                self.emit_goto(&format!("__FR{index:x}_NXT"));
                self.define_label(&format!("__FR{index:x}_FIN"), p)?;
                self.curly.pop();
                Ok((p, true))
            }
            ConstructKind::While => {
                self.emit_goto(&format!("__WL{index:x}_NXT"));
                self.define_label(&format!("__WL{index:x}_FIN"), p)?;
                self.curly.pop();
                Ok((p, true))
            }
            ConstructKind::UserFunc => {
                self.emit_return();
                self.define_label(&format!("__FN{index:x}_FIN"), p)?;
                self.curly.pop();
                Ok((p, true))
            }
            _ => Ok((p, false)),
        }
    }

    pub(crate) fn parse_curly_close(&mut self, p: usize) -> PResult<usize> {
        let Some(top) = self.curly.last().cloned() else {
            return Err(self.error("parse_curly_close: unexpected string", p));
        };
        match top.kind {
            ConstructKind::Null => {
                self.curly.pop();
                self.parse_syntax_close(p + 1)
            }
            ConstructKind::Switch => {
                let index = top.index;
                self.emit_set_int(&format!("$@__SW{index:x}_VAL"), 0);
                self.emit_goto(&format!("__SW{index:x}_FIN"));
                self.define_label(&format!("__SW{index:x}_{:x}", top.count), p)?;
                if top.flag {
                    self.emit_goto(&format!("__SW{index:x}_DEF"));
                }
                self.define_label(&format!("__SW{index:x}_FIN"), p)?;
                self.curly.pop();
                self.parse_syntax_close(p + 1)
            }
            _ => Err(self.error("parse_curly_close: unexpected string", p)),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::game::scripting::parser::{parse_script, ParseOptions};
    use crate::game::scripting::ScriptEngine;

    fn compile_err(src: &str) -> String {
        let mut engine = ScriptEngine::default();
        parse_script(
            &mut engine.db,
            &engine.config,
            src,
            "test",
            1,
            ParseOptions::IGNORE_EXTERNAL_BRACKETS,
        )
        .unwrap_err()
        .message
    }

    fn compiles(src: &str) -> bool {
        let mut engine = ScriptEngine::default();
        parse_script(
            &mut engine.db,
            &engine.config,
            src,
            "test",
            1,
            ParseOptions::IGNORE_EXTERNAL_BRACKETS,
        )
        .is_ok()
    }

    #[test]
    fn test_control_structures_compile() {
        assert!(compiles("if (1) end; else if (2) end; else end;"));
        assert!(compiles("while (.@i < 3) { .@i++; } end;"));
        assert!(compiles("for (.@i = 0; .@i < 3; .@i++) { continue; } end;"));
        assert!(compiles("for (;;) break; end;"));
        assert!(compiles("do { .@i += 1; } while (.@i < 3); end;"));
        assert!(compiles("switch (.@x) { case 1: break; case -2: default: break; } end;"));
        assert!(compiles("function F { return 1; } .@v = F(); end;"));
    }

    #[test]
    fn test_misplaced_keywords() {
        assert!(compile_err("break;").contains("unexpected 'break'"));
        assert!(compile_err("continue;").contains("unexpected 'continue'"));
        assert!(compile_err("case 1: end;").contains("unexpected 'case'"));
    }

    #[test]
    fn test_duplicate_case_and_default() {
        assert!(compile_err("switch (1) { case 1: case 1: } end;").contains("dup 'case'"));
        assert!(compile_err("switch (1) { default: default: } end;").contains("dup 'default'"));
    }

    #[test]
    fn test_case_requires_integer() {
        assert!(compile_err("switch (1) { case abc: } end;").contains("not an integer"));
        assert!(compiles("switch (1) { case true: end; } end;"));
    }

    #[test]
    fn test_do_requires_while() {
        assert!(compile_err("do { end; } end;").contains("need 'while'"));
    }

    #[test]
    fn test_unbalanced_braces() {
        assert!(compile_err("}").contains("unexpected string"));
        assert!(compile_err("if (1) { end;").contains("unexpected end of script"));
    }

    #[test]
    fn test_function_name_collides_with_builtin() {
        assert!(compile_err("function mes { return; } end;").contains("function name is invalid"));
    }
}
