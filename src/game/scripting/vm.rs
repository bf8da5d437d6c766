//! The stack machine.
//!
//! [`ScriptEngine::run_script_main`] fetches and executes opcodes until the
//! state leaves `Run`, then either parks the state (sleep timer, dialog
//! input), or frees it. A parked state is owned by `ScriptEngine::states`;
//! a running one by the call stack.

use std::rc::Rc;

use super::bytecode::{get_com, get_cstr, get_num, get_u24, Fetched, Op};
use super::error::RuntimeError;
use super::lexer::is_string_variable;
use super::state::{RunState, ScriptData, ScriptState, StateId};
use super::storage::reference_uid;
use super::builtin::BuiltinDef;
use super::{ScriptEngine, TimerEvent};

impl ScriptEngine {
    // ------------------------------------------------------------------
    // Character attachment
    // ------------------------------------------------------------------

    /// Makes `st` the character's current script, saving whatever it
    /// interrupted.
    pub(crate) fn attach_state(&mut self, st: &ScriptState) {
        if st.rid == 0 {
            return;
        }
        let Some(sd) = self.world.pc_mut(st.rid) else {
            return;
        };
        if sd.st != Some(st.id) {
            sd.st_backup.retain(|(id, _)| *id != st.id);
            if let Some(prev) = sd.st {
                sd.st_backup.push((prev, sd.npc_id));
            }
            sd.st = Some(st.id);
        }
        sd.npc_id = st.oid;
    }

    /// Releases the character from `st`, restoring the script it
    /// interrupted. With nothing to restore, `dequeue_event` starts the
    /// next queued event.
    pub(crate) fn detach_state(&mut self, st: &ScriptState, dequeue_event: bool) {
        if st.rid == 0 {
            return;
        }
        let Some(sd) = self.world.pc_mut(st.rid) else {
            return;
        };
        if sd.st != Some(st.id) {
            sd.st_backup.retain(|(id, _)| *id != st.id);
            return;
        }
        match sd.st_backup.pop() {
            Some((prev, npc_id)) => {
                sd.st = Some(prev);
                sd.npc_id = npc_id;
            }
            None => {
                sd.st = None;
                sd.npc_id = 0;
                if dequeue_event {
                    self.npc_event_dequeue(st.rid);
                }
            }
        }
    }

    /// Detaches the player for good (`sleep`, `detachrid`, `attachrid`).
    pub(crate) fn detach_rid(&mut self, st: &mut ScriptState) {
        if st.rid != 0 {
            self.detach_state(st, false);
            st.rid = 0;
        }
    }

    pub(crate) fn free_state(&mut self, mut st: ScriptState) {
        if let Some(tid) = st.sleep.timer.take() {
            self.timers.delete_timer(tid);
        }
        self.sleep_db_remove(st.oid, st.id);
        if st.rid != 0 {
            if let Some(sd) = self.world.pc_mut(st.rid) {
                if sd.st == Some(st.id) {
                    sd.st = None;
                    sd.npc_id = 0;
                }
                sd.st_backup.retain(|(id, _)| *id != st.id);
            }
        }
    }

    /// Takes a parked state out of the table to run it.
    pub(crate) fn take_state(&mut self, id: StateId) -> Option<ScriptState> {
        self.states.remove(&id)
    }

    // ------------------------------------------------------------------
    // Main loop
    // ------------------------------------------------------------------

    pub(crate) fn run_script_main(&mut self, mut st: ScriptState) {
        self.running += 1;
        let mut cmdcount = self.config.check_cmdcount;
        let mut gotocount = self.config.check_gotocount;

        self.attach_state(&st);

        if st.state == RunState::RerunLine {
            self.run_func(&mut st);
            if st.state == RunState::Goto {
                st.state = RunState::Run;
            }
        } else if st.state != RunState::End {
            st.state = RunState::Run;
        }

        while st.state == RunState::Run {
            let script = Rc::clone(&st.script);
            let buf = script.buf.as_slice();
            match get_com(buf, &mut st.pos) {
                Fetched::Int => {
                    let n = get_num(buf, &mut st.pos);
                    st.push_int(n);
                }
                Fetched::Op(Op::Eol) => {
                    if st.defsp > st.sp() {
                        tracing::error!(
                            "[script] run_script_main: unexpected stack position (defsp={} sp={})",
                            st.defsp,
                            st.sp()
                        );
                    } else {
                        st.pop_stack(st.defsp, st.sp());
                    }
                    st.op2ref.clear();
                }
                Fetched::Op(Op::Pos) => {
                    let pos = get_u24(buf, st.pos) as usize;
                    st.pos += 3;
                    st.push(ScriptData::Pos(pos));
                }
                Fetched::Op(Op::Name) => {
                    let id = get_u24(buf, st.pos);
                    st.pos += 3;
                    st.push(ScriptData::name(reference_uid(id, 0)));
                }
                Fetched::Op(Op::Arg) => st.push(ScriptData::Arg),
                Fetched::Op(Op::Str) => {
                    let s = get_cstr(buf, &mut st.pos);
                    st.push_str(s);
                }
                Fetched::Op(Op::Func) => {
                    self.run_func(&mut st);
                    if st.state == RunState::Goto {
                        st.state = RunState::Run;
                        if !st.freeloop && gotocount > 0 {
                            gotocount -= 1;
                            if gotocount == 0 {
                                self.script_error(&mut st, &RuntimeError::InfiniteLoop);
                            }
                        }
                    }
                }
                Fetched::Op(Op::Ref) => {
                    if let Some(top) = st.sp().checked_sub(1) {
                        st.op2ref.push(top);
                    }
                }
                Fetched::Op(op @ (Op::Neg | Op::Not | Op::Lnot)) => {
                    if let Err(e) = self.op_1(&mut st, op) {
                        self.script_error(&mut st, &e);
                    }
                }
                Fetched::Op(
                    op @ (Op::Add
                    | Op::Sub
                    | Op::Mul
                    | Op::Div
                    | Op::Mod
                    | Op::Eq
                    | Op::Ne
                    | Op::Gt
                    | Op::Ge
                    | Op::Lt
                    | Op::Le
                    | Op::And
                    | Op::Or
                    | Op::Xor
                    | Op::Land
                    | Op::Lor
                    | Op::RShift
                    | Op::LShift),
                ) => {
                    if let Err(e) = self.op_2(&mut st, op) {
                        self.script_error(&mut st, &e);
                    }
                }
                Fetched::Op(Op::Op3) => {
                    if let Err(e) = self.op_3(&mut st) {
                        self.script_error(&mut st, &e);
                    }
                }
                Fetched::Op(Op::Nop) => st.state = RunState::End,
                Fetched::Op(op) => {
                    tracing::error!("[script] unknown command : {} @ {}", op as u32, st.pos);
                    st.state = RunState::End;
                }
                Fetched::Unknown(code) => {
                    tracing::error!("[script] {} @ {}", RuntimeError::UnknownCommand(code), st.pos);
                    st.state = RunState::End;
                }
            }
            if !st.freeloop && cmdcount > 0 && st.state == RunState::Run {
                cmdcount -= 1;
                if cmdcount == 0 {
                    self.script_error(&mut st, &RuntimeError::InfiniteLoop);
                }
            }
        }

        self.running -= 1;
        self.finish_run(st);
    }

    /// Parks or frees a state that stopped running.
    fn finish_run(&mut self, mut st: ScriptState) {
        if st.sleep.tick > 0 {
            self.detach_state(&st, false);
            st.sleep.charid = self.world.pc(st.rid).map(|sd| sd.char_id).unwrap_or(0);
            let tid = self.timers.add_timer(self.tick + st.sleep.tick, TimerEvent::ScriptSleep { state: st.id });
            st.sleep.timer = Some(tid);
            self.sleep_db.entry(st.oid).or_default().push(st.id);
            self.states.insert(st.id, st);
        } else if st.state != RunState::End && st.rid != 0 && self.world.pc(st.rid).is_some() {
            self.states.insert(st.id, st);
        } else {
            if self.world.pc(st.rid).is_some() {
                self.detach_state(&st, true);
            }
            self.free_state(st);
        }
    }

    /// Logs a runtime error with its source and ends the script.
    pub(crate) fn script_error(&self, st: &mut ScriptState, err: &RuntimeError) {
        tracing::error!("[script] {err}");
        self.reportsrc(st);
        st.state = RunState::End;
    }

    // ------------------------------------------------------------------
    // Builtin calls
    // ------------------------------------------------------------------

    pub(crate) fn run_func(&mut self, st: &mut ScriptState) {
        if let Err(e) = self.run_func_inner(st) {
            self.script_error(st, &e);
        }
    }

    fn run_func_inner(&mut self, st: &mut ScriptState) -> Result<(), RuntimeError> {
        let end_sp = st.sp();
        let marker = (1..end_sp)
            .rev()
            .find(|&i| matches!(st.stack[i], ScriptData::Arg))
            .ok_or(RuntimeError::ArgMarkerNotFound)?;
        st.start = marker - 1;
        st.end = end_sp;

        let def = match &st.stack[st.start] {
            ScriptData::Name { uid, .. } => self.db.builtin(super::storage::uid_id(*uid)).copied(),
            _ => None,
        }
        .ok_or(RuntimeError::NotAFunction)?;

        if self.config.warn_func_mismatch_argtypes {
            self.check_argtype(st, &def);
        }

        if let Err(e) = (def.func)(self, st) {
            tracing::error!("[script] buildin_{}: {e}", def.name);
            self.reportsrc(st);
            st.state = RunState::End;
        }

        if st.state == RunState::RerunLine {
            return Ok(());
        }
        st.pop_stack(st.start, st.end);

        if st.state == RunState::RetFunc {
            // the return value sits at `start`; drop what lies below it
            st.pop_stack(st.defsp, st.start);
            let olddefsp = st.defsp;
            let taken = match olddefsp.checked_sub(1).and_then(|i| st.stack.get_mut(i)) {
                Some(slot) if matches!(slot, ScriptData::RetInfo(_)) => std::mem::replace(slot, ScriptData::Nop),
                _ => return Err(RuntimeError::NotInFunction),
            };
            let ScriptData::RetInfo(ri) = taken else {
                return Err(RuntimeError::NotInFunction);
            };
            let ri = *ri;
            let nargs = ri.nargs;
            st.pos = ri.pos;
            st.script = ri.script;
            st.scope = ri.scope;
            st.defsp = ri.defsp;
            st.pop_stack(olddefsp.saturating_sub(nargs + 1), olddefsp);
            st.state = RunState::Goto;
        }
        Ok(())
    }

    /// Warns about arguments that do not match the builtin's signature.
    fn check_argtype(&self, st: &ScriptState, def: &BuiltinDef) {
        let sig = def.arg.as_bytes();
        let mut invalid = 0;
        let mut idx = 2;
        while let Some(data) = st.data(idx) {
            let Some(&ty) = sig.get(idx - 2) else {
                tracing::warn!("[script] Found more arguments than necessary. unexpected arg type {}", data.describe());
                invalid += 1;
                break;
            };
            if ty == b'?' || ty == b'*' {
                break;
            }
            let name = data.reference_id().map(|id| self.db.symbols.name(id)).unwrap_or("");
            let constant = data
                .reference_id()
                .map(|id| {
                    matches!(
                        self.db.symbols.kind(id),
                        super::symbol::SymbolKind::Int | super::symbol::SymbolKind::Param
                    )
                })
                .unwrap_or(false);
            let ok = match ty {
                b'v' => data.is_string() || data.is_int() || data.is_reference(),
                b's' => data.is_string() || (data.is_reference() && is_string_variable(name)),
                b'i' => data.is_int() || (data.is_reference() && (constant || !is_string_variable(name))),
                b'r' => {
                    data.is_reference()
                        && data
                            .reference_id()
                            .map(|id| self.db.symbols.kind(id) != super::symbol::SymbolKind::Int)
                            .unwrap_or(false)
                }
                b'l' => data.is_label(),
                _ => true,
            };
            if !ok {
                tracing::warn!(
                    "[script] Unexpected type for argument {}. Expected {}, got {}.",
                    idx - 1,
                    match ty {
                        b'v' => "string, number or variable",
                        b's' => "string",
                        b'i' => "number",
                        b'r' => "variable",
                        _ => "label",
                    },
                    data.describe()
                );
                invalid += 1;
            }
            idx += 1;
        }
        if invalid > 0 {
            tracing::debug!("[script] Function: {}", def.name);
            self.reportsrc(st);
        }
    }

    // ------------------------------------------------------------------
    // Operators
    // ------------------------------------------------------------------

    fn op_1(&mut self, st: &mut ScriptState, op: Op) -> Result<(), RuntimeError> {
        let top = st.sp().checked_sub(1).ok_or(RuntimeError::StackCorrupted("op_1"))?;
        self.get_val(st, top)?;
        let n = match st.stack.pop() {
            Some(ScriptData::Int(n)) => n,
            _ => return Err(RuntimeError::NotANumber(op.name())),
        };
        st.push_int(match op {
            Op::Neg => n.wrapping_neg(),
            Op::Not => !n,
            _ => i64::from(n == 0),
        });
        Ok(())
    }

    fn op_2(&mut self, st: &mut ScriptState, op: Op) -> Result<(), RuntimeError> {
        let sp = st.sp();
        if sp < 2 {
            return Err(RuntimeError::StackCorrupted("op_2"));
        }
        // compound assignment keeps the target under the result
        while st.op2ref.last().is_some_and(|&i| i > sp - 2) {
            st.op2ref.pop();
        }
        let leftref = if st.op2ref.last() == Some(&(sp - 2)) {
            st.op2ref.pop();
            if st.stack[sp - 2].is_reference() {
                Some(st.stack[sp - 2].try_copy()?)
            } else {
                None
            }
        } else {
            None
        };
        self.get_val(st, sp - 2)?;
        self.get_val(st, sp - 1)?;

        let right = st.stack.pop();
        let left = st.stack.pop();
        let result = match (left, right) {
            (Some(ScriptData::Int(a)), Some(ScriptData::Int(b))) => ScriptData::Int(self.op_2num(st, op, a, b)?),
            (Some(ScriptData::Str(a)), Some(ScriptData::Str(b))) => op_2str(op, a, b)?,
            (Some(ScriptData::Int(a)), Some(ScriptData::Str(b))) if op == Op::Add => {
                ScriptData::Str(a.to_string() + &b)
            }
            (Some(ScriptData::Str(a)), Some(ScriptData::Int(b))) if op == Op::Add => {
                ScriptData::Str(a + &b.to_string())
            }
            _ => return Err(RuntimeError::InvalidOperands(op.name())),
        };
        if let Some(target) = leftref {
            st.push(target);
        }
        st.push(result);
        Ok(())
    }

    fn op_2num(&self, st: &ScriptState, op: Op, a: i64, b: i64) -> Result<i64, RuntimeError> {
        let overflow = |r: Option<i64>, wide: i128| -> i64 {
            r.unwrap_or_else(|| {
                tracing::warn!(
                    "[script] op_2num: {} detected op={} i1={a} i2={b}",
                    if wide < 0 { "underflow" } else { "overflow" },
                    op.name()
                );
                self.reportsrc(st);
                if wide < 0 {
                    i64::MIN
                } else {
                    i64::MAX
                }
            })
        };
        Ok(match op {
            Op::And => a & b,
            Op::Or => a | b,
            Op::Xor => a ^ b,
            Op::Land => i64::from(a != 0 && b != 0),
            Op::Lor => i64::from(a != 0 || b != 0),
            Op::Eq => i64::from(a == b),
            Op::Ne => i64::from(a != b),
            Op::Gt => i64::from(a > b),
            Op::Ge => i64::from(a >= b),
            Op::Lt => i64::from(a < b),
            Op::Le => i64::from(a <= b),
            Op::RShift | Op::LShift if !(0..64).contains(&b) => 0,
            Op::RShift => a >> b,
            Op::LShift => a << b,
            Op::Div | Op::Mod if b == 0 => {
                return Err(RuntimeError::DivisionByZero { op: op.name(), lhs: a });
            }
            Op::Div => overflow(a.checked_div(b), i128::from(a) / i128::from(b)),
            Op::Mod => a.checked_rem(b).unwrap_or(0),
            Op::Add => overflow(a.checked_add(b), i128::from(a) + i128::from(b)),
            Op::Sub => overflow(a.checked_sub(b), i128::from(a) - i128::from(b)),
            Op::Mul => overflow(a.checked_mul(b), i128::from(a) * i128::from(b)),
            _ => return Err(RuntimeError::InvalidOperands(op.name())),
        })
    }

    fn op_3(&mut self, st: &mut ScriptState) -> Result<(), RuntimeError> {
        let sp = st.sp();
        if sp < 3 {
            return Err(RuntimeError::StackCorrupted("op_3"));
        }
        self.get_val(st, sp - 3)?;
        let flag = match &st.stack[sp - 3] {
            ScriptData::Str(s) => !s.is_empty(),
            ScriptData::Int(n) => *n != 0,
            _ => return Err(RuntimeError::InvalidOperands(Op::Op3.name())),
        };
        let chosen = if flag { sp - 2 } else { sp - 1 };
        let value = std::mem::replace(&mut st.stack[chosen], ScriptData::Nop);
        st.stack.truncate(sp - 3);
        st.push(value);
        Ok(())
    }
}

fn op_2str(op: Op, a: String, b: String) -> Result<ScriptData, RuntimeError> {
    let r = match op {
        Op::Add => return Ok(ScriptData::Str(a + &b)),
        Op::Eq => a == b,
        Op::Ne => a != b,
        Op::Gt => a > b,
        Op::Ge => a >= b,
        Op::Lt => a < b,
        Op::Le => a <= b,
        _ => return Err(RuntimeError::InvalidStringOperator(op.name())),
    };
    Ok(ScriptData::Int(i64::from(r)))
}
