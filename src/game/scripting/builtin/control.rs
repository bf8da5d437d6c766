//! Assignment, jumps and user function calls.

use std::rc::Rc;

use crate::game::scripting::error::RuntimeError;
use crate::game::scripting::lexer::{is_string_variable, VarName, VarScope};
use crate::game::scripting::state::{RetInfo, RunState, ScriptData, ScriptState};
use crate::game::scripting::storage::{new_regdb_ref, reference_uid, uid_id, RegValue, SCRIPT_MAX_ARRAYSIZE};
use crate::game::scripting::vars::VarCtx;
use crate::game::scripting::ScriptEngine;
use crate::game::pc::ClientMessage;

use super::{label_arg, ref_arg};

/// `set <variable>, <value>{, <char id>}`
///
/// Yields the variable reference so the result of an assignment can be
/// read back.
pub fn set(engine: &mut ScriptEngine, st: &mut ScriptState) -> Result<(), RuntimeError> {
    let (uid, reg) = ref_arg(st, 2, "set")?;
    let name = engine.db.symbols.name(uid_id(uid)).to_string();

    let mut ctx = VarCtx::of(st);
    if st.has_data(4) {
        let char_id = engine.arg_num(st, 4)?;
        let sd = u32::try_from(char_id)
            .ok()
            .and_then(|id| engine.world.charid2sd(id))
            .ok_or(RuntimeError::PlayerNotAttached)?;
        ctx.rid = sd.account_id;
    }

    let value = if is_string_variable(&name) {
        RegValue::Str(engine.arg_str(st, 3)?)
    } else {
        RegValue::Num(engine.arg_num(st, 3)?)
    };
    engine.set_reg(&ctx, uid, value, reg.as_ref())?;
    st.push_arg_copy(2)
}

/// Copies the call arguments above the stack top, binding unbound scope
/// references to the caller so the callee can write through them.
fn push_call_args(st: &mut ScriptState, engine: &ScriptEngine, bind_local: bool) -> Result<usize, RuntimeError> {
    let mut nargs = 0;
    for i in st.start + 3..st.end {
        st.push_copy(i)?;
        nargs += 1;
        let top = st.sp() - 1;
        if let ScriptData::Name { uid, reg } = &mut st.stack[top] {
            if reg.is_none() {
                match VarName::parse(engine.db.symbols.name(uid_id(*uid))).scope {
                    VarScope::Scope => *reg = Some(Rc::clone(&st.scope)),
                    VarScope::Npc if bind_local => *reg = Some(Rc::clone(&st.script.local)),
                    _ => {}
                }
            }
        }
    }
    Ok(nargs)
}

fn push_frame(st: &mut ScriptState, nargs: usize) {
    let ri = RetInfo {
        script: Rc::clone(&st.script),
        scope: std::mem::replace(&mut st.scope, new_regdb_ref()),
        pos: st.pos,
        nargs,
        defsp: st.defsp,
    };
    st.push(ScriptData::RetInfo(Box::new(ri)));
    st.defsp = st.sp();
    st.state = RunState::Goto;
}

/// `callsub <label>{, <arg>...}`
pub fn callsub(engine: &mut ScriptEngine, st: &mut ScriptState) -> Result<(), RuntimeError> {
    let pos = label_arg(st, 2, "callsub")?;
    let nargs = push_call_args(st, engine, false)?;
    push_frame(st, nargs);
    st.pos = pos;
    Ok(())
}

/// `callfunc "<function>"{, <arg>...}`
pub fn callfunc(engine: &mut ScriptEngine, st: &mut ScriptState) -> Result<(), RuntimeError> {
    let name = engine.arg_str(st, 2)?;
    let code = engine
        .db
        .userfunc_db
        .get(&name)
        .cloned()
        .ok_or(RuntimeError::FunctionNotFound(name))?;
    let nargs = push_call_args(st, engine, true)?;
    push_frame(st, nargs);
    st.pos = 0;
    st.script = code;
    Ok(())
}

fn caller_frame(st: &ScriptState) -> Option<&RetInfo> {
    match st.defsp.checked_sub(1).and_then(|i| st.stack.get(i)) {
        Some(ScriptData::RetInfo(ri)) => Some(ri),
        _ => None,
    }
}

/// `return {<value>}`
pub fn return_(engine: &mut ScriptEngine, st: &mut ScriptState) -> Result<(), RuntimeError> {
    if !st.has_data(2) {
        st.push_nil();
        st.state = RunState::RetFunc;
        return Ok(());
    }
    st.push_arg_copy(2)?;
    let top = st.sp() - 1;
    let (uid, reg) = match &st.stack[top] {
        ScriptData::Name { uid, reg } => (*uid, reg.clone()),
        _ => {
            st.state = RunState::RetFunc;
            return Ok(());
        }
    };
    let caller_scope = caller_frame(st).map(|ri| Rc::clone(&ri.scope));
    let bound_to_caller = match (&reg, &caller_scope) {
        (Some(r), Some(c)) => Rc::ptr_eq(r, c),
        _ => false,
    };
    match VarName::parse(engine.db.symbols.name(uid_id(uid))).scope {
        VarScope::Scope => {
            if reg.as_ref().map_or(true, |r| Rc::ptr_eq(r, &st.scope)) {
                // the callee scope is about to vanish
                engine.get_val(st, top)?;
            } else if bound_to_caller {
                st.stack[top] = ScriptData::name(uid);
            }
        }
        VarScope::Npc if reg.is_none() => {
            st.stack[top] = ScriptData::Name { uid, reg: Some(Rc::clone(&st.script.local)) };
        }
        _ => {}
    }
    st.state = RunState::RetFunc;
    Ok(())
}

/// `getarg(<index>{, <default>})`
pub fn getarg(engine: &mut ScriptEngine, st: &mut ScriptState) -> Result<(), RuntimeError> {
    let nargs = caller_frame(st).map(|ri| ri.nargs).ok_or(RuntimeError::NotInFunction)?;
    let idx = engine.arg_num(st, 2)?;
    match usize::try_from(idx) {
        Ok(i) if i < nargs => st.push_copy(st.defsp - 1 - nargs + i),
        _ if st.has_data(3) => st.push_arg_copy(3),
        _ => Err(RuntimeError::builtin(
            "getarg",
            format!("index (idx={idx}) out of range (nargs={nargs}) and no default value found"),
        )),
    }
}

pub fn getargcount(_engine: &mut ScriptEngine, st: &mut ScriptState) -> Result<(), RuntimeError> {
    let nargs = caller_frame(st).map(|ri| ri.nargs).ok_or(RuntimeError::NotInFunction)?;
    st.push_int(nargs as i64);
    Ok(())
}

/// `<variable>[<index>]`
pub fn getelementofarray(engine: &mut ScriptEngine, st: &mut ScriptState) -> Result<(), RuntimeError> {
    let (uid, reg) = ref_arg(st, 2, "getelementofarray")?;
    let i = engine.arg_num(st, 3)?;
    let index = u32::try_from(i)
        .ok()
        .filter(|i| *i < SCRIPT_MAX_ARRAYSIZE)
        .ok_or(RuntimeError::IndexOutOfRange(i))?;
    st.push(ScriptData::Name { uid: reference_uid(uid_id(uid), index), reg });
    Ok(())
}

pub fn jump_zero(engine: &mut ScriptEngine, st: &mut ScriptState) -> Result<(), RuntimeError> {
    if engine.arg_num(st, 2)? == 0 {
        st.pos = label_arg(st, 3, "jump_zero")?;
        st.state = RunState::Goto;
    }
    Ok(())
}

pub fn goto(_engine: &mut ScriptEngine, st: &mut ScriptState) -> Result<(), RuntimeError> {
    st.pos = label_arg(st, 2, "goto")?;
    st.state = RunState::Goto;
    Ok(())
}

pub fn end(engine: &mut ScriptEngine, st: &mut ScriptState) -> Result<(), RuntimeError> {
    st.state = RunState::End;
    st.mes_active = false;
    if let Some(sd) = engine.world.pc_mut(st.rid) {
        sd.outbox.push(ClientMessage::Close { npc_id: st.oid });
    }
    Ok(())
}

/// `freeloop({<toggle>})`: lifts the runaway-loop guards.
pub fn freeloop(engine: &mut ScriptEngine, st: &mut ScriptState) -> Result<(), RuntimeError> {
    if st.has_data(2) {
        st.freeloop = engine.arg_num(st, 2)? != 0;
    }
    st.push_bool(st.freeloop);
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::game::pc::Character;
    use crate::game::scripting::{ParseOptions, ScriptEngine};

    fn run(engine: &mut ScriptEngine, src: &str) {
        let code = engine.parse_script(src, "test", 1, ParseOptions::NONE).unwrap().unwrap();
        engine.run_script(&code, 0, 0, 0);
    }

    fn num(engine: &mut ScriptEngine, name: &str) -> i64 {
        engine.get_val2_num(0, 0, name, 0).unwrap()
    }

    #[test]
    fn test_user_function_with_arguments() {
        let mut e = ScriptEngine::default();
        run(
            &mut e,
            r#"{
                function Add;
                function Count;
                $r = Add(2, 3);
                $n = Count(1, 2, 3);
                end;
                function Add { return getarg(0) + getarg(1); }
                function Count { return getargcount(); }
            }"#,
        );
        assert_eq!(num(&mut e, "$r"), 5);
        assert_eq!(num(&mut e, "$n"), 3);
        assert_eq!(e.state_count(), 0);
    }

    #[test]
    fn test_getarg_default() {
        let mut e = ScriptEngine::default();
        run(
            &mut e,
            r#"{
                function F;
                $a = F(7);
                $b = F();
                end;
                function F { return getarg(0, 42); }
            }"#,
        );
        assert_eq!(num(&mut e, "$a"), 7);
        assert_eq!(num(&mut e, "$b"), 42);
    }

    #[test]
    fn test_getarg_out_of_range_ends_script() {
        let mut e = ScriptEngine::default();
        run(&mut e, "{ function F; $a = 1; $b = F(); $a = 2; end; function F { return getarg(3); } }");
        assert_eq!(num(&mut e, "$a"), 1);
        assert_eq!(e.state_count(), 0);
    }

    #[test]
    fn test_scope_variables_are_per_call() {
        let mut e = ScriptEngine::default();
        run(
            &mut e,
            r#"{
                .@x = 1;
                callsub L_Sub;
                $outer = .@x;
                end;
            L_Sub:
                $inner = .@x;
                .@x = 99;
                return;
            }"#,
        );
        assert_eq!(num(&mut e, "$inner"), 0);
        assert_eq!(num(&mut e, "$outer"), 1);
    }

    #[test]
    fn test_pass_by_reference() {
        let mut e = ScriptEngine::default();
        run(
            &mut e,
            r#"{
                .@x = 1;
                callsub L_Bump, .@x;
                $x = .@x;
                end;
            L_Bump:
                set getarg(0), getarg(0) + 10;
                return;
            }"#,
        );
        assert_eq!(num(&mut e, "$x"), 11);
    }

    #[test]
    fn test_return_scope_variable_by_value() {
        let mut e = ScriptEngine::default();
        run(
            &mut e,
            r#"{
                function F;
                $v = F();
                end;
                function F { .@local = 5; return .@local; }
            }"#,
        );
        assert_eq!(num(&mut e, "$v"), 5);
    }

    #[test]
    fn test_callfunc_global_function() {
        let mut e = ScriptEngine::default();
        let func = e
            .parse_script("{ .calls += 1; return getarg(0) * 2; }", "func", 1, ParseOptions::NONE)
            .unwrap()
            .unwrap();
        e.add_userfunc("Double", func.clone());
        run(&mut e, "{ $d = callfunc(\"Double\", 21); $e = Double(1); end; }");
        assert_eq!(num(&mut e, "$d"), 42);
        assert_eq!(num(&mut e, "$e"), 2);
        let calls = e.db.symbols.search(".calls").unwrap();
        assert_eq!(func.local.borrow().get_num(crate::game::scripting::storage::reference_uid(calls, 0)), 2);
    }

    #[test]
    fn test_callfunc_missing_function_ends_script() {
        let mut e = ScriptEngine::default();
        run(&mut e, "{ $a = 1; callfunc \"Nope\"; $a = 2; end; }");
        assert_eq!(num(&mut e, "$a"), 1);
    }

    #[test]
    fn test_return_outside_function_ends_script() {
        let mut e = ScriptEngine::default();
        run(&mut e, "{ $a = 1; return; $a = 2; }");
        assert_eq!(num(&mut e, "$a"), 1);
        assert_eq!(e.state_count(), 0);
    }

    #[test]
    fn test_set_for_other_character() {
        let mut e = ScriptEngine::default();
        e.world.add_pc(Character::new(2000001, 150001, "Bob"));
        run(&mut e, "{ set @gift, 5, 150001; end; }");
        let uid = crate::game::scripting::storage::reference_uid(e.db.symbols.search("@gift").unwrap(), 0);
        assert_eq!(e.world.pc(2000001).unwrap().temp_reg.get_num(uid), 5);
    }

    #[test]
    fn test_goto_to_undefined_label_ends_script() {
        let mut e = ScriptEngine::default();
        run(&mut e, "{ $a = 1; goto L_Missing; $a = 2; end; }");
        assert_eq!(num(&mut e, "$a"), 1);
    }

    #[test]
    fn test_freeloop_query() {
        let mut e = ScriptEngine::default();
        run(&mut e, "{ $before = freeloop(); freeloop(1); $after = freeloop(); end; }");
        assert_eq!(num(&mut e, "$before"), 0);
        assert_eq!(num(&mut e, "$after"), 1);
    }
}
