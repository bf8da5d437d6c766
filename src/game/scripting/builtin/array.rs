//! Array manipulation and variables named at run time.

use std::collections::BTreeSet;
use std::rc::Rc;

use crate::game::scripting::error::RuntimeError;
use crate::game::scripting::lexer::{is_string_variable, VarName, VarScope};
use crate::game::scripting::state::{ScriptData, ScriptState};
use crate::game::scripting::storage::{reference_uid, uid_id, uid_index, RegDbRef, RegValue, Uid, SCRIPT_MAX_ARRAYSIZE};
use crate::game::scripting::symbol::SymId;
use crate::game::scripting::vars::{str_to_num, VarCtx};
use crate::game::scripting::ScriptEngine;

use super::ref_arg;

/// Reads `id[index]` as a storable value.
fn read_value(
    engine: &mut ScriptEngine,
    ctx: &VarCtx,
    id: SymId,
    index: u32,
    reg: Option<&RegDbRef>,
) -> Result<RegValue, RuntimeError> {
    Ok(match engine.read_var(ctx, reference_uid(id, index), reg)? {
        ScriptData::Str(s) => RegValue::Str(s),
        ScriptData::Int(n) => RegValue::Num(n),
        _ => RegValue::Num(0),
    })
}

/// Argument `i` converted to the type of the variable `name`.
fn arg_value(engine: &mut ScriptEngine, st: &mut ScriptState, i: usize, name: &str) -> Result<RegValue, RuntimeError> {
    Ok(if is_string_variable(name) {
        RegValue::Str(engine.arg_str(st, i)?)
    } else {
        RegValue::Num(engine.arg_num(st, i)?)
    })
}

fn symbol_name(engine: &ScriptEngine, uid: Uid) -> String {
    engine.db.symbols.name(uid_id(uid)).to_string()
}

/// `setarray <array>[<first>], <value>{, <value>...}`
pub fn setarray(engine: &mut ScriptEngine, st: &mut ScriptState) -> Result<(), RuntimeError> {
    let (uid, reg) = ref_arg(st, 2, "setarray")?;
    let (id, start) = (uid_id(uid), uid_index(uid));
    let name = symbol_name(engine, uid);
    let ctx = VarCtx::of(st);

    let count = st.lastdata().saturating_sub(2) as u64;
    let end = (u64::from(start) + count).min(u64::from(SCRIPT_MAX_ARRAYSIZE));
    for (arg, index) in (3..).zip(u64::from(start)..end) {
        let value = arg_value(engine, st, arg, &name)?;
        engine.set_reg(&ctx, reference_uid(id, index as u32), value, reg.as_ref())?;
    }
    Ok(())
}

/// `cleararray <array>[<first>], <value>, <count>`
pub fn cleararray(engine: &mut ScriptEngine, st: &mut ScriptState) -> Result<(), RuntimeError> {
    let (uid, reg) = ref_arg(st, 2, "cleararray")?;
    let (id, start) = (uid_id(uid), uid_index(uid));
    let name = symbol_name(engine, uid);
    let value = arg_value(engine, st, 3, &name)?;
    let count = engine.arg_num(st, 4)?;
    if count <= 0 {
        return Ok(());
    }
    let ctx = VarCtx::of(st);

    let end = (u64::from(start) + count as u64).min(u64::from(SCRIPT_MAX_ARRAYSIZE));
    if value.is_empty() {
        // only occupied slots need touching
        for index in engine.array_indexes(&ctx, id, reg.as_ref(), start)? {
            if u64::from(index) >= end {
                break;
            }
            engine.set_reg(&ctx, reference_uid(id, index), value.clone(), reg.as_ref())?;
        }
        return Ok(());
    }
    for index in u64::from(start)..end {
        engine.set_reg(&ctx, reference_uid(id, index as u32), value.clone(), reg.as_ref())?;
    }
    Ok(())
}

pub fn getarraysize(engine: &mut ScriptEngine, st: &mut ScriptState) -> Result<(), RuntimeError> {
    let (uid, reg) = ref_arg(st, 2, "getarraysize")?;
    let ctx = VarCtx::of(st);
    let size = engine.array_size(&ctx, uid_id(uid), reg.as_ref())?;
    st.push_int(i64::from(size));
    Ok(())
}

/// `deletearray <array>[<first>]{, <count>}`
///
/// Removes `count` elements starting at `first`, shifting the rest down.
/// Without a count everything from `first` on is removed.
pub fn deletearray(engine: &mut ScriptEngine, st: &mut ScriptState) -> Result<(), RuntimeError> {
    let (uid, reg) = ref_arg(st, 2, "deletearray")?;
    let (id, start) = (uid_id(uid), uid_index(uid));
    let empty = RegValue::empty(is_string_variable(&symbol_name(engine, uid)));
    let ctx = VarCtx::of(st);

    let count = if st.has_data(3) {
        let count = engine.arg_num(st, 3)?.min(i64::from(SCRIPT_MAX_ARRAYSIZE - start));
        if count <= 0 {
            return Ok(());
        }
        Some(count as u32)
    } else {
        None
    };

    let indexes = engine.array_indexes(&ctx, id, reg.as_ref(), start)?;
    let mut moved = Vec::new();
    for &index in &indexes {
        if let Some(count) = count {
            if index - start >= count {
                moved.push((index - count, read_value(engine, &ctx, id, index, reg.as_ref())?));
            }
        }
        engine.set_reg(&ctx, reference_uid(id, index), empty.clone(), reg.as_ref())?;
    }
    for (index, value) in moved {
        engine.set_reg(&ctx, reference_uid(id, index), value, reg.as_ref())?;
    }
    Ok(())
}

/// `copyarray <dest>[<first>], <source>[<first>], <count>`
///
/// Overlapping ranges of the same array copy as if through a temporary.
pub fn copyarray(engine: &mut ScriptEngine, st: &mut ScriptState) -> Result<(), RuntimeError> {
    let (dst, dst_reg) = ref_arg(st, 2, "copyarray")?;
    let (src, src_reg) = ref_arg(st, 3, "copyarray")?;
    let (id1, idx1) = (uid_id(dst), uid_index(dst));
    let (id2, idx2) = (uid_id(src), uid_index(src));
    let is_string = is_string_variable(&symbol_name(engine, dst));
    if is_string != is_string_variable(&symbol_name(engine, src)) {
        return Err(RuntimeError::builtin("copyarray", "type mismatch"));
    }

    let count = engine.arg_num(st, 4)?.min(i64::from(SCRIPT_MAX_ARRAYSIZE - idx1));
    let same_store = match (&dst_reg, &src_reg) {
        (Some(a), Some(b)) => Rc::ptr_eq(a, b),
        (None, None) => true,
        _ => false,
    };
    if count <= 0 || (id1 == id2 && idx1 == idx2 && same_store) {
        return Ok(());
    }
    let count = count as u32;
    let ctx = VarCtx::of(st);

    // offsets that hold a value in the source or the destination range
    let mut offsets = BTreeSet::new();
    for index in engine.array_indexes(&ctx, id2, src_reg.as_ref(), idx2)? {
        if index - idx2 >= count {
            break;
        }
        offsets.insert(index - idx2);
    }
    for index in engine.array_indexes(&ctx, id1, dst_reg.as_ref(), idx1)? {
        if index - idx1 >= count {
            break;
        }
        offsets.insert(index - idx1);
    }

    let mut values = Vec::with_capacity(offsets.len());
    for offset in offsets {
        let value = match idx2.checked_add(offset).filter(|i| *i < SCRIPT_MAX_ARRAYSIZE) {
            Some(index) => read_value(engine, &ctx, id2, index, src_reg.as_ref())?,
            None => RegValue::empty(is_string),
        };
        values.push((offset, value));
    }
    for (offset, value) in values {
        engine.set_reg(&ctx, reference_uid(id1, idx1 + offset), value, dst_reg.as_ref())?;
    }
    Ok(())
}

/// `inarray(<array>, <value>)`: first index holding `value`, or -1.
pub fn inarray(engine: &mut ScriptEngine, st: &mut ScriptState) -> Result<(), RuntimeError> {
    let (uid, reg) = ref_arg(st, 2, "inarray")?;
    let id = uid_id(uid);
    let is_string = is_string_variable(&symbol_name(engine, uid));
    let ctx = VarCtx::of(st);

    let size = engine.array_size(&ctx, id, reg.as_ref())?;
    if size == 0 {
        st.push_int(-1);
        return Ok(());
    }

    let idx = st.start + 3;
    engine.get_val(st, idx)?;
    let wanted = match (&st.stack[idx], is_string) {
        (ScriptData::Str(s), true) => RegValue::Str(s.clone()),
        (ScriptData::Int(n), false) => RegValue::Num(*n),
        (_, true) => return Err(RuntimeError::builtin("inarray", "not string")),
        (_, false) => return Err(RuntimeError::builtin("inarray", "not integer")),
    };

    let indexes = engine.array_indexes(&ctx, id, reg.as_ref(), 0)?;
    let found = if wanted.is_empty() {
        // an unset element reads as the empty value; find the first hole
        (0..size)
            .zip(indexes.iter().copied().chain(std::iter::once(u32::MAX)))
            .find(|(i, occupied)| i != occupied)
            .map(|(i, _)| i64::from(i))
    } else {
        let mut found = None;
        for index in indexes {
            if read_value(engine, &ctx, id, index, reg.as_ref())? == wanted {
                found = Some(i64::from(index));
                break;
            }
        }
        found
    };
    st.push_int(found.unwrap_or(-1));
    Ok(())
}

/// `getd("<name>[<index>]")`: a reference to a variable named at run time.
pub fn getd(engine: &mut ScriptEngine, st: &mut ScriptState) -> Result<(), RuntimeError> {
    let text = engine.arg_str(st, 2)?;
    let uid = engine.runtime_ref(&text);
    st.push(ScriptData::name(uid));
    Ok(())
}

/// `setd "<name>[<index>]", <value>`
pub fn setd(engine: &mut ScriptEngine, st: &mut ScriptState) -> Result<(), RuntimeError> {
    let text = engine.arg_str(st, 2)?;
    let uid = engine.runtime_ref(&text);
    let name = symbol_name(engine, uid);
    let value = if is_string_variable(&name) {
        RegValue::Str(engine.arg_str(st, 3)?)
    } else {
        RegValue::Num(str_to_num(&engine.arg_str(st, 3)?))
    };
    engine.set_reg(&VarCtx::of(st), uid, value, None)
}

/// `getvariableofnpc(<.variable>, "<npc name>")`
pub fn getvariableofnpc(engine: &mut ScriptEngine, st: &mut ScriptState) -> Result<(), RuntimeError> {
    let (uid, _) = ref_arg(st, 2, "getvariableofnpc")?;
    let name = symbol_name(engine, uid);
    if VarName::parse(&name).scope != VarScope::Npc {
        return Err(RuntimeError::builtin(
            "getvariableofnpc",
            format!("invalid scope {name} (not npc variable)"),
        ));
    }
    let npc_name = engine.arg_str(st, 3)?;
    let local = engine
        .world
        .name2npc(&npc_name)
        .map(|nd| Rc::clone(&nd.script.local))
        .ok_or_else(|| RuntimeError::builtin("getvariableofnpc", format!("can't find npc {npc_name}")))?;
    st.push(ScriptData::Name { uid, reg: Some(local) });
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::game::npc::NpcData;
    use crate::game::scripting::code::ScriptCode;
    use crate::game::scripting::storage::reference_uid;
    use crate::game::scripting::{ParseOptions, ScriptEngine};

    fn run(engine: &mut ScriptEngine, src: &str) {
        let code = engine.parse_script(src, "test", 1, ParseOptions::NONE).unwrap().unwrap();
        engine.run_script(&code, 0, 0, 0);
    }

    fn num(engine: &mut ScriptEngine, name: &str, elem: u32) -> i64 {
        engine.get_val2_num(0, 0, name, elem).unwrap()
    }

    fn nums(engine: &mut ScriptEngine, name: &str) -> Vec<i64> {
        let size = engine.getarraysize(0, 0, name).unwrap();
        (0..size).map(|i| num(engine, name, i)).collect()
    }

    #[test]
    fn test_setarray_and_size() {
        let mut e = ScriptEngine::default();
        run(&mut e, "{ setarray $a[1], 10, 20, 30; $n = getarraysize($a); end; }");
        assert_eq!(nums(&mut e, "$a"), vec![0, 10, 20, 30]);
        assert_eq!(num(&mut e, "$n", 0), 4);
    }

    #[test]
    fn test_array_element_access() {
        let mut e = ScriptEngine::default();
        run(&mut e, "{ setarray $a, 5, 6, 7; .@i = 2; $x = $a[.@i] + $a[0]; $a[.@i + 1] = 8; end; }");
        assert_eq!(num(&mut e, "$x", 0), 12);
        assert_eq!(nums(&mut e, "$a"), vec![5, 6, 7, 8]);
    }

    #[test]
    fn test_cleararray() {
        let mut e = ScriptEngine::default();
        run(&mut e, "{ cleararray $a, 7, 3; setarray $b, 1, 2, 3, 4; cleararray $b[1], 0, 2; end; }");
        assert_eq!(nums(&mut e, "$a"), vec![7, 7, 7]);
        assert_eq!(nums(&mut e, "$b"), vec![1, 0, 0, 4]);
    }

    #[test]
    fn test_deletearray_shifts() {
        let mut e = ScriptEngine::default();
        run(&mut e, "{ setarray $a, 1, 2, 3, 4, 5; deletearray $a[1], 2; end; }");
        assert_eq!(nums(&mut e, "$a"), vec![1, 4, 5]);
    }

    #[test]
    fn test_deletearray_without_count() {
        let mut e = ScriptEngine::default();
        run(&mut e, "{ setarray $a, 1, 2, 3; deletearray $a[1]; setarray $b$, \"x\", \"y\"; deletearray $b$; end; }");
        assert_eq!(nums(&mut e, "$a"), vec![1]);
        assert_eq!(e.getarraysize(0, 0, "$b$").unwrap(), 0);
    }

    #[test]
    fn test_copyarray_overlapping() {
        let mut e = ScriptEngine::default();
        run(&mut e, "{ setarray $a, 1, 2, 3, 4; copyarray $a[1], $a[0], 3; end; }");
        assert_eq!(nums(&mut e, "$a"), vec![1, 1, 2, 3]);

        run(&mut e, "{ setarray $b, 1, 2, 3, 4; copyarray $b[0], $b[1], 3; end; }");
        assert_eq!(nums(&mut e, "$b"), vec![2, 3, 4, 4]);
    }

    #[test]
    fn test_copyarray_clears_holes() {
        let mut e = ScriptEngine::default();
        run(&mut e, "{ setarray $src, 1, 0, 3; setarray $dst, 9, 9, 9; copyarray $dst, $src, 3; end; }");
        assert_eq!(nums(&mut e, "$dst"), vec![1, 0, 3]);
    }

    #[test]
    fn test_copyarray_type_mismatch_ends_script() {
        let mut e = ScriptEngine::default();
        run(&mut e, "{ $ok = 1; setarray $s$, \"a\"; copyarray $n, $s$, 1; $ok = 2; end; }");
        assert_eq!(num(&mut e, "$ok", 0), 1);
    }

    #[test]
    fn test_inarray() {
        let mut e = ScriptEngine::default();
        run(
            &mut e,
            r#"{
                setarray $a, 4, 0, 6;
                $i = inarray($a, 6);
                $j = inarray($a, 0);
                $k = inarray($a, 9);
                setarray $s$, "x", "y";
                $l = inarray($s$, "y");
                $m = inarray($empty, 1);
                end;
            }"#,
        );
        assert_eq!(num(&mut e, "$i", 0), 2);
        assert_eq!(num(&mut e, "$j", 0), 1);
        assert_eq!(num(&mut e, "$k", 0), -1);
        assert_eq!(num(&mut e, "$l", 0), 1);
        assert_eq!(num(&mut e, "$m", 0), -1);
    }

    #[test]
    fn test_getd_setd() {
        let mut e = ScriptEngine::default();
        run(
            &mut e,
            r#"{
                .@n = 3;
                setd "$slot_" + .@n, 30;
                setd "$names$[2]", "two";
                $v = getd("$slot_3");
                $w$ = getd("$names$[2]");
                set getd("$slot_4"), 40;
                end;
            }"#,
        );
        assert_eq!(num(&mut e, "$slot_3", 0), 30);
        assert_eq!(num(&mut e, "$v", 0), 30);
        assert_eq!(e.get_val2_str(0, 0, "$w$", 0).unwrap(), "two");
        assert_eq!(num(&mut e, "$slot_4", 0), 40);
    }

    #[test]
    fn test_getvariableofnpc() {
        let mut e = ScriptEngine::default();
        let other = ScriptCode::new(vec![0], "other", 1);
        let id = e.world.next_npc_id();
        e.world.add_npc(NpcData::new(id, "Other", "Other", other.clone())).unwrap();
        run(
            &mut e,
            r#"{
                set getvariableofnpc(.count, "Other"), 5;
                $read = getvariableofnpc(.count, "Other") + 1;
                end;
            }"#,
        );
        let count = e.db.symbols.search(".count").unwrap();
        assert_eq!(other.local.borrow().get_num(reference_uid(count, 0)), 5);
        assert_eq!(num(&mut e, "$read", 0), 6);
    }

    #[test]
    fn test_getvariableofnpc_rejects_other_scopes() {
        let mut e = ScriptEngine::default();
        run(&mut e, "{ $ok = 1; $x = getvariableofnpc($g, \"Nobody\"); $ok = 2; end; }");
        assert_eq!(num(&mut e, "$ok", 0), 1);
    }
}
