//! Variable access for running scripts and for the host.
//!
//! A reference names a symbol and an index. Its prefix picks the store:
//!
//! | prefix | store |
//! |--------|-------|
//! | none   | character (or a character parameter) |
//! | `@`    | character, temporary |
//! | `#`    | account |
//! | `##`   | account, global |
//! | `$`    | server |
//! | `$@`   | server, temporary |
//! | `.`    | NPC-local (`ScriptCode::local`) |
//! | `.@`   | current call frame |
//! | `'`    | instance |
//!
//! A reference bound to an explicit store (`.@` arguments passed by
//! reference, `getvariableofnpc`) ignores the prefix rule.

use std::rc::Rc;

use crate::game::pc::Param;
use crate::game::World;

use super::error::RuntimeError;
use super::lexer::{is_string_variable, split_var_index, VarName, VarScope};
use super::parser::SCRIPT_VARNAME_LENGTH;
use super::state::{ScriptData, ScriptState};
use super::storage::{new_regdb_ref, reference_uid, uid_id, RegDb, RegDbRef, RegValue, Uid};
use super::symbol::{SymId, SymbolKind};
use super::ScriptEngine;

/// Where unbound references resolve.
#[derive(Debug, Clone)]
pub(crate) struct VarCtx {
    pub rid: u32,
    pub instance_id: i32,
    pub local: RegDbRef,
    pub scope: RegDbRef,
}

impl VarCtx {
    pub(crate) fn of(st: &ScriptState) -> Self {
        Self {
            rid: st.rid,
            instance_id: st.instance_id,
            local: Rc::clone(&st.script.local),
            scope: Rc::clone(&st.scope),
        }
    }
}

/// Leading integer of `s`, like C `strtol`: "12abc" is 12, "abc" is 0.
pub fn str_to_num(s: &str) -> i64 {
    let s = s.trim_start();
    let (neg, digits) = match s.as_bytes().first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    };
    let n = digits
        .bytes()
        .take_while(u8::is_ascii_digit)
        .fold(0i64, |n, b| n.saturating_mul(10).saturating_add(i64::from(b - b'0')));
    if neg {
        -n
    } else {
        n
    }
}

fn with_store<R>(
    world: &mut World,
    ctx: &VarCtx,
    name: &str,
    reg: Option<&RegDbRef>,
    f: impl FnOnce(&mut RegDb) -> R,
) -> Result<R, RuntimeError> {
    if let Some(reg) = reg {
        return Ok(f(&mut reg.borrow_mut()));
    }
    match VarName::parse(name).scope {
        VarScope::Npc => Ok(f(&mut ctx.local.borrow_mut())),
        VarScope::Scope => Ok(f(&mut ctx.scope.borrow_mut())),
        VarScope::Global | VarScope::GlobalTemp => Ok(f(&mut world.mapreg)),
        VarScope::Instance => world
            .instance_reg_mut(ctx.instance_id)
            .map(f)
            .ok_or_else(|| RuntimeError::NoInstanceAttached(name.to_string())),
        scope => {
            let sd = world
                .pc_mut(ctx.rid)
                .ok_or_else(|| RuntimeError::NoPlayerAttached(name.to_string()))?;
            let db = match scope {
                VarScope::CharTemp => &mut sd.temp_reg,
                VarScope::Account => &mut sd.account_reg,
                VarScope::AccountGlobal => &mut sd.account_reg2,
                _ => &mut sd.reg,
            };
            Ok(f(db))
        }
    }
}

impl ScriptEngine {
    /// Reads the value behind a reference.
    pub(crate) fn read_var(
        &mut self,
        ctx: &VarCtx,
        uid: Uid,
        reg: Option<&RegDbRef>,
    ) -> Result<ScriptData, RuntimeError> {
        let sym = self
            .db
            .symbols
            .get(uid_id(uid))
            .ok_or(RuntimeError::StackCorrupted("reference to an unknown symbol"))?;
        match sym.kind {
            SymbolKind::Int => return Ok(ScriptData::Int(sym.val)),
            SymbolKind::Param => {
                let sd = self
                    .world
                    .pc(ctx.rid)
                    .ok_or_else(|| RuntimeError::NoPlayerAttached(sym.name.clone()))?;
                let value = Param::from_num(sym.val).map(|p| sd.readparam(p)).unwrap_or(0);
                return Ok(ScriptData::Int(value));
            }
            _ => {}
        }
        let name = sym.name.as_str();
        let is_string = is_string_variable(name);
        with_store(&mut self.world, ctx, name, reg, |db| {
            if is_string {
                ScriptData::Str(db.get_str(uid))
            } else {
                ScriptData::Int(db.get_num(uid))
            }
        })
    }

    /// Writes through a reference. Values are coerced to the variable's
    /// type; an empty value deletes the entry.
    pub(crate) fn set_reg(
        &mut self,
        ctx: &VarCtx,
        uid: Uid,
        value: RegValue,
        reg: Option<&RegDbRef>,
    ) -> Result<(), RuntimeError> {
        let sym = self
            .db
            .symbols
            .get(uid_id(uid))
            .ok_or(RuntimeError::StackCorrupted("reference to an unknown symbol"))?;
        let name = sym.name.as_str();
        match sym.kind {
            SymbolKind::Int => return Err(RuntimeError::ReadOnly(name.to_string())),
            SymbolKind::Param => {
                let param = Param::from_num(sym.val).ok_or_else(|| RuntimeError::ReadOnly(name.to_string()))?;
                let sd = self
                    .world
                    .pc_mut(ctx.rid)
                    .ok_or_else(|| RuntimeError::NoPlayerAttached(name.to_string()))?;
                let num = match value {
                    RegValue::Num(n) => n,
                    RegValue::Str(s) => str_to_num(&s),
                };
                sd.setparam(param, num);
                return Ok(());
            }
            _ => {}
        }
        if name.len() > SCRIPT_VARNAME_LENGTH {
            return Err(RuntimeError::NameTooLong(name.to_string()));
        }
        let value = match (is_string_variable(name), value) {
            (true, RegValue::Num(n)) => RegValue::Str(n.to_string()),
            (false, RegValue::Str(s)) => RegValue::Num(str_to_num(&s)),
            (_, v) => v,
        };
        with_store(&mut self.world, ctx, name, reg, |db| db.set(uid, value))
    }

    /// Highest occupied index plus one of the array `id`.
    pub(crate) fn array_size(&mut self, ctx: &VarCtx, id: SymId, reg: Option<&RegDbRef>) -> Result<u32, RuntimeError> {
        let name = self.db.symbols.name(id);
        with_store(&mut self.world, ctx, name, reg, |db| db.array_size(id))
    }

    /// Occupied indexes of the array `id` at or above `start`, ascending.
    pub(crate) fn array_indexes(
        &mut self,
        ctx: &VarCtx,
        id: SymId,
        reg: Option<&RegDbRef>,
        start: u32,
    ) -> Result<Vec<u32>, RuntimeError> {
        let name = self.db.symbols.name(id);
        with_store(&mut self.world, ctx, name, reg, |db| db.array_indexes_from(id, start))
    }

    /// Interns a variable named at run time (`getd`, `setd`).
    pub(crate) fn runtime_name(&mut self, name: &str) -> SymId {
        let id = self.db.symbols.add(name);
        if let Some(sym) = self.db.symbols.get_mut(id) {
            if sym.kind == SymbolKind::Nop {
                sym.kind = SymbolKind::Name;
            }
        }
        id
    }

    /// Parses `name[index]` into a reference.
    pub(crate) fn runtime_ref(&mut self, text: &str) -> Uid {
        let (name, index) = split_var_index(text);
        reference_uid(self.runtime_name(name), index)
    }

    // ------------------------------------------------------------------
    // Stack slots
    // ------------------------------------------------------------------

    /// Replaces the reference at stack index `idx` with its value.
    pub(crate) fn get_val(&mut self, st: &mut ScriptState, idx: usize) -> Result<(), RuntimeError> {
        let (uid, reg) = match st.stack.get(idx) {
            Some(ScriptData::Name { uid, reg }) => (*uid, reg.clone()),
            Some(_) => return Ok(()),
            None => return Err(RuntimeError::StackCorrupted("get_val out of range")),
        };
        let ctx = VarCtx::of(st);
        let value = self.read_var(&ctx, uid, reg.as_ref())?;
        st.stack[idx] = value;
        Ok(())
    }

    pub(crate) fn conv_num(&mut self, st: &mut ScriptState, idx: usize) -> Result<i64, RuntimeError> {
        self.get_val(st, idx)?;
        Ok(match &st.stack[idx] {
            ScriptData::Int(n) => *n,
            ScriptData::Str(s) => str_to_num(s),
            ScriptData::Pos(p) => *p as i64,
            _ => 0,
        })
    }

    pub(crate) fn conv_str(&mut self, st: &mut ScriptState, idx: usize) -> Result<String, RuntimeError> {
        self.get_val(st, idx)?;
        Ok(match &st.stack[idx] {
            ScriptData::Int(n) => n.to_string(),
            ScriptData::Str(s) => s.clone(),
            _ => String::new(),
        })
    }

    /// Argument `i` of the running builtin as a number.
    pub(crate) fn arg_num(&mut self, st: &mut ScriptState, i: usize) -> Result<i64, RuntimeError> {
        if !st.has_data(i) {
            return Err(RuntimeError::StackCorrupted("missing argument"));
        }
        let idx = st.start + i;
        self.conv_num(st, idx)
    }

    /// Argument `i` of the running builtin as a string.
    pub(crate) fn arg_str(&mut self, st: &mut ScriptState, i: usize) -> Result<String, RuntimeError> {
        if !st.has_data(i) {
            return Err(RuntimeError::StackCorrupted("missing argument"));
        }
        let idx = st.start + i;
        self.conv_str(st, idx)
    }

    // ------------------------------------------------------------------
    // Host access
    // ------------------------------------------------------------------

    fn host_ctx(&self, rid: u32, oid: u32) -> VarCtx {
        let (local, instance_id) = self
            .world
            .npc(oid)
            .map(|nd| (Rc::clone(&nd.script.local), nd.instance_id))
            .unwrap_or_else(|| (new_regdb_ref(), 0));
        VarCtx { rid, instance_id, local, scope: new_regdb_ref() }
    }

    /// Reference for host text `name` or `name[index]`. A bracketed index
    /// wins over `elem`.
    fn host_ref(&mut self, text: &str, elem: u32) -> Uid {
        if text.contains('[') {
            self.runtime_ref(text)
        } else {
            reference_uid(self.runtime_name(text.trim()), elem)
        }
    }

    /// Sets `name[elem]` as seen by a script of NPC `oid` attached to `rid`.
    pub fn setd_sub_num(&mut self, rid: u32, oid: u32, name: &str, elem: u32, value: i64) -> Result<(), RuntimeError> {
        let ctx = self.host_ctx(rid, oid);
        let uid = self.host_ref(name, elem);
        self.set_reg(&ctx, uid, RegValue::Num(value), None)
    }

    pub fn setd_sub_str(&mut self, rid: u32, oid: u32, name: &str, elem: u32, value: &str) -> Result<(), RuntimeError> {
        let ctx = self.host_ctx(rid, oid);
        let uid = self.host_ref(name, elem);
        self.set_reg(&ctx, uid, RegValue::Str(value.to_string()), None)
    }

    /// Sets the character variable `name` (optionally `name[index]`) of `rid`
    /// to a string.
    pub fn set_var_str(&mut self, rid: u32, name: &str, value: &str) -> Result<(), RuntimeError> {
        self.setd_sub_str(rid, 0, name, 0, value)
    }

    /// Reads `name[elem]` as a number.
    pub fn get_val2_num(&mut self, rid: u32, oid: u32, name: &str, elem: u32) -> Result<i64, RuntimeError> {
        let ctx = self.host_ctx(rid, oid);
        let uid = self.host_ref(name, elem);
        Ok(match self.read_var(&ctx, uid, None)? {
            ScriptData::Int(n) => n,
            ScriptData::Str(s) => str_to_num(&s),
            _ => 0,
        })
    }

    pub fn get_val2_str(&mut self, rid: u32, oid: u32, name: &str, elem: u32) -> Result<String, RuntimeError> {
        let ctx = self.host_ctx(rid, oid);
        let uid = self.host_ref(name, elem);
        Ok(match self.read_var(&ctx, uid, None)? {
            ScriptData::Int(n) => n.to_string(),
            ScriptData::Str(s) => s,
            _ => String::new(),
        })
    }

    /// Highest index plus one of the array `name`.
    pub fn getarraysize(&mut self, rid: u32, oid: u32, name: &str) -> Result<u32, RuntimeError> {
        let ctx = self.host_ctx(rid, oid);
        let id = self.runtime_name(split_var_index(name).0);
        self.array_size(&ctx, id, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::pc::Character;

    fn ctx(rid: u32, instance_id: i32) -> VarCtx {
        VarCtx { rid, instance_id, local: new_regdb_ref(), scope: new_regdb_ref() }
    }

    #[test]
    fn test_str_to_num() {
        assert_eq!(str_to_num("42"), 42);
        assert_eq!(str_to_num("  -7"), -7);
        assert_eq!(str_to_num("12abc"), 12);
        assert_eq!(str_to_num("abc"), 0);
        assert_eq!(str_to_num(""), 0);
        assert_eq!(str_to_num("99999999999999999999999"), i64::MAX);
    }

    #[test]
    fn test_player_variable_needs_player() {
        let mut engine = ScriptEngine::default();
        let uid = engine.runtime_ref("@count");
        let err = engine.read_var(&ctx(0, 0), uid, None).unwrap_err();
        assert_eq!(err, RuntimeError::NoPlayerAttached("@count".to_string()));

        engine.world.add_pc(Character::new(2000000, 150000, "Tester"));
        engine.set_reg(&ctx(2000000, 0), uid, RegValue::Num(3), None).unwrap();
        assert_eq!(engine.world.pc(2000000).unwrap().temp_reg.get_num(uid), 3);
    }

    #[test]
    fn test_instance_variable_needs_instance() {
        let mut engine = ScriptEngine::default();
        let uid = engine.runtime_ref("'stage");
        assert!(matches!(
            engine.set_reg(&ctx(0, 0), uid, RegValue::Num(1), None),
            Err(RuntimeError::NoInstanceAttached(_))
        ));
        let instance = engine.world.create_instance();
        engine.set_reg(&ctx(0, instance), uid, RegValue::Num(1), None).unwrap();
        assert_eq!(engine.world.instance_reg(instance).unwrap().get_num(uid), 1);
    }

    #[test]
    fn test_constants_are_read_only() {
        let mut engine = ScriptEngine::default();
        let uid = reference_uid(engine.db.symbols.search("true").unwrap(), 0);
        assert!(engine.read_var(&ctx(0, 0), uid, None).unwrap().is_int());
        assert!(matches!(
            engine.set_reg(&ctx(0, 0), uid, RegValue::Num(0), None),
            Err(RuntimeError::ReadOnly(_))
        ));
    }

    #[test]
    fn test_params_go_through_character() {
        let mut engine = ScriptEngine::default();
        engine.world.add_pc(Character::new(2000000, 150000, "Tester"));
        let uid = reference_uid(engine.db.symbols.search("Zeny").unwrap(), 0);
        engine.set_reg(&ctx(2000000, 0), uid, RegValue::Num(-50), None).unwrap();
        assert_eq!(engine.world.pc(2000000).unwrap().readparam(Param::Zeny), 0);
        engine.set_reg(&ctx(2000000, 0), uid, RegValue::Str("500".into()), None).unwrap();
        assert!(matches!(engine.read_var(&ctx(2000000, 0), uid, None), Ok(ScriptData::Int(500))));
    }

    #[test]
    fn test_type_coercion_on_write() {
        let mut engine = ScriptEngine::default();
        let num = engine.runtime_ref("$n");
        let text = engine.runtime_ref("$s$");
        engine.set_reg(&ctx(0, 0), num, RegValue::Str("17 apples".into()), None).unwrap();
        engine.set_reg(&ctx(0, 0), text, RegValue::Num(5), None).unwrap();
        assert_eq!(engine.world.mapreg.get(num), Some(&RegValue::Num(17)));
        assert_eq!(engine.world.mapreg.get(text), Some(&RegValue::Str("5".into())));
    }

    #[test]
    fn test_name_too_long() {
        let mut engine = ScriptEngine::default();
        let uid = engine.runtime_ref("$a_really_long_variable_name_over_limit");
        assert!(matches!(
            engine.set_reg(&ctx(0, 0), uid, RegValue::Num(1), None),
            Err(RuntimeError::NameTooLong(_))
        ));
    }

    #[test]
    fn test_bound_reference_ignores_prefix() {
        let mut engine = ScriptEngine::default();
        let bound = new_regdb_ref();
        let uid = engine.runtime_ref(".@x");
        let c = ctx(0, 0);
        engine.set_reg(&c, uid, RegValue::Num(9), Some(&bound)).unwrap();
        assert_eq!(bound.borrow().get_num(uid), 9);
        assert_eq!(c.scope.borrow().get_num(uid), 0);
    }

    #[test]
    fn test_host_access() {
        let mut engine = ScriptEngine::default();
        engine.setd_sub_num(0, 0, "$prices", 3, 120).unwrap();
        engine.setd_sub_str(0, 0, "$names$", 0, "Apple").unwrap();
        assert_eq!(engine.get_val2_num(0, 0, "$prices", 3).unwrap(), 120);
        assert_eq!(engine.get_val2_str(0, 0, "$names$", 0).unwrap(), "Apple");
        assert_eq!(engine.getarraysize(0, 0, "$prices").unwrap(), 4);
    }

    #[test]
    fn test_host_access_parses_index() {
        let mut engine = ScriptEngine::default();
        engine.setd_sub_num(0, 0, "$arr[3]", 0, 42).unwrap();
        assert_eq!(engine.get_val2_num(0, 0, "$arr", 3).unwrap(), 42);
        assert_eq!(engine.get_val2_num(0, 0, " $arr[ 3 ] ", 7).unwrap(), 42);
        assert_eq!(engine.getarraysize(0, 0, "$arr").unwrap(), 4);
        assert_eq!(engine.getarraysize(0, 0, "$arr[0]").unwrap(), 4);
        // no bracketed symbol was created
        assert_eq!(engine.getarraysize(0, 0, "$arr[3]").unwrap(), 4);
    }

    #[test]
    fn test_set_var_str() {
        let mut engine = ScriptEngine::default();
        engine.world.add_pc(Character::new(2000001, 150001, "Tester"));
        engine.set_var_str(2000001, "note$", "hello").unwrap();
        engine.set_var_str(2000001, "@log$[2]", "third").unwrap();
        assert_eq!(engine.get_val2_str(2000001, 0, "note$", 0).unwrap(), "hello");
        assert_eq!(engine.get_val2_str(2000001, 0, "@log$", 2).unwrap(), "third");
        assert!(engine.set_var_str(0, "note$", "x").is_err());
    }
}
