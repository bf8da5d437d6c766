//! Builtin function table.
//!
//! Each entry pairs a name with its handler and an argument signature read
//! by the compiler (argument count) and the VM (type warnings):
//!
//! | char | meaning |
//! |------|---------|
//! | `i`  | number |
//! | `s`  | string |
//! | `v`  | number, string or variable |
//! | `r`  | variable reference |
//! | `l`  | label |
//! | `.`  | anything |
//! | `?`  | the rest are optional |
//! | `*`  | any number of further arguments |
//!
//! Handlers read arguments through the running state (index 2 is the first
//! argument), push at most one result, and may change the run state.

pub mod array;
pub mod control;
pub mod dialog;
pub mod misc;

use std::fmt;

use super::error::RuntimeError;
use super::state::{ScriptData, ScriptState};
use super::storage::{RegDbRef, Uid};
use super::ScriptEngine;

pub type BuiltinFn = fn(&mut ScriptEngine, &mut ScriptState) -> Result<(), RuntimeError>;

#[derive(Clone, Copy)]
pub struct BuiltinDef {
    pub name: &'static str,
    pub func: BuiltinFn,
    pub arg: &'static str,
    /// Replacement hint for deprecated builtins
    pub deprecated: Option<&'static str>,
}

impl BuiltinDef {
    pub const fn new(name: &'static str, func: BuiltinFn, arg: &'static str) -> Self {
        Self { name, func, arg, deprecated: None }
    }

    pub const fn deprecated(mut self, alternative: &'static str) -> Self {
        self.deprecated = Some(alternative);
        self
    }
}

impl fmt::Debug for BuiltinDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuiltinDef")
            .field("name", &self.name)
            .field("arg", &self.arg)
            .field("deprecated", &self.deprecated)
            .finish()
    }
}

pub static BUILTINS: &[BuiltinDef] = &[
    // control flow and calls
    BuiltinDef::new("set", control::set, "rv?"),
    BuiltinDef::new("callsub", control::callsub, "l*"),
    BuiltinDef::new("callfunc", control::callfunc, "s*"),
    BuiltinDef::new("return", control::return_, "?"),
    BuiltinDef::new("getarg", control::getarg, "i?"),
    BuiltinDef::new("getargcount", control::getargcount, ""),
    BuiltinDef::new("getelementofarray", control::getelementofarray, "ri"),
    BuiltinDef::new("jump_zero", control::jump_zero, "il"),
    BuiltinDef::new("goto", control::goto, "l"),
    BuiltinDef::new("end", control::end, ""),
    BuiltinDef::new("freeloop", control::freeloop, "?"),
    // dialog
    BuiltinDef::new("mes", dialog::mes, "s*"),
    BuiltinDef::new("next", dialog::next, ""),
    BuiltinDef::new("close", dialog::close, ""),
    BuiltinDef::new("close2", dialog::close2, ""),
    BuiltinDef::new("clear", dialog::clear, ""),
    BuiltinDef::new("menu", dialog::menu, "sl*"),
    BuiltinDef::new("select", dialog::select, "s*"),
    BuiltinDef::new("prompt", dialog::prompt, "s*"),
    BuiltinDef::new("input", dialog::input, "r??"),
    // arrays and dynamic variables
    BuiltinDef::new("setarray", array::setarray, "rv*"),
    BuiltinDef::new("cleararray", array::cleararray, "rvi"),
    BuiltinDef::new("getarraysize", array::getarraysize, "r"),
    BuiltinDef::new("deletearray", array::deletearray, "r?"),
    BuiltinDef::new("copyarray", array::copyarray, "rri"),
    BuiltinDef::new("inarray", array::inarray, "rv"),
    BuiltinDef::new("getd", array::getd, "s"),
    BuiltinDef::new("setd", array::setd, "sv"),
    BuiltinDef::new("getvariableofnpc", array::getvariableofnpc, "rs"),
    // timing, attachment and events
    BuiltinDef::new("sleep", misc::sleep, "i"),
    BuiltinDef::new("sleep2", misc::sleep2, "i"),
    BuiltinDef::new("awake", misc::awake, "s"),
    BuiltinDef::new("gettimetick", misc::gettimetick, "i"),
    BuiltinDef::new("gettime", misc::gettime, "i"),
    BuiltinDef::new("attachrid", misc::attachrid, "i?"),
    BuiltinDef::new("detachrid", misc::detachrid, ""),
    BuiltinDef::new("playerattached", misc::playerattached, ""),
    BuiltinDef::new("getcharid", misc::getcharid, "i?"),
    BuiltinDef::new("strcharinfo", misc::strcharinfo, "i?"),
    BuiltinDef::new("readparam", misc::readparam, "i?"),
    BuiltinDef::new("donpcevent", misc::donpcevent, "s"),
    BuiltinDef::new("doevent", misc::doevent, "s"),
    BuiltinDef::new("instance_id", misc::instance_id, "?"),
    // values
    BuiltinDef::new("rand", misc::rand, "i?"),
    BuiltinDef::new("md5", misc::md5, "s"),
    BuiltinDef::new("getstrlen", misc::getstrlen, "s"),
    BuiltinDef::new("charat", misc::charat, "si"),
    BuiltinDef::new("strtoupper", misc::strtoupper, "s"),
    BuiltinDef::new("strtolower", misc::strtolower, "s"),
    BuiltinDef::new("implode", misc::implode, "r?"),
    BuiltinDef::new("atoi", misc::atoi, "s"),
    BuiltinDef::new("debugmes", misc::debugmes, "s"),
];

/// Account id of the attached character.
pub(crate) fn rid2sd(engine: &ScriptEngine, st: &ScriptState) -> Result<u32, RuntimeError> {
    if st.rid != 0 && engine.world.pc(st.rid).is_some() {
        Ok(st.rid)
    } else {
        Err(RuntimeError::PlayerNotAttached)
    }
}

/// Argument `i` as a variable reference.
pub(crate) fn ref_arg(st: &ScriptState, i: usize, func: &'static str) -> Result<(Uid, Option<RegDbRef>), RuntimeError> {
    match st.data(i) {
        Some(ScriptData::Name { uid, reg }) => Ok((*uid, reg.clone())),
        _ => Err(RuntimeError::NotAVariable(func)),
    }
}

/// Argument `i` as a label position.
pub(crate) fn label_arg(st: &ScriptState, i: usize, func: &'static str) -> Result<usize, RuntimeError> {
    match st.data(i) {
        Some(ScriptData::Pos(pos)) => Ok(*pos),
        _ => Err(RuntimeError::NotALabel(func)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_names_are_unique() {
        let mut seen = HashSet::new();
        for def in BUILTINS {
            assert!(seen.insert(def.name.to_ascii_lowercase()), "duplicate builtin {}", def.name);
        }
    }

    #[test]
    fn test_signatures_are_well_formed() {
        for def in BUILTINS {
            let sig = def.arg.as_bytes();
            for (i, c) in sig.iter().enumerate() {
                assert!(b"isvrl.?*".contains(c), "{}: bad signature char {}", def.name, *c as char);
                if *c == b'*' {
                    assert_eq!(i, sig.len() - 1, "{}: '*' must be last", def.name);
                }
            }
        }
    }
}
