//! Execution state and operand stack.

use std::rc::Rc;

use crate::core::Tick;
use crate::timer::TimerId;

use super::code::ScriptCode;
use super::error::RuntimeError;
use super::storage::{new_regdb_ref, uid_id, uid_index, RegDbRef, Uid};
use super::symbol::SymId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StateId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Executing
    Run,
    /// Waiting for the client to press "next"
    Stop,
    /// Finished
    End,
    /// A builtin moved the instruction pointer
    Goto,
    /// Returning from a user function
    RetFunc,
    /// Re-enter the current builtin with the same arguments
    RerunLine,
    /// Waiting for the client to close the dialog
    Close,
}

/// Saved caller context pushed onto the operand stack by `callsub`/`callfunc`.
#[derive(Debug)]
pub struct RetInfo {
    pub script: Rc<ScriptCode>,
    pub scope: RegDbRef,
    pub pos: usize,
    pub nargs: usize,
    pub defsp: usize,
}

/// A tagged operand stack slot.
///
/// Not `Clone`: a `RetInfo` frame may only be moved. Use
/// [`ScriptData::try_copy`] to duplicate plain values.
#[derive(Debug)]
pub enum ScriptData {
    Nop,
    Int(i64),
    Str(String),
    /// A resolved label
    Pos(usize),
    /// A variable reference, optionally bound to a foreign store
    Name { uid: Uid, reg: Option<RegDbRef> },
    /// Marks the start of a builtin's arguments
    Arg,
    RetInfo(Box<RetInfo>),
}

impl ScriptData {
    pub fn name(uid: Uid) -> ScriptData {
        ScriptData::Name { uid, reg: None }
    }

    pub fn try_copy(&self) -> Result<ScriptData, RuntimeError> {
        Ok(match self {
            ScriptData::Nop => ScriptData::Nop,
            ScriptData::Int(n) => ScriptData::Int(*n),
            ScriptData::Str(s) => ScriptData::Str(s.clone()),
            ScriptData::Pos(p) => ScriptData::Pos(*p),
            ScriptData::Name { uid, reg } => ScriptData::Name { uid: *uid, reg: reg.clone() },
            ScriptData::Arg => ScriptData::Arg,
            ScriptData::RetInfo(_) => return Err(RuntimeError::RetInfoCopy),
        })
    }

    pub fn is_int(&self) -> bool {
        matches!(self, ScriptData::Int(_))
    }

    pub fn is_string(&self) -> bool {
        matches!(self, ScriptData::Str(_))
    }

    pub fn is_label(&self) -> bool {
        matches!(self, ScriptData::Pos(_))
    }

    pub fn is_reference(&self) -> bool {
        matches!(self, ScriptData::Name { .. })
    }

    pub fn reference_id(&self) -> Option<SymId> {
        match self {
            ScriptData::Name { uid, .. } => Some(uid_id(*uid)),
            _ => None,
        }
    }

    pub fn reference_index(&self) -> Option<u32> {
        match self {
            ScriptData::Name { uid, .. } => Some(uid_index(*uid)),
            _ => None,
        }
    }

    pub fn reference_reg(&self) -> Option<RegDbRef> {
        match self {
            ScriptData::Name { reg, .. } => reg.clone(),
            _ => None,
        }
    }

    /// Short description for diagnostics.
    pub fn describe(&self) -> String {
        match self {
            ScriptData::Nop => "nil".to_string(),
            ScriptData::Int(n) => format!("number ({n})"),
            ScriptData::Str(s) => format!("string (\"{s}\")"),
            ScriptData::Pos(p) => format!("label ({p})"),
            ScriptData::Name { uid, .. } => {
                format!("variable (id {} index {})", uid_id(*uid), uid_index(*uid))
            }
            ScriptData::Arg => "argument marker".to_string(),
            ScriptData::RetInfo(_) => "return info".to_string(),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SleepInfo {
    /// Requested delay in ms; non-zero while a sleep is pending
    pub tick: Tick,
    pub timer: Option<TimerId>,
    /// Character the sleep was started for
    pub charid: u32,
}

/// One execution of a script.
#[derive(Debug)]
pub struct ScriptState {
    pub id: StateId,
    /// Code currently executing (changes across `callfunc`)
    pub script: Rc<ScriptCode>,
    /// Code the state was created for
    pub origin: Rc<ScriptCode>,
    pub pos: usize,
    pub stack: Vec<ScriptData>,
    /// Base of the current call frame
    pub defsp: usize,
    /// `.@` variables of the current call frame
    pub scope: RegDbRef,
    /// Stack index of the running builtin's name
    pub start: usize,
    /// One past the running builtin's last argument
    pub end: usize,
    pub state: RunState,
    /// Attached character (account id), 0 if none
    pub rid: u32,
    /// Owner object id
    pub oid: u32,
    pub instance_id: i32,
    pub sleep: SleepInfo,
    /// Stack slots of pending compound-assignment targets
    pub op2ref: Vec<usize>,
    pub freeloop: bool,
    pub mes_active: bool,
}

impl ScriptState {
    pub fn new(id: StateId, script: Rc<ScriptCode>, pos: usize, rid: u32, oid: u32) -> Self {
        script.add_instance();
        Self {
            id,
            origin: Rc::clone(&script),
            script,
            pos,
            stack: Vec::with_capacity(32),
            defsp: 0,
            scope: new_regdb_ref(),
            start: 0,
            end: 0,
            state: RunState::Run,
            rid,
            oid,
            instance_id: 0,
            sleep: SleepInfo::default(),
            op2ref: Vec::new(),
            freeloop: false,
            mes_active: false,
        }
    }

    pub fn sp(&self) -> usize {
        self.stack.len()
    }

    pub fn push(&mut self, data: ScriptData) {
        self.stack.push(data);
    }

    pub fn push_int(&mut self, n: i64) {
        self.stack.push(ScriptData::Int(n));
    }

    pub fn push_bool(&mut self, b: bool) {
        self.push_int(i64::from(b));
    }

    pub fn push_str(&mut self, s: impl Into<String>) {
        self.stack.push(ScriptData::Str(s.into()));
    }

    pub fn push_nil(&mut self) {
        self.stack.push(ScriptData::Nop);
    }

    /// Pushes a copy of the slot at absolute index `i`.
    pub fn push_copy(&mut self, i: usize) -> Result<(), RuntimeError> {
        let copy = self
            .stack
            .get(i)
            .ok_or(RuntimeError::StackCorrupted("push_copy out of range"))?
            .try_copy()?;
        self.stack.push(copy);
        Ok(())
    }

    /// Removes slots `start..end`, keeping `start`, `end` and `defsp` pointing
    /// at the same logical slots.
    pub fn pop_stack(&mut self, start: usize, end: usize) {
        let end = end.min(self.stack.len());
        if start >= end {
            return;
        }
        self.stack.drain(start..end);
        let n = end - start;
        let adjust = |p: &mut usize| {
            if *p > end {
                *p -= n;
            } else if *p > start {
                *p = start;
            }
        };
        adjust(&mut self.start);
        adjust(&mut self.end);
        adjust(&mut self.defsp);
    }

    /// Removes slots relative to the top: `remove_top(-2, 0)` pops two.
    pub fn remove_top(&mut self, start: isize, end: isize) {
        let sp = self.sp() as isize;
        let s = (sp + start).max(0) as usize;
        let e = (sp + end).max(0) as usize;
        self.pop_stack(s, e);
    }

    pub fn top(&self, offset: isize) -> Option<&ScriptData> {
        let i = self.sp() as isize + offset;
        usize::try_from(i).ok().and_then(|i| self.stack.get(i))
    }

    // ------------------------------------------------------------------
    // Builtin argument access. Index 0 is the builtin name, 1 the C_ARG
    // marker and 2 the first argument.
    // ------------------------------------------------------------------

    /// Index of the last argument.
    pub fn lastdata(&self) -> usize {
        self.end.saturating_sub(self.start + 1)
    }

    pub fn has_data(&self, i: usize) -> bool {
        self.end > self.start + i
    }

    /// Number of arguments passed to the running builtin.
    pub fn arg_count(&self) -> usize {
        self.end.saturating_sub(self.start + 2)
    }

    pub fn data(&self, i: usize) -> Option<&ScriptData> {
        if self.has_data(i) {
            self.stack.get(self.start + i)
        } else {
            None
        }
    }

    pub fn data_mut(&mut self, i: usize) -> Option<&mut ScriptData> {
        if self.has_data(i) {
            self.stack.get_mut(self.start + i)
        } else {
            None
        }
    }

    pub fn push_arg_copy(&mut self, i: usize) -> Result<(), RuntimeError> {
        if !self.has_data(i) {
            return Err(RuntimeError::StackCorrupted("argument out of range"));
        }
        self.push_copy(self.start + i)
    }
}

impl Drop for ScriptState {
    fn drop(&mut self) {
        self.origin.remove_instance();
    }
}
