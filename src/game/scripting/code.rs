use std::cell::Cell;
use std::rc::Rc;

use super::storage::{new_regdb_ref, RegDbRef};

/// A compiled script: immutable bytecode plus the NPC-local store (`.var`)
/// shared by every execution of it.
#[derive(Debug)]
pub struct ScriptCode {
    pub buf: Vec<u8>,
    pub local: RegDbRef,
    /// Source file, for diagnostics
    pub file: String,
    pub line: usize,
    /// Executions started on this code. Holders such as NPCs, `userfunc_db`
    /// and call frames keep `Rc`s too, so the strong count is not usable.
    instances: Cell<u32>,
}

impl ScriptCode {
    pub fn new(buf: Vec<u8>, file: &str, line: usize) -> Rc<ScriptCode> {
        Rc::new(ScriptCode {
            buf,
            local: new_regdb_ref(),
            file: file.to_string(),
            line,
            instances: Cell::new(0),
        })
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Live executions of this script.
    pub fn instances(&self) -> u32 {
        self.instances.get()
    }

    pub(crate) fn add_instance(&self) {
        self.instances.set(self.instances.get().saturating_add(1));
    }

    pub(crate) fn remove_instance(&self) {
        self.instances.set(self.instances.get().saturating_sub(1));
    }
}

/// A label exported by a compile that asked for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptLabel {
    pub name: String,
    pub pos: usize,
}
