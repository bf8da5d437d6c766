//! Symbol table shared by every compile.
//!
//! Identifiers, constants, builtins and generated label names are interned
//! here and identified by stable integer ids. Lookup is case-insensitive; the
//! first spelling seen becomes the display name.

use std::collections::HashMap;

use super::bytecode::NO_LINK;

/// Index of a symbol in the table.
pub type SymId = u32;

/// Reserved id of the implicit "next line" label.
pub const LABEL_NEXTLINE: SymId = 1;
/// First id handed out to user-visible symbols.
pub const LABEL_START: SymId = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    /// Not yet classified in the current compile
    Nop,
    /// Integer constant
    Int,
    /// Character parameter
    Param,
    /// Builtin function
    Func,
    /// User function declared but not yet defined
    UserFunc,
    /// User function with a known entry point
    UserFuncPos,
    /// Label with a known position
    Pos,
    /// Plain variable name
    Name,
}

#[derive(Debug, Clone)]
pub struct Symbol {
    pub name: String,
    pub kind: SymbolKind,
    /// Constant value or parameter number
    pub val: i64,
    /// Resolved position, or `NO_LINK`
    pub label: u32,
    /// Offset of the newest unresolved reference, or `NO_LINK`
    pub backpatch: u32,
    /// Builtin table index for `Func`
    pub func: Option<usize>,
    pub deprecated: bool,
}

impl Symbol {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: SymbolKind::Nop,
            val: 0,
            label: NO_LINK,
            backpatch: NO_LINK,
            func: None,
            deprecated: false,
        }
    }
}

#[derive(Debug)]
pub struct SymbolTable {
    data: Vec<Symbol>,
    index: HashMap<String, SymId>,
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SymbolTable {
    pub fn new() -> Self {
        let mut table = Self {
            data: Vec::with_capacity(1024),
            index: HashMap::with_capacity(1024),
        };
        table.data.push(Symbol::new(""));
        table.data.push(Symbol::new("-"));
        table
    }

    pub fn search(&self, name: &str) -> Option<SymId> {
        self.index.get(&name.to_ascii_lowercase()).copied()
    }

    /// Interns `name`, returning its id.
    pub fn add(&mut self, name: &str) -> SymId {
        let key = name.to_ascii_lowercase();
        if let Some(&id) = self.index.get(&key) {
            return id;
        }
        let id = self.data.len() as SymId;
        self.data.push(Symbol::new(name));
        self.index.insert(key, id);
        id
    }

    pub fn get(&self, id: SymId) -> Option<&Symbol> {
        self.data.get(id as usize)
    }

    pub fn get_mut(&mut self, id: SymId) -> Option<&mut Symbol> {
        self.data.get_mut(id as usize)
    }

    pub fn name(&self, id: SymId) -> &str {
        self.get(id).map(|s| s.name.as_str()).unwrap_or("")
    }

    pub fn kind(&self, id: SymId) -> SymbolKind {
        self.get(id).map(|s| s.kind).unwrap_or(SymbolKind::Nop)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.len() <= LABEL_START as usize
    }

    pub fn ids(&self) -> impl Iterator<Item = SymId> {
        LABEL_START..self.data.len() as SymId
    }

    /// Forgets labels, names and user functions of the previous compile.
    pub fn reset_labels(&mut self) {
        for sym in self.data.iter_mut() {
            match sym.kind {
                SymbolKind::Pos
                | SymbolKind::Name
                | SymbolKind::UserFunc
                | SymbolKind::UserFuncPos
                | SymbolKind::Nop => {
                    sym.kind = SymbolKind::Nop;
                    sym.backpatch = NO_LINK;
                    sym.label = NO_LINK;
                }
                SymbolKind::Int | SymbolKind::Param | SymbolKind::Func => {}
            }
        }
    }

    /// Registers or overwrites a constant.
    pub fn set_constant(&mut self, name: &str, value: i64, is_parameter: bool, deprecated: bool) -> bool {
        let id = self.add(name);
        let Some(sym) = self.get_mut(id) else {
            return false;
        };
        match sym.kind {
            SymbolKind::Nop | SymbolKind::Int | SymbolKind::Param | SymbolKind::Name => {
                sym.kind = if is_parameter { SymbolKind::Param } else { SymbolKind::Int };
                sym.val = value;
                sym.deprecated = deprecated;
                true
            }
            _ => {
                tracing::error!(
                    "[script] set_constant: invalid name for a constant '{}' (already defined as {:?})",
                    name,
                    sym.kind
                );
                false
            }
        }
    }

    pub fn get_constant(&self, name: &str) -> Option<i64> {
        let sym = self.get(self.search(name)?)?;
        (sym.kind == SymbolKind::Int).then_some(sym.val)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserved_ids() {
        let mut table = SymbolTable::new();
        assert_eq!(table.len(), LABEL_START as usize);
        let id = table.add("foo");
        assert_eq!(id, LABEL_START);
    }

    #[test]
    fn test_case_insensitive_interning() {
        let mut table = SymbolTable::new();
        let a = table.add("MyVar");
        let b = table.add("myvar");
        let c = table.add("MYVAR");
        assert_eq!(a, b);
        assert_eq!(b, c);
        assert_eq!(table.name(a), "MyVar");
        assert_eq!(table.search("myVAR"), Some(a));
        assert_eq!(table.search("other"), None);
    }

    #[test]
    fn test_constants() {
        let mut table = SymbolTable::new();
        assert!(table.set_constant("Job_Novice", 0, false, false));
        assert!(table.set_constant("bStr", 13, false, true));
        assert_eq!(table.get_constant("job_novice"), Some(0));
        assert_eq!(table.get_constant("bStr"), Some(13));
        let id = table.search("bStr").unwrap();
        assert!(table.get(id).unwrap().deprecated);
    }

    #[test]
    fn test_constant_cannot_shadow_builtin() {
        let mut table = SymbolTable::new();
        let id = table.add("mes");
        table.get_mut(id).unwrap().kind = SymbolKind::Func;
        assert!(!table.set_constant("mes", 1, false, false));
        assert_eq!(table.kind(id), SymbolKind::Func);
    }

    #[test]
    fn test_reset_labels_keeps_builtins_and_constants() {
        let mut table = SymbolTable::new();
        let func = table.add("mes");
        table.get_mut(func).unwrap().kind = SymbolKind::Func;
        table.set_constant("MAX", 10, false, false);
        let label = table.add("L_Start");
        {
            let sym = table.get_mut(label).unwrap();
            sym.kind = SymbolKind::Pos;
            sym.label = 42;
        }

        table.reset_labels();

        assert_eq!(table.kind(func), SymbolKind::Func);
        assert_eq!(table.get_constant("MAX"), Some(10));
        assert_eq!(table.kind(label), SymbolKind::Nop);
        assert_eq!(table.get(label).unwrap().label, NO_LINK);
    }
}
