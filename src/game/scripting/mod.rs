//! Script engine: compiler, virtual machine and builtin library.
//!
//! Scripts are compiled by [`parser`] into bytecode ([`bytecode`]) and run by
//! the stack machine in [`vm`]. A [`ScriptEngine`] owns every piece of global
//! state the two need: the symbol table, the builtin table, user functions,
//! suspended executions and the timers that wake them.

pub mod builtin;
pub mod bytecode;
pub mod code;
pub mod error;
pub mod lexer;
pub mod parser;
pub mod state;
pub mod storage;
pub mod symbol;
pub mod vars;
pub mod vm;

use std::collections::HashMap;
use std::rc::Rc;

use anyhow::{Context, Result};

use crate::config::ScriptConfig;
use crate::core::{gettick, Tick};
use crate::database::const_db::ConstDb;
use crate::game::pc::Param;
use crate::game::World;
use crate::timer::{TimerId, TimerQueue};

use builtin::{BuiltinDef, BUILTINS};
use code::{ScriptCode, ScriptLabel};
use error::CompileError;
use state::{ScriptState, StateId};
use symbol::{SymId, SymbolKind, SymbolTable};

pub use parser::ParseOptions;

// ---------------------------------------------------------------------------
// Script database
// ---------------------------------------------------------------------------

/// Symbol ids of the builtins the compiler emits on its own.
#[derive(Debug, Default, Clone, Copy)]
pub struct CoreRefs {
    pub set: SymId,
    pub callsub: SymId,
    pub callfunc: SymId,
    pub getelementofarray: SymId,
    pub jump_zero: SymId,
    pub goto: SymId,
    pub return_: SymId,
}

/// Everything the compiler reads and writes.
#[derive(Debug)]
pub struct ScriptDb {
    pub symbols: SymbolTable,
    pub builtins: Vec<BuiltinDef>,
    pub refs: CoreRefs,
    /// Global user functions by exact name
    pub userfunc_db: HashMap<String, Rc<ScriptCode>>,
    /// Labels of the last compile that asked for them
    pub label_db: Vec<ScriptLabel>,
}

impl Default for ScriptDb {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptDb {
    pub fn new() -> Self {
        let mut db = Self {
            symbols: SymbolTable::new(),
            builtins: Vec::with_capacity(BUILTINS.len()),
            refs: CoreRefs::default(),
            userfunc_db: HashMap::new(),
            label_db: Vec::new(),
        };
        for def in BUILTINS {
            db.add_builtin(*def);
        }
        db.set_constant("true", 1, false, false);
        db.set_constant("false", 0, false, false);
        for (i, name) in builtin::misc::DATE_TYPES.iter().enumerate() {
            db.set_constant(name, i as i64 + 1, false, false);
        }
        for p in Param::ALL {
            db.set_constant(p.name(), p as i64, true, false);
        }
        db
    }

    /// Registers a builtin, replacing any earlier one of the same name.
    pub fn add_builtin(&mut self, def: BuiltinDef) -> SymId {
        let id = self.symbols.add(def.name);
        let slot = match self.symbols.get(id).and_then(|s| s.func) {
            Some(i) if i < self.builtins.len() => {
                self.builtins[i] = def;
                i
            }
            _ => {
                self.builtins.push(def);
                self.builtins.len() - 1
            }
        };
        if let Some(sym) = self.symbols.get_mut(id) {
            sym.kind = SymbolKind::Func;
            sym.func = Some(slot);
            sym.deprecated = def.deprecated.is_some();
        }
        match def.name {
            "set" => self.refs.set = id,
            "callsub" => self.refs.callsub = id,
            "callfunc" => self.refs.callfunc = id,
            "getelementofarray" => self.refs.getelementofarray = id,
            "jump_zero" => self.refs.jump_zero = id,
            "goto" => self.refs.goto = id,
            "return" => self.refs.return_ = id,
            _ => {}
        }
        id
    }

    pub fn set_constant(&mut self, name: &str, value: i64, is_parameter: bool, deprecated: bool) -> bool {
        self.symbols.set_constant(name, value, is_parameter, deprecated)
    }

    /// Builtin bound to symbol `id`, if any.
    pub fn builtin(&self, id: SymId) -> Option<&BuiltinDef> {
        let sym = self.symbols.get(id)?;
        if sym.kind != SymbolKind::Func {
            return None;
        }
        sym.func.and_then(|i| self.builtins.get(i))
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerEvent {
    /// A sleeping script is due
    ScriptSleep { state: StateId },
    /// A queued event is due for a character
    PcEvent { account_id: u32, event: String },
}

#[derive(Debug)]
pub struct ScriptEngine {
    pub config: ScriptConfig,
    pub db: ScriptDb,
    pub world: World,
    /// Suspended executions. A running state is owned by the call stack.
    pub(crate) states: HashMap<StateId, ScriptState>,
    /// Sleeping states by owner object id
    pub(crate) sleep_db: HashMap<u32, Vec<StateId>>,
    pub(crate) timers: TimerQueue<TimerEvent>,
    next_state_id: u32,
    pub(crate) running: usize,
    pub(crate) tick: Tick,
}

impl Default for ScriptEngine {
    fn default() -> Self {
        Self::new(ScriptConfig::default())
    }
}

impl ScriptEngine {
    pub fn new(config: ScriptConfig) -> Self {
        Self {
            config,
            db: ScriptDb::new(),
            world: World::new(),
            states: HashMap::new(),
            sleep_db: HashMap::new(),
            timers: TimerQueue::new(),
            next_state_id: 1,
            running: 0,
            tick: 0,
        }
    }

    /// Builds an engine from its configuration: loads the constant database
    /// and the NPC files, then runs the init event.
    pub fn from_config(config: ScriptConfig) -> Result<Self> {
        config.validate()?;
        let mut engine = Self::new(config);
        engine.tick = gettick();
        if let Some(path) = engine.config.constants_file.clone() {
            let constants = ConstDb::from_file(&path)
                .with_context(|| format!("Failed to load constants: {path}"))?;
            engine.load_constants(&constants);
        }
        engine.load_npc_files()?;
        Ok(engine)
    }

    pub fn load_constants(&mut self, constants: &ConstDb) -> usize {
        let mut count = 0;
        for entry in constants.entries() {
            if self.db.set_constant(&entry.name, entry.value, entry.parameter, entry.deprecated) {
                count += 1;
            }
        }
        tracing::info!("[script] constants loaded count={count}");
        count
    }

    /// Compiles a script.
    ///
    /// `Ok(None)` is an empty script compiled with
    /// [`ParseOptions::RETURN_EMPTY_SCRIPT`] unset.
    pub fn parse_script(
        &mut self,
        src: &str,
        file: &str,
        line: usize,
        options: ParseOptions,
    ) -> Result<Option<Rc<ScriptCode>>, CompileError> {
        parser::parse_script(&mut self.db, &self.config, src, file, line, options)
    }

    /// Registers a compiled script as a global user function for `callfunc`.
    pub fn add_userfunc(&mut self, name: &str, code: Rc<ScriptCode>) {
        if self.db.userfunc_db.insert(name.to_string(), code).is_some() {
            tracing::warn!("[script] duplicate function [{name}], replacing");
        }
    }

    /// Starts a new execution of `code` at `pos`.
    pub fn run_script(&mut self, code: &Rc<ScriptCode>, pos: usize, rid: u32, oid: u32) {
        let mut st = self.alloc_state(Rc::clone(code), pos, rid, oid);
        if oid != 0 {
            if let Some(nd) = self.world.npc(oid) {
                st.instance_id = nd.instance_id;
            }
        }
        self.run_script_main(st);
    }

    pub(crate) fn alloc_state(&mut self, code: Rc<ScriptCode>, pos: usize, rid: u32, oid: u32) -> ScriptState {
        let id = loop {
            let id = StateId(self.next_state_id);
            self.next_state_id = self.next_state_id.wrapping_add(1).max(1);
            if !self.states.contains_key(&id) {
                break id;
            }
        };
        ScriptState::new(id, code, pos, rid, oid)
    }

    /// Live executions, suspended or running.
    pub fn state_count(&self) -> usize {
        self.states.len() + self.running
    }

    pub fn state(&self, id: StateId) -> Option<&ScriptState> {
        self.states.get(&id)
    }

    pub fn tick(&self) -> Tick {
        self.tick
    }

    pub fn pending_timers(&self) -> usize {
        self.timers.len()
    }

    /// Deadline of the next timer, if any.
    pub fn next_timer(&self) -> Option<Tick> {
        self.timers.next_tick()
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    /// Fires every timer due at `tick`. Returns how many fired.
    pub fn do_timers(&mut self, tick: Tick) -> usize {
        self.tick = self.tick.max(tick);
        let mut fired = 0;
        while let Some((tid, event)) = self.timers.pop_expired(tick) {
            fired += 1;
            match event {
                TimerEvent::ScriptSleep { state } => self.run_script_timer(tid, state),
                TimerEvent::PcEvent { account_id, event } => self.pc_eventtimer(tid, account_id, &event),
            }
        }
        fired
    }

    /// Wakes a sleeping state whose timer `tid` expired.
    pub(crate) fn run_script_timer(&mut self, tid: TimerId, id: StateId) {
        let Some(mut st) = self.states.remove(&id) else {
            return;
        };
        if st.sleep.timer != Some(tid) {
            self.states.insert(id, st);
            return;
        }
        st.sleep.timer = None;

        if st.sleep.charid != 0 && st.rid != 0 {
            match self.world.pc(st.rid) {
                Some(sd) if sd.char_id == st.sleep.charid => {}
                Some(_) => {
                    tracing::warn!("[script] run_script_timer: character mismatch, terminating script");
                    self.reportsrc(&st);
                    st.rid = 0;
                    st.state = state::RunState::End;
                }
                None => {
                    st.rid = 0;
                    st.state = state::RunState::End;
                }
            }
        }
        self.sleep_db_remove(st.oid, st.id);
        if st.state != state::RunState::RerunLine {
            st.sleep.tick = 0;
        }
        self.run_script_main(st);
    }

    pub(crate) fn sleep_db_remove(&mut self, oid: u32, id: StateId) {
        if let Some(list) = self.sleep_db.get_mut(&oid) {
            list.retain(|s| *s != id);
            if list.is_empty() {
                self.sleep_db.remove(&oid);
            }
        }
    }

    /// Wakes every sleeping state owned by `oid` right away.
    pub fn awake(&mut self, oid: u32) -> usize {
        let mut ids: Vec<StateId> = self
            .states
            .values()
            .filter(|st| st.oid == oid && st.sleep.timer.is_some())
            .map(|st| st.id)
            .collect();
        ids.sort();
        let mut woken = 0;
        for id in ids {
            let Some(tid) = self.states.get(&id).and_then(|st| st.sleep.timer) else {
                continue;
            };
            self.timers.delete_timer(tid);
            self.run_script_timer(tid, id);
            woken += 1;
        }
        woken
    }

    /// Terminates every sleeping state owned by `oid`.
    pub fn stop_sleeptimers(&mut self, oid: u32) -> usize {
        let ids = self.sleep_db.remove(&oid).unwrap_or_default();
        let mut stopped = 0;
        for id in ids {
            if let Some(st) = self.states.remove(&id) {
                self.detach_state(&st, false);
                self.free_state(st);
                stopped += 1;
            }
        }
        stopped
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Drops user functions, every live execution and pending timers, and
    /// clears temporary server variables.
    pub fn script_reload(&mut self) {
        self.db.userfunc_db.clear();
        self.db.label_db.clear();
        let ids: Vec<StateId> = self.states.keys().copied().collect();
        for id in ids {
            if let Some(st) = self.states.remove(&id) {
                self.detach_state(&st, false);
                self.free_state(st);
            }
        }
        self.sleep_db.clear();
        self.timers.clear();
        let symbols = &self.db.symbols;
        self.world.mapreg.retain_ids(|id| !symbols.name(id).starts_with("$@"));
    }

    /// Unloads every NPC and reloads the configured NPC files.
    pub fn reload(&mut self) -> Result<()> {
        self.script_reload();
        for id in self.world.npc_ids() {
            self.unload_npc(id);
        }
        self.world.clear_npcs();
        self.load_npc_files()
    }

    pub fn shutdown(&mut self) {
        self.script_reload();
        for id in self.world.pc_ids() {
            if let Some(sd) = self.world.pc_mut(id) {
                sd.st = None;
                sd.st_backup.clear();
                sd.npc_id = 0;
                sd.eventqueue.clear();
                sd.eventtimer = None;
            }
        }
        self.world.clear_npcs();
        tracing::info!("[script] engine shut down");
    }

    /// Logs where the running script came from.
    pub(crate) fn reportsrc(&self, st: &ScriptState) {
        if st.oid == 0 {
            return;
        }
        match self.world.npc(st.oid) {
            Some(nd) if !nd.map.is_empty() => {
                tracing::debug!("[script] Source (NPC): {} at {} ({},{})", nd.name, nd.map, nd.x, nd.y);
            }
            Some(nd) => tracing::debug!("[script] Source (NPC): {} (invisible/not on a map)", nd.name),
            None => tracing::debug!("[script] Source: object {} ({})", st.oid, st.script.file),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::pc::Character;

    #[test]
    fn test_core_refs_registered() {
        let db = ScriptDb::new();
        for id in [
            db.refs.set,
            db.refs.callsub,
            db.refs.callfunc,
            db.refs.getelementofarray,
            db.refs.jump_zero,
            db.refs.goto,
            db.refs.return_,
        ] {
            assert!(db.builtin(id).is_some());
        }
        assert_eq!(db.symbols.name(db.refs.return_), "return");
    }

    #[test]
    fn test_default_constants() {
        let db = ScriptDb::new();
        assert_eq!(db.symbols.get_constant("true"), Some(1));
        assert_eq!(db.symbols.get_constant("FALSE"), Some(0));
        assert_eq!(db.symbols.get_constant("DT_YEAR"), Some(7));
        let zeny = db.symbols.search("Zeny").unwrap();
        assert_eq!(db.symbols.kind(zeny), SymbolKind::Param);
    }

    #[test]
    fn test_constants_cannot_shadow_builtins() {
        let mut db = ScriptDb::new();
        assert!(!db.set_constant("mes", 3, false, false));
        assert!(db.builtin(db.symbols.search("mes").unwrap()).is_some());
    }

    #[test]
    fn test_load_constants() {
        let yaml = r#"
Header:
  Type: CONSTANT_DB
  Version: 1
Body:
  - Name: Job_Novice
    Value: 0
  - Name: MAX_LEVEL
    Value: 99
"#;
        let mut engine = ScriptEngine::default();
        let constants = ConstDb::from_str(yaml).unwrap();
        assert_eq!(engine.load_constants(&constants), 2);
        assert_eq!(engine.db.symbols.get_constant("max_level"), Some(99));
    }

    #[test]
    fn test_init_sleep_counts_from_startup() {
        let path = std::env::temp_dir().join(format!("npcscript_init_{}.txt", std::process::id()));
        std::fs::write(&path, "-\tscript\tWaiter\t-1,{\nOnInit:\n\tsleep 1000;\n\tend;\n}\n").unwrap();
        gettick();
        std::thread::sleep(std::time::Duration::from_millis(20));

        let mut config = ScriptConfig::default();
        config.npc_files.push(path.display().to_string());
        let engine = ScriptEngine::from_config(config).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert!(engine.tick() >= 20);
        assert_eq!(engine.next_timer(), Some(engine.tick() + 1000));
    }

    #[test]
    fn test_add_builtin_replaces() {
        fn custom(_: &mut ScriptEngine, st: &mut ScriptState) -> Result<(), error::RuntimeError> {
            st.push_int(42);
            Ok(())
        }
        let mut engine = ScriptEngine::default();
        let before = engine.db.builtins.len();
        engine.db.add_builtin(BuiltinDef::new("answer", custom, ""));
        engine.db.add_builtin(BuiltinDef::new("answer", custom, "").deprecated("none"));
        assert_eq!(engine.db.builtins.len(), before + 1);

        let code = engine
            .parse_script("{ $answer = answer(); end; }", "t", 1, ParseOptions::NONE)
            .unwrap()
            .unwrap();
        engine.run_script(&code, 0, 0, 0);
        let id = engine.db.symbols.search("$answer").unwrap();
        assert_eq!(engine.world.mapreg.get_num(storage::reference_uid(id, 0)), 42);
    }

    #[test]
    fn test_script_reload_drops_states() {
        let mut engine = ScriptEngine::default();
        engine.world.add_pc(Character::new(2000000, 150000, "Tester"));
        let code = engine
            .parse_script("{ $@tmp = 1; $keep = 1; mes \"hi\"; next; end; }", "t", 1, ParseOptions::NONE)
            .unwrap()
            .unwrap();
        engine.run_script(&code, 0, 2000000, 0);
        assert_eq!(engine.state_count(), 1);

        engine.script_reload();
        assert_eq!(engine.state_count(), 0);
        assert_eq!(code.instances(), 0);
        assert!(engine.world.pc(2000000).unwrap().st.is_none());
        let keep = engine.db.symbols.search("$keep").unwrap();
        let tmp = engine.db.symbols.search("$@tmp").unwrap();
        assert_eq!(engine.world.mapreg.get_num(storage::reference_uid(keep, 0)), 1);
        assert_eq!(engine.world.mapreg.get_num(storage::reference_uid(tmp, 0)), 0);
    }
}
