//! NPC game logic: script NPC definitions, their exported events and the
//! client side of a running dialog.
//!
//! NPC files are tab separated, one definition per line:
//!
//! ```text
//! -	script	Name	-1,{ ... }
//! prontera,150,150,4	script	Guard#1	105,{ ... }
//! function	script	Name	{ ... }
//! ```
//!
//! A script body may span lines; it runs from the first `{` to its matching
//! `}`. Labels starting with `On` become events named `Name::OnLabel`.

use std::fs;
use std::path::Path;
use std::rc::Rc;

use anyhow::{Context, Result};

use crate::game::pc::Character;
use crate::game::scripting::code::{ScriptCode, ScriptLabel};
use crate::game::scripting::state::{RunState, StateId};
use crate::game::scripting::{ParseOptions, ScriptEngine, TimerEvent};
use crate::timer::TimerId;

pub const NPC_START_NUM: u32 = 3221225472;

/// Longest NPC unique name or event label.
pub const NAME_LENGTH: usize = 24;
/// Events a busy character can have waiting.
pub const MAX_EVENTQUEUE: usize = 2;
/// Delay before a queued event starts once the character is free.
pub const EVENT_DEQUEUE_DELAY: u64 = 100;
/// Longest text accepted from an input box, in bytes.
pub const CHATBOX_SIZE: usize = 70;

#[derive(Debug)]
pub struct NpcData {
    pub id: u32,
    /// Display name
    pub name: String,
    /// Unique name, used for events and lookups
    pub exname: String,
    /// Empty for floating NPCs
    pub map: String,
    pub x: i16,
    pub y: i16,
    pub dir: u8,
    pub sprite: String,
    pub script: Rc<ScriptCode>,
    pub labels: Vec<ScriptLabel>,
    pub instance_id: i32,
    /// Source file, for diagnostics
    pub file: String,
}

impl NpcData {
    pub fn new(id: u32, name: &str, exname: &str, script: Rc<ScriptCode>) -> Self {
        Self {
            id,
            name: name.to_string(),
            exname: exname.to_string(),
            map: String::new(),
            x: 0,
            y: 0,
            dir: 0,
            sprite: "-1".to_string(),
            script,
            labels: Vec::new(),
            instance_id: 0,
            file: String::new(),
        }
    }
}

/// An exported label: which NPC, and where in its script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NpcEvent {
    pub npc_id: u32,
    pub pos: usize,
}

// ============================================
// Source scanning
// ============================================

/// End (one past the closing brace) of the block opening at `start`.
/// Braces inside strings and comments do not count.
fn skip_script_body(src: &[u8], start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut p = start;
    while p < src.len() {
        match src[p] {
            b'"' => {
                p += 1;
                while p < src.len() && src[p] != b'"' {
                    if src[p] == b'\\' {
                        p += 1;
                    }
                    p += 1;
                }
                if p >= src.len() {
                    return None;
                }
            }
            b'/' if src.get(p + 1) == Some(&b'/') => {
                while p < src.len() && src[p] != b'\n' {
                    p += 1;
                }
                continue;
            }
            b'/' if src.get(p + 1) == Some(&b'*') => {
                p += 2;
                while p + 1 < src.len() && !(src[p] == b'*' && src[p + 1] == b'/') {
                    p += 1;
                }
                if p + 1 >= src.len() {
                    return None;
                }
                p += 1;
            }
            b'{' => depth += 1,
            b'}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(p + 1);
                }
            }
            _ => {}
        }
        p += 1;
    }
    None
}

/// Splits `Display::Unique`; otherwise the unique name is the whole name
/// and the display name drops any `#suffix`.
fn parse_npc_name(w3: &str) -> (String, String) {
    match w3.split_once("::") {
        Some((display, unique)) => (display.to_string(), unique.to_string()),
        None => {
            let display = w3.split('#').next().unwrap_or(w3);
            (display.to_string(), w3.to_string())
        }
    }
}

/// `map,x,y,dir`
fn parse_position(w1: &str) -> Option<(String, i16, i16, u8)> {
    let mut it = w1.split(',').map(str::trim);
    let map = it.next()?.to_string();
    let x = it.next()?.parse().ok()?;
    let y = it.next()?.parse().ok()?;
    let dir = it.next().map_or(Some(0), |d| d.parse().ok())?;
    Some((map, x, y, dir))
}

fn truncate_to(s: &mut String, max: usize) {
    if s.len() > max {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        s.truncate(end);
    }
}

impl ScriptEngine {
    // ============================================
    // Loading
    // ============================================

    /// Loads every configured NPC file, then runs the init event.
    pub fn load_npc_files(&mut self) -> Result<()> {
        let mut total = 0;
        for path in self.config.npc_files.clone() {
            total += self.load_npc_file(&path)?;
        }
        let init = self.config.init_event_name.clone();
        let count = self.npc_event_doall(&init);
        tracing::info!("[npc] Done loading '{total}' definitions, '{init}' executed on '{count}' NPCs");
        Ok(())
    }

    pub fn load_npc_file<P: AsRef<Path>>(&mut self, path: P) -> Result<usize> {
        let path = path.as_ref();
        let src = fs::read_to_string(path)
            .with_context(|| format!("Failed to read NPC file: {}", path.display()))?;
        Ok(self.load_npc_source(&src, &path.display().to_string()))
    }

    /// Parses NPC definitions from `src`. Returns how many were added.
    ///
    /// Broken definitions are logged and skipped.
    pub fn load_npc_source(&mut self, src: &str, file: &str) -> usize {
        let bytes = src.as_bytes();
        let mut loaded = 0;
        let mut p = 0;
        let mut lineno = 1;

        while p < bytes.len() {
            let line_end = src[p..].find('\n').map_or(bytes.len(), |i| p + i);
            let line = src[p..line_end].trim_end_matches('\r');
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with("//") {
                p = line_end + 1;
                lineno += 1;
                continue;
            }

            let cols: Vec<&str> = line.splitn(4, '\t').collect();
            if cols.len() < 3 || cols[1].trim() != "script" {
                match cols.get(1) {
                    Some(w2) if cols.len() >= 3 => {
                        tracing::warn!(
                            "[npc] Unknown definition '{}' in file '{file}', line '{lineno}'. Skipping line...",
                            w2.trim()
                        );
                    }
                    _ => {
                        tracing::warn!("[npc] Invalid line in file '{file}', line '{lineno}'. Skipping line...");
                    }
                }
                p = line_end + 1;
                lineno += 1;
                continue;
            }
            let (w1, w3) = (cols[0].trim(), cols[2].trim());
            let w4 = cols.get(3).copied().unwrap_or("");

            let Some(brace) = line.find('{') else {
                tracing::error!("[npc] Missing left curly '{{' in file '{file}', line '{lineno}'. Skipping line...");
                p = line_end + 1;
                lineno += 1;
                continue;
            };
            let start = p + brace;
            let Some(end) = skip_script_body(bytes, start) else {
                tracing::error!("[npc] Missing right curly '}}' in file '{file}', line '{lineno}'. Skipping the rest of the file...");
                break;
            };
            let body = &src[start..end];

            let added = if w1 == "function" {
                self.parse_function(w3, body, file, lineno)
            } else {
                let sprite = w4.split(',').next().unwrap_or("").trim();
                self.parse_script_npc(w1, w3, sprite, body, file, lineno)
            };
            if added {
                loaded += 1;
            }

            // the rest of the closing line is ignored
            let next = src[end..].find('\n').map_or(bytes.len(), |i| end + i);
            lineno += src[p..next].matches('\n').count() + 1;
            p = next + 1;
        }
        tracing::debug!("[npc] loaded {loaded} definitions from '{file}'");
        loaded
    }

    fn parse_function(&mut self, name: &str, body: &str, file: &str, line: usize) -> bool {
        match self.parse_script(body, file, line, ParseOptions::NONE) {
            Ok(Some(code)) => {
                self.add_userfunc(name, code);
                true
            }
            Ok(None) => {
                tracing::warn!("[npc] parse_function: empty function '{name}' in file '{file}', line '{line}'");
                false
            }
            Err(e) => {
                tracing::error!("[npc] {e}");
                false
            }
        }
    }

    fn parse_script_npc(&mut self, w1: &str, w3: &str, sprite: &str, body: &str, file: &str, line: usize) -> bool {
        let (map, x, y, dir) = if w1 == "-" {
            (String::new(), 0, 0, 0)
        } else {
            match parse_position(w1) {
                Some(pos) => pos,
                None => {
                    tracing::warn!("[npc] Invalid position '{w1}' in file '{file}', line '{line}'. Skipping line...");
                    return false;
                }
            }
        };

        let code = match self.parse_script(body, file, line, ParseOptions::USE_LABEL_DB | ParseOptions::RETURN_EMPTY_SCRIPT) {
            Ok(Some(code)) => code,
            Ok(None) => return false,
            Err(e) => {
                tracing::error!("[npc] {e}");
                return false;
            }
        };
        let labels = std::mem::take(&mut self.db.label_db);
        if let Some(label) = labels.iter().find(|l| l.name.len() >= NAME_LENGTH) {
            tracing::error!(
                "[npc] parse_script: label name longer than {} chars! '{}' in file '{file}', line '{line}'",
                NAME_LENGTH - 1,
                label.name
            );
            return false;
        }

        let (name, mut exname) = parse_npc_name(w3);
        if exname.len() >= NAME_LENGTH {
            tracing::warn!("[npc] npc_parsename: Unique name '{exname}' is too long in file '{file}', line '{line}'. Truncating...");
            truncate_to(&mut exname, NAME_LENGTH - 1);
        }
        if self.world.name2npc(&exname).is_some() {
            let renamed = (1..)
                .map(|i| format!("{i}_{map}_{x}_{y}"))
                .find(|n| self.world.name2npc(n).is_none())
                .unwrap_or_default();
            tracing::warn!(
                "[npc] npc_parsename: Duplicate unique name in file '{file}', line '{line}'. Renaming '{exname}' to '{renamed}'."
            );
            exname = renamed;
        }

        let id = self.world.next_npc_id();
        let mut nd = NpcData::new(id, &name, &exname, code);
        nd.map = map;
        nd.x = x;
        nd.y = y;
        nd.dir = dir;
        nd.sprite = sprite.to_string();
        nd.file = file.to_string();
        nd.labels = labels;

        let events: Vec<(String, NpcEvent)> = nd
            .labels
            .iter()
            .filter(|l| l.name.starts_with("On"))
            .map(|l| (format!("{exname}::{}", l.name), NpcEvent { npc_id: id, pos: l.pos }))
            .collect();
        if self.world.add_npc(nd).is_err() {
            tracing::error!("[npc] could not register NPC '{exname}'");
            return false;
        }
        for (name, ev) in events {
            if !self.world.add_event(name.clone(), ev) {
                tracing::warn!("[npc] npc_parse_script: duplicate event {name} in file '{file}', line '{line}'");
            }
        }
        true
    }

    /// Stops an NPC's scripts and removes it.
    pub fn unload_npc(&mut self, id: u32) -> bool {
        self.stop_sleeptimers(id);
        let ids: Vec<StateId> = self.states.values().filter(|st| st.oid == id).map(|st| st.id).collect();
        for sid in ids {
            if let Some(st) = self.take_state(sid) {
                self.detach_state(&st, false);
                self.free_state(st);
            }
        }
        self.world.remove_npc(id).is_some()
    }

    // ============================================
    // Events
    // ============================================

    /// Runs `NPC::Label` without a character. `::Label` runs it on every NPC.
    pub fn npc_event_do(&mut self, name: &str) -> bool {
        if let Some(label) = name.strip_prefix("::") {
            return self.npc_event_doall(label) > 0;
        }
        let Some(ev) = self.world.event(name) else {
            return false;
        };
        let Some(code) = self.world.npc(ev.npc_id).map(|nd| Rc::clone(&nd.script)) else {
            return false;
        };
        self.run_script(&code, ev.pos, 0, ev.npc_id);
        true
    }

    /// Runs `label` on every NPC exporting it. Returns how many ran.
    pub fn npc_event_doall(&mut self, label: &str) -> usize {
        self.npc_event_doall_id(label, 0)
    }

    /// Like [`npc_event_doall`](Self::npc_event_doall), attached to `rid`.
    pub fn npc_event_doall_id(&mut self, label: &str, rid: u32) -> usize {
        let mut count = 0;
        for ev in self.world.events_with_label(label) {
            let Some(code) = self.world.npc(ev.npc_id).map(|nd| Rc::clone(&nd.script)) else {
                continue;
            };
            self.run_script(&code, ev.pos, rid, ev.npc_id);
            count += 1;
        }
        count
    }

    /// Runs `NPC::Label` for a character, queueing it while the character
    /// is busy with another script.
    pub fn npc_event(&mut self, account_id: u32, name: &str) -> bool {
        let Some(ev) = self.world.event(name) else {
            tracing::error!("[npc] npc_event: event not found [{name}]");
            return false;
        };
        let Some(sd) = self.world.pc_mut(account_id) else {
            return false;
        };
        if sd.npc_id != 0 || sd.st.is_some() {
            if sd.eventqueue.len() < MAX_EVENTQUEUE {
                sd.eventqueue.push_back(name.to_string());
                return true;
            }
            tracing::warn!("[npc] npc_event: player's event queue is full, can't add event '{name}' !");
            return false;
        }
        let Some(code) = self.world.npc(ev.npc_id).map(|nd| Rc::clone(&nd.script)) else {
            return false;
        };
        self.run_script(&code, ev.pos, account_id, ev.npc_id);
        true
    }

    /// Schedules the character's next queued event.
    pub(crate) fn npc_event_dequeue(&mut self, account_id: u32) -> bool {
        let tick = self.tick + EVENT_DEQUEUE_DELAY;
        let Some(sd) = self.world.pc_mut(account_id) else {
            return false;
        };
        if sd.eventtimer.is_some_and(|tid| self.timers.contains(tid)) {
            return false;
        }
        let Some(event) = sd.eventqueue.pop_front() else {
            return false;
        };
        let tid = self.timers.add_timer(tick, TimerEvent::PcEvent { account_id, event });
        sd.eventtimer = Some(tid);
        true
    }

    pub(crate) fn pc_eventtimer(&mut self, tid: TimerId, account_id: u32, event: &str) {
        let Some(sd) = self.world.pc_mut(account_id) else {
            return;
        };
        if sd.eventtimer == Some(tid) {
            sd.eventtimer = None;
        }
        self.npc_event(account_id, event);
    }

    // ============================================
    // Client
    // ============================================

    /// The character talks to an NPC.
    pub fn npc_click(&mut self, account_id: u32, npc_id: u32) -> bool {
        let Some(sd) = self.world.pc(account_id) else {
            return false;
        };
        if sd.npc_id != 0 {
            tracing::error!("[npc] npc_click: npc_id != 0 ({})", sd.npc_id);
            return false;
        }
        let Some(code) = self.world.npc(npc_id).map(|nd| Rc::clone(&nd.script)) else {
            return false;
        };
        self.run_script(&code, 0, account_id, npc_id);
        true
    }

    /// Resumes the character's script after a client reply.
    fn npc_scriptcont(&mut self, account_id: u32, npc_id: u32, closing: bool) -> bool {
        let Some(sd) = self.world.pc(account_id) else {
            return false;
        };
        if sd.npc_id != npc_id {
            tracing::debug!(
                "[npc] npc_scriptcont: {} (sd.npc_id={}) is not {}",
                sd.name,
                sd.npc_id,
                npc_id
            );
            return false;
        }
        let sid = sd.st;
        let Some(mut st) = sid.and_then(|id| self.take_state(id)) else {
            return false;
        };
        if closing && st.state == RunState::Close {
            st.state = RunState::End;
        }
        self.run_script_main(st);
        true
    }

    pub fn npc_next(&mut self, account_id: u32, npc_id: u32) -> bool {
        self.npc_scriptcont(account_id, npc_id, false)
    }

    pub fn npc_close(&mut self, account_id: u32, npc_id: u32) -> bool {
        self.npc_scriptcont(account_id, npc_id, true)
    }

    /// Menu reply: 1-based option, or 255 to cancel.
    pub fn npc_select_menu(&mut self, account_id: u32, npc_id: u32, select: i64) -> bool {
        let Some(sd) = self.world.pc_mut(account_id) else {
            return false;
        };
        if select == 0 || (select > sd.npc_menu && select != 0xff) {
            tracing::warn!(
                "[npc] npc_select_menu: unexpected selection {} (npc_menu={})",
                select,
                sd.npc_menu
            );
            return false;
        }
        sd.npc_menu = select;
        self.npc_scriptcont(account_id, npc_id, false)
    }

    pub fn npc_input_amount(&mut self, account_id: u32, npc_id: u32, amount: i64) -> bool {
        let Some(sd) = self.world.pc_mut(account_id) else {
            return false;
        };
        sd.npc_amount = amount;
        self.npc_scriptcont(account_id, npc_id, false)
    }

    pub fn npc_input_str(&mut self, account_id: u32, npc_id: u32, text: &str) -> bool {
        let Some(sd) = self.world.pc_mut(account_id) else {
            return false;
        };
        sd.npc_str = text.to_string();
        truncate_to(&mut sd.npc_str, CHATBOX_SIZE - 1);
        self.npc_scriptcont(account_id, npc_id, false)
    }

    // ============================================
    // Character lifecycle
    // ============================================

    pub fn pc_login(&mut self, sd: Character) {
        tracing::debug!("[npc] character '{}' ({}) logged in", sd.name, sd.account_id);
        self.world.add_pc(sd);
    }

    /// Frees the character's attached and interrupted scripts.
    pub fn pc_logout(&mut self, account_id: u32) -> Option<Character> {
        let sd = self.world.pc_mut(account_id)?;
        let mut ids: Vec<StateId> = sd.st_backup.drain(..).map(|(id, _)| id).collect();
        ids.extend(sd.st.take());
        sd.npc_id = 0;
        sd.eventqueue.clear();
        if let Some(tid) = sd.eventtimer.take() {
            self.timers.delete_timer(tid);
        }
        for id in ids {
            if let Some(st) = self.take_state(id) {
                self.free_state(st);
            }
        }
        self.world.remove_pc(account_id)
    }
}
