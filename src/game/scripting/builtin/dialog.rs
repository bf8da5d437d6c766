//! NPC dialog: message window, menus and input boxes.
//!
//! Commands waiting on the client set `RerunLine` on the first call and
//! finish on the second, after the client reply has been stored on the
//! character (`npc_menu`, `npc_amount`, `npc_str`).

use crate::game::pc::ClientMessage;
use crate::game::scripting::error::RuntimeError;
use crate::game::scripting::lexer::is_string_variable;
use crate::game::scripting::state::{RunState, ScriptState};
use crate::game::scripting::storage::{reference_uid, uid_id, RegValue};
use crate::game::scripting::vars::VarCtx;
use crate::game::scripting::ScriptEngine;

use super::{label_arg, ref_arg, rid2sd};

/// Menu selection reply meaning "cancel".
pub const MENU_CANCEL: i64 = 0xff;

fn send(engine: &mut ScriptEngine, rid: u32, msg: ClientMessage) {
    if let Some(sd) = engine.world.pc_mut(rid) {
        sd.outbox.push(msg);
    }
}

/// Counts the options in a `:`-separated menu string.
///
/// `total` advances once per option slot, empty ones included, so it ends
/// up as the 1-based `@menu` value. Counting stops after `max_count`
/// options when non-zero.
pub fn menu_countoptions(s: &str, mut max_count: i64, total: &mut i64) -> i64 {
    let b = s.as_bytes();
    let mut i = 0;
    let mut count = 0;
    *total += 1;
    while b.get(i) == Some(&b':') {
        i += 1;
        *total += 1;
    }
    while i < b.len() {
        count += 1;
        max_count -= 1;
        if max_count == 0 {
            break;
        }
        while i < b.len() && b[i] != b':' {
            i += 1;
        }
        while b.get(i) == Some(&b':') {
            i += 1;
            *total += 1;
        }
    }
    count
}

fn set_menu_var(engine: &mut ScriptEngine, st: &ScriptState, value: i64) -> Result<(), RuntimeError> {
    let uid = reference_uid(engine.runtime_name("@menu"), 0);
    engine.set_reg(&VarCtx::of(st), uid, RegValue::Num(value), None)
}

pub fn mes(engine: &mut ScriptEngine, st: &mut ScriptState) -> Result<(), RuntimeError> {
    let rid = rid2sd(engine, st)?;
    let mut i = 2;
    while st.has_data(i) {
        let text = engine.arg_str(st, i)?;
        send(engine, rid, ClientMessage::Mes { npc_id: st.oid, text });
        i += 1;
    }
    st.mes_active = true;
    Ok(())
}

pub fn next(engine: &mut ScriptEngine, st: &mut ScriptState) -> Result<(), RuntimeError> {
    let rid = rid2sd(engine, st)?;
    st.state = RunState::Stop;
    send(engine, rid, ClientMessage::Next { npc_id: st.oid });
    Ok(())
}

/// Shows the close button; the script ends once the client closes.
pub fn close(engine: &mut ScriptEngine, st: &mut ScriptState) -> Result<(), RuntimeError> {
    let rid = rid2sd(engine, st)?;
    if st.mes_active {
        st.state = RunState::Close;
        st.mes_active = false;
    } else {
        st.state = RunState::End;
        tracing::warn!("[script] buildin_close: Incorrect use of 'close' command!");
        engine.reportsrc(st);
    }
    send(engine, rid, ClientMessage::Close { npc_id: st.oid });
    Ok(())
}

/// Shows the close button and keeps running after the client closes.
pub fn close2(engine: &mut ScriptEngine, st: &mut ScriptState) -> Result<(), RuntimeError> {
    let rid = rid2sd(engine, st)?;
    st.state = RunState::Stop;
    st.mes_active = false;
    send(engine, rid, ClientMessage::Close { npc_id: st.oid });
    Ok(())
}

pub fn clear(engine: &mut ScriptEngine, st: &mut ScriptState) -> Result<(), RuntimeError> {
    let rid = rid2sd(engine, st)?;
    send(engine, rid, ClientMessage::Clear { npc_id: st.oid });
    Ok(())
}

/// Opens the menu built from `texts` on the first call.
fn open_menu(engine: &mut ScriptEngine, st: &mut ScriptState, rid: u32, texts: &[String], func: &str) {
    let mut buf = String::new();
    let mut npc_menu = 0;
    for text in texts {
        if text.is_empty() {
            continue;
        }
        if npc_menu > 0 {
            buf.push(':');
        }
        buf.push_str(text);
        npc_menu += menu_countoptions(text, 0, &mut 0);
    }
    st.state = RunState::RerunLine;
    if let Some(sd) = engine.world.pc_mut(rid) {
        sd.npc_menu = npc_menu;
        sd.menu_or_input = true;
        sd.outbox.push(ClientMessage::Menu { npc_id: st.oid, options: buf });
    }
    if npc_menu >= MENU_CANCEL {
        tracing::warn!(
            "[script] buildin_{func}: Too many options specified (current={npc_menu} max={})",
            MENU_CANCEL - 1
        );
        engine.reportsrc(st);
    }
}

/// Finds the 1-based option the client picked. Returns the index into
/// `texts` holding it and the `@menu` value.
fn selected_option(texts: &[String], mut npc_menu: i64) -> Option<(usize, i64)> {
    let mut menu = 0;
    for (i, text) in texts.iter().enumerate() {
        npc_menu -= menu_countoptions(text, npc_menu, &mut menu);
        if npc_menu <= 0 {
            return Some((i, menu));
        }
    }
    None
}

/// Takes the pending menu reply, clearing the character's input flag.
fn take_menu_reply(engine: &mut ScriptEngine, rid: u32) -> i64 {
    engine
        .world
        .pc_mut(rid)
        .map(|sd| {
            sd.menu_or_input = false;
            sd.npc_menu
        })
        .unwrap_or(MENU_CANCEL)
}

fn menu_waiting(engine: &ScriptEngine, rid: u32) -> bool {
    engine.world.pc(rid).is_some_and(|sd| !sd.menu_or_input)
}

/// `menu "<option>", <label>{, "<option>", <label>...}`
pub fn menu(engine: &mut ScriptEngine, st: &mut ScriptState) -> Result<(), RuntimeError> {
    let rid = rid2sd(engine, st)?;
    if st.lastdata() % 2 == 0 {
        return Err(RuntimeError::builtin("menu", "illegal number of arguments"));
    }

    let mut texts = Vec::new();
    let mut labels = Vec::new();
    let mut i = 2;
    while i < st.lastdata() {
        texts.push(engine.arg_str(st, i)?);
        let idx = st.start + i + 1;
        engine.get_val(st, idx)?;
        labels.push(label_arg(st, i + 1, "menu").map_err(|_| {
            RuntimeError::builtin("menu", format!("argument #{} (from 1) is not a label or label not found", i))
        })?);
        i += 2;
    }

    if menu_waiting(engine, rid) {
        open_menu(engine, st, rid, &texts, "menu");
        return Ok(());
    }

    let npc_menu = take_menu_reply(engine, rid);
    if npc_menu == MENU_CANCEL {
        st.state = RunState::End;
        return Ok(());
    }
    if npc_menu <= 0 {
        st.state = RunState::End;
        return Err(RuntimeError::builtin("menu", format!("unexpected selection ({npc_menu})")));
    }
    let (idx, menu) = selected_option(&texts, npc_menu)
        .ok_or_else(|| RuntimeError::builtin("menu", format!("selection is out of range ({npc_menu})")))?;
    set_menu_var(engine, st, menu)?;
    st.pos = labels[idx];
    st.state = RunState::Goto;
    Ok(())
}

fn menu_texts(engine: &mut ScriptEngine, st: &mut ScriptState) -> Result<Vec<String>, RuntimeError> {
    let mut texts = Vec::new();
    let mut i = 2;
    while st.has_data(i) {
        texts.push(engine.arg_str(st, i)?);
        i += 1;
    }
    Ok(texts)
}

/// `select("<option>"{, "<option>"...})`: returns the picked option.
pub fn select(engine: &mut ScriptEngine, st: &mut ScriptState) -> Result<(), RuntimeError> {
    let rid = rid2sd(engine, st)?;
    let texts = menu_texts(engine, st)?;

    if menu_waiting(engine, rid) {
        open_menu(engine, st, rid, &texts, "select");
        return Ok(());
    }

    let npc_menu = take_menu_reply(engine, rid);
    if npc_menu == MENU_CANCEL {
        st.state = RunState::End;
        return Ok(());
    }
    let menu = selected_option(&texts, npc_menu).map_or(0, |(_, menu)| menu);
    set_menu_var(engine, st, menu)?;
    st.state = RunState::Run;
    st.push_int(menu);
    Ok(())
}

/// Like `select`, but cancelling returns 255 instead of ending the script.
pub fn prompt(engine: &mut ScriptEngine, st: &mut ScriptState) -> Result<(), RuntimeError> {
    let rid = rid2sd(engine, st)?;
    let texts = menu_texts(engine, st)?;

    if menu_waiting(engine, rid) {
        open_menu(engine, st, rid, &texts, "prompt");
        return Ok(());
    }

    let npc_menu = take_menu_reply(engine, rid);
    let menu = if npc_menu == MENU_CANCEL {
        MENU_CANCEL
    } else {
        selected_option(&texts, npc_menu).map_or(0, |(_, menu)| menu)
    };
    set_menu_var(engine, st, menu)?;
    st.state = RunState::Run;
    st.push_int(menu);
    Ok(())
}

/// `input <variable>{, <min>{, <max>}}`
///
/// Returns 1 if the reply was above `max`, -1 if below `min`, else 0.
/// Bounds apply to the value for numbers and to the length for strings.
pub fn input(engine: &mut ScriptEngine, st: &mut ScriptState) -> Result<(), RuntimeError> {
    let rid = rid2sd(engine, st)?;
    let (uid, reg) = ref_arg(st, 2, "input")?;
    let is_string = is_string_variable(engine.db.symbols.name(uid_id(uid)));
    let min = if st.has_data(3) { engine.arg_num(st, 3)? } else { engine.config.input_min_value };
    let max = if st.has_data(4) { engine.arg_num(st, 4)? } else { engine.config.input_max_value };

    let Some(sd) = engine.world.pc_mut(rid) else {
        return Err(RuntimeError::PlayerNotAttached);
    };
    if !sd.menu_or_input {
        sd.menu_or_input = true;
        st.state = RunState::RerunLine;
        sd.outbox.push(if is_string {
            ClientMessage::InputStr { npc_id: st.oid }
        } else {
            ClientMessage::InputNum { npc_id: st.oid }
        });
        return Ok(());
    }

    sd.menu_or_input = false;
    let ctx = VarCtx::of(st);
    let cmp = |v: i64| {
        if v > max {
            1
        } else if v < min {
            -1
        } else {
            0
        }
    };
    let result = if is_string {
        let text = sd.npc_str.clone();
        let len = text.len() as i64;
        engine.set_reg(&ctx, uid, RegValue::Str(text), reg.as_ref())?;
        cmp(len)
    } else {
        let amount = sd.npc_amount;
        engine.set_reg(&ctx, uid, RegValue::Num(amount.clamp(min, max.max(min))), reg.as_ref())?;
        cmp(amount)
    };
    st.push_int(result);
    st.state = RunState::Run;
    Ok(())
}
