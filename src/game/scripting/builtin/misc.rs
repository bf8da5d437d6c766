//! Timing, character attachment, events and value helpers.

use ::md5::{Digest, Md5};
use ::rand::Rng;
use chrono::{Datelike, Local, Timelike};

use crate::game::pc::Param;
use crate::game::scripting::error::RuntimeError;
use crate::game::scripting::lexer::is_string_variable;
use crate::game::scripting::state::{RunState, ScriptData, ScriptState};
use crate::game::scripting::storage::{reference_uid, uid_id};
use crate::game::scripting::symbol::SymbolKind;
use crate::game::scripting::vars::{str_to_num, VarCtx};
use crate::game::scripting::ScriptEngine;

use super::{ref_arg, rid2sd};

/// `gettime` selectors, registered as constants numbered from 1.
pub const DATE_TYPES: [&str; 9] = [
    "DT_SECOND",
    "DT_MINUTE",
    "DT_HOUR",
    "DT_DAYOFWEEK",
    "DT_DAYOFMONTH",
    "DT_MONTH",
    "DT_YEAR",
    "DT_DAYOFYEAR",
    "DT_YYYYMMDD",
];

// ---------------------------------------------------------------------------
// Timing
// ---------------------------------------------------------------------------

fn sleep_ticks(engine: &mut ScriptEngine, st: &mut ScriptState, func: &'static str) -> Result<u64, RuntimeError> {
    let ticks = engine.arg_num(st, 2)?;
    u64::try_from(ticks).ok().filter(|t| *t > 0).ok_or_else(|| {
        RuntimeError::builtin(func, format!("negative or zero amount('{ticks}') of milli seconds is not supported"))
    })
}

/// `sleep <ms>`: suspends the script and detaches the character.
pub fn sleep(engine: &mut ScriptEngine, st: &mut ScriptState) -> Result<(), RuntimeError> {
    if st.sleep.tick == 0 {
        let ticks = sleep_ticks(engine, st, "sleep")?;
        engine.detach_rid(st);
        st.state = RunState::RerunLine;
        st.sleep.tick = ticks;
    } else {
        st.state = RunState::Run;
        st.sleep.tick = 0;
    }
    Ok(())
}

/// `sleep2 <ms>`: suspends the script keeping the character attached.
/// The script ends if the character left meanwhile.
pub fn sleep2(engine: &mut ScriptEngine, st: &mut ScriptState) -> Result<(), RuntimeError> {
    if st.sleep.tick == 0 {
        let ticks = sleep_ticks(engine, st, "sleep2")?;
        if rid2sd(engine, st).is_err() {
            return Ok(());
        }
        st.state = RunState::RerunLine;
        st.sleep.tick = ticks;
    } else if rid2sd(engine, st).is_err() {
        st.rid = 0;
        st.state = RunState::End;
    } else {
        st.state = RunState::Run;
        st.sleep.tick = 0;
    }
    Ok(())
}

/// `awake "<npc name>"`: wakes the NPC's sleeping scripts now.
pub fn awake(engine: &mut ScriptEngine, st: &mut ScriptState) -> Result<(), RuntimeError> {
    let name = engine.arg_str(st, 2)?;
    let id = engine
        .world
        .name2npc(&name)
        .map(|nd| nd.id)
        .ok_or_else(|| RuntimeError::builtin("awake", format!("NPC \"{name}\" not found")))?;
    engine.awake(id);
    Ok(())
}

/// `gettimetick(<type>)`: 0 server tick, 1 seconds since midnight,
/// 2 unix time.
pub fn gettimetick(engine: &mut ScriptEngine, st: &mut ScriptState) -> Result<(), RuntimeError> {
    let value = match engine.arg_num(st, 2)? {
        1 => {
            let now = Local::now();
            i64::from(now.num_seconds_from_midnight())
        }
        2 => Local::now().timestamp(),
        _ => engine.tick() as i64,
    };
    st.push_int(value);
    Ok(())
}

pub fn gettime(engine: &mut ScriptEngine, st: &mut ScriptState) -> Result<(), RuntimeError> {
    let ty = engine.arg_num(st, 2)?;
    let now = Local::now();
    let value = match ty {
        1 => i64::from(now.second()),
        2 => i64::from(now.minute()),
        3 => i64::from(now.hour()),
        4 => i64::from(now.weekday().num_days_from_sunday()),
        5 => i64::from(now.day()),
        6 => i64::from(now.month()),
        7 => i64::from(now.year()),
        8 => i64::from(now.ordinal()),
        9 => i64::from(now.year()) * 10000 + i64::from(now.month()) * 100 + i64::from(now.day()),
        _ => return Err(RuntimeError::builtin("gettime", format!("Invalid date type {ty}"))),
    };
    st.push_int(value);
    Ok(())
}

// ---------------------------------------------------------------------------
// Character attachment
// ---------------------------------------------------------------------------

/// `attachrid(<account id>{, <force>})`: returns 1 on success.
///
/// Without `force` a character busy with another script is refused.
pub fn attachrid(engine: &mut ScriptEngine, st: &mut ScriptState) -> Result<(), RuntimeError> {
    let rid = engine.arg_num(st, 2)?;
    let force = if st.has_data(3) { engine.arg_num(st, 3)? != 0 } else { true };

    let Some(sd) = u32::try_from(rid).ok().and_then(|rid| engine.world.pc(rid)) else {
        st.push_int(0);
        return Ok(());
    };
    if !force && (sd.npc_id != 0 || sd.st.is_some()) {
        st.push_int(0);
        return Ok(());
    }
    let rid = sd.account_id;
    engine.detach_rid(st);
    st.rid = rid;
    engine.attach_state(st);
    st.push_int(1);
    Ok(())
}

pub fn detachrid(engine: &mut ScriptEngine, st: &mut ScriptState) -> Result<(), RuntimeError> {
    engine.detach_rid(st);
    Ok(())
}

pub fn playerattached(engine: &mut ScriptEngine, st: &mut ScriptState) -> Result<(), RuntimeError> {
    let rid = rid2sd(engine, st).map_or(0, i64::from);
    st.push_int(rid);
    Ok(())
}

/// `getcharid(<type>{, "<character name>"})`: 0 char id, 3 account id.
pub fn getcharid(engine: &mut ScriptEngine, st: &mut ScriptState) -> Result<(), RuntimeError> {
    let ty = engine.arg_num(st, 2)?;
    let sd = if st.has_data(3) {
        let name = engine.arg_str(st, 3)?;
        engine.world.nick2sd(&name)
    } else {
        engine.world.pc(st.rid)
    };
    let Some(sd) = sd else {
        st.push_int(0);
        return Ok(());
    };
    let value = match ty {
        0 => i64::from(sd.char_id),
        3 => i64::from(sd.account_id),
        _ => 0,
    };
    st.push_int(value);
    Ok(())
}

/// `strcharinfo(<type>{, <char id>})`: 0 name, 3 map.
pub fn strcharinfo(engine: &mut ScriptEngine, st: &mut ScriptState) -> Result<(), RuntimeError> {
    let ty = engine.arg_num(st, 2)?;
    let sd = if st.has_data(3) {
        let char_id = engine.arg_num(st, 3)?;
        u32::try_from(char_id).ok().and_then(|id| engine.world.charid2sd(id))
    } else {
        engine.world.pc(st.rid)
    };
    let sd = sd.ok_or(RuntimeError::PlayerNotAttached)?;
    let value = match ty {
        0 => sd.name.clone(),
        3 => sd.map.clone(),
        _ => String::new(),
    };
    st.push_str(value);
    Ok(())
}

/// `readparam(<param>{, "<character name>"})`; -1 without a character.
pub fn readparam(engine: &mut ScriptEngine, st: &mut ScriptState) -> Result<(), RuntimeError> {
    let param_sym = st
        .data(2)
        .and_then(ScriptData::reference_id)
        .and_then(|id| engine.db.symbols.get(id))
        .filter(|sym| sym.kind == SymbolKind::Param)
        .map(|sym| sym.val);
    let param = match param_sym {
        Some(n) => n,
        None => engine.arg_num(st, 2)?,
    };
    let sd = if st.has_data(3) {
        let name = engine.arg_str(st, 3)?;
        engine.world.nick2sd(&name)
    } else {
        engine.world.pc(st.rid)
    };
    let value = match sd {
        Some(sd) => Param::from_num(param).map_or(0, |p| sd.readparam(p)),
        None => -1,
    };
    st.push_int(value);
    Ok(())
}

// ---------------------------------------------------------------------------
// Events and instances
// ---------------------------------------------------------------------------

fn check_event(engine: &ScriptEngine, st: &ScriptState, event: &str) {
    if !event.contains("::") {
        tracing::warn!("[script] NPC event parameter deprecated! Please use 'NPCNAME::OnEVENT' instead of '{event}'.");
        engine.reportsrc(st);
    }
}

/// `donpcevent "<npc>::<label>"`: runs the event without a character.
/// Returns 1 if it was found.
pub fn donpcevent(engine: &mut ScriptEngine, st: &mut ScriptState) -> Result<(), RuntimeError> {
    let event = engine.arg_str(st, 2)?;
    check_event(engine, st, &event);
    let found = engine.npc_event_do(&event);
    if !found {
        tracing::debug!("[script] NPCEvent '{event}' not found!");
        engine.reportsrc(st);
    }
    st.push_bool(found);
    Ok(())
}

/// `doevent "<npc>::<label>"`: runs the event for the attached character,
/// queued if the character is busy.
pub fn doevent(engine: &mut ScriptEngine, st: &mut ScriptState) -> Result<(), RuntimeError> {
    let rid = rid2sd(engine, st)?;
    let event = engine.arg_str(st, 2)?;
    check_event(engine, st, &event);
    engine.npc_event(rid, &event);
    Ok(())
}

pub fn instance_id(_engine: &mut ScriptEngine, st: &mut ScriptState) -> Result<(), RuntimeError> {
    st.push_int(i64::from(st.instance_id));
    Ok(())
}

// ---------------------------------------------------------------------------
// Values
// ---------------------------------------------------------------------------

/// `rand(<range>)` is in `0..range`; `rand(<min>, <max>)` in `min..=max`.
pub fn rand(engine: &mut ScriptEngine, st: &mut ScriptState) -> Result<(), RuntimeError> {
    let mut rng = ::rand::thread_rng();
    let value = if st.has_data(3) {
        let mut min = engine.arg_num(st, 2)?;
        let mut max = engine.arg_num(st, 3)?;
        if max < min {
            std::mem::swap(&mut min, &mut max);
        }
        if min == max {
            min
        } else {
            rng.gen_range(min..=max)
        }
    } else {
        let range = engine.arg_num(st, 2)?;
        if range <= 1 {
            0
        } else {
            rng.gen_range(0..range)
        }
    };
    st.push_int(value);
    Ok(())
}

pub fn md5(engine: &mut ScriptEngine, st: &mut ScriptState) -> Result<(), RuntimeError> {
    let s = engine.arg_str(st, 2)?;
    st.push_str(hex::encode(Md5::digest(s.as_bytes())));
    Ok(())
}

/// Length in bytes.
pub fn getstrlen(engine: &mut ScriptEngine, st: &mut ScriptState) -> Result<(), RuntimeError> {
    let s = engine.arg_str(st, 2)?;
    st.push_int(s.len() as i64);
    Ok(())
}

pub fn charat(engine: &mut ScriptEngine, st: &mut ScriptState) -> Result<(), RuntimeError> {
    let s = engine.arg_str(st, 2)?;
    let pos = engine.arg_num(st, 3)?;
    let c = usize::try_from(pos)
        .ok()
        .and_then(|p| s.get(p..p + 1))
        .unwrap_or("")
        .to_string();
    st.push_str(c);
    Ok(())
}

pub fn strtoupper(engine: &mut ScriptEngine, st: &mut ScriptState) -> Result<(), RuntimeError> {
    let s = engine.arg_str(st, 2)?;
    st.push_str(s.to_ascii_uppercase());
    Ok(())
}

pub fn strtolower(engine: &mut ScriptEngine, st: &mut ScriptState) -> Result<(), RuntimeError> {
    let s = engine.arg_str(st, 2)?;
    st.push_str(s.to_ascii_lowercase());
    Ok(())
}

/// `implode(<string array>{, "<glue>"})`
pub fn implode(engine: &mut ScriptEngine, st: &mut ScriptState) -> Result<(), RuntimeError> {
    let (uid, reg) = ref_arg(st, 2, "implode")?;
    let id = uid_id(uid);
    if !is_string_variable(engine.db.symbols.name(id)) {
        return Err(RuntimeError::builtin(
            "implode",
            format!("not string array '{}'", engine.db.symbols.name(id)),
        ));
    }
    let ctx = VarCtx::of(st);
    let size = engine.array_size(&ctx, id, reg.as_ref())?;
    if size == 0 {
        tracing::warn!("[script] implode: array length = 0");
        st.push_str("");
        return Ok(());
    }
    let glue = if st.has_data(3) { engine.arg_str(st, 3)? } else { String::new() };

    let mut parts = Vec::with_capacity(size as usize);
    for i in 0..size {
        match engine.read_var(&ctx, reference_uid(id, i), reg.as_ref())? {
            ScriptData::Str(s) => parts.push(s),
            _ => parts.push(String::new()),
        }
    }
    st.push_str(parts.join(&glue));
    Ok(())
}

pub fn atoi(engine: &mut ScriptEngine, st: &mut ScriptState) -> Result<(), RuntimeError> {
    let s = engine.arg_str(st, 2)?;
    st.push_int(str_to_num(&s));
    Ok(())
}

pub fn debugmes(engine: &mut ScriptEngine, st: &mut ScriptState) -> Result<(), RuntimeError> {
    let s = engine.arg_str(st, 2)?;
    tracing::debug!("[script] script debug : {} {} : {}", st.rid, st.oid, s);
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::game::npc::NpcData;
    use crate::game::pc::{Character, Param};
    use crate::game::scripting::{ParseOptions, ScriptEngine};

    const AID: u32 = 2000001;

    fn engine() -> ScriptEngine {
        let mut e = ScriptEngine::default();
        e.world.add_pc(Character::new(AID, 150001, "Tester"));
        e
    }

    fn run_as(e: &mut ScriptEngine, src: &str, rid: u32, oid: u32) {
        let code = e.parse_script(src, "test", 1, ParseOptions::NONE).unwrap().unwrap();
        e.run_script(&code, 0, rid, oid);
    }

    fn run(e: &mut ScriptEngine, src: &str) {
        run_as(e, src, 0, 0);
    }

    fn num(e: &mut ScriptEngine, name: &str) -> i64 {
        e.get_val2_num(AID, 0, name, 0).unwrap()
    }

    fn text(e: &mut ScriptEngine, name: &str) -> String {
        e.get_val2_str(AID, 0, name, 0).unwrap()
    }

    #[test]
    fn test_sleep_resumes_on_timer() {
        let mut e = engine();
        run(&mut e, "{ $a = 1; sleep 100; $a = 2; end; }");
        assert_eq!(num(&mut e, "$a"), 1);
        assert_eq!(e.state_count(), 1);
        assert_eq!(e.next_timer(), Some(100));

        assert_eq!(e.do_timers(50), 0);
        assert_eq!(num(&mut e, "$a"), 1);
        assert_eq!(e.do_timers(100), 1);
        assert_eq!(num(&mut e, "$a"), 2);
        assert_eq!(e.state_count(), 0);
    }

    #[test]
    fn test_sleep_detaches_player() {
        let mut e = engine();
        run_as(&mut e, "{ sleep 10; $rid = playerattached(); end; }", AID, 0);
        assert!(e.world.pc(AID).unwrap().st.is_none());
        e.do_timers(10);
        assert_eq!(num(&mut e, "$rid"), 0);
    }

    #[test]
    fn test_sleep2_keeps_player() {
        let mut e = engine();
        run_as(&mut e, "{ sleep2 10; $rid = playerattached(); end; }", AID, 0);
        e.do_timers(10);
        assert_eq!(num(&mut e, "$rid"), i64::from(AID));
    }

    #[test]
    fn test_sleep2_ends_when_player_left() {
        let mut e = engine();
        run_as(&mut e, "{ sleep2 10; $after = 1; end; }", AID, 0);
        e.world.remove_pc(AID);
        e.do_timers(10);
        assert_eq!(e.get_val2_num(0, 0, "$after", 0).unwrap(), 0);
        assert_eq!(e.state_count(), 0);
    }

    #[test]
    fn test_sleep_zero_ends_script() {
        let mut e = engine();
        run(&mut e, "{ $a = 1; sleep 0; $a = 2; end; }");
        assert_eq!(num(&mut e, "$a"), 1);
        assert_eq!(e.pending_timers(), 0);
    }

    #[test]
    fn test_awake_wakes_npc_sleepers() {
        let mut e = engine();
        let code = e
            .parse_script("{ $a = 1; sleep 60000; $a = 2; end; }", "sleeper", 1, ParseOptions::NONE)
            .unwrap()
            .unwrap();
        let id = e.world.next_npc_id();
        e.world.add_npc(NpcData::new(id, "Sleeper", "Sleeper", code.clone())).unwrap();
        e.run_script(&code, 0, 0, id);
        assert_eq!(num(&mut e, "$a"), 1);

        run(&mut e, "{ awake \"Sleeper\"; end; }");
        assert_eq!(num(&mut e, "$a"), 2);
        assert_eq!(e.pending_timers(), 0);
        assert_eq!(e.state_count(), 0);
    }

    #[test]
    fn test_time_functions() {
        let mut e = engine();
        run(
            &mut e,
            r#"{
                $tick = gettimetick(0);
                $unix = gettimetick(2);
                $month = gettime(DT_MONTH);
                $year = gettime(DT_YEAR);
                $ymd = gettime(DT_YYYYMMDD);
                end;
            }"#,
        );
        assert_eq!(num(&mut e, "$tick"), 0);
        assert!(num(&mut e, "$unix") > 1_600_000_000);
        assert!((1..=12).contains(&num(&mut e, "$month")));
        let year = num(&mut e, "$year");
        assert!(year >= 2024);
        assert_eq!(num(&mut e, "$ymd") / 10000, year);
    }

    #[test]
    fn test_gettime_invalid_type_ends() {
        let mut e = engine();
        run(&mut e, "{ $ok = 1; $t = gettime(99); $ok = 2; end; }");
        assert_eq!(num(&mut e, "$ok"), 1);
    }

    #[test]
    fn test_attachrid_and_character_info() {
        let mut e = engine();
        run(
            &mut e,
            r#"{
                $none = playerattached();
                $ok = attachrid(2000001);
                $bad = attachrid(42);
                $who = playerattached();
                $cid = getcharid(0);
                $aid = getcharid(3, "tester");
                $name$ = strcharinfo(0);
                $map$ = strcharinfo(3);
                Zeny = 500;
                $zeny = readparam(Zeny);
                $lvl = readparam(11, "Tester");
                detachrid;
                $after = playerattached();
                $missing = readparam(Zeny, "Nobody");
                end;
            }"#,
        );
        assert_eq!(num(&mut e, "$none"), 0);
        assert_eq!(num(&mut e, "$ok"), 1);
        assert_eq!(num(&mut e, "$bad"), 0);
        assert_eq!(num(&mut e, "$who"), i64::from(AID));
        assert_eq!(num(&mut e, "$cid"), 150001);
        assert_eq!(num(&mut e, "$aid"), i64::from(AID));
        assert_eq!(text(&mut e, "$name$"), "Tester");
        assert_eq!(text(&mut e, "$map$"), "prontera");
        assert_eq!(num(&mut e, "$zeny"), 500);
        assert_eq!(e.world.pc(AID).unwrap().readparam(Param::Zeny), 500);
        assert_eq!(num(&mut e, "$lvl"), 1);
        assert_eq!(num(&mut e, "$after"), 0);
        assert_eq!(num(&mut e, "$missing"), -1);
    }

    #[test]
    fn test_attachrid_without_force_refuses_busy_player() {
        let mut e = engine();
        run_as(&mut e, "{ mes \"busy\"; next; end; }", AID, 0);
        run(&mut e, "{ $forced = attachrid(2000001, 0); end; }");
        assert_eq!(num(&mut e, "$forced"), 0);
    }

    #[test]
    fn test_donpcevent_missing_event() {
        let mut e = engine();
        run(&mut e, "{ $r = donpcevent(\"Nobody::OnThing\"); end; }");
        assert_eq!(num(&mut e, "$r"), 0);
    }

    #[test]
    fn test_instance_id_follows_npc() {
        let mut e = engine();
        let code = e
            .parse_script("{ $iid = instance_id(); 'score = 3; end; }", "inst", 1, ParseOptions::NONE)
            .unwrap()
            .unwrap();
        let iid = e.world.create_instance();
        let id = e.world.next_npc_id();
        let mut nd = NpcData::new(id, "Keeper", "Keeper", code.clone());
        nd.instance_id = iid;
        e.world.add_npc(nd).unwrap();
        e.run_script(&code, 0, 0, id);
        assert_eq!(num(&mut e, "$iid"), i64::from(iid));
        assert_eq!(e.get_val2_num(0, id, "'score", 0).unwrap(), 3);
    }

    #[test]
    fn test_rand_ranges() {
        let mut e = engine();
        for _ in 0..20 {
            run(&mut e, "{ $a = rand(10); $b = rand(5, 5); $c = rand(10, 1); $d = rand(1); end; }");
            assert!((0..10).contains(&num(&mut e, "$a")));
            assert_eq!(num(&mut e, "$b"), 5);
            assert!((1..=10).contains(&num(&mut e, "$c")));
            assert_eq!(num(&mut e, "$d"), 0);
        }
    }

    #[test]
    fn test_string_functions() {
        let mut e = engine();
        run(
            &mut e,
            r#"{
                $md5$ = md5("");
                $len = getstrlen("hello");
                $c$ = charat("hello", 1);
                $out$ = charat("hello", 9);
                $up$ = strtoupper("MiXed1");
                $low$ = strtolower("MiXed1");
                $n = atoi("12abc");
                setarray $parts$, "a", "", "c";
                $joined$ = implode($parts$, "-");
                $empty$ = implode($nothing$, "-");
                debugmes "checked";
                end;
            }"#,
        );
        assert_eq!(text(&mut e, "$md5$"), "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(num(&mut e, "$len"), 5);
        assert_eq!(text(&mut e, "$c$"), "e");
        assert_eq!(text(&mut e, "$out$"), "");
        assert_eq!(text(&mut e, "$up$"), "MIXED1");
        assert_eq!(text(&mut e, "$low$"), "mixed1");
        assert_eq!(num(&mut e, "$n"), 12);
        assert_eq!(text(&mut e, "$joined$"), "a--c");
        assert_eq!(text(&mut e, "$empty$"), "");
    }

    #[test]
    fn test_implode_rejects_number_array() {
        let mut e = engine();
        run(&mut e, "{ $ok = 1; setarray $n, 1, 2; $s$ = implode($n); $ok = 2; end; }");
        assert_eq!(num(&mut e, "$ok"), 1);
    }
}
