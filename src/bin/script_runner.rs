use anyhow::{Context, Result};
use npcscript::config::ScriptConfig;
use npcscript::core::{gettick, SERVER_TICK_RATE};
use npcscript::game::pc::{Character, ClientMessage};
use npcscript::ScriptEngine;

const TEST_ACCOUNT: u32 = 2000000;
const TEST_CHAR: u32 = 150000;

fn usage() {
    println!("Usage: script_runner [--conf FILE] [--npc FILE]... [--event NPC::Label] [--click NPC]");
}

/// Plays the client side: prints what the script shows and picks the
/// first answer for every prompt.
fn answer_dialogs(engine: &mut ScriptEngine) {
    loop {
        let Some(sd) = engine.world.pc_mut(TEST_ACCOUNT) else {
            return;
        };
        let outbox = sd.drain_outbox();
        if outbox.is_empty() {
            return;
        }
        for msg in outbox {
            match msg {
                ClientMessage::Mes { text, .. } => println!("{text}"),
                ClientMessage::Next { npc_id } => {
                    println!("[next]");
                    engine.npc_next(TEST_ACCOUNT, npc_id);
                }
                ClientMessage::Close { npc_id } => {
                    println!("[close]");
                    engine.npc_close(TEST_ACCOUNT, npc_id);
                }
                ClientMessage::Clear { .. } => {}
                ClientMessage::Menu { npc_id, options } => {
                    println!("[menu] {options} -> 1");
                    engine.npc_select_menu(TEST_ACCOUNT, npc_id, 1);
                }
                ClientMessage::InputNum { npc_id } => {
                    println!("[input] -> 0");
                    engine.npc_input_amount(TEST_ACCOUNT, npc_id, 0);
                }
                ClientMessage::InputStr { npc_id } => {
                    println!("[input] -> \"\"");
                    engine.npc_input_str(TEST_ACCOUNT, npc_id, "");
                }
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_ansi(std::io::IsTerminal::is_terminal(&std::io::stderr()))
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut conf_file: Option<String> = None;
    let mut npc_files = Vec::new();
    let mut events = Vec::new();
    let mut clicks = Vec::new();

    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "--h" | "--?" | "/?" => {
                usage();
                return Ok(());
            }
            "--conf" if i + 1 < args.len() => { i += 1; conf_file = Some(args[i].clone()); }
            "--npc" if i + 1 < args.len() => { i += 1; npc_files.push(args[i].clone()); }
            "--event" if i + 1 < args.len() => { i += 1; events.push(args[i].clone()); }
            "--click" if i + 1 < args.len() => { i += 1; clicks.push(args[i].clone()); }
            other => {
                usage();
                anyhow::bail!("unknown argument: {other}");
            }
        }
        i += 1;
    }

    let mut config = match &conf_file {
        Some(path) => ScriptConfig::from_file(path)
            .with_context(|| format!("Cannot load config: {path}"))?,
        None => ScriptConfig::default(),
    };
    config.npc_files.extend(npc_files);

    // start the tick clock before any script can sleep
    gettick();
    let mut engine = ScriptEngine::from_config(config)?;
    engine.pc_login(Character::new(TEST_ACCOUNT, TEST_CHAR, "Runner"));
    tracing::info!("[npc] Script runner started. npcs={}", engine.world.npc_count());

    for event in &events {
        if !engine.npc_event(TEST_ACCOUNT, event) {
            tracing::error!("[npc] event '{event}' could not be run");
        }
        answer_dialogs(&mut engine);
    }
    for name in &clicks {
        let Some(id) = engine.world.name2npc(name).map(|nd| nd.id) else {
            tracing::error!("[npc] no NPC named '{name}'");
            continue;
        };
        engine.npc_click(TEST_ACCOUNT, id);
        answer_dialogs(&mut engine);
    }

    let mut ticker = tokio::time::interval(SERVER_TICK_RATE);
    loop {
        if engine.state_count() == 0 && engine.pending_timers() == 0 {
            break;
        }
        tokio::select! {
            _ = ticker.tick() => {
                engine.do_timers(gettick());
                answer_dialogs(&mut engine);
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("[npc] Interrupted");
                break;
            }
        }
    }

    tracing::info!("[npc] Shutting down...");
    engine.pc_logout(TEST_ACCOUNT);
    engine.shutdown();
    Ok(())
}
