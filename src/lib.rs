//! npcscript - NPC script engine for the map server
//!
//! A compiler and stack virtual machine for the NPC scripting language used
//! to author quests, shops and events. Scripts are compiled once into a
//! compact bytecode and executed per trigger, suspending cooperatively while
//! they wait for timers or client input.

// ============================================
// Core Modules
// ============================================

/// Script engine configuration (YAML)
pub mod config;
/// Tick clock and server constants
pub mod core;
/// Timer queue driving sleeping scripts and queued events
pub mod timer;
/// Static databases (script constants)
pub mod database;

// ============================================
// Game Layer
// ============================================

/// Characters, NPCs, instances and the script engine
pub mod game;

pub use game::scripting::{ParseOptions, ScriptEngine};
