//! Game-side registry the script engine runs against.
//!
//! Holds the online characters, loaded NPCs with their exported events, map
//! instances and the server-wide variable store.

pub mod npc;
pub mod pc;
pub mod scripting;

use std::collections::HashMap;

use npc::{NpcData, NpcEvent};
use pc::Character;
use scripting::storage::RegDb;

pub use npc::NPC_START_NUM;

#[derive(Debug)]
pub struct World {
    chars: HashMap<u32, Character>,
    npcs: HashMap<u32, NpcData>,
    npcname_db: HashMap<String, u32>,
    events: HashMap<String, NpcEvent>,
    /// `$` and `$@` variables
    pub mapreg: RegDb,
    instances: HashMap<i32, RegDb>,
    next_npc_id: u32,
    next_instance_id: i32,
}

impl Default for World {
    fn default() -> Self {
        Self::new()
    }
}

impl World {
    pub fn new() -> Self {
        Self {
            chars: HashMap::new(),
            npcs: HashMap::new(),
            npcname_db: HashMap::new(),
            events: HashMap::new(),
            mapreg: RegDb::default(),
            instances: HashMap::new(),
            next_npc_id: NPC_START_NUM,
            next_instance_id: 1,
        }
    }

    // ============================================
    // Characters
    // ============================================

    pub fn add_pc(&mut self, sd: Character) {
        self.chars.insert(sd.account_id, sd);
    }

    pub fn remove_pc(&mut self, account_id: u32) -> Option<Character> {
        self.chars.remove(&account_id)
    }

    pub fn pc(&self, account_id: u32) -> Option<&Character> {
        self.chars.get(&account_id)
    }

    pub fn pc_mut(&mut self, account_id: u32) -> Option<&mut Character> {
        self.chars.get_mut(&account_id)
    }

    pub fn charid2sd(&self, char_id: u32) -> Option<&Character> {
        self.chars.values().find(|sd| sd.char_id == char_id)
    }

    pub fn nick2sd(&self, name: &str) -> Option<&Character> {
        self.chars.values().find(|sd| sd.name.eq_ignore_ascii_case(name))
    }

    pub fn pc_ids(&self) -> Vec<u32> {
        self.chars.keys().copied().collect()
    }

    // ============================================
    // NPCs and events
    // ============================================

    pub fn next_npc_id(&mut self) -> u32 {
        let id = self.next_npc_id;
        self.next_npc_id = self.next_npc_id.wrapping_add(1);
        id
    }

    /// Registers an NPC. Fails when the unique name is taken.
    pub fn add_npc(&mut self, nd: NpcData) -> Result<u32, NpcData> {
        if self.npcname_db.contains_key(&nd.exname) {
            return Err(nd);
        }
        let id = nd.id;
        self.npcname_db.insert(nd.exname.clone(), id);
        self.npcs.insert(id, nd);
        Ok(id)
    }

    pub fn remove_npc(&mut self, id: u32) -> Option<NpcData> {
        let nd = self.npcs.remove(&id)?;
        self.npcname_db.remove(&nd.exname);
        self.events.retain(|_, ev| ev.npc_id != id);
        Some(nd)
    }

    pub fn npc(&self, id: u32) -> Option<&NpcData> {
        self.npcs.get(&id)
    }

    pub fn npc_mut(&mut self, id: u32) -> Option<&mut NpcData> {
        self.npcs.get_mut(&id)
    }

    pub fn name2npc(&self, name: &str) -> Option<&NpcData> {
        self.npcname_db.get(name).and_then(|id| self.npcs.get(id))
    }

    pub fn npc_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.npcs.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn npc_count(&self) -> usize {
        self.npcs.len()
    }

    /// Registers `NPC::Label`. Returns false when it replaced another event.
    pub fn add_event(&mut self, name: String, ev: NpcEvent) -> bool {
        self.events.insert(name, ev).is_none()
    }

    pub fn event(&self, name: &str) -> Option<NpcEvent> {
        self.events.get(name).copied()
    }

    /// Every event whose label part is `label`, in NPC id order.
    pub fn events_with_label(&self, label: &str) -> Vec<NpcEvent> {
        let mut found: Vec<NpcEvent> = self
            .events
            .iter()
            .filter(|(name, _)| {
                name.rsplit_once("::")
                    .map(|(_, l)| l.eq_ignore_ascii_case(label))
                    .unwrap_or(false)
            })
            .map(|(_, ev)| *ev)
            .collect();
        found.sort_by_key(|ev| (ev.npc_id, ev.pos));
        found
    }

    pub fn clear_npcs(&mut self) {
        self.npcs.clear();
        self.npcname_db.clear();
        self.events.clear();
    }

    // ============================================
    // Instances
    // ============================================

    pub fn create_instance(&mut self) -> i32 {
        let id = self.next_instance_id;
        self.next_instance_id += 1;
        self.instances.insert(id, RegDb::default());
        id
    }

    pub fn destroy_instance(&mut self, id: i32) -> bool {
        self.instances.remove(&id).is_some()
    }

    pub fn instance_reg(&self, id: i32) -> Option<&RegDb> {
        self.instances.get(&id)
    }

    pub fn instance_reg_mut(&mut self, id: i32) -> Option<&mut RegDb> {
        self.instances.get_mut(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::scripting::code::ScriptCode;

    fn npc(world: &mut World, exname: &str) -> NpcData {
        let id = world.next_npc_id();
        NpcData::new(id, exname, exname, ScriptCode::new(vec![0], "test", 1))
    }

    #[test]
    fn test_npc_registry() {
        let mut world = World::new();
        let nd = npc(&mut world, "Guard");
        let id = world.add_npc(nd).unwrap();
        assert_eq!(id, NPC_START_NUM);
        assert_eq!(world.name2npc("Guard").map(|nd| nd.id), Some(id));

        let dup = npc(&mut world, "Guard");
        assert!(world.add_npc(dup).is_err());

        world.add_event("Guard::OnInit".to_string(), NpcEvent { npc_id: id, pos: 4 });
        assert_eq!(world.events_with_label("oninit").len(), 1);

        world.remove_npc(id);
        assert!(world.name2npc("Guard").is_none());
        assert!(world.event("Guard::OnInit").is_none());
    }

    #[test]
    fn test_instances() {
        let mut world = World::new();
        let a = world.create_instance();
        let b = world.create_instance();
        assert_ne!(a, b);
        assert!(world.instance_reg(a).is_some());
        assert!(world.destroy_instance(a));
        assert!(world.instance_reg(a).is_none());
    }

    #[test]
    fn test_character_lookup() {
        let mut world = World::new();
        world.add_pc(Character::new(2000001, 150001, "Alice"));
        assert!(world.pc(2000001).is_some());
        assert_eq!(world.charid2sd(150001).map(|sd| sd.account_id), Some(2000001));
        assert!(world.nick2sd("alice").is_some());
        assert!(world.remove_pc(2000001).is_some());
        assert!(world.pc(2000001).is_none());
    }
}
