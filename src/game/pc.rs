//! Player characters as seen by the script engine.

use std::collections::VecDeque;

use crate::timer::TimerId;
use crate::game::scripting::state::StateId;
use crate::game::scripting::storage::RegDb;

pub const MAX_ZENY: i64 = 1_000_000_000;
pub const MAX_LEVEL: i64 = 255;

/// Character parameters readable and writable from scripts.
///
/// Discriminants are the parameter numbers scripts and constant files use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Param {
    BaseExp = 1,
    JobExp = 2,
    Karma = 3,
    Manner = 4,
    Hp = 5,
    MaxHp = 6,
    Sp = 7,
    MaxSp = 8,
    StatusPoint = 9,
    BaseLevel = 11,
    SkillPoint = 12,
    Class = 19,
    Zeny = 20,
    Sex = 21,
    Weight = 24,
    MaxWeight = 25,
    JobLevel = 55,
    Upper = 56,
}

impl Param {
    pub const ALL: [Param; 18] = [
        Param::BaseExp,
        Param::JobExp,
        Param::Karma,
        Param::Manner,
        Param::Hp,
        Param::MaxHp,
        Param::Sp,
        Param::MaxSp,
        Param::StatusPoint,
        Param::BaseLevel,
        Param::SkillPoint,
        Param::Class,
        Param::Zeny,
        Param::Sex,
        Param::Weight,
        Param::MaxWeight,
        Param::JobLevel,
        Param::Upper,
    ];

    pub fn from_num(n: i64) -> Option<Param> {
        Self::ALL.iter().copied().find(|p| *p as i64 == n)
    }

    /// Script-visible name
    pub fn name(self) -> &'static str {
        match self {
            Param::BaseExp => "BaseExp",
            Param::JobExp => "JobExp",
            Param::Karma => "Karma",
            Param::Manner => "Manner",
            Param::Hp => "Hp",
            Param::MaxHp => "MaxHp",
            Param::Sp => "Sp",
            Param::MaxSp => "MaxSp",
            Param::StatusPoint => "StatusPoint",
            Param::BaseLevel => "BaseLevel",
            Param::SkillPoint => "SkillPoint",
            Param::Class => "Class",
            Param::Zeny => "Zeny",
            Param::Sex => "Sex",
            Param::Weight => "Weight",
            Param::MaxWeight => "MaxWeight",
            Param::JobLevel => "JobLevel",
            Param::Upper => "Upper",
        }
    }

    fn slot(self) -> usize {
        Self::ALL.iter().position(|p| *p == self).unwrap_or(0)
    }
}

/// What the server would send to the client while a script runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    Mes { npc_id: u32, text: String },
    Next { npc_id: u32 },
    Close { npc_id: u32 },
    Clear { npc_id: u32 },
    Menu { npc_id: u32, options: String },
    InputNum { npc_id: u32 },
    InputStr { npc_id: u32 },
}

#[derive(Debug)]
pub struct Character {
    /// Block id used as the script `rid`
    pub account_id: u32,
    pub char_id: u32,
    pub name: String,
    pub map: String,
    params: [i64; Param::ALL.len()],

    /// Permanent character variables (no prefix)
    pub reg: RegDb,
    /// `@` variables, dropped on logout
    pub temp_reg: RegDb,
    /// `#` variables
    pub account_reg: RegDb,
    /// `##` variables
    pub account_reg2: RegDb,

    // ============================================
    // Script attachment and dialog state
    // ============================================
    /// NPC the character is talking to
    pub npc_id: u32,
    /// Script currently attached
    pub st: Option<StateId>,
    /// Scripts interrupted by the current one, newest last
    pub st_backup: Vec<(StateId, u32)>,
    pub npc_menu: i64,
    pub npc_amount: i64,
    pub npc_str: String,
    pub menu_or_input: bool,
    pub outbox: Vec<ClientMessage>,
    pub eventqueue: VecDeque<String>,
    pub eventtimer: Option<TimerId>,
}

impl Character {
    pub fn new(account_id: u32, char_id: u32, name: &str) -> Self {
        let mut sd = Self {
            account_id,
            char_id,
            name: name.to_string(),
            map: "prontera".to_string(),
            params: [0; Param::ALL.len()],
            reg: RegDb::default(),
            temp_reg: RegDb::default(),
            account_reg: RegDb::default(),
            account_reg2: RegDb::default(),
            npc_id: 0,
            st: None,
            st_backup: Vec::new(),
            npc_menu: 0,
            npc_amount: 0,
            npc_str: String::new(),
            menu_or_input: false,
            outbox: Vec::new(),
            eventqueue: VecDeque::new(),
            eventtimer: None,
        };
        sd.params[Param::BaseLevel.slot()] = 1;
        sd.params[Param::JobLevel.slot()] = 1;
        sd.params[Param::MaxHp.slot()] = 40;
        sd.params[Param::Hp.slot()] = 40;
        sd.params[Param::MaxSp.slot()] = 11;
        sd.params[Param::Sp.slot()] = 11;
        sd.params[Param::MaxWeight.slot()] = 20000;
        sd
    }

    pub fn readparam(&self, param: Param) -> i64 {
        self.params[param.slot()]
    }

    /// Writes a parameter, clamped to its valid range.
    pub fn setparam(&mut self, param: Param, value: i64) {
        let value = match param {
            Param::Zeny => value.clamp(0, MAX_ZENY),
            Param::BaseLevel | Param::JobLevel => value.clamp(1, MAX_LEVEL),
            Param::Hp => value.clamp(0, self.readparam(Param::MaxHp)),
            Param::Sp => value.clamp(0, self.readparam(Param::MaxSp)),
            Param::MaxHp | Param::MaxSp => value.max(1),
            _ => value,
        };
        self.params[param.slot()] = value;
        match param {
            Param::MaxHp if self.readparam(Param::Hp) > value => self.params[Param::Hp.slot()] = value,
            Param::MaxSp if self.readparam(Param::Sp) > value => self.params[Param::Sp.slot()] = value,
            _ => {}
        }
    }

    /// Takes everything queued for the client.
    pub fn drain_outbox(&mut self) -> Vec<ClientMessage> {
        std::mem::take(&mut self.outbox)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_param_numbers() {
        assert_eq!(Param::from_num(20), Some(Param::Zeny));
        assert_eq!(Param::from_num(11), Some(Param::BaseLevel));
        assert_eq!(Param::from_num(999), None);
        for p in Param::ALL {
            assert_eq!(Param::from_num(p as i64), Some(p));
        }
    }

    #[test]
    fn test_setparam_clamps() {
        let mut sd = Character::new(2000000, 150000, "Tester");
        sd.setparam(Param::Zeny, -5);
        assert_eq!(sd.readparam(Param::Zeny), 0);
        sd.setparam(Param::Zeny, MAX_ZENY + 1);
        assert_eq!(sd.readparam(Param::Zeny), MAX_ZENY);

        sd.setparam(Param::Hp, 1000);
        assert_eq!(sd.readparam(Param::Hp), 40);
        sd.setparam(Param::MaxHp, 10);
        assert_eq!(sd.readparam(Param::Hp), 10);
    }

    #[test]
    fn test_new_character_defaults() {
        let sd = Character::new(1, 2, "Name");
        assert_eq!(sd.readparam(Param::BaseLevel), 1);
        assert_eq!(sd.readparam(Param::Zeny), 0);
        assert!(sd.st.is_none());
        assert!(sd.st_backup.is_empty());
    }
}
