//! Static databases loaded at startup.

pub mod const_db;
