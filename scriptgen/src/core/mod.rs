//! Pure, deterministic building blocks.
//!
//! Nothing in here touches the filesystem or spawns processes, so every rule
//! (cache keys, deny-list matching, shell flag selection, budget arithmetic)
//! can be tested in isolation.

pub mod budget;
pub mod denylist;
pub mod shell;
pub mod types;
