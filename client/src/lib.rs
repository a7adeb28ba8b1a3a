//! Racing game client
//!
//! Connects to the authoritative server over UDP, keeps remote racer state
//! smooth through lag compensation and survives connection drops with a
//! session-restoring reconnect cycle.

pub mod lag;
pub mod network;
pub mod reconnect;
