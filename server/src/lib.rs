//! Authoritative racing game server
//!
//! Owns every player session, matchmaking queue, race room and rating
//! record. Clients speak a bincode packet protocol over UDP; a small axum
//! surface exposes health and stats over HTTP.

pub mod http;
pub mod matchmaking;
pub mod network;
pub mod profile;
pub mod rating;
pub mod room;
pub mod session;
