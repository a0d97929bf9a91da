//! Tunnel between the HTTP front end and connected stub clients.
//!
//! - [`hub`]: connection registry, pending-call table, broadcast and reply
//!   correlation
//! - [`subscriber`]: per-connection actor driving one WebSocket
pub mod hub;
pub mod subscriber;
