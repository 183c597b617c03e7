// racelink: two-player session setup and state sync for the racing game
// Rooms over HTTP signaling, then a direct WebRTC link with a lossy game
// channel and a reliable control channel

pub mod config;
pub mod logging;
pub mod network;
pub mod signaling_server;
