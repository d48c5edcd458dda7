// bingo-link: connection layer for the bingo game client
// Primary channel to the game backend plus an optional peer data channel

pub mod config;
pub mod debug;
pub mod network;
pub mod storage;
