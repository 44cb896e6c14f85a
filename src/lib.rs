//! pollcall - peer-to-peer calls signaled through a polled session store

pub mod calling;
pub mod config;
pub mod store;
