//! Pieces shared by the reader binary and anything that talks to it.

pub mod config;
pub mod naming;
pub mod protocol;
