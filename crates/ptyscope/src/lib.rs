//! Ptyscope: watch the terminal line discipline at work
//!
//! Runs a program on a fresh pseudo-terminal, types a script into it one keystroke
//! at a time and shows what comes back on the master side.

pub mod cli;
