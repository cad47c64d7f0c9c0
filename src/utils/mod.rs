//! Process and retry helpers shared by the broker and the binary.

pub mod bootstrap;
pub mod retry;
