//! # NMSP Protocol
//!
//! Wire format of the replies the dictation client understands.

pub mod json;        // Legacy JSON layout and float spelling
pub mod response;    // Multipart reply rendering

pub use response::{render, ProtocolOutcome};
