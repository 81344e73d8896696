//! Shared data model for `TermSync`: contacts, messages, the causal clock
//! and the payload codec.

pub mod clock;
pub mod codec;
pub mod contact;
pub mod message;
