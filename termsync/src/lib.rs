//! `TermSync` — message synchronization and delivery engine.
//!
//! Contacts and messages live in `termsync-proto`; this crate wires them to
//! a [`transport::Transport`] and a [`store::Store`] through the
//! [`messenger::Messenger`].

pub mod config;
pub mod event;
pub mod handler;
pub mod identity;
pub mod messenger;
pub mod requester;
pub mod sim;
pub mod store;
pub mod stream;
pub mod transport;
