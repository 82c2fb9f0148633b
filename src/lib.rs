//! Presidio: login risk assessment and second-factor verification.
//!
//! The crate exposes the auth core as a library (`auth`), an HTTP surface
//! over it (`api`), and the CLI/server wiring (`cli`).

pub mod api;
pub mod auth;
pub mod cli;
