//! # Pordisto (forum session and access control)
//!
//! `pordisto` decides who a forum visitor is and what they may do. It owns
//! registration, password login, login through Google or GitHub, server-side
//! sessions and the role hierarchy `guest < user < moderator < admin`.
//!
//! ## Sessions
//!
//! A login issues a random 256-bit token. The browser holds it in an
//! `HttpOnly` cookie (`pordisto_session` for password logins,
//! `pordisto_federated` for provider logins); the database only stores its
//! SHA-256 digest together with the owner and expiry. Expired rows are never
//! honoured and are swept periodically.
//!
//! ## Brute force protection
//!
//! Every failed password check is delayed and counted per client address.
//! The sixth consecutive failure locks the client out for 30 seconds and each
//! further failure doubles the window, up to roughly eight and a half hours.
//! Credential endpoints additionally sit behind a sliding-window request
//! limiter.
//!
//! ## Roles
//!
//! Protected routes declare a minimum role. Missing sessions get `401`,
//! insufficient roles `403`. Users can ask to become moderators; an admin
//! approval changes the role and closes the request atomically.

pub mod api;
pub mod cli;
pub mod store;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);
