#![deny(unsafe_code)]

/// Terminal front end: command parsing, streamed rendering and the input loop.
pub mod app;
/// Chat domain: message store, turn controller and its collaborators.
pub mod chat;
/// Settings persistence.
pub mod settings;
