//! Inbox Agent — email-triggered coding-assistant runs.

pub mod channels;
pub mod config;
pub mod error;
pub mod journal;
pub mod notify;
pub mod pipeline;
pub mod process;
pub mod service;
