//! Inbound mail: IMAP source, filtering and polling.

pub mod email;
pub mod email_poller;
pub mod email_types;

pub use email::{EmailConfig, ImapMailSource, MailSource};
pub use email_poller::{MailPoller, PollReport, spawn_mail_poller};
pub use email_types::FetchedEmail;
