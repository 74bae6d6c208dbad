//! Email channel: IMAP polling for inbound tasks, SMTP via lettre for replies.
//!
//! The IMAP side speaks just enough IMAP4rev1 for a poll cycle (LOGIN,
//! SELECT, UID SEARCH, UID FETCH, UID STORE, LOGOUT) over rustls or plain
//! TCP. It is blocking; async callers go through `spawn_blocking`.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use mail_parser::{MessageParser, MimeHeaders};
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::channels::email_types::FetchedEmail;
use crate::config::{MAX_DURATION_SECS, split_list};
use crate::error::{ChannelError, ConfigError};

/// Socket read/write timeout for IMAP.
const IMAP_IO_TIMEOUT: Duration = Duration::from_secs(30);

// ── Configuration ───────────────────────────────────────────────────

/// Mailbox configuration, built from environment variables.
#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub imap_host: String,
    pub imap_port: u16,
    /// `false` connects over plain TCP (local test servers).
    pub imap_tls: bool,
    pub mailbox: String,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub username: String,
    pub password: SecretString,
    pub from_address: String,
    pub poll_interval: Duration,
    pub allowed_senders: Vec<String>,
}

impl EmailConfig {
    /// Build config from environment variables.
    /// Returns `Ok(None)` if `IMAP_HOST` is not set (mail source disabled).
    pub fn from_env() -> Result<Option<Self>, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Option<Self>, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let Some(imap_host) = get("IMAP_HOST") else {
            return Ok(None);
        };

        let imap_port = parse_port(&get, "IMAP_PORT", 993)?;
        let smtp_host = get("SMTP_HOST").unwrap_or_else(|| imap_host.replace("imap", "smtp"));
        let smtp_port = parse_port(&get, "SMTP_PORT", 587)?;
        let imap_tls = !matches!(
            get("IMAP_TLS").map(|v| v.to_ascii_lowercase()).as_deref(),
            Some("0" | "false" | "no" | "off")
        );

        let username = get("IMAP_USER").unwrap_or_default();
        let password = SecretString::from(get("IMAP_PASSWORD").unwrap_or_default());
        let from_address = get("EMAIL_FROM_ADDRESS").unwrap_or_else(|| username.clone());

        let poll_interval = match get("EMAIL_POLL_INTERVAL_SECS") {
            Some(v) => match v.parse::<u64>() {
                Ok(secs) if (1..=MAX_DURATION_SECS).contains(&secs) => Duration::from_secs(secs),
                _ => {
                    return Err(ConfigError::InvalidValue {
                        key: "EMAIL_POLL_INTERVAL_SECS".into(),
                        message: format!("expected 1 to {MAX_DURATION_SECS} seconds, got `{v}`"),
                    });
                }
            },
            None => Duration::from_secs(60),
        };

        let allowed_senders = get("EMAIL_ALLOWED_SENDERS")
            .map(|v| split_list(&v))
            .unwrap_or_else(|| vec!["notifications@github.com".to_string()]);

        Ok(Some(Self {
            imap_host,
            imap_port,
            imap_tls,
            mailbox: get("IMAP_MAILBOX").unwrap_or_else(|| "INBOX".to_string()),
            smtp_host,
            smtp_port,
            username,
            password,
            from_address,
            poll_interval,
            allowed_senders,
        }))
    }
}

fn parse_port<G>(get: &G, key: &str, default: u16) -> Result<u16, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(v) => v.parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected a port number, got `{v}`"),
        }),
        None => Ok(default),
    }
}

// ── Mail source ─────────────────────────────────────────────────────

/// Delivers unseen mail to the poller.
#[async_trait]
pub trait MailSource: Send + Sync {
    /// Unseen messages, without marking them seen.
    async fn fetch_unseen(&self) -> Result<Vec<FetchedEmail>, ChannelError>;

    /// Flag messages as seen so the next poll skips them.
    async fn mark_seen(&self, uids: &[u32]) -> Result<(), ChannelError>;
}

/// `MailSource` backed by an IMAP server.
pub struct ImapMailSource {
    config: Arc<EmailConfig>,
}

impl ImapMailSource {
    pub fn new(config: EmailConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }
}

#[async_trait]
impl MailSource for ImapMailSource {
    async fn fetch_unseen(&self) -> Result<Vec<FetchedEmail>, ChannelError> {
        let config = Arc::clone(&self.config);
        tokio::task::spawn_blocking(move || fetch_unseen_imap(&config))
            .await
            .map_err(|e| ChannelError::Protocol(format!("IMAP fetch task failed: {e}")))?
    }

    async fn mark_seen(&self, uids: &[u32]) -> Result<(), ChannelError> {
        if uids.is_empty() {
            return Ok(());
        }
        let config = Arc::clone(&self.config);
        let uids = uids.to_vec();
        tokio::task::spawn_blocking(move || mark_seen_imap(&config, &uids))
            .await
            .map_err(|e| ChannelError::Protocol(format!("IMAP store task failed: {e}")))?
    }
}

/// Fetch and parse every unseen message in the configured mailbox.
pub fn fetch_unseen_imap(config: &EmailConfig) -> Result<Vec<FetchedEmail>, ChannelError> {
    let mut session = connect(config)?;
    session.login(&config.username, config.password.expose_secret())?;
    session.select(&config.mailbox)?;

    let results = collect_unseen(&mut session)?;
    session.logout();
    Ok(results)
}

/// Fetch every unseen message on an open, selected session.
///
/// Messages that cannot be used (no body, unparseable) are marked `\Seen`
/// right away so later polls do not fetch them again.
pub fn collect_unseen<S: Read + Write>(
    session: &mut ImapSession<S>,
) -> Result<Vec<FetchedEmail>, ChannelError> {
    let uids = session.uid_search_unseen()?;
    debug!(count = uids.len(), "Unseen messages");

    let mut results = Vec::with_capacity(uids.len());
    let mut unusable = Vec::new();
    for uid in uids {
        match session.uid_fetch_body(uid)? {
            Some(raw) => match parse_message(uid, &raw) {
                Some(email) => results.push(email),
                None => {
                    debug!(uid, "Skipping unparseable message");
                    unusable.push(uid);
                }
            },
            None => {
                debug!(uid, "FETCH returned no body");
                unusable.push(uid);
            }
        }
    }

    if let Err(e) = session.uid_mark_seen(&unusable) {
        warn!(error = %e, uids = ?unusable, "Failed to mark unusable messages as seen");
    }
    Ok(results)
}

/// Set `\Seen` on the given UIDs.
pub fn mark_seen_imap(config: &EmailConfig, uids: &[u32]) -> Result<(), ChannelError> {
    let mut session = connect(config)?;
    session.login(&config.username, config.password.expose_secret())?;
    session.select(&config.mailbox)?;
    session.uid_mark_seen(uids)?;
    session.logout();
    Ok(())
}

/// Anything an IMAP session can run over.
pub trait ImapStream: Read + Write + Send {}

impl<T: Read + Write + Send> ImapStream for T {}

fn connect(config: &EmailConfig) -> Result<ImapSession<Box<dyn ImapStream>>, ChannelError> {
    let connect_err = |reason: String| ChannelError::Connect {
        host: format!("{}:{}", config.imap_host, config.imap_port),
        reason,
    };

    let tcp = TcpStream::connect((config.imap_host.as_str(), config.imap_port))
        .map_err(|e| connect_err(e.to_string()))?;
    tcp.set_read_timeout(Some(IMAP_IO_TIMEOUT))?;
    tcp.set_write_timeout(Some(IMAP_IO_TIMEOUT))?;

    let stream: Box<dyn ImapStream> = if config.imap_tls {
        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = rustls::ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .map_err(|e| connect_err(e.to_string()))?
        .with_root_certificates(root_store)
        .with_no_client_auth();
        let server_name = rustls_pki_types::ServerName::try_from(config.imap_host.clone())
            .map_err(|e| connect_err(e.to_string()))?;
        let conn = rustls::ClientConnection::new(Arc::new(tls_config), server_name)
            .map_err(|e| connect_err(e.to_string()))?;
        Box::new(rustls::StreamOwned::new(conn, tcp))
    } else {
        Box::new(tcp)
    };

    ImapSession::new(stream)
}

// ── IMAP session ────────────────────────────────────────────────────

/// One untagged response line, with any literals it carried.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Untagged {
    /// Line text with each literal replaced by its `{N}` marker.
    pub line: String,
    pub literals: Vec<Vec<u8>>,
}

/// Responses to one command.
#[derive(Debug, Clone, Default)]
pub struct Response {
    pub untagged: Vec<Untagged>,
    /// Tagged completion line, minus the tag.
    pub status: String,
}

impl Response {
    pub fn is_ok(&self) -> bool {
        self.status.starts_with("OK")
    }
}

/// Minimal blocking IMAP client over any byte stream.
pub struct ImapSession<S: Read + Write> {
    stream: BufReader<S>,
    next_tag: u32,
}

impl<S: Read + Write> ImapSession<S> {
    /// Wrap a connected stream and consume the server greeting.
    pub fn new(stream: S) -> Result<Self, ChannelError> {
        let mut session = Self {
            stream: BufReader::new(stream),
            next_tag: 1,
        };
        let greeting = session.read_line()?;
        if !(greeting.starts_with("* OK") || greeting.starts_with("* PREAUTH")) {
            return Err(ChannelError::Protocol(format!(
                "unexpected greeting: {}",
                greeting.trim_end()
            )));
        }
        Ok(session)
    }

    pub fn login(&mut self, username: &str, password: &str) -> Result<(), ChannelError> {
        let response = self.command(&format!("LOGIN {} {}", quote(username), quote(password)))?;
        if response.is_ok() {
            Ok(())
        } else {
            Err(ChannelError::AuthFailed {
                name: "imap".into(),
                reason: response.status,
            })
        }
    }

    pub fn select(&mut self, mailbox: &str) -> Result<(), ChannelError> {
        self.expect_ok(&format!("SELECT {}", quote(mailbox)))
            .map(|_| ())
    }

    pub fn uid_search_unseen(&mut self) -> Result<Vec<u32>, ChannelError> {
        let response = self.expect_ok("UID SEARCH UNSEEN")?;
        Ok(response
            .untagged
            .iter()
            .filter_map(|u| u.line.strip_prefix("* SEARCH"))
            .flat_map(|rest| rest.split_whitespace().filter_map(|n| n.parse().ok()))
            .collect())
    }

    /// Full message bytes without setting `\Seen`.
    pub fn uid_fetch_body(&mut self, uid: u32) -> Result<Option<Vec<u8>>, ChannelError> {
        let response = self.expect_ok(&format!("UID FETCH {uid} BODY.PEEK[]"))?;
        Ok(response
            .untagged
            .into_iter()
            .filter(|u| u.line.contains(" FETCH "))
            .find_map(|u| u.literals.into_iter().next()))
    }

    pub fn uid_mark_seen(&mut self, uids: &[u32]) -> Result<(), ChannelError> {
        if uids.is_empty() {
            return Ok(());
        }
        let set = uids
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(",");
        self.expect_ok(&format!("UID STORE {set} +FLAGS (\\Seen)"))
            .map(|_| ())
    }

    /// Best-effort LOGOUT; the connection is dropped either way.
    pub fn logout(&mut self) {
        if let Err(e) = self.command("LOGOUT") {
            debug!(error = %e, "IMAP logout failed");
        }
    }

    fn expect_ok(&mut self, cmd: &str) -> Result<Response, ChannelError> {
        let response = self.command(cmd)?;
        if response.is_ok() {
            Ok(response)
        } else {
            let verb = cmd.split_whitespace().take(2).collect::<Vec<_>>().join(" ");
            Err(ChannelError::Protocol(format!("{verb} failed: {}", response.status)))
        }
    }

    /// Send one tagged command and collect responses up to its completion.
    pub fn command(&mut self, cmd: &str) -> Result<Response, ChannelError> {
        let tag = format!("A{}", self.next_tag);
        self.next_tag += 1;

        let writer = self.stream.get_mut();
        writer.write_all(format!("{tag} {cmd}\r\n").as_bytes())?;
        writer.flush()?;

        let mut response = Response::default();
        let prefix = format!("{tag} ");
        loop {
            let line = self.read_line()?;
            if let Some(status) = line.strip_prefix(&prefix) {
                response.status = status.trim_end().to_string();
                return Ok(response);
            }
            if line.starts_with('+') {
                return Err(ChannelError::Protocol(
                    "unexpected continuation request".into(),
                ));
            }
            let untagged = self.read_literals(line)?;
            response.untagged.push(untagged);
        }
    }

    /// Complete a response line that announces literals (`{N}` at end of line).
    fn read_literals(&mut self, first: String) -> Result<Untagged, ChannelError> {
        let mut untagged = Untagged {
            line: String::new(),
            literals: Vec::new(),
        };
        let mut current = first;
        loop {
            let text = current.trim_end_matches(['\r', '\n']);
            untagged.line.push_str(text);
            match literal_len(text) {
                Some(len) => {
                    let mut literal = vec![0u8; len];
                    self.stream.read_exact(&mut literal)?;
                    untagged.literals.push(literal);
                    current = self.read_line()?;
                }
                None => return Ok(untagged),
            }
        }
    }

    fn read_line(&mut self) -> Result<String, ChannelError> {
        let mut buf = Vec::new();
        let n = self.stream.read_until(b'\n', &mut buf)?;
        if n == 0 {
            return Err(ChannelError::Protocol("IMAP connection closed".into()));
        }
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}

/// Size of a literal announced at the end of `line`, as in `... {123}`.
fn literal_len(line: &str) -> Option<usize> {
    let rest = line.strip_suffix('}')?;
    let open = rest.rfind('{')?;
    rest[open + 1..].trim_end_matches('+').parse().ok()
}

/// IMAP quoted string.
fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

// ── Parsing ─────────────────────────────────────────────────────────

/// Parse raw RFC 822 bytes into a `FetchedEmail`.
pub fn parse_message(uid: u32, raw: &[u8]) -> Option<FetchedEmail> {
    let parsed = MessageParser::default().parse(raw)?;
    let received_at = parsed
        .date()
        .and_then(|d| DateTime::<Utc>::from_timestamp(d.to_timestamp(), 0))
        .unwrap_or_else(Utc::now);

    Some(FetchedEmail {
        message_id: parsed
            .message_id()
            .map(|s| s.to_string())
            .unwrap_or_else(|| format!("gen-{}", Uuid::new_v4())),
        uid,
        from: extract_sender(&parsed),
        subject: parsed.subject().unwrap_or("(no subject)").to_string(),
        body: extract_text(&parsed),
        received_at,
    })
}

/// Extract the sender address from a parsed email.
fn extract_sender(parsed: &mail_parser::Message) -> String {
    parsed
        .from()
        .and_then(|addr| addr.first())
        .and_then(|a| a.address())
        .map(|s| s.to_string())
        .unwrap_or_else(|| "unknown".into())
}

/// Extract readable text from a parsed email.
fn extract_text(parsed: &mail_parser::Message) -> String {
    if let Some(text) = parsed.body_text(0) {
        return text.to_string();
    }
    if let Some(html) = parsed.body_html(0) {
        return strip_html(html.as_ref());
    }
    for part in parsed.attachments() {
        if let Some(ct) = MimeHeaders::content_type(part)
            && ct.ctype() == "text"
            && let Ok(text) = std::str::from_utf8(part.contents())
        {
            return text.to_string();
        }
    }
    String::new()
}

// ── Filtering ───────────────────────────────────────────────────────

/// Check if a sender email is in the allowlist.
///
/// - Empty list → deny all
/// - `*` in list → allow all
/// - `@domain.com` or `domain.com` → domain match
/// - `user@domain.com` → exact email match
pub fn is_sender_allowed(allowed: &[String], email: &str) -> bool {
    if allowed.is_empty() {
        return false;
    }
    if allowed.iter().any(|a| a == "*") {
        return true;
    }
    let email_lower = email.to_lowercase();
    allowed.iter().any(|a| {
        if a.starts_with('@') {
            email_lower.ends_with(&a.to_lowercase())
        } else if a.contains('@') {
            a.eq_ignore_ascii_case(email)
        } else {
            email_lower.ends_with(&format!("@{}", a.to_lowercase()))
        }
    })
}

/// Why a fetched message was not turned into a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// Sent from our own address.
    SelfSent,
    NotAllowed,
}

/// Source filter: `None` when the message should become a task.
pub fn rejection(config: &EmailConfig, sender: &str) -> Option<Rejection> {
    if !config.from_address.is_empty() && sender.eq_ignore_ascii_case(&config.from_address) {
        return Some(Rejection::SelfSent);
    }
    if !is_sender_allowed(&config.allowed_senders, sender) {
        return Some(Rejection::NotAllowed);
    }
    None
}

/// Strip HTML tags from content (basic).
pub fn strip_html(html: &str) -> String {
    let mut result = String::new();
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => result.push(ch),
            _ => {}
        }
    }
    result.split_whitespace().collect::<Vec<_>>().join(" ")
}

// ── SMTP ────────────────────────────────────────────────────────────

/// Send a plain-text email via SMTP. Blocking.
pub fn send_email(config: &EmailConfig, to: &str, subject: &str, body: &str) -> Result<(), ChannelError> {
    let send_err = |reason: String| ChannelError::SendFailed {
        name: "email".into(),
        reason,
    };

    let creds = Credentials::new(
        config.username.clone(),
        config.password.expose_secret().to_string(),
    );

    // 465 is implicit TLS; anything else upgrades with STARTTLS.
    let relay = if config.smtp_port == 465 {
        SmtpTransport::relay(&config.smtp_host)
    } else {
        SmtpTransport::starttls_relay(&config.smtp_host)
    };
    let builder = relay.map_err(|e| send_err(format!("SMTP relay error: {e}")))?;
    let transport = builder.port(config.smtp_port).credentials(creds).build();

    let email = Message::builder()
        .from(
            config
                .from_address
                .parse()
                .map_err(|e| send_err(format!("Invalid from address: {e}")))?,
        )
        .to(to
            .parse()
            .map_err(|e| send_err(format!("Invalid to address: {e}")))?)
        .subject(subject)
        .body(body.to_string())
        .map_err(|e| send_err(format!("Failed to build email: {e}")))?;

    transport
        .send(&email)
        .map_err(|e| send_err(format!("SMTP send failed: {e}")))?;

    info!(to, "Email sent");
    Ok(())
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Cursor;

    /// Scripted server: canned input, captured output.
    struct FakeStream {
        input: Cursor<Vec<u8>>,
        output: Vec<u8>,
    }

    impl FakeStream {
        fn new(script: &str) -> Self {
            Self {
                input: Cursor::new(script.as_bytes().to_vec()),
                output: Vec::new(),
            }
        }
    }

    impl Read for FakeStream {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for FakeStream {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.output.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn sent(session: ImapSession<FakeStream>) -> String {
        String::from_utf8(session.stream.into_inner().output).unwrap()
    }

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    // ── Config tests ────────────────────────────────────────────────

    #[test]
    fn config_disabled_without_host() {
        assert!(EmailConfig::from_lookup(lookup(&[])).unwrap().is_none());
    }

    #[test]
    fn config_defaults() {
        let config = EmailConfig::from_lookup(lookup(&[
            ("IMAP_HOST", "imap.example.com"),
            ("IMAP_USER", "agent@example.com"),
        ]))
        .unwrap()
        .unwrap();
        assert_eq!(config.imap_port, 993);
        assert!(config.imap_tls);
        assert_eq!(config.mailbox, "INBOX");
        assert_eq!(config.smtp_host, "smtp.example.com");
        assert_eq!(config.smtp_port, 587);
        assert_eq!(config.from_address, "agent@example.com");
        assert_eq!(config.poll_interval, Duration::from_secs(60));
        assert_eq!(config.allowed_senders, vec!["notifications@github.com"]);
    }

    #[test]
    fn config_rejects_bad_port() {
        let err = EmailConfig::from_lookup(lookup(&[("IMAP_HOST", "h"), ("IMAP_PORT", "x")])).unwrap_err();
        assert!(err.to_string().contains("IMAP_PORT"));
    }

    #[test]
    fn config_plain_tcp_and_senders() {
        let config = EmailConfig::from_lookup(lookup(&[
            ("IMAP_HOST", "localhost"),
            ("IMAP_TLS", "false"),
            ("EMAIL_ALLOWED_SENDERS", "@example.com, ops@corp.io"),
        ]))
        .unwrap()
        .unwrap();
        assert!(!config.imap_tls);
        assert_eq!(config.allowed_senders, vec!["@example.com", "ops@corp.io"]);
    }

    // ── Sender allowlist tests ──────────────────────────────────────

    #[test]
    fn allowlist_empty_denies_all() {
        assert!(!is_sender_allowed(&[], "anyone@example.com"));
    }

    #[test]
    fn allowlist_wildcard_allows_all() {
        let allowed = vec!["*".to_string()];
        assert!(is_sender_allowed(&allowed, "anyone@example.com"));
    }

    #[test]
    fn allowlist_exact_email_match() {
        let allowed = vec!["Notifications@GitHub.com".to_string()];
        assert!(is_sender_allowed(&allowed, "notifications@github.com"));
        assert!(!is_sender_allowed(&allowed, "noreply@github.com"));
    }

    #[test]
    fn allowlist_domain_forms() {
        let allowed = vec!["@example.com".to_string(), "corp.io".to_string()];
        assert!(is_sender_allowed(&allowed, "dev@example.com"));
        assert!(is_sender_allowed(&allowed, "ops@CORP.io"));
        assert!(!is_sender_allowed(&allowed, "dev@notcorp.io.evil"));
    }

    #[test]
    fn rejection_guards_self_loop() {
        let mut config = EmailConfig::from_lookup(lookup(&[("IMAP_HOST", "h")]))
            .unwrap()
            .unwrap();
        config.from_address = "agent@example.com".into();
        config.allowed_senders = vec!["*".into()];
        assert_eq!(rejection(&config, "Agent@Example.com"), Some(Rejection::SelfSent));
        assert_eq!(rejection(&config, "dev@example.com"), None);

        config.allowed_senders = vec!["notifications@github.com".into()];
        assert_eq!(rejection(&config, "dev@example.com"), Some(Rejection::NotAllowed));
    }

    // ── HTML ────────────────────────────────────────────────────────

    #[test]
    fn strip_html_basic() {
        assert_eq!(strip_html("<p>Hello <b>world</b></p>"), "Hello world");
        assert_eq!(strip_html(""), "");
    }

    // ── IMAP session tests ──────────────────────────────────────────

    #[test]
    fn literal_len_parsing() {
        assert_eq!(literal_len("* 1 FETCH (UID 7 BODY[] {42}"), Some(42));
        assert_eq!(literal_len("* 1 FETCH (BODY[] {42+}"), Some(42));
        assert_eq!(literal_len("* SEARCH 1 2"), None);
    }

    #[test]
    fn quote_escapes() {
        assert_eq!(quote(r#"pa"ss\word"#), r#""pa\"ss\\word""#);
    }

    #[test]
    fn rejects_bad_greeting() {
        let err = ImapSession::new(FakeStream::new("* BYE go away\r\n"))
            .err()
            .unwrap();
        assert!(err.to_string().contains("greeting"));
    }

    #[test]
    fn login_failure_is_auth_error() {
        let mut session = ImapSession::new(FakeStream::new(
            "* OK ready\r\nA1 NO [AUTHENTICATIONFAILED] Invalid credentials\r\n",
        ))
        .unwrap();
        let err = session.login("u", "p").unwrap_err();
        assert!(matches!(err, ChannelError::AuthFailed { .. }));
    }

    #[test]
    fn search_and_fetch_with_literal() {
        let message = "From: GitHub <notifications@github.com>\r\n\
                       Subject: [o/r] Crash on start (Issue #5)\r\n\
                       Message-ID: <abc@github.com>\r\n\
                       Date: Tue, 6 Jan 2026 10:00:00 +0000\r\n\
                       \r\n\
                       It crashes.\r\n";
        let script = format!(
            "* OK IMAP4rev1 ready\r\n\
             A1 OK LOGIN completed\r\n\
             * 3 EXISTS\r\nA2 OK [READ-WRITE] SELECT completed\r\n\
             * SEARCH 7 9\r\nA3 OK SEARCH completed\r\n\
             * 1 FETCH (UID 7 BODY[] {{{}}}\r\n{})\r\nA4 OK FETCH completed\r\n\
             A5 OK STORE completed\r\n",
            message.len(),
            message
        );
        let mut session = ImapSession::new(FakeStream::new(&script)).unwrap();
        session.login("agent", "secret").unwrap();
        session.select("INBOX").unwrap();
        assert_eq!(session.uid_search_unseen().unwrap(), vec![7, 9]);

        let raw = session.uid_fetch_body(7).unwrap().unwrap();
        let email = parse_message(7, &raw).unwrap();
        assert_eq!(email.from, "notifications@github.com");
        assert_eq!(email.subject, "[o/r] Crash on start (Issue #5)");
        assert_eq!(email.message_id, "abc@github.com");
        assert_eq!(email.body.trim(), "It crashes.");
        assert_eq!(email.received_at.to_rfc3339(), "2026-01-06T10:00:00+00:00");

        session.uid_mark_seen(&[7, 9]).unwrap();

        let out = sent(session);
        assert!(out.contains("A1 LOGIN \"agent\" \"secret\"\r\n"));
        assert!(out.contains("A2 SELECT \"INBOX\"\r\n"));
        assert!(out.contains("A3 UID SEARCH UNSEEN\r\n"));
        assert!(out.contains("A4 UID FETCH 7 BODY.PEEK[]\r\n"));
        assert!(out.contains("A5 UID STORE 7,9 +FLAGS (\\Seen)\r\n"));
    }

    #[test]
    fn messages_without_body_are_marked_seen() {
        let message = "From: notifications@github.com\r\n\
                       Subject: [o/r] Flaky test (Issue #8)\r\n\
                       Message-ID: <ok@github.com>\r\n\
                       \r\n\
                       Fails on CI.\r\n";
        let script = format!(
            "* OK ready\r\n\
             * SEARCH 8 9\r\nA1 OK SEARCH completed\r\n\
             * 1 FETCH (UID 8 BODY[] {{{}}}\r\n{})\r\nA2 OK FETCH completed\r\n\
             * 2 FETCH (UID 9 FLAGS ())\r\nA3 OK FETCH completed\r\n\
             A4 OK STORE completed\r\n",
            message.len(),
            message
        );
        let mut session = ImapSession::new(FakeStream::new(&script)).unwrap();

        let emails = collect_unseen(&mut session).unwrap();
        assert_eq!(emails.len(), 1);
        assert_eq!(emails[0].uid, 8);

        let out = sent(session);
        assert!(out.contains("A4 UID STORE 9 +FLAGS (\\Seen)\r\n"));
        assert!(!out.contains("UID STORE 8"));
    }

    #[test]
    fn nothing_to_store_when_every_message_parses() {
        let script = "* OK ready\r\n* SEARCH\r\nA1 OK SEARCH completed\r\n";
        let mut session = ImapSession::new(FakeStream::new(script)).unwrap();
        assert!(collect_unseen(&mut session).unwrap().is_empty());
        assert!(!sent(session).contains("STORE"));
    }

    #[test]
    fn failed_select_is_protocol_error() {
        let mut session = ImapSession::new(FakeStream::new(
            "* OK ready\r\nA1 NO Mailbox does not exist\r\n",
        ))
        .unwrap();
        let err = session.select("Missing").unwrap_err();
        assert!(err.to_string().contains("SELECT"));
    }

    #[test]
    fn closed_connection_is_error() {
        let mut session = ImapSession::new(FakeStream::new("* OK ready\r\n")).unwrap();
        assert!(session.command("NOOP").is_err());
    }
}
