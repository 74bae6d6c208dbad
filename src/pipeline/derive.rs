//! Turning an accepted mail into a `TaskContext`.

use std::path::PathBuf;
use std::sync::LazyLock;

use regex::Regex;

use crate::channels::email_types::FetchedEmail;
use crate::config::AgentConfig;

use super::types::TaskContext;

/// `[owner/repo] Title (Issue #12)` as sent by GitHub notifications.
static SUBJECT_REF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:(?i:re|fwd?):\s*)*\[([A-Za-z0-9_.-]+/[A-Za-z0-9_.-]+)\][^\n]*?\((?:Issue|PR) #(\d+)\)")
        .expect("valid subject regex")
});

/// Issue or pull request link in a message body.
static BODY_LINK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"https://github\.com/([A-Za-z0-9_.-]+/[A-Za-z0-9_.-]+)/(issues|pull)/(\d+)")
        .expect("valid link regex")
});

/// Repository and issue reference found in a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssueRef {
    /// `owner/repo`.
    pub repository: String,
    pub url: String,
}

/// Make a subject safe for a single-line prompt and environment variable.
pub fn normalize_subject(subject: &str) -> String {
    subject.replace('\r', "").replace('\n', "  ").trim().to_string()
}

/// Find the repository reference: body links first, then the subject.
pub fn find_issue_ref(subject: &str, body: &str) -> Option<IssueRef> {
    if let Some(caps) = BODY_LINK.captures(body) {
        return Some(IssueRef {
            repository: caps[1].to_string(),
            url: caps[0].to_string(),
        });
    }
    SUBJECT_REF.captures(subject).map(|caps| {
        let repository = caps[1].to_string();
        let is_pr = caps[0].contains("(PR #");
        let url = format!(
            "https://github.com/{repository}/{}/{}",
            if is_pr { "pull" } else { "issues" },
            &caps[2]
        );
        IssueRef { repository, url }
    })
}

/// Directory a task runs in.
///
/// A fixed project folder wins; otherwise a known repository maps to
/// `<workspace_root>/<owner>__<repo>`; otherwise the current directory.
/// The result is always absolute.
pub fn resolve_working_dir(config: &AgentConfig, repository: Option<&str>) -> PathBuf {
    let dir = match (&config.project_folder, &config.workspace_root, repository) {
        (Some(folder), _, _) => folder.clone(),
        (None, Some(root), Some(repo)) => root.join(repo.replace('/', "__")),
        _ => PathBuf::from("."),
    };
    absolute_dir(dir)
}

/// Anchor `path` at the current directory when it is relative.
pub fn absolute_dir(path: impl Into<PathBuf>) -> PathBuf {
    let path = path.into();
    std::path::absolute(&path).unwrap_or(path)
}

/// Build the task for one accepted mail.
pub fn task_from_email(email: &FetchedEmail, config: &AgentConfig) -> TaskContext {
    let subject = normalize_subject(&email.subject);
    let issue = find_issue_ref(&subject, &email.body);
    let working_dir = resolve_working_dir(config, issue.as_ref().map(|i| i.repository.as_str()));

    let prompt = if config.prompt_include_body && !email.body.trim().is_empty() {
        format!("{subject}\n\n{}", email.body.trim())
    } else {
        subject.clone()
    };

    let mut ctx = TaskContext::new(subject, working_dir)
        .with_prompt(prompt)
        .with_reply_to(email.from.clone())
        .with_received_at(email.received_at);
    if let Some(issue) = issue {
        ctx = ctx.with_repository(issue.repository).with_origin(issue.url);
    }
    ctx
}
