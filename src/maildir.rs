use crate::error::RescanError;
use crate::headers::{normalize_message_id, HeaderBlock};
use std::collections::HashSet;
use std::fs::{self, File, Metadata};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

pub const INBOX: &str = "INBOX";
pub const CUR: &str = "cur";
/// Maildir++ folder delimiter
pub const DELIMITER: char = '.';

/// A candidate message found in a `cur` directory.
#[derive(Debug, Clone)]
pub struct MessageFile {
    pub id: Option<String>,
    pub path: PathBuf,
    pub metadata: Metadata,
}

/// Maps account + folder names onto Maildir++ directories below a mail root.
#[derive(Debug, Clone)]
pub struct MailboxResolver {
    mail_root: PathBuf,
    maildir_name: String,
}

impl MailboxResolver {
    pub fn new(mail_root: impl Into<PathBuf>, maildir_name: impl Into<String>) -> Self {
        Self {
            mail_root: mail_root.into(),
            maildir_name: maildir_name.into(),
        }
    }

    /// Directory holding the current messages of `folder` for `account`.
    ///
    /// `alice@example.org` + `/INBOX` resolves to `<root>/alice/Maildir/cur`,
    /// `/lists/a/b` to `<root>/alice/Maildir/.lists.a.b/cur`.
    pub fn resolve(&self, account: &str, folder: &str) -> Result<PathBuf, RescanError> {
        let user = account_user(account)?;
        let mut path = self.mail_root.join(user).join(&self.maildir_name);

        let trimmed = folder.trim_matches('/');
        if trimmed != INBOX && !trimmed.is_empty() {
            let mut name = String::with_capacity(trimmed.len() + 1);
            name.push(DELIMITER);
            name.push_str(&trimmed.replace('/', &DELIMITER.to_string()));
            path.push(name);
        }
        path.push(CUR);

        log::debug!("Resolved folder: user={user} folder={folder} path={}", path.display());
        Ok(path)
    }
}

/// Local part of an account address.
pub fn account_user(account: &str) -> Result<&str, RescanError> {
    match account.split_once('@') {
        Some((user, domain))
            if !user.is_empty()
                && !domain.is_empty()
                && !user.contains('/')
                && user != "."
                && user != ".." =>
        {
            Ok(user)
        }
        _ => Err(RescanError::InvalidAccount(account.to_string())),
    }
}

/// List the message files in `dir`, optionally only those whose Message-Id is in `ids`.
///
/// Without ids every regular file is returned in directory order. With ids the
/// directory is searched in the same order until every id has been seen; a
/// candidate without a usable Message-Id aborts the search.
pub fn scan_message_files(dir: &Path, ids: &[String]) -> Result<Vec<MessageFile>, RescanError> {
    let read_dir_error = |source| RescanError::ReadDirectory {
        path: dir.to_path_buf(),
        source,
    };
    let entries = fs::read_dir(dir).map_err(read_dir_error)?;

    let mut remaining: HashSet<&str> = ids.iter().map(String::as_str).collect();
    let restricted = !remaining.is_empty();
    let mut files = Vec::new();

    for entry in entries {
        if restricted && remaining.is_empty() {
            break;
        }
        let entry = entry.map_err(read_dir_error)?;
        let metadata = entry.metadata().map_err(read_dir_error)?;
        if !metadata.is_file() {
            continue;
        }
        let path = entry.path();

        if !restricted {
            files.push(MessageFile {
                id: None,
                path,
                metadata,
            });
            continue;
        }

        let id = read_message_id(&path)?;
        if remaining.remove(id.as_str()) {
            files.push(MessageFile {
                id: Some(id),
                path,
                metadata,
            });
        }
    }

    log::debug!("Scanned {}: {} message files", dir.display(), files.len());
    for (i, file) in files.iter().enumerate() {
        log::debug!("  [{i}] {} id={:?}", file.path.display(), file.id);
    }
    if !remaining.is_empty() {
        log::warn!(
            "{} requested Message-Ids not found in {}",
            remaining.len(),
            dir.display()
        );
    }
    Ok(files)
}

/// Read just the header block of `path` and return its normalised Message-Id.
pub fn read_message_id(path: &Path) -> Result<String, RescanError> {
    let bad = |reason: String| RescanError::MessageId {
        path: path.to_path_buf(),
        reason,
    };
    let file = File::open(path).map_err(|e| bad(format!("failed opening file: {e}")))?;
    let mut reader = BufReader::new(file);

    let mut header = Vec::new();
    loop {
        let start = header.len();
        let read = reader
            .read_until(b'\n', &mut header)
            .map_err(|e| bad(format!("failed reading header: {e}")))?;
        if read == 0 || header[start..].iter().all(|b| matches!(b, b'\r' | b'\n')) {
            break;
        }
    }

    let block = HeaderBlock::parse(&header);
    let value = block
        .get("Message-Id")
        .ok_or_else(|| bad("Message-Id header not found".to_string()))?;
    let id = normalize_message_id(&value)
        .ok_or_else(|| bad(format!("failed parsing Message-Id header: '{value}'")))?;
    log::debug!("Message-Id of {}: {id}", path.display());
    Ok(id)
}
