//! Header rewriting.
//!
//! The header block is replayed field by field: stale classification headers
//! are dropped, everything else is copied verbatim, and the new block is
//! inserted right after the first `Received` header. The body is copied as-is.

use crate::classify::{AddHeader, Verdict};
use crate::headers::{HeaderBlock, RECEIVED};
use anyhow::{anyhow, Result};

/// Header name prefixes owned by the classifier and by this rewriter.
pub const RESERVED_PREFIXES: [&str; 4] = ["x-spam", "x-rspam", "x-senderscore", "x-address-book"];

/// Verdict additions that duplicate what we synthesize ourselves.
const SKIP_ADD: [&str; 4] = [
    "X-Rspamd-Pre-Result",
    "X-Rspamd-Action",
    "X-Spamd-Bar",
    "X-Spamd-Result",
];

pub const SPAM_STATUS: &str = "X-Spam-Status";
pub const SPAM_SCORE: &str = "X-Spam-Score";
pub const SENDER_SCORE: &str = "X-SenderScore";
pub const ADDRESS_BOOK: &str = "X-Address-Book";
pub const SPAM_CLASS: &str = "X-Spam-Class";
pub const SPAM_FLAG: &str = "X-Spam";

const SYNTHESIZED: [&str; 6] = [
    SPAM_STATUS,
    SPAM_SCORE,
    SENDER_SCORE,
    ADDRESS_BOOK,
    SPAM_CLASS,
    SPAM_FLAG,
];

pub const SPAM_LABEL: &str = "spam";

const INDENT: &str = "    ";

/// Results of the auxiliary lookups made for one message.
#[derive(Debug, Clone)]
pub struct Lookups {
    pub reputation: u8,
    pub books: Vec<String>,
    pub class: String,
}

/// A header to insert, as physical lines without terminators.
#[derive(Debug, Clone, PartialEq)]
pub struct NewHeader {
    pub name: String,
    pub lines: Vec<String>,
}

impl NewHeader {
    fn single(name: &str, value: &str) -> Self {
        let value = value.replace(['\r', '\n'], " ");
        NewHeader {
            name: name.to_string(),
            lines: vec![format!("{name}: {}", value.trim())],
        }
    }
}

/// Changes to apply to one message.
#[derive(Debug, Clone)]
pub struct HeaderDelta {
    remove: Vec<String>,
    insert: Vec<NewHeader>,
}

impl HeaderDelta {
    pub fn new(verdict: &Verdict, lookups: &Lookups, max_line: usize) -> Self {
        let remove = verdict
            .milter
            .remove_headers
            .keys()
            .map(|name| name.to_ascii_lowercase())
            .collect();

        let mut added: Vec<(&String, &AddHeader)> = verdict
            .milter
            .add_headers
            .iter()
            .filter(|(name, _)| {
                !SKIP_ADD
                    .iter()
                    .chain(SYNTHESIZED.iter())
                    .any(|skip| skip.eq_ignore_ascii_case(name))
            })
            .collect();
        added.sort_by(|a, b| a.1.order.cmp(&b.1.order).then_with(|| a.0.cmp(b.0)));

        let mut insert: Vec<NewHeader> = added
            .into_iter()
            .map(|(name, header)| NewHeader::single(name, &header.value))
            .collect();

        let base = verdict.added_value(SPAM_STATUS).unwrap_or("");
        insert.push(NewHeader {
            name: SPAM_STATUS.to_string(),
            lines: format_status(base, verdict.required, &verdict.sorted_symbols(), max_line),
        });
        insert.push(NewHeader::single(
            SPAM_SCORE,
            &format!("{:.3} / {:.3}", verdict.score, verdict.required),
        ));
        insert.push(NewHeader::single(
            SENDER_SCORE,
            &lookups.reputation.to_string(),
        ));
        for book in &lookups.books {
            insert.push(NewHeader::single(ADDRESS_BOOK, book));
        }
        insert.push(NewHeader::single(SPAM_CLASS, &lookups.class));
        let flag = if lookups.class == SPAM_LABEL { "yes" } else { "no" };
        insert.push(NewHeader::single(SPAM_FLAG, flag));

        HeaderDelta { remove, insert }
    }

    /// Whether a header named `name` is dropped from the output.
    pub fn deletes(&self, name: &str) -> bool {
        if name.is_empty() {
            return false;
        }
        let lower = name.to_ascii_lowercase();
        self.remove.contains(&lower) || RESERVED_PREFIXES.iter().any(|p| lower.starts_with(p))
    }

    pub fn inserted(&self) -> &[NewHeader] {
        &self.insert
    }
}

/// `X-Spam-Status` as physical lines no longer than `max_line` where tokens allow.
///
/// The first line carries the service status and the threshold; the symbols
/// follow as `tests[A=1.000, B=2.000]`, wrapped between entries with a trailing
/// comma kept within the limit.
pub fn format_status(base: &str, required: f64, symbols: &[(&str, f64)], max_line: usize) -> Vec<String> {
    let mut lines = Vec::new();

    let mut line = format!("{SPAM_STATUS}:");
    let required = format!("required={required:.3}");
    for word in base.split_whitespace().chain(std::iter::once(required.as_str())) {
        if line.len() + 1 + word.len() > max_line && line.len() > SPAM_STATUS.len() + 1 {
            lines.push(std::mem::replace(&mut line, format!("{INDENT}{word}")));
        } else {
            line.push(' ');
            line.push_str(word);
        }
    }
    lines.push(line);

    let opening = format!("{INDENT}tests[");
    let mut line = opening.clone();
    let mut delim = "";
    for (name, score) in symbols {
        let token = format!("{name}={score:.3}");
        // one column is kept for the trailing ',' or ']'
        if line.len() + delim.len() + token.len() + 1 > max_line && line != opening {
            line.push(',');
            lines.push(std::mem::replace(&mut line, format!("{INDENT}{token}")));
        } else {
            line.push_str(delim);
            line.push_str(&token);
        }
        delim = ", ";
    }
    line.push(']');
    lines.push(line);
    lines
}

/// Apply `delta` to `message`, returning the rewritten bytes.
///
/// Fails when the header block has no `Received` header to anchor the
/// inserted block.
pub fn rewrite(message: &[u8], delta: &HeaderDelta) -> Result<Vec<u8>> {
    let headers = HeaderBlock::parse(message);
    let eol = headers.terminator();
    let mut out = Vec::with_capacity(message.len() + 1024);
    let mut consumed = 0;
    let mut inserted = false;

    for field in headers.fields() {
        let length: usize = field.lines().iter().map(|line| line.len()).sum();
        consumed += length;

        if delta.deletes(field.name()) {
            log::debug!("deleting: {}", field.name());
        } else {
            for line in field.lines() {
                out.extend_from_slice(line);
            }
        }

        if !inserted && field.is(RECEIVED) {
            if !field.lines().last().map_or(false, |l| l.ends_with(b"\n")) {
                out.extend_from_slice(eol.as_bytes());
            }
            for header in delta.inserted() {
                for line in &header.lines {
                    log::debug!("adding: {line}");
                    out.extend_from_slice(line.as_bytes());
                    out.extend_from_slice(eol.as_bytes());
                }
            }
            inserted = true;
        }
    }

    if !inserted {
        return Err(anyhow!("no {RECEIVED} header found in header block"));
    }

    out.extend_from_slice(&message[consumed..]);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verdict(json: &str) -> Verdict {
        serde_json::from_str(json).unwrap()
    }

    fn lookups() -> Lookups {
        Lookups {
            reputation: 87,
            books: vec!["friends".to_string()],
            class: "ham".to_string(),
        }
    }

    const VERDICT: &str = r#"{
        "score": 8.2, "required_score": 6.0,
        "symbols": {"SPAM_A": {"name": "SPAM_A", "score": 3.0}},
        "milter": {
            "add_headers": {
                "X-Foo": {"value": "bar", "order": 1},
                "X-Spamd-Result": {"value": "default: False", "order": 0},
                "X-Spam-Status": {"value": "Yes, score=8.20", "order": 0}
            },
            "remove_headers": {"X-Old-Header": 1}
        }
    }"#;

    const MESSAGE: &str = "Return-Path: <bob@example.net>\n\
Received: from mx.example.org by mx.example.org\n\
\twith LMTP; Mon, 1 Jan 2024 00:00:00 +0000\n\
Received: from mail.example.net ([203.0.113.9]) by mx.example.org\n\
X-Old-Header: stale\n\
X-Spam-Status: No, score=1.0\n\
X-SenderScore: 12\n\
From: bob@example.net\n\
Subject: hello\n\
\n\
X-Spam-Status: in the body\n\
Received: also in the body\n";

    #[test]
    fn test_deletion_policy() {
        let delta = HeaderDelta::new(&verdict(VERDICT), &lookups(), 75);
        assert!(delta.deletes("x-old-header"));
        assert!(delta.deletes("X-OLD-HEADER"));
        assert!(delta.deletes("X-Spam-Level"));
        assert!(delta.deletes("X-Rspamd-Queue-Id"));
        assert!(delta.deletes("X-SenderScore"));
        assert!(delta.deletes("X-Address-Book"));
        assert!(!delta.deletes("Received"));
        assert!(!delta.deletes(""));
    }

    #[test]
    fn test_verdict_removal_is_case_insensitive() {
        let v = verdict(r#"{"score": 0, "required_score": 5, "milter": {"remove_headers": {"x-mailer": 1}}}"#);
        let delta = HeaderDelta::new(&v, &lookups(), 75);
        assert!(delta.deletes("X-Mailer"));
    }

    #[test]
    fn test_inserted_headers() {
        let delta = HeaderDelta::new(&verdict(VERDICT), &lookups(), 75);
        let names: Vec<&str> = delta.inserted().iter().map(|h| h.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "X-Foo",
                SPAM_STATUS,
                SPAM_SCORE,
                SENDER_SCORE,
                ADDRESS_BOOK,
                SPAM_CLASS,
                SPAM_FLAG
            ]
        );
        assert_eq!(
            delta.inserted()[1].lines,
            vec![
                "X-Spam-Status: Yes, score=8.20 required=6.000".to_string(),
                "    tests[SPAM_A=3.000]".to_string()
            ]
        );
        assert_eq!(delta.inserted()[2].lines, vec!["X-Spam-Score: 8.200 / 6.000"]);
        assert_eq!(delta.inserted()[3].lines, vec!["X-SenderScore: 87"]);
        assert_eq!(delta.inserted()[4].lines, vec!["X-Address-Book: friends"]);
        assert_eq!(delta.inserted()[6].lines, vec!["X-Spam: no"]);
    }

    #[test]
    fn test_spam_flag_follows_class() {
        let spam = Lookups {
            class: "spam".to_string(),
            ..lookups()
        };
        let delta = HeaderDelta::new(&verdict(VERDICT), &spam, 75);
        assert_eq!(delta.inserted().last().unwrap().lines, vec!["X-Spam: yes"]);

        let almost = Lookups {
            class: "Spam".to_string(),
            ..lookups()
        };
        let delta = HeaderDelta::new(&verdict(VERDICT), &almost, 75);
        assert_eq!(delta.inserted().last().unwrap().lines, vec!["X-Spam: no"]);
    }

    #[test]
    fn test_symbols_sorted_by_name() {
        let lines = format_status("", 5.0, &[("AWL", -0.5), ("BAYES_SPAM", 4.5)], 75);
        assert_eq!(lines[1], "    tests[AWL=-0.500, BAYES_SPAM=4.500]");

        let v = verdict(
            r#"{"score": 4.0, "required_score": 5.0, "symbols": {
                "BAYES_SPAM": {"name": "BAYES_SPAM", "score": 4.5},
                "AWL": {"name": "AWL", "score": -0.5}}}"#,
        );
        let delta = HeaderDelta::new(&v, &lookups(), 75);
        let status = &delta.inserted()[0];
        assert_eq!(status.name, SPAM_STATUS);
        assert_eq!(status.lines[0], "X-Spam-Status: required=5.000");
        assert_eq!(status.lines[1], "    tests[AWL=-0.500, BAYES_SPAM=4.500]");
    }

    #[test]
    fn test_status_wrapping() {
        let names: Vec<String> = (0..20).map(|i| format!("SYMBOL_NUMBER_{i:02}")).collect();
        let symbols: Vec<(&str, f64)> = names.iter().map(|n| (n.as_str(), 1.25)).collect();
        let base = "Yes, score=25.00 with a rather long status text that needs wrapping too";
        let max = 60;
        let lines = format_status(base, 6.0, &symbols, max);

        assert!(lines.len() > 4);
        for line in &lines {
            assert!(line.len() <= max, "line too long: {line:?}");
        }
        for line in &lines[1..] {
            assert!(line.starts_with(INDENT));
        }
        let joined = lines.join("\n");
        for name in &names {
            assert!(joined.contains(&format!("{name}=1.250")), "{name} split");
        }
        let tests_start = lines.iter().position(|l| l.contains("tests[")).unwrap();
        for line in &lines[tests_start..lines.len() - 1] {
            assert!(line.ends_with(','), "{line:?}");
        }
        assert!(lines.last().unwrap().ends_with(']'));
    }

    #[test]
    fn test_empty_symbol_list() {
        let lines = format_status("No", 5.0, &[], 75);
        assert_eq!(lines, vec!["X-Spam-Status: No required=5.000", "    tests[]"]);
    }

    #[test]
    fn test_rewrite_inserts_after_first_received() {
        let delta = HeaderDelta::new(&verdict(VERDICT), &lookups(), 75);
        let out = rewrite(MESSAGE.as_bytes(), &delta).unwrap();
        let out = String::from_utf8(out).unwrap();

        let expected = "Return-Path: <bob@example.net>\n\
Received: from mx.example.org by mx.example.org\n\
\twith LMTP; Mon, 1 Jan 2024 00:00:00 +0000\n\
X-Foo: bar\n\
X-Spam-Status: Yes, score=8.20 required=6.000\n\
\x20   tests[SPAM_A=3.000]\n\
X-Spam-Score: 8.200 / 6.000\n\
X-SenderScore: 87\n\
X-Address-Book: friends\n\
X-Spam-Class: ham\n\
X-Spam: no\n\
Received: from mail.example.net ([203.0.113.9]) by mx.example.org\n\
From: bob@example.net\n\
Subject: hello\n\
\n\
X-Spam-Status: in the body\n\
Received: also in the body\n";
        assert_eq!(out, expected);
    }

    #[test]
    fn test_rewrite_is_idempotent() {
        let v = verdict(
            r#"{"score": 2.5, "required_score": 6.0,
                "symbols": {"AWL": {"name": "AWL", "score": -0.5}},
                "milter": {"add_headers": {
                    "X-Rspamd-Server": {"value": "mx", "order": 0},
                    "X-Spam-Level": {"value": "**", "order": 1}}}}"#,
        );
        let delta = HeaderDelta::new(&v, &lookups(), 75);
        let once = rewrite(MESSAGE.as_bytes(), &delta).unwrap();
        let twice = rewrite(&once, &delta).unwrap();
        assert_eq!(once, twice);

        let text = String::from_utf8(twice).unwrap();
        let (header, _) = text.split_once("\n\n").unwrap();
        assert_eq!(header.matches("X-Spam-Status:").count(), 1);
        assert_eq!(header.matches("X-SenderScore:").count(), 1);
        assert_eq!(header.matches("X-Rspamd-Server:").count(), 1);
    }

    #[test]
    fn test_rewrite_keeps_crlf() {
        let message = b"Received: a\r\nReceived: b\r\nSubject: x\r\n\r\nbody\r\n";
        let delta = HeaderDelta::new(&verdict(VERDICT), &lookups(), 75);
        let out = rewrite(message, &delta).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("Received: a\r\nX-Foo: bar\r\nX-Spam-Status: "));
        assert!(text.ends_with("Received: b\r\nSubject: x\r\n\r\nbody\r\n"));
        assert!(!text.replace("\r\n", "").contains('\n'));
    }

    #[test]
    fn test_rewrite_copies_non_utf8_body() {
        let mut message = b"Received: a\nSubject: x\n\n".to_vec();
        message.extend_from_slice(&[0xff, 0xfe, b'\n']);
        let delta = HeaderDelta::new(&verdict(VERDICT), &lookups(), 75);
        let out = rewrite(&message, &delta).unwrap();
        assert!(out.ends_with(&[b'\n', 0xff, 0xfe, b'\n']));
    }

    #[test]
    fn test_rewrite_without_received_fails() {
        let delta = HeaderDelta::new(&verdict(VERDICT), &lookups(), 75);
        let err = rewrite(b"Subject: x\n\nReceived: body\n", &delta).unwrap_err();
        assert!(err.to_string().contains("Received"));
    }
}
