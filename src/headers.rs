//! Raw header block scanning.
//!
//! Messages are handled as bytes: the header block is split into fields
//! that keep their original physical lines (terminators included), and the
//! body is never decoded.

use anyhow::{anyhow, Result};
use lazy_static::lazy_static;
use regex::Regex;
use std::net::Ipv4Addr;

lazy_static! {
    static ref ADDR_PATTERN: Regex = Regex::new(r"^.*<([^>]*)>.*$").unwrap();
    static ref EMAIL_PATTERN: Regex =
        Regex::new(r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$").unwrap();
    static ref RECEIVED_IP_PATTERN: Regex =
        Regex::new(r"^[^\[]*\[([0-9]+\.[0-9]+\.[0-9]+\.[0-9]+)\]").unwrap();
}

pub const RECEIVED: &str = "Received";

/// One header field with its physical lines, continuation lines included.
#[derive(Debug, Clone)]
pub struct HeaderField<'a> {
    name: String,
    lines: Vec<&'a [u8]>,
}

impl<'a> HeaderField<'a> {
    fn start(line: &'a [u8]) -> Self {
        let name = match line.iter().position(|&b| b == b':') {
            Some(colon) => String::from_utf8_lossy(&line[..colon]).trim().to_string(),
            None => String::new(),
        };
        HeaderField {
            name,
            lines: vec![line],
        }
    }

    /// A whitespace-led line with no field to continue.
    fn orphan(line: &'a [u8]) -> Self {
        HeaderField {
            name: String::new(),
            lines: vec![line],
        }
    }

    /// Field name as written; empty for lines that carry no `name:` prefix.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is(&self, name: &str) -> bool {
        !self.name.is_empty() && self.name.eq_ignore_ascii_case(name)
    }

    pub fn lines(&self) -> &[&'a [u8]] {
        &self.lines
    }

    /// Unfolded value with surrounding whitespace trimmed.
    pub fn value(&self) -> String {
        let mut raw: Vec<u8> = Vec::new();
        for (i, line) in self.lines.iter().enumerate() {
            let mut line = strip_terminator(line);
            if i == 0 && !self.name.is_empty() {
                line = match line.iter().position(|&b| b == b':') {
                    Some(colon) => &line[colon + 1..],
                    None => line,
                };
            }
            raw.extend_from_slice(line);
        }
        String::from_utf8_lossy(&raw).trim().to_string()
    }
}

/// The header block of a message and where its body starts.
#[derive(Debug, Clone)]
pub struct HeaderBlock<'a> {
    fields: Vec<HeaderField<'a>>,
    body_offset: usize,
    terminator: &'static str,
}

impl<'a> HeaderBlock<'a> {
    /// Split `message` into header fields, consuming the blank separator line.
    ///
    /// A line starting with anything but whitespace begins a new field; a
    /// whitespace-led line continues the current one. Input without a blank
    /// line is all headers.
    pub fn parse(message: &'a [u8]) -> Self {
        let mut fields: Vec<HeaderField<'a>> = Vec::new();
        let mut current: Option<HeaderField<'a>> = None;
        let mut offset = 0;
        let mut terminator = "\n";

        for (index, line) in message.split_inclusive(|&b| b == b'\n').enumerate() {
            if index == 0 && line.ends_with(b"\r\n") {
                terminator = "\r\n";
            }
            offset += line.len();

            if strip_terminator(line).is_empty() {
                fields.extend(current.take());
                return HeaderBlock {
                    fields,
                    body_offset: offset,
                    terminator,
                };
            }

            match line[0] {
                b' ' | b'\t' => match current.as_mut() {
                    Some(field) => field.lines.push(line),
                    None => current = Some(HeaderField::orphan(line)),
                },
                _ => {
                    fields.extend(current.take());
                    current = Some(HeaderField::start(line));
                }
            }
        }

        fields.extend(current);
        HeaderBlock {
            fields,
            body_offset: offset,
            terminator,
        }
    }

    pub fn fields(&self) -> &[HeaderField<'a>] {
        &self.fields
    }

    /// Offset of the first body byte; equals the message length when there is no body.
    pub fn body_offset(&self) -> usize {
        self.body_offset
    }

    /// Line terminator used by the message, taken from its first line.
    pub fn terminator(&self) -> &'static str {
        self.terminator
    }

    /// First value of the named header, case-insensitive.
    pub fn get(&self, name: &str) -> Option<String> {
        self.fields.iter().find(|f| f.is(name)).map(|f| f.value())
    }

    pub fn all(&self, name: &str) -> Vec<String> {
        self.fields
            .iter()
            .filter(|f| f.is(name))
            .map(|f| f.value())
            .collect()
    }
}

/// Envelope facts recovered from a delivered message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingContext {
    pub from: String,
    pub rcpt: String,
    pub delivered_to: String,
    pub sender_ip: Ipv4Addr,
}

impl RoutingContext {
    pub fn from_headers(headers: &HeaderBlock<'_>) -> Result<Self> {
        let context = RoutingContext {
            from: header_address(headers, "From")?,
            rcpt: header_address(headers, "To")?,
            delivered_to: header_address(headers, "Delivered-To")?,
            sender_ip: sender_ip(headers)?,
        };
        log::debug!("Routing context: {context:?}");
        Ok(context)
    }
}

fn header_address(headers: &HeaderBlock<'_>, name: &str) -> Result<String> {
    let value = headers
        .get(name)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| anyhow!("header not found: {name}"))?;
    parse_address(&value)
        .or_else(|first| {
            // address lists: the first usable entry wins
            value
                .split(',')
                .find_map(|part| parse_address(part).ok())
                .ok_or(first)
        })
        .map_err(|e| anyhow!("failed parsing {name} header: {e}"))
}

/// Pull the bare address out of `Name <addr>` or a plain address.
pub fn parse_address(value: &str) -> Result<String> {
    let mut address = value.trim();
    if address.contains('<') {
        address = ADDR_PATTERN
            .captures(address)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().trim())
            .ok_or_else(|| anyhow!("failed parsing address from: '{value}'"))?;
    }
    if !EMAIL_PATTERN.is_match(address) {
        return Err(anyhow!("invalid address: '{address}'"));
    }
    Ok(address.to_string())
}

/// Sender IP from the second `Received` header, the hop where our MX accepted the message.
pub fn sender_ip(headers: &HeaderBlock<'_>) -> Result<Ipv4Addr> {
    let received = headers.all(RECEIVED);
    if received.len() < 2 {
        return Err(anyhow!(
            "insufficient Received headers: found {}",
            received.len()
        ));
    }
    let hop = &received[1];
    let addr = RECEIVED_IP_PATTERN
        .captures(hop)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<Ipv4Addr>().ok())
        .ok_or_else(|| anyhow!("failed parsing IP address from: '{hop}'"))?;
    log::debug!("Sender IP: {addr}");
    Ok(addr)
}

/// Message-Id normalised the way the locator matches it.
pub fn normalize_message_id(value: &str) -> Option<String> {
    let id = value
        .trim()
        .trim_start_matches('<')
        .trim_end_matches('>')
        .trim();
    if id.is_empty() {
        None
    } else {
        Some(id.to_string())
    }
}

pub fn strip_terminator(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}
