// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Conversions from raw IMAP data (envelopes, body structures, RFC 822
//! messages) into the cache's shapes.

use async_imap::imap_proto::types::{
    Address, BodyContentCommon, BodyContentSinglePart, BodyStructure, ContentEncoding, Envelope,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Utc};
use mail_parser::{Message, PartType};
use regex::Regex;

use crate::imap::types::{Attachment, MessageBody, MessageMeta};
use crate::utils::mime_decoder::{decode_mime_header, decode_quoted_printable};

pub const SNIPPET_LEN: usize = 200;

lazy_static::lazy_static! {
    static ref STYLE_RE: Regex = Regex::new(r"(?is)<style[^>]*>.*?</style>").expect("style pattern");
    static ref SCRIPT_RE: Regex = Regex::new(r"(?is)<script[^>]*>.*?</script>").expect("script pattern");
    static ref TAG_RE: Regex = Regex::new(r"(?s)<[^>]*>").expect("tag pattern");
    static ref SPACE_RE: Regex = Regex::new(r"\s+").expect("space pattern");
}

/// Parses a full message into displayable HTML plus a snippet.
///
/// An HTML part wins. Plain text is escaped and wrapped so it renders with
/// its line breaks intact.
pub fn parse_body(raw: &[u8]) -> MessageBody {
    let message = match Message::parse(raw) {
        Some(message) => message,
        None => {
            let text = String::from_utf8_lossy(raw);
            return MessageBody { html: wrap_plain_text(&text), snippet: snippet(&text, false) };
        }
    };

    if let Some(html) = first_html_part(&message) {
        return MessageBody { snippet: snippet(&html, true), html };
    }

    let text = message.body_text(0).map(|t| t.into_owned()).unwrap_or_default();
    MessageBody { html: wrap_plain_text(&text), snippet: snippet(&text, false) }
}

fn first_html_part(message: &Message<'_>) -> Option<String> {
    message.html_body.iter().find_map(|id| {
        match message.parts.get(*id as usize).map(|p| &p.body) {
            Some(PartType::Html(html)) => Some(html.to_string()),
            _ => None,
        }
    })
}

pub fn wrap_plain_text(text: &str) -> String {
    format!(
        "<pre style=\"white-space: pre-wrap; font-family: inherit;\">{}</pre>",
        escape_html(text)
    )
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

pub fn strip_html(html: &str) -> String {
    let without_style = STYLE_RE.replace_all(html, " ");
    let without_script = SCRIPT_RE.replace_all(&without_style, " ");
    let text = TAG_RE.replace_all(&without_script, " ");
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

/// Single-line preview of at most `SNIPPET_LEN` characters, `...` appended
/// when cut.
pub fn snippet(content: &str, is_html: bool) -> String {
    let text = if is_html { strip_html(content) } else { content.to_string() };
    let collapsed = SPACE_RE.replace_all(text.trim(), " ");
    if collapsed.chars().count() > SNIPPET_LEN {
        let cut: String = collapsed.chars().take(SNIPPET_LEN).collect();
        format!("{}...", cut.trim_end())
    } else {
        collapsed.into_owned()
    }
}

/// Fills the envelope-derived fields of `meta`.
pub fn apply_envelope(meta: &mut MessageMeta, envelope: &Envelope<'_>) {
    meta.subject = header_text(envelope.subject.as_deref());
    meta.message_id = header_text(envelope.message_id.as_deref());
    meta.references = header_text(envelope.in_reply_to.as_deref());
    meta.date = parse_header_date(envelope.date.as_deref());
    meta.from = envelope
        .from
        .as_deref()
        .and_then(|list| list.first())
        .map(format_mailbox)
        .unwrap_or_default();
    meta.reply_to = address_list(envelope.reply_to.as_deref());
    meta.to = address_list(envelope.to.as_deref());
}

fn header_text(raw: Option<&[u8]>) -> String {
    raw.map(|b| decode_mime_header(String::from_utf8_lossy(b).trim()))
        .unwrap_or_default()
}

fn address_spec(address: &Address<'_>) -> String {
    let mailbox = address.mailbox.as_deref().map(String::from_utf8_lossy).unwrap_or_default();
    let host = address.host.as_deref().map(String::from_utf8_lossy).unwrap_or_default();
    if host.is_empty() {
        mailbox.into_owned()
    } else {
        format!("{}@{}", mailbox, host)
    }
}

/// `Name <mailbox@host>`, or the bare address when there is no name.
fn format_mailbox(address: &Address<'_>) -> String {
    let spec = address_spec(address);
    let name = header_text(address.name.as_deref());
    if name.is_empty() {
        spec
    } else {
        format!("{} <{}>", name, spec)
    }
}

fn address_list(list: Option<&[Address<'_>]>) -> String {
    list.map(|addresses| {
        addresses
            .iter()
            .map(address_spec)
            .filter(|a| !a.is_empty())
            .collect::<Vec<_>>()
            .join(", ")
    })
    .unwrap_or_default()
}

pub fn parse_header_date(raw: Option<&[u8]>) -> Option<DateTime<Utc>> {
    let text = String::from_utf8_lossy(raw?).trim().to_string();
    // Trailing zone comments such as "(UTC)" are not accepted by the parser.
    let text = match text.find(" (") {
        Some(idx) => text[..idx].to_string(),
        None => text,
    };
    DateTime::parse_from_rfc2822(&text)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

/// Attachment metadata from a BODYSTRUCTURE tree, with IMAP section paths
/// as part ids.
pub fn collect_attachments(structure: &BodyStructure<'_>) -> Vec<Attachment> {
    let mut out = Vec::new();
    walk_structure(structure, "", &mut out);
    out
}

fn walk_structure(structure: &BodyStructure<'_>, path: &str, out: &mut Vec<Attachment>) {
    match structure {
        BodyStructure::Multipart { bodies, .. } => {
            for (i, part) in bodies.iter().enumerate() {
                let child = if path.is_empty() {
                    (i + 1).to_string()
                } else {
                    format!("{}.{}", path, i + 1)
                };
                walk_structure(part, &child, out);
            }
        }
        BodyStructure::Basic { common, other, .. }
        | BodyStructure::Text { common, other, .. }
        | BodyStructure::Message { common, other, .. } => {
            let part_id = if path.is_empty() { "1".to_string() } else { path.to_string() };
            if let Some(attachment) = attachment_from_part(common, other, part_id) {
                out.push(attachment);
            }
        }
    }
}

fn attachment_from_part(
    common: &BodyContentCommon<'_>,
    other: &BodyContentSinglePart<'_>,
    part_id: String,
) -> Option<Attachment> {
    let content_type = format!("{}/{}", common.ty.ty, common.ty.subtype).to_ascii_lowercase();
    let disposition = common.disposition.as_ref();
    let explicit = disposition
        .map(|d| d.ty.eq_ignore_ascii_case("attachment"))
        .unwrap_or(false);
    let filename = disposition
        .and_then(|d| param(d.params.as_ref(), "filename"))
        .or_else(|| param(common.ty.params.as_ref(), "name"))
        .map(|f| decode_mime_header(&f))
        .unwrap_or_default();

    if !explicit && (filename.is_empty() || content_type.starts_with("text/")) {
        return None;
    }

    Some(Attachment {
        part_id,
        filename,
        content_type,
        size: other.octets,
        encoding: encoding_name(&other.transfer_encoding),
    })
}

fn param<K: AsRef<str>, V: AsRef<str>>(params: Option<&Vec<(K, V)>>, key: &str) -> Option<String> {
    params?
        .iter()
        .find(|(k, _)| k.as_ref().eq_ignore_ascii_case(key))
        .map(|(_, v)| v.as_ref().to_string())
}

fn encoding_name(encoding: &ContentEncoding<'_>) -> String {
    match encoding {
        ContentEncoding::SevenBit => "7bit".to_string(),
        ContentEncoding::EightBit => "8bit".to_string(),
        ContentEncoding::Binary => "binary".to_string(),
        ContentEncoding::Base64 => "base64".to_string(),
        ContentEncoding::QuotedPrintable => "quoted-printable".to_string(),
        ContentEncoding::Other(other) => other.to_ascii_lowercase(),
    }
}

/// Undoes the content-transfer-encoding of a fetched body part.
///
/// Unknown or missing encodings fall back to sniffing for base64, since
/// some servers report `7bit` for encoded binary parts.
pub fn decode_transfer(data: &[u8], encoding: &str) -> Vec<u8> {
    match encoding.trim().to_ascii_lowercase().as_str() {
        "base64" => decode_base64_lenient(data).unwrap_or_else(|| data.to_vec()),
        "quoted-printable" => decode_quoted_printable(data),
        _ if looks_like_base64(data) => decode_base64_lenient(data).unwrap_or_else(|| data.to_vec()),
        _ => data.to_vec(),
    }
}

fn decode_base64_lenient(data: &[u8]) -> Option<Vec<u8>> {
    let compact: Vec<u8> = data.iter().copied().filter(|b| !b.is_ascii_whitespace()).collect();
    BASE64.decode(compact).ok()
}

fn looks_like_base64(data: &[u8]) -> bool {
    let compact: Vec<u8> = data.iter().copied().filter(|b| !b.is_ascii_whitespace()).collect();
    compact.len() >= 16
        && compact.len() % 4 == 0
        && compact
            .iter()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'+' | b'/' | b'='))
}

/// Safe local file name for a downloaded attachment.
pub fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if c == '/' || c == '\\' || c.is_control() { '_' } else { c })
        .collect();
    let cleaned = cleaned.trim().trim_start_matches('.').to_string();
    if cleaned.is_empty() {
        "attachment".to_string()
    } else {
        cleaned
    }
}

/// Quoted string for a `TEXT` search key. Control characters become spaces
/// so a query cannot end the command line early.
pub fn quote_search_text(query: &str) -> String {
    let mut quoted = String::with_capacity(query.len() + 2);
    quoted.push('"');
    for c in query.chars() {
        match c {
            '\\' | '"' => {
                quoted.push('\\');
                quoted.push(c);
            }
            c if c.is_control() => quoted.push(' '),
            c => quoted.push(c),
        }
    }
    quoted.push('"');
    quoted
}

/// Plain-text RFC 5322 message for APPEND into the drafts folder.
pub fn build_draft(from: &str, to: &str, subject: &str, body: &str, now: DateTime<Utc>) -> Vec<u8> {
    let subject = if subject.is_ascii() {
        subject.to_string()
    } else {
        format!("=?UTF-8?B?{}?=", BASE64.encode(subject.as_bytes()))
    };
    let body = body.replace("\r\n", "\n").replace('\n', "\r\n");
    format!(
        "From: {from}\r\nTo: {to}\r\nSubject: {subject}\r\nDate: {date}\r\nMessage-ID: <{id}@maily>\r\nMIME-Version: 1.0\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Transfer-Encoding: 8bit\r\n\r\n{body}\r\n",
        date = now.to_rfc2822(),
        id = uuid::Uuid::new_v4(),
    )
    .into_bytes()
}
