// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use regex::Regex;

/// Decode MIME encoded-word headers (RFC 2047)
/// Supports both Q-encoding and B-encoding
/// Format: =?charset?encoding?encoded-text?=
pub fn decode_mime_header(input: &str) -> String {
    lazy_static::lazy_static! {
        static ref ENCODED_WORD_RE: Regex = Regex::new(
            r"=\?([^?]+)\?([BbQq])\?([^?]*)\?="
        ).expect("encoded-word pattern");
        static ref GAP_RE: Regex = Regex::new(r"\?=\s+=\?").expect("gap pattern");
    }

    // Whitespace between two adjacent encoded words is not part of the text.
    let input = GAP_RE.replace_all(input, "?==?");

    let mut result = String::new();
    let mut last_end = 0;

    for cap in ENCODED_WORD_RE.captures_iter(&input) {
        let (full_match, [_charset, encoding, encoded_text]) = cap.extract();
        let Some(whole) = cap.get(0) else { continue };

        if whole.start() > last_end {
            result.push_str(&input[last_end..whole.start()]);
        }

        let decoded = match encoding.to_ascii_uppercase().as_str() {
            "B" => BASE64
                .decode(encoded_text)
                .ok()
                .map(|bytes| String::from_utf8_lossy(&bytes).into_owned()),
            "Q" => Some(String::from_utf8_lossy(&decode_q(encoded_text)).into_owned()),
            _ => None,
        };

        result.push_str(decoded.as_deref().unwrap_or(full_match));
        last_end = whole.end();
    }

    if last_end == 0 {
        return input.into_owned();
    }
    if last_end < input.len() {
        result.push_str(&input[last_end..]);
    }
    result
}

/// Q-encoding from header words: `_` is a space, `=XX` a byte.
fn decode_q(encoded: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(encoded.len());
    let bytes = encoded.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'_' => {
                out.push(b' ');
                i += 1;
            }
            b'=' if i + 2 < bytes.len() => match hex_pair(bytes[i + 1], bytes[i + 2]) {
                Some(b) => {
                    out.push(b);
                    i += 3;
                }
                None => {
                    out.push(b'=');
                    i += 1;
                }
            },
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    out
}

/// Quoted-printable body decoding (RFC 2045), including soft line breaks.
pub fn decode_quoted_printable(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len());
    let mut i = 0;
    while i < input.len() {
        if input[i] != b'=' {
            out.push(input[i]);
            i += 1;
            continue;
        }
        // Soft line break: "=\r\n" or "=\n".
        if input.get(i + 1) == Some(&b'\r') && input.get(i + 2) == Some(&b'\n') {
            i += 3;
            continue;
        }
        if input.get(i + 1) == Some(&b'\n') {
            i += 2;
            continue;
        }
        match (input.get(i + 1), input.get(i + 2)) {
            (Some(&h), Some(&l)) => match hex_pair(h, l) {
                Some(b) => {
                    out.push(b);
                    i += 3;
                }
                None => {
                    out.push(b'=');
                    i += 1;
                }
            },
            _ => {
                out.push(b'=');
                i += 1;
            }
        }
    }
    out
}

fn hex_pair(high: u8, low: u8) -> Option<u8> {
    let h = (high as char).to_digit(16)?;
    let l = (low as char).to_digit(16)?;
    Some((h * 16 + l) as u8)
}
