// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2024 Jonathan Lee
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License version 3
// as published by the Free Software Foundation.
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.
// See the GNU Affero General Public License for more details.
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see https://www.gnu.org/licenses/.

//! Streaming response format processor: extracts selected fields from a
//! structured response as it accumulates on the wire. A pure transform
//! over a byte channel; the producer is never blocked.

use serde_json::Value;
use tokio::sync::mpsc;

pub type ByteSender = mpsc::UnboundedSender<Vec<u8>>;
pub type ByteStream = mpsc::UnboundedReceiver<Vec<u8>>;

pub fn byte_channel() -> (ByteSender, ByteStream) {
    mpsc::unbounded_channel()
}

/// One `<blockId>_<fieldName>` selection token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedField {
    pub block_id: String,
    pub field: String,
}

impl SelectedField {
    /// Split a token on the separator following the given block id;
    /// tokens with a different prefix are ignored.
    pub fn parse_for_block(token: &str, block_id: &str) -> Option<SelectedField> {
        let rest = token.strip_prefix(block_id)?;
        let field = rest.strip_prefix('_')?;
        if field.is_empty() {
            return None;
        }
        Some(SelectedField {
            block_id: block_id.to_string(),
            field: field.to_string(),
        })
    }
}

pub struct StreamingResponseProcessor;

impl StreamingResponseProcessor {
    /// Wrap `stream` so that the configured fields are extracted from the
    /// accumulated JSON and emitted joined by newline. Content that never
    /// looked structured passes through untouched, which keeps the
    /// transform idempotent; structured content that stays unparseable at
    /// end of stream yields an empty stream.
    pub fn apply(mut stream: ByteStream, block_id: &str, selected: &[String]) -> ByteStream {
        let fields: Vec<SelectedField> = selected
            .iter()
            .filter_map(|token| SelectedField::parse_for_block(token, block_id))
            .collect();

        if fields.is_empty() {
            return stream;
        }

        let (tx, rx) = byte_channel();
        tokio::spawn(async move {
            let mut buffer = String::new();
            let mut passthrough = false;
            let mut decided = false;
            let mut emitted = false;

            while let Some(chunk) = stream.recv().await {
                if passthrough {
                    if tx.send(chunk).is_err() {
                        return;
                    }
                    continue;
                }

                buffer.push_str(&String::from_utf8_lossy(&chunk));

                if !decided {
                    let head = buffer.trim_start();
                    if head.is_empty() {
                        continue;
                    }
                    decided = true;
                    if !head.starts_with('{') && !head.starts_with('[') {
                        passthrough = true;
                        if tx.send(buffer.clone().into_bytes()).is_err() {
                            return;
                        }
                        buffer.clear();
                        continue;
                    }
                }

                if !emitted {
                    if let Ok(parsed) = serde_json::from_str::<Value>(buffer.trim()) {
                        emitted = true;
                        let out = extract_fields(&parsed, &fields);
                        if !out.is_empty() && tx.send(out.into_bytes()).is_err() {
                            return;
                        }
                    }
                }
            }
            // Unparseable structured content at EOF: emit nothing.
        });

        rx
    }
}

fn extract_fields(parsed: &Value, fields: &[SelectedField]) -> String {
    let mut parts = Vec::new();
    for field in fields {
        if let Some(value) = parsed.get(&field.field) {
            match value {
                Value::String(s) => parts.push(s.clone()),
                other => parts.push(serde_json::to_string(other).unwrap_or_default()),
            }
        }
    }
    parts.join("\n")
}

/// Strip non-ASCII characters so content copied into out-of-band HTTP
/// headers stays a valid header value.
pub fn sanitize_for_header(input: &str) -> String {
    input
        .chars()
        .filter(|c| c.is_ascii() && *c != '\r' && *c != '\n')
        .collect()
}
