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

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("unterminated reference starting at byte {0}")]
    Unterminated(usize),

    #[error("empty reference at byte {0}")]
    EmptyReference(usize),

    #[error("unexpected character {ch:?} in reference at byte {pos}")]
    UnexpectedChar { pos: usize, ch: char },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSeg {
    Key(String),
    Index(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    pub root: String,
    pub path: Vec<PathSeg>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Text(String),
    Reference(Reference),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    pub segments: Vec<Segment>,
}

impl Template {
    /// Recursive-descent parse of `{{root.path[0].more}}` references mixed
    /// with literal text.
    pub fn parse(input: &str) -> Result<Template, TemplateError> {
        let bytes = input.as_bytes();
        let mut segments = Vec::new();
        let mut text = String::new();
        let mut pos = 0;

        while pos < bytes.len() {
            if bytes[pos] == b'{' && pos + 1 < bytes.len() && bytes[pos + 1] == b'{' {
                if !text.is_empty() {
                    segments.push(Segment::Text(std::mem::take(&mut text)));
                }
                let (reference, next) = parse_reference(input, pos)?;
                segments.push(Segment::Reference(reference));
                pos = next;
            } else {
                let ch = input[pos..].chars().next().unwrap_or('\0');
                text.push(ch);
                pos += ch.len_utf8();
            }
        }

        if !text.is_empty() {
            segments.push(Segment::Text(text));
        }

        Ok(Template { segments })
    }

    pub fn has_references(&self) -> bool {
        self.segments
            .iter()
            .any(|s| matches!(s, Segment::Reference(_)))
    }

    /// When the whole template is exactly one reference, resolution keeps
    /// the referenced value's type instead of stringifying.
    pub fn single_reference(&self) -> Option<&Reference> {
        match self.segments.as_slice() {
            [Segment::Reference(reference)] => Some(reference),
            _ => None,
        }
    }
}

fn parse_reference(input: &str, open: usize) -> Result<(Reference, usize), TemplateError> {
    let mut pos = open + 2;
    skip_ws(input, &mut pos);

    let root = parse_ident(input, &mut pos)?;
    if root.is_empty() {
        return Err(TemplateError::EmptyReference(open));
    }

    let mut path = Vec::new();
    loop {
        match input.as_bytes().get(pos) {
            Some(b'.') => {
                pos += 1;
                let key = parse_ident(input, &mut pos)?;
                if key.is_empty() {
                    return Err(TemplateError::UnexpectedChar {
                        pos,
                        ch: input[pos..].chars().next().unwrap_or('\0'),
                    });
                }
                path.push(PathSeg::Key(key));
            }
            Some(b'[') => {
                pos += 1;
                let start = pos;
                while input.as_bytes().get(pos).is_some_and(u8::is_ascii_digit) {
                    pos += 1;
                }
                if start == pos || input.as_bytes().get(pos) != Some(&b']') {
                    return Err(TemplateError::UnexpectedChar {
                        pos,
                        ch: input[pos..].chars().next().unwrap_or('\0'),
                    });
                }
                let index = input[start..pos].parse().unwrap_or(0);
                path.push(PathSeg::Index(index));
                pos += 1;
            }
            _ => break,
        }
    }

    skip_ws(input, &mut pos);
    if input.as_bytes().get(pos) == Some(&b'}') && input.as_bytes().get(pos + 1) == Some(&b'}') {
        Ok((Reference { root, path }, pos + 2))
    } else if pos >= input.len() {
        Err(TemplateError::Unterminated(open))
    } else {
        Err(TemplateError::UnexpectedChar {
            pos,
            ch: input[pos..].chars().next().unwrap_or('\0'),
        })
    }
}

fn parse_ident(input: &str, pos: &mut usize) -> Result<String, TemplateError> {
    let start = *pos;
    for ch in input[*pos..].chars() {
        if ch.is_alphanumeric() || ch == '_' || ch == '-' {
            *pos += ch.len_utf8();
        } else {
            break;
        }
    }
    Ok(input[start..*pos].to_string())
}

fn skip_ws(input: &str, pos: &mut usize) {
    while input.as_bytes().get(*pos).is_some_and(u8::is_ascii_whitespace) {
        *pos += 1;
    }
}
