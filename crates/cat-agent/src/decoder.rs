// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Ingest decoder for the tab/newline text protocol.
//!
//! A body starts with a header line
//! `domain TAB thread-group TAB thread-id TAB thread-name TAB message-id TAB parent-id TAB root-id LF`
//! followed by message lines
//! `kind TAB type TAB name TAB status TAB timestamp TAB duration TAB data LF`.
//!
//! `t` opens a transaction, `T` closes the innermost one, `A` is a complete
//! transaction, `E` an event and `H` a heartbeat. Lines are a pre-order walk of the
//! tree, rebuilt here with a cursor and an explicit stack of open transactions.

use tracing::{debug, trace};

use crate::constants::SUCCESS;
use crate::errors::DecodeError;
use crate::message::{Message, MessageBase, MessageTree, Transaction};
use crate::message_id::MessageIdFactory;

const TAB: u8 = b'\t';
const LF: u8 = b'\n';

const HEADER_FIELDS: [&str; 6] = [
    "domain",
    "thread_group_name",
    "thread_id",
    "thread_name",
    "message_id",
    "parent_message_id",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Terminator {
    Tab,
    Lf,
    Eof,
}

struct Cursor<'a> {
    body: &'a [u8],
    pos: usize,
}

struct Line<'a> {
    kind: u8,
    r#type: &'a [u8],
    name: &'a [u8],
    status: &'a [u8],
    timestamp: &'a [u8],
    duration: &'a [u8],
    data: &'a [u8],
}

impl<'a> Cursor<'a> {
    fn at_end(&self) -> bool {
        self.pos >= self.body.len()
    }

    fn read_element(&mut self) -> (&'a [u8], Terminator) {
        let rest = &self.body[self.pos.min(self.body.len())..];
        match rest.iter().position(|&b| b == TAB || b == LF) {
            Some(len) => {
                self.pos += len + 1;
                let terminator = if rest[len] == TAB {
                    Terminator::Tab
                } else {
                    Terminator::Lf
                };
                (&rest[..len], terminator)
            }
            None => {
                self.pos = self.body.len();
                (rest, Terminator::Eof)
            }
        }
    }

    fn read_line(&mut self) -> Result<Option<Line<'a>>, DecodeError> {
        if self.at_end() {
            return Ok(None);
        }
        let start = self.pos;

        let mut fields: [&[u8]; 6] = [&[]; 6];
        for field in &mut fields {
            let (value, terminator) = self.read_element();
            if terminator != Terminator::Tab {
                return Err(DecodeError::MalformedLine(start));
            }
            *field = value;
        }
        // The data field may run to the end of the buffer.
        let (data, terminator) = self.read_element();
        if terminator == Terminator::Tab {
            return Err(DecodeError::MalformedLine(start));
        }

        let [kind, r#type, name, status, timestamp, duration] = fields;
        let &[kind] = kind else {
            return Err(DecodeError::MalformedLine(start));
        };
        Ok(Some(Line {
            kind,
            r#type,
            name,
            status,
            timestamp,
            duration,
            data,
        }))
    }
}

impl Line<'_> {
    fn base(&self) -> MessageBase {
        MessageBase::new(
            text(self.r#type),
            text(self.name),
            text(self.status),
            text(self.data),
            parse_i64(self.timestamp),
        )
    }

    fn key(&self) -> String {
        format!("{}:{}", text(self.r#type), text(self.name))
    }

    fn is_failure(&self) -> bool {
        self.status != SUCCESS.as_bytes()
    }
}

fn text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// Unparseable numbers read as 0.
fn parse_i64(bytes: &[u8]) -> i64 {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(0)
}

fn key_of(t: &Transaction) -> String {
    format!("{}:{}", t.base.r#type, t.base.name)
}

/// The last top-level element wins; earlier ones are dropped.
fn set_root(root: &mut Option<Message>, message: Message) {
    if let Some(replaced) = root.replace(message) {
        let base = replaced.base();
        debug!(
            "Body has more than one top-level element, dropping {}:{}",
            base.r#type, base.name
        );
    }
}

/// Decodes one ingest body into a tree, requesting a message id from `ids` when the
/// header leaves it empty.
pub fn decode(body: &[u8], ids: &MessageIdFactory) -> Result<MessageTree, DecodeError> {
    let mut cursor = Cursor { body, pos: 0 };

    let mut header: [String; 6] = Default::default();
    for (slot, field) in header.iter_mut().zip(HEADER_FIELDS) {
        let (value, terminator) = cursor.read_element();
        if terminator != Terminator::Tab {
            return Err(DecodeError::MissingHeaderField(field));
        }
        *slot = text(value);
    }
    let (root_message_id, _) = cursor.read_element();
    let [domain, thread_group_name, thread_id, thread_name, message_id, parent_message_id] =
        header;

    let mut stack: Vec<Transaction> = Vec::new();
    let mut root: Option<Message> = None;
    let mut discardable = true;

    while let Some(line) = cursor.read_line()? {
        if line.is_failure() {
            discardable = false;
        }
        match line.kind {
            b't' => {
                stack.push(Transaction {
                    base: line.base(),
                    children: Vec::new(),
                    duration_micros: parse_i64(line.duration),
                });
            }
            b'T' => {
                let Some(mut open) = stack.pop() else {
                    return Err(DecodeError::UnmatchedClose(line.key()));
                };
                if open.base.r#type != text(line.r#type) || open.base.name != text(line.name) {
                    return Err(DecodeError::MismatchedClose {
                        open: key_of(&open),
                        close: line.key(),
                    });
                }
                if !line.duration.is_empty() {
                    open.duration_micros = parse_i64(line.duration);
                }
                if !line.status.is_empty() {
                    open.base.status = text(line.status);
                }
                if !line.data.is_empty() {
                    open.base.data = text(line.data);
                }
                let closed = Message::Transaction(open);
                match stack.last_mut() {
                    Some(parent) => parent.add_child(closed),
                    None => set_root(&mut root, closed),
                }
            }
            b'A' | b'E' | b'H' => {
                let message = match line.kind {
                    b'A' => Message::transaction(line.base(), parse_i64(line.duration)),
                    b'E' => Message::event(line.base()),
                    _ => Message::heartbeat(line.base()),
                };
                match stack.last_mut() {
                    Some(parent) => parent.add_child(message),
                    None => set_root(&mut root, message),
                }
            }
            other => return Err(DecodeError::UnknownType(char::from(other))),
        }
    }

    if let Some(open) = stack.last() {
        return Err(DecodeError::Unbalanced { open: key_of(open) });
    }
    let message = root.ok_or(DecodeError::EmptyTree)?;

    let message_id = if message_id.is_empty() {
        ids.next_id(&domain)
    } else {
        message_id
    };
    trace!(
        "Decoded tree domain={} message_id={} discardable={}",
        domain,
        message_id,
        discardable
    );

    let mut tree = MessageTree::new(domain, message_id, message);
    tree.parent_message_id = parent_message_id;
    tree.root_message_id = text(root_message_id);
    tree.thread_group_name = thread_group_name;
    tree.thread_id = thread_id;
    tree.thread_name = thread_name;
    tree.set_discard(discardable);
    Ok(tree)
}
