// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Upstream binary encoding.
//!
//! A record is the `NT1` tag, the header strings, then a pre-order walk of the
//! message tree. Strings are varint length + bytes; integers are little-endian
//! base-128 varints.

use std::sync::Arc;

use crate::constants::BINARY_PROTOCOL;
use crate::message::{Message, MessageBase, MessageTree, Transaction};

/// Appends `value` as a base-128 varint, low bits first. Negative values are written
/// as their two's-complement `u64`.
pub fn write_varint(buf: &mut Vec<u8>, value: i64) {
    let mut v = value as u64;
    while v & !0x7F != 0 {
        buf.push((v & 0x7F) as u8 | 0x80);
        v >>= 7;
    }
    buf.push(v as u8);
}

fn write_str(buf: &mut Vec<u8>, s: &str) {
    write_varint(buf, s.len() as i64);
    buf.extend_from_slice(s.as_bytes());
}

/// Reusable per-worker encoder. Holds the host identity stamped into each header.
pub struct BinaryEncoder {
    hostname: Arc<str>,
    ip: Arc<str>,
    buf: Vec<u8>,
}

impl BinaryEncoder {
    #[must_use]
    pub fn new(hostname: Arc<str>, ip: Arc<str>) -> Self {
        BinaryEncoder {
            hostname,
            ip,
            buf: Vec::with_capacity(4096),
        }
    }

    /// Encodes `tree` into the internal buffer and returns the record.
    pub fn encode(&mut self, tree: &MessageTree) -> &[u8] {
        self.buf.clear();
        self.encode_header(tree);
        encode_message(&mut self.buf, &tree.message);
        &self.buf
    }

    /// Appends `tree` to `out` prefixed with its 4-byte big-endian length.
    pub fn encode_framed(&mut self, tree: &MessageTree, out: &mut Vec<u8>) {
        let record = self.encode(tree);
        out.extend_from_slice(&(record.len() as u32).to_be_bytes());
        out.extend_from_slice(record);
    }

    fn encode_header(&mut self, tree: &MessageTree) {
        let buf = &mut self.buf;
        buf.extend_from_slice(BINARY_PROTOCOL);
        write_str(buf, &tree.domain);
        write_str(buf, &self.hostname);
        write_str(buf, &self.ip);
        write_str(buf, &tree.thread_group_name);
        write_str(buf, &tree.thread_id);
        write_str(buf, &tree.thread_name);
        write_str(buf, &tree.message_id);
        write_str(buf, &tree.parent_message_id);
        write_str(buf, &tree.root_message_id);
        // session token
        write_str(buf, "");
    }
}

fn encode_message(buf: &mut Vec<u8>, message: &Message) {
    match message {
        Message::Transaction(t) => encode_transaction(buf, t),
        Message::Event(base) => encode_with_leader(buf, b'E', base),
        Message::Heartbeat(base) => encode_with_leader(buf, b'H', base),
    }
}

fn encode_transaction(buf: &mut Vec<u8>, t: &Transaction) {
    buf.push(b't');
    encode_start(buf, &t.base);
    for child in &t.children {
        encode_message(buf, child);
    }
    buf.push(b'T');
    encode_end(buf, &t.base);
    write_varint(buf, t.duration_micros);
}

fn encode_with_leader(buf: &mut Vec<u8>, leader: u8, base: &MessageBase) {
    buf.push(leader);
    encode_start(buf, base);
    encode_end(buf, base);
}

fn encode_start(buf: &mut Vec<u8>, base: &MessageBase) {
    write_varint(buf, base.timestamp);
    write_str(buf, &base.r#type);
    write_str(buf, &base.name);
}

fn encode_end(buf: &mut Vec<u8>, base: &MessageBase) {
    write_str(buf, &base.status);
    if base.data.is_empty() {
        write_varint(buf, 0);
    } else {
        write_str(buf, &base.data);
    }
}
