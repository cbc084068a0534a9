// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Trace message model.
//!
//! A [`MessageTree`] is the unit of transport: one root [`Message`] plus the envelope
//! describing where it came from. Messages form a closed set of variants sharing a
//! [`MessageBase`]; only transactions carry children and a duration.

use crate::constants::SUCCESS;

/// Fields shared by every message variant.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MessageBase {
    pub r#type: String,
    pub name: String,
    /// `"0"` is success, any other value is a failure.
    pub status: String,
    pub data: String,
    /// Milliseconds since the unix epoch.
    pub timestamp: i64,
}

impl MessageBase {
    pub fn new(
        r#type: impl Into<String>,
        name: impl Into<String>,
        status: impl Into<String>,
        data: impl Into<String>,
        timestamp: i64,
    ) -> Self {
        MessageBase {
            r#type: r#type.into(),
            name: name.into(),
            status: status.into(),
            data: data.into(),
            timestamp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Transaction {
    pub base: MessageBase,
    /// Children in trace order.
    pub children: Vec<Message>,
    pub duration_micros: i64,
}

impl Transaction {
    pub fn add_child(&mut self, child: Message) {
        self.children.push(child);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Transaction(Transaction),
    Event(MessageBase),
    Heartbeat(MessageBase),
}

impl Message {
    #[must_use]
    pub fn transaction(base: MessageBase, duration_micros: i64) -> Self {
        Message::Transaction(Transaction {
            base,
            children: Vec::new(),
            duration_micros,
        })
    }

    #[must_use]
    pub fn event(base: MessageBase) -> Self {
        Message::Event(base)
    }

    #[must_use]
    pub fn heartbeat(base: MessageBase) -> Self {
        Message::Heartbeat(base)
    }

    #[must_use]
    pub fn base(&self) -> &MessageBase {
        match self {
            Message::Transaction(t) => &t.base,
            Message::Event(base) | Message::Heartbeat(base) => base,
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.base().status == SUCCESS
    }
}

/// Envelope around a root message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageTree {
    pub domain: String,
    pub message_id: String,
    pub parent_message_id: String,
    pub root_message_id: String,
    pub thread_group_name: String,
    pub thread_id: String,
    pub thread_name: String,
    pub message: Message,
    discardable: bool,
    system: bool,
}

impl MessageTree {
    /// A tree received from an application. Discardable until a failure is seen.
    #[must_use]
    pub fn new(domain: impl Into<String>, message_id: impl Into<String>, message: Message) -> Self {
        MessageTree {
            domain: domain.into(),
            message_id: message_id.into(),
            parent_message_id: String::new(),
            root_message_id: String::new(),
            thread_group_name: String::new(),
            thread_id: String::new(),
            thread_name: String::new(),
            message,
            discardable: true,
            system: false,
        }
    }

    /// A tree generated by the agent itself, such as an aggregate summary. Never
    /// discardable and never fed back into local aggregation.
    #[must_use]
    pub fn system(domain: impl Into<String>, message_id: impl Into<String>, message: Message) -> Self {
        MessageTree {
            thread_group_name: crate::constants::AGENT_THREAD_GROUP.to_string(),
            thread_id: std::process::id().to_string(),
            thread_name: crate::constants::AGENT_THREAD_NAME.to_string(),
            discardable: false,
            system: true,
            ..MessageTree::new(domain, message_id, message)
        }
    }

    #[must_use]
    pub fn can_discard(&self) -> bool {
        self.discardable
    }

    pub fn set_discard(&mut self, discardable: bool) {
        self.discardable = discardable;
    }

    #[must_use]
    pub fn is_system(&self) -> bool {
        self.system
    }
}
