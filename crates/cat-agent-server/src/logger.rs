// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Log line format for the agent daemon.
//!
//! The agent usually writes to a plain file next to the host's other services, so
//! each line carries its own UTC timestamp and the component that emitted it (the
//! last segment of the event target):
//!
//! ```text
//! CAT_AGENT | 2026-10-19T08:00:00.000000Z | WARN | sender | consumer{id=3}: Sender queue is full queue="high"
//! CAT_AGENT | 2026-10-19T08:00:01.000000Z | INFO | server | Server exit
//! ```

use std::fmt;
use tracing_core::{Event, Subscriber};
use tracing_subscriber::fmt::{
    format::{self, FormatEvent, FormatFields},
    time::{FormatTime, SystemTime},
    FmtContext, FormattedFields,
};
use tracing_subscriber::registry::LookupSpan;

pub const LOG_PREFIX: &str = "CAT_AGENT";

#[derive(Debug, Clone, Copy)]
pub struct Formatter<T = SystemTime> {
    timer: T,
}

impl Formatter {
    #[must_use]
    pub fn new() -> Self {
        Formatter { timer: SystemTime }
    }
}

impl Default for Formatter {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Formatter<T> {
    #[cfg(test)]
    fn with_timer(timer: T) -> Self {
        Formatter { timer }
    }
}

fn component(target: &str) -> &str {
    target.rsplit("::").next().unwrap_or(target)
}

impl<S, N, T> FormatEvent<S, N> for Formatter<T>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
    T: FormatTime,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let metadata = event.metadata();
        write!(writer, "{LOG_PREFIX} | ")?;
        if self.timer.format_time(&mut writer).is_err() {
            write!(writer, "<unknown time>")?;
        }
        write!(
            writer,
            " | {} | {} | ",
            metadata.level(),
            component(metadata.target())
        )?;

        if let Some(scope) = ctx.event_scope() {
            for span in scope.from_root() {
                write!(writer, "{}", span.name())?;
                if let Some(fields) = span.extensions().get::<FormattedFields<N>>() {
                    if !fields.is_empty() {
                        write!(writer, "{{{fields}}}")?;
                    }
                }
                write!(writer, ": ")?;
            }
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}
