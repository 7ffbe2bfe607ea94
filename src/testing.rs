//! Scripted wire for unit tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::Instant;

use crate::clock::Clock;
use crate::transport::{RemoteReply, Transport, WireFailure};

type Reply = Result<RemoteReply, WireFailure>;

#[derive(Debug)]
struct Rule {
    pattern: String,
    replies: VecDeque<Reply>,
    sticky: bool,
}

/// Replies to URLs by substring match, in the order rules were added.
///
/// One-shot replies are consumed; sticky replies answer forever. Unscripted
/// URLs get a permanent decode failure.
#[derive(Debug, Default)]
pub(crate) struct ScriptedTransport {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<(String, Option<Instant>)>>,
    clock: Option<Arc<dyn Clock>>,
}

impl ScriptedTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Records the clock time of every call.
    pub(crate) fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock: Some(clock),
            ..Self::default()
        }
    }

    /// Queues a one-shot reply.
    pub(crate) fn push(&self, pattern: &str, reply: Reply) {
        self.add(pattern, reply, false);
    }

    /// Answers every matching call with `reply`.
    pub(crate) fn always(&self, pattern: &str, reply: Reply) {
        self.add(pattern, reply, true);
    }

    /// Shorthand for a sticky JSON payload.
    pub(crate) fn json(&self, pattern: &str, body: Value) {
        self.always(pattern, Ok(RemoteReply::Payload(body)));
    }

    /// URLs requested so far.
    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .map(|calls| calls.iter().map(|(url, _)| url.clone()).collect())
            .unwrap_or_default()
    }

    /// Clock instants of every call, when a clock was supplied.
    pub(crate) fn stamps(&self) -> Vec<Instant> {
        self.calls
            .lock()
            .map(|calls| calls.iter().filter_map(|(_, at)| *at).collect())
            .unwrap_or_default()
    }

    fn add(&self, pattern: &str, reply: Reply, sticky: bool) {
        if let Ok(mut rules) = self.rules.lock() {
            if let Some(rule) = rules
                .iter_mut()
                .find(|rule| rule.pattern == pattern && rule.sticky == sticky)
            {
                rule.replies.push_back(reply);
                return;
            }
            rules.push(Rule {
                pattern: pattern.to_string(),
                replies: VecDeque::from([reply]),
                sticky,
            });
        }
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn execute(&self, url: &str) -> Result<RemoteReply, WireFailure> {
        let at = self.clock.as_ref().map(|clock| clock.now());
        if let Ok(mut calls) = self.calls.lock() {
            calls.push((url.to_string(), at));
        }

        let Ok(mut rules) = self.rules.lock() else {
            return Err(WireFailure::decode("script poisoned"));
        };
        for rule in rules.iter_mut() {
            if !url.contains(&rule.pattern) || rule.replies.is_empty() {
                continue;
            }
            if rule.sticky {
                if let Some(reply) = rule.replies.front() {
                    return reply.clone();
                }
            } else if let Some(reply) = rule.replies.pop_front() {
                return reply;
            }
        }
        Err(WireFailure::decode(format!("unscripted request: {url}")))
    }
}
