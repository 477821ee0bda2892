// Copyright (C) 2026 Build Swarm Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Scripted [`LinkRunner`](super::LinkRunner) for tests.
//!
//! Responses are matched by drone name plus a command substring; the
//! first matching rule wins, later rules with the same match override
//! earlier ones only if pushed with [`MockRunner::script`] again. Every
//! call is recorded so tests can assert which remote actions fired.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::{LinkError, LinkOutput, LinkRunner, LinkTarget, Result};

/// What a scripted rule responds with.
#[derive(Debug, Clone)]
pub enum MockResponse {
    /// Succeed with the given stdout.
    Ok(String),
    /// Exit non-zero with the given stderr.
    Fail(i32, String),
    /// Simulate a timeout.
    Timeout,
}

#[derive(Debug, Clone)]
struct Rule {
    drone: Option<String>,
    command_contains: String,
    response: MockResponse,
}

/// One recorded remote call.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    /// Target drone name.
    pub drone: String,
    /// Full remote command line.
    pub command: String,
    /// Bytes piped to stdin, when any.
    pub stdin_len: usize,
}

/// Scripted mock transport.
#[derive(Debug, Default)]
pub struct MockRunner {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl MockRunner {
    /// Create an empty mock. Unmatched commands succeed with empty output.
    pub fn new() -> Self {
        Self::default()
    }

    /// Script a response for commands containing `command_contains`,
    /// optionally restricted to one drone. Later rules take precedence.
    pub fn script(
        &self,
        drone: Option<&str>,
        command_contains: &str,
        response: MockResponse,
    ) -> &Self {
        self.rules.lock().unwrap().push(Rule {
            drone: drone.map(|d| d.to_string()),
            command_contains: command_contains.to_string(),
            response,
        });
        self
    }

    /// All calls recorded so far.
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Calls whose command contains `needle`, for one drone if given.
    pub fn calls_matching(&self, drone: Option<&str>, needle: &str) -> Vec<RecordedCall> {
        self.calls()
            .into_iter()
            .filter(|c| c.command.contains(needle))
            .filter(|c| drone.is_none_or(|d| c.drone == d))
            .collect()
    }

    fn respond(&self, target: &LinkTarget, command: &str, stdin_len: usize) -> Result<LinkOutput> {
        self.calls.lock().unwrap().push(RecordedCall {
            drone: target.name.clone(),
            command: command.to_string(),
            stdin_len,
        });

        let rules = self.rules.lock().unwrap();
        let rule = rules
            .iter()
            .rev()
            .find(|r| {
                command.contains(&r.command_contains)
                    && r.drone.as_deref().is_none_or(|d| d == target.name)
            })
            .cloned();

        match rule.map(|r| r.response) {
            Some(MockResponse::Ok(stdout)) => Ok(LinkOutput {
                exit_code: 0,
                stdout,
                stderr: String::new(),
            }),
            Some(MockResponse::Fail(code, stderr)) => Ok(LinkOutput {
                exit_code: code,
                stdout: String::new(),
                stderr,
            }),
            Some(MockResponse::Timeout) => Err(LinkError::Timeout(Duration::from_secs(0))),
            None => Ok(LinkOutput {
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new(),
            }),
        }
    }
}

#[async_trait]
impl LinkRunner for MockRunner {
    async fn run(
        &self,
        target: &LinkTarget,
        command: &str,
        _timeout: Duration,
    ) -> Result<LinkOutput> {
        self.respond(target, command, 0)
    }

    async fn run_with_stdin(
        &self,
        target: &LinkTarget,
        command: &str,
        stdin: &[u8],
        _timeout: Duration,
    ) -> Result<LinkOutput> {
        self.respond(target, command, stdin.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn later_rules_take_precedence() {
        let mock = MockRunner::new();
        mock.script(None, "probe", MockResponse::Ok("first".to_string()));
        mock.script(None, "probe", MockResponse::Fail(1, "second".to_string()));

        let target = LinkTarget::new("d1", "10.0.0.1", Duration::from_secs(5));
        let out = mock.run(&target, "run probe now", Duration::from_secs(5)).await.unwrap();
        assert_eq!(out.exit_code, 1);
        assert_eq!(out.stderr, "second");
    }

    #[tokio::test]
    async fn drone_scoped_rules_only_match_that_drone() {
        let mock = MockRunner::new();
        mock.script(Some("d2"), "reboot", MockResponse::Fail(255, "nope".to_string()));

        let d1 = LinkTarget::new("d1", "10.0.0.1", Duration::from_secs(5));
        let d2 = LinkTarget::new("d2", "10.0.0.2", Duration::from_secs(5));

        assert!(mock.run(&d1, "reboot", Duration::from_secs(5)).await.unwrap().success());
        assert!(!mock.run(&d2, "reboot", Duration::from_secs(5)).await.unwrap().success());

        assert_eq!(mock.calls_matching(Some("d2"), "reboot").len(), 1);
        assert_eq!(mock.calls().len(), 2);
    }
}
