//! Prompt retry state machine.
//!
//! The host answers `RetryPrompt` when another prompt for the same user and
//! conversation was already waiting and took the reply. The request is then
//! re-issued unchanged, at most [`MAX_PROMPT_ATTEMPTS`] times in total.
//!
//! A reply only ever carries a prompt outcome, a connector issue from sending
//! the prompt, or `Failed`. Anything else from the host reads as `Failed`.

use robotrpc_protocol::{ReplyResponse, RetVal};

/// Total attempts for one prompt before giving up with `Interrupted`.
pub const MAX_PROMPT_ATTEMPTS: u32 = 3;

/// What to do after an attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum PromptStep {
    /// Send the identical request again.
    Resend,
    /// Final outcome for the caller.
    Finished(ReplyResponse),
}

/// Tracks attempts for a single prompt.
#[derive(Debug, Clone, Default)]
pub struct PromptFlow {
    attempts: u32,
}

impl PromptFlow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Feeds the host's answer to the latest attempt.
    pub fn observe(&mut self, reply: ReplyResponse) -> PromptStep {
        self.attempts += 1;
        if !reply.ret_val.is_reply_code() {
            tracing::warn!(
                "Host answered a prompt with {}, treating it as Failed",
                reply.ret_val
            );
            return PromptStep::Finished(ReplyResponse::failed(RetVal::Failed));
        }
        if reply.ret_val != RetVal::RetryPrompt {
            return PromptStep::Finished(reply);
        }
        if self.attempts >= MAX_PROMPT_ATTEMPTS {
            tracing::warn!(
                "Prompt still contended after {} attempts, giving up",
                self.attempts
            );
            return PromptStep::Finished(ReplyResponse::failed(RetVal::Interrupted));
        }
        PromptStep::Resend
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_immediate_outcomes() {
        for rv in [
            RetVal::Ok,
            RetVal::ReplyNotMatched,
            RetVal::UseDefaultValue,
            RetVal::TimeoutExpired,
            RetVal::Interrupted,
            RetVal::MatcherNotFound,
            RetVal::UserNotFound,
            RetVal::FailedMessageSend,
            RetVal::Failed,
        ] {
            let mut flow = PromptFlow::new();
            let reply = ReplyResponse::failed(rv);
            assert_eq!(flow.observe(reply.clone()), PromptStep::Finished(reply));
            assert_eq!(flow.attempts(), 1);
        }
    }

    #[test]
    fn test_retry_then_match() {
        let mut flow = PromptFlow::new();
        let retry = ReplyResponse::failed(RetVal::RetryPrompt);
        assert_eq!(flow.observe(retry.clone()), PromptStep::Resend);
        assert_eq!(flow.observe(retry), PromptStep::Resend);
        assert_eq!(
            flow.observe(ReplyResponse::matched("yes")),
            PromptStep::Finished(ReplyResponse::matched("yes"))
        );
    }

    #[test]
    fn test_foreign_codes_read_as_failed() {
        for rv in [RetVal::DatumLockExpired, RetVal::NoConfigFound, RetVal::TaskNotFound] {
            let mut flow = PromptFlow::new();
            let reply = ReplyResponse {
                reply: "stray".into(),
                ret_val: rv,
            };
            assert_eq!(
                flow.observe(reply),
                PromptStep::Finished(ReplyResponse::failed(RetVal::Failed))
            );
        }
    }

    #[test]
    fn test_retry_exhausted() {
        let mut flow = PromptFlow::new();
        let retry = ReplyResponse::failed(RetVal::RetryPrompt);
        let mut last = PromptStep::Resend;
        for _ in 0..MAX_PROMPT_ATTEMPTS {
            last = flow.observe(retry.clone());
        }
        assert_eq!(
            last,
            PromptStep::Finished(ReplyResponse::failed(RetVal::Interrupted))
        );
        assert_eq!(flow.attempts(), MAX_PROMPT_ATTEMPTS);
    }
}
