//! Approval gate — decides whether a tool call may run.
//!
//! The decision table is a pure function of the call's danger class and
//! the session's policy. On top of it the gate applies per-session
//! overrides (tools the user approved "always for this session") and
//! records every decision in the audit log.

use std::sync::Arc;

use termagent_core::{
    ApprovalDecision, ApprovalPolicy, ApprovalResponse, DangerClass, PolicyChange, Session,
    ToolCallRequest,
};

use crate::audit::{AuditEvent, AuditLogger, AuditOutcome};

/// The decision table.
///
/// | class             | auto    | on-request | never |
/// |-------------------|---------|------------|-------|
/// | safe              | allow   | allow      | allow |
/// | requires-approval | allow   | ask        | deny  |
/// | always-confirm    | ask     | ask        | deny  |
pub fn decide(class: DangerClass, policy: ApprovalPolicy) -> ApprovalDecision {
    match (class, policy) {
        (DangerClass::Safe, _) => ApprovalDecision::Allow,
        (_, ApprovalPolicy::Never) => ApprovalDecision::Deny,
        (DangerClass::RequiresApproval, ApprovalPolicy::Auto) => ApprovalDecision::Allow,
        (DangerClass::RequiresApproval, ApprovalPolicy::OnRequest) => ApprovalDecision::AskUser,
        (DangerClass::AlwaysConfirm, _) => ApprovalDecision::AskUser,
    }
}

/// The gate's answer for one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub decision: ApprovalDecision,
    /// Class the decision was made on, after overrides
    pub class: DangerClass,
    /// Human-readable explanation, used as the denial reason
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct ApprovalGate {
    audit: Arc<AuditLogger>,
}

impl ApprovalGate {
    pub fn new(audit: Arc<AuditLogger>) -> Self {
        Self { audit }
    }

    pub fn audit(&self) -> &Arc<AuditLogger> {
        &self.audit
    }

    /// Evaluate one call against the session's current policy.
    ///
    /// `declared` is the tool's static class and `invocation` the class of
    /// this concrete call. A session override downgrades the call to safe
    /// only when the invocation is not escalated above the declared class,
    /// so approving `shell` for the session does not cover `rm -rf`.
    pub fn evaluate(
        &self,
        session: &Session,
        call: &ToolCallRequest,
        declared: DangerClass,
        invocation: DangerClass,
    ) -> Verdict {
        let overridden =
            invocation == declared && session.session_overrides().contains(&call.name);
        let class = if overridden {
            DangerClass::Safe
        } else {
            invocation
        };

        let decision = decide(class, session.approval);
        let reason = match decision {
            ApprovalDecision::Allow if overridden => {
                format!("'{}' was approved for this session", call.name)
            }
            ApprovalDecision::Allow => format!("{class} tool allowed under {} policy", session.approval),
            ApprovalDecision::Deny => format!(
                "'{}' is {class} and the approval policy is {}",
                call.name, session.approval
            ),
            ApprovalDecision::AskUser => format!("'{}' is {class}; asking the user", call.name),
        };

        let outcome = match decision {
            ApprovalDecision::Allow => AuditOutcome::Allowed,
            ApprovalDecision::Deny => AuditOutcome::Denied,
            ApprovalDecision::AskUser => AuditOutcome::Pending,
        };
        self.audit.log(
            AuditEvent::GateDecision {
                tool: call.name.clone(),
                call_id: call.id.clone(),
                class,
                decision,
            },
            session.id.as_str(),
            outcome,
            Some(reason.clone()),
        );

        Verdict {
            decision,
            class,
            reason,
        }
    }

    /// Record the user's answer to an `AskUser` decision.
    ///
    /// Returns the policy-log change to persist, if the answer creates one.
    pub fn record_response(
        &self,
        session: &Session,
        call: &ToolCallRequest,
        response: ApprovalResponse,
    ) -> Option<PolicyChange> {
        let outcome = match response {
            ApprovalResponse::Deny => AuditOutcome::Denied,
            _ => AuditOutcome::Allowed,
        };
        self.audit.log(
            AuditEvent::UserResponse {
                tool: call.name.clone(),
                call_id: call.id.clone(),
                response,
            },
            session.id.as_str(),
            outcome,
            None,
        );

        (response == ApprovalResponse::ApproveAlwaysThisSession).then(|| {
            PolicyChange::ToolAllowedForSession {
                tool: call.name.clone(),
            }
        })
    }

    /// Changes to persist when switching the session's policy.
    ///
    /// Switching to `never` implicitly revokes every session override; the
    /// session log replays that rule, so only the switch itself is logged.
    pub fn policy_change(&self, session: &Session, next: ApprovalPolicy) -> Option<PolicyChange> {
        if session.approval == next {
            return None;
        }
        let details = (next == ApprovalPolicy::Never && !session.session_overrides().is_empty())
            .then(|| "session tool overrides revoked".to_string());
        self.audit.log(
            AuditEvent::PolicyChanged {
                from: session.approval,
                to: next,
            },
            session.id.as_str(),
            AuditOutcome::Changed,
            details,
        );
        Some(PolicyChange::PolicySet {
            from: session.approval,
            to: next,
        })
    }
}

impl Default for ApprovalGate {
    fn default() -> Self {
        Self::new(Arc::new(AuditLogger::tracing()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use termagent_core::{SessionSettings, SessionUpdate};

    fn session(policy: ApprovalPolicy) -> Session {
        Session::new(SessionSettings {
            model: "m".into(),
            provider: "ollama".into(),
            approval: policy,
        })
    }

    fn call(name: &str) -> ToolCallRequest {
        ToolCallRequest::new("c1", name, "{}")
    }

    fn allow_for_session(session: &mut Session, tool: &str) {
        session.apply(
            &SessionUpdate::Policy {
                change: PolicyChange::ToolAllowedForSession { tool: tool.into() },
            },
            Utc::now(),
        );
    }

    #[test]
    fn decision_table() {
        use ApprovalDecision::*;
        use ApprovalPolicy::*;
        use DangerClass::*;

        let cases = [
            (Safe, Auto, Allow),
            (Safe, OnRequest, Allow),
            (Safe, Never, Allow),
            (RequiresApproval, Auto, Allow),
            (RequiresApproval, OnRequest, AskUser),
            (RequiresApproval, Never, Deny),
            (AlwaysConfirm, Auto, AskUser),
            (AlwaysConfirm, OnRequest, AskUser),
            (AlwaysConfirm, Never, Deny),
        ];
        for (class, policy, expected) in cases {
            assert_eq!(decide(class, policy), expected, "{class} under {policy}");
        }
    }

    #[test]
    fn evaluate_audits_each_decision() {
        let gate = ApprovalGate::new(Arc::new(AuditLogger::new()));
        let s = session(ApprovalPolicy::Never);
        let verdict = gate.evaluate(
            &s,
            &call("write_file"),
            DangerClass::RequiresApproval,
            DangerClass::RequiresApproval,
        );
        assert_eq!(verdict.decision, ApprovalDecision::Deny);
        assert!(verdict.reason.contains("never"));
        assert_eq!(gate.audit().entries_by_outcome(&AuditOutcome::Denied).len(), 1);
    }

    #[test]
    fn session_override_downgrades_to_safe() {
        let gate = ApprovalGate::default();
        let mut s = session(ApprovalPolicy::OnRequest);
        allow_for_session(&mut s, "shell");

        let verdict = gate.evaluate(
            &s,
            &call("shell"),
            DangerClass::RequiresApproval,
            DangerClass::RequiresApproval,
        );
        assert_eq!(verdict.decision, ApprovalDecision::Allow);
        assert_eq!(verdict.class, DangerClass::Safe);
    }

    #[test]
    fn override_does_not_cover_escalated_invocation() {
        let gate = ApprovalGate::default();
        let mut s = session(ApprovalPolicy::OnRequest);
        allow_for_session(&mut s, "shell");

        let verdict = gate.evaluate(
            &s,
            &call("shell"),
            DangerClass::RequiresApproval,
            DangerClass::AlwaysConfirm,
        );
        assert_eq!(verdict.decision, ApprovalDecision::AskUser);
    }

    #[test]
    fn override_covers_always_confirm_tools_when_not_escalated() {
        let gate = ApprovalGate::default();
        let mut s = session(ApprovalPolicy::Auto);
        allow_for_session(&mut s, "delete_file");
        let verdict = gate.evaluate(
            &s,
            &call("delete_file"),
            DangerClass::AlwaysConfirm,
            DangerClass::AlwaysConfirm,
        );
        assert_eq!(verdict.decision, ApprovalDecision::Allow);
    }

    #[test]
    fn never_policy_revokes_overrides() {
        let gate = ApprovalGate::default();
        let mut s = session(ApprovalPolicy::OnRequest);
        allow_for_session(&mut s, "shell");

        let change = gate.policy_change(&s, ApprovalPolicy::Never).unwrap();
        s.apply(&SessionUpdate::Policy { change }, Utc::now());

        let verdict = gate.evaluate(
            &s,
            &call("shell"),
            DangerClass::RequiresApproval,
            DangerClass::RequiresApproval,
        );
        assert_eq!(verdict.decision, ApprovalDecision::Deny);

        // Overrides stay revoked after switching back.
        let change = gate.policy_change(&s, ApprovalPolicy::OnRequest).unwrap();
        s.apply(&SessionUpdate::Policy { change }, Utc::now());
        let verdict = gate.evaluate(
            &s,
            &call("shell"),
            DangerClass::RequiresApproval,
            DangerClass::RequiresApproval,
        );
        assert_eq!(verdict.decision, ApprovalDecision::AskUser);
    }

    #[test]
    fn unchanged_policy_records_nothing() {
        let gate = ApprovalGate::new(Arc::new(AuditLogger::new()));
        let s = session(ApprovalPolicy::Auto);
        assert!(gate.policy_change(&s, ApprovalPolicy::Auto).is_none());
        assert_eq!(gate.audit().count(), 0);
    }

    #[test]
    fn approve_always_yields_policy_change() {
        let gate = ApprovalGate::default();
        let s = session(ApprovalPolicy::OnRequest);
        assert_eq!(
            gate.record_response(&s, &call("shell"), ApprovalResponse::ApproveAlwaysThisSession),
            Some(PolicyChange::ToolAllowedForSession {
                tool: "shell".into()
            })
        );
        assert!(gate.record_response(&s, &call("shell"), ApprovalResponse::Approve).is_none());
        assert!(gate.record_response(&s, &call("shell"), ApprovalResponse::Deny).is_none());
    }
}
