//! Password verification state machine.
//!
//! The device grants privileged commands only after a `pswd=` submission is
//! answered with the success token, and the grant silently lapses after four
//! minutes, so the session re-prompts by dropping back to unverified on
//! expiry.
//!
//! Known firmware quirk, preserved deliberately: the first response token
//! after a submission is the device echoing the submission itself, not a
//! grant. The pending password is therefore re-submitted once, and only the
//! response to that second submission is treated as the real verdict.

use crate::protocol::{self, AuthResponse};
use log::debug;
use std::time::Duration;

/// How long a verification lasts without re-verification.
pub const EXPIRY: Duration = Duration::from_secs(240);

#[derive(Debug, Default)]
pub struct AuthSession {
    verified: bool,
    first_echo_seen: bool,
    pending_password: Option<String>,
    verified_password: Option<String>,
}

/// What the session must do after a password submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitAction {
    /// Already verified; surface an "already verified" notice and send
    /// nothing.
    AlreadyVerified,
    /// Enqueue this wire command at high priority.
    Send(String),
}

/// What the session must do after a device auth response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseAction {
    /// The device echoed our first submission; re-send this command once.
    Resubmit(String),
    /// Verification succeeded; arm the expiry timer for [`EXPIRY`].
    Verified,
    /// Verification failed; surface an auth-error notice.
    Failed,
    /// Nothing to do (e.g. duplicate success while already verified).
    None,
}

impl AuthSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a password for verification and build the submission command.
    ///
    /// Idempotent while verified: re-submitting the same (or any) password
    /// is a no-op until the current grant expires.
    pub fn submit(&mut self, password: &str) -> SubmitAction {
        if self.verified {
            return SubmitAction::AlreadyVerified;
        }
        self.pending_password = Some(password.to_owned());
        SubmitAction::Send(protocol::password_command(password))
    }

    /// Feed a device auth response token through the state machine.
    pub fn on_response(&mut self, response: AuthResponse) -> ResponseAction {
        if !self.first_echo_seen {
            self.first_echo_seen = true;
            if response == AuthResponse::Success {
                if let Some(pending) = &self.pending_password {
                    debug!("first auth success is the submission echo; re-submitting");
                    return ResponseAction::Resubmit(protocol::password_command(pending));
                }
                return ResponseAction::None;
            }
            // A failure is a real verdict even on the first response.
        }

        match response {
            AuthResponse::Success => {
                if self.verified {
                    return ResponseAction::None;
                }
                self.verified = true;
                self.verified_password = self.pending_password.clone();
                ResponseAction::Verified
            }
            AuthResponse::Failure => {
                self.verified = false;
                self.verified_password = None;
                ResponseAction::Failed
            }
        }
    }

    /// The expiry timer fired: drop back to unverified unconditionally.
    pub fn on_expiry(&mut self) {
        debug!("password verification expired");
        self.verified = false;
    }

    /// Gate for privileged commands. The caller surfaces a "please verify
    /// password" notice when this returns false.
    pub fn guard(&self) -> bool {
        self.verified
    }

    pub fn verified(&self) -> bool {
        self.verified
    }

    /// The password most recently confirmed by the device.
    pub fn verified_password(&self) -> Option<&str> {
        self.verified_password.as_deref()
    }

    /// Full reset, called on disconnect.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
