// Session module
//
// Explicit authentication state passed by reference into request paths.
// Only the auth handler (crate::auth) applies transitions.

use crate::error::GuardianClientError;

/// サインイン済みユーザの識別情報
#[derive(Clone, PartialEq, Eq)]
pub struct UserIdentity {
    pub id: String,
    pub email: String,
    pub access_token: String,
}

impl std::fmt::Debug for UserIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserIdentity")
            .field("id", &self.id)
            .field("email", &self.email)
            .field("access_token", &"***")
            .finish()
    }
}

/// セッション状態
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Unauthenticated,
    Loading,
    Authenticated { user: UserIdentity, approved: bool },
}

/// 状態遷移イベント
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum AuthEvent {
    SignInStarted,
    SignedIn { user: UserIdentity, approved: bool },
    SignInFailed,
    ApprovalChanged(bool),
    SignedOut,
}

#[derive(Debug, Default)]
pub struct Session {
    state: SessionState,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn user(&self) -> Option<&UserIdentity> {
        match &self.state {
            SessionState::Authenticated { user, .. } => Some(user),
            _ => None,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.user().is_some()
    }

    pub fn is_approved(&self) -> bool {
        matches!(self.state, SessionState::Authenticated { approved: true, .. })
    }

    /// ユーザ単位の操作用。未認証なら `NotAuthenticated`。
    pub fn require_user(&self) -> Result<&UserIdentity, GuardianClientError> {
        self.user().ok_or(GuardianClientError::NotAuthenticated)
    }

    /// イベントを適用する。現在の状態で受理できないイベントは無視して false を返す。
    pub(crate) fn apply(&mut self, event: AuthEvent) -> bool {
        let next = match (&self.state, event) {
            (SessionState::Unauthenticated, AuthEvent::SignInStarted) => SessionState::Loading,
            (SessionState::Loading, AuthEvent::SignedIn { user, approved }) => {
                SessionState::Authenticated { user, approved }
            }
            (SessionState::Loading, AuthEvent::SignInFailed) => SessionState::Unauthenticated,
            (SessionState::Authenticated { user, .. }, AuthEvent::ApprovalChanged(approved)) => {
                SessionState::Authenticated {
                    user: user.clone(),
                    approved,
                }
            }
            (_, AuthEvent::SignedOut) => SessionState::Unauthenticated,
            (state, event) => {
                tracing::warn!(?state, ?event, "ignoring session event in current state");
                return false;
            }
        };
        tracing::debug!(from = ?self.state, to = ?next, "session transition");
        self.state = next;
        true
    }
}
