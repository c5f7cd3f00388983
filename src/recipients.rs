//! Recipient authorization.
//!
//! The session asks a [`RecipientPolicy`] whether a declared recipient may
//! receive mail. The policy is built once at startup and shared read-only
//! between all connections.

use std::collections::HashSet;

/// Decides whether a recipient address is accepted.
pub trait RecipientPolicy: Send + Sync {
    fn is_authorized(&self, recipient: &str) -> bool;
}

/// Any predicate closure works as a policy.
impl<F> RecipientPolicy for F
where
    F: Fn(&str) -> bool + Send + Sync,
{
    fn is_authorized(&self, recipient: &str) -> bool {
        self(recipient)
    }
}

/// Static membership set of local mailboxes.
#[derive(Debug, Clone, Default)]
pub struct StaticRecipients {
    allowed: HashSet<String>,
}

impl StaticRecipients {
    pub fn new<I, S>(recipients: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed: recipients.into_iter().map(Into::into).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.allowed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.allowed.is_empty()
    }
}

impl RecipientPolicy for StaticRecipients {
    fn is_authorized(&self, recipient: &str) -> bool {
        self.allowed.contains(recipient)
    }
}
