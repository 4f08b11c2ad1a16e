//! Access token validation

use async_trait::async_trait;
use std::collections::HashSet;

use super::AccessGate;

/// Accepts every token. For local development only.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl AccessGate for AllowAll {
    async fn validate(&self, _token: &str) -> bool {
        true
    }
}

/// Accepts tokens from a fixed set
#[derive(Debug, Clone, Default)]
pub struct TokenAllowList {
    tokens: HashSet<String>,
}

impl TokenAllowList {
    pub fn new<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tokens: tokens
                .into_iter()
                .map(Into::into)
                .filter(|t: &String| !t.is_empty())
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[async_trait]
impl AccessGate for TokenAllowList {
    async fn validate(&self, token: &str) -> bool {
        self.tokens.contains(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_allow_list() {
        let gate = TokenAllowList::new(["alpha", "beta", ""]);
        assert_eq!(gate.len(), 2);
        assert!(gate.validate("alpha").await);
        assert!(!gate.validate("gamma").await);
        assert!(!gate.validate("").await);
    }

    #[tokio::test]
    async fn test_allow_all() {
        assert!(AllowAll.validate("").await);
    }
}
