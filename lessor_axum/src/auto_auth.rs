//! The auto-auth token as seen by the request handler

use std::{fmt, str::FromStr, sync::Arc};

use arc_swap::ArcSwapOption;
use lessor_tokens::Token;

/// Whether requests are sent with the auto-auth token
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum UseAutoAuth {
    /// Always use the caller's token
    #[default]
    Never,
    /// Use the auto-auth token when the caller sends none
    WhenMissing,
    /// Replace the caller's token with the auto-auth token
    Force,
}

impl FromStr for UseAutoAuth {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "false" => Ok(Self::Never),
            "true" => Ok(Self::WhenMissing),
            "force" => Ok(Self::Force),
            other => Err(format!(
                "unknown auto-auth token use `{}`; expected true, false or force",
                other
            )),
        }
    }
}

/// The latest token obtained by auto-auth
///
/// Cheaply cloneable; clones observe the same token.
#[derive(Clone, Default)]
pub struct AutoAuthToken {
    current: Arc<ArcSwapOption<Token>>,
}

impl fmt::Debug for AutoAuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AutoAuthToken")
            .field("current", &self.current.load().as_deref())
            .finish()
    }
}

impl AutoAuthToken {
    /// A holder with no token yet
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the current token
    pub fn set(&self, token: Token) {
        self.current.store(Some(Arc::new(token)));
    }

    /// The current token, if auto-auth has produced one
    pub fn get(&self) -> Option<Arc<Token>> {
        self.current.load_full()
    }

    /// Whether `token` is the current auto-auth token
    pub fn is_current(&self, token: &str) -> bool {
        !token.is_empty()
            && self
                .current
                .load()
                .as_deref()
                .map_or(false, |current| current.as_str() == token)
    }
}
