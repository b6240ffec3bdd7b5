use std::fmt;

use tokio_util::sync::CancellationToken as TokioToken;

/// The owning side of a cancellation signal.
///
/// Tokens handed out by `child_token` observe the cancellation requested
/// through this source. Dropping the source does not cancel its tokens.
pub struct CancellationTokenSource {
    token_: TokioToken,
}

impl CancellationTokenSource {
    pub fn new() -> Self {
        CancellationTokenSource { token_: TokioToken::new() }
    }

    pub fn child_token(&self) -> CancellationToken {
        CancellationToken(Option::Some(self.token_.child_token()))
    }

    pub fn is_cancelled(&self) -> bool {
        self.token_.is_cancelled()
    }

    /// Requests cancellation. Returns `false` if it was already requested.
    pub fn try_cancel(&self) -> bool {
        if self.token_.is_cancelled() {
            return false;
        }
        log::trace!("[CancellationTokenSource::try_cancel] {:p}", self);
        self.token_.cancel();
        true
    }
}

impl Default for CancellationTokenSource {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancellationTokenSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CancellationTokenSource({:p}, cancelled: {})",
            self,
            self.is_cancelled(),
        )
    }
}

/// A cheaply cloneable observer of a `CancellationTokenSource`.
///
/// `CancellationToken::none()` never cancels. Any
/// `tokio_util::sync::CancellationToken` converts into one.
#[derive(Clone, Default)]
pub struct CancellationToken(Option<TokioToken>);

impl CancellationToken {
    pub const fn none() -> Self {
        CancellationToken(Option::None)
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.as_ref().is_some_and(TokioToken::is_cancelled)
    }

    pub fn can_be_cancelled(&self) -> bool {
        self.0.is_some()
    }

    /// Completes once cancellation is requested; pending forever for a token
    /// that can never be cancelled.
    pub async fn cancelled(&self) {
        match &self.0 {
            Option::Some(t) => t.cancelled().await,
            Option::None => futures_lite::future::pending().await,
        }
    }
}

impl From<TokioToken> for CancellationToken {
    fn from(token: TokioToken) -> Self {
        CancellationToken(Option::Some(token))
    }
}

impl fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Option::Some(t) => write!(f, "CancellationToken(cancelled: {})", t.is_cancelled()),
            Option::None => write!(f, "CancellationToken(none)"),
        }
    }
}
