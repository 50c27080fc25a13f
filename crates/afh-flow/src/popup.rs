// SPDX-License-Identifier: MIT OR Apache-2.0
//! Two-stage popup handshake.
//!
//! A [`PopupHandshake`] is armed on the parent surface *before* the action
//! that opens the popup, then moves through
//! [`HandshakeState::AwaitingAppearance`] → [`HandshakeState::AwaitingClosure`]
//! → [`HandshakeState::Closed`]. The closure watcher is registered on the
//! popup as soon as its handle arrives, so a popup that closes while
//! credentials are still being typed is not missed. Calling a stage out of
//! order is an error rather than a hang.

use afh_browser::{BrowserError, Surface, SurfaceHandle};
use afh_error::ErrorCode;
use std::fmt;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Where a handshake currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Armed; no popup seen yet.
    AwaitingAppearance,
    /// Popup handle obtained and its closure watcher registered.
    AwaitingClosure,
    /// Popup reported closed.
    Closed,
}

impl fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::AwaitingAppearance => "awaiting-appearance",
            Self::AwaitingClosure => "awaiting-closure",
            Self::Closed => "closed",
        })
    }
}

/// Failures of the popup handshake.
#[derive(Debug, thiserror::Error)]
pub enum PopupSyncError {
    /// No popup appeared before the deadline.
    #[error("no popup appeared within {timeout:?}")]
    NeverOpened {
        /// Deadline that elapsed.
        timeout: Duration,
    },

    /// The popup stayed open past the deadline.
    #[error("popup did not close within {timeout:?}")]
    NeverClosed {
        /// Deadline that elapsed.
        timeout: Duration,
    },

    /// The browser dropped a watcher without resolving it.
    #[error("popup watcher dropped while {state}")]
    WatcherLost {
        /// State the handshake was in.
        state: HandshakeState,
    },

    /// A stage was awaited in the wrong state.
    #[error("popup handshake expected {expected}, was {actual}")]
    OutOfOrder {
        /// State the call requires.
        expected: HandshakeState,
        /// State the handshake was in.
        actual: HandshakeState,
    },

    /// Registering a watcher failed.
    #[error(transparent)]
    Browser(#[from] BrowserError),
}

impl PopupSyncError {
    /// Stable code for reporting.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NeverOpened { .. } | Self::WatcherLost { .. } => ErrorCode::PopupNeverOpened,
            Self::NeverClosed { .. } => ErrorCode::PopupNeverClosed,
            Self::OutOfOrder { .. } => ErrorCode::PopupOutOfOrder,
            Self::Browser(e) => e.code(),
        }
    }
}

/// One popup's appearance-then-closure handshake.
pub struct PopupHandshake {
    state: HandshakeState,
    timeout: Duration,
    appeared: Option<oneshot::Receiver<SurfaceHandle>>,
    closed: Option<oneshot::Receiver<()>>,
    popup: Option<SurfaceHandle>,
}

impl fmt::Debug for PopupHandshake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PopupHandshake")
            .field("state", &self.state)
            .field("timeout", &self.timeout)
            .field("popup", &self.popup.as_ref().map(|p| p.id().to_string()))
            .finish()
    }
}

impl PopupHandshake {
    /// Register the appearance watcher on `parent`. Call this before the
    /// click that opens the popup.
    pub async fn arm(parent: &dyn Surface, timeout: Duration) -> Result<Self, PopupSyncError> {
        let rx = parent.on_popup_opened().await?;
        debug!(target: "afh.popup", parent = parent.id(), "appearance watcher armed");
        Ok(Self::from_watcher(rx, timeout))
    }

    /// Build a handshake around an already-registered appearance watcher.
    pub fn from_watcher(appeared: oneshot::Receiver<SurfaceHandle>, timeout: Duration) -> Self {
        Self {
            state: HandshakeState::AwaitingAppearance,
            timeout,
            appeared: Some(appeared),
            closed: None,
            popup: None,
        }
    }

    /// Current state.
    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// The popup, once it has appeared.
    pub fn popup(&self) -> Option<&SurfaceHandle> {
        self.popup.as_ref()
    }

    /// First suspension point: wait for the popup and register its closure
    /// watcher before returning the handle.
    pub async fn await_appearance(&mut self) -> Result<SurfaceHandle, PopupSyncError> {
        self.expect_state(HandshakeState::AwaitingAppearance)?;
        let rx = self.appeared.take().ok_or(PopupSyncError::WatcherLost {
            state: self.state,
        })?;

        let popup = match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(popup)) => popup,
            Ok(Err(_)) => {
                return Err(PopupSyncError::WatcherLost {
                    state: self.state,
                });
            }
            Err(_) => {
                warn!(target: "afh.popup", timeout = ?self.timeout, "popup never opened");
                return Err(PopupSyncError::NeverOpened {
                    timeout: self.timeout,
                });
            }
        };

        self.closed = Some(popup.on_closed().await?);
        self.state = HandshakeState::AwaitingClosure;
        self.popup = Some(popup.clone());
        debug!(target: "afh.popup", popup = popup.id(), "popup appeared");
        Ok(popup)
    }

    /// Second suspension point: wait for the popup to close.
    pub async fn await_closure(&mut self) -> Result<(), PopupSyncError> {
        self.expect_state(HandshakeState::AwaitingClosure)?;
        let rx = self.closed.take().ok_or(PopupSyncError::WatcherLost {
            state: self.state,
        })?;

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                return Err(PopupSyncError::WatcherLost {
                    state: self.state,
                });
            }
            Err(_) => {
                warn!(target: "afh.popup", timeout = ?self.timeout, "popup never closed");
                return Err(PopupSyncError::NeverClosed {
                    timeout: self.timeout,
                });
            }
        }

        self.state = HandshakeState::Closed;
        debug!(target: "afh.popup", "popup closed");
        Ok(())
    }

    fn expect_state(&self, expected: HandshakeState) -> Result<(), PopupSyncError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(PopupSyncError::OutOfOrder {
                expected,
                actual: self.state,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use afh_browser::{Browser, BrowsingContext};
    use afh_browser_mock::MockBrowser;

    const T: Duration = Duration::from_millis(200);

    #[tokio::test]
    async fn closure_before_appearance_is_out_of_order() {
        let (_tx, rx) = oneshot::channel::<SurfaceHandle>();
        let mut hs = PopupHandshake::from_watcher(rx, T);
        let err = hs.await_closure().await.unwrap_err();
        assert!(matches!(
            err,
            PopupSyncError::OutOfOrder {
                expected: HandshakeState::AwaitingClosure,
                actual: HandshakeState::AwaitingAppearance,
            }
        ));
        assert_eq!(err.code(), ErrorCode::PopupOutOfOrder);
        assert_eq!(hs.state(), HandshakeState::AwaitingAppearance);
    }

    #[tokio::test(start_paused = true)]
    async fn appearance_times_out() {
        let (_tx, rx) = oneshot::channel::<SurfaceHandle>();
        let mut hs = PopupHandshake::from_watcher(rx, T);
        let err = hs.await_appearance().await.err().expect("expected an error");
        assert!(matches!(err, PopupSyncError::NeverOpened { .. }));
        assert_eq!(err.code(), ErrorCode::PopupNeverOpened);
    }

    #[tokio::test]
    async fn dropped_watcher_is_reported() {
        let (tx, rx) = oneshot::channel::<SurfaceHandle>();
        drop(tx);
        let mut hs = PopupHandshake::from_watcher(rx, T);
        let err = hs.await_appearance().await.err().expect("expected an error");
        assert!(matches!(
            err,
            PopupSyncError::WatcherLost {
                state: HandshakeState::AwaitingAppearance
            }
        ));
    }

    #[tokio::test]
    async fn already_closed_popup_completes_the_handshake() {
        let browser = MockBrowser::default();
        let ctx = browser.new_context().await.unwrap();
        let popup = ctx.new_page().await.unwrap();
        popup.close().await.unwrap();

        let (tx, rx) = oneshot::channel();
        let mut hs = PopupHandshake::from_watcher(rx, T);
        tx.send(popup).ok();
        hs.await_appearance().await.unwrap();
        assert_eq!(hs.state(), HandshakeState::AwaitingClosure);
        hs.await_closure().await.unwrap();
        assert_eq!(hs.state(), HandshakeState::Closed);

        let err = hs.await_appearance().await.err().expect("expected an error");
        assert!(matches!(err, PopupSyncError::OutOfOrder { .. }));
    }
}
