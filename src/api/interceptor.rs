use crate::api::client::RequestConfig;
use crate::api::error::{FetchError, TransportError};
use crate::api::session::Session;
use crate::api::transport::Method;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tokio::sync::mpsc;

/// Poller-originated network failures tolerated before the user is told the
/// connection is gone.
pub const CONNECTION_LOST_THRESHOLD: u32 = 3;

const FORBIDDEN_MESSAGE: &str = "You do not have the permissions to complete this operation";
const SERVER_ERROR_MESSAGE: &str = "An unexpected error occurred on the server";
const BAD_REQUEST_MESSAGE: &str = "The server could not process the request";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// Dismissible, shown for a single failed call.
    Transient { title: String, message: String },
    /// Persistent; raised once per process.
    ConnectionLost,
    /// The session was cleared after a 401.
    SessionExpired,
}

impl Notice {
    pub fn title(&self) -> &str {
        match self {
            Notice::Transient { title, .. } => title,
            Notice::ConnectionLost => "Server Error",
            Notice::SessionExpired => "Session Expired",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Notice::Transient { message, .. } => message,
            Notice::ConnectionLost => "Connection to the server was lost! Restart to reconnect.",
            Notice::SessionExpired => "Your session has expired, please log in again.",
        }
    }

    pub fn is_persistent(&self) -> bool {
        !matches!(self, Notice::Transient { .. })
    }
}

/// Global error policy applied to every failed request.
pub struct ErrorInterceptor {
    session: Session,
    notices: Option<mpsc::UnboundedSender<Notice>>,
    network_failures: AtomicU32,
    connection_lost_raised: AtomicBool,
}

impl ErrorInterceptor {
    pub fn new(session: Session) -> Self {
        Self {
            session,
            notices: None,
            network_failures: AtomicU32::new(0),
            connection_lost_raised: AtomicBool::new(false),
        }
    }

    pub fn with_notices(mut self, notices: mpsc::UnboundedSender<Notice>) -> Self {
        self.notices = Some(notices);
        self
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn network_failures(&self) -> u32 {
        self.network_failures.load(Ordering::SeqCst)
    }

    pub fn intercept(&self, method: Method, uri: &str, error: &FetchError, config: &RequestConfig) {
        match error {
            FetchError::Network(TransportError::Redirect(target))
                if self.session.is_authenticated() =>
            {
                // Redirected away from the API, usually towards a login page.
                tracing::warn!(%method, uri, target = %target, "Authorization error, session no longer accepted");
                self.session.clear();
                self.emit(Notice::SessionExpired);
            }
            FetchError::Network(cause) => {
                if !config.poller {
                    tracing::info!(%method, uri, error = %cause, "Request failed without a response");
                    return;
                }

                let failures = self.network_failures.fetch_add(1, Ordering::SeqCst) + 1;
                tracing::warn!(uri, failures, "Connection to the server was lost");

                if failures >= CONNECTION_LOST_THRESHOLD
                    && !self.connection_lost_raised.swap(true, Ordering::SeqCst)
                {
                    self.emit(Notice::ConnectionLost);
                }
            }
            FetchError::Unauthorized => {
                tracing::warn!(%method, uri, "Session rejected by server, clearing local session");
                self.session.clear();
                self.emit(Notice::SessionExpired);
            }
            FetchError::BadRequest { .. } => {
                tracing::info!(%method, uri, error = %error, "A 400 error occurred");
                if config.intercept {
                    self.emit(transient("Bad Request", error, BAD_REQUEST_MESSAGE));
                }
            }
            FetchError::Forbidden { .. } => {
                tracing::info!(%method, uri, "A 403 error occurred");
                if config.intercept {
                    self.emit(Notice::Transient {
                        title: "Forbidden".to_string(),
                        message: FORBIDDEN_MESSAGE.to_string(),
                    });
                }
            }
            FetchError::Server { .. } => {
                tracing::warn!(
                    %method,
                    uri,
                    error = %error,
                    "A 500 error occurred, please notify a system administrator"
                );
                if config.intercept {
                    self.emit(transient("Server Error", error, SERVER_ERROR_MESSAGE));
                }
            }
            FetchError::Unclassified { status, .. } => {
                if *status == 404 {
                    tracing::warn!(%method, uri, "A 404 error occurred, please notify a system administrator");
                } else {
                    tracing::info!(%method, uri, status, "Unclassified error response");
                }
            }
        }
    }

    fn emit(&self, notice: Notice) {
        tracing::debug!(title = notice.title(), message = notice.message(), "Raising notice");
        if let Some(tx) = &self.notices {
            let _ = tx.send(notice);
        }
    }
}

fn transient(title: &str, error: &FetchError, fallback: &str) -> Notice {
    Notice::Transient {
        title: title.to_string(),
        message: error
            .server_message()
            .unwrap_or_else(|| fallback.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn interceptor() -> (ErrorInterceptor, mpsc::UnboundedReceiver<Notice>, Session) {
        let session = Session::new(Some("token".to_string()));
        let (tx, rx) = mpsc::unbounded_channel();
        (
            ErrorInterceptor::new(session.clone()).with_notices(tx),
            rx,
            session,
        )
    }

    fn network() -> FetchError {
        FetchError::Network(TransportError::Timeout)
    }

    #[test]
    fn test_connection_lost_raised_once_after_three_poller_failures() {
        let (interceptor, mut rx, _) = interceptor();
        let poller = RequestConfig::poller();

        interceptor.intercept(Method::Get, "adapters", &network(), &poller);
        interceptor.intercept(Method::Get, "server/warnings", &network(), &poller);
        assert!(rx.try_recv().is_err());

        interceptor.intercept(Method::Get, "adapters", &network(), &poller);
        assert_eq!(rx.try_recv().unwrap(), Notice::ConnectionLost);

        interceptor.intercept(Method::Get, "adapters", &network(), &poller);
        interceptor.intercept(Method::Get, "adapters", &network(), &poller);
        assert!(rx.try_recv().is_err());
        assert_eq!(interceptor.network_failures(), 5);
    }

    #[test]
    fn test_user_requests_do_not_count_towards_connection_lost() {
        let (interceptor, mut rx, _) = interceptor();
        for _ in 0..5 {
            interceptor.intercept(Method::Get, "adapters", &network(), &RequestConfig::default());
        }
        assert!(rx.try_recv().is_err());
        assert_eq!(interceptor.network_failures(), 0);
    }

    #[test]
    fn test_unauthorized_clears_session() {
        let (interceptor, mut rx, session) = interceptor();
        interceptor.intercept(
            Method::Get,
            "adapters",
            &FetchError::Unauthorized,
            &RequestConfig::without_intercept(),
        );
        assert!(!session.is_authenticated());
        assert_eq!(rx.try_recv().unwrap(), Notice::SessionExpired);
    }

    #[test]
    fn test_failed_redirect_expires_authenticated_session() {
        let (interceptor, mut rx, session) = interceptor();
        let redirect = FetchError::Network(TransportError::Redirect("status 302".to_string()));

        interceptor.intercept(Method::Get, "adapters", &redirect, &RequestConfig::poller());
        assert!(!session.is_authenticated());
        assert_eq!(rx.try_recv().unwrap(), Notice::SessionExpired);
        assert_eq!(interceptor.network_failures(), 0);

        // Without a session it is an ordinary network failure.
        interceptor.intercept(Method::Get, "adapters", &redirect, &RequestConfig::poller());
        assert_eq!(interceptor.network_failures(), 1);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_server_error_uses_body_message() {
        let (interceptor, mut rx, _) = interceptor();
        let error = FetchError::from_status(500, json!({"error": "Configuration is locked"}));
        interceptor.intercept(Method::Put, "configurations", &error, &RequestConfig::default());

        assert_eq!(
            rx.try_recv().unwrap(),
            Notice::Transient {
                title: "Server Error".to_string(),
                message: "Configuration is locked".to_string(),
            }
        );
    }

    #[test]
    fn test_generic_message_and_intercept_opt_out() {
        let (interceptor, mut rx, _) = interceptor();
        let error = FetchError::from_status(400, Value::Null);

        interceptor.intercept(Method::Post, "jobs", &error, &RequestConfig::without_intercept());
        assert!(rx.try_recv().is_err());

        interceptor.intercept(Method::Post, "jobs", &error, &RequestConfig::default());
        let notice = rx.try_recv().unwrap();
        assert_eq!(notice.message(), BAD_REQUEST_MESSAGE);
        assert!(!notice.is_persistent());
    }
}
