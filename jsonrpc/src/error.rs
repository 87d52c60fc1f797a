//! Errors surfaced by the websocket json-rpc client. Transport problems and
//! appliance error payloads are kept apart so that callers can classify the
//! latter without string matching on our own messages.

use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("invalid appliance endpoint {endpoint}: {source}"))]
    Endpoint {
        endpoint: String,
        source: url::ParseError,
    },
    #[snafu(display("connection to {endpoint} lost"))]
    ConnectionLost { endpoint: String },
    #[snafu(display("login with api key rejected by {endpoint}"))]
    LoginFailed { endpoint: String },
    #[snafu(display("timed out waiting for login reply from {endpoint}"))]
    LoginTimeout { endpoint: String },
    #[snafu(display("failed to build TLS connector: {source}"))]
    Tls { source: native_tls::Error },
    #[snafu(display("websocket failure: {source}"))]
    Ws {
        source: tokio_tungstenite::tungstenite::Error,
    },
    #[snafu(display("failed to encode json-rpc request: {source}"))]
    EncodeRequest { source: serde_json::Error },
    #[snafu(display("appliance returned error {code}: {message}"))]
    Rpc {
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },
}

impl Error {
    /// True for failures a caller may retry once the client has
    /// re-established its session.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Error::ConnectionLost { .. } | Error::Ws { .. } | Error::LoginTimeout { .. }
        )
    }
}
