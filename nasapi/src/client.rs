//! The shared appliance client. One instance per process; every verb in the
//! sibling modules is an `impl ApiClient` block over this struct.

use jsonrpc::{RpcClient, RpcClientConfig};
use serde::de::DeserializeOwned;
use serde_json::Value;
use snafu::ResultExt;

use crate::error::{classify, ApiError, InvalidReplySnafu};

/// Handle to the single authenticated appliance session. Clones share the
/// underlying websocket; concurrent verbs are multiplexed by request id.
#[derive(Clone)]
pub struct ApiClient {
    rpc: RpcClient,
}

impl ApiClient {
    /// Connect and authenticate. The endpoint, key and TLS policy are fixed
    /// for the client's life.
    pub async fn connect(
        host: &str,
        api_key: &str,
        accept_invalid_certs: bool,
    ) -> Result<ApiClient, ApiError> {
        let mut config =
            RpcClientConfig::new(host, api_key).map_err(|source| ApiError::Transport { source })?;
        config.accept_invalid_certs = accept_invalid_certs;
        let rpc = RpcClient::connect(config)
            .await
            .map_err(|source| ApiError::Transport { source })?;
        Ok(ApiClient { rpc })
    }

    /// Whether the underlying session is currently established.
    pub fn healthy(&self) -> bool {
        self.rpc.healthy()
    }

    /// Raw verb call with positional parameters.
    pub(crate) async fn call(&self, method: &str, params: Value) -> Result<Value, ApiError> {
        debug!("appliance call {}", method);
        self.rpc
            .call(method, Some(params))
            .await
            .map_err(|error| classify(method, error))
    }

    /// Verb call with the reply deserialised into `T`.
    pub(crate) async fn call_de<T>(&self, method: &str, params: Value) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
    {
        let reply = self.call(method, params).await?;
        serde_json::from_value(reply).context(InvalidReplySnafu { method })
    }
}
