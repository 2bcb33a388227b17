//! Short-lived tunnels to a broker pod's admin API
//!
//! A [`TunnelHandle`] owns one port-forward to one pod and one HTTP/1
//! connection over it. Tunnels are never pooled: every check targets a
//! specific, possibly replaced pod, so each call acquires a fresh tunnel and
//! releases it before returning. Dropping a handle (including when the
//! enclosing reconcile future is cancelled) aborts the forwarder and the
//! connection task.
//!
//! Failure outcomes stay distinct. Failing to open the tunnel is
//! [`Error::Tunnel`], losing the request on the wire is [`Error::Transport`],
//! and any HTTP status, 2xx or not, is a successful [`AdminResponse`].

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use http::{header, Method, Request, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1::SendRequest;
use hyper_util::rt::TokioIo;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, Portforwarder};
use kube::Client;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

#[cfg(test)]
use mockall::automock;

use emqx_common::hocon::AdminCredentials;
use emqx_common::Error;

/// Default bound on tunnel establishment and on each request
pub const DEFAULT_TUNNEL_TIMEOUT: Duration = Duration::from_secs(10);

/// The pod and port an admin call is addressed to
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PodTarget {
    /// Namespace of the pod
    pub namespace: String,
    /// Pod name
    pub pod: String,
    /// Admin port inside the pod
    pub port: u16,
}

impl PodTarget {
    /// Target a pod's admin port
    pub fn new(namespace: impl Into<String>, pod: impl Into<String>, port: u16) -> Self {
        Self {
            namespace: namespace.into(),
            pod: pod.into(),
            port,
        }
    }
}

/// An authenticated request to the broker's REST API
#[derive(Clone, Debug)]
pub struct AdminRequest {
    /// HTTP method
    pub method: Method,
    /// Path and query, e.g. `/api/v5/nodes`
    pub path: String,
    /// Optional JSON body
    pub body: Option<serde_json::Value>,
    /// Shared cluster admin credentials
    pub credentials: AdminCredentials,
}

impl AdminRequest {
    /// A GET request with no body
    pub fn get(path: impl Into<String>, credentials: AdminCredentials) -> Self {
        Self {
            method: Method::GET,
            path: path.into(),
            body: None,
            credentials,
        }
    }
}

/// Status and body of an admin API response
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AdminResponse {
    /// HTTP status code
    pub status: StatusCode,
    /// Raw response body
    pub body: Bytes,
}

impl AdminResponse {
    /// True for 2xx statuses
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Decode the body as JSON
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, Error> {
        serde_json::from_slice(&self.body)
            .map_err(|e| Error::serialization(format!("admin response: {e}")))
    }
}

/// Issues admin API calls against individual broker pods
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BrokerAdmin: Send + Sync {
    /// Send one request to `target`
    ///
    /// Non-2xx answers are returned as responses, never as errors.
    async fn request(
        &self,
        target: &PodTarget,
        request: &AdminRequest,
    ) -> Result<AdminResponse, Error>;
}

/// [`BrokerAdmin`] that opens a fresh port-forward for every request
pub struct PortForwardAdmin {
    client: Client,
    timeout: Duration,
}

impl PortForwardAdmin {
    /// Create an admin client bounding each tunnel operation by `timeout`
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }
}

#[async_trait]
impl BrokerAdmin for PortForwardAdmin {
    async fn request(
        &self,
        target: &PodTarget,
        request: &AdminRequest,
    ) -> Result<AdminResponse, Error> {
        let mut tunnel = TunnelHandle::acquire(self.client.clone(), target, self.timeout).await?;
        let result = tunnel.call(request).await;
        tunnel.release().await;
        result
    }
}

/// A live tunnel to one pod's port
pub struct TunnelHandle {
    pod: String,
    port: u16,
    timeout: Duration,
    sender: SendRequest<Full<Bytes>>,
    connection: JoinHandle<()>,
    forwarder: Option<Portforwarder>,
}

impl TunnelHandle {
    /// Port-forward to `target` and open an HTTP/1 connection over it
    #[instrument(skip(client), fields(pod = %target.pod, port = target.port))]
    pub async fn acquire(
        client: Client,
        target: &PodTarget,
        timeout: Duration,
    ) -> Result<Self, Error> {
        let pods: Api<Pod> = Api::namespaced(client, &target.namespace);
        let establish = async {
            let mut forwarder = pods
                .portforward(&target.pod, &[target.port])
                .await
                .map_err(|e| Error::tunnel(&target.pod, target.port, e.to_string()))?;
            let stream = forwarder.take_stream(target.port).ok_or_else(|| {
                Error::tunnel(&target.pod, target.port, "port-forward returned no stream")
            })?;
            let mut handle = Self::from_stream(&target.pod, target.port, stream, timeout).await?;
            handle.forwarder = Some(forwarder);
            Ok::<_, Error>(handle)
        };

        tokio::time::timeout(timeout, establish)
            .await
            .map_err(|_| {
                Error::tunnel(
                    &target.pod,
                    target.port,
                    format!("timed out after {timeout:?}"),
                )
            })?
    }

    /// Open an HTTP/1 connection over an already established byte stream
    pub async fn from_stream<S>(
        pod: &str,
        port: u16,
        stream: S,
        timeout: Duration,
    ) -> Result<Self, Error>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| Error::tunnel(pod, port, format!("HTTP handshake failed: {e}")))?;

        let conn_pod = pod.to_string();
        let connection = tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(pod = %conn_pod, error = %e, "admin connection closed");
            }
        });

        Ok(Self {
            pod: pod.to_string(),
            port,
            timeout,
            sender,
            connection,
            forwarder: None,
        })
    }

    /// Pod this tunnel is bound to
    pub fn pod(&self) -> &str {
        &self.pod
    }

    /// Send one request and read the whole response
    pub async fn call(&mut self, request: &AdminRequest) -> Result<AdminResponse, Error> {
        let body = match &request.body {
            Some(json) => Bytes::from(serde_json::to_vec(json)?),
            None => Bytes::new(),
        };
        let auth = STANDARD.encode(format!(
            "{}:{}",
            request.credentials.username, request.credentials.password
        ));
        let req = Request::builder()
            .method(request.method.clone())
            .uri(request.path.as_str())
            .header(header::HOST, "localhost")
            .header(header::AUTHORIZATION, format!("Basic {auth}"))
            .header(header::ACCEPT, "application/json")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Full::new(body))
            .map_err(|e| Error::transport(&self.pod, format!("invalid request: {e}")))?;

        let pod = self.pod.clone();
        let sender = &mut self.sender;
        let exchange = async move {
            sender
                .ready()
                .await
                .map_err(|e| Error::transport(&pod, format!("connection not ready: {e}")))?;
            let response = sender
                .send_request(req)
                .await
                .map_err(|e| Error::transport(&pod, format!("request failed: {e}")))?;
            let status = response.status();
            let body = response
                .into_body()
                .collect()
                .await
                .map_err(|e| Error::transport(&pod, format!("failed to read body: {e}")))?
                .to_bytes();
            Ok::<_, Error>(AdminResponse { status, body })
        };

        let response = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| {
                Error::transport(&self.pod, format!("timed out after {:?}", self.timeout))
            })??;

        debug!(
            pod = %self.pod,
            method = %request.method,
            path = %request.path,
            status = response.status.as_u16(),
            "admin call completed"
        );
        Ok(response)
    }

    /// Tear the tunnel down
    pub async fn release(mut self) {
        self.shutdown();
        if let Err(e) = (&mut self.connection).await {
            if !e.is_cancelled() {
                warn!(pod = %self.pod, port = self.port, error = %e, "admin connection task failed");
            }
        }
    }

    fn shutdown(&mut self) {
        self.connection.abort();
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
    }
}

impl Drop for TunnelHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
