// Proxy module - Pingora ProxyHttp implementation
// Puts the instrumentation middleware in front of an HTTP tile server

use async_trait::async_trait;
use http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use pingora_core::upstreams::peer::HttpPeer;
use pingora_core::Result;
use pingora_http::ResponseHeader;
use pingora_proxy::{ProxyHttp, Session};
use std::sync::Arc;
use std::time::Duration;

use crate::classify::Route;
use crate::config::UpstreamConfig;
use crate::endpoints::EndpointResponse;
use crate::middleware::{CachePolicy, Instrumentation, RequestTimer};

const REQUEST_ID_HEADER: &str = "X-Request-ID";

pub mod context;

pub use context::ProxyContext;

/// TileProxy implements the Pingora ProxyHttp trait.
///
/// `/metrics` and manifests are answered in `request_filter`; every other
/// request goes to the tile server with a running [`crate::middleware::RequestTimer`].
pub struct TileProxy {
    instrumentation: Arc<Instrumentation>,
    upstream_host: String,
    upstream_port: u16,
    upstream_tls: bool,
    upstream_sni: String,
    upstream_timeout: Duration,
}

impl TileProxy {
    pub fn new(instrumentation: Arc<Instrumentation>, upstream: &UpstreamConfig) -> Self {
        let (upstream_host, upstream_port) = upstream.host_port();
        Self {
            instrumentation,
            upstream_host,
            upstream_port,
            upstream_tls: upstream.tls,
            upstream_sni: upstream.sni_host(),
            upstream_timeout: Duration::from_secs(upstream.timeout_secs),
        }
    }
}

/// Write a middleware-generated response and end the request
async fn write_endpoint_response(session: &mut Session, response: EndpointResponse) -> Result<()> {
    let mut header = ResponseHeader::build(response.status, None)?;
    header.insert_header(CONTENT_TYPE, response.content_type)?;
    header.insert_header(CONTENT_LENGTH, response.content_length().to_string())?;
    for (name, value) in response.headers {
        header.insert_header(name, value)?;
    }

    session
        .write_response_header(Box::new(header), false)
        .await?;
    session
        .write_response_body(Some(response.body), true)
        .await?;
    Ok(())
}

/// Replace the tile server's cache headers with the policy's
pub fn apply_cache_policy(policy: CachePolicy, header: &mut ResponseHeader) -> Result<()> {
    for name in &CachePolicy::STRIPPED {
        header.remove_header(name);
    }
    for (name, value) in policy.headers() {
        header.append_header(name.clone(), *value)?;
    }
    Ok(())
}

/// Everything done to the tile server's response header before it is sent
pub fn prepare_upstream_response(
    policy: CachePolicy,
    header: &mut ResponseHeader,
    ctx: &mut ProxyContext,
) -> Result<()> {
    if let Some(timer) = ctx.timer_mut() {
        timer.set_status(header.status.as_u16());
    }
    apply_cache_policy(policy, header)?;
    header.insert_header(REQUEST_ID_HEADER, ctx.request_id())?;
    Ok(())
}

/// Errors raised before the tile server answered still produce a response;
/// its status is recorded unless the tile server's was captured
pub fn settle_status(timer: &mut RequestTimer, written: Option<&ResponseHeader>) {
    if timer.status().is_some() {
        return;
    }
    if let Some(resp) = written {
        timer.set_status(resp.status.as_u16());
    }
}

#[async_trait]
impl ProxyHttp for TileProxy {
    type CTX = ProxyContext;

    fn new_ctx(&self) -> Self::CTX {
        ProxyContext::new()
    }

    /// The single tile server behind this proxy
    async fn upstream_peer(
        &self,
        _session: &mut Session,
        _ctx: &mut Self::CTX,
    ) -> Result<Box<HttpPeer>> {
        let mut peer = Box::new(HttpPeer::new(
            (self.upstream_host.clone(), self.upstream_port),
            self.upstream_tls,
            self.upstream_sni.clone(),
        ));

        peer.options.connection_timeout = Some(self.upstream_timeout);
        peer.options.read_timeout = Some(self.upstream_timeout);
        peer.options.write_timeout = Some(self.upstream_timeout);

        Ok(peer)
    }

    /// Serve built-in endpoints, classify and time everything else
    async fn request_filter(&self, session: &mut Session, ctx: &mut Self::CTX) -> Result<bool> {
        let path = session.req_header().uri.path().to_string();

        match self.instrumentation.route(&path) {
            Route::Metrics => {
                let response = self.instrumentation.serve_metrics().await;
                write_endpoint_response(session, response).await?;
                Ok(true)
            }
            Route::Manifest(name) => {
                let response = self.instrumentation.serve_manifest(&name).await;
                tracing::debug!(
                    request_id = %ctx.request_id(),
                    manifest = %name,
                    status = response.status,
                    "Served manifest"
                );
                write_endpoint_response(session, response).await?;
                Ok(true)
            }
            Route::Delegate(class) => {
                ctx.start(self.instrumentation.start(class));
                Ok(false)
            }
        }
    }

    /// Capture the tile server's status and force the cache policy
    fn upstream_response_filter(
        &self,
        _session: &mut Session,
        upstream_response: &mut ResponseHeader,
        ctx: &mut Self::CTX,
    ) -> Result<()> {
        prepare_upstream_response(self.instrumentation.policy(), upstream_response, ctx).map_err(
            |e| {
                tracing::warn!(
                    request_id = %ctx.request_id(),
                    error = ?e,
                    "Failed to rewrite tile server response headers"
                );
                e
            },
        )
    }

    /// Record request metrics once the response is finished
    async fn logging(
        &self,
        session: &mut Session,
        e: Option<&pingora_core::Error>,
        ctx: &mut Self::CTX,
    ) {
        let Some(mut timer) = ctx.take_timer() else {
            return;
        };
        settle_status(&mut timer, session.response_written());

        if let Some(error) = e {
            tracing::warn!(
                request_id = %ctx.request_id(),
                path = %session.req_header().uri.path(),
                error = %error,
                "Delegated request failed"
            );
        }

        tracing::debug!(
            request_id = %ctx.request_id(),
            method = %session.req_header().method,
            path = %session.req_header().uri.path(),
            status = ?timer.status(),
            "Request completed"
        );
        timer.finish();
    }
}
