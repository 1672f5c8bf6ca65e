use async_trait::async_trait;

use super::message::ProxyResponse;
use super::request::ProxyRequest;

/// What the transport should do with a request after the pre-fetch hook ran.
#[derive(Debug)]
pub enum RequestAction {
    /// Forward the request upstream.
    Proceed,
    /// Answer the client with this response without contacting upstream.
    Respond(ProxyResponse),
}

/// Pre- and post-fetch extension points of the proxy transport.
#[async_trait]
pub trait Interceptor: Send + Sync {
    async fn on_request(&self, request: &ProxyRequest) -> RequestAction;

    async fn on_response(&self, request: &ProxyRequest, response: ProxyResponse) -> ProxyResponse;
}

/// Forwards everything untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassThrough;

#[async_trait]
impl Interceptor for PassThrough {
    async fn on_request(&self, _request: &ProxyRequest) -> RequestAction {
        RequestAction::Proceed
    }

    async fn on_response(&self, _request: &ProxyRequest, response: ProxyResponse) -> ProxyResponse {
        response
    }
}
