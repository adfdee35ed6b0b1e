//! Access log of the challenge responder.
//!
//! Validation requests are reported with their token, the outcome and how long the validator had
//! to wait for the answer. Anything else hitting the port is only logged at debug level.

use std::{
    future::Future,
    net::SocketAddr,
    pin::Pin,
    task::{Context, Poll},
    time::Instant,
};

use headers::{HeaderMapExt, Host, UserAgent};
use hyper::{Method, Request, Response, StatusCode};
use log::{debug, info, warn};
use pin_project::pin_project;
use tower::{layer::Layer, Service};

use crate::challenge::CHALLENGE_PREFIX;

pub struct AccessLogLayer {
    remote_addr: SocketAddr,
}

impl AccessLogLayer {
    pub const fn new(remote_addr: SocketAddr) -> Self {
        Self { remote_addr }
    }
}

impl<S> Layer<S> for AccessLogLayer {
    type Service = AccessLog<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AccessLog {
            remote_addr: self.remote_addr,
            inner,
        }
    }
}

pub struct AccessLog<S> {
    remote_addr: SocketAddr,
    inner: S,
}

impl<S, B, R> Service<Request<B>> for AccessLog<S>
where
    S: Service<Request<B>, Response = Response<R>>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = ResponseFuture<S::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        let entry = Entry {
            remote_addr: self.remote_addr,
            method: req.method().clone(),
            path: req.uri().path().to_owned(),
            host: req.headers().typed_get::<Host>().map(|h| h.hostname().to_owned()),
            user_agent: req.headers().typed_get::<UserAgent>().map(|ua| ua.to_string()),
            start: Instant::now(),
        };

        ResponseFuture {
            entry,
            response: self.inner.call(req),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Outcome<'a> {
    Served(&'a str),
    Missing(&'a str),
    Other,
}

impl<'a> Outcome<'a> {
    fn classify(path: &'a str, status: StatusCode) -> Self {
        match path.strip_prefix(CHALLENGE_PREFIX) {
            Some(token) if !token.is_empty() && status.is_success() => Self::Served(token),
            Some(token) if !token.is_empty() => Self::Missing(token),
            _ => Self::Other,
        }
    }
}

struct Entry {
    remote_addr: SocketAddr,
    method: Method,
    path: String,
    host: Option<String>,
    user_agent: Option<String>,
    start: Instant,
}

impl Entry {
    fn finish(&self, status: StatusCode) {
        let ip = self.remote_addr.ip();
        let host = self.host.as_deref().unwrap_or("-");
        let agent = self.user_agent.as_deref().unwrap_or("-");
        let waited = self.start.elapsed().as_millis();

        match Outcome::classify(&self.path, status) {
            Outcome::Served(token) => {
                info!("{ip} validated token {token} for {host} after {waited}ms ({agent})");
            }
            Outcome::Missing(token) => {
                warn!("{ip} asked for unknown token {token} on {host} for {waited}ms ({agent})");
            }
            Outcome::Other => debug!(
                "{ip} {} {} on {host}: {} ({agent})",
                self.method,
                self.path,
                status.as_u16()
            ),
        }
    }
}

#[pin_project]
pub struct ResponseFuture<F> {
    entry: Entry,
    #[pin]
    response: F,
}

impl<F, R, E> Future for ResponseFuture<F>
where
    F: Future<Output = Result<Response<R>, E>>,
{
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let rsp = futures_util::ready!(this.response.poll(cx));

        if let Ok(rsp) = &rsp {
            this.entry.finish(rsp.status());
        }

        Poll::Ready(rsp)
    }
}
