//! HTTP-01 validation service.

use std::{
    convert::Infallible,
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use futures_util::future;
use hyper::{
    header::{HeaderValue, CONTENT_TYPE},
    server::conn::AddrStream,
    Body, Method, Request, Response, StatusCode,
};
use log::debug;
use tower::{Service, ServiceBuilder};

use super::log::{AccessLog, AccessLogLayer};
use crate::challenge::{ChallengeNotifier, CHALLENGE_PREFIX};

type ResponseFuture<T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send>>;

#[derive(Clone)]
pub struct Challenge {
    challenges: Arc<ChallengeNotifier>,
    timeout: Duration,
}

impl Challenge {
    pub const fn new(challenges: Arc<ChallengeNotifier>, timeout: Duration) -> Self {
        Self {
            challenges,
            timeout,
        }
    }
}

impl Service<Request<Body>> for Challenge {
    type Response = Response<Body>;
    type Error = Infallible;
    type Future = ResponseFuture<Self::Response, Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Ok(()).into()
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let token = token(&req).map(str::to_owned);
        let challenges = Arc::clone(&self.challenges);
        let timeout = self.timeout;

        Box::pin(async move {
            let Some(token) = token else {
                return Ok(status(StatusCode::NOT_FOUND));
            };

            match challenges.wait_for(&token, timeout).await {
                Some(key_authorization) => {
                    let mut rsp = Response::new(Body::from(key_authorization));
                    rsp.headers_mut()
                        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
                    Ok(rsp)
                }
                None => {
                    debug!("no challenge published for token {token} within {timeout:?}");
                    Ok(status(StatusCode::NOT_FOUND))
                }
            }
        })
    }
}

/// Token part of a well-formed validation request.
fn token<T>(req: &Request<T>) -> Option<&str> {
    if req.method() != Method::GET && req.method() != Method::HEAD {
        return None;
    }

    req.uri()
        .path()
        .strip_prefix(CHALLENGE_PREFIX)
        .filter(|token| !token.is_empty() && !token.contains('/'))
}

fn status(code: StatusCode) -> Response<Body> {
    let mut rsp = Response::new(Body::empty());
    *rsp.status_mut() = code;
    rsp
}

pub struct MakeChallenge {
    inner: Challenge,
}

impl MakeChallenge {
    pub const fn new(inner: Challenge) -> Self {
        Self { inner }
    }
}

impl Service<&AddrStream> for MakeChallenge {
    type Response = AccessLog<Challenge>;
    type Error = Infallible;
    type Future = future::Ready<Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Ok(()).into()
    }

    fn call(&mut self, conn: &AddrStream) -> Self::Future {
        future::ok(
            ServiceBuilder::new()
                .layer(AccessLogLayer::new(conn.remote_addr()))
                .service(self.inner.clone()),
        )
    }
}
