//! Temporary HTTP server answering HTTP-01 validation requests.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use hyper::Server;
use log::{debug, info};
use tokio::{sync::oneshot, task::JoinHandle};

use crate::{
    challenge::ChallengeNotifier,
    error::ResponderError,
    services::challenge::{Challenge, MakeChallenge},
};

/// Handle of a running responder.
///
/// The listener is released by [`stop`](Self::stop), or, if the handle is dropped without being
/// stopped, by the shutdown signal sent from `Drop`.
pub struct ChallengeResponder {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<Result<(), hyper::Error>>>,
}

impl ChallengeResponder {
    /// Bind `addr` and start serving challenges from `challenges`. Must be called from within a
    /// tokio runtime.
    pub fn start(
        addr: SocketAddr,
        challenges: Arc<ChallengeNotifier>,
        timeout: Duration,
    ) -> Result<Self, ResponderError> {
        let server = Server::try_bind(&addr)
            .map_err(|source| ResponderError::Bind { addr, source })?
            .serve(MakeChallenge::new(Challenge::new(challenges, timeout)));
        let addr = server.local_addr();

        let (tx, rx) = oneshot::channel::<()>();
        let task = tokio::spawn(server.with_graceful_shutdown(async move {
            rx.await.ok();
        }));

        info!("challenge responder listening on {addr}");

        Ok(Self {
            addr,
            shutdown: Some(tx),
            task: Some(task),
        })
    }

    pub const fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Shut the server down and wait until the listener is closed.
    pub async fn stop(mut self) -> Result<(), ResponderError> {
        self.signal();

        if let Some(task) = self.task.take() {
            task.await?.map_err(ResponderError::Serve)?;
        }

        info!("challenge responder on {} stopped", self.addr);
        Ok(())
    }

    fn signal(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            debug!("signalling challenge responder on {} to shut down", self.addr);
            tx.send(()).ok();
        }
    }
}

impl Drop for ChallengeResponder {
    fn drop(&mut self) {
        self.signal();
    }
}
