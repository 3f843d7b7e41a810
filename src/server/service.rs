//! The transport facing side of the signer.
//!
//! Requests are put on a bounded queue and picked up by a fixed number of
//! workers. Handlers are synchronous and may block on device I/O, so each
//! worker runs its request on the blocking thread pool. How requests reach
//! [`ServiceHandle::call`] is up to the transport.
use std::{sync::Arc, time::Duration};

use tokio::{
    sync::{mpsc, oneshot, watch, Mutex},
    task::JoinHandle,
};

use crate::{
    commons::{
        error::{Error, ErrorResponse},
        SignerResult,
    },
    constants::REQUEST_QUEUE_SIZE,
    handlers::{Request, Response},
    server::Dispatcher,
};

struct Job {
    request: Request,
    reply: oneshot::Sender<SignerResult<Response>>,
}

//------------ ServiceHandle -------------------------------------------------

/// A cheap, clonable handle for submitting requests.
#[derive(Clone, Debug)]
pub struct ServiceHandle {
    sender: mpsc::Sender<Job>,
}

impl ServiceHandle {
    /// Submits a request and waits for its result.
    pub async fn call(&self, request: Request) -> Result<Response, ErrorResponse> {
        let (reply, rx) = oneshot::channel();
        self.sender
            .send(Job { request, reply })
            .await
            .map_err(|_| Error::ShuttingDown.to_error_response())?;

        match rx.await {
            Ok(res) => res.map_err(|e| e.to_error_response()),
            Err(_) => Err(Error::ShuttingDown.to_error_response()),
        }
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Job({})", self.request)
    }
}

//------------ SignerService -------------------------------------------------

pub struct SignerService {
    dispatcher: Arc<Dispatcher>,
    handle: ServiceHandle,
    stop: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
}

impl SignerService {
    /// Starts the workers. Must be called from within a tokio runtime.
    pub fn start(dispatcher: Arc<Dispatcher>, workers: usize) -> Self {
        let (sender, receiver) = mpsc::channel(REQUEST_QUEUE_SIZE);
        let queue = Arc::new(Mutex::new(receiver));
        let (stop, stopped) = watch::channel(false);

        let workers = (0..workers)
            .map(|nr| tokio::spawn(Self::work(nr, dispatcher.clone(), queue.clone(), stopped.clone())))
            .collect();

        info!("Signer service started");
        SignerService {
            dispatcher,
            handle: ServiceHandle { sender },
            stop,
            workers,
        }
    }

    pub fn handle(&self) -> ServiceHandle {
        self.handle.clone()
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    async fn work(
        nr: usize,
        dispatcher: Arc<Dispatcher>,
        queue: Arc<Mutex<mpsc::Receiver<Job>>>,
        mut stopped: watch::Receiver<bool>,
    ) {
        trace!("Worker {} started", nr);
        loop {
            let job = tokio::select! {
                job = async { queue.lock().await.recv().await } => job,
                _ = stopped.changed() => None,
            };
            let Some(Job { request, reply }) = job else {
                break;
            };

            let dispatcher = dispatcher.clone();
            let res = tokio::task::spawn_blocking(move || dispatcher.dispatch(request))
                .await
                .unwrap_or_else(|e| Err(Error::internal(format!("request handler did not finish: {}", e))));

            // The caller may have given up waiting, that is fine.
            let _ = reply.send(res);
        }
        trace!("Worker {} stopped", nr);
    }

    /// Shuts the service down.
    ///
    /// New requests are refused with ShuttingDown straight away. Requests
    /// already executing are given up to `grace` to finish. Requests still
    /// queued are dropped, their callers get ShuttingDown.
    pub async fn shutdown(self, grace: Duration) {
        info!("Signer service shutting down");
        self.dispatcher.close();

        let dispatcher = self.dispatcher.clone();
        match tokio::task::spawn_blocking(move || dispatcher.wait_idle(grace)).await {
            Ok(Ok(true)) => debug!("All executing requests finished"),
            Ok(Ok(false)) => warn!("Requests still executing after {:?}", grace),
            Ok(Err(e)) => error!("Could not wait for executing requests: {}", e),
            Err(e) => error!("Could not wait for executing requests: {}", e),
        }

        let _ = self.stop.send(true);
        for worker in self.workers {
            let _ = worker.await;
        }
        info!("Signer service stopped");
    }
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    use crate::{
        commons::error::ErrorKind,
        device::drivers::mock::MockDriverCallCounts,
        handlers::tests::{context, mock_driver},
        tokens::{KeyId, TokenId},
    };

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn requests_and_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let counts = Arc::new(MockDriverCallCounts::new());
        let dispatcher = Arc::new(Dispatcher::new(context(dir.path(), mock_driver(&counts))));
        let service = SignerService::start(dispatcher, 2);
        let handle = service.handle();

        match handle.call(Request::RefreshTokens).await.unwrap() {
            Response::Tokens { tokens } => assert_eq!(tokens[0].id(), &TokenId::from("t1")),
            other => panic!("unexpected response: {:?}", other),
        }

        let err = handle
            .call(Request::GetKeyInfo {
                key_id: KeyId::from("missing"),
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        service.shutdown(Duration::from_secs(1)).await;

        let err = handle.call(Request::ListTokens).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ShuttingDown);
    }
}
