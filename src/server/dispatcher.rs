//! Routing of requests to their handlers.
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Condvar, Mutex, MutexGuard,
    },
    time::Duration,
};

use crate::{
    commons::{error::Error, SignerResult},
    handlers::{Request, Response, SignerContext},
};

//------------ Dispatcher ----------------------------------------------------

/// Takes requests through validation and execution.
///
/// A request is received, validated, executed and then either completed
/// or failed. Mutating requests execute one at a time. Read-only requests
/// do not wait for them; the registry gives them a consistent view.
///
/// Once shutdown started, new requests fail with ShuttingDown while those
/// already executing run to completion.
#[derive(Debug)]
pub struct Dispatcher {
    context: SignerContext,
    writer: Mutex<()>,
    gate: Mutex<Gate>,
    idle: Condvar,
    seq: AtomicU64,
}

#[derive(Debug)]
struct Gate {
    accepting: bool,
    in_flight: usize,
}

impl Dispatcher {
    pub fn new(context: SignerContext) -> Self {
        Dispatcher {
            context,
            writer: Mutex::new(()),
            gate: Mutex::new(Gate {
                accepting: true,
                in_flight: 0,
            }),
            idle: Condvar::new(),
            seq: AtomicU64::new(0),
        }
    }

    pub fn context(&self) -> &SignerContext {
        &self.context
    }

    pub fn dispatch(&self, request: Request) -> SignerResult<Response> {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let name = request.name();
        trace!("Request #{} ({}) received", seq, name);

        let _in_flight = self.enter().map_err(|e| {
            debug!("Request #{} ({}) refused: {}", seq, name, e);
            e
        })?;

        request.validate().map_err(|e| {
            debug!("Request #{} ({}) is invalid: {}", seq, name, e);
            e
        })?;
        trace!("Request #{} ({}) validated", seq, name);

        let writer = if request.is_mutating() {
            Some(self.writer.lock().map_err(|_| Error::lock_poisoned("request writer"))?)
        } else {
            None
        };

        trace!("Request #{} ({}) executing", seq, name);
        let res = self.context.handle(request);
        drop(writer);

        match &res {
            Ok(_) => debug!("Request #{} ({}) completed", seq, name),
            Err(e) => info!("Request #{} ({}) failed: {}", seq, name, e),
        }
        res
    }

    /// Stops accepting requests.
    pub fn close(&self) {
        if let Ok(mut gate) = self.gate.lock() {
            if gate.accepting {
                info!("No longer accepting requests");
            }
            gate.accepting = false;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.gate.lock().map(|gate| !gate.accepting).unwrap_or(true)
    }

    /// Waits until no request is executing any more.
    ///
    /// Returns whether that happened before the timeout.
    pub fn wait_idle(&self, timeout: Duration) -> SignerResult<bool> {
        let gate = self.lock_gate()?;
        let (gate, _) = self
            .idle
            .wait_timeout_while(gate, timeout, |gate| gate.in_flight > 0)
            .map_err(|_| Error::lock_poisoned("request gate"))?;
        Ok(gate.in_flight == 0)
    }

    fn enter(&self) -> SignerResult<InFlight<'_>> {
        let mut gate = self.lock_gate()?;
        if !gate.accepting {
            return Err(Error::ShuttingDown);
        }
        gate.in_flight += 1;
        Ok(InFlight { dispatcher: self })
    }

    fn lock_gate(&self) -> SignerResult<MutexGuard<'_, Gate>> {
        self.gate.lock().map_err(|_| Error::lock_poisoned("request gate"))
    }
}

//------------ InFlight ------------------------------------------------------

/// Counts a request as executing for as long as it lives.
struct InFlight<'a> {
    dispatcher: &'a Dispatcher,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Ok(mut gate) = self.dispatcher.gate.lock() {
            gate.in_flight = gate.in_flight.saturating_sub(1);
            if gate.in_flight == 0 {
                self.dispatcher.idle.notify_all();
            }
        }
    }
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::{
        sync::{atomic::AtomicBool, Arc},
        thread,
    };

    use super::*;

    use crate::{
        commons::{error::ErrorKind, test},
        device::drivers::mock::{FnIdx, MockDriverCallCounts},
        handlers::tests::{context, mock_driver, mock_kind},
        tokens::{CertOrigin, CertRequestId, KeyId, KeyUsage, TokenId, TokenManager},
    };

    #[test]
    fn invalid_requests_are_not_executed() {
        test::test_under_tmp(|d| {
            let counts = Arc::new(MockDriverCallCounts::new());
            let dispatcher = Dispatcher::new(context(&d, mock_driver(&counts)));

            let err = dispatcher
                .dispatch(Request::DeleteKey {
                    key_id: KeyId::from(""),
                    delete_from_device: true,
                })
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidRequest);
            assert_eq!(counts.get(FnIdx::DeleteKey), 0);
        })
    }

    #[test]
    fn closed_dispatcher_refuses_requests() {
        test::test_under_tmp(|d| {
            let counts = Arc::new(MockDriverCallCounts::new());
            let dispatcher = Dispatcher::new(context(&d, mock_driver(&counts)));

            assert!(dispatcher.dispatch(Request::ListTokens).is_ok());
            dispatcher.close();
            assert!(dispatcher.is_closed());

            let err = dispatcher.dispatch(Request::ListTokens).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::ShuttingDown);
            assert!(dispatcher.wait_idle(Duration::from_millis(10)).unwrap());
        })
    }

    #[test]
    fn concurrent_writers_on_disjoint_keys() {
        test::test_under_tmp(|d| {
            let counts = Arc::new(MockDriverCallCounts::new());
            let dispatcher = Arc::new(Dispatcher::new(context(&d, mock_driver(&counts))));

            let tokens = dispatcher.context().tokens();
            tokens.ensure_token(test::token("t1", mock_kind())).unwrap();
            for i in 0..8 {
                let key = test::key("t1", &format!("k{}", i))
                    .with_cert_request(test::cert_request(&format!("r{}", i), "CN=test"));
                tokens.add_key(&TokenId::from("t1"), key).unwrap();
            }

            let handles: Vec<_> = (0..8)
                .map(|i| {
                    let dispatcher = dispatcher.clone();
                    thread::spawn(move || {
                        dispatcher
                            .dispatch(Request::DeleteKey {
                                key_id: KeyId::from(format!("k{}", i)),
                                delete_from_device: false,
                            })
                            .unwrap();
                    })
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }

            let reloaded = TokenManager::build(&d).unwrap();
            for i in 0..8 {
                let found = reloaded.find_token_and_key(&KeyId::from(format!("k{}", i))).unwrap();
                assert!(found.key.cert_requests().is_empty());
            }
        })
    }

    #[test]
    fn readers_never_see_partial_state() {
        test::test_under_tmp(|d| {
            let counts = Arc::new(MockDriverCallCounts::new());
            let dispatcher = Arc::new(Dispatcher::new(context(&d, mock_driver(&counts))));

            let tokens = dispatcher.context().tokens();
            tokens.ensure_token(test::token("t1", mock_kind())).unwrap();
            tokens.add_key(&TokenId::from("t1"), test::key("t1", "k1")).unwrap();

            let request_ids: Vec<String> = (0..16).map(|i| format!("r{}", i)).collect();
            let done = Arc::new(AtomicBool::new(false));

            // Adds all requests in one update, removes them in the next.
            let writer = {
                let dispatcher = dispatcher.clone();
                let done = done.clone();
                thread::spawn(move || {
                    let tokens = dispatcher.context().tokens();
                    for _ in 0..20 {
                        tokens
                            .update(|r| {
                                for id in &request_ids {
                                    r.add_cert_request(&KeyId::from("k1"), test::cert_request(id, "CN=test"))?;
                                }
                                Ok(())
                            })
                            .unwrap();
                        tokens
                            .update(|r| {
                                for id in &request_ids {
                                    r.remove_cert_request(&CertRequestId::from(id.as_str()))?;
                                }
                                Ok(())
                            })
                            .unwrap();
                    }
                    done.store(true, Ordering::SeqCst);
                })
            };

            let readers: Vec<_> = (0..2)
                .map(|_| {
                    let dispatcher = dispatcher.clone();
                    let done = done.clone();
                    thread::spawn(move || {
                        while !done.load(Ordering::SeqCst) {
                            match dispatcher
                                .dispatch(Request::GetKeyInfo {
                                    key_id: KeyId::from("k1"),
                                })
                                .unwrap()
                            {
                                Response::Key { key, .. } => {
                                    let seen = key.cert_requests().len();
                                    assert!(seen == 0 || seen == 16, "saw {} requests", seen);
                                }
                                other => panic!("unexpected response: {:?}", other),
                            }
                        }
                    })
                })
                .collect();

            writer.join().unwrap();
            for reader in readers {
                reader.join().unwrap();
            }
        })
    }

    #[test]
    fn writers_on_the_same_key_are_serialized() {
        test::test_under_tmp(|d| {
            let counts = Arc::new(MockDriverCallCounts::new());
            let dispatcher = Arc::new(Dispatcher::new(context(&d, mock_driver(&counts))));

            let tokens = dispatcher.context().tokens();
            tokens.ensure_token(test::token("t1", mock_kind())).unwrap();

            for round in 0..10 {
                let key_id = KeyId::from(format!("k{}", round));
                let key = test::key("t1", key_id.as_str())
                    .with_cert_request(test::cert_request(&format!("old-{}", round), "CN=old"))
                    .with_cert(test::cert(b"config", CertOrigin::SavedToConfiguration));
                tokens.add_key(&TokenId::from("t1"), key).unwrap();

                let generate = {
                    let dispatcher = dispatcher.clone();
                    let key_id = key_id.clone();
                    thread::spawn(move || {
                        dispatcher.dispatch(Request::GenerateCertRequest {
                            key_id,
                            subject_name: "CN=new".to_string(),
                            usage: KeyUsage::Signing,
                        })
                    })
                };
                let delete = {
                    let dispatcher = dispatcher.clone();
                    let key_id = key_id.clone();
                    thread::spawn(move || {
                        dispatcher.dispatch(Request::DeleteKey {
                            key_id,
                            delete_from_device: false,
                        })
                    })
                };

                let new_request = match generate.join().unwrap().unwrap() {
                    Response::CertRequest { request, .. } => request.id().clone(),
                    other => panic!("unexpected response: {:?}", other),
                };
                assert_eq!(Response::Success, delete.join().unwrap().unwrap());

                // Either the new request was deleted along with the old
                // one, or it was created after the delete.
                let reloaded = TokenManager::build(&d).unwrap();
                let key = reloaded.find_token_and_key(&key_id).unwrap().key;
                assert!(key.configuration_cert_ids().is_empty());
                assert_eq!(Some(KeyUsage::Signing), key.usage());
                let remaining: Vec<&CertRequestId> = key.cert_requests().iter().map(|r| r.id()).collect();
                assert!(
                    remaining.is_empty() || remaining == vec![&new_request],
                    "no serial order leaves {:?}",
                    remaining
                );
                assert_eq!(key, tokens.find_token_and_key(&key_id).unwrap().key);
            }
        })
    }
}
