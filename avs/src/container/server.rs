use std::path::Path;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::codec::FetchVisitor;
use crate::error::{CResult, Error};
use crate::object::{AddrId, Metadata, Object};
use crate::stats::StorageStats;

use super::compaction::HasCharge;
use super::Worker;

/// Reply deadline for every operation except `compact`, which is unbounded.
/// The worker keeps processing past the deadline; only the caller gives up.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

enum Request {
    Put {
        obj: Object,
        reply: Sender<CResult<()>>,
    },
    Get {
        addr_id: AddrId,
        key: Vec<u8>,
        start: i64,
        end: i64,
        reply: Sender<CResult<(Metadata, Vec<u8>)>>,
    },
    Delete {
        obj: Object,
        reply: Sender<CResult<()>>,
    },
    Head {
        addr_id: AddrId,
        key: Vec<u8>,
        reply: Sender<CResult<Metadata>>,
    },
    Fetch {
        addr_id: AddrId,
        key_prefix: Vec<u8>,
        visitor: Box<dyn FetchVisitor>,
        reply: Sender<CResult<Vec<Metadata>>>,
    },
    Store {
        meta: Metadata,
        body: Vec<u8>,
        reply: Sender<CResult<()>>,
    },
    Stats {
        reply: Sender<CResult<StorageStats>>,
    },
    Compact {
        has_charge: Box<dyn HasCharge>,
        reply: Sender<CResult<()>>,
    },
    Stop {
        reply: Sender<CResult<()>>,
    },
}

/// The client side of one container: a mailbox feeding the dedicated worker
/// thread. All operations are serialized by that thread; a blocking
/// operation holds the mailbox, which is what bounds write concurrency to
/// one and guarantees append ordering.
pub struct WorkerHandle {
    id: String,
    mailbox: Sender<Request>,
    thread: Option<JoinHandle<()>>,
}

/// Spawns a container worker and waits for it to come up. An init failure
/// (unopenable raw file, dead symlink, locked index) is returned here and no
/// thread is left behind.
pub fn start_link(id: &str, seq_no: u32, meta_db_id: &str, root: &Path) -> CResult<WorkerHandle> {
    let (mailbox, inbox) = mpsc::channel();
    let (ready_tx, ready_rx) = mpsc::channel();

    let thread_id = id.to_string();
    let thread_meta_db_id = meta_db_id.to_string();
    let thread_root = root.to_path_buf();
    let thread = std::thread::Builder::new()
        .name(format!("avs-worker-{}", id))
        .spawn(move || {
            let worker = match Worker::init(&thread_id, seq_no, &thread_meta_db_id, &thread_root) {
                Ok(worker) => {
                    let _ = ready_tx.send(Ok(()));
                    worker
                }
                Err(err) => {
                    let _ = ready_tx.send(Err(err));
                    return;
                }
            };
            serve(worker, inbox);
        })?;

    match ready_rx.recv() {
        Ok(Ok(())) => Ok(WorkerHandle {
            id: id.to_string(),
            mailbox,
            thread: Some(thread),
        }),
        Ok(Err(err)) => {
            let _ = thread.join();
            Err(err)
        }
        Err(_) => Err(Error::Internal(format!(
            "worker {} thread died during init",
            id
        ))),
    }
}

/// The mailbox loop: one message at a time, to completion. A disconnected
/// mailbox (all handles dropped) terminates the worker the same way an
/// explicit stop does, so stats are persisted either way.
fn serve(mut worker: Worker, inbox: Receiver<Request>) {
    loop {
        let request = match inbox.recv() {
            Ok(request) => request,
            Err(_) => break,
        };
        match request {
            Request::Put { obj, reply } => {
                let _ = reply.send(worker.put(obj));
            }
            Request::Get {
                addr_id,
                key,
                start,
                end,
                reply,
            } => {
                let _ = reply.send(worker.get(addr_id, &key, start, end));
            }
            Request::Delete { obj, reply } => {
                let _ = reply.send(worker.delete(obj));
            }
            Request::Head {
                addr_id,
                key,
                reply,
            } => {
                let _ = reply.send(worker.head(addr_id, &key));
            }
            Request::Fetch {
                addr_id,
                key_prefix,
                mut visitor,
                reply,
            } => {
                let _ = reply.send(worker.fetch(addr_id, &key_prefix, visitor.as_mut()));
            }
            Request::Store { meta, body, reply } => {
                let _ = reply.send(worker.store(meta, body));
            }
            Request::Stats { reply } => {
                let _ = reply.send(Ok(worker.stats()));
            }
            Request::Compact { mut has_charge, reply } => {
                let _ = reply.send(worker.compact(has_charge.as_mut()));
            }
            Request::Stop { reply } => {
                worker.terminate();
                let _ = reply.send(Ok(()));
                return;
            }
        }
    }
    worker.terminate();
}

impl WorkerHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    fn call<T>(
        &self,
        deadline: Option<Duration>,
        build: impl FnOnce(Sender<CResult<T>>) -> Request,
    ) -> CResult<T> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.mailbox
            .send(build(reply_tx))
            .map_err(|_| Error::Value(format!("worker {} is not running", self.id)))?;

        match deadline {
            Some(timeout) => match reply_rx.recv_timeout(timeout) {
                Ok(reply) => reply,
                Err(RecvTimeoutError::Timeout) => Err(Error::Timeout),
                Err(RecvTimeoutError::Disconnected) => Err(Error::Value(format!(
                    "worker {} stopped before replying",
                    self.id
                ))),
            },
            None => reply_rx.recv().map_err(|_| {
                Error::Value(format!("worker {} stopped before replying", self.id))
            })?,
        }
    }

    pub fn put(&self, obj: Object) -> CResult<()> {
        self.call(Some(REQUEST_TIMEOUT), |reply| Request::Put { obj, reply })
    }

    pub fn get(
        &self,
        addr_id: AddrId,
        key: &[u8],
        start: i64,
        end: i64,
    ) -> CResult<(Metadata, Vec<u8>)> {
        let key = key.to_vec();
        self.call(Some(REQUEST_TIMEOUT), |reply| Request::Get {
            addr_id,
            key,
            start,
            end,
            reply,
        })
    }

    pub fn delete(&self, obj: Object) -> CResult<()> {
        self.call(Some(REQUEST_TIMEOUT), |reply| Request::Delete { obj, reply })
    }

    pub fn head(&self, addr_id: AddrId, key: &[u8]) -> CResult<Metadata> {
        let key = key.to_vec();
        self.call(Some(REQUEST_TIMEOUT), |reply| Request::Head {
            addr_id,
            key,
            reply,
        })
    }

    pub fn fetch(
        &self,
        addr_id: AddrId,
        key_prefix: &[u8],
        visitor: impl FetchVisitor + 'static,
    ) -> CResult<Vec<Metadata>> {
        let key_prefix = key_prefix.to_vec();
        self.call(Some(REQUEST_TIMEOUT), |reply| Request::Fetch {
            addr_id,
            key_prefix,
            visitor: Box::new(visitor),
            reply,
        })
    }

    pub fn store(&self, meta: Metadata, body: Vec<u8>) -> CResult<()> {
        self.call(Some(REQUEST_TIMEOUT), |reply| Request::Store {
            meta,
            body,
            reply,
        })
    }

    pub fn stats(&self) -> CResult<StorageStats> {
        self.call(Some(REQUEST_TIMEOUT), |reply| Request::Stats { reply })
    }

    /// Online compaction. Unbounded: a large container legitimately takes
    /// longer than any request deadline.
    pub fn compact(&self, has_charge: impl HasCharge + 'static) -> CResult<()> {
        self.call(None, |reply| Request::Compact {
            has_charge: Box::new(has_charge),
            reply,
        })
    }

    /// Stops the worker, waiting for it to close handles and persist stats,
    /// then joins the thread.
    pub fn stop(mut self) -> CResult<()> {
        let result = self.call(Some(REQUEST_TIMEOUT), |reply| Request::Stop { reply });
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        result
    }
}
