//! Tile worker threads.

use std::cell::Cell;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tokio::runtime::Builder;
use tokio::task::LocalSet;
use tracing::{error, info};

use crate::broker::{Broker, Mailbox, Role, WorkerId, channel};

/// Environment passed to a worker's setup function.
pub struct WorkerContext {
    pub id: WorkerId,
    /// Total number of workers in the pool.
    pub count: usize,
    /// Worker broker, connected to the main thread.
    pub broker: Broker,
}

/// Handle for a running worker thread.
struct Worker {
    id: WorkerId,
    thread: JoinHandle<()>,
}

/// Fixed-size pool of worker threads.
pub struct WorkerPool {
    workers: Vec<Worker>,
    broker: Broker,
    next: Cell<usize>,
}

impl WorkerPool {
    /// Spawn `count` workers connected to the main thread's `broker`.
    ///
    /// The `main_mailbox` must deliver into the inbox the main `broker` is
    /// listening on. Each worker runs `setup` on its own thread before it
    /// starts processing calls; targets are registered there.
    pub fn spawn<F>(
        broker: &Broker,
        main_mailbox: Mailbox,
        count: usize,
        setup: F,
    ) -> io::Result<Self>
    where
        F: Fn(WorkerContext) + Send + Sync + 'static,
    {
        let setup = Arc::new(setup);
        let mut workers = Vec::with_capacity(count);

        for i in 0..count {
            let id = WorkerId(i);
            let (mailbox, inbox) = channel();
            let main_mailbox = main_mailbox.clone();
            let setup = setup.clone();

            let thread = thread::Builder::new().name(format!("styx-worker-{i}")).spawn(move || {
                let runtime = match Builder::new_current_thread().enable_all().build() {
                    Ok(runtime) => runtime,
                    Err(err) => {
                        error!("Failed to start runtime for {id}: {err}");
                        return;
                    },
                };

                LocalSet::new().block_on(&runtime, async move {
                    let broker = Broker::new(Role::Worker(id), Default::default());
                    broker.connect(Role::Main, main_mailbox);

                    setup(WorkerContext { id, count, broker: broker.clone() });

                    broker.listen(inbox).await;
                });
            })?;

            broker.connect(Role::Worker(id), mailbox);
            workers.push(Worker { id, thread });
        }

        info!("Started {count} tile workers");

        Ok(Self { workers, broker: broker.clone(), next: Default::default() })
    }

    /// IDs of all workers.
    pub fn ids(&self) -> Vec<WorkerId> {
        self.workers.iter().map(|worker| worker.id).collect()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Pick the next worker in round-robin order.
    pub fn next_worker(&self) -> Option<WorkerId> {
        let worker = self.workers.get(self.next.get() % self.workers.len().max(1))?;
        self.next.set(self.next.get().wrapping_add(1));
        Some(worker.id)
    }

    /// Disconnect all workers and wait for their threads to exit.
    ///
    /// Calls still waiting for a worker's reply are rejected.
    pub fn terminate(self) {
        for worker in &self.workers {
            self.broker.disconnect(Role::Worker(worker.id));
        }

        for worker in self.workers {
            if worker.thread.join().is_err() {
                error!("Thread of {} panicked", worker.id);
            }
        }
    }
}
