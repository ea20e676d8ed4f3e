//! Bounded worker pools for the two nesting levels of a run.
//!
//! [`WorkerPool`] runs lightweight async tasks on the current runtime.
//! [`ManagerPool`] runs units on dedicated OS threads, each with its own
//! single-threaded runtime. Both report every unit exactly once, in
//! completion order, and a panicking unit is reported as failed instead of
//! tearing down its siblings.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, mpsc};

use futures::FutureExt as _;
use thiserror::Error;
use tokio::task::JoinSet;

#[derive(Debug, Error)]
#[error("unit panicked: {message}")]
pub struct UnitPanic {
    pub message: String,
}

impl UnitPanic {
    fn from_payload(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(text) = payload.downcast_ref::<&str>() {
            (*text).to_owned()
        } else if let Some(text) = payload.downcast_ref::<String>() {
            text.clone()
        } else {
            "non-string panic payload".to_owned()
        };
        Self { message }
    }
}

/// A finished unit of work.
#[derive(Debug)]
pub struct Completion<L, T> {
    pub id: usize,
    pub label: L,
    pub result: Result<T, UnitPanic>,
}

/// Lightweight tasks on the current runtime, at most `width` in flight.
/// Finished tasks are dropped as soon as they are reaped, so only in-flight
/// work is held in memory.
pub struct WorkerPool<L, T> {
    width: usize,
    next_id: usize,
    tasks: JoinSet<Completion<L, T>>,
}

impl<L, T> WorkerPool<L, T>
where
    L: Send + 'static,
    T: Send + 'static,
{
    pub fn new(width: usize) -> Self {
        Self {
            width: width.max(1),
            next_id: 0,
            tasks: JoinSet::new(),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    /// Spawns the future built by `make` with the next unit id. When the
    /// pool is full, first waits for one running unit and returns it.
    pub async fn submit<F, Fut>(&mut self, label: L, make: F) -> Option<Completion<L, T>>
    where
        F: FnOnce(usize) -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let reaped = if self.tasks.len() >= self.width {
            self.next_completion().await
        } else {
            None
        };

        let id = self.next_id;
        self.next_id += 1;
        let fut = make(id);
        self.tasks.spawn(async move {
            let result = AssertUnwindSafe(fut)
                .catch_unwind()
                .await
                .map_err(UnitPanic::from_payload);
            Completion { id, label, result }
        });
        reaped
    }

    /// Next unit to finish, in completion order. `None` once the pool is empty.
    pub async fn next_completion(&mut self) -> Option<Completion<L, T>> {
        loop {
            match self.tasks.join_next().await? {
                Ok(completion) => return Some(completion),
                Err(err) => tracing::error!(?err, "worker task was cancelled"),
            }
        }
    }
}

/// A unit of work run inside one [`ManagerPool`] thread. Built once per
/// thread, so it may hold runtime-bound resources such as HTTP clients.
pub trait IsolatedUnit {
    type Job: Send + 'static;
    type Output: Send + 'static;

    fn run(&self, id: usize, job: Self::Job) -> impl Future<Output = Self::Output>;
}

#[derive(Debug, Clone, Copy)]
pub struct ManagerPool {
    width: usize,
}

impl ManagerPool {
    pub fn new(width: usize) -> Self {
        Self {
            width: width.max(1),
        }
    }

    /// Runs every job on up to `width` OS threads. `make_unit` is called
    /// once per thread. Completions are delivered to `on_done` as they
    /// arrive; jobs never started because every thread failed to build its
    /// unit are returned.
    pub async fn run<U, L>(
        &self,
        jobs: Vec<(L, U::Job)>,
        make_unit: impl Fn(usize) -> anyhow::Result<U> + Send + Sync + 'static,
        mut on_done: impl FnMut(Completion<L, U::Output>),
    ) -> Vec<(usize, L)>
    where
        U: IsolatedUnit + 'static,
        L: Clone + Send + 'static,
    {
        let (job_tx, job_rx) = mpsc::channel::<(usize, L, U::Job)>();
        for (id, (label, job)) in jobs.into_iter().enumerate() {
            // The receiver is alive until the threads below exit.
            let _ = job_tx.send((id, label, job));
        }
        drop(job_tx);

        let job_rx = Arc::new(Mutex::new(job_rx));
        let make_unit = Arc::new(make_unit);
        let (done_tx, mut done_rx) = tokio::sync::mpsc::unbounded_channel();

        let mut threads = Vec::with_capacity(self.width);
        for slot in 0..self.width {
            let job_rx = Arc::clone(&job_rx);
            let make_unit = Arc::clone(&make_unit);
            let done_tx = done_tx.clone();
            let spawned = std::thread::Builder::new()
                .name(format!("manager-{slot}"))
                .spawn(move || manager_thread::<U, L>(slot, &job_rx, make_unit.as_ref(), &done_tx));
            match spawned {
                Ok(handle) => threads.push(handle),
                Err(err) => tracing::error!(slot, ?err, "failed to spawn manager thread"),
            }
        }
        drop(done_tx);

        while let Some(completion) = done_rx.recv().await {
            on_done(completion);
        }

        for handle in threads {
            if handle.join().is_err() {
                tracing::error!("manager thread panicked outside a unit");
            }
        }

        let mut not_started = Vec::new();
        let job_rx = job_rx.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        while let Ok((id, label, _job)) = job_rx.try_recv() {
            not_started.push((id, label));
        }
        not_started
    }
}

fn manager_thread<U, L>(
    slot: usize,
    jobs: &Mutex<mpsc::Receiver<(usize, L, U::Job)>>,
    make_unit: &(dyn Fn(usize) -> anyhow::Result<U> + Send + Sync),
    done: &tokio::sync::mpsc::UnboundedSender<Completion<L, U::Output>>,
) where
    U: IsolatedUnit,
    L: Clone + Send + 'static,
{
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            tracing::error!(slot, ?err, "failed to build manager runtime");
            return;
        }
    };
    let unit = match runtime.block_on(async { make_unit(slot) }) {
        Ok(unit) => unit,
        Err(err) => {
            tracing::error!(slot, err = format!("{err:#}"), "failed to build manager unit");
            return;
        }
    };

    loop {
        let next = {
            let jobs = jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            jobs.recv()
        };
        let Ok((id, label, job)) = next else {
            break;
        };

        let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
            runtime.block_on(unit.run(id, job))
        }))
        .map_err(UnitPanic::from_payload);

        if done.send(Completion { id, label, result }).is_err() {
            break;
        }
    }
}
