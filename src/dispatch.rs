//! Hand-off between a delivery thread that must never block and a worker
//! that may.
//!
//! [`DispatchQueue::add`] only takes the intake lock long enough to push. The
//! worker swaps the whole intake list out under the lock, releases it, and
//! runs the handler on each item in order. A failing or panicking item is
//! logged and skipped; the rest of the batch still runs.

use std::fmt::Display;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;

use anyhow::{Context, Result};

pub struct DispatchQueue<T> {
    name: String,
    shared: Arc<DispatchShared<T>>,
}

struct DispatchShared<T> {
    state: Mutex<DispatchState<T>>,
    ready: Condvar,
}

struct DispatchState<T> {
    items: Vec<T>,
    shutdown: bool,
}

impl<T> DispatchShared<T> {
    fn lock(&self) -> MutexGuard<'_, DispatchState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Display + Send + 'static> DispatchQueue<T> {
    /// Starts the worker thread. `handler` runs on that thread only.
    pub fn start<H>(name: impl Into<String>, handler: H) -> Result<Self>
    where
        H: FnMut(T) -> Result<()> + Send + 'static,
    {
        let name = name.into();
        let shared = Arc::new(DispatchShared {
            state: Mutex::new(DispatchState {
                items: Vec::new(),
                shutdown: false,
            }),
            ready: Condvar::new(),
        });
        let worker_shared = shared.clone();
        let worker_name = name.clone();
        thread::Builder::new()
            .name(name.clone())
            .spawn(move || run(worker_name, worker_shared, handler))
            .with_context(|| format!("spawn dispatch worker {name}"))?;
        Ok(Self { name, shared })
    }

    /// Queues an item for the worker. Never waits on the handler.
    ///
    /// Items added after [`shutdown`](Self::shutdown) are dropped.
    pub fn add(&self, item: T) {
        let mut st = self.shared.lock();
        if st.shutdown {
            crate::logging::warn(format!(
                "dispatch {}: dropping item after shutdown: {item}",
                self.name
            ));
            return;
        }
        st.items.push(item);
        drop(st);
        self.shared.ready.notify_one();
    }

    /// Items waiting for the worker.
    pub fn backlog(&self) -> usize {
        self.shared.lock().items.len()
    }

    /// Stops accepting items. The worker finishes what is queued, then exits.
    pub fn shutdown(&self) {
        let mut st = self.shared.lock();
        st.shutdown = true;
        drop(st);
        self.shared.ready.notify_all();
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<T> Drop for DispatchQueue<T> {
    // Signal only; joining here could wait on a thread that is dropping us.
    fn drop(&mut self) {
        let mut st = self.shared.lock();
        st.shutdown = true;
        drop(st);
        self.shared.ready.notify_all();
    }
}

fn run<T, H>(name: String, shared: Arc<DispatchShared<T>>, mut handler: H)
where
    T: Display,
    H: FnMut(T) -> Result<()>,
{
    loop {
        let batch = {
            let mut st = shared.lock();
            while st.items.is_empty() && !st.shutdown {
                st = shared.ready.wait(st).unwrap_or_else(PoisonError::into_inner);
            }
            if st.items.is_empty() {
                break;
            }
            std::mem::take(&mut st.items)
        };

        for item in batch {
            let label = item.to_string();
            match panic::catch_unwind(AssertUnwindSafe(|| handler(item))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    crate::logging::error(format!("dispatch {name}: {label}: {err:#}"));
                }
                Err(panic) => {
                    let msg = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    crate::logging::error(format!("dispatch {name}: {label}: panicked: {msg}"));
                }
            }
        }
    }
    crate::logging::debug(format!("dispatch {name}: worker exiting"));
}
