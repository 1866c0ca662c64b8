// Shared fixtures for the enumerator tests
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use npio_enumerator::{
    Cancellable, EnumeratorBackend, EnumeratorError, EnumeratorResult, IOErrorEnum, IoJob,
    IoScheduler,
};

/// One scripted answer of a [`ScriptedBackend`].
pub enum Step {
    Entry(&'static str),
    Fail(IOErrorEnum),
    /// Triggers the cancellable, then yields the entry.
    CancelAfter(Cancellable, &'static str),
    Panic,
}

#[derive(Default)]
pub struct BackendLog {
    pub next_calls: AtomicUsize,
    pub close_calls: AtomicUsize,
    /// Whether a current cancellable was set during each backend call.
    pub saw_current: Mutex<Vec<bool>>,
}

impl BackendLog {
    pub fn next_calls(&self) -> usize {
        self.next_calls.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub fn saw_current(&self) -> Vec<bool> {
        self.saw_current.lock().unwrap().clone()
    }
}

pub struct ScriptedBackend {
    steps: VecDeque<Step>,
    close_error: Option<IOErrorEnum>,
    close_panics: bool,
    log: Arc<BackendLog>,
}

impl ScriptedBackend {
    pub fn new(steps: Vec<Step>) -> (Self, Arc<BackendLog>) {
        let log = Arc::new(BackendLog::default());
        let backend = Self {
            steps: steps.into(),
            close_error: None,
            close_panics: false,
            log: log.clone(),
        };
        (backend, log)
    }

    pub fn entries(names: &[&'static str]) -> (Self, Arc<BackendLog>) {
        Self::new(names.iter().copied().map(Step::Entry).collect())
    }

    pub fn failing_close(mut self, kind: IOErrorEnum) -> Self {
        self.close_error = Some(kind);
        self
    }

    pub fn panicking_close(mut self) -> Self {
        self.close_panics = true;
        self
    }

    fn record_current(&self) {
        self.log
            .saw_current
            .lock()
            .unwrap()
            .push(Cancellable::current().is_some());
    }
}

impl EnumeratorBackend<String> for ScriptedBackend {
    fn next_file(&mut self, _cancellable: Option<&Cancellable>) -> EnumeratorResult<Option<String>> {
        self.log.next_calls.fetch_add(1, Ordering::SeqCst);
        self.record_current();
        match self.steps.pop_front() {
            None => Ok(None),
            Some(Step::Entry(name)) => Ok(Some(name.to_string())),
            Some(Step::Fail(kind)) => Err(EnumeratorError::new(kind, "scripted failure")),
            Some(Step::CancelAfter(cancellable, name)) => {
                cancellable.cancel();
                Ok(Some(name.to_string()))
            }
            Some(Step::Panic) => panic!("scripted backend panic"),
        }
    }

    fn close(&mut self, _cancellable: Option<&Cancellable>) -> EnumeratorResult<()> {
        self.log.close_calls.fetch_add(1, Ordering::SeqCst);
        self.record_current();
        if self.close_panics {
            panic!("scripted close panic");
        }
        match self.close_error {
            Some(kind) => Err(EnumeratorError::new(kind, "scripted close failure")),
            None => Ok(()),
        }
    }
}

/// Scheduler that only queues jobs; tests run them explicitly.
#[derive(Default)]
pub struct ManualScheduler {
    queue: Mutex<Vec<(i32, IoJob, Option<Cancellable>)>>,
}

impl ManualScheduler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn queued(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    /// Runs queued jobs, highest priority first, until the queue is empty.
    /// Returns how many ran.
    pub fn run_all(&self) -> usize {
        let mut ran = 0;
        loop {
            let next = {
                let mut queue = self.queue.lock().unwrap();
                let best = queue
                    .iter()
                    .enumerate()
                    .min_by_key(|(index, (priority, _, _))| (*priority, *index))
                    .map(|(index, _)| index);
                best.map(|index| queue.remove(index))
            };
            match next {
                Some((_, job, cancellable)) => {
                    job(cancellable.as_ref());
                    ran += 1;
                }
                None => return ran,
            }
        }
    }
}

impl IoScheduler for ManualScheduler {
    fn submit(&self, priority: i32, job: IoJob, cancellable: Option<Cancellable>) {
        self.queue.lock().unwrap().push((priority, job, cancellable));
    }
}

/// Collects the operations handed to async callbacks.
pub fn operation_slot<T>() -> Arc<Mutex<Vec<npio_enumerator::AsyncOperation<T>>>> {
    Arc::new(Mutex::new(Vec::new()))
}
