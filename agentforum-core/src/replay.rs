//! Append-only broadcast log with a write-once terminal outcome.
//!
//! One producer appends items; any number of readers each walk the log from
//! the start at their own pace. Readers that catch up with the producer wait
//! on a version counter until something new is appended or the log finishes.

use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;

use crate::error::ForumError;

/// What a reader finds at a given position of the log.
pub(crate) enum Step<T, R> {
    Item(T),
    End(Result<R, ForumError>),
}

struct State<T, R> {
    items: Vec<T>,
    outcome: Option<Result<R, ForumError>>,
}

pub(crate) struct Replay<T, R> {
    state: Mutex<State<T, R>>,
    version: watch::Sender<u64>,
}

impl<T: Clone, R: Clone> Replay<T, R> {
    pub(crate) fn new() -> Self {
        Self::with_state(Vec::new(), None)
    }

    /// A log that is already finished.
    pub(crate) fn finished(items: Vec<T>, outcome: Result<R, ForumError>) -> Self {
        Self::with_state(items, Some(outcome))
    }

    fn with_state(items: Vec<T>, outcome: Option<Result<R, ForumError>>) -> Self {
        let (version, _) = watch::channel(0);
        Replay {
            state: Mutex::new(State { items, outcome }),
            version,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<T, R>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn bump(&self) {
        self.version.send_modify(|v| *v = v.wrapping_add(1));
    }

    /// Appends an item. Returns false (and drops the item) once finished.
    pub(crate) fn push(&self, item: T) -> bool {
        {
            let mut state = self.lock();
            if state.outcome.is_some() {
                return false;
            }
            state.items.push(item);
        }
        self.bump();
        true
    }

    /// Sets the terminal outcome. Only the first call has any effect.
    pub(crate) fn finish(&self, outcome: Result<R, ForumError>) -> bool {
        {
            let mut state = self.lock();
            if state.outcome.is_some() {
                return false;
            }
            state.outcome = Some(outcome);
        }
        self.bump();
        true
    }

    fn peek(&self, index: usize) -> Option<Step<T, R>> {
        let state = self.lock();
        if let Some(item) = state.items.get(index) {
            return Some(Step::Item(item.clone()));
        }
        state.outcome.clone().map(Step::End)
    }

    /// Waits for the item at `index`, or for the outcome if the log finished
    /// with fewer items.
    pub(crate) async fn next(&self, index: usize) -> Step<T, R> {
        // Subscribe before peeking so an append between the two is not missed.
        let mut rx = self.version.subscribe();
        loop {
            if let Some(step) = self.peek(index) {
                return step;
            }
            if rx.changed().await.is_err() {
                // The sender lives as long as `self`; this only guards the loop.
                return Step::End(Err(ForumError::ProductionFailure(
                    "log closed without an outcome".to_string(),
                )));
            }
        }
    }

    /// Waits for the terminal outcome.
    pub(crate) async fn outcome(&self) -> Result<R, ForumError> {
        let mut rx = self.version.subscribe();
        loop {
            if let Some(outcome) = self.outcome_now() {
                return outcome;
            }
            if rx.changed().await.is_err() {
                return Err(ForumError::ProductionFailure(
                    "log closed without an outcome".to_string(),
                ));
            }
        }
    }

    pub(crate) fn outcome_now(&self) -> Option<Result<R, ForumError>> {
        self.lock().outcome.clone()
    }

    pub(crate) fn items(&self) -> Vec<T> {
        self.lock().items.clone()
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.lock().outcome.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn item<T, R>(step: Step<T, R>) -> T {
        match step {
            Step::Item(t) => t,
            Step::End(_) => panic!("expected item"),
        }
    }

    #[tokio::test]
    async fn reader_sees_items_pushed_later() {
        let log = Arc::new(Replay::<u32, ()>::new());
        let reader = {
            let log = Arc::clone(&log);
            tokio::spawn(async move {
                let a = item(log.next(0).await);
                let b = item(log.next(1).await);
                (a, b)
            })
        };

        tokio::task::yield_now().await;
        log.push(1);
        log.push(2);

        assert_eq!(reader.await.unwrap(), (1, 2));
    }

    #[tokio::test]
    async fn finish_is_write_once() {
        let log = Replay::<u32, &'static str>::new();
        assert!(log.finish(Ok("first")));
        assert!(!log.finish(Err(ForumError::Cancelled)));
        assert!(!log.push(7));

        assert_eq!(log.outcome().await.unwrap(), "first");
        assert_eq!(log.len(), 0);
        assert!(matches!(log.next(0).await, Step::End(Ok("first"))));
    }

    #[tokio::test]
    async fn late_reader_replays_from_start() {
        let log = Replay::<u32, ()>::finished(vec![1, 2, 3], Ok(()));
        let mut seen = Vec::new();
        let mut index = 0;
        while let Step::Item(v) = log.next(index).await {
            seen.push(v);
            index += 1;
        }
        assert_eq!(seen, vec![1, 2, 3]);
        assert!(log.is_finished());
    }
}
