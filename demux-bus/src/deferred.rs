use tokio::sync::watch;

/// A value that is set once and can be awaited any number of times.
///
/// Used to hand a resource from one component to another that is built
/// afterwards: the consumer awaits [`Deferred::wait`], the producer calls
/// [`Deferred::set`] when the resource exists.
#[derive(Debug)]
pub struct Deferred<T> {
    tx: watch::Sender<Option<T>>,
}

impl<T: Clone> Deferred<T> {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    /// Stores `value` and wakes every waiter. Returns `false` (and drops
    /// `value`) when the cell was already set.
    pub fn set(&self, value: T) -> bool {
        let mut value = Some(value);
        self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = value.take();
            true
        })
    }

    pub fn get(&self) -> Option<T> {
        self.tx.borrow().clone()
    }

    pub fn is_set(&self) -> bool {
        self.tx.borrow().is_some()
    }

    pub async fn wait(&self) -> T {
        let mut rx = self.tx.subscribe();
        loop {
            if let Some(value) = rx.borrow_and_update().clone() {
                return value;
            }
            // the sender lives in `self`, so this only fails if `self` is gone
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

impl<T: Clone> Default for Deferred<T> {
    fn default() -> Self {
        Self::new()
    }
}
