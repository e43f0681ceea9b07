use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::future::Future;
use tracing::debug;

type Flight<T, E> = Shared<BoxFuture<'static, Result<T, E>>>;

/// Deduplicates concurrent executions of the same fallible operation.
///
/// Callers that arrive while a flight is running await that flight and receive
/// its result instead of starting their own. The `cached` probe runs under the
/// same lock that guards the flight slot, so a caller either sees the value the
/// finished flight stored or joins the flight that is about to store it.
pub struct SingleFlight<T, E> {
    slot: Mutex<Slot<T, E>>,
}

struct Slot<T, E> {
    flight: Option<(u64, Flight<T, E>)>,
    next_id: u64,
}

impl<T, E> SingleFlight<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(Slot {
                flight: None,
                next_id: 0,
            }),
        }
    }

    /// Returns the cached value, joins the running flight, or starts a new one.
    ///
    /// `start` must store a successful result where `cached` will find it
    /// before the returned future resolves.
    pub async fn run<C, S, F>(&self, cached: C, start: S) -> Result<T, E>
    where
        C: FnOnce() -> Option<T>,
        S: FnOnce() -> F,
        F: Future<Output = Result<T, E>> + Send + 'static,
    {
        let (id, flight) = {
            let mut slot = self.slot.lock();
            if let Some((id, flight)) = &slot.flight {
                debug!(flight = id, "joining in-flight operation");
                (*id, flight.clone())
            } else {
                if let Some(value) = cached() {
                    return Ok(value);
                }
                let id = slot.next_id;
                slot.next_id += 1;
                let flight = start().boxed().shared();
                slot.flight = Some((id, flight.clone()));
                (id, flight)
            }
        };

        let result = flight.await;

        let mut slot = self.slot.lock();
        if matches!(&slot.flight, Some((current, _)) if *current == id) {
            slot.flight = None;
        }
        result
    }

    /// Whether a flight is currently registered.
    pub fn in_flight(&self) -> bool {
        self.slot.lock().flight.is_some()
    }

    /// Detaches the running flight; later callers start afresh.
    pub fn reset(&self) {
        self.slot.lock().flight = None;
    }
}

impl<T, E> Default for SingleFlight<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
