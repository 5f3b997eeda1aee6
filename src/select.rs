use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use crate::config::SELECT_INTS;
use crate::event::Event;
use crate::station::StationId;
use crate::{Error, Result};

type SelectFn = dyn Fn(StationId, &Event<'_>) -> bool + Send + Sync;

/// Callback deciding whether a `User`-mode station takes an event.
///
/// The callback runs on the upstream station's conductor thread while
/// that conductor holds its transfer lock; it must not call back into
/// the broker. A panic inside it fails the conductor's pass; the events
/// being routed go back to GrandCentral.
#[derive(Clone)]
pub struct Selector(Arc<SelectFn>);

impl Selector {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(StationId, &Event<'_>) -> bool + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub(crate) fn call(&self, station: StationId, event: &Event<'_>) -> Result<bool> {
        panic::catch_unwind(AssertUnwindSafe(|| (self.0)(station, event)))
            .map_err(|_| Error::InvalidOperation("station selector panicked"))
    }
}

impl fmt::Debug for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Selector(..)")
    }
}

/// Default content match: true if any enabled slot matches. Even slots
/// compare for equality, odd slots test for a shared bit. A select word
/// of -1 disables its slot.
pub fn matches(select: &[i32; SELECT_INTS], control: &[i32; SELECT_INTS]) -> bool {
    select
        .iter()
        .zip(control.iter())
        .enumerate()
        .any(|(i, (&want, &have))| {
            if want == -1 {
                return false;
            }
            if i % 2 == 0 {
                want == have
            } else {
                want & have != 0
            }
        })
}
