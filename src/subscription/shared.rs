//! The per-pool shared subscription connection (§4.4, §9). Modeled as an
//! explicit state machine rather than relying on the host language's
//! reference-counting for correctness, per the design note in §9.

use std::sync::Arc;

use tokio::sync::oneshot;

use crate::connection::actor::ConnectionHandle;
use crate::error::ClientError;

enum State<G> {
    Uninitialized,
    Acquiring(Vec<oneshot::Sender<Result<ConnectionHandle, ClientError>>>),
    Available { conn: ConnectionHandle, guard: G, refcount: usize },
}

/// Coordinates a single shared connection used for subscriptions across a
/// pool. `uninitialized -> acquiring([waiters]) -> available(conn, refcount)`.
///
/// `G` is whatever RAII guard the opener's lease came wrapped in (a pooled
/// `Leased` connection, in practice). It's held alongside the connection
/// for as long as the refcount is nonzero and dropped — returning its pool
/// permit — the moment the last subscriber detaches, so a subscribe/
/// unsubscribe cycle never strands a permit outside the pool's own
/// accounting.
pub struct SharedSubscriptionConnection<G> {
    state: parking_lot::Mutex<State<G>>,
}

impl<G> Default for SharedSubscriptionConnection<G> {
    fn default() -> Self {
        Self::new()
    }
}

impl<G> SharedSubscriptionConnection<G> {
    pub fn new() -> Self {
        SharedSubscriptionConnection { state: parking_lot::Mutex::new(State::Uninitialized) }
    }

    /// Acquires the shared connection, opening it via `open` if none
    /// exists yet. Concurrent callers during `acquiring` suspend until the
    /// first caller's `open` resolves and are handed the same connection.
    /// `open` returns the connection handle alongside the guard that keeps
    /// its lease alive; the guard is retained internally and only dropped
    /// once every subscriber has released.
    pub async fn acquire<F, Fut>(self: &Arc<Self>, open: F) -> Result<ConnectionHandle, ClientError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<(ConnectionHandle, G), ClientError>>,
    {
        let mut becomes_opener = false;
        let waiter = {
            let mut state = self.state.lock();
            match &mut *state {
                State::Available { conn, refcount, .. } => {
                    *refcount += 1;
                    return Ok(conn.clone());
                }
                State::Acquiring(waiters) => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    Some(rx)
                }
                State::Uninitialized => {
                    *state = State::Acquiring(Vec::new());
                    becomes_opener = true;
                    None
                }
            }
        };

        if !becomes_opener {
            let rx = waiter.expect("non-opener path always creates a waiter");
            return match rx.await {
                Ok(result) => result,
                // The opener dropped its sender: cancellation during
                // acquiring. The next waiter (if any) was already promoted
                // by `finish_opening`; if there is none, state already
                // reverted to uninitialized.
                Err(_) => Err(ClientError::Transport(
                    crate::error::TransportError::ConnectionClosedDuringCancellation,
                )),
            };
        }

        let result = open().await;
        self.finish_opening(result)
    }

    fn finish_opening(
        &self,
        result: Result<(ConnectionHandle, G), ClientError>,
    ) -> Result<ConnectionHandle, ClientError> {
        let mut state = self.state.lock();
        let waiters = match std::mem::replace(&mut *state, State::Uninitialized) {
            State::Acquiring(waiters) => waiters,
            other => {
                // Shouldn't happen: only the opener transitions out of
                // `Acquiring`, and only once.
                *state = other;
                return result.map(|(conn, _guard)| conn);
            }
        };
        match result {
            Ok((conn, guard)) => {
                let refcount = 1 + waiters.len();
                for tx in waiters {
                    let _ = tx.send(Ok(conn.clone()));
                }
                *state = State::Available { conn: conn.clone(), guard, refcount };
                Ok(conn)
            }
            Err(err) => {
                for tx in waiters {
                    let _ = tx.send(Err(ClientError::Transport(
                        crate::error::TransportError::ConnectionClosed,
                    )));
                }
                *state = State::Uninitialized;
                Err(err)
            }
        }
    }

    /// Releases one reference. When the refcount reaches zero the state
    /// returns to `uninitialized` and the held lease guard is dropped,
    /// returning its permit to the pool instead of leaking it.
    pub fn release(&self) {
        let mut state = self.state.lock();
        let hit_zero = matches!(&mut *state, State::Available { refcount, .. } if { *refcount -= 1; *refcount == 0 });
        if hit_zero {
            // Dropping the old state drops the guard along with it.
            *state = State::Uninitialized;
        }
    }
}
