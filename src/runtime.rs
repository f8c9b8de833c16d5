//! Process-wide runtime: the single-threaded reactor and library lifecycle.
//!
//! The Transport Services model runs everything on one cooperative event
//! loop: all sockets, timers, DNS completions and user callbacks. Here that
//! loop is a current-thread tokio runtime paired with a [`LocalSet`]; every
//! internal task is spawned locally, so no user callback ever runs
//! concurrently with another and shared state needs no atomics.
//!
//! Lifecycle bracket: [`initialize`] builds the reactor, registers the
//! built-in protocol adapters and stores the global TLS file configuration;
//! [`start_event_loop`] blocks the caller until every scheduled task has
//! drained (connections closed, listeners stopped); [`close_library`] tears
//! the reactor down and fails while live connections remain. State is
//! thread-local, so each thread gets an independent reactor and tests reset
//! naturally between cases.

use std::cell::RefCell;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::rc::{Rc, Weak};

use tokio::task::{JoinHandle, LocalSet};
use tracing::{debug, info};

use crate::connection::Connection;
use crate::error::{Result, TapsError};
use crate::logging;
use crate::properties::ConnectionState;
use crate::protocol::{self, ProtocolAdapter};

/// File-based TLS material shared by every secure protocol adapter.
#[derive(Debug, Default)]
pub(crate) struct GlobalConfig {
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
}

enum LoopState {
    Idle {
        runtime: tokio::runtime::Runtime,
        local: LocalSet,
    },
    Running,
}

struct LibraryContext {
    loop_state: LoopState,
    config: Rc<GlobalConfig>,
    adapters: Vec<&'static dyn ProtocolAdapter>,
    connections: Vec<Weak<Connection>>,
}

thread_local! {
    static CONTEXT: RefCell<Option<LibraryContext>> = const { RefCell::new(None) };
}

/// Establish the reactor and register the built-in protocol adapters.
///
/// Must be invoked exactly once on a thread before any other operation;
/// the optional certificate and key file paths feed the QUIC adapter.
pub fn initialize(cert_file: Option<&Path>, key_file: Option<&Path>) -> Result<()> {
    logging::init();
    CONTEXT.with(|cell| {
        let mut slot = cell.borrow_mut();
        if slot.is_some() {
            return Err(TapsError::AlreadyInitialized);
        }

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        *slot = Some(LibraryContext {
            loop_state: LoopState::Idle {
                runtime,
                local: LocalSet::new(),
            },
            config: Rc::new(GlobalConfig {
                cert_file: cert_file.map(Path::to_path_buf),
                key_file: key_file.map(Path::to_path_buf),
            }),
            adapters: protocol::builtin_adapters(),
            connections: Vec::new(),
        });
        info!("transport services runtime initialized");
        Ok(())
    })
}

/// Tear down the reactor. Fails while live connections remain.
pub fn close_library() -> Result<()> {
    CONTEXT.with(|cell| {
        let mut slot = cell.borrow_mut();
        let ctx = slot.as_mut().ok_or(TapsError::NotInitialized)?;
        if matches!(ctx.loop_state, LoopState::Running) {
            return Err(TapsError::InvalidArgument(
                "cannot close the library from inside the event loop",
            ));
        }

        ctx.connections.retain(|weak| {
            weak.upgrade().is_some_and(|conn| {
                !matches!(
                    conn.state(),
                    ConnectionState::Closed | ConnectionState::Errored
                )
            })
        });
        let live = ctx.connections.len();
        if live > 0 {
            return Err(TapsError::LiveConnections(live));
        }

        *slot = None;
        info!("transport services runtime closed");
        Ok(())
    })
}

/// Drive the reactor until it drains: every spawned task has completed,
/// which happens once all connections are closed and listeners stopped.
/// Blocks the calling thread. May be invoked again after new work is
/// scheduled.
pub fn start_event_loop() -> Result<()> {
    let (runtime, local) = CONTEXT.with(|cell| {
        let mut slot = cell.borrow_mut();
        let ctx = slot.as_mut().ok_or(TapsError::NotInitialized)?;
        match std::mem::replace(&mut ctx.loop_state, LoopState::Running) {
            LoopState::Idle { runtime, local } => Ok((runtime, local)),
            LoopState::Running => Err(TapsError::InvalidArgument(
                "event loop is already running",
            )),
        }
    })?;

    debug!("starting the event loop");
    runtime.block_on(local);
    debug!("event loop drained");

    CONTEXT.with(|cell| {
        if let Some(ctx) = cell.borrow_mut().as_mut() {
            ctx.loop_state = LoopState::Idle {
                runtime,
                local: LocalSet::new(),
            };
        }
    });
    Ok(())
}

/// Schedule a task on the reactor, from inside or outside the running loop.
pub(crate) fn spawn<F>(future: F) -> JoinHandle<F::Output>
where
    F: Future + 'static,
    F::Output: 'static,
{
    let mut future = Some(future);
    let queued = CONTEXT.with(|cell| {
        let slot = cell.borrow();
        match slot.as_ref().map(|ctx| &ctx.loop_state) {
            Some(LoopState::Idle { local, .. }) => {
                Some(local.spawn_local(future.take().expect("future consumed twice")))
            }
            _ => None,
        }
    });
    match queued {
        Some(handle) => handle,
        // Inside the running loop the ambient LocalSet picks the task up.
        None => tokio::task::spawn_local(future.take().expect("future consumed twice")),
    }
}

/// Guard used by public entry points before scheduling work.
pub(crate) fn ensure_initialized() -> Result<()> {
    CONTEXT.with(|cell| {
        if cell.borrow().is_some() {
            Ok(())
        } else {
            Err(TapsError::NotInitialized)
        }
    })
}

pub(crate) fn config() -> Result<Rc<GlobalConfig>> {
    CONTEXT.with(|cell| {
        cell.borrow()
            .as_ref()
            .map(|ctx| Rc::clone(&ctx.config))
            .ok_or(TapsError::NotInitialized)
    })
}

/// The registered protocol adapters, in registration order.
pub(crate) fn adapters() -> Result<Vec<&'static dyn ProtocolAdapter>> {
    CONTEXT.with(|cell| {
        cell.borrow()
            .as_ref()
            .map(|ctx| ctx.adapters.clone())
            .ok_or(TapsError::NotInitialized)
    })
}

/// Track a connection for the `close_library` liveness check.
pub(crate) fn register_connection(conn: &Rc<Connection>) {
    CONTEXT.with(|cell| {
        if let Some(ctx) = cell.borrow_mut().as_mut() {
            ctx.connections.push(Rc::downgrade(conn));
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initialize_is_single_shot_per_thread() {
        initialize(None, None).unwrap();
        assert!(matches!(
            initialize(None, None),
            Err(TapsError::AlreadyInitialized)
        ));
        close_library().unwrap();
    }

    #[test]
    fn operations_require_initialization() {
        // Runs on its own test thread, so the context starts empty.
        assert!(matches!(close_library(), Err(TapsError::NotInitialized)));
        assert!(matches!(start_event_loop(), Err(TapsError::NotInitialized)));
        assert!(matches!(ensure_initialized(), Err(TapsError::NotInitialized)));
    }

    #[test]
    fn event_loop_drains_scheduled_work() {
        initialize(None, None).unwrap();

        let handle = spawn(async { 41 + 1 });
        start_event_loop().unwrap();

        // The loop only returns once every task has completed.
        assert!(handle.is_finished());
        close_library().unwrap();
    }

    #[test]
    fn event_loop_can_run_repeatedly() {
        initialize(None, None).unwrap();

        spawn(async {});
        start_event_loop().unwrap();
        spawn(async {});
        start_event_loop().unwrap();

        close_library().unwrap();
    }
}
