//! Wall-clock epoch ticking.
//!
//! Deadlines are enforced with tokio timeouts, which only fire when the
//! driving future yields.  A compute-bound guest would never yield on its
//! own, so every engine runs with epoch interruption and its stores yield
//! back to the scheduler each epoch.  One process-wide thread advances the
//! epoch of every registered engine every [`EPOCH_TICK`]; it deliberately
//! lives outside tokio so ticks keep flowing even when a current-thread
//! runtime is pinned inside guest code.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use wasmtime::Engine;

const EPOCH_TICK: Duration = Duration::from_millis(10);

struct TickerShared {
    engines: Mutex<HashMap<u64, Engine>>,
    next_id: AtomicU64,
}

pub(crate) struct EpochTicker {
    shared: Arc<TickerShared>,
}

/// Keeps epoch ticks flowing to one engine; unregisters on drop.
pub(crate) struct EpochRegistration {
    id: u64,
    shared: Arc<TickerShared>,
}

impl EpochTicker {
    fn new() -> std::io::Result<Self> {
        let shared = Arc::new(TickerShared {
            engines: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        });

        let shared_bg = Arc::clone(&shared);
        std::thread::Builder::new()
            .name("scriptbox-epoch-ticker".to_string())
            .spawn(move || loop {
                std::thread::park_timeout(EPOCH_TICK);
                let engines: Vec<Engine> = shared_bg
                    .engines
                    .lock()
                    .expect("epoch ticker lock")
                    .values()
                    .cloned()
                    .collect();
                for engine in engines {
                    engine.increment_epoch();
                }
            })?;

        Ok(Self { shared })
    }

    pub(crate) fn register(&self, engine: Engine) -> EpochRegistration {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        self.shared
            .engines
            .lock()
            .expect("epoch ticker lock")
            .insert(id, engine);
        EpochRegistration {
            id,
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Drop for EpochRegistration {
    fn drop(&mut self) {
        self.shared
            .engines
            .lock()
            .expect("epoch ticker lock")
            .remove(&self.id);
    }
}

/// The lazily started process-wide ticker.
pub(crate) fn global_ticker() -> std::io::Result<&'static EpochTicker> {
    static TICKER: OnceLock<Result<EpochTicker, (std::io::ErrorKind, String)>> = OnceLock::new();

    match TICKER.get_or_init(|| EpochTicker::new().map_err(|e| (e.kind(), e.to_string()))) {
        Ok(ticker) => Ok(ticker),
        Err((kind, message)) => Err(std::io::Error::new(*kind, message.clone())),
    }
}
