use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use crate::error::{Result, TrainingError};

/// Cooperative stop request, polled by the trainer between epochs.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    flag: Arc<AtomicBool>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raises the signal on Ctrl-C. Only one handler may be installed per
    /// process.
    pub fn install_ctrlc_handler(&self) -> Result<()> {
        let flag = Arc::clone(&self.flag);
        ctrlc::set_handler(move || {
            flag.store(true, Ordering::Relaxed);
        })
        .map_err(|err| {
            TrainingError::initialization(format!("failed to install signal handler: {err}"))
        })
    }

    pub fn raise(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_raised(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}
