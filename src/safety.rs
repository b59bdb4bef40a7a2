//! Crash guard for the helper driver
//!
//! While a mapping is in flight the helper driver is loaded. If the process
//! dies abnormally in that window the driver must still be unloaded, so the
//! orchestrator arms a [`SafetyNet`] with a standalone release action and the
//! process-wide hooks installed by [`install`] trip it. Tripping runs the
//! action at most once and does nothing else: no kernel access, no logging.

use std::sync::Once;

use parking_lot::{const_mutex, Mutex};

/// Release routine run from fault context.
pub type ReleaseAction = Box<dyn FnOnce() + Send + 'static>;

pub struct SafetyNet {
    action: Mutex<Option<ReleaseAction>>,
}

impl std::fmt::Debug for SafetyNet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SafetyNet").field("armed", &self.is_armed()).finish()
    }
}

impl Default for SafetyNet {
    fn default() -> Self {
        Self::new()
    }
}

impl SafetyNet {
    pub const fn new() -> Self {
        Self { action: const_mutex(None) }
    }

    /// Replaces any previously armed action.
    pub fn arm(&self, action: ReleaseAction) {
        *self.action.lock() = Some(action);
    }

    /// Drops the armed action after a normal release. Returns whether one was
    /// armed.
    pub fn disarm(&self) -> bool {
        self.action.lock().take().is_some()
    }

    pub fn is_armed(&self) -> bool {
        self.action.try_lock().map_or(true, |slot| slot.is_some())
    }

    /// Runs the armed action if there is one. Never blocks: if the slot is
    /// held (the fault hit while arming or disarming) nothing happens.
    pub fn trip(&self) -> bool {
        let action = match self.action.try_lock() {
            Some(mut slot) => slot.take(),
            None => None,
        };
        match action {
            Some(action) => {
                action();
                true
            }
            None => false,
        }
    }
}

static GLOBAL: SafetyNet = SafetyNet::new();
static INSTALL: Once = Once::new();

/// The instance the process-wide hooks trip.
pub fn global() -> &'static SafetyNet {
    &GLOBAL
}

/// Installs the panic hook (and on Windows the unhandled-exception filter)
/// that trip the global net. Later calls do nothing.
pub fn install() {
    INSTALL.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            GLOBAL.trip();
            previous(info);
        }));

        #[cfg(windows)]
        os::install_exception_filter();

        log::debug!("[Safety] crash guard installed");
    });
}

#[cfg(windows)]
mod os {
    use windows::Win32::System::Diagnostics::Debug::{SetUnhandledExceptionFilter, EXCEPTION_POINTERS};

    const EXCEPTION_EXECUTE_HANDLER: i32 = 1;

    unsafe extern "system" fn unhandled_exception_filter(_info: *const EXCEPTION_POINTERS) -> i32 {
        super::GLOBAL.trip();
        EXCEPTION_EXECUTE_HANDLER
    }

    pub fn install_exception_filter() {
        unsafe {
            SetUnhandledExceptionFilter(Some(unhandled_exception_filter));
        }
    }
}
