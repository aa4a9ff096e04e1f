use core::time::Duration;

/// Services the host core needs from the surrounding OS.
pub trait KernelOp: Send + Sync {
    /// Monotonic time since an arbitrary epoch.
    fn now(&self) -> Duration;

    fn delay(&self, duration: Duration);

    /// Called between polls while a caller busy-waits on a completion.
    fn yield_now(&self) {
        core::hint::spin_loop();
    }
}

pub(crate) type Kernel = &'static dyn KernelOp;

/// Spins until `condition` holds or `timeout` elapses. Returns whether the
/// condition was met.
pub(crate) fn spin_until(kernel: Kernel, timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = kernel.now().saturating_add(timeout);
    loop {
        if condition() {
            return true;
        }
        if kernel.now() >= deadline {
            return condition();
        }
        kernel.yield_now();
    }
}
