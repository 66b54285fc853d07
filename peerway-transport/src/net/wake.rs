use std::sync::Mutex;

/// Notifies the core when the host resumes from sleep, so accumulated
/// backoff delays can be discarded. Hooks live as long as the detector.
pub trait WakeDetector: Send + Sync {
    fn watch(&self, notify: Box<dyn Fn() + Send + Sync>);
}

/// Manually triggered detector for tests and for hosts without a native
/// wake source.
#[derive(Default)]
pub struct ManualWakeDetector {
    hooks: Mutex<Vec<Box<dyn Fn() + Send + Sync>>>,
}

impl ManualWakeDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn wake_now(&self) {
        for hook in self.hooks.lock().expect("wake hook lock").iter() {
            hook();
        }
    }
}

impl WakeDetector for ManualWakeDetector {
    fn watch(&self, notify: Box<dyn Fn() + Send + Sync>) {
        self.hooks.lock().expect("wake hook lock").push(notify);
    }
}
