use std::panic::Location;
use std::sync::{Mutex, MutexGuard};

/// Lock a std mutex, recovering (and logging) if a previous holder panicked.
#[track_caller]
pub(crate) fn lock<'a, T>(mutex: &'a Mutex<T>, context: &'static str) -> MutexGuard<'a, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(err) => {
            let loc = Location::caller();
            tracing::error!(
                target: "nova.dwp",
                context,
                file = loc.file(),
                line = loc.line(),
                "mutex poisoned; continuing with recovered guard"
            );
            err.into_inner()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn recovers_guard_after_panicking_holder() {
        let mutex = Arc::new(Mutex::new(1u32));
        let poisoner = mutex.clone();
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.lock().unwrap();
            panic!("poison");
        })
        .join();

        assert!(mutex.is_poisoned());
        let mut guard = lock(&mutex, "test");
        *guard += 1;
        assert_eq!(*guard, 2);
    }
}
