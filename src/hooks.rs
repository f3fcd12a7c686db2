//! Named hook points tests can arm.
//!
//! Production code calls [`poke`] at a handful of delicate spots; with no
//! hook armed the call is a cheap map lookup. Tests arm callbacks to widen
//! race windows or observe must-not-happen paths.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::OnceLock;

type Hook = Box<dyn Fn() + Send + Sync>;

fn registry() -> &'static RwLock<HashMap<&'static str, Hook>> {
    static REGISTRY: OnceLock<RwLock<HashMap<&'static str, Hook>>> = OnceLock::new();
    REGISTRY.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Arm a named hook. Replaces any previous hook of the same name.
pub fn arm(name: &'static str, hook: impl Fn() + Send + Sync + 'static) {
    registry().write().insert(name, Box::new(hook));
}

/// Disarm a named hook.
pub fn disarm(name: &'static str) {
    registry().write().remove(name);
}

/// Invoke a named hook if armed.
pub fn poke(name: &'static str) {
    if let Some(hook) = registry().read().get(name) {
        hook();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_arm_poke_disarm() {
        let hits = Arc::new(AtomicU32::new(0));
        let hits2 = Arc::clone(&hits);
        arm("test-hook-arm-poke", move || {
            hits2.fetch_add(1, Ordering::SeqCst);
        });

        poke("test-hook-arm-poke");
        poke("test-hook-arm-poke");
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        disarm("test-hook-arm-poke");
        poke("test-hook-arm-poke");
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        // Unarmed hooks are no-ops.
        poke("never-armed");
    }
}
