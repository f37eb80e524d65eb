//! Per-run descriptor cache.
//!
//! Maps a qualified name to its one [`UnitDescriptor`]. Each name owns a slot
//! with its own lock, so concurrent `get_or_create` calls for the same name
//! wait for the first caller's load while calls for other names proceed
//! independently. Nothing here outlives the process.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;

use crate::descriptor::UnitDescriptor;

type Slot = Arc<Mutex<Option<Arc<UnitDescriptor>>>>;

#[derive(Debug, Default)]
pub struct DescriptorCache {
    slots: DashMap<String, Slot>,
}

impl DescriptorCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the descriptor for `qualified_name`, building it with `load`
    /// if this is the first request. `load` runs at most once per name unless
    /// it fails, in which case the next caller tries again.
    pub fn get_or_create<F, E>(&self, qualified_name: &str, load: F) -> Result<Arc<UnitDescriptor>, E>
    where
        F: FnOnce() -> Result<UnitDescriptor, E>,
    {
        let slot = self.slot(qualified_name);
        let mut guard = slot.lock();
        if let Some(existing) = guard.as_ref() {
            return Ok(Arc::clone(existing));
        }
        let descriptor = Arc::new(load()?);
        *guard = Some(Arc::clone(&descriptor));
        Ok(descriptor)
    }

    /// Read-only lookup. Waits if the descriptor is being loaded right now.
    pub fn get(&self, qualified_name: &str) -> Option<Arc<UnitDescriptor>> {
        let slot = self
            .slots
            .get(qualified_name)
            .map(|entry| Arc::clone(entry.value()))?;
        let guard = slot.lock();
        guard.as_ref().map(Arc::clone)
    }

    pub fn contains(&self, qualified_name: &str) -> bool {
        self.get(qualified_name).is_some()
    }

    pub fn len(&self) -> usize {
        self.descriptors().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn descriptors(&self) -> Vec<Arc<UnitDescriptor>> {
        let slots: Vec<Slot> = self.slots.iter().map(|e| Arc::clone(e.value())).collect();
        let mut out: Vec<Arc<UnitDescriptor>> = slots
            .iter()
            .filter_map(|slot| slot.lock().as_ref().map(Arc::clone))
            .collect();
        out.sort_by(|a, b| a.qualified_name().cmp(b.qualified_name()));
        out
    }

    fn slot(&self, qualified_name: &str) -> Slot {
        if let Some(entry) = self.slots.get(qualified_name) {
            return Arc::clone(entry.value());
        }
        let entry = self.slots.entry(qualified_name.to_string()).or_default();
        Arc::clone(entry.value())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::UnitLocation;
    use std::path::PathBuf;
    use std::sync::Barrier;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn build(name: &str) -> UnitDescriptor {
        UnitDescriptor::new(
            name,
            UnitLocation::in_place(PathBuf::from(format!("{name}.class"))),
            vec![0xCA, 0xFE],
        )
    }

    #[test]
    fn get_or_create_returns_same_instance() {
        let cache = DescriptorCache::new();
        let first = cache
            .get_or_create("a.Foo", || Ok::<_, std::io::Error>(build("a.Foo")))
            .unwrap();
        let second = cache
            .get_or_create("a.Foo", || -> Result<UnitDescriptor, std::io::Error> {
                panic!("loader must not run twice")
            })
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn failed_load_leaves_no_descriptor() {
        let cache = DescriptorCache::new();
        let err = cache.get_or_create("a.Foo", || Err::<UnitDescriptor, _>("unreadable"));
        assert_eq!(err.unwrap_err(), "unreadable");
        assert!(cache.get("a.Foo").is_none());

        let d = cache
            .get_or_create("a.Foo", || Ok::<_, &str>(build("a.Foo")))
            .unwrap();
        assert_eq!(d.qualified_name(), "a.Foo");
    }

    #[test]
    fn concurrent_callers_for_one_name_share_a_single_load() {
        let cache = Arc::new(DescriptorCache::new());
        let loads = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let loads = Arc::clone(&loads);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    cache
                        .get_or_create("a.Foo", || {
                            loads.fetch_add(1, Ordering::SeqCst);
                            std::thread::sleep(Duration::from_millis(20));
                            Ok::<_, std::io::Error>(build("a.Foo"))
                        })
                        .unwrap()
                })
            })
            .collect();

        let descriptors: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert!(descriptors.iter().all(|d| Arc::ptr_eq(d, &descriptors[0])));
    }

    #[test]
    fn distinct_names_get_distinct_descriptors() {
        let cache = DescriptorCache::new();
        for name in ["b.Two", "a.One"] {
            cache
                .get_or_create(name, || Ok::<_, std::io::Error>(build(name)))
                .unwrap();
        }
        let names: Vec<_> = cache
            .descriptors()
            .iter()
            .map(|d| d.qualified_name().to_string())
            .collect();
        assert_eq!(names, vec!["a.One", "b.Two"]);
        assert!(cache.contains("a.One"));
        assert!(!cache.contains("c.Three"));
    }
}
