#![forbid(unsafe_code)]

//! Named shared-object registry
//!
//! Locks and barriers are identified by stable, filesystem-path-like string
//! names (for example `".render_units"`); every opener of the same name in
//! the process group resolves to the same underlying shared object. Each
//! primitive keeps one process-wide [`Namespace`] instance, which is the
//! single seam a shared-mapping backend would replace.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

/// Registry mapping names to shared coordination objects.
#[derive(Debug)]
pub struct Namespace<T> {
    objects: DashMap<String, Arc<T>>,
}

impl<T> Namespace<T> {
    /// Creates an empty namespace.
    #[must_use]
    pub fn new() -> Self {
        Self {
            objects: DashMap::new(),
        }
    }

    /// Resolves `name`, creating the object if it does not exist yet.
    ///
    /// Returns the shared object and whether this call created it. Creation
    /// is atomic per name: two racing openers observe the same object with
    /// exactly one of them reported as the creator.
    pub fn open_or_insert<F>(&self, name: &str, create: F) -> (Arc<T>, bool)
    where
        F: FnOnce() -> T,
    {
        match self.objects.entry(name.to_owned()) {
            Entry::Occupied(entry) => (Arc::clone(entry.get()), false),
            Entry::Vacant(entry) => {
                let object = Arc::new(create());
                entry.insert(Arc::clone(&object));
                (object, true)
            }
        }
    }

    /// Removes `name` only while it still resolves to `object`.
    ///
    /// A concurrent close-then-reopen may have installed a new generation
    /// under the same name; that generation is left untouched.
    pub fn remove_matching(&self, name: &str, object: &Arc<T>) {
        self.objects
            .remove_if(name, |_, current| Arc::ptr_eq(current, object));
    }

    /// Returns whether `name` currently resolves to an object.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.objects.contains_key(name)
    }

    /// Number of registered names.
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Returns whether the namespace is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

impl<T> Default for Namespace<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_is_idempotent() {
        let ns: Namespace<u32> = Namespace::new();

        let (first, created) = ns.open_or_insert("/locks/a", || 7);
        assert!(created);

        let (second, created) = ns.open_or_insert("/locks/a", || 99);
        assert!(!created, "second open must not create");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(*second, 7, "creation closure must not rerun");
    }

    #[test]
    fn test_names_are_disjoint() {
        let ns: Namespace<u32> = Namespace::new();

        let (a, _) = ns.open_or_insert("/locks/a", || 1);
        let (b, _) = ns.open_or_insert("/locks/b", || 2);

        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(ns.len(), 2);
    }

    #[test]
    fn test_remove_matching_generation() {
        let ns: Namespace<u32> = Namespace::new();

        let (old, _) = ns.open_or_insert("/locks/a", || 1);
        ns.remove_matching("/locks/a", &old);
        assert!(!ns.contains("/locks/a"));

        // A stale handle must not evict a newer generation.
        let (new, created) = ns.open_or_insert("/locks/a", || 2);
        assert!(created);
        ns.remove_matching("/locks/a", &old);
        assert!(ns.contains("/locks/a"));
        assert_eq!(*new, 2);
    }

    #[test]
    fn test_concurrent_open_single_creation() {
        let ns: Arc<Namespace<u32>> = Arc::new(Namespace::new());
        let mut handles = Vec::new();

        for _ in 0..8 {
            let ns = Arc::clone(&ns);
            handles.push(std::thread::spawn(move || {
                let (_, created) = ns.open_or_insert("/locks/race", || 42);
                usize::from(created)
            }));
        }

        let creations: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(creations, 1, "exactly one opener may create");
    }
}
