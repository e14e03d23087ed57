//! Small object pool for per-request scratch allocations.
//!
//! Elements are reset on checkout, not just check-in, so a leaked element
//! cannot poison a later request.

use std::sync::Mutex;

pub struct Pool<T> {
    items: Mutex<Vec<T>>,
    make: Box<dyn Fn() -> T + Send + Sync>,
    reset: Box<dyn Fn(&mut T) + Send + Sync>,
}

impl<T> Pool<T> {
    pub fn new(
        make: impl Fn() -> T + Send + Sync + 'static,
        reset: impl Fn(&mut T) + Send + Sync + 'static,
    ) -> Self {
        Pool {
            items: Mutex::new(Vec::new()),
            make: Box::new(make),
            reset: Box::new(reset),
        }
    }

    /// Pre-allocates `count` elements so steady-state checkouts avoid
    /// construction.
    pub fn prewarm(&self, count: usize) {
        let mut items = self.items.lock().unwrap();
        for _ in 0..count {
            items.push((self.make)());
        }
    }

    pub fn get(&self) -> T {
        let mut item = self
            .items
            .lock()
            .unwrap()
            .pop()
            .unwrap_or_else(|| (self.make)());
        (self.reset)(&mut item);
        item
    }

    pub fn put(&self, item: T) {
        self.items.lock().unwrap().push(item);
    }

    #[cfg(test)]
    fn idle(&self) -> usize {
        self.items.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reuses_returned_elements() {
        let pool: Pool<Vec<u8>> = Pool::new(Vec::new, Vec::clear);
        pool.prewarm(2);
        assert_eq!(pool.idle(), 2);

        let item = pool.get();
        assert_eq!(pool.idle(), 1);
        pool.put(item);
        assert_eq!(pool.idle(), 2);
    }

    #[test]
    fn resets_on_checkout() {
        let pool: Pool<Vec<u8>> = Pool::new(Vec::new, Vec::clear);
        let mut dirty = pool.get();
        dirty.extend_from_slice(b"stale");
        pool.put(dirty);

        let clean = pool.get();
        assert!(clean.is_empty());
    }

    #[test]
    fn allocates_when_empty() {
        let pool: Pool<u32> = Pool::new(|| 7, |_| {});
        assert_eq!(pool.idle(), 0);
        assert_eq!(pool.get(), 7);
    }
}
