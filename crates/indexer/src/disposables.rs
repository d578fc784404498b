/// A resource that must be released explicitly. `dispose` is idempotent.
pub trait Disposable {
    fn dispose(&mut self);
}

/// Holds at most one live handle; `set` disposes the previous one first.
pub struct DisposableSlot<D: Disposable> {
    current: Option<D>,
}

impl<D: Disposable> DisposableSlot<D> {
    pub const fn new() -> Self {
        Self { current: None }
    }

    pub fn set(&mut self, next: D) {
        self.dispose();
        self.current = Some(next);
    }

    pub fn dispose(&mut self) {
        if let Some(mut current) = self.current.take() {
            current.dispose();
        }
    }

    pub const fn is_set(&self) -> bool {
        self.current.is_some()
    }
}

impl<D: Disposable> Default for DisposableSlot<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: Disposable> Drop for DisposableSlot<D> {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Holds one generation of handles; `set` disposes the whole previous generation.
pub struct DisposableContainer<D: Disposable> {
    items: Vec<D>,
}

impl<D: Disposable> DisposableContainer<D> {
    pub const fn new() -> Self {
        Self { items: Vec::new() }
    }

    pub fn set(&mut self, next: Vec<D>) {
        self.dispose();
        self.items = next;
    }

    pub fn dispose(&mut self) {
        for mut item in self.items.drain(..) {
            item.dispose();
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl<D: Disposable> Default for DisposableContainer<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: Disposable> Drop for DisposableContainer<D> {
    fn drop(&mut self) {
        self.dispose();
    }
}
