//! Socket-handler registry: one background handler per fd.
//!
//! Backed by a `HashMap` keyed by fd for O(1) lookup. Callbacks live behind
//! `Rc<RefCell<..>>` so dispatch can clone a handle out of the map and
//! release the map borrow before invoking; handlers may therefore install,
//! replace, or remove registrations (including their own) from inside a
//! callback.

use std::cell::RefCell;
use std::collections::HashMap;
use std::os::fd::RawFd;
use std::rc::Rc;

use super::ConditionSet;

/// Shared, re-entrant handle to a background handler callback.
pub(crate) type HandlerCallback = Rc<RefCell<Box<dyn FnMut(ConditionSet)>>>;

/// A registered handler: the conditions it watches plus its callback.
pub(crate) struct SocketHandler {
    pub conditions: ConditionSet,
    pub callback: HandlerCallback,
}

#[derive(Default)]
pub(crate) struct HandlerSet {
    handlers: HashMap<RawFd, SocketHandler>,
}

impl HandlerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs or replaces the handler for `fd`.
    pub fn assign(&mut self, fd: RawFd, conditions: ConditionSet, callback: Box<dyn FnMut(ConditionSet)>) {
        self.handlers.insert(
            fd,
            SocketHandler {
                conditions,
                callback: Rc::new(RefCell::new(callback)),
            },
        );
    }

    /// Removes the handler for `fd`, if any.
    pub fn clear(&mut self, fd: RawFd) -> bool {
        self.handlers.remove(&fd).is_some()
    }

    /// Re-keys the handler from `old_fd` to `new_fd` without invoking it.
    /// Any handler previously registered under `new_fd` is displaced.
    pub fn move_handler(&mut self, old_fd: RawFd, new_fd: RawFd) {
        if let Some(handler) = self.handlers.remove(&old_fd) {
            self.handlers.insert(new_fd, handler);
        }
    }

    pub fn contains(&self, fd: RawFd) -> bool {
        self.handlers.contains_key(&fd)
    }

    /// Conditions the handler for `fd` is watching.
    pub fn conditions(&self, fd: RawFd) -> Option<ConditionSet> {
        self.handlers.get(&fd).map(|h| h.conditions)
    }

    /// Cloned callback handle plus watched conditions, for dispatch.
    pub fn callback(&self, fd: RawFd) -> Option<(ConditionSet, HandlerCallback)> {
        self.handlers
            .get(&fd)
            .map(|h| (h.conditions, h.callback.clone()))
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> Box<dyn FnMut(ConditionSet)> {
        Box::new(|_| {})
    }

    #[test]
    fn assign_then_lookup() {
        let mut set = HandlerSet::new();
        set.assign(3, ConditionSet::READABLE, noop());
        assert!(set.contains(3));
        assert_eq!(set.conditions(3), Some(ConditionSet::READABLE));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn assign_replaces_existing_handler() {
        let mut set = HandlerSet::new();
        set.assign(3, ConditionSet::READABLE, noop());
        set.assign(3, ConditionSet::READABLE | ConditionSet::WRITABLE, noop());
        assert_eq!(set.len(), 1);
        assert_eq!(
            set.conditions(3),
            Some(ConditionSet::READABLE | ConditionSet::WRITABLE)
        );
    }

    #[test]
    fn clear_removes_handler() {
        let mut set = HandlerSet::new();
        set.assign(3, ConditionSet::READABLE, noop());
        assert!(set.clear(3));
        assert!(!set.clear(3));
        assert!(!set.contains(3));
    }

    #[test]
    fn move_handler_rekeys_without_invoking() {
        use std::cell::Cell;
        use std::rc::Rc;

        let mut set = HandlerSet::new();
        let invoked = Rc::new(Cell::new(false));
        let flag = invoked.clone();
        set.assign(3, ConditionSet::WRITABLE, Box::new(move |_| flag.set(true)));

        set.move_handler(3, 9);
        assert!(!set.contains(3));
        assert_eq!(set.conditions(9), Some(ConditionSet::WRITABLE));
        assert!(!invoked.get());
    }

    #[test]
    fn move_handler_with_unknown_source_is_a_no_op() {
        let mut set = HandlerSet::new();
        set.move_handler(42, 43);
        assert!(!set.contains(43));
    }
}
