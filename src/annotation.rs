//! Per-thread annotation scopes and named ranges
//!
//! Application code marks regions of work with annotations (nested scopes
//! joined with `::`) and named ranges. When a driver call completes, the
//! tracer reads the calling thread's current annotation and range and
//! stores them next to the call's correlation id.

use fnv::FnvHashMap;
use std::cell::RefCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Separator between nested annotation scopes
pub const SCOPE_SEPARATOR: &str = "::";

static ANNOTATIONS_ENABLED: AtomicUsize = AtomicUsize::new(0);

#[derive(Default)]
struct ScopeStack {
    /// Byte length of the joined string at each depth, for O(1) pops
    ends: Vec<usize>,
    joined: String,
}

impl ScopeStack {
    fn push(&mut self, name: &str) {
        if !self.ends.is_empty() {
            self.joined.push_str(SCOPE_SEPARATOR);
        }
        self.joined.push_str(name);
        self.ends.push(self.joined.len());
    }

    fn pop(&mut self) {
        if self.ends.pop().is_none() {
            return;
        }
        let keep = match self.ends.last() {
            Some(&end) => end,
            None => 0,
        };
        self.joined.truncate(keep);
    }
}

thread_local! {
    static SCOPES: RefCell<ScopeStack> = RefCell::new(ScopeStack::default());
    static RANGES: RefCell<Vec<String>> = const { RefCell::new(Vec::new()) };
}

/// Process-wide switch plus per-thread stack of annotation scopes.
///
/// Enabling is reference counted so that nested tracing sessions keep
/// annotations on until the last one finishes.
pub struct AnnotationStack;

impl AnnotationStack {
    pub fn enable() {
        ANNOTATIONS_ENABLED.fetch_add(1, Ordering::AcqRel);
    }

    /// Release one enable; returns false when nothing was enabled
    pub fn disable() -> bool {
        let released = ANNOTATIONS_ENABLED
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if !released {
            tracing::debug!("unbalanced annotation disable ignored");
        }
        released
    }

    pub fn is_enabled() -> bool {
        ANNOTATIONS_ENABLED.load(Ordering::Acquire) > 0
    }

    /// Open a nested scope on the calling thread
    pub fn push(name: &str) {
        SCOPES.with(|scopes| scopes.borrow_mut().push(name));
    }

    /// Close the innermost scope on the calling thread
    pub fn pop() {
        SCOPES.with(|scopes| scopes.borrow_mut().pop());
    }

    /// Open a scope that closes when the returned guard is dropped
    pub fn scoped(name: &str) -> ScopedAnnotation {
        Self::push(name);
        ScopedAnnotation { _private: () }
    }

    /// Run `f` with the current joined annotation, or "" when disabled
    pub fn with_current<R>(f: impl FnOnce(&str) -> R) -> R {
        if !Self::is_enabled() {
            return f("");
        }
        SCOPES.with(|scopes| match scopes.try_borrow() {
            Ok(scopes) => f(&scopes.joined),
            Err(_) => f(""),
        })
    }

    pub fn current() -> String {
        Self::with_current(str::to_string)
    }
}

/// Guard returned by [`AnnotationStack::scoped`]
#[must_use = "the annotation scope closes when the guard is dropped"]
pub struct ScopedAnnotation {
    _private: (),
}

impl Drop for ScopedAnnotation {
    fn drop(&mut self) {
        AnnotationStack::pop();
    }
}

/// Per-thread stack of named ranges fed by range push/pop callbacks.
pub struct RangeTracker;

impl RangeTracker {
    pub fn enter_range(name: &str) {
        RANGES.with(|ranges| ranges.borrow_mut().push(name.to_string()));
    }

    pub fn exit_range() {
        RANGES.with(|ranges| {
            ranges.borrow_mut().pop();
        });
    }

    /// Run `f` with the innermost range of the calling thread, or ""
    pub fn with_current<R>(f: impl FnOnce(&str) -> R) -> R {
        RANGES.with(|ranges| match ranges.try_borrow() {
            Ok(ranges) => f(ranges.last().map_or("", String::as_str)),
            Err(_) => f(""),
        })
    }

    pub fn current() -> String {
        Self::with_current(str::to_string)
    }

    pub fn depth() -> usize {
        RANGES.with(|ranges| ranges.borrow().len())
    }
}

/// Annotation and range recorded for one correlation id
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnnotationInfo {
    pub annotation: Option<Arc<str>>,
    pub range: Option<Arc<str>>,
}

impl AnnotationInfo {
    pub fn annotation_str(&self) -> &str {
        self.annotation.as_deref().unwrap_or("")
    }

    pub fn range_str(&self) -> &str {
        self.range.as_deref().unwrap_or("")
    }

    pub fn is_empty(&self) -> bool {
        self.annotation_str().is_empty() && self.range_str().is_empty()
    }
}

/// Merged correlation id to annotation lookup built at teardown
pub type AnnotationMap = FnvHashMap<u32, AnnotationInfo>;

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_nested_scopes_are_joined() {
        AnnotationStack::enable();
        {
            let _outer = AnnotationStack::scoped("train");
            let _inner = AnnotationStack::scoped("step_3");
            assert_eq!(AnnotationStack::current(), "train::step_3");
        }
        assert_eq!(AnnotationStack::current(), "");
        AnnotationStack::disable();
    }

    #[test]
    #[serial]
    fn test_disabled_stack_reports_empty() {
        let _scope = AnnotationStack::scoped("hidden");
        assert!(!AnnotationStack::is_enabled());
        assert_eq!(AnnotationStack::current(), "");
    }

    #[test]
    #[serial]
    fn test_enable_is_reference_counted() {
        AnnotationStack::enable();
        AnnotationStack::enable();
        assert!(AnnotationStack::disable());
        assert!(AnnotationStack::is_enabled());
        assert!(AnnotationStack::disable());
        assert!(!AnnotationStack::is_enabled());
        // Extra disables never underflow
        assert!(!AnnotationStack::disable());
        assert!(!AnnotationStack::is_enabled());
        AnnotationStack::enable();
        assert!(AnnotationStack::is_enabled());
        assert!(AnnotationStack::disable());
    }

    #[test]
    #[serial]
    fn test_pop_restores_outer_scope() {
        AnnotationStack::enable();
        AnnotationStack::push("a");
        AnnotationStack::push("bb");
        AnnotationStack::pop();
        assert_eq!(AnnotationStack::current(), "a");
        AnnotationStack::pop();
        AnnotationStack::pop();
        assert_eq!(AnnotationStack::current(), "");
        AnnotationStack::disable();
    }

    #[test]
    fn test_ranges_are_thread_local() {
        RangeTracker::enter_range("forward");
        RangeTracker::enter_range("attention");
        assert_eq!(RangeTracker::current(), "attention");

        let other = std::thread::spawn(RangeTracker::current).join().unwrap();
        assert_eq!(other, "");

        RangeTracker::exit_range();
        assert_eq!(RangeTracker::current(), "forward");
        RangeTracker::exit_range();
        RangeTracker::exit_range();
        assert_eq!(RangeTracker::depth(), 0);
    }

    #[test]
    fn test_annotation_info_accessors() {
        let info = AnnotationInfo {
            annotation: Some(Arc::from("step")),
            range: None,
        };
        assert_eq!(info.annotation_str(), "step");
        assert_eq!(info.range_str(), "");
        assert!(!info.is_empty());
        assert!(AnnotationInfo::default().is_empty());
    }
}
