use std::any::Any;

use tracing::warn;

use crate::reactive::{Scope, Signal};
use crate::tree::VNode;

/// A unit of UI. Persistent state belongs in hooks obtained from the render
/// context so it lives as long as the instance, not the `Component` value.
pub trait Component: Send + 'static {
    fn render(&self, cx: &mut RenderCx<'_>) -> VNode;
}

/// Positional hook storage owned by one component instance.
#[derive(Default)]
pub struct HookSlots {
    slots: Vec<Box<dyn Any + Send + Sync>>,
    cursor: usize,
}

impl HookSlots {
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn begin_render(&mut self) {
        self.cursor = 0;
    }

    fn next<T, F>(&mut self, init: F) -> &T
    where
        T: Any + Send + Sync,
        F: FnOnce() -> T,
    {
        let index = self.cursor;
        self.cursor += 1;
        if index < self.slots.len() && !self.slots[index].is::<T>() {
            warn!(slot = index, "hook order changed between renders; resetting slot");
            self.slots.truncate(index);
        }
        if index == self.slots.len() {
            self.slots.push(Box::new(init()));
        }
        match self.slots[index].downcast_ref::<T>() {
            Some(value) => value,
            None => unreachable!("slot {index} was just checked for its type"),
        }
    }
}

pub struct RenderCx<'a> {
    scope: &'a Scope,
    hooks: &'a mut HookSlots,
    path: &'a str,
}

impl<'a> RenderCx<'a> {
    pub fn new(scope: &'a Scope, hooks: &'a mut HookSlots, path: &'a str) -> Self {
        hooks.begin_render();
        Self { scope, hooks, path }
    }

    pub fn scope(&self) -> &Scope {
        self.scope
    }

    /// Current route of the session.
    pub fn path(&self) -> &str {
        self.path
    }

    /// Signal created on first render and returned unchanged afterwards.
    pub fn use_signal<T, F>(&mut self, init: F) -> Signal<T>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> T,
    {
        let scope = self.scope;
        self.hooks.next(|| scope.signal(init())).clone()
    }

    /// Effect registered once, on the first render of the instance.
    pub fn use_effect<F>(&mut self, effect: F)
    where
        F: FnMut() + Send + 'static,
    {
        let scope = self.scope;
        self.hooks.next(|| {
            scope.effect(effect);
            EffectSlot
        });
    }

    /// Cleanup registered once and run when the instance is disposed.
    pub fn use_cleanup<F>(&mut self, cleanup: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let scope = self.scope;
        self.hooks.next(|| {
            scope.on_cleanup(cleanup);
            CleanupSlot
        });
    }
}

struct EffectSlot;

struct CleanupSlot;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::Runtime;
    use crate::tree::{el, text};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Counter {
        renders: Arc<AtomicUsize>,
    }

    impl Component for Counter {
        fn render(&self, cx: &mut RenderCx<'_>) -> VNode {
            self.renders.fetch_add(1, Ordering::SeqCst);
            let count = cx.use_signal(|| 0u32);
            cx.use_effect(|| {});
            el("p").child(text(count.get().to_string())).into()
        }
    }

    #[test_timeout::timeout]
    fn signals_persist_across_renders() {
        let runtime = Runtime::new();
        let scope = runtime.root_scope();
        let mut hooks = HookSlots::default();

        let first = RenderCx::new(&scope, &mut hooks, "/").use_signal(|| 0u32);
        first.set(5);
        let second = RenderCx::new(&scope, &mut hooks, "/").use_signal(|| 0u32);
        assert_eq!(second.get_untracked(), 5);
        assert_eq!(hooks.len(), 1);
    }

    #[test_timeout::timeout]
    fn effects_register_once_per_instance() {
        let runtime = Runtime::new();
        let scope = runtime.root_scope();
        let mut hooks = HookSlots::default();
        let component = Counter {
            renders: Arc::new(AtomicUsize::new(0)),
        };

        for _ in 0..3 {
            let mut cx = RenderCx::new(&scope, &mut hooks, "/");
            component.render(&mut cx);
        }
        assert_eq!(component.renders.load(Ordering::SeqCst), 3);
        assert_eq!(hooks.len(), 2);
        assert_eq!(runtime.pending_effect_count(), 1);
    }

    #[test_timeout::timeout]
    fn mismatched_hook_type_resets_the_slot() {
        let runtime = Runtime::new();
        let scope = runtime.root_scope();
        let mut hooks = HookSlots::default();

        let mut cx = RenderCx::new(&scope, &mut hooks, "/");
        cx.use_signal(|| 1u32).set(9);

        let mut cx = RenderCx::new(&scope, &mut hooks, "/");
        let replaced = cx.use_signal(|| String::from("fresh"));
        assert_eq!(replaced.get_untracked(), "fresh");
    }
}
