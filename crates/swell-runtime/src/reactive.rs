//! Fine-grained reactivity: signals notify the components and effects that
//! read them, scopes own effects and cleanups and tear down children first.

use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComponentId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EffectId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Observer {
    Component(ComponentId),
    Effect(EffectId),
}

type EffectFn = Box<dyn FnMut() + Send>;
type Waker = Arc<dyn Fn() + Send + Sync>;

thread_local! {
    // (runtime address, observer) for the render or effect running on this thread.
    static TRACKING: RefCell<Vec<(usize, Observer)>> = const { RefCell::new(Vec::new()) };
}

/// Owner of the dirty set and effect queue for one session.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

struct RuntimeInner {
    next_id: AtomicU64,
    live_components: Mutex<HashSet<ComponentId>>,
    dirty: Mutex<BTreeSet<ComponentId>>,
    effects: Mutex<HashMap<EffectId, Arc<Mutex<EffectFn>>>>,
    pending: Mutex<PendingEffects>,
    waker: RwLock<Option<Waker>>,
}

#[derive(Default)]
struct PendingEffects {
    order: VecDeque<EffectId>,
    queued: HashSet<EffectId>,
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("dirty", &self.inner.dirty.lock().len())
            .field("effects", &self.inner.effects.lock().len())
            .finish()
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl Runtime {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RuntimeInner {
                next_id: AtomicU64::new(1),
                live_components: Mutex::new(HashSet::new()),
                dirty: Mutex::new(BTreeSet::new()),
                effects: Mutex::new(HashMap::new()),
                pending: Mutex::new(PendingEffects::default()),
                waker: RwLock::new(None),
            }),
        }
    }

    /// Installs the callback fired when work is scheduled outside a flush.
    pub fn set_waker(&self, waker: impl Fn() + Send + Sync + 'static) {
        *self.inner.waker.write() = Some(Arc::new(waker));
    }

    pub fn root_scope(&self) -> Scope {
        Scope::new(self.clone(), None)
    }

    pub fn register_component(&self) -> ComponentId {
        let id = ComponentId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner.live_components.lock().insert(id);
        id
    }

    pub fn unregister_component(&self, id: ComponentId) {
        self.inner.live_components.lock().remove(&id);
        self.inner.dirty.lock().remove(&id);
    }

    pub fn mark_dirty(&self, id: ComponentId) {
        if !self.inner.live_components.lock().contains(&id) {
            return;
        }
        let inserted = self.inner.dirty.lock().insert(id);
        if inserted {
            self.wake();
        }
    }

    /// Dirty components in creation order, which puts parents before children.
    pub fn take_dirty(&self) -> Vec<ComponentId> {
        std::mem::take(&mut *self.inner.dirty.lock())
            .into_iter()
            .collect()
    }

    pub fn has_dirty(&self) -> bool {
        !self.inner.dirty.lock().is_empty()
    }

    pub fn has_pending_effects(&self) -> bool {
        !self.inner.pending.lock().order.is_empty()
    }

    pub fn pending_effect_count(&self) -> usize {
        self.inner.pending.lock().order.len()
    }

    pub fn discard_pending_effects(&self) -> usize {
        let mut pending = self.inner.pending.lock();
        pending.queued.clear();
        let dropped = pending.order.len();
        pending.order.clear();
        dropped
    }

    /// Runs the oldest queued effect. Returns `false` when the queue is empty.
    pub fn run_next_effect(&self) -> bool {
        let next = {
            let mut pending = self.inner.pending.lock();
            let next = pending.order.pop_front();
            if let Some(id) = next {
                pending.queued.remove(&id);
            }
            next
        };
        let Some(id) = next else {
            return false;
        };
        let effect = self.inner.effects.lock().get(&id).cloned();
        if let Some(effect) = effect {
            let mut run = effect.lock();
            self.track(Observer::Effect(id), || (&mut *run)());
        }
        true
    }

    /// Runs `f` with `observer` recorded as the reader of any signal it touches.
    pub fn track<R>(&self, observer: Observer, f: impl FnOnce() -> R) -> R {
        let key = self.key();
        TRACKING.with(|stack| stack.borrow_mut().push((key, observer)));
        struct Pop;
        impl Drop for Pop {
            fn drop(&mut self) {
                TRACKING.with(|stack| {
                    stack.borrow_mut().pop();
                });
            }
        }
        let _pop = Pop;
        f()
    }

    fn key(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }

    fn current_observer(&self) -> Option<Observer> {
        let key = self.key();
        TRACKING.with(|stack| {
            stack
                .borrow()
                .last()
                .filter(|(owner, _)| *owner == key)
                .map(|(_, observer)| *observer)
        })
    }

    fn is_live(&self, observer: Observer) -> bool {
        match observer {
            Observer::Component(id) => self.inner.live_components.lock().contains(&id),
            Observer::Effect(id) => self.inner.effects.lock().contains_key(&id),
        }
    }

    fn register_effect(&self, f: EffectFn) -> EffectId {
        let id = EffectId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner
            .effects
            .lock()
            .insert(id, Arc::new(Mutex::new(f)));
        self.queue_effect(id);
        id
    }

    fn unregister_effect(&self, id: EffectId) {
        self.inner.effects.lock().remove(&id);
        let mut pending = self.inner.pending.lock();
        if pending.queued.remove(&id) {
            pending.order.retain(|queued| *queued != id);
        }
    }

    fn queue_effect(&self, id: EffectId) {
        let queued = {
            let mut pending = self.inner.pending.lock();
            if pending.queued.insert(id) {
                pending.order.push_back(id);
                true
            } else {
                false
            }
        };
        if queued {
            self.wake();
        }
    }

    fn notify(&self, observer: Observer) {
        match observer {
            Observer::Component(id) => self.mark_dirty(id),
            Observer::Effect(id) => self.queue_effect(id),
        }
    }

    fn wake(&self) {
        let waker = self.inner.waker.read().clone();
        if let Some(waker) = waker {
            waker();
        }
    }

    fn downgrade(&self) -> Weak<RuntimeInner> {
        Arc::downgrade(&self.inner)
    }

    fn from_weak(weak: &Weak<RuntimeInner>) -> Option<Runtime> {
        weak.upgrade().map(|inner| Runtime { inner })
    }
}

/// Reactive cell. Reads inside a render or effect subscribe the reader.
pub struct Signal<T> {
    inner: Arc<SignalInner<T>>,
}

struct SignalInner<T> {
    value: RwLock<T>,
    subscribers: Mutex<HashSet<Observer>>,
    runtime: Weak<RuntimeInner>,
}

impl<T> Clone for Signal<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Signal").field(&*self.inner.value.read()).finish()
    }
}

impl<T: Send + Sync + 'static> Signal<T> {
    pub fn new(runtime: &Runtime, value: T) -> Self {
        Self {
            inner: Arc::new(SignalInner {
                value: RwLock::new(value),
                subscribers: Mutex::new(HashSet::new()),
                runtime: runtime.downgrade(),
            }),
        }
    }

    pub fn get(&self) -> T
    where
        T: Clone,
    {
        self.subscribe_current();
        self.inner.value.read().clone()
    }

    pub fn get_untracked(&self) -> T
    where
        T: Clone,
    {
        self.inner.value.read().clone()
    }

    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        self.subscribe_current();
        f(&self.inner.value.read())
    }

    pub fn set(&self, value: T) {
        *self.inner.value.write() = value;
        self.notify();
    }

    pub fn update(&self, f: impl FnOnce(&mut T)) {
        f(&mut self.inner.value.write());
        self.notify();
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().len()
    }

    fn subscribe_current(&self) {
        let Some(runtime) = Runtime::from_weak(&self.inner.runtime) else {
            return;
        };
        if let Some(observer) = runtime.current_observer() {
            self.inner.subscribers.lock().insert(observer);
        }
    }

    fn notify(&self) {
        let Some(runtime) = Runtime::from_weak(&self.inner.runtime) else {
            return;
        };
        let observers: Vec<Observer> = {
            let mut subscribers = self.inner.subscribers.lock();
            subscribers.retain(|observer| runtime.is_live(*observer));
            subscribers.iter().copied().collect()
        };
        for observer in observers {
            runtime.notify(observer);
        }
    }
}

/// Ownership node for effects, cleanups and child scopes.
#[derive(Clone)]
pub struct Scope {
    inner: Arc<ScopeInner>,
}

struct ScopeInner {
    runtime: Runtime,
    parent: Option<Weak<ScopeInner>>,
    disposed: AtomicBool,
    state: Mutex<ScopeState>,
}

#[derive(Default)]
struct ScopeState {
    children: Vec<Scope>,
    effects: Vec<EffectId>,
    cleanups: Vec<Box<dyn FnOnce() + Send>>,
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Scope")
            .field("children", &state.children.len())
            .field("effects", &state.effects.len())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

impl Scope {
    fn new(runtime: Runtime, parent: Option<Weak<ScopeInner>>) -> Self {
        Self {
            inner: Arc::new(ScopeInner {
                runtime,
                parent,
                disposed: AtomicBool::new(false),
                state: Mutex::new(ScopeState::default()),
            }),
        }
    }

    pub fn runtime(&self) -> &Runtime {
        &self.inner.runtime
    }

    pub fn child(&self) -> Scope {
        let child = Scope::new(self.inner.runtime.clone(), Some(Arc::downgrade(&self.inner)));
        if self.is_disposed() {
            child.inner.disposed.store(true, Ordering::Release);
            return child;
        }
        self.inner.state.lock().children.push(child.clone());
        child
    }

    pub fn signal<T: Send + Sync + 'static>(&self, value: T) -> Signal<T> {
        Signal::new(&self.inner.runtime, value)
    }

    /// Registers an effect owned by this scope and queues its first run.
    pub fn effect(&self, f: impl FnMut() + Send + 'static) -> Option<EffectId> {
        if self.is_disposed() {
            return None;
        }
        let id = self.inner.runtime.register_effect(Box::new(f));
        self.inner.state.lock().effects.push(id);
        Some(id)
    }

    pub fn on_cleanup(&self, f: impl FnOnce() + Send + 'static) {
        if self.is_disposed() {
            f();
            return;
        }
        self.inner.state.lock().cleanups.push(Box::new(f));
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    pub fn child_count(&self) -> usize {
        self.inner.state.lock().children.len()
    }

    /// Disposes children (newest first), then this scope's effects and cleanups.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let state = std::mem::take(&mut *self.inner.state.lock());
        for child in state.children.iter().rev() {
            child.dispose();
        }
        for effect in state.effects {
            self.inner.runtime.unregister_effect(effect);
        }
        for cleanup in state.cleanups.into_iter().rev() {
            cleanup();
        }
        if let Some(parent) = self.inner.parent.as_ref().and_then(Weak::upgrade) {
            parent
                .state
                .lock()
                .children
                .retain(|child| !Arc::ptr_eq(&child.inner, &self.inner));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test_timeout::timeout]
    fn component_reads_subscribe_and_writes_mark_dirty() {
        let runtime = Runtime::new();
        let id = runtime.register_component();
        let count = Signal::new(&runtime, 1);

        let seen = runtime.track(Observer::Component(id), || count.get());
        assert_eq!(seen, 1);
        assert!(!runtime.has_dirty());

        count.set(2);
        assert_eq!(runtime.take_dirty(), vec![id]);
        assert!(!runtime.has_dirty());
    }

    #[test_timeout::timeout]
    fn untracked_reads_do_not_subscribe() {
        let runtime = Runtime::new();
        let id = runtime.register_component();
        let count = Signal::new(&runtime, 1);
        runtime.track(Observer::Component(id), || count.get_untracked());
        count.set(3);
        assert!(!runtime.has_dirty());
    }

    #[test_timeout::timeout]
    fn unregistered_components_are_never_marked() {
        let runtime = Runtime::new();
        let id = runtime.register_component();
        let count = Signal::new(&runtime, 0);
        runtime.track(Observer::Component(id), || count.get());
        runtime.unregister_component(id);
        count.set(1);
        assert!(!runtime.has_dirty());
        assert_eq!(count.subscriber_count(), 0);
    }

    #[test_timeout::timeout]
    fn effects_rerun_when_dependencies_change() {
        let runtime = Runtime::new();
        let scope = runtime.root_scope();
        let source = scope.signal(1);
        let runs = Arc::new(AtomicUsize::new(0));

        let observed = source.clone();
        let counter = Arc::clone(&runs);
        scope.effect(move || {
            observed.get();
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(runtime.has_pending_effects());
        while runtime.run_next_effect() {}
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        source.set(2);
        assert_eq!(runtime.pending_effect_count(), 1);
        while runtime.run_next_effect() {}
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test_timeout::timeout]
    fn dispose_runs_children_first_and_unregisters_effects() {
        let runtime = Runtime::new();
        let root = runtime.root_scope();
        let child = root.child();
        let grandchild = child.child();
        let order = Arc::new(Mutex::new(Vec::new()));

        for (scope, name) in [(&root, "root"), (&child, "child"), (&grandchild, "grandchild")] {
            let order = Arc::clone(&order);
            scope.on_cleanup(move || order.lock().push(name));
        }
        child.effect(|| {});
        assert!(runtime.has_pending_effects());

        root.dispose();
        assert_eq!(*order.lock(), vec!["grandchild", "child", "root"]);
        assert!(!runtime.has_pending_effects());
        assert!(grandchild.is_disposed());
        assert!(root.child().is_disposed());
    }

    #[test_timeout::timeout]
    fn disposing_a_child_detaches_it_from_its_parent() {
        let runtime = Runtime::new();
        let root = runtime.root_scope();
        let child = root.child();
        assert_eq!(root.child_count(), 1);
        child.dispose();
        assert_eq!(root.child_count(), 0);
        assert!(!root.is_disposed());
    }

    #[test_timeout::timeout]
    fn waker_fires_on_scheduled_work() {
        let runtime = Runtime::new();
        let wakes = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&wakes);
        runtime.set_waker(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let id = runtime.register_component();
        runtime.mark_dirty(id);
        runtime.mark_dirty(id);
        assert_eq!(wakes.load(Ordering::SeqCst), 1);
    }
}
