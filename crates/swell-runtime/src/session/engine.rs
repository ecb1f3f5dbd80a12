use std::collections::HashMap;

use metrics::counter;
use swell_core::{Patch, WireNode};
use tracing::debug;

use crate::component::{Component, HookSlots, RenderCx};
use crate::handler::{EventFn, EventKind, HandlerRegistry};
use crate::reactive::{ComponentId, Observer, Runtime, Scope};
use crate::storm::{StormBudgetTracker, StormPolicy};
use crate::tree::{self, assign_hids, copy_hids, diff, HidGenerator, VNode};

const ROOT_TYPE: &str = "root";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RenderMode {
    /// First render of a new instance. No patches.
    Mount,
    /// Re-render of a dirty instance, diffed against its last tree.
    Update,
    /// Re-render with fresh ids after a resume. No patches.
    Rehydrate,
}

struct ComponentInstance {
    type_key: &'static str,
    key: Option<String>,
    scope: Scope,
    component: Box<dyn Component>,
    hooks: HookSlots,
    tree: Option<VNode>,
    children: Vec<ComponentId>,
}

/// The component instance tree of one session plus everything derived from
/// it. Only the event loop (and resume, under the stream lock) mutates it.
pub(crate) struct Engine {
    runtime: Runtime,
    root_scope: Scope,
    instances: HashMap<ComponentId, ComponentInstance>,
    root: Option<ComponentId>,
    handlers: HandlerRegistry,
    hids: HidGenerator,
    path: String,
}

impl Engine {
    pub(crate) fn new(runtime: Runtime) -> Self {
        let root_scope = runtime.root_scope();
        Self {
            runtime,
            root_scope,
            instances: HashMap::new(),
            root: None,
            handlers: HandlerRegistry::default(),
            hids: HidGenerator::new(),
            path: "/".to_string(),
        }
    }

    pub(crate) fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub(crate) fn path(&self) -> &str {
        &self.path
    }

    pub(crate) fn instance_count(&self) -> usize {
        self.instances.len()
    }

    pub(crate) fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    pub(crate) fn lookup(&self, hid: &str, kind: &EventKind) -> Option<Vec<EventFn>> {
        self.handlers.lookup(hid, kind)
    }

    /// Replaces whatever is mounted with a fresh instance of `component`.
    pub(crate) fn mount_root(&mut self, component: Box<dyn Component>, path: &str) {
        if let Some(previous) = self.root.take() {
            self.dispose_instance(previous);
        }
        self.path = path.to_string();
        let scope = self.root_scope.clone();
        let id = self.create_instance(&scope, component, ROOT_TYPE, None);
        self.root = Some(id);
        self.render_instance(id, RenderMode::Mount, &mut Vec::new());
    }

    /// Mounts a new root and emits the patch that swaps it in on the client.
    pub(crate) fn replace_root(&mut self, component: Box<dyn Component>, path: &str, out: &mut Vec<Patch>) {
        let old_hid = self.root_tree().and_then(|tree| tree.hid().map(str::to_string));
        self.mount_root(component, path);
        if let (Some(hid), Some(wire)) = (old_hid, self.root_wire()) {
            out.push(Patch::replace_node(hid, wire));
        }
    }

    /// Takes over a tree prerendered for another route. Its instances, state
    /// and handlers become the live ones and the current tree is disposed.
    pub(crate) fn adopt(&mut self, prerendered: Engine, out: &mut Vec<Patch>) {
        let old_hid = self.root_tree().and_then(|tree| tree.hid().map(str::to_string));
        drop(std::mem::replace(self, prerendered));
        if let (Some(hid), Some(wire)) = (old_hid, self.root_wire()) {
            out.push(Patch::replace_node(hid, wire));
        }
    }

    /// Re-renders every instance, parents before children, with the id
    /// generator reset so ids match a fresh render of the same state.
    pub(crate) fn rebuild(&mut self) {
        self.hids.reset();
        if let Some(root) = self.root {
            self.render_instance(root, RenderMode::Rehydrate, &mut Vec::new());
        }
    }

    pub(crate) fn render_dirty(&mut self, out: &mut Vec<Patch>) -> usize {
        let mut rendered = 0;
        for id in self.runtime.take_dirty() {
            if self.instances.contains_key(&id) {
                self.render_instance(id, RenderMode::Update, out);
                rendered += 1;
            }
        }
        rendered
    }

    pub(crate) fn run_effects(&mut self, storm: &StormBudgetTracker) -> usize {
        let mut ran = 0;
        while self.runtime.has_pending_effects() {
            if !storm.allow_effect() {
                if storm.policy() == StormPolicy::Throttle {
                    let dropped = self.runtime.discard_pending_effects();
                    counter!("swell_effects_dropped_total", dropped as u64);
                    debug!(dropped, "per-tick effect cap reached");
                }
                break;
            }
            if !self.runtime.run_next_effect() {
                break;
            }
            ran += 1;
        }
        ran
    }

    pub(crate) fn root_tree(&self) -> Option<&VNode> {
        self.root
            .and_then(|id| self.instances.get(&id))
            .and_then(|instance| instance.tree.as_ref())
    }

    pub(crate) fn root_wire(&self) -> Option<WireNode> {
        self.root.and_then(|id| self.instance_wire(id))
    }

    pub(crate) fn render_html(&self) -> String {
        self.root_wire()
            .map(|wire| tree::render_html(&wire))
            .unwrap_or_default()
    }

    /// Rough resident size used for memory-pressure eviction.
    pub(crate) fn estimated_bytes(&self) -> usize {
        const PER_INSTANCE: usize = 512;
        const PER_HANDLER: usize = 96;
        self.instances.len() * PER_INSTANCE
            + self.handlers.len() * PER_HANDLER
            + self
                .instances
                .values()
                .map(|instance| instance.hooks.len() * 64)
                .sum::<usize>()
    }

    pub(crate) fn dispose(&mut self) {
        if let Some(root) = self.root.take() {
            self.dispose_instance(root);
        }
        self.root_scope.dispose();
        self.handlers.clear();
        self.instances.clear();
    }

    fn instance_wire(&self, id: ComponentId) -> Option<WireNode> {
        let tree = self.instances.get(&id)?.tree.as_ref()?;
        Some(self.expand(tree))
    }

    fn expand(&self, node: &VNode) -> WireNode {
        tree::to_wire(node, &|child| self.instance_wire(child))
    }

    fn create_instance(
        &mut self,
        parent_scope: &Scope,
        component: Box<dyn Component>,
        type_key: &'static str,
        key: Option<String>,
    ) -> ComponentId {
        let id = self.runtime.register_component();
        self.instances.insert(
            id,
            ComponentInstance {
                type_key,
                key,
                scope: parent_scope.child(),
                component,
                hooks: HookSlots::default(),
                tree: None,
                children: Vec::new(),
            },
        );
        id
    }

    fn render_instance(&mut self, id: ComponentId, mode: RenderMode, out: &mut Vec<Patch>) {
        let Some(mut instance) = self.instances.remove(&id) else {
            return;
        };

        let mut next = {
            let mut cx = RenderCx::new(&instance.scope, &mut instance.hooks, &self.path);
            let component = &instance.component;
            self.runtime
                .track(Observer::Component(id), || component.render(&mut cx))
        };
        if mode == RenderMode::Update {
            if let Some(previous) = instance.tree.as_ref() {
                copy_hids(previous, &mut next);
            }
        }
        assign_hids(&mut next, &mut self.hids);

        let previous_children = std::mem::take(&mut instance.children);
        let mut children = Vec::new();
        let mut pending = Vec::new();
        for marker in next.markers_mut() {
            let reused = previous_children.iter().copied().find(|child| {
                !children.contains(child)
                    && self.instances.get(child).is_some_and(|existing| {
                        existing.type_key == marker.type_key && existing.key == marker.key
                    })
            });
            let child = match reused {
                Some(child) => {
                    if mode == RenderMode::Rehydrate {
                        pending.push((child, RenderMode::Rehydrate));
                    }
                    child
                }
                None => {
                    let child = self.create_instance(
                        &instance.scope,
                        marker.instantiate(),
                        marker.type_key,
                        marker.key.clone(),
                    );
                    pending.push((child, RenderMode::Mount));
                    child
                }
            };
            marker.instance = Some(child);
            children.push(child);
        }
        let dropped: Vec<ComponentId> = previous_children
            .into_iter()
            .filter(|child| !children.contains(child))
            .collect();
        instance.children = children;

        self.handlers.remove_owner(id);
        for (hid, handlers) in next.handler_sites() {
            for (kind, handler) in handlers {
                self.handlers.register(id, hid, kind.clone(), handler.clone());
            }
        }

        let previous_tree = instance.tree.replace(next);
        self.instances.insert(id, instance);

        for child in dropped {
            self.dispose_instance(child);
        }
        for (child, child_mode) in pending {
            self.render_instance(child, child_mode, out);
        }

        if mode == RenderMode::Update {
            if let (Some(old), Some(current)) = (
                previous_tree.as_ref(),
                self.instances.get(&id).and_then(|instance| instance.tree.as_ref()),
            ) {
                diff(old, current, &|node| self.expand(node), out);
            }
        }
    }

    fn dispose_instance(&mut self, id: ComponentId) {
        let Some(instance) = self.instances.remove(&id) else {
            return;
        };
        for child in instance.children.iter().rev() {
            self.dispose_instance(*child);
        }
        self.handlers.remove_owner(id);
        self.runtime.unregister_component(id);
        instance.scope.dispose();
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Mounts `component` on a runtime of its own. Effects queued by the first
/// render stay pending until the engine is adopted by a session.
pub(crate) fn prerender(component: Box<dyn Component>, path: &str) -> Engine {
    let mut engine = Engine::new(Runtime::new());
    engine.mount_root(component, path);
    engine
}
