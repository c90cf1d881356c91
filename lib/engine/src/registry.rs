//! Component and trigger registry.
//!
//! Built once at process start and shared by reference with the worker,
//! executor and trigger runtime.

use crate::builtin;
use crate::component::{Component, Trigger};
use std::collections::HashMap;
use std::sync::Arc;

/// Implementations looked up by name.
#[derive(Default, Clone)]
pub struct Registry {
    components: HashMap<String, Arc<dyn Component>>,
    triggers: HashMap<String, Arc<dyn Trigger>>,
}

impl Registry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry holding the built-in components and triggers.
    #[must_use]
    pub fn with_builtins() -> Self {
        Self::new()
            .with_component(builtin::Noop)
            .with_component(builtin::If)
            .with_component(builtin::FilterComponent)
            .with_component(builtin::Approval)
            .with_trigger(builtin::WebhookTrigger)
            .with_trigger(builtin::ManualTrigger)
    }

    /// Registers a component under its name, replacing any previous one.
    #[must_use]
    pub fn with_component(mut self, component: impl Component + 'static) -> Self {
        self.register_component(Arc::new(component));
        self
    }

    /// Registers a trigger under its name, replacing any previous one.
    #[must_use]
    pub fn with_trigger(mut self, trigger: impl Trigger + 'static) -> Self {
        self.register_trigger(Arc::new(trigger));
        self
    }

    /// Registers a shared component.
    pub fn register_component(&mut self, component: Arc<dyn Component>) {
        self.components
            .insert(component.name().to_string(), component);
    }

    /// Registers a shared trigger.
    pub fn register_trigger(&mut self, trigger: Arc<dyn Trigger>) {
        self.triggers.insert(trigger.name().to_string(), trigger);
    }

    /// Looks up a component.
    #[must_use]
    pub fn component(&self, name: &str) -> Option<Arc<dyn Component>> {
        self.components.get(name).cloned()
    }

    /// Looks up a trigger.
    #[must_use]
    pub fn trigger(&self, name: &str) -> Option<Arc<dyn Trigger>> {
        self.triggers.get(name).cloned()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut components: Vec<_> = self.components.keys().collect();
        components.sort();
        let mut triggers: Vec<_> = self.triggers.keys().collect();
        triggers.sort();
        f.debug_struct("Registry")
            .field("components", &components)
            .field("triggers", &triggers)
            .finish()
    }
}
