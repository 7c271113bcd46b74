//! Named modules exposing client-handler callbacks.
//!
//! A resource rewrite can bind a `(module, handler)` pair to a client; the
//! dispatcher resolves the pair here and hands the client over. Modules
//! also carry optional management-link metadata for the admin surface.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use dashmap::DashMap;

use crate::client::Client;
use crate::context::ServerContext;

/// Future returned by a client handler; the handler owns the client.
pub type HandlerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// A client-handler callback.
pub type ClientHandler = Arc<dyn Fn(Arc<ServerContext>, Client) -> HandlerFuture + Send + Sync>;

/// Link shown in the admin UI for a module.
#[derive(Debug, Clone)]
pub struct ManagementLink {
    pub title: String,
    pub url: String,
}

/// One named module.
pub struct Module {
    name: String,
    handlers: HashMap<String, ClientHandler>,
    management_link: Option<ManagementLink>,
}

impl Module {
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            handlers: HashMap::new(),
            management_link: None,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registers a handler under a name.
    #[must_use]
    pub fn with_handler(mut self, name: &str, handler: ClientHandler) -> Self {
        self.handlers.insert(name.to_string(), handler);
        self
    }

    #[must_use]
    pub fn with_management_link(mut self, title: &str, url: &str) -> Self {
        self.management_link = Some(ManagementLink {
            title: title.to_string(),
            url: url.to_string(),
        });
        self
    }

    #[must_use]
    pub fn handler(&self, name: &str) -> Option<ClientHandler> {
        self.handlers.get(name).cloned()
    }

    #[must_use]
    pub fn management_link(&self) -> Option<&ManagementLink> {
        self.management_link.as_ref()
    }
}

/// The keyed module set.
#[derive(Default)]
pub struct ModuleContainer {
    modules: DashMap<String, Arc<Module>>,
}

impl ModuleContainer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a module under its name.
    pub fn register(&self, module: Module) {
        self.modules
            .insert(module.name().to_string(), Arc::new(module));
    }

    pub fn remove(&self, name: &str) {
        self.modules.remove(name);
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<Module>> {
        self.modules.get(name).map(|m| Arc::clone(m.value()))
    }

    /// Resolves a `(module, handler)` binding.
    #[must_use]
    pub fn resolve(&self, module: &str, handler: &str) -> Option<ClientHandler> {
        self.get(module)?.handler(handler)
    }

    /// Management links of every module that exposes one.
    #[must_use]
    pub fn management_links(&self) -> Vec<ManagementLink> {
        self.modules
            .iter()
            .filter_map(|m| m.management_link().cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_handler() -> ClientHandler {
        Arc::new(|_ctx, _client| Box::pin(async {}))
    }

    #[test]
    fn resolves_registered_handlers() {
        let container = ModuleContainer::new();
        container.register(
            Module::new("files")
                .with_handler("send", noop_handler())
                .with_management_link("Files", "/admin/files"),
        );
        assert!(container.resolve("files", "send").is_some());
        assert!(container.resolve("files", "missing").is_none());
        assert!(container.resolve("missing", "send").is_none());
    }

    #[test]
    fn register_replaces_by_name() {
        let container = ModuleContainer::new();
        container.register(Module::new("m"));
        container.register(Module::new("m").with_handler("h", noop_handler()));
        assert!(container.resolve("m", "h").is_some());
        container.remove("m");
        assert!(container.get("m").is_none());
    }

    #[test]
    fn management_links_are_collected() {
        let container = ModuleContainer::new();
        container.register(Module::new("a").with_management_link("A", "/admin/a"));
        container.register(Module::new("b"));
        let links = container.management_links();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].url, "/admin/a");
    }
}
