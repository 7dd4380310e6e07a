//! Service factories.
//!
//! Services are created lazily: the first OpenSession entry naming a fresh
//! service instantiates it through the factory registered for its type. An
//! OpenSession for an unregistered type fails with an unknown-service error
//! without halting apply.

use crate::service::Service;
use std::collections::HashMap;

type ServiceFactory = Box<dyn Fn() -> Box<dyn Service> + Send + Sync>;

/// Factories keyed by service type.
#[derive(Default)]
pub struct ServiceRegistry {
    factories: HashMap<String, ServiceFactory>,
}

impl ServiceRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory for a service type, replacing any previous one.
    pub fn register<F, S>(&mut self, service_type: impl Into<String>, factory: F)
    where
        F: Fn() -> S + Send + Sync + 'static,
        S: Service + 'static,
    {
        self.factories.insert(
            service_type.into(),
            Box::new(move || Box::new(factory()) as Box<dyn Service>),
        );
    }

    /// Whether a factory exists for the type.
    pub fn contains(&self, service_type: &str) -> bool {
        self.factories.contains_key(service_type)
    }

    /// Instantiate a service of the given type.
    pub fn create(&self, service_type: &str) -> Option<Box<dyn Service>> {
        self.factories.get(service_type).map(|f| f())
    }

    /// Registered type names.
    pub fn types(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("types", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}
