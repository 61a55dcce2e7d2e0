//! Service registry: which connected peers advertise which services.
//!
//! Providers are keyed by their connection id, which increases with connection
//! order, so iteration within a service always visits the earliest-connected
//! provider first. A service whose provider set becomes empty is dropped.

use std::collections::{BTreeMap, HashMap};

#[derive(Debug)]
pub struct ServiceRegistry<P> {
    services: HashMap<String, BTreeMap<u64, P>>,
}

impl<P> Default for ServiceRegistry<P> {
    fn default() -> Self {
        Self {
            services: HashMap::new(),
        }
    }
}

impl<P: Clone> ServiceRegistry<P> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `provider` under every name in `services`.
    pub fn add<'a>(&mut self, id: u64, provider: P, services: impl IntoIterator<Item = &'a String>) {
        for service in services {
            self.services
                .entry(service.clone())
                .or_default()
                .insert(id, provider.clone());
        }
    }

    /// Forget provider `id` everywhere, pruning services left without providers.
    pub fn remove(&mut self, id: u64) {
        self.services.retain(|_, providers| {
            providers.remove(&id);
            !providers.is_empty()
        });
    }

    /// Providers of any of `services`, each listed once, in request order.
    pub fn providers_for(&self, services: &[String]) -> Vec<(u64, P)> {
        let mut seen = Vec::new();
        let mut out = Vec::new();
        for service in services {
            if let Some(providers) = self.services.get(service) {
                for (id, provider) in providers {
                    if !seen.contains(id) {
                        seen.push(*id);
                        out.push((*id, provider.clone()));
                    }
                }
            }
        }
        out
    }

    /// First match: the earliest provider of the first listed service that has any.
    pub fn first_for(&self, services: &[String]) -> Option<P> {
        services
            .iter()
            .filter_map(|s| self.services.get(s))
            .find_map(|providers| providers.values().next().cloned())
    }
}
