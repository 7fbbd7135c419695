//! Service registry.
//!
//! Maps registry ids to services and enforces that an id is only ever used
//! with one [`ServiceKind`].

use crate::error::{Result, TokkiError};
use crate::kind::ServiceKind;
use crate::service::Service;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

/// Registry id → service.
#[derive(Debug, Default)]
pub struct ServiceRegistry {
    services: Mutex<HashMap<String, Arc<Service>>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the service registered under `id`, or build and insert one.
    ///
    /// Fails when `id` is taken by a service of another kind. `build` only runs
    /// for unseen ids, under the registry lock, and nothing is inserted when it
    /// fails.
    pub(crate) fn get_or_insert_with(
        &self,
        id: &str,
        kind: ServiceKind,
        build: impl FnOnce() -> Result<Service>,
    ) -> Result<Arc<Service>> {
        let mut services = self.services.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(existing) = services.get(id) {
            if existing.kind() != kind {
                return Err(TokkiError::ServiceConflict {
                    queue: existing.name().to_string(),
                    existing: existing.kind(),
                    requested: kind,
                });
            }
            return Ok(existing.clone());
        }

        let service = Arc::new(build()?);
        services.insert(id.to_string(), service.clone());
        Ok(service)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Service>> {
        self.services
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// Snapshot of all registered services.
    pub fn all(&self) -> Vec<Arc<Service>> {
        self.services
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.services
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Validate a queue name.
pub(crate) fn check_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(TokkiError::InvalidQueueName);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Session;
    use crate::shutdown::ShutdownCoordinator;
    use crate::transport::{MockChannel, MockConnection};

    fn service(id: &str, kind: ServiceKind) -> Service {
        let session = Arc::new(Session::new(
            Arc::new(MockConnection::new()),
            Arc::new(MockChannel::new()),
        ));
        Service::new(
            id.to_string(),
            id.to_string(),
            kind,
            None,
            session,
            Arc::new(ShutdownCoordinator::new()),
            None,
        )
    }

    #[test]
    fn test_same_kind_returns_same_service() {
        let registry = ServiceRegistry::new();

        let first = registry
            .get_or_insert_with("jobs", ServiceKind::Worker, || {
                Ok(service("jobs", ServiceKind::Worker))
            })
            .unwrap();
        let second = registry
            .get_or_insert_with("jobs", ServiceKind::Worker, || panic!("must not build twice"))
            .unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_conflicting_kind_is_rejected() {
        let registry = ServiceRegistry::new();
        registry
            .get_or_insert_with("jobs", ServiceKind::Worker, || {
                Ok(service("jobs", ServiceKind::Worker))
            })
            .unwrap();

        let err = registry
            .get_or_insert_with("jobs", ServiceKind::Publisher, || {
                Ok(service("jobs", ServiceKind::Publisher))
            })
            .unwrap_err();

        assert!(matches!(
            err,
            TokkiError::ServiceConflict {
                existing: ServiceKind::Worker,
                requested: ServiceKind::Publisher,
                ..
            }
        ));
        assert!(err.to_string().contains("worker"));
        assert!(err.to_string().contains("publisher"));
    }

    #[test]
    fn test_failed_build_inserts_nothing() {
        let registry = ServiceRegistry::new();

        let err = registry
            .get_or_insert_with("jobs", ServiceKind::Worker, || Err(TokkiError::Closed))
            .unwrap_err();

        assert!(matches!(err, TokkiError::Closed));
        assert!(registry.is_empty());
        assert!(registry.get("jobs").is_none());
    }

    #[test]
    fn test_check_name() {
        assert!(check_name("jobs").is_ok());
        assert!(matches!(check_name(""), Err(TokkiError::InvalidQueueName)));
        assert!(matches!(check_name("  \t"), Err(TokkiError::InvalidQueueName)));
    }

    #[test]
    fn test_snapshot() {
        let registry = ServiceRegistry::new();
        assert!(registry.is_empty());
        for id in ["a", "b"] {
            registry
                .get_or_insert_with(id, ServiceKind::Publisher, || {
                    Ok(service(id, ServiceKind::Publisher))
                })
                .unwrap();
        }
        assert_eq!(registry.all().len(), 2);
        assert!(registry.get("a").is_some());
        assert!(registry.get("c").is_none());
    }
}
