use async_trait::async_trait;
use pml_core::lockfile::{IntegrityCheck, Lockfile};
use pml_core::model::{BackendFqdn, BackendType};
use pml_core::routing::{RouteTarget, RoutingResolver, RoutingSnapshot, RoutingSource, RoutingSourceError};
use pml_core::ToolId;

struct OneShotSource {
    snapshot: RoutingSnapshot,
}

#[async_trait]
impl RoutingSource for OneShotSource {
    async fn fetch(&self, _known_version: &str) -> Result<Option<RoutingSnapshot>, RoutingSourceError> {
        Ok(Some(self.snapshot.clone()))
    }
}

#[tokio::test]
async fn routing_table_refresh_persists_and_survives_reinit() {
    let dir = tempfile::tempdir().unwrap();
    let cache_path = dir.path().join("routing-cache.json");

    let resolver = RoutingResolver::init(Some(cache_path.clone()));
    assert_eq!(resolver.resolve(&ToolId::parse("weather:forecast").unwrap()).unwrap(), RouteTarget::Local);

    let source = OneShotSource {
        snapshot: RoutingSnapshot { version: "v7".to_string(), cloud_namespaces: vec!["weather".to_string()] },
    };
    resolver.refresh(&source).await;
    assert_eq!(resolver.resolve(&ToolId::parse("weather:forecast").unwrap()).unwrap(), RouteTarget::Cloud);

    // A freshly-initialized resolver picks up the persisted cache without
    // ever talking to a source, simulating a gateway restart.
    let reloaded = RoutingResolver::init(Some(cache_path));
    assert_eq!(reloaded.current_version(), "v7");
    assert_eq!(reloaded.resolve(&ToolId::parse("weather:forecast").unwrap()).unwrap(), RouteTarget::Cloud);
    assert_eq!(reloaded.resolve(&ToolId::parse("fs:read").unwrap()).unwrap(), RouteTarget::Local);
}

#[test]
fn lockfile_flags_integrity_change_and_requires_explicit_approval() {
    let dir = tempfile::tempdir().unwrap();
    let mut lock = Lockfile::load(dir.path().join("mcp.lock")).unwrap();
    let fqdn = BackendFqdn::new("acme.default.weather.forecast");

    let now = chrono::Utc::now();
    let first = lock.check_and_record(&fqdn, "hash-v1", BackendType::Subprocess, now);
    assert_eq!(first, IntegrityCheck::FirstSeen);
    assert!(lock.is_approved(&fqdn));

    let second = lock.check_and_record(&fqdn, "hash-v2", BackendType::Subprocess, now);
    assert_eq!(second, IntegrityCheck::Changed { previous_integrity: "hash-v1".to_string() });
    assert!(!lock.is_approved(&fqdn), "a changed hash must not be trusted until approved");

    lock.approve(&fqdn);
    assert!(lock.is_approved(&fqdn));

    lock.save().unwrap();
    let reloaded = Lockfile::load(dir.path().join("mcp.lock")).unwrap();
    assert!(reloaded.is_approved(&fqdn));
}
