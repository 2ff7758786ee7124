//! Resolution through the public facade
//!
//! Read-your-write, closest-wins, context filtering, expiry, wildcards,
//! meta and the mutation-time inheritance guards.

use chrono::{Duration, Utc};
use permsync_api::{
    ContextSet, InheritanceEdge, Node, PermsError, SubjectDiff, SubjectId, Tristate,
};
use permsync_engine::{
    EngineConfig, GraphDiagnostic, InMemoryStorage, NoopMessenger, PermissionEngine,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

async fn engine() -> PermissionEngine {
    PermissionEngine::start(
        EngineConfig::default(),
        Arc::new(InMemoryStorage::new()),
        Arc::new(NoopMessenger),
    )
    .await
    .unwrap()
}

fn ctx(s: &str) -> ContextSet {
    s.parse().unwrap()
}

fn group(name: &str) -> SubjectId {
    SubjectId::group(name).unwrap()
}

// ============================================================================
// CORE RESOLUTION
// ============================================================================

#[tokio::test]
async fn test_default_vip_user_scenario() {
    let engine = engine().await;

    engine
        .group("default")
        .unwrap()
        .data()
        .add(Node::grant("chat.use").unwrap())
        .await
        .unwrap();

    let vip = engine.group("vip").unwrap();
    vip.data()
        .add(Node::builder("fly.use").context(ctx("world=creative")).build().unwrap())
        .await
        .unwrap();
    vip.data()
        .add_parent(InheritanceEdge::new(group("default")))
        .await
        .unwrap();

    let user = engine.user(Uuid::new_v4());
    user.data()
        .add_parent(InheritanceEdge::new(group("vip")))
        .await
        .unwrap();

    let creative = user.resolve(&ctx("world=creative")).await.unwrap();
    assert_eq!(
        creative.permissions,
        BTreeMap::from([("chat.use".to_string(), true), ("fly.use".to_string(), true)])
    );

    let survival = user.resolve(&ctx("world=survival")).await.unwrap();
    assert_eq!(
        survival.permissions,
        BTreeMap::from([("chat.use".to_string(), true)])
    );
}

#[tokio::test]
async fn test_read_your_write() {
    let engine = engine().await;
    let user = engine.user(Uuid::new_v4());
    let global = ContextSet::new();

    assert_eq!(user.check("kit.daily", &global).await.unwrap(), Tristate::Undefined);

    user.data().add(Node::grant("kit.daily").unwrap()).await.unwrap();
    assert_eq!(user.check("kit.daily", &global).await.unwrap(), Tristate::True);

    user.data().remove(Node::grant("kit.daily").unwrap()).await.unwrap();
    assert_eq!(user.check("kit.daily", &global).await.unwrap(), Tristate::Undefined);
}

#[tokio::test]
async fn test_group_change_reaches_cached_members() {
    let engine = engine().await;
    let user = engine.user(Uuid::new_v4());
    user.data()
        .add_parent(InheritanceEdge::new(group("builder")))
        .await
        .unwrap();

    let global = ContextSet::new();
    assert_eq!(user.check("worldedit.use", &global).await.unwrap(), Tristate::Undefined);

    engine
        .group("builder")
        .unwrap()
        .data()
        .add(Node::grant("worldedit.use").unwrap())
        .await
        .unwrap();
    assert_eq!(user.check("worldedit.use", &global).await.unwrap(), Tristate::True);
}

#[tokio::test]
async fn test_unloaded_group_does_not_strand_members() {
    let engine = engine().await;
    let global = ContextSet::new();
    let user = engine.user(Uuid::new_v4());
    user.data()
        .add_parent(InheritanceEdge::new(group("mid")))
        .await
        .unwrap();
    let mid = engine.group("mid").unwrap();
    mid.data()
        .add_parent(InheritanceEdge::new(group("top")))
        .await
        .unwrap();
    assert_eq!(user.check("build", &global).await.unwrap(), Tristate::Undefined);

    mid.unload();
    engine
        .group("top")
        .unwrap()
        .data()
        .add(Node::grant("build").unwrap())
        .await
        .unwrap();
    assert_eq!(user.check("build", &global).await.unwrap(), Tristate::True);

    // reloading mid restores the index path for later changes
    engine
        .group("top")
        .unwrap()
        .data()
        .add(Node::grant("fly").unwrap())
        .await
        .unwrap();
    assert_eq!(user.check("fly", &global).await.unwrap(), Tristate::True);
}

#[tokio::test]
async fn test_closest_definition_wins() {
    let engine = engine().await;
    let global = ContextSet::new();

    engine
        .group("default")
        .unwrap()
        .data()
        .add(Node::grant("build").unwrap())
        .await
        .unwrap();
    let guest = engine.group("guest").unwrap();
    guest
        .data()
        .apply(
            SubjectDiff::new()
                .add(Node::deny("build").unwrap())
                .add_parent(InheritanceEdge::new(group("default"))),
        )
        .await
        .unwrap();

    let resolution = guest.resolve(&global).await.unwrap();
    assert_eq!(resolution.get("build"), Some(false));
    assert_eq!(resolution.sources["build"], group("guest"));

    // removing the closer deny exposes the farther grant
    guest.data().remove(Node::deny("build").unwrap()).await.unwrap();
    assert_eq!(guest.check("build", &global).await.unwrap(), Tristate::True);
}

#[tokio::test]
async fn test_parent_priority_orders_ancestors() {
    let engine = engine().await;
    engine
        .group("low")
        .unwrap()
        .data()
        .add(Node::deny("fly").unwrap())
        .await
        .unwrap();
    engine
        .group("high")
        .unwrap()
        .data()
        .add(Node::grant("fly").unwrap())
        .await
        .unwrap();

    let user = engine.user(Uuid::new_v4());
    user.data()
        .apply(
            SubjectDiff::new()
                .add_parent(InheritanceEdge::new(group("low")).with_priority(1))
                .add_parent(InheritanceEdge::new(group("high")).with_priority(10)),
        )
        .await
        .unwrap();

    assert_eq!(user.check("fly", &ContextSet::new()).await.unwrap(), Tristate::True);
}

// ============================================================================
// CONTEXT AND EXPIRY
// ============================================================================

#[tokio::test]
async fn test_contextual_parent_edge() {
    let engine = engine().await;
    engine
        .group("nether-crew")
        .unwrap()
        .data()
        .add(Node::grant("portal.use").unwrap())
        .await
        .unwrap();

    let user = engine.user(Uuid::new_v4());
    user.data()
        .add_parent(InheritanceEdge::new(group("nether-crew")).with_context(ctx("world=nether")))
        .await
        .unwrap();

    assert_eq!(
        user.check("portal.use", &ctx("world=nether")).await.unwrap(),
        Tristate::True
    );
    assert_eq!(
        user.check("portal.use", &ctx("world=overworld")).await.unwrap(),
        Tristate::Undefined
    );
}

#[tokio::test]
async fn test_expired_node_not_served_from_cache() {
    let engine = engine().await;
    let user = engine.user(Uuid::new_v4());
    let global = ContextSet::new();

    user.data()
        .add(
            Node::builder("fly.temp")
                .expiry(Utc::now() + Duration::milliseconds(300))
                .build()
                .unwrap(),
        )
        .await
        .unwrap();

    let first = user.resolve(&global).await.unwrap();
    assert_eq!(first.get("fly.temp"), Some(true));
    assert!(first.valid_until.is_some());

    tokio::time::sleep(std::time::Duration::from_millis(400)).await;
    assert_eq!(user.check("fly.temp", &global).await.unwrap(), Tristate::Undefined);

    // still stored; expiry only excludes it from evaluation
    assert_eq!(user.snapshot().await.unwrap().nodes.len(), 1);
}

// ============================================================================
// WILDCARDS AND META
// ============================================================================

#[tokio::test]
async fn test_wildcard_checks() {
    let engine = engine().await;
    let admin = engine.group("admin").unwrap();
    admin
        .data()
        .apply(
            SubjectDiff::new()
                .add(Node::grant("worldedit.*").unwrap())
                .add(Node::deny("worldedit.region.delete").unwrap()),
        )
        .await
        .unwrap();

    let global = ContextSet::new();
    assert_eq!(admin.check("worldedit.brush", &global).await.unwrap(), Tristate::True);
    assert_eq!(
        admin.check("worldedit.region.delete", &global).await.unwrap(),
        Tristate::False
    );
    assert_eq!(admin.check("essentials.home", &global).await.unwrap(), Tristate::Undefined);
}

#[tokio::test]
async fn test_meta_follows_inheritance() {
    let engine = engine().await;
    engine
        .group("default")
        .unwrap()
        .data()
        .apply(
            SubjectDiff::new()
                .add(Node::grant("weight.1").unwrap())
                .add(Node::grant("prefix.10.[Member]").unwrap())
                .add(Node::grant("meta.homes.1").unwrap()),
        )
        .await
        .unwrap();

    let user = engine.user(Uuid::new_v4());
    user.data()
        .apply(
            SubjectDiff::new()
                .add(Node::grant("meta.homes.5").unwrap())
                .add_parent(InheritanceEdge::new(group("default"))),
        )
        .await
        .unwrap();

    let meta = user.meta(&ContextSet::new()).await.unwrap();
    assert_eq!(meta.weight, Some(1));
    assert_eq!(meta.prefix.as_deref(), Some("[Member]"));
    assert_eq!(meta.meta["homes"], "5");
}

// ============================================================================
// INHERITANCE GUARDS
// ============================================================================

#[tokio::test]
async fn test_cycle_rejected_at_mutation() {
    let engine = engine().await;
    let a = engine.group("a").unwrap();
    let b = engine.group("b").unwrap();
    let c = engine.group("c").unwrap();

    a.data().add_parent(InheritanceEdge::new(group("b"))).await.unwrap();
    b.data().add_parent(InheritanceEdge::new(group("c"))).await.unwrap();

    // any context: the guard ignores edge contexts
    let result = c
        .data()
        .add_parent(InheritanceEdge::new(group("a")).with_context(ctx("server=lobby")))
        .await;
    assert!(matches!(result, Err(PermsError::InvalidMutation { .. })));

    let result = a.data().add_parent(InheritanceEdge::new(group("a"))).await;
    assert!(matches!(result, Err(PermsError::InvalidMutation { .. })));

    assert!(c.snapshot().await.unwrap().parents.is_empty());
}

#[tokio::test]
async fn test_missing_parent_is_a_diagnostic() {
    let engine = engine().await;
    let user = engine.user(Uuid::new_v4());
    user.data()
        .apply(
            SubjectDiff::new()
                .add(Node::grant("chat.use").unwrap())
                .add_parent(InheritanceEdge::new(group("ghost"))),
        )
        .await
        .unwrap();

    let resolution = user.resolve(&ContextSet::new()).await.unwrap();
    assert_eq!(resolution.get("chat.use"), Some(true));
    assert_eq!(
        resolution.diagnostics,
        vec![GraphDiagnostic::MissingParent {
            child: user.id().clone(),
            parent: group("ghost"),
        }]
    );
}

#[tokio::test]
async fn test_idempotent_mutations() {
    let engine = engine().await;
    let vip = engine.group("vip").unwrap();
    let node = Node::grant("fly.use").unwrap();

    assert!(vip.data().add(node.clone()).await.unwrap());
    assert!(!vip.data().add(node.clone()).await.unwrap());
    assert_eq!(vip.snapshot().await.unwrap().version, 1);

    assert!(vip.data().clear().await.unwrap());
    assert!(!vip.data().clear().await.unwrap());
    assert!(vip.snapshot().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_search_and_delete() {
    let engine = engine().await;
    let user = engine.user(Uuid::new_v4());
    user.data().add(Node::grant("server.stop").unwrap()).await.unwrap();
    engine
        .group("admin")
        .unwrap()
        .data()
        .add(Node::grant("server.stop").unwrap())
        .await
        .unwrap();

    let mut holders: Vec<SubjectId> = engine
        .search_permission("Server.Stop")
        .await
        .unwrap()
        .into_iter()
        .map(|(id, _)| id)
        .collect();
    holders.sort();
    assert_eq!(holders.len(), 2);

    engine.delete_subject(&group("admin")).await.unwrap();
    assert_eq!(engine.search_permission("server.stop").await.unwrap().len(), 1);
    assert!(engine
        .group("admin")
        .unwrap()
        .snapshot()
        .await
        .unwrap()
        .is_empty());
}
