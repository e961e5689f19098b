//! Client registry tests against in-process module services

mod common;

use common::*;
use ipc_dylink::config::PollConfig;
use ipc_dylink::module::ipc::RequestPayload;
use ipc_dylink::{
    ExportTable, ModuleError, ModuleHandle, ModuleRegistry, OpenStatus, ProcessSpawner,
    ServiceConfig, CALLING_CONVENTION,
};
use proptest::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

#[tokio::test]
async fn test_first_load_spawns_and_resolves_mandatory() {
    let fx = Fixture::new();

    let handle = fx.registry.load("audio").await.unwrap();
    assert_eq!(handle.identity(), "audio");
    assert_eq!(fx.spawner.spawn_count(), 1);
    assert_eq!(fx.registry.refcount("audio").await, Some(1));

    let loaded = fx.registry.describe(&handle).await.unwrap();
    assert_eq!(loaded.refcount, 1);
    assert_eq!(loaded.calling_convention, ipc_dylink::CALLING_CONVENTION);
    let names: Vec<&str> = loaded.mandatory.iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(names, ["dylink_init", "dylink_fini", "dylink_version"]);
    assert_eq!(loaded.mandatory[0].1, cap(0x1000));
    assert!(loaded.spawned_pid.is_none());

    assert!(fx.namespace().is_published("audio").await);
}

#[tokio::test]
async fn test_second_load_reuses_slot() {
    let fx = Fixture::new();

    let first = fx.registry.load("audio").await.unwrap();
    let second = fx.registry.load("audio").await.unwrap();

    assert_eq!(first, second);
    assert_eq!(fx.spawner.spawn_count(), 1);
    assert_eq!(fx.registry.refcount("audio").await, Some(2));
    assert_eq!(fx.registry.loaded().await, vec!["audio".to_string()]);
}

#[tokio::test]
async fn test_last_unload_terminates_module() {
    let fx = Fixture::new();
    let handle = fx.registry.load("audio").await.unwrap();
    fx.registry.load("audio").await.unwrap();
    let task = fx.spawner.take_task("audio").unwrap();

    assert_eq!(fx.registry.unload(&handle).await.unwrap(), 1);
    expect_running(&task).await;
    assert!(fx.registry.contains("audio").await);

    assert_eq!(fx.registry.unload(&handle).await.unwrap(), 0);
    assert!(!fx.registry.contains("audio").await);

    expect_terminated(task).await;
    assert!(!fx.namespace().is_published("audio").await);
    assert!(fx.registry.wait_for_withdrawal("audio").await);
}

#[tokio::test]
async fn test_capability_lookup() {
    let fx = Fixture::new();
    let handle = fx.registry.load("audio").await.unwrap();

    let foo = fx.registry.get_capability(&handle, "Foo").await.unwrap();
    assert_eq!(foo, Some(cap(0xf00)));

    let missing = fx.registry.get_capability(&handle, "DoesNotExist").await.unwrap();
    assert_eq!(missing, None);

    // A miss leaves the handle usable
    let again = fx.registry.get_capability(&handle, "Foo").await.unwrap();
    assert_eq!(again, foo);
    assert_eq!(fx.registry.refcount("audio").await, Some(1));
}

#[tokio::test]
async fn test_stale_handle_after_unload() {
    let fx = Fixture::new();
    let old = fx.registry.load("audio").await.unwrap();
    let task = fx.spawner.take_task("audio").unwrap();
    fx.registry.unload(&old).await.unwrap();
    expect_terminated(task).await;

    let err = fx.registry.get_capability(&old, "Foo").await.unwrap_err();
    assert!(matches!(err, ModuleError::UnknownHandle(_)));
    assert!(matches!(
        fx.registry.unload(&old).await,
        Err(ModuleError::UnknownHandle(_))
    ));

    // Reloading starts a fresh module and a fresh handle
    let new = fx.registry.load("audio").await.unwrap();
    assert_ne!(old, new);
    assert_eq!(fx.spawner.spawn_count(), 2);
    assert!(matches!(
        fx.registry.describe(&old).await,
        Err(ModuleError::UnknownHandle(_))
    ));
}

#[tokio::test]
async fn test_missing_mandatory_capability_fails_load() {
    let exports = ExportTable::new([
        ("dylink_init", cap(0x1000)),
        ("dylink_fini", cap(0x1010)),
    ])
    .unwrap();
    let fx = Fixture::with_spawner(InProcessSpawner::new().with_exports("broken", exports));

    let err = fx.registry.load("broken").await.unwrap_err();
    match err {
        ModuleError::MandatoryCapabilityMissing { identity, name } => {
            assert_eq!(identity, "broken");
            assert_eq!(name, "dylink_version");
        }
        other => panic!("unexpected error: {}", other),
    }
    assert!(!fx.registry.contains("broken").await);

    // The Open taken during the attempt was given back, so the module drains
    expect_terminated(fx.spawner.take_task("broken").unwrap()).await;
}

#[tokio::test]
async fn test_convention_mismatch_rejected() {
    let service = ServiceConfig {
        calling_convention: 0xdead_beef,
        ..ServiceConfig::default()
    };
    let fx = Fixture::with_spawner(InProcessSpawner::new().with_service(service));

    let err = fx.registry.load("audio").await.unwrap_err();
    assert!(matches!(
        err,
        ModuleError::HandshakeRejected {
            status: OpenStatus::ConventionMismatch,
            ..
        }
    ));
    assert!(!fx.registry.contains("audio").await);

    // A rejected Open does not count, and does not start a drain either
    let task = fx.spawner.take_task("audio").unwrap();
    expect_running(&task).await;
    assert!(fx.registry.kill("audio").await.unwrap());
    expect_terminated(task).await;
}

#[tokio::test]
async fn test_open_count_exhaustion_rejected() {
    let service = ServiceConfig {
        max_open_count: 1,
        ..ServiceConfig::default()
    };
    let fx = Fixture::with_spawner(InProcessSpawner::new().with_service(service));
    let peer = fx.peer_registry();

    fx.registry.load("audio").await.unwrap();
    let err = peer.load("audio").await.unwrap_err();
    assert!(matches!(
        err,
        ModuleError::HandshakeRejected {
            status: OpenStatus::ResourceExhausted,
            ..
        }
    ));
    assert_eq!(fx.spawner.spawn_count(), 1);
}

#[tokio::test]
async fn test_missing_executable_is_spawn_failure() {
    let dir = TempDir::new().unwrap();
    let spawner = Arc::new(ProcessSpawner::new(dir.path(), HashMap::new()));
    let registry = ModuleRegistry::new(fast_loader(dir.path()), spawner);

    let err = registry.load("audio").await.unwrap_err();
    assert!(matches!(err, ModuleError::SpawnFailed { .. }));
    assert!(!registry.contains("audio").await);
    assert!(!registry.namespace().is_published("audio").await);
    assert!(!dir.path().join("audio.sock").exists());
}

#[tokio::test]
async fn test_module_that_never_publishes_times_out() {
    let dir = TempDir::new().unwrap();
    let mut config = fast_loader(dir.path());
    config.discovery = PollConfig {
        max_attempts: 5,
        delay_millis: 5,
    };
    let spawner = Arc::new(InProcessSpawner::silent());
    let registry = ModuleRegistry::new(config, spawner.clone());

    let err = registry.load("audio").await.unwrap_err();
    assert!(matches!(
        err,
        ModuleError::DiscoveryTimeout { attempts: 5, .. }
    ));
    assert_eq!(spawner.spawn_count(), 1);
    assert!(!registry.contains("audio").await);
}

#[tokio::test]
async fn test_registry_capacity() {
    let dir = TempDir::new().unwrap();
    let mut config = fast_loader(dir.path());
    config.max_modules = 1;
    let spawner = Arc::new(InProcessSpawner::new());
    let registry = ModuleRegistry::new(config, spawner.clone());

    registry.load("audio").await.unwrap();
    let err = registry.load("video").await.unwrap_err();
    assert!(matches!(err, ModuleError::ResourceLimitExceeded(_)));
    assert_eq!(spawner.spawn_count(), 1);

    // Reloading a held identity is not a new slot
    registry.load("audio").await.unwrap();
    assert_eq!(registry.refcount("audio").await, Some(2));
}

#[tokio::test]
async fn test_peers_share_one_module() {
    let fx = Fixture::new();
    let peer = fx.peer_registry();

    let ours = fx.registry.load("audio").await.unwrap();
    let theirs = peer.load("audio").await.unwrap();
    assert_eq!(fx.spawner.spawn_count(), 1);
    assert_ne!(ours, theirs);

    let task = fx.spawner.take_task("audio").unwrap();
    fx.registry.unload(&ours).await.unwrap();
    expect_running(&task).await;
    assert_eq!(
        peer.get_capability(&theirs, "Foo").await.unwrap(),
        Some(cap(0xf00))
    );

    peer.unload(&theirs).await.unwrap();
    expect_terminated(task).await;
}

#[tokio::test]
async fn test_concurrent_first_loads_attach_to_one_module() {
    let fx = Fixture::new();
    let peer = fx.peer_registry();

    let (a, b) = tokio::join!(fx.registry.load("audio"), peer.load("audio"));
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(
        fx.registry.get_capability(&a, "Foo").await.unwrap(),
        peer.get_capability(&b, "Foo").await.unwrap()
    );

    fx.registry.unload(&a).await.unwrap();
    peer.unload(&b).await.unwrap();
    assert!(fx.registry.wait_for_withdrawal("audio").await);
}

#[tokio::test]
async fn test_kill_module_not_loaded_locally() {
    let fx = Fixture::new();
    let peer = fx.peer_registry();

    let handle = fx.registry.load("audio").await.unwrap();
    let task = fx.spawner.take_task("audio").unwrap();

    assert!(!peer.contains("audio").await);
    assert!(peer.kill("audio").await.unwrap());
    expect_terminated(task).await;

    // The holder's slot survives the kill and is dropped on unload
    assert!(fx.registry.contains("audio").await);
    assert_eq!(fx.registry.unload(&handle).await.unwrap(), 0);
    assert!(!fx.registry.contains("audio").await);
}

#[tokio::test]
async fn test_kill_unpublished_identity() {
    let fx = Fixture::new();
    assert!(!fx.registry.kill("audio").await.unwrap());
    assert_eq!(fx.spawner.spawn_count(), 0);
}

#[tokio::test]
async fn test_attach_to_externally_started_module() {
    let fx = Fixture::new();
    let task = start_service(fx.dir.path(), "audio", standard_exports());
    wait_published(&fx.namespace(), "audio").await;

    let handle = fx.registry.load("audio").await.unwrap();
    assert_eq!(fx.spawner.spawn_count(), 0);
    assert!(fx.registry.describe(&handle).await.unwrap().spawned_pid.is_none());

    fx.registry.unload(&handle).await.unwrap();
    expect_terminated(task).await;
}

#[tokio::test]
async fn test_shutdown_closes_everything() {
    let fx = Fixture::new();
    fx.registry.load("audio").await.unwrap();
    fx.registry.load("audio").await.unwrap();
    fx.registry.load("video").await.unwrap();
    let audio = fx.spawner.take_task("audio").unwrap();
    let video = fx.spawner.take_task("video").unwrap();

    fx.registry.shutdown().await;
    assert!(fx.registry.loaded().await.is_empty());
    expect_terminated(audio).await;
    expect_terminated(video).await;
}

#[tokio::test]
async fn test_invalid_identity_rejected() {
    let fx = Fixture::new();
    for identity in ["", "../escape", ".hidden"] {
        let err = fx.registry.load(identity).await.unwrap_err();
        assert!(
            matches!(err, ModuleError::InvalidIdentity(_)),
            "{:?} gave {}",
            identity,
            err
        );
    }
    assert_eq!(fx.spawner.spawn_count(), 0);
}

#[tokio::test]
async fn test_abandoned_query_leaves_handle_usable() {
    let fx = Fixture::new();
    let handle = fx.registry.load("audio").await.unwrap();

    {
        // Request sent, reply never read
        let query = fx.registry.get_capability(&handle, "Foo");
        tokio::pin!(query);
        assert!(futures::poll!(query.as_mut()).is_pending());
    }

    for _ in 0..2 {
        assert_eq!(
            fx.registry.get_capability(&handle, "Foo").await.unwrap(),
            Some(cap(0xf00))
        );
    }
    assert_eq!(
        fx.registry.get_capability(&handle, "dylink_init").await.unwrap(),
        Some(cap(0x1000))
    );
    assert_eq!(fx.registry.refcount("audio").await, Some(1));
}

#[tokio::test]
async fn test_abandoned_load_gives_open_back() {
    let fx = Fixture::new();
    let script = Script {
        ignore_queries: true,
        ..Script::default()
    };
    let mut module = ScriptedModule::start(fx.dir.path(), "stuck", script).await;

    let load = tokio::time::timeout(Duration::from_millis(200), fx.registry.load("stuck")).await;
    assert!(load.is_err());
    assert!(!fx.registry.contains("stuck").await);

    assert_eq!(
        module.next_request().await,
        RequestPayload::Open {
            calling_convention: CALLING_CONVENTION
        }
    );
    assert!(matches!(
        module.next_request().await,
        RequestPayload::SymbolQuery { .. }
    ));
    assert_eq!(module.next_request().await, RequestPayload::Close);
}

#[tokio::test]
async fn test_handshake_retried_once_after_disconnect() {
    let fx = Fixture::new();
    let script = Script {
        drop_connections: 1,
        ..Script::default()
    };
    let mut module = ScriptedModule::start(fx.dir.path(), "audio", script).await;

    let handle = fx.registry.load("audio").await.unwrap();
    assert_eq!(fx.spawner.spawn_count(), 0);
    assert_eq!(fx.registry.describe(&handle).await.unwrap().mandatory.len(), 3);

    // Only the second connection was served
    assert!(matches!(
        module.next_request().await,
        RequestPayload::Open { .. }
    ));
}

#[tokio::test]
async fn test_second_disconnect_during_handshake_fails_load() {
    let fx = Fixture::new();
    let script = Script {
        drop_connections: usize::MAX,
        ..Script::default()
    };
    let _module = ScriptedModule::start(fx.dir.path(), "audio", script).await;

    let err = fx.registry.load("audio").await.unwrap_err();
    assert!(
        matches!(err, ModuleError::ChannelClosed),
        "unexpected error: {}",
        err
    );
    assert_eq!(fx.spawner.spawn_count(), 0);
    assert!(!fx.registry.contains("audio").await);
}

const IDENTITIES: [&str; 2] = ["audio", "video"];

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_refcount_is_loads_minus_unloads(
        ops in proptest::collection::vec((0usize..2, any::<bool>()), 1..24)
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        runtime.block_on(async {
            let fx = Fixture::new();
            let mut counts = [0usize; 2];
            let mut handles: [Option<ModuleHandle>; 2] = [None, None];

            for (which, is_load) in ops {
                let identity = IDENTITIES[which];
                if is_load {
                    let handle = fx.registry.load(identity).await.unwrap();
                    if let Some(held) = &handles[which] {
                        assert_eq!(held, &handle);
                    }
                    handles[which] = Some(handle);
                    counts[which] += 1;
                } else if let Some(handle) = handles[which].clone() {
                    counts[which] -= 1;
                    assert_eq!(fx.registry.unload(&handle).await.unwrap(), counts[which]);
                    if counts[which] == 0 {
                        handles[which] = None;
                    }
                }

                for (identity, &count) in IDENTITIES.iter().zip(&counts) {
                    let expected = (count > 0).then_some(count);
                    assert_eq!(fx.registry.refcount(identity).await, expected);
                    assert_eq!(fx.registry.contains(identity).await, count > 0);
                }
            }

            fx.registry.shutdown().await;
        });
    }
}
