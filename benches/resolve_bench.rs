use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use tokio::runtime::Runtime;

use rolegate::{EngineConfig, Guard, NewPermission, NewRole, PermissionEngine, Principal};

async fn build_engine(roles: usize, permissions_per_role: usize) -> PermissionEngine {
    let engine = PermissionEngine::in_memory(EngineConfig::default());
    let guard = Guard::default();

    let mut parent: Option<String> = None;
    for r in 0..roles {
        let role_name = format!("role {r}");
        engine
            .create_role(NewRole::named(role_name.clone(), guard.clone()), None)
            .await
            .unwrap();
        if let Some(parent_name) = &parent {
            engine
                .set_role_parent(role_name.as_str(), Some(parent_name.as_str().into()), None)
                .await
                .unwrap();
        }

        for p in 0..permissions_per_role {
            let name = format!("permission {r}.{p}");
            engine
                .create_permission(NewPermission::named(name.clone(), guard.clone()), None)
                .await
                .unwrap();
            engine
                .grant_to_role(name.as_str(), role_name.as_str(), None)
                .await
                .unwrap();
        }
        parent = Some(role_name);
    }

    let user = Principal::new("user", "1");
    engine
        .assign_role(format!("role {}", roles - 1).as_str(), &user, None)
        .await
        .unwrap();
    engine
}

fn bench_has_permission(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("has_permission");

    for depth in [1usize, 5, 10] {
        let engine = rt.block_on(build_engine(depth, 20));
        let user = Principal::new("user", "1");

        group.bench_with_input(BenchmarkId::new("chain_depth", depth), &depth, |b, _| {
            b.to_async(&rt).iter(|| async {
                // Granted at the root of the chain, resolved through inheritance
                engine
                    .has_permission(&user, "permission 0.0", None)
                    .await
                    .unwrap()
            });
        });
    }
    group.finish();
}

fn bench_all_permissions(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let engine = rt.block_on(build_engine(10, 20));
    let user = Principal::new("user", "1");

    c.bench_function("all_permissions/10x20", |b| {
        b.to_async(&rt)
            .iter(|| async { engine.all_permissions(&user).await.unwrap() });
    });
}

criterion_group!(benches, bench_has_permission, bench_all_permissions);
criterion_main!(benches);
