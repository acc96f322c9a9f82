//! Store tests against a live Postgres. They self-skip when
//! ZEITWORK_TEST_DATABASE_URL is unset so the suite stays green on
//! machines without a database.

use ipnetwork::IpNetwork;
use sqlx::PgPool;
use uuid::Uuid;

use zeitwork_core::ids;
use zeitwork_db::builds::BuildStore;
use zeitwork_db::cert_store::{CertLockStore, CertStore};
use zeitwork_db::deployments::DeploymentStore;
use zeitwork_db::images::ImageStore;
use zeitwork_db::servers::ServerStore;
use zeitwork_db::status::{BuildStatus, DeploymentStatus, VmStatus};
use zeitwork_db::vms::{NewVm, VmStore};

async fn test_pool() -> Option<PgPool> {
    let url = std::env::var("ZEITWORK_TEST_DATABASE_URL").ok()?;
    match zeitwork_db::connect(&url).await {
        Ok(pool) => Some(pool),
        Err(e) => panic!("ZEITWORK_TEST_DATABASE_URL is set but unusable: {}", e),
    }
}

macro_rules! require_pool {
    () => {
        match test_pool().await {
            Some(pool) => pool,
            None => {
                eprintln!("skipping: ZEITWORK_TEST_DATABASE_URL not set");
                return;
            }
        }
    };
}

async fn fixture_org(pool: &PgPool) -> Uuid {
    let id = ids::new_id();
    sqlx::query("INSERT INTO organisations (id, name) VALUES ($1, $2)")
        .bind(id)
        .bind(format!("org-{}", id))
        .execute(pool)
        .await
        .unwrap();
    id
}

async fn fixture_project(pool: &PgPool, org: Uuid) -> Uuid {
    let id = ids::new_id();
    sqlx::query(
        "INSERT INTO projects (id, organisation_id, name, github_repository) \
         VALUES ($1, $2, $3, $4)",
    )
    .bind(id)
    .bind(org)
    .bind(format!("proj-{}", id))
    .bind("acme/app")
    .execute(pool)
    .await
    .unwrap();
    id
}

fn internal_ip(last_octet: u8) -> IpNetwork {
    format!("192.168.100.{}/32", last_octet).parse().unwrap()
}

#[tokio::test]
async fn test_server_registration_allocates_disjoint_ranges() {
    let pool = require_pool!();
    let store = ServerStore::new(pool.clone());

    let a = store
        .register(ids::new_id(), "worker-a", internal_ip(10))
        .await
        .unwrap();
    let b = store
        .register(ids::new_id(), "worker-b", internal_ip(11))
        .await
        .unwrap();

    assert_ne!(a.ip_range, b.ip_range);
    let a_range = a.ip_range_v4().unwrap();
    let b_range = b.ip_range_v4().unwrap();
    assert_eq!(a_range.prefix(), 20);
    assert_eq!(b_range.prefix(), 20);
    assert!(!a_range.contains(b_range.network()));
    assert!(!b_range.contains(a_range.network()));
}

#[tokio::test]
async fn test_server_reregistration_keeps_range() {
    let pool = require_pool!();
    let store = ServerStore::new(pool.clone());

    let id = ids::new_id();
    let first = store.register(id, "worker-r", internal_ip(20)).await.unwrap();
    let second = store
        .register(id, "worker-r-renamed", internal_ip(21))
        .await
        .unwrap();

    assert_eq!(first.ip_range, second.ip_range);
    assert_eq!(second.hostname, "worker-r-renamed");
}

#[tokio::test]
async fn test_vm_allocation_walks_guest_slots() {
    let pool = require_pool!();
    let servers = ServerStore::new(pool.clone());
    let vms = VmStore::new(pool.clone());
    let org = fixture_org(&pool).await;

    let server = servers
        .register(ids::new_id(), "worker-vm", internal_ip(30))
        .await
        .unwrap();
    let range = server.ip_range_v4().unwrap();

    let images = ImageStore::new(pool.clone());
    let image = images
        .ensure(org, "registry.zeitwork.com", &format!("r-{}", org), "latest")
        .await
        .unwrap();

    let new = NewVm {
        organisation_id: org,
        image_id: image.id,
        port: 8080,
        vcpus: 1,
        memory_mib: 256,
        env_variables: vec!["PORT=8080".to_string()],
    };

    let first = vms.allocate(&new).await.unwrap().unwrap();
    let second = vms.allocate(&new).await.unwrap().unwrap();

    // Both placed somewhere live; when they land on the fresh server the
    // addresses must be the first two odd slots of its range.
    for vm in [&first, &second] {
        assert_eq!(vm.ip_address.prefix(), 31);
        assert_eq!(vm.status, VmStatus::Pending);
    }
    if first.server_id == server.id && second.server_id == server.id {
        let a = u32::from(first.guest_ipv4().unwrap());
        let b = u32::from(second.guest_ipv4().unwrap());
        assert_eq!(a % 2, 1);
        assert_eq!(b, a + 2);
        assert!(range.contains(first.guest_ipv4().unwrap()));
    }
}

#[tokio::test]
async fn test_vm_transition_is_guarded() {
    let pool = require_pool!();
    let servers = ServerStore::new(pool.clone());
    let vms = VmStore::new(pool.clone());
    let org = fixture_org(&pool).await;

    servers
        .register(ids::new_id(), "worker-fsm", internal_ip(40))
        .await
        .unwrap();
    let images = ImageStore::new(pool.clone());
    let image = images
        .ensure(org, "registry.zeitwork.com", &format!("fsm-{}", org), "latest")
        .await
        .unwrap();

    let vm = vms
        .allocate(&NewVm {
            organisation_id: org,
            image_id: image.id,
            port: 8080,
            vcpus: 1,
            memory_mib: 256,
            env_variables: vec![],
        })
        .await
        .unwrap()
        .unwrap();

    assert!(vms.transition(vm.id, VmStatus::Pending, VmStatus::Starting).await.unwrap());
    // Repeating the same transition loses: the row left the source state.
    assert!(!vms.transition(vm.id, VmStatus::Pending, VmStatus::Starting).await.unwrap());
    assert!(vms.transition(vm.id, VmStatus::Starting, VmStatus::Running).await.unwrap());
}

#[tokio::test]
async fn test_image_claim_is_exclusive() {
    let pool = require_pool!();
    let servers = ServerStore::new(pool.clone());
    let images = ImageStore::new(pool.clone());
    let org = fixture_org(&pool).await;

    let s1 = servers
        .register(ids::new_id(), "builder-1", internal_ip(50))
        .await
        .unwrap();
    let s2 = servers
        .register(ids::new_id(), "builder-2", internal_ip(51))
        .await
        .unwrap();

    let image = images
        .ensure(org, "registry.zeitwork.com", &format!("claim-{}", org), "abc123")
        .await
        .unwrap();

    let (a, b) = tokio::join!(
        images.try_claim(image.id, s1.id),
        images.try_claim(image.id, s2.id),
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert!(a ^ b, "exactly one claimant must win (got {} / {})", a, b);

    let winner = if a { s1.id } else { s2.id };
    assert!(images.complete(image.id, winner, "disk/abc123.img").await.unwrap());

    let after = images.get(image.id).await.unwrap().unwrap();
    assert_eq!(after.disk_image_key.as_deref(), Some("disk/abc123.img"));
    assert!(after.building_by.is_none());
    assert!(after.building_started_at.is_none());

    // A built image is not claimable until explicitly reset.
    assert!(!images.try_claim(image.id, s2.id).await.unwrap());
    images.reset_for_rebuild(image.id).await.unwrap();
    assert!(images.try_claim(image.id, s2.id).await.unwrap());
}

#[tokio::test]
async fn test_build_lifecycle() {
    let pool = require_pool!();
    let org = fixture_org(&pool).await;
    let project = fixture_project(&pool, org).await;
    let builds = BuildStore::new(pool.clone());
    let images = ImageStore::new(pool.clone());

    let image = images
        .ensure(org, "registry.zeitwork.com", &format!("b-{}", org), "deadbeef")
        .await
        .unwrap();
    let build = builds.create(org, project, "deadbeef", Some("main")).await.unwrap();
    assert_eq!(build.status, BuildStatus::Pending);

    assert!(builds.mark_building(build.id, image.id).await.unwrap());
    assert!(!builds.mark_building(build.id, image.id).await.unwrap());
    assert!(builds.mark_successful(build.id).await.unwrap());

    let done = builds.get(build.id).await.unwrap().unwrap();
    assert_eq!(done.status, BuildStatus::Successful);
    assert_eq!(done.image_id, Some(image.id));
    assert!(done.finished_at.is_some());

    // Terminal builds cannot fail retroactively.
    assert!(!builds.mark_failed(build.id, "late error").await.unwrap());
}

#[tokio::test]
async fn test_deployment_supersession_query() {
    let pool = require_pool!();
    let org = fixture_org(&pool).await;
    let project = fixture_project(&pool, org).await;
    let deployments = DeploymentStore::new(pool.clone());

    let older = deployments.create(org, project, "commit-1").await.unwrap();
    let newer = deployments.create(org, project, "commit-2").await.unwrap();
    assert!(newer.id > older.id, "v7 ids must be time-ordered");

    // Force the newer row to running through the FSM path.
    sqlx::query("UPDATE deployments SET status = 'running' WHERE id = $1")
        .bind(newer.id)
        .execute(&pool)
        .await
        .unwrap();

    assert!(deployments.superseded_by_newer(project, older.id).await.unwrap());
    assert!(!deployments.superseded_by_newer(project, newer.id).await.unwrap());
}

#[tokio::test]
async fn test_deployment_transitions_are_guarded() {
    let pool = require_pool!();
    let org = fixture_org(&pool).await;
    let project = fixture_project(&pool, org).await;
    let deployments = DeploymentStore::new(pool.clone());
    let builds = BuildStore::new(pool.clone());

    let d = deployments.create(org, project, "c0ffee").await.unwrap();
    assert_eq!(d.status, DeploymentStatus::Pending);

    let build = builds.create(org, project, "c0ffee", None).await.unwrap();
    assert!(deployments.mark_building(d.id, build.id).await.unwrap());
    // Out-of-order transitions lose.
    assert!(!deployments.mark_running(d.id).await.unwrap());
    assert!(!deployments.mark_stopped(d.id).await.unwrap());

    assert!(deployments.mark_failed(d.id, "build failed: compile error").await.unwrap());
    let failed = deployments.get(d.id).await.unwrap().unwrap();
    assert_eq!(failed.status, DeploymentStatus::Failed);
    assert!(failed.failed_at.is_some());
    assert_eq!(failed.error_message.as_deref(), Some("build failed: compile error"));
}

#[tokio::test]
async fn test_cert_store_prefix_listing() {
    let pool = require_pool!();
    let store = CertStore::new(pool.clone());
    let prefix = format!("test/{}/", ids::new_id());

    store.put(&format!("{}wildcard.pem", prefix), b"PEM-A", None).await.unwrap();
    store.put(&format!("{}custom.pem", prefix), b"PEM-B", None).await.unwrap();

    let listed = store.list_prefix(&prefix).await.unwrap();
    assert_eq!(listed.len(), 2);
    assert!(listed.iter().any(|r| r.pem == b"PEM-A"));

    // Upsert replaces in place.
    store.put(&format!("{}wildcard.pem", prefix), b"PEM-A2", None).await.unwrap();
    let again = store.get(&format!("{}wildcard.pem", prefix)).await.unwrap().unwrap();
    assert_eq!(again.pem, b"PEM-A2");
}

#[tokio::test]
async fn test_cert_lock_excludes_second_holder() {
    let pool = require_pool!();
    let locks = CertLockStore::new(pool.clone());
    let key = format!("issuance-{}", ids::new_id());
    let holder_a = ids::new_id();
    let holder_b = ids::new_id();

    assert!(locks.try_acquire(&key, holder_a, 60).await.unwrap());
    assert!(!locks.try_acquire(&key, holder_b, 60).await.unwrap());
    // Re-entrant for the current holder (TTL extension).
    assert!(locks.try_acquire(&key, holder_a, 60).await.unwrap());

    locks.release(&key, holder_a).await.unwrap();
    assert!(locks.try_acquire(&key, holder_b, 60).await.unwrap());
    locks.release(&key, holder_b).await.unwrap();
}
