use std::pin::pin;
use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};
use std::time::Duration;

use futures::future::{Either, join_all, select};
use tempdir::TempDir;
use tokio::sync::oneshot;

use pmix_exchange::harness::{self, TestServerModule};
use pmix_exchange::pmix::{
    PmixError, PmixStatus, Proc, Range, Scope, Value,
    client::Client,
    env::ClientIdentity,
    info::{self, App, Info},
    server::{self, Namespace, Server},
};

const NSPACE: &str = harness::DEFAULT_NSPACE;
const SECRET: &str = "secret";

fn identity(c: &server::Client<'_, TestServerModule>) -> ClientIdentity {
    let vars = c
        .envs()
        .iter()
        .map(|(k, v)| (k.to_owned(), v.to_owned()))
        .collect::<Vec<_>>();
    ClientIdentity::from_vars(vars).unwrap()
}

/// Drive `f` while the server runs.
async fn serving<F: Future>(s: &Server<TestServerModule>, f: F) -> F::Output {
    match select(pin!(s.run()), pin!(f)).await {
        Either::Left((r, _)) => panic!("Server stopped: {r:?}"),
        Either::Right((out, _)) => out,
    }
}

#[tokio::test]
async fn test_exchange() {
    let d = TempDir::new("exchange").unwrap();
    let s = Server::init(d.path(), TestServerModule::new(SECRET, 3)).unwrap();
    let ns = Namespace::register(&s, NSPACE, 3).unwrap();
    let clients = (0..3)
        .map(|r| server::Client::register(&ns, r).unwrap())
        .collect::<Vec<_>>();
    let ids = clients.iter().map(identity).collect::<Vec<_>>();

    let results = serving(
        &s,
        join_all(ids.iter().map(|id| harness::run_client(id, SECRET))),
    )
    .await;
    for r in results {
        r.unwrap();
    }

    assert!(s.module().wait_complete(Duration::from_secs(1)).await);
    assert_eq!(s.module().num_terminated(), 3);
    // One Remote and one Global snapshot per rank, never a Local one
    let registry = s.module().registry();
    assert_eq!(registry.len(), 6);
    for rank in 0..3 {
        assert_eq!(
            registry.scopes(&Proc::new(NSPACE, rank)),
            [Scope::Remote, Scope::Global]
        );
    }
}

#[tokio::test]
async fn test_get_before_fence() {
    let d = TempDir::new("exchange").unwrap();
    let s = Server::init(d.path(), TestServerModule::new(SECRET, 2)).unwrap();
    let ns = Namespace::register(&s, NSPACE, 2).unwrap();
    let c0 = server::Client::register(&ns, 0).unwrap();
    let _c1 = server::Client::register(&ns, 1).unwrap();

    serving(&s, async {
        let client = Client::init(&identity(&c0), SECRET).await.unwrap();
        harness::put_entries(&client).unwrap();

        let me = client.proc().clone();
        assert_eq!(
            client.get(&me, &harness::local_key(0)).await,
            Ok(harness::local_value(0))
        );
        assert_eq!(
            client.get(&me, &harness::remote_key(0)).await,
            Err(PmixError::NotFound)
        );
        assert_eq!(
            client
                .get(&Proc::new(NSPACE, 1), &harness::global_key(1))
                .await,
            Err(PmixError::NotFound)
        );
        client.finalize().await.unwrap();
    })
    .await;
    assert!(s.module().registry().is_empty());
}

#[tokio::test]
async fn test_bad_credential() {
    let d = TempDir::new("exchange").unwrap();
    let s = Server::init(d.path(), TestServerModule::new(SECRET, 1)).unwrap();
    let ns = Namespace::register(&s, NSPACE, 1).unwrap();
    let c = server::Client::register(&ns, 0).unwrap();
    let id = identity(&c);

    serving(&s, async {
        assert!(matches!(
            Client::init(&id, "wrong").await,
            Err(PmixError::AuthFailed)
        ));
        assert!(matches!(
            Client::init(&id, &format!("{SECRET} ")).await,
            Err(PmixError::AuthFailed)
        ));

        // Still free to connect with the right secret
        let client = Client::init(&id, SECRET).await.unwrap();
        assert!(c.is_connected());
        client.finalize().await.unwrap();
    })
    .await;
}

#[tokio::test]
async fn test_unregistered_client() {
    let d = TempDir::new("exchange").unwrap();
    let s = Server::init(d.path(), TestServerModule::new(SECRET, 1)).unwrap();
    let ns = Namespace::register(&s, NSPACE, 2).unwrap();
    let c = server::Client::register(&ns, 0).unwrap();
    let mut id = identity(&c);
    id.rank = 1;

    let result = serving(&s, Client::init(&id, SECRET)).await;
    assert!(matches!(result, Err(PmixError::NotFound)));
}

#[tokio::test]
async fn test_direct_modex() {
    let d = TempDir::new("exchange").unwrap();
    let s = Server::init(d.path(), TestServerModule::new(SECRET, 2)).unwrap();
    let ns = Namespace::register(&s, NSPACE, 2).unwrap();
    let clients = (0..2)
        .map(|r| server::Client::register(&ns, r).unwrap())
        .collect::<Vec<_>>();
    let ids = clients.iter().map(identity).collect::<Vec<_>>();

    serving(&s, async {
        let c0 = Client::init(&ids[0], SECRET).await.unwrap();
        let c1 = Client::init(&ids[1], SECRET).await.unwrap();
        harness::put_entries(&c0).unwrap();
        harness::put_entries(&c1).unwrap();

        let (r0, r1) = futures::join!(c0.fence(&[], false), c1.fence(&[], false));
        r0.unwrap();
        r1.unwrap();

        // Nothing but our own data has been delivered yet
        assert_eq!(c0.store().stats().num_visible, 2);
        harness::check_rank(&c0, 1).await.unwrap();
        assert_eq!(c0.store().stats().num_visible, 4);
        harness::check_rank(&c1, 0).await.unwrap();
        harness::check_rank(&c1, 1).await.unwrap();

        c0.finalize().await.unwrap();
        c1.finalize().await.unwrap();
    })
    .await;
}

#[tokio::test]
async fn test_fence_subset() {
    let d = TempDir::new("exchange").unwrap();
    let s = Server::init(d.path(), TestServerModule::new(SECRET, 3)).unwrap();
    let ns = Namespace::register(&s, NSPACE, 3).unwrap();
    let clients = (0..3)
        .map(|r| server::Client::register(&ns, r).unwrap())
        .collect::<Vec<_>>();
    let ids = clients.iter().map(identity).collect::<Vec<_>>();

    serving(&s, async {
        let c0 = Client::init(&ids[0], SECRET).await.unwrap();
        let c2 = Client::init(&ids[2], SECRET).await.unwrap();
        harness::put_entries(&c0).unwrap();
        harness::put_entries(&c2).unwrap();

        // Rank 1 never arrives, and need not
        let ranges = [Range::new(NSPACE, [0, 2])];
        let (r0, r2) = futures::join!(c0.fence(&ranges, true), c2.fence(&ranges, true));
        r0.unwrap();
        r2.unwrap();

        harness::check_rank(&c0, 2).await.unwrap();
        assert_eq!(
            c0.get(&Proc::new(NSPACE, 1), &harness::remote_key(1)).await,
            Err(PmixError::NotFound)
        );
        c0.finalize().await.unwrap();
        c2.finalize().await.unwrap();
    })
    .await;
}

#[tokio::test]
async fn test_fence_nb_called_once() {
    let d = TempDir::new("exchange").unwrap();
    let s = Server::init(d.path(), TestServerModule::new(SECRET, 2)).unwrap();
    let ns = Namespace::register(&s, NSPACE, 2).unwrap();
    let clients = (0..2)
        .map(|r| server::Client::register(&ns, r).unwrap())
        .collect::<Vec<_>>();
    let ids = clients.iter().map(identity).collect::<Vec<_>>();

    serving(&s, async {
        let c0 = Client::init(&ids[0], SECRET).await.unwrap();
        let c1 = Client::init(&ids[1], SECRET).await.unwrap();
        harness::put_entries(&c0).unwrap();
        harness::put_entries(&c1).unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = oneshot::channel();
        let counter = calls.clone();
        c0.fence_nb(vec![], true, move |result| {
            counter.fetch_add(1, Ordering::SeqCst);
            let _ = tx.send(result);
        });

        c1.fence(&[], true).await.unwrap();
        assert_eq!(rx.await.unwrap(), Ok(()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        harness::check_rank(&c0, 1).await.unwrap();
        c0.finalize().await.unwrap();
        c1.finalize().await.unwrap();
    })
    .await;
}

#[tokio::test]
async fn test_mismatched_collect() {
    let d = TempDir::new("exchange").unwrap();
    let s = Server::init(d.path(), TestServerModule::new(SECRET, 2)).unwrap();
    let ns = Namespace::register(&s, NSPACE, 2).unwrap();
    let clients = (0..2)
        .map(|r| server::Client::register(&ns, r).unwrap())
        .collect::<Vec<_>>();
    let ids = clients.iter().map(identity).collect::<Vec<_>>();

    serving(&s, async {
        let c0 = Client::init(&ids[0], SECRET).await.unwrap();
        let c1 = Client::init(&ids[1], SECRET).await.unwrap();
        harness::put_entries(&c1).unwrap();

        let first = {
            let c0 = c0.clone();
            tokio::spawn(async move { c0.fence(&[], true).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(c1.fence(&[], false).await, Err(PmixError::BadParam));
        assert!(s.module().registry().is_empty());
        c1.fence(&[], true).await.unwrap();
        first.await.unwrap().unwrap();

        // Only the accepted arrival contributed its Remote and Global data
        assert_eq!(s.module().registry().len(), 2);
        harness::check_rank(&c0, 1).await.unwrap();

        c0.finalize().await.unwrap();
        c1.finalize().await.unwrap();
    })
    .await;
}

#[tokio::test]
async fn test_fence_timeout() {
    let d = TempDir::new("exchange").unwrap();
    let s = Server::init(d.path(), TestServerModule::new(SECRET, 2)).unwrap();
    let ns = Namespace::register(&s, NSPACE, 2).unwrap();
    let c = server::Client::register(&ns, 0).unwrap();
    let mut id = identity(&c);
    id.fence_timeout = Duration::from_millis(100);

    serving(&s, async {
        let client = Client::init(&id, SECRET).await.unwrap();
        assert_eq!(client.fence(&[], true).await, Err(PmixError::Timeout));
        client.finalize().await.unwrap();
    })
    .await;
}

#[tokio::test]
async fn test_forwarded_operations() {
    let d = TempDir::new("exchange").unwrap();
    let s = Server::init(d.path(), TestServerModule::new(SECRET, 2)).unwrap();
    let ns = Namespace::register(&s, NSPACE, 2).unwrap();
    let c = server::Client::register(&ns, 1).unwrap();
    let id = identity(&c);

    serving(&s, async {
        let client = Client::init(&id, SECRET).await.unwrap();

        let infos = client.get_job_info().await.unwrap();
        assert_eq!(info::find(&infos, info::JOB_SIZE), Some(&Value::Uint32(2)));
        assert_eq!(info::find(&infos, info::RANK), Some(&Value::Uint32(1)));
        assert_eq!(
            info::find(&infos, info::NSPACE).and_then(Value::as_str),
            Some(NSPACE)
        );

        client
            .publish(Scope::Global, &[Info::new("port", 1234)])
            .await
            .unwrap();
        let lookup = client.lookup(Scope::Global, &["port"]).await.unwrap();
        assert!(lookup.infos.is_empty());
        assert_eq!(lookup.nspace, None);
        client.unpublish(Scope::Global, &["port"]).await.unwrap();

        let app = App {
            cmd: "true".to_owned(),
            maxprocs: 1,
            ..App::default()
        };
        assert_eq!(client.spawn(&[app]).await.unwrap(), harness::SPAWNED_NSPACE);

        let ranges = [Range::whole(NSPACE)];
        client.connect(&ranges).await.unwrap();
        client.disconnect(&ranges).await.unwrap();
        client
            .abort(PmixStatus::ERROR, "testing abort")
            .await
            .unwrap();

        client.finalize().await.unwrap();
    })
    .await;
}

#[tokio::test]
async fn test_disconnect_is_termination() {
    let d = TempDir::new("exchange").unwrap();
    let s = Server::init(d.path(), TestServerModule::new(SECRET, 1)).unwrap();
    let ns = Namespace::register(&s, NSPACE, 1).unwrap();
    let c = server::Client::register(&ns, 0).unwrap();
    let id = identity(&c);

    serving(&s, async {
        let client = Client::init(&id, SECRET).await.unwrap();
        drop(client);
        assert!(s.module().wait_complete(Duration::from_secs(5)).await);
    })
    .await;
    assert!(!c.is_connected());
}

#[tokio::test]
async fn test_repeated_direct_modex() {
    let d = TempDir::new("exchange").unwrap();
    let s = Server::init(d.path(), TestServerModule::new(SECRET, 2)).unwrap();
    let ns = Namespace::register(&s, NSPACE, 2).unwrap();
    let clients = (0..2)
        .map(|r| server::Client::register(&ns, r).unwrap())
        .collect::<Vec<_>>();
    let ids = clients.iter().map(identity).collect::<Vec<_>>();

    serving(&s, async {
        let c0 = Client::init(&ids[0], SECRET).await.unwrap();
        let c1 = Client::init(&ids[1], SECRET).await.unwrap();
        let p1 = c1.proc().clone();

        c1.put(Scope::Global, "a", 1).unwrap();
        let (r0, r1) = futures::join!(c0.fence(&[], false), c1.fence(&[], false));
        r0.unwrap();
        r1.unwrap();
        assert_eq!(c0.get(&p1, "a").await, Ok(Value::Int(1)));
        assert_eq!(c0.get(&p1, "b").await, Err(PmixError::NotFound));

        c1.put(Scope::Global, "a", 2).unwrap();
        c1.put(Scope::Remote, "b", "new").unwrap();
        let (r0, r1) = futures::join!(c0.fence(&[], false), c1.fence(&[], false));
        r0.unwrap();
        r1.unwrap();
        assert_eq!(c0.get(&p1, "a").await, Ok(Value::Int(2)));
        assert_eq!(c0.get(&p1, "b").await, Ok(Value::from("new")));
        assert_eq!(c1.get(&p1, "a").await, Ok(Value::Int(2)));

        c0.finalize().await.unwrap();
        c1.finalize().await.unwrap();
    })
    .await;
}

#[tokio::test]
async fn test_collect_then_direct_modex() {
    let d = TempDir::new("exchange").unwrap();
    let s = Server::init(d.path(), TestServerModule::new(SECRET, 2)).unwrap();
    let ns = Namespace::register(&s, NSPACE, 2).unwrap();
    let clients = (0..2)
        .map(|r| server::Client::register(&ns, r).unwrap())
        .collect::<Vec<_>>();
    let ids = clients.iter().map(identity).collect::<Vec<_>>();

    serving(&s, async {
        let c0 = Client::init(&ids[0], SECRET).await.unwrap();
        let c1 = Client::init(&ids[1], SECRET).await.unwrap();
        let p1 = c1.proc().clone();

        c1.put(Scope::Global, "a", 1).unwrap();
        let (r0, r1) = futures::join!(c0.fence(&[], true), c1.fence(&[], true));
        r0.unwrap();
        r1.unwrap();
        assert_eq!(c0.get(&p1, "a").await, Ok(Value::Int(1)));

        c1.put(Scope::Global, "a", 2).unwrap();
        c1.put(Scope::Global, "b", 3).unwrap();
        let (r0, r1) = futures::join!(c0.fence(&[], false), c1.fence(&[], false));
        r0.unwrap();
        r1.unwrap();
        assert_eq!(c0.get(&p1, "b").await, Ok(Value::Int(3)));
        assert_eq!(c0.get(&p1, "a").await, Ok(Value::Int(2)));

        // And back to a collecting fence
        c1.put(Scope::Global, "a", 4).unwrap();
        let (r0, r1) = futures::join!(c0.fence(&[], true), c1.fence(&[], true));
        r0.unwrap();
        r1.unwrap();
        assert_eq!(c0.get(&p1, "a").await, Ok(Value::Int(4)));

        c0.finalize().await.unwrap();
        c1.finalize().await.unwrap();
    })
    .await;
}

#[tokio::test]
async fn test_direct_modex_during_later_fence() {
    let d = TempDir::new("exchange").unwrap();
    let s = Server::init(d.path(), TestServerModule::new(SECRET, 2)).unwrap();
    let ns = Namespace::register(&s, NSPACE, 2).unwrap();
    let clients = (0..2)
        .map(|r| server::Client::register(&ns, r).unwrap())
        .collect::<Vec<_>>();
    let ids = clients.iter().map(identity).collect::<Vec<_>>();

    serving(&s, async {
        let c0 = Client::init(&ids[0], SECRET).await.unwrap();
        let c1 = Client::init(&ids[1], SECRET).await.unwrap();
        let p1 = c1.proc().clone();

        c1.put(Scope::Global, "a", 1).unwrap();
        let (r0, r1) = futures::join!(c0.fence(&[], false), c1.fence(&[], false));
        r0.unwrap();
        r1.unwrap();

        c1.put(Scope::Global, "a", 2).unwrap();
        c1.put(Scope::Global, "b", 3).unwrap();
        let second = {
            let c1 = c1.clone();
            tokio::spawn(async move { c1.fence(&[], false).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        // The pending fence has released nothing yet
        assert_eq!(c0.get(&p1, "b").await, Err(PmixError::NotFound));
        assert_eq!(c0.get(&p1, "a").await, Ok(Value::Int(1)));
        assert_eq!(s.module().registry().len(), 1);

        c0.fence(&[], false).await.unwrap();
        second.await.unwrap().unwrap();
        assert_eq!(c0.get(&p1, "b").await, Ok(Value::Int(3)));
        assert_eq!(c0.get(&p1, "a").await, Ok(Value::Int(2)));

        c0.finalize().await.unwrap();
        c1.finalize().await.unwrap();
    })
    .await;
}

#[tokio::test]
async fn test_departed_participant_fails_fence() {
    let d = TempDir::new("exchange").unwrap();
    let s = Server::init(d.path(), TestServerModule::new(SECRET, 2)).unwrap();
    let ns = Namespace::register(&s, NSPACE, 2).unwrap();
    let clients = (0..2)
        .map(|r| server::Client::register(&ns, r).unwrap())
        .collect::<Vec<_>>();
    let ids = clients.iter().map(identity).collect::<Vec<_>>();

    serving(&s, async {
        let c0 = Client::init(&ids[0], SECRET).await.unwrap();
        let c1 = Client::init(&ids[1], SECRET).await.unwrap();
        harness::put_entries(&c0).unwrap();

        let waiting = {
            let c0 = c0.clone();
            tokio::spawn(async move { c0.fence(&[], true).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        drop(c1);

        // Released well before the fence timeout
        let result = tokio::time::timeout(Duration::from_secs(5), waiting)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result, Err(PmixError::Unreachable));
        assert!(s.module().registry().is_empty());

        c0.finalize().await.unwrap();
    })
    .await;
}
