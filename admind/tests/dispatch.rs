#![cfg(unix)]

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use admind::{Admind, FnProvider, Task, TaskIo, TaskProvider};
use admind_client::{AdmindClient, AsyncStatus};
use admind_common::{AdmindContext, Transaction};
use tempfile::TempDir;
use tokio::time::sleep;

fn context(root: &Path, token: &str) -> AdmindContext {
    let mut context = AdmindContext::new(root, "srv").with_token(token);
    context.poll_timeout = Duration::from_millis(100);
    context.retry_backoff = Duration::from_millis(100);
    context
}

async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(50)).await;
    }
    condition()
}

async fn start(context: AdmindContext) -> Admind {
    let mut server = Admind::new(context);
    server.start();
    let identity = server.context().identity_path();
    assert!(wait_until(|| identity.exists()).await, "server never published its identity");
    server
}

fn entries(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

fn provider<F>(body: F) -> Arc<dyn TaskProvider>
where
    F: Fn(&mut TaskIo<'_>) -> anyhow::Result<bool> + Clone + Send + Sync + 'static,
{
    Arc::new(FnProvider(move |_name: &str, _options: &[String]| {
        let body = body.clone();
        Box::new(move |io: &mut TaskIo<'_>| body(io)) as Box<dyn Task>
    }))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn echo_round_trip_leaves_only_identity() {
    let temp = TempDir::new().unwrap();
    let server = start(context(temp.path(), "1_echo")).await;

    let client = AdmindClient::discover(server.context()).expect("server discoverable");
    assert_eq!(client.dir(), server.working_dir());

    let request = client.invoke("echo", "hello", &[]).await.unwrap();
    assert_eq!(client.wait_default(&request).await, AsyncStatus::Ready);
    assert_eq!(client.response(&request).await.as_deref(), Some(&b"HELLO"[..]));
    assert_eq!(client.status(&request), AsyncStatus::Gone);

    assert_eq!(entries(&server.working_dir()), vec!["srv.properties".to_string()]);
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unresolved_task_reports_error() {
    let temp = TempDir::new().unwrap();
    let server = start(context(temp.path(), "2_missing")).await;
    let client = AdmindClient::attach(server.working_dir());

    let request = client.invoke("nosuch", "x", &[]).await.unwrap();
    assert_eq!(client.wait_default(&request).await, AsyncStatus::Error);

    let error = client.error(&request).await.unwrap();
    assert!(error.contains("Task 'nosuch' not found"), "{}", error);
    assert_eq!(client.status(&request), AsyncStatus::Gone);
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn malformed_request_file_reports_error() {
    let temp = TempDir::new().unwrap();
    let server = start(context(temp.path(), "3_malformed")).await;

    let transaction = Transaction::new(server.working_dir().join("justaname.run"));
    fs::write(transaction.request(), b"x").unwrap();

    assert!(wait_until(|| transaction.observe() == AsyncStatus::Error).await);
    let status = fs::read_to_string(transaction.status_file()).unwrap();
    assert!(status.contains("Invalid task identifier"), "{}", status);
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failing_tasks_surface_as_errors() {
    let temp = TempDir::new().unwrap();
    let server = start(context(temp.path(), "4_failures")).await;
    let registry = server.registry();
    registry.register("refuse", provider(|_io: &mut TaskIo<'_>| Ok(false)));
    registry.register(
        "raise",
        provider(|_io: &mut TaskIo<'_>| Err(anyhow::anyhow!("backend unreachable"))),
    );
    registry.register(
        "explode",
        provider(|io: &mut TaskIo<'_>| {
            io.output.write_all(b"half")?;
            panic!("index out of range")
        }),
    );

    let client = AdmindClient::attach(server.working_dir());
    for (task, expected) in [
        ("refuse", "Task returned fail status"),
        ("raise", "backend unreachable"),
        ("explode", "index out of range"),
    ] {
        let request = client.invoke(task, "x", &[]).await.unwrap();
        assert_eq!(client.wait_default(&request).await, AsyncStatus::Error, "{}", task);
        let error = client.error(&request).await.unwrap();
        assert!(error.contains(expected), "{}: {}", task, error);
    }

    assert_eq!(entries(&server.working_dir()), vec!["srv.properties".to_string()]);
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn options_reach_the_provider() {
    let temp = TempDir::new().unwrap();
    let server = start(context(temp.path(), "5_options")).await;
    server.registry().register(
        "opts",
        Arc::new(FnProvider(|_name: &str, options: &[String]| {
            let joined = options.join(",");
            Box::new(move |io: &mut TaskIo<'_>| -> anyhow::Result<bool> {
                io.output.write_all(joined.as_bytes())?;
                Ok(true)
            }) as Box<dyn Task>
        })),
    );

    let client = AdmindClient::attach(server.working_dir());
    let request = client.invoke("opts", "x", &["xml", "v2"]).await.unwrap();
    assert_eq!(client.wait_default(&request).await, AsyncStatus::Ready);
    assert_eq!(client.response(&request).await.as_deref(), Some(&b"xml,v2"[..]));
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn timed_out_wait_abandons_transaction() {
    let temp = TempDir::new().unwrap();
    let server = start(context(temp.path(), "6_slow")).await;
    server.registry().register(
        "slow",
        provider(|io: &mut TaskIo<'_>| {
            let mut data = Vec::new();
            io.input.read_to_end(&mut data)?;
            std::thread::sleep(Duration::from_millis(1500));
            io.output.write_all(&data)?;
            writeln!(io.diagnostics, "finished late")?;
            Ok(true)
        }),
    );

    let client = AdmindClient::attach(server.working_dir());
    let request = client.invoke("slow", "x", &[]).await.unwrap();
    assert!(wait_until(|| client.status(&request) == AsyncStatus::Running).await);

    let status = client
        .wait(&request, Duration::from_millis(200), AsyncStatus::Ready)
        .await;
    assert_eq!(status, AsyncStatus::Error);
    assert_eq!(client.status(&request), AsyncStatus::Gone);

    let dir = server.working_dir();
    assert!(wait_until(|| server.in_flight() == 0).await);
    assert_eq!(client.status(&request), AsyncStatus::Gone);
    assert_eq!(entries(&dir), vec!["srv.properties".to_string()]);
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn status_appears_only_after_complete_response() {
    const CHUNKS: [&str; 5] = ["alpha;", "beta;", "gamma;", "delta;", "epsilon;"];

    let temp = TempDir::new().unwrap();
    let server = start(context(temp.path(), "12_chunks")).await;
    server.registry().register(
        "chunked",
        provider(|io: &mut TaskIo<'_>| {
            for chunk in CHUNKS {
                io.output.write_all(chunk.as_bytes())?;
                io.output.flush()?;
                std::thread::sleep(Duration::from_millis(60));
            }
            Ok(true)
        }),
    );

    let client = AdmindClient::attach(server.working_dir());
    let request = client.invoke("chunked", "x", &[]).await.unwrap();
    let transaction = Transaction::new(request.path());

    let observer = tokio::spawn(async move {
        let mut saw_running = false;
        loop {
            match transaction.observe() {
                AsyncStatus::Running => saw_running = true,
                status if status.is_terminal() => {
                    let snapshot = fs::read(transaction.response()).unwrap();
                    return (status, saw_running, snapshot);
                }
                _ => {}
            }
            sleep(Duration::from_millis(1)).await;
        }
    });

    let (status, saw_running, snapshot) = tokio::time::timeout(Duration::from_secs(10), observer)
        .await
        .expect("transaction finished")
        .unwrap();
    assert_eq!(status, AsyncStatus::Ready);
    assert!(saw_running);
    assert_eq!(String::from_utf8(snapshot).unwrap(), CHUNKS.concat());

    client.response(&request).await;
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn consuming_twice_is_harmless() {
    let temp = TempDir::new().unwrap();
    let server = start(context(temp.path(), "7_twice")).await;
    let client = AdmindClient::attach(server.working_dir());

    let request = client.invoke("echo", "abc", &[]).await.unwrap();
    assert_eq!(client.wait_default(&request).await, AsyncStatus::Ready);
    assert!(client.response(&request).await.is_some());
    assert!(client.response(&request).await.is_none());
    assert!(client.error(&request).await.is_none());
    assert_eq!(client.status(&request), AsyncStatus::Gone);
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stop_removes_owned_directory() {
    let temp = TempDir::new().unwrap();
    let server = start(context(temp.path(), "8_owned")).await;
    assert!(server.owns_dir());

    let dir = server.working_dir();
    server.stop().await;
    assert!(!dir.exists());
    assert!(!temp.path().join("postmortem.log").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn adopted_directory_survives_stop() {
    let temp = TempDir::new().unwrap();
    let dir = temp.path().join("9_adopted");
    fs::create_dir_all(&dir).unwrap();

    let mut server = Admind::new(context(temp.path(), "9_adopted"));
    server.start();
    assert!(!server.owns_dir());
    assert!(server.context().identity_path().exists());

    let client = AdmindClient::discover(server.context()).expect("adopted server discoverable");
    assert_eq!(client.dir(), dir.as_path());
    let request = client.invoke("echo", "kept", &[]).await.unwrap();
    assert_eq!(client.wait_default(&request).await, AsyncStatus::Ready);
    assert_eq!(client.response(&request).await.as_deref(), Some(&b"KEPT"[..]));

    server.stop().await;
    assert!(dir.is_dir());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn deleted_directory_is_recreated() {
    let temp = TempDir::new().unwrap();
    let server = start(context(temp.path(), "10_recreate")).await;
    let dir = server.working_dir();
    let identity = server.context().identity_path();

    fs::remove_dir_all(&dir).unwrap();
    assert!(wait_until(|| identity.exists()).await, "directory not recreated");

    let client = AdmindClient::discover(server.context()).expect("rediscoverable");
    let request = client.invoke("echo", "again", &[]).await.unwrap();
    assert_eq!(client.wait_default(&request).await, AsyncStatus::Ready);
    assert_eq!(client.response(&request).await.as_deref(), Some(&b"AGAIN"[..]));

    server.stop().await;
    assert!(!dir.exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_task_stops_server() {
    let temp = TempDir::new().unwrap();
    let server = start(context(temp.path(), "11_shutdown")).await;
    let handle = server.shutdown_handle();
    let client = AdmindClient::attach(server.working_dir());

    let request = client.invoke("shutdown", "now", &[]).await.unwrap();
    assert_eq!(client.wait_default(&request).await, AsyncStatus::Ready);
    assert!(handle.is_requested());

    tokio::time::timeout(Duration::from_secs(1), handle.requested())
        .await
        .expect("shutdown observed");
    server.stop().await;
}
