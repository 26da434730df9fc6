//! Integration tests for a Provider talking to a broker.
//!
//! The broker side is a plain `Messenger` on the other end of the transport,
//! so every exchange goes through the envelope encoding.

use axum::extract::Path;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use offload_core::protocol::*;
use offload_core::store::{content_ref, DirectoryFileStore};
use offload_core::{
    Codec, Executor, ExecutorFactory, FileStore, MemoryTransport, Messenger, Provider, ProviderConfig,
    ProviderError, TaskParams, TcpTransport,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const MODULE: &[u8] = b"\0asm\x01\0\0\0hello";

/// Echoes the arguments on stdout and stdin on stderr.
struct EchoExecutor;

#[async_trait::async_trait]
impl Executor for EchoExecutor {
    async fn run(&self, _task_id: &str, params: TaskParams) -> offload_core::Result<TaskOutput> {
        if params.args.first().map(String::as_str) == Some("hang") {
            std::future::pending::<()>().await;
        }
        Ok(TaskOutput {
            exit_status: 0,
            stdout: params.args.join(" ").into_bytes(),
            stderr: params.stdin.to_vec(),
            artifacts: None,
        })
    }
}

struct EchoFactory;

#[async_trait::async_trait]
impl ExecutorFactory for EchoFactory {
    async fn spawn(&self, _index: usize) -> offload_core::Result<Arc<dyn Executor>> {
        Ok(Arc::new(EchoExecutor))
    }
}

fn config(workers: usize) -> ProviderConfig {
    ProviderConfig {
        broker_url: "tcp://127.0.0.1:4080".to_string(),
        name: "test-provider".to_string(),
        workers,
        ..Default::default()
    }
}

async fn start_provider(workers: usize, origin: Option<url::Url>) -> Provider {
    Provider::builder(config(workers))
        .executor_factory(Arc::new(EchoFactory))
        .origin(origin)
        .build()
        .await
        .unwrap()
}

/// Connect `provider` to a broker messenger over an in-memory pair.
async fn connect_memory(provider: &Provider) -> Arc<Messenger> {
    let (broker_end, provider_end) = MemoryTransport::pair(Codec::Json);
    let broker = Arc::new(Messenger::new(Arc::new(broker_end)));
    provider.connect(Arc::new(provider_end)).await.unwrap();
    let serving = provider.clone();
    tokio::spawn(async move { serving.handle_requests().await });
    broker
}

/// Wait for the first event `pick` accepts.
async fn wait_event<T>(broker: &Messenger, mut pick: impl FnMut(Payload) -> Option<T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = broker.next_event().await.expect("event stream ended");
            if let Some(value) = pick(event.payload) {
                return value;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

fn execute(id: &str, executable: FileRef, args: &[&str]) -> ExecuteTaskRequest {
    ExecuteTaskRequest {
        task: TaskMetadata {
            id: id.to_string(),
            client: "broker-test".to_string(),
            index: 1,
        },
        executable,
        args: args.iter().map(|a| a.to_string()).collect(),
        envs: Vec::new(),
        stdin: b"stdin".to_vec(),
        rootfs: None,
        artifacts: Vec::new(),
    }
}

#[tokio::test]
async fn test_hello_and_resources_on_connect() {
    let provider = start_provider(2, None).await;
    let broker = connect_memory(&provider).await;

    let hello = broker.next_event().await.unwrap();
    assert_eq!(hello.sequence, 0);
    match hello.payload {
        Payload::ProviderHello(hello) => {
            assert_eq!(hello.name, "test-provider");
            assert!(hello.useragent.starts_with("offload-provider/"));
        }
        other => panic!("Expected ProviderHello, got: {:?}", other),
    }

    let resources = broker.next_event().await.unwrap();
    assert_eq!(resources.sequence, 1);
    assert_eq!(
        resources.payload,
        Payload::ProviderResources(ProviderResources {
            concurrency: 2,
            tasks: 0
        })
    );
}

#[tokio::test]
async fn test_upload_then_execute_by_reference() {
    let provider = start_provider(2, None).await;
    let broker = connect_memory(&provider).await;

    let uploaded: FileUploadResponse = broker
        .request(FileUploadRequest {
            filename: "hello.wasm".to_string(),
            bytes: MODULE.to_vec(),
            content_type: "application/wasm".to_string(),
        })
        .await
        .unwrap();
    assert!(uploaded.ok);
    assert_eq!(uploaded.filename, content_ref(MODULE));

    let added = wait_event(&broker, |payload| match payload {
        Payload::FileSystemUpdate(update) => Some(update.added),
        _ => None,
    })
    .await;
    assert_eq!(added, vec![uploaded.filename.clone()]);

    let listing: FileListingResponse = broker.request(FileListingRequest {}).await.unwrap();
    assert_eq!(listing.filenames, vec![uploaded.filename.clone()]);

    let result: ExecuteTaskResponse = broker
        .request(execute(
            "task-1",
            FileRef::Reference(uploaded.filename),
            &["hello", "world"],
        ))
        .await
        .unwrap();
    match result {
        ExecuteTaskResponse::Ok(output) => {
            assert_eq!(output.exit_status, 0);
            assert_eq!(output.stdout, b"hello world");
            assert_eq!(output.stderr, b"stdin");
        }
        ExecuteTaskResponse::Error(message) => panic!("task failed: {}", message),
    }
}

#[tokio::test]
async fn test_dispatch_failures_become_response_errors() {
    let provider = start_provider(1, None).await;
    let broker = connect_memory(&provider).await;

    let missing = broker
        .send_request(execute("t", FileRef::Reference(content_ref(b"gone")), &[]))
        .await
        .unwrap_err();
    match missing {
        ProviderError::Remote(message) => assert!(message.starts_with("Not found"), "{}", message),
        other => panic!("Expected remote error, got: {:?}", other),
    }

    // the connection survives a failed request
    let pong: Ping = broker.request(Ping::default()).await.unwrap();
    assert_eq!(pong.direction, PingDirection::Pong);
    assert!(!provider.messenger().unwrap().is_closed());
}

#[tokio::test]
async fn test_cancel_over_the_wire() {
    let provider = start_provider(2, None).await;
    let broker = connect_memory(&provider).await;

    let running = {
        let broker = broker.clone();
        tokio::spawn(async move {
            broker
                .request::<_, ExecuteTaskResponse>(execute(
                    "stuck",
                    FileRef::Raw(MODULE.to_vec()),
                    &["hang"],
                ))
                .await
        })
    };
    wait_event(&broker, |payload| match payload {
        Payload::ProviderResources(r) if r.tasks == 1 => Some(()),
        _ => None,
    })
    .await;

    let echo: CancelTask = broker
        .request(CancelTask {
            id: "stuck".to_string(),
            reason: "test".to_string(),
        })
        .await
        .unwrap();
    assert_eq!(echo.id, "stuck");

    match running.await.unwrap().unwrap() {
        ExecuteTaskResponse::Error(message) => assert!(message.contains("cancelled"), "{}", message),
        other => panic!("Expected cancellation, got: {:?}", other),
    }
    assert_eq!(provider.pool().len(), 2);
}

#[tokio::test]
async fn test_remote_origin_resolves_missing_module() {
    async fn serve(Path(name): Path<String>) -> Response {
        if name == "hello.wasm" {
            MODULE.to_vec().into_response()
        } else {
            StatusCode::NOT_FOUND.into_response()
        }
    }
    let app = Router::new().route("/storage/:name", get(serve));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin: url::Url = format!("http://{}", listener.local_addr().unwrap())
        .parse()
        .unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

    let provider = start_provider(1, Some(origin)).await;
    let broker = connect_memory(&provider).await;

    let result: ExecuteTaskResponse = broker
        .request(execute("t", FileRef::Reference("hello.wasm".to_string()), &["ok"]))
        .await
        .unwrap();
    assert!(matches!(result, ExecuteTaskResponse::Ok(ref o) if o.stdout == b"ok"));

    let added = wait_event(&broker, |payload| match payload {
        Payload::FileSystemUpdate(update) => Some(update.added),
        _ => None,
    })
    .await;
    assert_eq!(added, vec![content_ref(MODULE)]);

    let probe: FileProbeResponse = broker
        .request(FileProbeRequest {
            filename: content_ref(MODULE),
        })
        .await
        .unwrap();
    assert!(probe.found);
}

#[tokio::test]
async fn test_provider_over_tcp_with_directory_store() {
    let dir = TempDir::new().unwrap();
    let files = Arc::new(DirectoryFileStore::open(dir.path()).await.unwrap());
    let provider = Provider::builder(config(1))
        .executor_factory(Arc::new(EchoFactory))
        .file_store(files)
        .origin(None)
        .build()
        .await
        .unwrap();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let broker = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        TcpTransport::accept(stream, &[Codec::Binary, Codec::Json])
            .await
            .unwrap()
    });

    let transport = TcpTransport::connect(&addr, &[Codec::Binary]).await.unwrap();
    assert_eq!(transport.codec(), Codec::Binary);
    provider.connect(Arc::new(transport)).await.unwrap();
    let broker = Arc::new(Messenger::new(Arc::new(broker.await.unwrap())));
    let serving = {
        let provider = provider.clone();
        tokio::spawn(async move { provider.handle_requests().await })
    };

    let uploaded: FileUploadResponse = broker
        .request(FileUploadRequest {
            filename: String::new(),
            bytes: MODULE.to_vec(),
            content_type: String::new(),
        })
        .await
        .unwrap();
    let result: ExecuteTaskResponse = broker
        .request(execute("tcp", FileRef::Reference(uploaded.filename), &["over", "tcp"]))
        .await
        .unwrap();
    assert!(matches!(result, ExecuteTaskResponse::Ok(ref o) if o.stdout == b"over tcp"));

    // shutting down closes the broker's side and drains the pool
    provider.shutdown().await.unwrap();
    assert!(provider.pool().is_empty());
    tokio::time::timeout(Duration::from_secs(5), serving)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), broker.closed().cancelled())
        .await
        .unwrap();
    assert!(DirectoryFileStore::open(dir.path())
        .await
        .unwrap()
        .list()
        .await
        .unwrap()
        .contains(&content_ref(MODULE)));
}
