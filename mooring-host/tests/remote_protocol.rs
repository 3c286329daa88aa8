//! Remote-specific behavior: batched result retrieval, bounded waits, and
//! cross-node filesystem resources.

use std::collections::HashSet;
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use mooring_api::wire::{read_frame, write_frame, Request, Response};
use mooring_api::TaskId;

use mooring_host::demo::{self, ECHO_SERVICE};
use mooring_host::executor::RemoteServiceExecutor;
use mooring_host::fsres::FilesystemResource;
use mooring_host::server::{RemoteExecutionServer, ServerHandle};
use mooring_host::service::FactoryRegistry;
use mooring_host::{
    archive, NodeContext, NodeId, Payload, ServiceDescriptor, ServiceExecutorExt, WaitError,
};

struct Remote {
    executor: RemoteServiceExecutor,
    node: Arc<NodeContext>,
    _server: ServerHandle,
    _plugin: TempDir,
    _server_scratch: TempDir,
    _client_scratch: TempDir,
}

/// Spin up a server and one session against it, with the client posing as
/// its own node so filesystem pulls really cross the gateway.
fn remote() -> Remote {
    let registry = Arc::new(FactoryRegistry::new());
    demo::register_demo_services(&registry).unwrap();

    let plugin = TempDir::new().unwrap();
    std::fs::write(plugin.path().join("mod.bin"), b"demo").unwrap();
    let descriptor = ServiceDescriptor::new(
        ECHO_SERVICE,
        plugin.path(),
        "mod.bin",
        Payload::encode(&None::<String>).unwrap(),
    );

    let server_scratch = TempDir::new().unwrap();
    let server = RemoteExecutionServer::bind("127.0.0.1:0", registry, server_scratch.path())
        .unwrap()
        .spawn()
        .unwrap();

    let client_scratch = TempDir::new().unwrap();
    let node = Arc::new(NodeContext::with_id(NodeId::random(), client_scratch.path()));
    let executor = RemoteServiceExecutor::connect(server.addr(), &descriptor, &node).unwrap();

    Remote {
        executor,
        node,
        _server: server,
        _plugin: plugin,
        _server_scratch: server_scratch,
        _client_scratch: client_scratch,
    }
}

#[test]
fn waiting_for_one_task_delivers_the_finished_batch() {
    let remote = remote();

    let futures: Vec<_> = (0..4)
        .map(|i| {
            remote
                .executor
                .submit_typed("echo", &format!("task-{i}"))
                .unwrap()
        })
        .collect();

    // Tasks run FIFO on one worker, so by the time the last one is buffered
    // the earlier ones are too; one poll drains them all.
    let last = futures[3].result(Some(Duration::from_secs(10))).unwrap();
    assert_eq!(last.decode::<String>().unwrap(), "task-3");
    for future in &futures[..3] {
        assert!(future.done());
    }

    // Each future resolves to its own task's value, exactly once.
    for (i, future) in futures.iter().enumerate() {
        let value = future.result(None).unwrap();
        assert_eq!(value.decode::<String>().unwrap(), format!("task-{i}"));
    }
}

#[test]
fn failures_ride_the_same_batch_as_successes() {
    let remote = remote();

    let ok_a = remote.executor.submit_typed("echo", &"a".to_string()).unwrap();
    let bad = remote
        .executor
        .submit_typed("fail", &"task two broke".to_string())
        .unwrap();
    let ok_b = remote.executor.submit_typed("echo", &"b".to_string()).unwrap();

    let err = bad.error(Some(Duration::from_secs(10))).unwrap().unwrap();
    assert_eq!(err.message, "task two broke");

    assert_eq!(
        ok_a.result(None).unwrap().decode::<String>().unwrap(),
        "a"
    );
    assert_eq!(
        ok_b.result(None).unwrap().decode::<String>().unwrap(),
        "b"
    );
}

#[test]
fn bounded_wait_times_out_without_losing_the_result() {
    let remote = remote();

    let slow = remote
        .executor
        .submit_typed("sleep_echo", &(400u64, "worth the wait".to_string()))
        .unwrap();

    // The timeout is its own failure mode; the task keeps running.
    let early = slow.result(Some(Duration::from_millis(30)));
    assert!(matches!(early, Err(WaitError::Timeout)));
    assert!(!slow.done());

    let value = slow.result(Some(Duration::from_secs(10))).unwrap();
    assert_eq!(value.decode::<String>().unwrap(), "worth the wait");
}

#[test]
fn session_recovers_after_a_timed_out_poll() {
    let remote = remote();

    let first = remote
        .executor
        .submit_typed("sleep_echo", &(300u64, "first".to_string()))
        .unwrap();
    let second = remote
        .executor
        .submit_typed("sleep_echo", &(50u64, "second".to_string()))
        .unwrap();

    // Leave the poll response owed on the wire.
    assert!(matches!(
        first.result(Some(Duration::from_millis(20))),
        Err(WaitError::Timeout)
    ));

    // Later traffic on the session must absorb the owed batch first.
    let second_value = second.result(Some(Duration::from_secs(10))).unwrap();
    assert_eq!(second_value.decode::<String>().unwrap(), "second");

    let first_value = first.result(Some(Duration::from_secs(10))).unwrap();
    assert_eq!(first_value.decode::<String>().unwrap(), "first");

    // Synchronous calls keep working on the same connection.
    let echoed: String = remote
        .executor
        .run_typed("echo", &"still alive".to_string())
        .unwrap();
    assert_eq!(echoed, "still alive");
}

fn roundtrip(stream: &mut TcpStream, request: &Request) -> Response {
    write_frame(stream, request).unwrap();
    read_frame(stream).unwrap()
}

fn batch_ids(response: Response) -> HashSet<TaskId> {
    match response {
        Response::Results(batch) => batch.iter().map(|r| r.id).collect(),
        other => panic!("expected a result batch, got {other:?}"),
    }
}

/// Drive the wire protocol by hand: once a result has been drained into a
/// batch, no later batch may carry its id again.
#[test]
fn drained_results_never_reappear_in_a_later_batch() {
    let registry = Arc::new(FactoryRegistry::new());
    demo::register_demo_services(&registry).unwrap();

    let plugin = TempDir::new().unwrap();
    std::fs::write(plugin.path().join("mod.bin"), b"demo").unwrap();
    let server_scratch = TempDir::new().unwrap();
    let server = RemoteExecutionServer::bind("127.0.0.1:0", registry, server_scratch.path())
        .unwrap()
        .spawn()
        .unwrap();

    let mut stream = TcpStream::connect(server.addr()).unwrap();

    let tree = archive::encode_tree(plugin.path(), None, None).unwrap();
    assert!(matches!(
        roundtrip(&mut stream, &Request::CopyPlugin { archive: tree }),
        Response::Ack
    ));
    let descriptor = ServiceDescriptor::new(
        ECHO_SERVICE,
        plugin.path(),
        "mod.bin",
        Payload::encode(&None::<String>).unwrap(),
    );
    assert!(matches!(
        roundtrip(&mut stream, &Request::InitService { descriptor }),
        Response::Ack
    ));

    for id in 0..3u64 {
        write_frame(
            &mut stream,
            &Request::SubmitFunc {
                id,
                method: "echo".into(),
                args: Payload::encode(&format!("t{id}")).unwrap(),
            },
        )
        .unwrap();
    }
    // FIFO execution means all three are buffered once the last one is.
    let first = batch_ids(roundtrip(&mut stream, &Request::GetResults { id: 2 }));
    assert_eq!(first, HashSet::from([0, 1, 2]));

    write_frame(
        &mut stream,
        &Request::SubmitFunc {
            id: 3,
            method: "echo".into(),
            args: Payload::encode(&"t3").unwrap(),
        },
    )
    .unwrap();
    let second = batch_ids(roundtrip(&mut stream, &Request::GetResults { id: 3 }));
    assert_eq!(second, HashSet::from([3]));
    assert!(first.is_disjoint(&second));
}

#[test]
fn remote_method_pulls_client_files_through_the_gateway() {
    let remote = remote();

    let data_dir = TempDir::new().unwrap();
    let file = data_dir.path().join("notes.txt");
    std::fs::write(&file, "read me remotely").unwrap();

    // The resource is owned by the client's node id; the server side has to
    // pull it through the gateway registered at session setup.
    let resource = FilesystemResource::with_owner(remote.node.id(), &file);
    let content: String = remote.executor.run_typed("read_text", &resource).unwrap();
    assert_eq!(content, "read me remotely");
}
