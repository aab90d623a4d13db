//! End-to-end dispatch behavior over an in-memory transport

use async_trait::async_trait;
use futures_util::future::{pending, BoxFuture};
use futures_util::FutureExt;
use redlink::connection::{RedisConnection, Transport};
use redlink::dispatcher::{Dispatcher, PipelinedConnection};
use redlink::pool::{ConnectionPool, ConnectionProvider};
use redlink::{Command, ConnectionConfig, PoolConfig, RedisError, Reply};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

type ServerFn = Box<dyn Fn(DuplexStream) -> BoxFuture<'static, ()> + Send + Sync>;

struct MockServerProvider {
    server: ServerFn,
    connects: Arc<AtomicUsize>,
}

#[async_trait]
impl ConnectionProvider for MockServerProvider {
    async fn connect(&self) -> Result<PipelinedConnection, RedisError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let (client, server) = tokio::io::duplex(4096);
        tokio::spawn((self.server)(server));
        let connection =
            RedisConnection::from_transport(Transport::Mem(client), ConnectionConfig::default());
        Ok(PipelinedConnection::spawn(connection))
    }
}

fn dispatcher_with<F, Fut>(server: F, operation_timeout: Duration) -> (Dispatcher, Arc<AtomicUsize>)
where
    F: Fn(DuplexStream) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let connects = Arc::new(AtomicUsize::new(0));
    let provider = MockServerProvider {
        server: Box::new(move |io| server(io).boxed()),
        connects: Arc::clone(&connects),
    };
    let pool_config = PoolConfig {
        max_size: 1,
        acquire_timeout: Duration::from_secs(1),
    };
    let pool = ConnectionPool::new(Arc::new(provider), &pool_config);
    (Dispatcher::new(pool, operation_timeout), connects)
}

async fn read_exact_bytes(io: &mut DuplexStream, len: usize) -> Vec<u8> {
    let mut received = vec![0u8; len];
    io.read_exact(&mut received).await.unwrap();
    received
}

#[tokio::test]
async fn test_pipelined_requests_resolve_in_send_order() {
    let set_frame = b"*3\r\n$3\r\nSET\r\n$3\r\nfoo\r\n$3\r\nbar\r\n".to_vec();
    let get_frame = b"*2\r\n$3\r\nGET\r\n$3\r\nfoo\r\n".to_vec();
    let expected_len = set_frame.len() + get_frame.len();

    let (received_tx, received_rx) = tokio::sync::oneshot::channel();
    let received_tx = std::sync::Mutex::new(Some(received_tx));

    let (dispatcher, _) = dispatcher_with(
        move |mut io| {
            let received_tx = received_tx.lock().unwrap().take().unwrap();
            async move {
                // both requests arrive before any reply is written
                let received = read_exact_bytes(&mut io, expected_len).await;
                received_tx.send(received).unwrap();

                // replies delivered in deliberately awkward chunks
                io.write_all(b"+O").await.unwrap();
                tokio::task::yield_now().await;
                io.write_all(b"K\r\n$3\r\nb").await.unwrap();
                tokio::task::yield_now().await;
                io.write_all(b"ar\r\n").await.unwrap();
                pending::<()>().await;
            }
        },
        Duration::from_secs(5),
    );

    let set_cmd = Command::new("SET").arg("foo").arg("bar");
    let get_cmd = Command::new("GET").arg("foo");
    let set = dispatcher.execute(&set_cmd);
    let get = dispatcher.execute(&get_cmd);
    let (set, get) = tokio::join!(set, get);

    assert_eq!(set.unwrap(), Reply::SimpleString("OK".to_string()));
    assert_eq!(get.unwrap(), Reply::from("bar"));

    // the wire saw both frames back-to-back in send order
    let received = received_rx.await.unwrap();
    let expected: Vec<u8> = [set_frame, get_frame].concat();
    assert_eq!(received, expected);
}

#[tokio::test]
async fn test_batch_is_written_contiguously_and_replies_in_order() {
    let batch = [
        Command::new("SET").arg("a").arg("1"),
        Command::new("INCR").arg("a"),
    ];
    let expected_frame = b"*3\r\n$3\r\nSET\r\n$1\r\na\r\n$1\r\n1\r\n*2\r\n$4\r\nINCR\r\n$1\r\na\r\n";

    let (dispatcher, _) = dispatcher_with(
        move |mut io| async move {
            let received = read_exact_bytes(&mut io, expected_frame.len()).await;
            assert_eq!(received, expected_frame.to_vec());
            io.write_all(b"+OK\r\n:2\r\n").await.unwrap();
            pending::<()>().await;
        },
        Duration::from_secs(5),
    );

    let replies = dispatcher.execute_batch(&batch).await.unwrap();
    assert_eq!(
        replies,
        vec![Reply::SimpleString("OK".to_string()), Reply::Integer(2)]
    );
}

#[tokio::test]
async fn test_batch_reports_whole_transaction_aborted_on_execabort() {
    let batch = [
        Command::new("MULTI"),
        Command::new("BOGUS").arg("k"),
        Command::new("EXEC"),
    ];

    let (dispatcher, _) = dispatcher_with(
        |mut io| async move {
            let mut sink = vec![0u8; 256];
            let _ = io.read(&mut sink).await.unwrap();
            io.write_all(
                b"+OK\r\n-ERR unknown command\r\n-EXECABORT Transaction discarded because of previous errors.\r\n",
            )
            .await
            .unwrap();
            pending::<()>().await;
        },
        Duration::from_secs(5),
    );

    assert!(matches!(
        dispatcher.execute_batch(&batch).await,
        Err(RedisError::TransactionAborted)
    ));
}

#[tokio::test]
async fn test_batch_reports_aborted_on_nil_exec() {
    let batch = [
        Command::new("MULTI"),
        Command::new("INCR").arg("a"),
        Command::new("EXEC"),
    ];

    let (dispatcher, _) = dispatcher_with(
        |mut io| async move {
            let mut sink = vec![0u8; 256];
            let _ = io.read(&mut sink).await.unwrap();
            // optimistic lock failed: the final reply is nil
            io.write_all(b"+OK\r\n+QUEUED\r\n$-1\r\n").await.unwrap();
            pending::<()>().await;
        },
        Duration::from_secs(5),
    );

    assert!(matches!(
        dispatcher.execute_batch(&batch).await,
        Err(RedisError::TransactionAborted)
    ));
}

#[tokio::test]
async fn test_error_replies_are_classified() {
    let (dispatcher, _) = dispatcher_with(
        |mut io| async move {
            let mut sink = vec![0u8; 256];
            let _ = io.read(&mut sink).await.unwrap();
            io.write_all(b"-ERR value is not an integer\r\n")
                .await
                .unwrap();
            pending::<()>().await;
        },
        Duration::from_secs(5),
    );

    assert!(matches!(
        dispatcher.execute(&Command::new("INCR").arg("k")).await,
        Err(RedisError::Server(_))
    ));
}

#[tokio::test]
async fn test_connection_loss_fails_every_pending_request() {
    let (dispatcher, _) = dispatcher_with(
        |mut io| async move {
            // accept both requests, then die without answering
            let mut sink = vec![0u8; 256];
            let _ = io.read(&mut sink).await.unwrap();
        },
        Duration::from_secs(5),
    );

    let first_cmd = Command::new("GET").arg("a");
    let second_cmd = Command::new("GET").arg("b");
    let first = dispatcher.execute(&first_cmd);
    let second = dispatcher.execute(&second_cmd);
    let (first, second) = tokio::join!(first, second);

    assert!(matches!(first, Err(RedisError::ConnectionLost(_))));
    assert!(matches!(second, Err(RedisError::ConnectionLost(_))));
}

#[tokio::test]
async fn test_timeout_poisons_the_connection() {
    let (dispatcher, connects) = dispatcher_with(
        |mut io| async move {
            // never reply; hold the connection open
            let mut sink = vec![0u8; 256];
            loop {
                if io.read(&mut sink).await.unwrap_or(0) == 0 {
                    break;
                }
            }
        },
        Duration::from_millis(50),
    );

    assert!(matches!(
        dispatcher.execute(&Command::new("GET").arg("a")).await,
        Err(RedisError::Timeout)
    ));
    assert_eq!(connects.load(Ordering::SeqCst), 1);

    // the stream position is ambiguous, so the connection was discarded
    // and the next command gets a fresh one
    let second = dispatcher.execute(&Command::new("GET").arg("b")).await;
    assert!(second.is_err());
    assert_eq!(connects.load(Ordering::SeqCst), 2);
}
