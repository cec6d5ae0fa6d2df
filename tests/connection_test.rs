use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use pubsub_rpc::connection::methods::handler_fn;
use pubsub_rpc::{
    Connection, ConnectionSettings, ConnectionState, ConnectionUser, CorrelationId, RpcError,
    StatusUpdate,
};
use rpc_transport::jsonrpc::{ErrorObject, INVALID_PARAMS};
use rpc_transport::{MemoryTransport, TransportEvent};
use serde_json::{Value, json};
use tokio::sync::mpsc;

const UP: Duration = Duration::from_secs(2);

/// Records every status update it receives.
struct Probe {
    id: String,
    updates: Mutex<Vec<StatusUpdate>>,
}

impl Probe {
    fn new(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            updates: Mutex::new(Vec::new()),
        })
    }

    fn states(&self) -> Vec<(ConnectionState, Option<String>)> {
        self.updates
            .lock()
            .unwrap()
            .iter()
            .map(|u| (u.state, u.message.clone()))
            .collect()
    }
}

impl ConnectionUser for Probe {
    fn id(&self) -> &str {
        &self.id
    }

    fn status(&self, update: &StatusUpdate) {
        self.updates.lock().unwrap().push(update.clone());
    }
}

/// A connection with one registered user, waited until connected.
async fn open(transport: &MemoryTransport, settings: ConnectionSettings, user: &str) -> (Connection, Arc<dyn ConnectionUser>) {
    let connection = Connection::spawn(settings, Arc::new(transport.clone())).unwrap();
    let user: Arc<dyn ConnectionUser> = Probe::new(user);
    connection.register_user(&user).await.unwrap();
    connection.wait_for_state(ConnectionState::Connected, UP).await.unwrap();
    (connection, user)
}

async fn provider(transport: &MemoryTransport, namespace: &str) -> (Connection, Arc<dyn ConnectionUser>) {
    let (connection, user) = open(transport, ConnectionSettings::new(namespace), "provider").await;
    connection
        .register_method(
            "sum",
            handler_fn(|params| async move {
                let nums: Vec<i64> = serde_json::from_value(params.unwrap_or(Value::Null))
                    .map_err(|e| ErrorObject::new(INVALID_PARAMS, e.to_string()))?;
                Ok(json!(nums.iter().sum::<i64>()))
            }),
        )
        .await
        .unwrap();
    (connection, user)
}

#[tokio::test]
async fn sum_resolves_within_a_second() {
    let transport = MemoryTransport::new();
    let (_server, _server_user) = provider(&transport, "calc").await;
    let (client, _client_user) = open(&transport, ConnectionSettings::new("calc"), "client").await;

    let started = Instant::now();
    let result = client
        .call("sum", Some(json!([5, 3])), Some(Duration::from_millis(1000)))
        .await;
    assert_eq!(result, Ok(json!(8)));
    assert!(started.elapsed() < Duration::from_millis(1000));

    // response topic released once answered
    let snapshot = client.snapshot().await.unwrap();
    assert_eq!(snapshot.pending_calls, 0);
    assert!(!transport.subscriptions().iter().any(|t| t.starts_with("calc/response/")));
}

#[tokio::test]
async fn remote_errors_reach_the_caller() {
    let transport = MemoryTransport::new();
    let (_server, _server_user) = provider(&transport, "calc").await;
    let (client, _client_user) = open(&transport, ConnectionSettings::new("calc"), "client").await;

    let result = client
        .call("sum", Some(json!("not numbers")), Some(Duration::from_secs(1)))
        .await;
    match result {
        Err(RpcError::Remote { code, .. }) => assert_eq!(code, INVALID_PARAMS),
        other => panic!("expected remote error, got {other:?}"),
    }
}

#[tokio::test]
async fn unregistered_method_times_out_after_the_deadline() {
    let transport = MemoryTransport::new();
    let (_server, _server_user) = provider(&transport, "calc").await;
    let (client, _client_user) = open(&transport, ConnectionSettings::new("calc"), "client").await;

    let started = Instant::now();
    let result = client
        .call("missing", Some(json!({})), Some(Duration::from_millis(100)))
        .await;
    assert_eq!(result, Err(RpcError::Timeout(100)));
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert_eq!(client.snapshot().await.unwrap().pending_calls, 0);
}

#[tokio::test]
async fn default_timeout_applies_when_none_is_given() {
    let transport = MemoryTransport::new();
    let settings = ConnectionSettings::new("calc").with_default_timeout(Duration::from_millis(50));
    let (client, _user) = open(&transport, settings, "client").await;

    assert_eq!(client.call("missing", None, None).await, Err(RpcError::Timeout(50)));
}

#[tokio::test]
async fn invalid_method_names_fail_immediately() {
    let transport = MemoryTransport::new();
    let (client, _user) = open(&transport, ConnectionSettings::new("calc"), "client").await;

    let err = client.call("a/b", None, None).await.unwrap_err();
    assert_eq!(err.name(), "invalid_name");
    assert!(client.register_method("+", handler_fn(|_| async { Ok(Value::Null) })).await.is_err());
}

#[tokio::test]
async fn close_resolves_every_pending_call_once() {
    let transport = MemoryTransport::new();
    let (client, _user) = open(&transport, ConnectionSettings::new("calc"), "client").await;
    client
        .register_method("echo", handler_fn(|p| async move { Ok(p.unwrap_or(Value::Null)) }))
        .await
        .unwrap();

    let first = client.begin_call("nobody", None, None);
    let second = client.begin_call("nobody", None, None);
    let late_topics = [
        format!("calc/response/{}", first.id()),
        format!("calc/response/{}", second.id()),
    ];
    assert_eq!(client.snapshot().await.unwrap().pending_calls, 2);

    transport.emit(TransportEvent::Closed);
    assert_eq!(first.wait().await, Err(RpcError::Closed));
    assert_eq!(second.wait().await, Err(RpcError::Closed));

    let snapshot = client.snapshot().await.unwrap();
    assert_eq!(snapshot.state, ConnectionState::Closed);
    assert_eq!(snapshot.pending_calls, 0);
    assert!(!snapshot.linked);
    // registrations survive a clean close
    assert_eq!(snapshot.methods, vec!["echo".to_string()]);

    // nothing is listening for the late answers any more
    for topic in late_topics {
        assert_eq!(transport.inject(&topic, br#"{"result": 1}"#), 0);
    }
    assert_eq!(client.call("sum", None, None).await, Err(RpcError::Closed));
}

#[tokio::test]
async fn first_user_connects_and_last_user_disconnects() {
    let transport = MemoryTransport::new();
    let connection = Connection::spawn(ConnectionSettings::new("calc"), Arc::new(transport.clone())).unwrap();
    let a: Arc<dyn ConnectionUser> = Probe::new("a");
    let b: Arc<dyn ConnectionUser> = Probe::new("b");

    assert_eq!(connection.register_user(&a).await.unwrap(), 1);
    assert_eq!(transport.connect_count(), 1);
    assert_eq!(connection.register_user(&b).await.unwrap(), 2);
    assert_eq!(transport.connect_count(), 1);

    assert_eq!(connection.unregister_user("b").await.unwrap(), 1);
    assert_eq!(transport.close_count(), 0);
    assert_eq!(connection.unregister_user("a").await.unwrap(), 0);
    assert_eq!(transport.close_count(), 1);

    // unknown ids change nothing
    assert_eq!(connection.unregister_user("a").await.unwrap(), 0);
    assert_eq!(transport.close_count(), 1);
    assert_eq!(connection.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn last_user_leaving_clears_methods_and_pending_calls() {
    let transport = MemoryTransport::new();
    let (client, user) = open(&transport, ConnectionSettings::new("calc"), "client").await;
    client
        .register_method("echo", handler_fn(|p| async move { Ok(p.unwrap_or(Value::Null)) }))
        .await
        .unwrap();
    let pending = client.begin_call("nobody", None, None);

    client.unregister_user(user.id()).await.unwrap();
    assert_eq!(pending.wait().await, Err(RpcError::Closed));
    let snapshot = client.snapshot().await.unwrap();
    assert!(snapshot.methods.is_empty());
    assert_eq!(snapshot.pending_calls, 0);
}

#[tokio::test]
async fn users_see_every_transition() {
    let transport = MemoryTransport::new();
    let connection = Connection::spawn(ConnectionSettings::new("calc"), Arc::new(transport.clone())).unwrap();
    let probe = Probe::new("watcher");
    let user: Arc<dyn ConnectionUser> = probe.clone();
    connection.register_user(&user).await.unwrap();
    connection.wait_for_state(ConnectionState::Connected, UP).await.unwrap();

    transport.emit(TransportEvent::Reconnecting);
    connection.wait_for_state(ConnectionState::Connecting, UP).await.unwrap();
    transport.emit(TransportEvent::Offline);
    connection.wait_for_state(ConnectionState::Offline, UP).await.unwrap();
    transport.emit(TransportEvent::Connected);
    connection.wait_for_state(ConnectionState::Connected, UP).await.unwrap();

    let states = probe.states();
    assert!(states.contains(&(ConnectionState::Connecting, Some("reconnecting".to_string()))));
    assert!(states.contains(&(ConnectionState::Offline, None)));
    assert_eq!(states.last(), Some(&(ConnectionState::Connected, None)));
    assert_eq!(connection.status().text, "connected");
}

#[tokio::test]
async fn offline_publishes_are_dropped() {
    let transport = MemoryTransport::new();
    let (_server, _server_user) = provider(&transport, "calc").await;
    let (client, _client_user) = open(&transport, ConnectionSettings::new("calc"), "client").await;

    transport.emit(TransportEvent::Offline);
    client.wait_for_state(ConnectionState::Offline, UP).await.unwrap();
    let result = client
        .call("sum", Some(json!([1, 1])), Some(Duration::from_millis(50)))
        .await;
    assert_eq!(result, Err(RpcError::Timeout(50)));

    transport.emit(TransportEvent::Connected);
    client.wait_for_state(ConnectionState::Connected, UP).await.unwrap();
    let result = client
        .call("sum", Some(json!([1, 1])), Some(Duration::from_secs(1)))
        .await;
    assert_eq!(result, Ok(json!(2)));
}

#[tokio::test]
async fn transport_error_retries_once_and_keeps_pending_calls() {
    let transport = MemoryTransport::new();
    let settings = ConnectionSettings::new("calc").with_retry_delay(Duration::from_millis(50));
    let client = Connection::spawn(settings, Arc::new(transport.clone())).unwrap();
    let probe = Probe::new("client");
    let user: Arc<dyn ConnectionUser> = probe.clone();
    client.register_user(&user).await.unwrap();
    client.wait_for_state(ConnectionState::Connected, UP).await.unwrap();

    let pending = client.begin_call("slow", None, None);
    let topic = format!("calc/response/{}", pending.id());
    assert_eq!(client.snapshot().await.unwrap().pending_calls, 1);

    transport.emit(TransportEvent::Error("broker went away".into()));
    client.wait_for_state(ConnectionState::Failed, UP).await.unwrap();
    client.wait_for_state(ConnectionState::Connected, UP).await.unwrap();

    let states = probe.states();
    let failed = states
        .iter()
        .position(|s| *s == (ConnectionState::Failed, Some("error: broker went away".to_string())))
        .unwrap();
    let retrying = states
        .iter()
        .position(|s| *s == (ConnectionState::Connecting, Some("retrying".to_string())))
        .unwrap();
    assert!(failed < retrying);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(transport.connect_attempts(), 2);
    assert!(transport.subscriptions().contains(&topic));

    let id = pending.id().clone();
    let answer = json!({"jsonrpc": "2.0", "result": 42, "id": id.as_str()});
    assert_eq!(transport.inject(&topic, answer.to_string().as_bytes()), 1);
    assert_eq!(pending.wait().await, Ok(json!(42)));
}

#[tokio::test]
async fn refused_connect_is_retried() {
    let transport = MemoryTransport::new();
    transport.refuse_next_connects(1);
    let settings = ConnectionSettings::new("calc").with_retry_delay(Duration::from_millis(20));
    let connection = Connection::spawn(settings, Arc::new(transport.clone())).unwrap();
    let user: Arc<dyn ConnectionUser> = Probe::new("u");

    connection.register_user(&user).await.unwrap();
    assert_eq!(connection.state(), ConnectionState::Failed);
    connection.wait_for_state(ConnectionState::Connected, UP).await.unwrap();
    assert_eq!(transport.connect_attempts(), 2);
    assert_eq!(transport.connect_count(), 1);
}

#[tokio::test]
async fn teardown_cancels_a_scheduled_retry() {
    let transport = MemoryTransport::new();
    let settings = ConnectionSettings::new("calc").with_retry_delay(Duration::from_millis(100));
    let (client, user) = open(&transport, settings, "client").await;

    transport.emit(TransportEvent::Error("boom".into()));
    client.wait_for_state(ConnectionState::Failed, UP).await.unwrap();
    client.unregister_user(user.id()).await.unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(transport.connect_attempts(), 1);
    assert_eq!(client.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn notifications_reach_handlers_without_replies() {
    let transport = MemoryTransport::new();
    let (server, _server_user) = open(&transport, ConnectionSettings::new("news"), "server").await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    server
        .register_method(
            "openedNewsModule",
            handler_fn(move |params| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(params);
                    Ok(Value::Null)
                }
            }),
        )
        .await
        .unwrap();
    let (client, _client_user) = open(&transport, ConnectionSettings::new("news"), "client").await;

    client.notify("openedNewsModule", None).await.unwrap();
    let received = tokio::time::timeout(UP, rx.recv()).await.unwrap();
    assert_eq!(received, Some(None));
    assert!(!transport.subscriptions().iter().any(|t| t.starts_with("news/response/")));
}

#[tokio::test]
async fn unregistering_the_last_method_releases_the_wildcard() {
    let transport = MemoryTransport::new();
    let (server, _user) = open(&transport, ConnectionSettings::new("calc"), "server").await;
    let echo = || handler_fn(|p| async move { Ok(p.unwrap_or(Value::Null)) });

    server.register_method("a", echo()).await.unwrap();
    server.register_method("a", echo()).await.unwrap();
    server.register_method("b", echo()).await.unwrap();
    assert_eq!(transport.subscribe_calls("calc/method/+"), 1);

    server.unregister_method("a").await.unwrap();
    assert!(transport.subscriptions().contains(&"calc/method/+".to_string()));
    server.unregister_method("b").await.unwrap();
    assert_eq!(transport.unsubscribe_calls("calc/method/+"), 1);
    assert!(transport.subscriptions().is_empty());
}

#[test]
fn correlation_ids_do_not_collide() {
    let ids: HashSet<CorrelationId> = (0..100_000).map(|_| CorrelationId::generate()).collect();
    assert_eq!(ids.len(), 100_000);
}

#[tokio::test]
async fn malformed_inbound_payloads_are_dropped_and_the_connection_keeps_working() {
    let transport = MemoryTransport::new();
    let (_server, _server_user) = provider(&transport, "calc").await;
    let (client, _client_user) = open(&transport, ConnectionSettings::new("calc"), "client").await;

    assert_eq!(transport.inject("calc/method/sum", b"not json"), 1);
    assert_eq!(transport.inject("calc/method/sum", br#"{"params": [1]}"#), 1);

    let result = client.call("sum", Some(json!([5, 3])), Some(Duration::from_secs(1))).await;
    assert_eq!(result, Ok(json!(8)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn timeouts_fire_while_commands_keep_arriving() {
    let transport = MemoryTransport::new();
    let (client, _user) = open(&transport, ConnectionSettings::new("calc"), "client").await;

    let flooding = client.clone();
    let flood = tokio::spawn(async move {
        loop {
            let _ = flooding.notify("noise", Some(json!([1]))).await;
            let _ = flooding.snapshot().await;
        }
    });

    let started = Instant::now();
    let result = client.call("nobody", None, Some(Duration::from_millis(50))).await;
    flood.abort();

    assert_eq!(result, Err(RpcError::Timeout(50)));
    assert!(started.elapsed() < Duration::from_secs(1));
}
