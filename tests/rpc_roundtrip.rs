use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use connmap::agent::Agent;
use connmap::config::{AgentConfig, Settings};
use connmap::error::RpcError;
use connmap::rpc::{self, Peer, Peers, Registry};
use connmap::server::{self, Server};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_agent() -> (String, oneshot::Sender<()>) {
    let settings = Settings {
        db_path: "/nonexistent/connmap/GeoLite2-City.mmdb".into(),
        ..Settings::default()
    };
    let agent = Arc::new(Agent::new(AgentConfig::default(), settings, Peers::new()));
    let registry = server::local_registry(agent).unwrap();
    let server = Server::bind("127.0.0.1:0", registry, Duration::from_secs(10))
        .await
        .unwrap();
    let url = server.url().unwrap();

    let (stop, stopped) = oneshot::channel::<()>();
    tokio::spawn(server.serve(async move {
        let _ = stopped.await;
    }));

    (url, stop)
}

async fn call(client: &mut Client, id: &str, name: &str, args: Value) -> Value {
    let envelope = json!({"requestID": id, "name": name, "args": args});
    client.send(WsMessage::Text(envelope.to_string())).await.unwrap();

    loop {
        match client.next().await.unwrap().unwrap() {
            WsMessage::Text(text) => {
                let response: Value = serde_json::from_str(&text).unwrap();
                if response["requestID"] == id {
                    return response;
                }
            }
            _ => continue,
        }
    }
}

#[tokio::test]
async fn unknown_method_returns_error_envelope() {
    let (url, _stop) = start_agent().await;
    let (mut client, _) = connect_async(url.as_str()).await.unwrap();

    let response = call(&mut client, "17", "NoSuchMethod", json!([])).await;

    assert_eq!(response["value"], Value::Null);
    assert!(!response["error"].as_str().unwrap().is_empty());

    // The connection survives the failed call.
    let response = call(&mut client, "18", "GetMaxPacketCache", json!([])).await;
    assert_eq!(response["value"], json!(100));
}

#[tokio::test]
async fn settings_are_shared_between_clients() {
    let (url, _stop) = start_agent().await;
    let (mut first, _) = connect_async(url.as_str()).await.unwrap();
    let (mut second, _) = connect_async(url.as_str()).await.unwrap();

    let set = call(&mut first, "1", "SetMaxPacketCache", json!([25])).await;
    assert_eq!(set["error"], "");

    let got = call(&mut second, "1", "GetMaxPacketCache", json!([])).await;
    assert_eq!(got["value"], json!(25));

    let summarized = call(&mut second, "2", "SetIsSummarized", json!([true])).await;
    assert_eq!(summarized["error"], "");
    let packets = call(&mut first, "2", "GetPackets", json!([])).await;
    assert_eq!(packets["value"], json!([]));
}

#[tokio::test]
async fn bad_arguments_are_unprocessable() {
    let (url, _stop) = start_agent().await;
    let (mut client, _) = connect_async(url.as_str()).await.unwrap();

    let wrong_type = call(&mut client, "a", "SetMaxPacketCache", json!(["lots"])).await;
    let wrong_count = call(&mut client, "b", "GetConnections", json!([1, 2])).await;

    for response in [wrong_type, wrong_count] {
        assert_eq!(response["value"], Value::Null);
        assert!(response["error"].as_str().unwrap().starts_with("unprocessable"));
    }
}

#[tokio::test]
async fn call_with_object_args_gets_an_error_response() {
    let (url, _stop) = start_agent().await;
    let (mut client, _) = connect_async(url.as_str()).await.unwrap();

    let response = call(&mut client, "x1", "SetMaxPacketCache", json!({"max": 5})).await;

    assert_eq!(response["value"], Value::Null);
    assert!(response["error"].as_str().unwrap().starts_with("unprocessable"));

    let unchanged = call(&mut client, "x2", "GetMaxPacketCache", json!([])).await;
    assert_eq!(unchanged["value"], json!(100));
}

#[tokio::test]
async fn missing_database_is_reported() {
    let (url, _stop) = start_agent().await;
    let (mut client, _) = connect_async(url.as_str()).await.unwrap();

    let response = call(&mut client, "1", "CheckDatabase", json!([])).await;

    assert_eq!(response["value"], json!(true));
}

/// Server half of a bare registry whose one method calls back into the
/// client that invoked it.
async fn start_echo(heartbeat: Duration) -> (String, Peers) {
    let mut registry = Registry::new(Arc::new(()));
    registry
        .bind1("Relay", |_: Arc<()>, peer: Peer, word: String| async move {
            peer.call::<String>("Shout", vec![json!(word)]).await
        })
        .unwrap();
    let registry = Arc::new(registry);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let peers = Peers::new();

    let attached = peers.clone();
    tokio::spawn(async move {
        let mut id = 0;
        while let Ok((stream, _)) = listener.accept().await {
            let registry = Arc::clone(&registry);
            let peers = attached.clone();
            tokio::spawn(rpc::serve_connection(registry, peers, stream, heartbeat, id));
            id += 1;
        }
    });

    (url, peers)
}

#[tokio::test]
async fn server_can_call_back_into_client() {
    let (url, _peers) = start_echo(Duration::from_secs(10)).await;
    let (mut client, _) = connect_async(url.as_str()).await.unwrap();

    let call = json!({"requestID": "c1", "name": "Relay", "args": ["hello"]});
    client.send(WsMessage::Text(call.to_string())).await.unwrap();

    let response = loop {
        let WsMessage::Text(text) = client.next().await.unwrap().unwrap() else {
            continue;
        };
        let message: Value = serde_json::from_str(&text).unwrap();
        if message["name"] == "Shout" {
            let word = message["args"][0].as_str().unwrap().to_uppercase();
            let answer = json!({"requestID": message["requestID"], "value": word, "error": ""});
            client.send(WsMessage::Text(answer.to_string())).await.unwrap();
        } else {
            break message;
        }
    };

    assert_eq!(response["requestID"], "c1");
    assert_eq!(response["value"], "HELLO");
    assert_eq!(response["error"], "");
}

#[tokio::test]
async fn silent_client_is_dropped_after_heartbeat() {
    let (url, peers) = start_echo(Duration::from_millis(200)).await;
    let (_client, _) = connect_async(url.as_str()).await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(peers.len(), 1);

    // Never polled, so pings go unanswered.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(peers.is_empty());
}

#[tokio::test]
async fn responsive_client_stays_connected() {
    let (url, peers) = start_echo(Duration::from_millis(200)).await;
    let (mut client, _) = connect_async(url.as_str()).await.unwrap();

    let reader = tokio::spawn(async move {
        while let Some(Ok(_)) = client.next().await {}
    });

    tokio::time::sleep(Duration::from_millis(700)).await;
    assert_eq!(peers.len(), 1);
    reader.abort();
}

#[test]
fn remote_errors_keep_their_message() {
    let err = RpcError::Remote("denied".into());
    assert_eq!(err.to_string(), "remote error: denied");
}
