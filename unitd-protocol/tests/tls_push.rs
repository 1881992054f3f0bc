//! End-to-end push over loopback mTLS, using the certificates under
//! `tests/certs/` (a throwaway CA with server and client leaf certs).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use unitd_protocol::client::PushClient;
use unitd_protocol::protocol::{DiffFragment, KeyDiff, PushResponse};
use unitd_protocol::server::Server;
use unitd_protocol::tls;

fn cert_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/certs")
}

type SeenDiffs = Arc<Mutex<Vec<KeyDiff>>>;

async fn start_server() -> (SocketAddr, tokio::sync::mpsc::Sender<()>, SeenDiffs) {
    let certs = cert_dir();
    let tls = tls::server_config(
        &certs.join("ca.crt"),
        &certs.join("server.crt"),
        &certs.join("server.key"),
    )
    .expect("server tls config");

    let seen: SeenDiffs = Arc::new(Mutex::new(Vec::new()));
    let handler_seen = Arc::clone(&seen);
    let handler = move |diff: KeyDiff| {
        let seen = Arc::clone(&handler_seen);
        async move {
            seen.lock().unwrap().push(diff);
            PushResponse::Ok
        }
    };

    let server = Server::bind("127.0.0.1:0".parse().unwrap(), tls, handler)
        .await
        .expect("bind server");
    let addr = server.local_addr();
    let shutdown = server.shutdown_handle();
    tokio::spawn(server.run());

    (addr, shutdown, seen)
}

fn test_client(addr: SocketAddr) -> PushClient {
    let certs = cert_dir();
    let tls = tls::client_config(
        &certs.join("ca.crt"),
        &certs.join("client.crt"),
        &certs.join("client.key"),
    )
    .expect("client tls config");
    PushClient::new(addr.to_string(), "localhost", tls).expect("client")
}

#[tokio::test]
async fn mutual_tls_push_round_trip() {
    let (addr, shutdown, seen) = start_server().await;
    let client = test_client(addr);

    let fragment = DiffFragment {
        inserts: HashMap::from([(
            "foo.service".to_string(),
            "[Unit]\nDescription=foo\n".to_string(),
        )]),
        ..Default::default()
    };
    let response = client.push(vec![fragment]).await.expect("push");
    assert!(response.is_ok());

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].inserts["foo.service"], "[Unit]\nDescription=foo\n");

    let _ = shutdown.send(()).await;
}

#[tokio::test]
async fn fragments_from_one_push_are_applied_as_one_diff() {
    let (addr, shutdown, seen) = start_server().await;
    let client = test_client(addr);

    let first = DiffFragment {
        inserts: HashMap::from([("a.service".to_string(), "A".to_string())]),
        ..Default::default()
    };
    let second = DiffFragment {
        deletions: vec!["b.timer".to_string()],
        ..Default::default()
    };
    let response = client.push(vec![first, second]).await.expect("push");
    assert!(response.is_ok());

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].inserts.len(), 1);
    assert_eq!(seen[0].deletions, vec!["b.timer".to_string()]);

    let _ = shutdown.send(()).await;
}

#[tokio::test]
async fn connection_without_client_certificate_is_rejected() {
    let (addr, shutdown, seen) = start_server().await;

    // A client config that trusts the CA but presents no certificate
    let certs = cert_dir();
    let roots = tls::load_root_store(&certs.join("ca.crt")).unwrap();
    let config = rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let client = PushClient::new(addr.to_string(), "localhost", Arc::new(config)).unwrap();

    let result = client.push(vec![DiffFragment::default()]).await;
    assert!(result.is_err(), "anonymous push should be rejected");
    assert!(seen.lock().unwrap().is_empty());

    let _ = shutdown.send(()).await;
}
