//! TLS-PSK frontend end to end: a PSK client on one side, an echo backend on
//! the other

mod common;

use std::net::SocketAddr;
use std::pin::Pin;
use std::time::Duration;

use common::*;
use openssl::ssl::{Ssl, SslContext, SslContextBuilder, SslMethod, SslVersion};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_openssl::SslStream;
use vtrust_lib::constants::{PSK_CIPHER, PSK_HINT};
use vtrust_lib::proxy::{PskFrontend, SessionRegistry};
use vtrust_lib::psk::{PskAcceptor, derive_psk};

/// Identity in the shape the device SDK presents
fn device_identity() -> Vec<u8> {
    let mut identity = vec![0x01];
    identity.extend_from_slice(b"BAohbmd6aG91IFR1");
    identity.extend_from_slice(b"0123456789abcdef");
    identity.extend_from_slice(b"devicespecific");
    identity
}

fn client_context() -> SslContext {
    let mut builder = SslContextBuilder::new(SslMethod::tls_client()).unwrap();
    builder.set_max_proto_version(Some(SslVersion::TLS1_2)).unwrap();
    builder.set_cipher_list(PSK_CIPHER).unwrap();
    builder.set_psk_client_callback(|_ssl, hint, identity_out, psk_out| {
        let identity = device_identity();
        let psk = derive_psk(&identity, hint.unwrap_or_default()).expect("psk derivation");
        identity_out[..identity.len()].copy_from_slice(&identity);
        identity_out[identity.len()] = 0;
        psk_out[..psk.len()].copy_from_slice(&psk);
        Ok(psk.len())
    });
    builder.build()
}

async fn echo_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_psk_session_relays_and_unregisters() {
    let backend = echo_backend().await;
    let registry = Arc::new(SessionRegistry::new());
    let acceptor = Arc::new(PskAcceptor::new(PSK_HINT).unwrap());
    let frontend = PskFrontend::bind("127.0.0.1:0".parse().unwrap(), backend, acceptor, registry.clone())
        .await
        .unwrap();
    let listen = frontend.local_addr().unwrap();

    let (stop_tx, stop_rx) = watch::channel(false);
    let server = tokio::spawn(frontend.run(stop_rx));

    let tcp = TcpStream::connect(listen).await.unwrap();
    let ssl = Ssl::new(&client_context()).unwrap();
    let mut tls = SslStream::new(ssl, tcp).unwrap();
    Pin::new(&mut tls).connect().await.unwrap();

    tls.write_all(b"GET /gw.json HTTP/1.1\r\n\r\n").await.unwrap();
    let mut echoed = [0u8; 25];
    tls.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"GET /gw.json HTTP/1.1\r\n\r\n");
    assert_eq!(registry.len(), 1);

    drop(tls);
    wait_until(|| registry.is_empty()).await;

    stop_tx.send(true).unwrap();
    server.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_failed_handshake_does_not_stop_frontend() {
    let backend = echo_backend().await;
    let registry = Arc::new(SessionRegistry::new());
    let acceptor = Arc::new(PskAcceptor::new(PSK_HINT).unwrap());
    let frontend = PskFrontend::bind("127.0.0.1:0".parse().unwrap(), backend, acceptor, registry.clone())
        .await
        .unwrap();
    let listen = frontend.local_addr().unwrap();
    let (stop_tx, stop_rx) = watch::channel(false);
    let server = tokio::spawn(frontend.run(stop_rx));

    // A client speaking plain HTTP to the TLS port
    let mut probe = TcpStream::connect(listen).await.unwrap();
    probe.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").await.unwrap();
    let mut rest = Vec::new();
    let _ = probe.read_to_end(&mut rest).await;
    assert!(registry.is_empty());

    // The next device still gets through
    let tcp = TcpStream::connect(listen).await.unwrap();
    let mut tls = SslStream::new(Ssl::new(&client_context()).unwrap(), tcp).unwrap();
    Pin::new(&mut tls).connect().await.unwrap();
    tls.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    tls.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");

    drop(tls);
    stop_tx.send(true).unwrap();
    server.await.unwrap().unwrap();
}
