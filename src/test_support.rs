//! Helpers shared by unit tests

use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};

/// Connected loopback pair: (accepted side, connecting side)
pub async fn tcp_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (connect, accept) = tokio::join!(TcpStream::connect(addr), listener.accept());
    (accept.unwrap().0, connect.unwrap())
}

/// Abort a connection with a TCP reset and give the reset time to land
#[allow(deprecated)]
pub async fn reset(stream: TcpStream) {
    stream.set_linger(Some(Duration::ZERO)).unwrap();
    drop(stream);
    tokio::time::sleep(Duration::from_millis(100)).await;
}
