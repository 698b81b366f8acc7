//! Socket accounting across client shutdown. Kept in its own test binary so no other test
//! opens descriptors while this one counts them.

#![cfg(target_os = "linux")]

use ledger_client::{Client, Config};
use std::net::TcpListener;
use std::thread;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

fn open_fds() -> usize {
    std::fs::read_dir("/proc/self/fd").expect("list fds").count()
}

#[test]
fn shutdown_closes_sockets_of_clients_stuck_reconnecting() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    // Bind then drop to find a port with nothing listening: every connect is refused and
    // the clients spend most of their time in the reconnect delay.
    let address = TcpListener::bind("127.0.0.1:0")
        .expect("bind")
        .local_addr()
        .expect("addr");
    let before = open_fds();

    let mut clients: Vec<Client> = (0..5)
        .map(|_| {
            let config = Config::new(0, vec![address]).expect("config");
            Client::new(config).expect("client")
        })
        .collect();
    thread::sleep(Duration::from_millis(1500));

    for client in &mut clients {
        client.shutdown();
    }
    drop(clients);

    assert_eq!(open_fds(), before, "descriptors leaked across shutdown");
}
