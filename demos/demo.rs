// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed
// licenses.

use rand::rngs::OsRng;
use speke::{DefaultCipherSuite, SafePrimeGroup, SessionState, Speke, SpekeSession};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

#[tokio::main]
async fn main() {
    let group = SafePrimeGroup::modp_2048();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Error binding the listener");
    let addr = listener.local_addr().expect("Error reading the local addr");
    let accept = tokio::spawn(async move {
        listener.accept().await.expect("Error accepting").0
    });
    let client = tokio::net::TcpStream::connect(addr)
        .await
        .expect("Error connecting");
    let server = accept.await.expect("Error joining the accept task");

    let alice_engine =
        Speke::<DefaultCipherSuite>::new("alice", "hunter2", group.clone(), &mut OsRng)
            .expect("Error creating alice's engine");
    let bob_engine = Speke::<DefaultCipherSuite>::new("bob", "hunter2", group, &mut OsRng)
        .expect("Error creating bob's engine");

    println!("alice id: {}", alice_engine.id());
    println!(
        "alice public key ({} bytes): {}",
        alice_engine.public_key().len(),
        hex::encode(alice_engine.public_key())
    );
    println!("bob id: {}", bob_engine.id());
    println!(
        "bob public key ({} bytes): {}",
        bob_engine.public_key().len(),
        hex::encode(bob_engine.public_key())
    );

    let alice = SpekeSession::new(client, alice_engine);
    let bob = SpekeSession::new(server, bob_engine);

    let (tx, mut rx) = mpsc::unbounded_channel();
    alice
        .start(Arc::new(|_payload, _handle| {}))
        .await
        .expect("Error starting alice's session");
    bob.start(Arc::new(move |payload, _handle| {
        let _ = tx.send(payload);
    }))
    .await
    .expect("Error starting bob's session");

    while !(alice.peer_confirmed() && bob.peer_confirmed()) {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    println!(
        "key confirmation complete: alice={:?}, bob={:?}",
        alice.state(),
        bob.state()
    );

    alice
        .send_message(b"hello")
        .await
        .expect("Error sending the message");
    let payload = rx.recv().await.expect("Error receiving the message");
    println!(
        "bob received an authenticated message: {:?}",
        String::from_utf8_lossy(&payload)
    );

    alice.close().await;
    bob.close().await;
    assert_eq!(alice.state(), SessionState::Stopped);
    assert_eq!(bob.state(), SessionState::Stopped);
}
