use std::{net::SocketAddr, time::Duration};

use anyhow::Result;
use chat_relay::{
    hub::Hub,
    message::{Message, User, read_message, write_message},
    server::{Relay, RelayConfig},
};
use tokio::{
    io::{AsyncWriteExt, BufReader},
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    time::{sleep, timeout},
};

const WAIT: Duration = Duration::from_secs(2);

#[tokio::test]
async fn clients_receive_broadcasts_over_tcp() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let relay = Relay::new(listener, RelayConfig::default());
    let hub = relay.hub();

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        let shutdown = async move {
            let _ = shutdown_rx.await;
        };
        let _ = relay.run_until(shutdown).await;
    });

    let (mut alice_reader, mut alice_writer) = connect(addr).await?;
    let (mut bob_reader, mut bob_writer) = connect(addr).await?;
    wait_for_connections(&hub, 2).await;

    let m1 = Message {
        id: "m1".into(),
        sender: User::new("alice"),
        recipient: User::new("bob"),
        body: "hi".into(),
    };
    write_message(&mut alice_writer, &m1).await?;

    assert_eq!(next(&mut bob_reader).await?, Some(m1.clone()));
    assert_eq!(next(&mut alice_reader).await?, Some(m1));

    bob_writer.shutdown().await?;
    // The relay closes bob's side once his session is over.
    assert_eq!(next(&mut bob_reader).await?, None);
    wait_for_connections(&hub, 1).await;

    let m2 = Message::new(User::new("alice"), User::new("bob"), "bye");
    write_message(&mut alice_writer, &m2).await?;
    assert_eq!(next(&mut alice_reader).await?, Some(m2));

    alice_writer.shutdown().await?;
    drop(alice_reader);
    wait_for_connections(&hub, 0).await;

    let _ = shutdown_tx.send(());
    let _ = server.await;

    Ok(())
}

#[tokio::test]
async fn malformed_input_only_drops_the_offending_client() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let relay = Relay::new(listener, RelayConfig::default());
    let hub = relay.hub();

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        let _ = relay
            .run_until(async move {
                let _ = shutdown_rx.await;
            })
            .await;
    });

    let (mut alice_reader, mut alice_writer) = connect(addr).await?;
    let (_mallory_reader, mut mallory_writer) = connect(addr).await?;
    wait_for_connections(&hub, 2).await;

    mallory_writer.write_all(b"this is not json\n").await?;
    wait_for_connections(&hub, 1).await;

    let m = Message::new(User::new("alice"), User::new("all"), "quiet now");
    write_message(&mut alice_writer, &m).await?;
    assert_eq!(next(&mut alice_reader).await?, Some(m));

    let _ = shutdown_tx.send(());
    let _ = server.await;

    Ok(())
}

async fn connect(addr: SocketAddr) -> Result<(BufReader<OwnedReadHalf>, OwnedWriteHalf)> {
    let stream = TcpStream::connect(addr).await?;
    let (reader, writer) = stream.into_split();
    Ok((BufReader::new(reader), writer))
}

async fn next(reader: &mut BufReader<OwnedReadHalf>) -> Result<Option<Message>> {
    Ok(timeout(WAIT, read_message::<_, Message>(reader)).await??)
}

async fn wait_for_connections(hub: &Hub, expected: usize) {
    timeout(WAIT, async {
        while hub.connection_count() != expected {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| {
        panic!(
            "expected {expected} connections, found {}",
            hub.connection_count()
        )
    });
}
