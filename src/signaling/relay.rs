//! Signaling relay, a minimal stand-in for the hosted realtime service.
//!
//! Accepts WebSocket clients, attaches each to one topic on a `LocalHub`,
//! and fans broadcasts out to the topic's other members. Holds no state
//! beyond channel membership.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;

use super::hub::LocalHub;
use super::transport::{Inbound, Outbound, RealtimeBackend};
use super::websocket::RelayFrame;

/// Bind `addr` and serve until Ctrl-C.
pub async fn run(addr: &str) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind relay on {}", addr))?;
    let local = listener.local_addr()?;
    println!("Signaling relay listening on ws://{} (Ctrl-C to stop)", local);

    tokio::select! {
        res = serve(listener, LocalHub::new()) => res,
        _ = tokio::signal::ctrl_c() => {
            println!("Shutting down...");
            Ok(())
        }
    }
}

/// Accept clients on `listener` forever.
pub async fn serve(listener: TcpListener, hub: LocalHub) -> Result<()> {
    loop {
        let (stream, peer) = listener.accept().await.context("Relay accept failed")?;
        let hub = hub.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_client(stream, peer, hub).await {
                tracing::debug!("Relay client {} ended: {:#}", peer, e);
            }
        });
    }
}

async fn handle_client(stream: TcpStream, peer: SocketAddr, hub: LocalHub) -> Result<()> {
    let mut ws = tokio_tungstenite::accept_async(stream)
        .await
        .context("WebSocket handshake failed")?;
    tracing::debug!("Relay client {} connected", peer);

    // First meaningful frame must be a join.
    let topic = loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => match RelayFrame::parse(&text) {
                Some(RelayFrame::Join { topic }) => break topic,
                _ => {
                    let refusal = RelayFrame::Error {
                        reason: "expected join".into(),
                    };
                    ws.send(refusal.to_message()).await?;
                }
            },
            Some(Ok(Message::Ping(data))) => ws.send(Message::Pong(data)).await?,
            Some(Ok(Message::Close(_))) | None => return Ok(()),
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(e).context("WebSocket receive error"),
        }
    };

    let mut sub = hub
        .subscribe(&topic)
        .await
        .context("Hub subscription failed")?;
    ws.send(
        RelayFrame::Joined {
            topic: topic.clone(),
        }
        .to_message(),
    )
    .await?;
    tracing::info!(
        "Relay client {} joined {} ({} attached)",
        peer,
        topic,
        hub.member_count(&topic)
    );

    let result = loop {
        tokio::select! {
            frame = ws.next() => match frame {
                Some(Ok(Message::Text(text))) => match RelayFrame::parse(&text) {
                    Some(RelayFrame::Broadcast { payload }) => {
                        let _ = sub.outbound.send(Outbound::Publish(payload));
                    }
                    Some(RelayFrame::Track { user }) => {
                        let _ = sub.outbound.send(Outbound::Track(user));
                    }
                    Some(RelayFrame::Leave) => break Ok(()),
                    _ => {}
                },
                Some(Ok(Message::Ping(data))) => {
                    if let Err(e) = ws.send(Message::Pong(data)).await {
                        break Err(e.into());
                    }
                }
                Some(Ok(Message::Close(_))) | None => break Ok(()),
                Some(Ok(_)) => {}
                Some(Err(e)) => break Err(anyhow::Error::from(e).context("WebSocket receive error")),
            },
            delivery = sub.inbound.recv() => {
                let frame = match delivery {
                    Some(Inbound::Message(payload)) => RelayFrame::Message { payload },
                    Some(Inbound::Presence(users)) => RelayFrame::Presence { users },
                    None => break Ok(()),
                };
                if let Err(e) = ws.send(frame.to_message()).await {
                    break Err(e.into());
                }
            }
        }
    };

    let _ = sub.outbound.send(Outbound::Leave);
    tracing::info!("Relay client {} left {}", peer, topic);
    result
}
