//! `listen` and `call` commands: one side of an in-trip call from the
//! terminal, over the signaling relay and the UDP engine.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;

use crate::config::Config;
use crate::signaling::transport::SignalingTransport;
use crate::signaling::websocket::WsBackend;
use crate::trip::{AuthProvider, MemoryTripStore, StaticAuth, Trip, TripStatus, TripStore, User};

use super::controller::CallController;
use super::engine::UdpPeerFactory;
use super::events::CallEvent;
use super::media::{MediaStream, SyntheticDevices, TrackKind};
use super::NegotiationState;

pub struct CallOptions {
    pub trip_id: String,
    pub rider_id: String,
    pub driver_id: String,
    /// Local identity; falls back to the configured one.
    pub user_id: Option<String>,
    /// Hang up this long after connecting.
    pub duration: Option<u64>,
}

struct Prepared {
    controller: CallController,
    store: MemoryTripStore,
    follower: tokio::task::JoinHandle<()>,
}

async fn prepare(opts: &CallOptions, config: &Config) -> Result<Prepared> {
    let account = match (&opts.user_id, &config.identity) {
        (Some(id), _) => User::new(id),
        (None, Some(identity)) => User {
            email: identity.email.clone(),
            ..User::new(&identity.user_id)
        },
        (None, None) => bail!("No identity: pass --as USER or set [identity] in the config"),
    };
    let auth = StaticAuth::signed_in(account);
    let me = auth.current_user().context("Not signed in")?;

    let store = MemoryTripStore::new();
    store.insert(Trip {
        id: opts.trip_id.clone(),
        rider_id: opts.rider_id.clone(),
        driver_id: Some(opts.driver_id.clone()),
        status: TripStatus::InProgress,
        pickup: String::new(),
        dropoff: String::new(),
        created_at: Utc::now(),
    });
    let trip = store.get_trip_by_id(&opts.trip_id).await?;

    let transport = Arc::new(SignalingTransport::new(
        Arc::new(WsBackend::new(&config.relay_url)),
        config.channel_timeout(),
    ));
    let devices = SyntheticDevices::new(config.media.audio, config.media.video);
    let peers = UdpPeerFactory::new(
        config.ice.bind_ip,
        Duration::from_secs(config.ice.check_timeout_secs),
        Duration::from_secs(config.ice.consent_interval_secs),
    );

    let controller = CallController::for_trip(
        &trip,
        &me.id,
        transport,
        Arc::new(devices),
        Arc::new(peers),
        config.call_settings(),
    )
    .with_context(|| format!("{} is not part of trip {}", me.id, trip.id))?;
    let follower = controller.follow_trip(store.subscribe(&trip.id).await?);
    controller.on_remote_stream(|stream| println!("Receiving {}", describe(&stream)));

    println!(
        "Trip {}: you are {}, counterpart is {}",
        trip.id,
        me.id,
        controller.remote_user()
    );
    Ok(Prepared {
        controller,
        store,
        follower,
    })
}

/// Complete the trip, which tears the call controller down.
async fn finish(prepared: Prepared, trip_id: &str) -> Result<()> {
    prepared
        .store
        .update_trip_status(trip_id, TripStatus::Completed)
        .await?;
    prepared.follower.await.context("Trip follower failed")?;
    Ok(())
}

fn describe(stream: &MediaStream) -> &'static str {
    match (
        stream.has_kind(TrackKind::Audio),
        stream.has_kind(TrackKind::Video),
    ) {
        (true, true) => "audio and video",
        (true, false) => "audio only",
        (false, true) => "video only",
        (false, false) => "no tracks",
    }
}

async fn hold(duration: Option<u64>) {
    match duration {
        Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
        None => std::future::pending().await,
    }
}

/// Wait for incoming calls and answer the first one.
pub async fn listen(opts: CallOptions, config: &Config) -> Result<()> {
    let prepared = prepare(&opts, config).await?;
    let controller = prepared.controller.clone();
    let mut events = controller.subscribe();
    let mut presence = controller.presence();
    controller.on_incoming_call(|from| println!("Incoming call from {}", from));

    controller
        .start_listening()
        .await
        .context("Could not join the trip call channel")?;
    println!("Waiting for a call (Ctrl-C to stop)...");

    let mut answered = false;
    let hang_up = hold(None);
    tokio::pin!(hang_up);

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    CallEvent::IncomingCall { .. } => match controller.answer_call().await {
                        Ok(local) => {
                            println!("Answered, sending {}", describe(&local));
                            answered = true;
                        }
                        Err(e) => {
                            println!("Could not answer: {}", e);
                            // Stop the caller's phone ringing; we will not retry.
                            if let Err(e) = controller.decline_call().await {
                                tracing::debug!("Decline after failed answer: {}", e);
                            }
                        }
                    },
                    CallEvent::RemoteStream(_) => {}
                    CallEvent::StateChanged(state) => {
                        tracing::info!("Call state: {}", state);
                        if state == NegotiationState::Connected {
                            println!("Connected");
                            hang_up.set(hold(opts.duration));
                        }
                    }
                    CallEvent::CallEnded(reason) => {
                        println!("Call ended ({:?})", reason);
                        if answered {
                            break;
                        }
                    }
                }
            }
            Ok(()) = presence.changed() => {
                tracing::info!("{} on the trip call channel", *presence.borrow());
            }
            _ = &mut hang_up => {
                println!("Hanging up");
                controller.end_call().await;
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                println!("Interrupted");
                controller.end_call().await;
                break;
            }
        }
    }

    finish(prepared, &opts.trip_id).await
}

/// Call the trip counterpart.
pub async fn call(opts: CallOptions, config: &Config) -> Result<()> {
    let prepared = prepare(&opts, config).await?;
    let controller = prepared.controller.clone();
    let mut events = controller.subscribe();
    let mut presence = controller.presence();

    let local = controller
        .initiate_call()
        .await
        .context("Could not place the call")?;
    println!(
        "Calling {} with {} (Ctrl-C to hang up)...",
        controller.remote_user(),
        describe(&local)
    );

    let hang_up = hold(None);
    tokio::pin!(hang_up);

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    CallEvent::RemoteStream(_) | CallEvent::IncomingCall { .. } => {}
                    CallEvent::StateChanged(state) => {
                        tracing::info!("Call state: {}", state);
                        if state == NegotiationState::Connected {
                            println!("Connected");
                            hang_up.set(hold(opts.duration));
                        }
                    }
                    CallEvent::CallEnded(reason) => {
                        println!("Call ended ({:?})", reason);
                        break;
                    }
                }
            }
            Ok(()) = presence.changed() => {
                tracing::info!("{} on the trip call channel", *presence.borrow());
            }
            _ = &mut hang_up => {
                println!("Hanging up");
                controller.end_call().await;
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                println!("Interrupted");
                controller.end_call().await;
                break;
            }
        }
    }

    finish(prepared, &opts.trip_id).await
}
