// src/main.rs
mod beacon;
mod commands;
mod comms;
mod config;
mod errors;
mod events;
mod radio;
#[cfg(feature = "ground-station")]
mod serial;

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::Notify;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use link_protocol::Clock;

#[tokio::main]
async fn main() -> Result<()> {
    // -------- logging ----------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("pocketqube_comms=info".parse()?)
                .add_directive("link_protocol=info".parse()?),
        )
        .compact()
        .init();

    // -------- config + clock ----------
    let cfg = config::Cli::parse_and_build_config()?;
    let clock = Clock::new();
    info!(?cfg, "PocketQube COMMS starting");

    // -------- radio (interrupt line + UDP-emulated link) ----------
    let radio_events = Arc::new(Notify::new());
    let radio =
        radio::udp::UdpRadio::connect(&cfg.bind_addr, &cfg.peer_addr, radio_events.clone()).await?;

    // -------- collaborator stubs ----------
    let (collab, collab_events) = events::channels();
    spawn_collaborator_stubs(collab_events);

    // -------- COMMS task ----------
    #[cfg_attr(not(feature = "ground-station"), allow(unused_mut))]
    let mut comms = comms::Comms::new(cfg.clone(), radio, radio_events, clock.clone(), collab);

    #[cfg(feature = "ground-station")]
    comms.attach_serial(serial::spawn_stdin_reader());

    // beacon producer feeds the TX queue
    beacon::spawn_beacon(cfg, clock, comms.tx_queue());

    let comms_task = tokio::spawn(comms.run());

    // -------- graceful shutdown ----------
    tokio::select! {
        result = comms_task => match result {
            Ok(Err(e)) => return Err(e.into()),
            Ok(Ok(())) => {}
            Err(e) => warn!(?e, "COMMS task aborted"),
        },
        _ = tokio::signal::ctrl_c() => info!("shutdown signal received; exiting."),
    }
    Ok(())
}

/// Stand-ins for the OBC, EPS/ADCS and flash tasks: drain the collaborator
/// queues and log what the core emitted.
fn spawn_collaborator_stubs(collab_events: events::CollaboratorEvents) {
    let events::CollaboratorEvents {
        mut storage,
        mut obc,
        mut restart,
    } = collab_events;

    tokio::spawn(async move {
        while let Some(write) = storage.recv().await {
            info!(
                addr = format_args!("{:#07x}", write.addr),
                len = write.data.len(),
                data = %hex::encode(&write.data),
                "storage write request"
            );
        }
    });
    tokio::spawn(async move {
        while let Some(event) = obc.recv().await {
            info!(?event, "OBC notification");
        }
    });
    tokio::spawn(async move {
        while let Some(target) = restart.recv().await {
            warn!(?target, "restart request");
        }
    });
}
