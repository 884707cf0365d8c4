// Periodic unsolicited telemetry. Beacons are always sent unencoded so a
// ground station can hear the satellite before any ECC setting is agreed.

use tokio::sync::mpsc;
use tokio::time::{self, Duration};
use tracing::warn;

use link_protocol::{Clock, Packet, Ter};

use crate::config::Config;

pub fn spawn_beacon(cfg: Config, clock: Clock, tx_queue: mpsc::Sender<Packet>) {
    tokio::spawn(async move {
        let mut tick = time::interval(Duration::from_secs(cfg.beacon_secs));
        tick.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            let mut pkt = Packet::new(Ter::Beacon, false);
            match pkt.seal(clock.now_unix()) {
                Ok(()) => {
                    if tx_queue.try_send(pkt).is_err() {
                        warn!("TX queue full, beacon dropped");
                    }
                }
                Err(e) => warn!(%e, "beacon seal error"),
            }
        }
    });
}
