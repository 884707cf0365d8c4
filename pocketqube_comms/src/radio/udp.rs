// UDP-backed modem emulation: one datagram per air frame

use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};
use tracing::{debug, info, warn};

use super::{check_params, LoraParams, Radio, RadioError, RadioState};

/// Largest frame the emulated air interface will carry. The longest legal
/// RS-encoded packet is 160 bytes; anything bigger is link noise.
const AIR_MTU: usize = 512;

#[derive(Default)]
struct Shared {
    state: Mutex<RadioState>,
    last_frame: Mutex<Option<Vec<u8>>>,
}

/// Emulates the SX127x half-duplex behaviour over a connected UDP socket:
/// frames arriving while the modem is not listening are dropped on the
/// floor, and every RX/TX completion fires the notification exactly once.
pub struct UdpRadio {
    sock: Arc<UdpSocket>,
    events: Arc<Notify>,
    shared: Arc<Shared>,
    params: LoraParams,
    rx_task: Option<JoinHandle<()>>,
    rssi_dbm: f32,
    snr_db: f32,
    freq_error_hz: f32,
}

impl UdpRadio {
    pub async fn connect(bind: &str, peer: &str, events: Arc<Notify>) -> Result<Self, RadioError> {
        let sock = UdpSocket::bind(bind).await?;
        sock.connect(peer).await?;
        info!(local = %sock.local_addr()?, peer, "link socket up");
        Ok(Self {
            sock: Arc::new(sock),
            events,
            shared: Arc::new(Shared::default()),
            params: LoraParams::default(),
            rx_task: None,
            rssi_dbm: -94.6,
            snr_db: 8.2,
            freq_error_hz: 310.4,
        })
    }
}

impl Radio for UdpRadio {
    async fn begin(&mut self, params: &LoraParams) -> Result<(), RadioError> {
        check_params(params)?;
        self.params = *params;
        info!(
            freq_mhz = params.frequency_mhz,
            bw_khz = params.bandwidth_khz,
            sf = params.spreading_factor,
            cr = params.coding_rate,
            power_dbm = params.output_power_dbm,
            "modem configured"
        );

        if self.rx_task.is_none() {
            let sock = self.sock.clone();
            let shared = self.shared.clone();
            let events = self.events.clone();
            self.rx_task = Some(tokio::spawn(async move {
                let mut buf = vec![0u8; AIR_MTU];
                loop {
                    match sock.recv(&mut buf).await {
                        Ok(n) => {
                            let listening = *shared.state.lock().await == RadioState::Listening;
                            if listening {
                                *shared.last_frame.lock().await = Some(buf[..n].to_vec());
                                events.notify_one();
                            } else {
                                debug!(len = n, "frame dropped, modem not listening");
                            }
                        }
                        Err(e) => {
                            warn!(%e, "link receive error");
                            time::sleep(Duration::from_millis(10)).await;
                        }
                    }
                }
            }));
        }
        Ok(())
    }

    async fn start_receive(&mut self) -> Result<(), RadioError> {
        *self.shared.state.lock().await = RadioState::Listening;
        Ok(())
    }

    async fn start_transmit(&mut self, frame: &[u8]) -> Result<(), RadioError> {
        *self.shared.state.lock().await = RadioState::Transmitting;
        let sent = self.sock.send(frame).await;
        *self.shared.state.lock().await = RadioState::Idle;
        sent?;
        // transmission-complete interrupt
        self.events.notify_one();
        Ok(())
    }

    async fn read_data(&mut self) -> Result<Vec<u8>, RadioError> {
        self.shared
            .last_frame
            .lock()
            .await
            .take()
            .ok_or(RadioError::NoFrame)
    }

    fn set_frequency(&mut self, mhz: f32) -> Result<(), RadioError> {
        if !(400.0..=500.0).contains(&mhz) {
            return Err(RadioError::Range("frequency"));
        }
        self.params.frequency_mhz = mhz;
        Ok(())
    }

    fn set_bandwidth(&mut self, khz: f32) -> Result<(), RadioError> {
        if ![62.5, 125.0, 250.0, 500.0].contains(&khz) {
            return Err(RadioError::Range("bandwidth"));
        }
        self.params.bandwidth_khz = khz;
        Ok(())
    }

    fn set_spreading_factor(&mut self, sf: u8) -> Result<(), RadioError> {
        if !(6..=12).contains(&sf) {
            return Err(RadioError::Range("spreading factor"));
        }
        self.params.spreading_factor = sf;
        Ok(())
    }

    fn set_coding_rate(&mut self, cr: u8) -> Result<(), RadioError> {
        if !(5..=8).contains(&cr) {
            return Err(RadioError::Range("coding rate"));
        }
        self.params.coding_rate = cr;
        Ok(())
    }

    fn set_output_power(&mut self, dbm: i8) -> Result<(), RadioError> {
        if !(-4..=17).contains(&dbm) {
            return Err(RadioError::Range("output power"));
        }
        self.params.output_power_dbm = dbm;
        Ok(())
    }

    fn rssi(&self) -> f32 {
        self.rssi_dbm
    }

    fn snr(&self) -> f32 {
        self.snr_db
    }

    fn frequency_error(&self) -> f32 {
        self.freq_error_hz
    }
}

impl Drop for UdpRadio {
    fn drop(&mut self) {
        if let Some(task) = self.rx_task.take() {
            task.abort();
        }
    }
}
