// COMMS task: arbitrates the single half-duplex radio between receive,
// transmit and command execution. All mutable link state lives on this
// struct and is touched only by the task itself.

pub mod timers;

use std::sync::Arc;

use tokio::sync::{mpsc, Notify};
use tokio::time::{self, Duration};
use tracing::{debug, error, info, warn};

use link_protocol::{
    fec, Clock, CommandCode, DecodeFailure, Packet, PacketError, Tec, Ter,
};

use crate::commands;
use crate::config::Config;
use crate::errors::CommsError;
use crate::events::Collaborators;
use crate::radio::Radio;
use timers::DeferredTimers;

pub const TX_QUEUE_SIZE: usize = 6;
pub const CMD_QUEUE_SIZE: usize = 2;
/// How long IDLE listens before re-checking the queues.
pub const IDLE_TIMEOUT: Duration = Duration::from_millis(500);
#[cfg(feature = "ground-station")]
const SERIAL_THROTTLE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommsState {
    Idle,
    Tx,
    Rx,
    Cmd,
    #[cfg(feature = "ground-station")]
    Serial,
    Error,
}

/// Downlink gate. Uplinked via TEC_LORA_STATE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TxState {
    Off = 0x00,
    On = 0x01,
    NoBeacon = 0x02,
}

impl TxState {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x00 => Some(Self::Off),
            0x01 => Some(Self::On),
            0x02 => Some(Self::NoBeacon),
            _ => None,
        }
    }
}

pub struct Comms<R: Radio> {
    cfg: Config,
    pub(crate) radio: R,
    radio_events: Arc<Notify>,
    pub(crate) clock: Clock,
    pub(crate) collab: Collaborators,
    pub(crate) tx_state: TxState,
    pub(crate) rs_enabled: bool,
    state: CommsState,
    tx_send: mpsc::Sender<Packet>,
    tx_recv: mpsc::Receiver<Packet>,
    pub(crate) cmd_send: mpsc::Sender<Packet>,
    cmd_recv: mpsc::Receiver<Packet>,
    pub(crate) timers: DeferredTimers,
    #[cfg(feature = "ground-station")]
    serial: Option<mpsc::Receiver<String>>,
}

impl<R: Radio> Comms<R> {
    pub fn new(
        cfg: Config,
        radio: R,
        radio_events: Arc<Notify>,
        clock: Clock,
        collab: Collaborators,
    ) -> Self {
        let (tx_send, tx_recv) = mpsc::channel(TX_QUEUE_SIZE);
        let (cmd_send, cmd_recv) = mpsc::channel(CMD_QUEUE_SIZE);
        Self {
            cfg,
            radio,
            radio_events,
            clock,
            collab,
            tx_state: TxState::On,
            rs_enabled: false,
            state: CommsState::Idle,
            tx_send,
            tx_recv,
            cmd_send,
            cmd_recv,
            timers: DeferredTimers::default(),
            #[cfg(feature = "ground-station")]
            serial: None,
        }
    }

    /// Handle for producers (beacon task, ground tooling) to enqueue
    /// sealed downlink packets.
    pub fn tx_queue(&self) -> mpsc::Sender<Packet> {
        self.tx_send.clone()
    }

    #[cfg(feature = "ground-station")]
    pub fn attach_serial(&mut self, lines: mpsc::Receiver<String>) {
        self.serial = Some(lines);
    }

    /// The task body. Returns only on a fatal radio bring-up failure.
    pub async fn run(mut self) -> Result<(), CommsError> {
        info!("COMMS task starting");
        if let Err(e) = self.radio.begin(&self.cfg.lora).await {
            error!(%e, "radio initialization failed, COMMS halted");
            return Err(e.into());
        }

        loop {
            match self.state {
                CommsState::Idle => self.on_idle().await,
                CommsState::Rx => self.on_rx().await,
                CommsState::Tx => self.on_tx().await,
                CommsState::Cmd => self.on_cmd().await,
                #[cfg(feature = "ground-station")]
                CommsState::Serial => self.on_serial().await,
                CommsState::Error => {
                    // recovery sink, also catches radio faults
                    warn!("COMMS error state, resetting to IDLE");
                    self.state = CommsState::Idle;
                }
            }
        }
    }

    /// Priority order: pending TX, pending commands, operator input, then
    /// listen for one idle window.
    async fn on_idle(&mut self) {
        let mut listening = false;
        loop {
            if !self.tx_recv.is_empty() {
                self.state = CommsState::Tx;
                return;
            }
            if !self.cmd_recv.is_empty() {
                self.state = CommsState::Cmd;
                return;
            }
            #[cfg(feature = "ground-station")]
            if self.serial.as_ref().is_some_and(|lines| !lines.is_empty()) {
                self.state = CommsState::Serial;
                return;
            }
            if !listening {
                if let Err(e) = self.radio.start_receive().await {
                    warn!(%e, "startReceive failed");
                }
                listening = true;
            }
            if time::timeout(IDLE_TIMEOUT, self.radio_events.notified())
                .await
                .is_ok()
            {
                self.state = CommsState::Rx;
                return;
            }
        }
    }

    /// Single-frame reception: RS-decode when the frame looks encoded,
    /// parse, hand validated telecommands to the CMD queue.
    async fn on_rx(&mut self) {
        self.state = CommsState::Idle;

        let frame = match self.radio.read_data().await {
            Ok(frame) => frame,
            Err(e) => {
                warn!(%e, "readData failed");
                self.state = CommsState::Error;
                return;
            }
        };
        debug!(len = frame.len(), data = %hex::encode(&frame), "frame received");

        let (bytes, rs_failed) = if fec::is_ecc_frame(&frame) {
            match fec::decode(&frame) {
                Ok(decoded) => (decoded, false),
                Err(failure) => (failure.data, true),
            }
        } else {
            (frame, false)
        };

        let parsed = if rs_failed {
            Err(DecodeFailure::peek(PacketError::Decode, &bytes))
        } else {
            Packet::from_bytes(&bytes)
        };

        match parsed {
            Ok(pkt) => match pkt.command {
                CommandCode::Tec(tec) => {
                    // the ground's ECC choice governs our replies from now on
                    self.rs_enabled = pkt.ecc;
                    let ecc = pkt.ecc;
                    info!(?tec, time_unix = pkt.time_unix, "telecommand received");
                    match self.cmd_send.try_send(pkt) {
                        Ok(()) => {
                            if commands::ack_needed_before(tec) {
                                self.enqueue_ack(tec);
                            }
                        }
                        Err(_) => {
                            warn!(?tec, "CMD queue full, telecommand dropped");
                            self.enqueue_nack(tec.code(), PacketError::CmdFull, Some(ecc));
                        }
                    }
                }
                CommandCode::Ter(ter) => {
                    debug!(?ter, "telemetry frame on the uplink, ignored");
                }
            },
            Err(failure) => {
                warn!(error = ?failure.error, command = failure.command, "frame rejected");
                // NACK anything that was plausibly a telecommand; echoes of
                // our own downlink codes are not worth answering
                if let Some(command) = failure.command {
                    if Ter::from_code(command).is_none() {
                        self.enqueue_nack(command, failure.error, failure.ecc);
                    }
                }
            }
        }
    }

    /// Drain the TX queue, one frame on the air at a time.
    async fn on_tx(&mut self) {
        while let Ok(pkt) = self.tx_recv.try_recv() {
            if self.tx_state == TxState::Off {
                debug!(command = ?pkt.command, "tx_state OFF, frame dropped");
                continue;
            }
            if self.tx_state == TxState::NoBeacon && pkt.command == CommandCode::Ter(Ter::Beacon) {
                debug!("tx_state NOBEACON, beacon suppressed");
                continue;
            }
            let mut frame = pkt.to_bytes();
            if self.rs_enabled && pkt.ecc {
                frame = fec::encode(&frame);
            }
            debug!(len = frame.len(), data = %hex::encode(&frame), "transmitting");
            if let Err(e) = self.radio.start_transmit(&frame).await {
                warn!(%e, "startTransmit failed");
                continue;
            }
            // the driver is trusted to always complete a transmission
            self.radio_events.notified().await;
        }
        self.state = CommsState::Idle;
    }

    /// Drain the CMD queue, acknowledging per policy.
    async fn on_cmd(&mut self) {
        while let Ok(pkt) = self.cmd_recv.try_recv() {
            let tec = match pkt.command {
                CommandCode::Tec(tec) => tec,
                CommandCode::Ter(_) => {
                    warn!(code = PacketError::CmdPointer.code(), "non-TEC packet in CMD queue");
                    continue;
                }
            };
            match commands::execute_tec(self, &pkt) {
                Ok(()) => {
                    info!(?tec, "telecommand executed");
                    if commands::ack_needed(tec) && !commands::ack_needed_before(tec) {
                        self.enqueue_ack(tec);
                    }
                }
                Err(e) => {
                    warn!(?tec, error = ?e, code = e.code(), "telecommand failed");
                    self.enqueue_nack(tec.code(), e, Some(pkt.ecc));
                }
            }
        }
        self.state = CommsState::Idle;
    }

    /// Operator input: buffer hex-encoded frame lines, commit on `go`,
    /// drop on `end`. Ground-station builds only.
    #[cfg(feature = "ground-station")]
    async fn on_serial(&mut self) {
        self.state = CommsState::Idle;
        let Some(lines) = self.serial.as_mut() else {
            return;
        };
        let mut staged: Vec<String> = Vec::new();
        loop {
            time::sleep(SERIAL_THROTTLE).await;
            let Some(line) = lines.recv().await else {
                return; // input closed
            };
            let token = line.trim();
            if token.eq_ignore_ascii_case("go") {
                info!(frames = staged.len(), "committing staged frames");
                for hex_line in staged.drain(..) {
                    let Ok(raw) = hex::decode(&hex_line) else {
                        warn!("staged line is not valid hex, skipped");
                        continue;
                    };
                    match Packet::from_bytes(&raw) {
                        Ok(pkt) => self.enqueue_tx(pkt),
                        Err(failure) => {
                            warn!(error = ?failure.error, "staged frame invalid, skipped");
                        }
                    }
                }
                return;
            }
            if token.eq_ignore_ascii_case("end") {
                info!("staged frames discarded");
                return;
            }
            if staged.len() < CMD_QUEUE_SIZE {
                staged.push(token.to_string());
            } else {
                warn!("staging buffer full, line dropped");
            }
        }
    }

    /// Non-blocking TX enqueue; overflow drops the newest frame.
    pub(crate) fn enqueue_tx(&mut self, pkt: Packet) {
        if self.tx_send.try_send(pkt).is_err() {
            warn!(code = PacketError::CmdFull.code(), "TX queue full, frame dropped");
        }
    }

    fn enqueue_ack(&mut self, tec: Tec) {
        let mut ack = Packet::new(Ter::Ack, self.rs_enabled);
        if ack.set_payload(&[tec.code()]).is_err() {
            return;
        }
        match ack.seal(self.clock.now_unix()) {
            Ok(()) => self.enqueue_tx(ack),
            Err(e) => warn!(%e, "ACK seal failed"),
        }
    }

    /// NACK with the offending packet's ECC setting when it is known.
    fn enqueue_nack(&mut self, command: u8, error: PacketError, ecc: Option<bool>) {
        let mut nack = Packet::new(Ter::Nack, ecc.unwrap_or(self.rs_enabled));
        if nack.set_payload(&[command, error.code() as u8]).is_err() {
            return;
        }
        match nack.seal(self.clock.now_unix()) {
            Ok(()) => self.enqueue_tx(nack),
            Err(e) => warn!(%e, "NACK seal failed"),
        }
    }
}

// ================================ Tests =====================================

#[cfg(test)]
impl<R: Radio> Comms<R> {
    pub(crate) fn try_next_cmd(&mut self) -> Option<Packet> {
        self.cmd_recv.try_recv().ok()
    }

    pub(crate) fn try_next_tx(&mut self) -> Option<Packet> {
        self.tx_recv.try_recv().ok()
    }
}

#[cfg(test)]
pub(crate) fn test_comms() -> (Comms<crate::radio::mock::MockRadio>, crate::events::CollaboratorEvents) {
    let events = Arc::new(Notify::new());
    let radio = crate::radio::mock::MockRadio::new(events.clone());
    let (collab, collab_events) = crate::events::channels();
    let comms = Comms::new(Config::default(), radio, events, Clock::new(), collab);
    (comms, collab_events)
}
