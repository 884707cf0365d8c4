// Telecommand dispatcher: validates payloads, touches the modem/clock, and
// forwards everything that belongs to another subsystem.

use chrono::DateTime;
use tokio::time::Duration;
use tracing::info;

use link_protocol::{CommandCode, Packet, PacketError, Tec, Ter};

use crate::comms::timers::TimerClass;
use crate::comms::{Comms, TxState};
use crate::events::{ObcEvent, RestartTarget, StorageWrite};
use crate::radio::Radio;

/// Config-variable region in flash; VAR_CHANGE addresses are offsets here.
pub const VAR_CONFIG_ADDR: u32 = 0x0002_0000;
/// TLE storage. Chunks 1-3 land in the primary region, 4-5 in the secondary.
pub const TLE_PRIMARY_ADDR: u32 = 0x0004_0000;
pub const TLE_SECONDARY_ADDR: u32 = 0x0004_0100;
pub const TLE_CHUNK_BYTES: u32 = 28;
const TLE_CHUNKS: u8 = 5;

/// Every TEC acknowledges after execution except LORA_PING, which answers
/// with its own TER_LORA_LINK report.
pub fn ack_needed(tec: Tec) -> bool {
    tec != Tec::LoraPing
}

/// OBC_REBOOT tears down the task that would send the ACK, so its ACK goes
/// out on RX validation, before the command is handed to the CMD queue.
pub fn ack_needed_before(tec: Tec) -> bool {
    tec == Tec::ObcReboot
}

pub fn execute_tec<R: Radio>(comms: &mut Comms<R>, pkt: &Packet) -> Result<(), PacketError> {
    let tec = match pkt.command {
        CommandCode::Tec(tec) => tec,
        CommandCode::Ter(_) => return Err(PacketError::CmdPointer),
    };
    let payload = pkt.payload();
    match tec {
        Tec::ObcReboot => {
            expect_empty(payload)?;
            notify_restart(comms, RestartTarget::Obc)
        }
        Tec::ExitState => exec_exit_state(comms, payload),
        Tec::VarChange => exec_var_change(comms, payload),
        Tec::SetTime => exec_set_time(comms, payload),
        Tec::EpsReboot => {
            expect_empty(payload)?;
            notify_restart(comms, RestartTarget::Eps)
        }
        Tec::AdcsReboot => {
            expect_empty(payload)?;
            notify_restart(comms, RestartTarget::Adcs)
        }
        Tec::AdcsTle => exec_adcs_tle(comms, payload),
        Tec::LoraState => exec_lora_state(comms, pkt),
        Tec::LoraConfig => exec_lora_config(comms, payload),
        Tec::LoraPing => exec_lora_ping(comms),
        Tec::CryExp => exec_cry_exp(comms, pkt),
    }
}

fn expect_empty(payload: &[u8]) -> Result<(), PacketError> {
    if payload.is_empty() {
        Ok(())
    } else {
        Err(PacketError::CmdPayload)
    }
}

fn notify_restart<R: Radio>(
    comms: &mut Comms<R>,
    target: RestartTarget,
) -> Result<(), PacketError> {
    info!(?target, "restart requested");
    comms
        .collab
        .restart
        .try_send(target)
        .map_err(|_| PacketError::CmdMemory)
}

fn notify_obc<R: Radio>(comms: &mut Comms<R>, event: ObcEvent) -> Result<(), PacketError> {
    comms
        .collab
        .obc
        .try_send(event)
        .map_err(|_| PacketError::CmdMemory)
}

fn write_storage<R: Radio>(
    comms: &mut Comms<R>,
    addr: u32,
    data: &[u8],
) -> Result<(), PacketError> {
    comms
        .collab
        .storage
        .try_send(StorageWrite {
            addr,
            data: data.to_vec(),
        })
        .map_err(|_| PacketError::CmdMemory)
}

/// Payload: one flag byte, optionally duplicated as a second byte.
fn exec_exit_state<R: Radio>(comms: &mut Comms<R>, payload: &[u8]) -> Result<(), PacketError> {
    let flag = match payload {
        [flag] => *flag,
        [flag, copy] if copy == flag => *flag,
        _ => return Err(PacketError::CmdPayload),
    };
    let event = match flag {
        0x01 => ObcEvent::ExitContingency,
        0x02 => ObcEvent::ExitSunsafe,
        0x04 => ObcEvent::ExitSurvival,
        _ => return Err(PacketError::CmdPayload),
    };
    info!(?event, "state exit requested");
    notify_obc(comms, event)
}

/// Payload: variable address followed by at least one value byte.
fn exec_var_change<R: Radio>(comms: &mut Comms<R>, payload: &[u8]) -> Result<(), PacketError> {
    let (&addr, values) = payload.split_first().ok_or(PacketError::CmdPayload)?;
    if values.is_empty() {
        return Err(PacketError::CmdPayload);
    }
    info!(addr, len = values.len(), "configuration variable update");
    write_storage(comms, VAR_CONFIG_ADDR + addr as u32, values)?;
    notify_obc(comms, ObcEvent::CalibrationUpdated)
}

fn exec_set_time<R: Radio>(comms: &mut Comms<R>, payload: &[u8]) -> Result<(), PacketError> {
    let bytes: [u8; 4] = payload.try_into().map_err(|_| PacketError::CmdPayload)?;
    let t = u32::from_be_bytes(bytes);
    comms.clock.set_unix(t);
    match DateTime::from_timestamp(comms.clock.now_unix() as i64, 0) {
        Some(ts) => info!(unix = t, now = %ts, "clock set"),
        None => info!(unix = t, "clock set"),
    }
    Ok(())
}

/// Payload: chunk index 1..=5 followed by up to 28 bytes of TLE data.
fn exec_adcs_tle<R: Radio>(comms: &mut Comms<R>, payload: &[u8]) -> Result<(), PacketError> {
    let (&index, data) = payload.split_first().ok_or(PacketError::CmdPayload)?;
    if index == 0 || index > TLE_CHUNKS || data.is_empty() || data.len() as u32 > TLE_CHUNK_BYTES {
        return Err(PacketError::CmdPayload);
    }
    let addr = if index <= 3 {
        TLE_PRIMARY_ADDR + (index - 1) as u32 * TLE_CHUNK_BYTES
    } else {
        TLE_SECONDARY_ADDR + (index - 4) as u32 * TLE_CHUNK_BYTES
    };
    info!(index, addr = format_args!("{addr:#07x}"), len = data.len(), "TLE chunk stored");
    write_storage(comms, addr, data)?;
    if index == TLE_CHUNKS {
        notify_obc(comms, ObcEvent::TleUpdated)?;
    }
    Ok(())
}

/// Payload byte 0 carries the new tx_state twice (one copy per nibble);
/// bytes 1..3 are a big-endian hold duration in seconds, after which a
/// self-command restores TX_ON.
fn exec_lora_state<R: Radio>(comms: &mut Comms<R>, pkt: &Packet) -> Result<(), PacketError> {
    let &[state_byte, d0, d1, d2] = pkt.payload() else {
        return Err(PacketError::CmdPayload);
    };
    if state_byte >> 4 != state_byte & 0x0F {
        return Err(PacketError::CmdPayload);
    }
    let state = TxState::from_code(state_byte & 0x0F).ok_or(PacketError::CmdPayload)?;
    let duration_s = u32::from_be_bytes([0, d0, d1, d2]);

    comms.tx_state = state;
    info!(?state, duration_s, "tx_state changed");

    comms.timers.cancel(TimerClass::LoraState);
    if duration_s > 0 {
        let mut restore = pkt.clone();
        restore.set_payload(&[0x11, 0, 0, 0])?; // TX_ON, no further hold
        comms.timers.schedule(
            TimerClass::LoraState,
            Duration::from_secs(duration_s as u64),
            restore,
            comms.cmd_send.clone(),
        );
    }
    Ok(())
}

/// Payload: 24-bit frequency in kHz, then BW(2) SF(3) CR(3), then
/// power(5) + 3 reserved bits. All fields are validated before the first
/// setter runs so a bad payload leaves the modem untouched.
fn exec_lora_config<R: Radio>(comms: &mut Comms<R>, payload: &[u8]) -> Result<(), PacketError> {
    let &[f0, f1, f2, mode, power_byte] = payload else {
        return Err(PacketError::CmdPayload);
    };
    let freq_khz = u32::from_be_bytes([0, f0, f1, f2]);
    let freq_mhz = freq_khz as f32 / 1000.0;
    let bandwidth_khz = match mode >> 6 {
        0 => 62.5,
        1 => 125.0,
        2 => 250.0,
        _ => 500.0,
    };
    let sf = ((mode >> 3) & 0x07) + 6;
    let cr = (mode & 0x07) + 5;
    let power_dbm = (power_byte >> 3) as i8 - 9;

    if !(400.0..=500.0).contains(&freq_mhz) || sf > 12 || cr > 8 || !(-4..=17).contains(&power_dbm)
    {
        return Err(PacketError::CmdPayload);
    }

    comms.radio.set_frequency(freq_mhz).map_err(|_| PacketError::CmdPayload)?;
    comms.radio.set_bandwidth(bandwidth_khz).map_err(|_| PacketError::CmdPayload)?;
    comms.radio.set_spreading_factor(sf).map_err(|_| PacketError::CmdPayload)?;
    comms.radio.set_coding_rate(cr).map_err(|_| PacketError::CmdPayload)?;
    comms.radio.set_output_power(power_dbm).map_err(|_| PacketError::CmdPayload)?;
    info!(freq_mhz, bandwidth_khz, sf, cr, power_dbm, "modem reconfigured");
    Ok(())
}

/// Answers with a TER_LORA_LINK report instead of an ACK: RSSI, SNR and
/// frequency error as three big-endian IEEE-754 floats.
fn exec_lora_ping<R: Radio>(comms: &mut Comms<R>) -> Result<(), PacketError> {
    let rssi = comms.radio.rssi();
    let snr = comms.radio.snr();
    let frequency_error = comms.radio.frequency_error();

    let mut payload = Vec::with_capacity(12);
    payload.extend_from_slice(&rssi.to_be_bytes());
    payload.extend_from_slice(&snr.to_be_bytes());
    payload.extend_from_slice(&frequency_error.to_be_bytes());

    let mut reply = Packet::new(Ter::LoraLink, comms.rs_enabled);
    reply.set_payload(&payload)?;
    reply.seal(comms.clock.now_unix())?;
    info!(rssi, snr, frequency_error, "link report queued");
    comms.enqueue_tx(reply);
    Ok(())
}

/// Payload: one 48-bit big-endian field — glass(6, two 3-bit copies) ‖
/// activation_delay(18) ‖ diode(3) ‖ picture(3) ‖ acquisition_delay(18).
/// A non-zero activation delay re-queues the command to ourselves with
/// both delay fields cleared.
fn exec_cry_exp<R: Radio>(comms: &mut Comms<R>, pkt: &Packet) -> Result<(), PacketError> {
    let payload = pkt.payload();
    if payload.len() != 6 {
        return Err(PacketError::CmdPayload);
    }
    let mut word = [0u8; 8];
    word[2..].copy_from_slice(payload);
    let v = u64::from_be_bytes(word);

    let glass = ((v >> 42) & 0x3F) as u8;
    if glass >> 3 != glass & 0x07 {
        return Err(PacketError::CmdPayload);
    }
    let activation_delay = ((v >> 24) & 0x3FFFF) as u32;
    let diode = ((v >> 21) & 0x07) as u8;
    let picture = ((v >> 18) & 0x07) as u8;
    let acquisition_delay = (v & 0x3FFFF) as u32;

    comms.timers.cancel(TimerClass::CryExp);
    if activation_delay > 0 {
        let cleared = v & !(0x3FFFF << 24) & !0x3FFFF;
        let mut deferred = pkt.clone();
        deferred.set_payload(&cleared.to_be_bytes()[2..])?;
        comms.timers.schedule(
            TimerClass::CryExp,
            Duration::from_secs(activation_delay as u64),
            deferred,
            comms.cmd_send.clone(),
        );
        info!(activation_delay, "crystal experiment deferred");
        return Ok(());
    }

    info!(glass = glass & 0x07, diode, picture, acquisition_delay, "crystal experiment armed");
    notify_obc(
        comms,
        ObcEvent::TakePhoto {
            glass: glass & 0x07,
            diode,
            picture,
            acquisition_delay_s: acquisition_delay,
        },
    )
}

// ================================ Tests =====================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comms::test_comms;
    use crate::radio::mock::Setting;
    use link_protocol::EPOCH_UNIX;
    use tokio::time;

    fn tec_packet(tec: Tec, payload: &[u8]) -> Packet {
        let mut pkt = Packet::new(tec, false);
        pkt.set_payload(payload).expect("payload fits");
        pkt.seal(EPOCH_UNIX).expect("seal");
        pkt
    }

    #[tokio::test]
    async fn set_time_rejects_short_payload() {
        let (mut comms, _events) = test_comms();
        let pkt = tec_packet(Tec::SetTime, &[0, 0, 1]);
        assert_eq!(execute_tec(&mut comms, &pkt), Err(PacketError::CmdPayload));
    }

    #[tokio::test]
    async fn reboot_commands_require_empty_payload() {
        let (mut comms, mut events) = test_comms();
        let pkt = tec_packet(Tec::EpsReboot, &[1]);
        assert_eq!(execute_tec(&mut comms, &pkt), Err(PacketError::CmdPayload));

        let pkt = tec_packet(Tec::AdcsReboot, &[]);
        assert_eq!(execute_tec(&mut comms, &pkt), Ok(()));
        assert_eq!(events.restart.try_recv().expect("restart"), RestartTarget::Adcs);
    }

    #[tokio::test]
    async fn exit_state_maps_flags_to_events() {
        let (mut comms, mut events) = test_comms();
        for (flag, event) in [
            (0x01, ObcEvent::ExitContingency),
            (0x02, ObcEvent::ExitSunsafe),
            (0x04, ObcEvent::ExitSurvival),
        ] {
            let pkt = tec_packet(Tec::ExitState, &[flag, flag]);
            assert_eq!(execute_tec(&mut comms, &pkt), Ok(()));
            assert_eq!(events.obc.try_recv().expect("event"), event);
        }

        let pkt = tec_packet(Tec::ExitState, &[0x01, 0x02]);
        assert_eq!(execute_tec(&mut comms, &pkt), Err(PacketError::CmdPayload));
        let pkt = tec_packet(Tec::ExitState, &[0x03]);
        assert_eq!(execute_tec(&mut comms, &pkt), Err(PacketError::CmdPayload));
    }

    #[tokio::test]
    async fn var_change_writes_config_region() {
        let (mut comms, mut events) = test_comms();
        let pkt = tec_packet(Tec::VarChange, &[0x10, 0xAB, 0xCD]);
        assert_eq!(execute_tec(&mut comms, &pkt), Ok(()));
        let write = events.storage.try_recv().expect("storage write");
        assert_eq!(write.addr, VAR_CONFIG_ADDR + 0x10);
        assert_eq!(write.data, vec![0xAB, 0xCD]);
        assert_eq!(events.obc.try_recv().expect("event"), ObcEvent::CalibrationUpdated);

        let pkt = tec_packet(Tec::VarChange, &[0x10]);
        assert_eq!(execute_tec(&mut comms, &pkt), Err(PacketError::CmdPayload));
    }

    #[tokio::test]
    async fn tle_chunks_route_to_both_regions() {
        let (mut comms, mut events) = test_comms();
        let line = [0x41u8; 28];

        let mut payload = vec![1u8];
        payload.extend_from_slice(&line);
        assert_eq!(execute_tec(&mut comms, &tec_packet(Tec::AdcsTle, &payload)), Ok(()));
        assert_eq!(events.storage.try_recv().expect("write").addr, TLE_PRIMARY_ADDR);

        payload[0] = 4;
        assert_eq!(execute_tec(&mut comms, &tec_packet(Tec::AdcsTle, &payload)), Ok(()));
        assert_eq!(events.storage.try_recv().expect("write").addr, TLE_SECONDARY_ADDR);
        assert!(events.obc.try_recv().is_err(), "no update notice yet");

        payload[0] = 5;
        assert_eq!(execute_tec(&mut comms, &tec_packet(Tec::AdcsTle, &payload)), Ok(()));
        assert_eq!(
            events.storage.try_recv().expect("write").addr,
            TLE_SECONDARY_ADDR + TLE_CHUNK_BYTES
        );
        assert_eq!(events.obc.try_recv().expect("event"), ObcEvent::TleUpdated);

        payload[0] = 6;
        assert_eq!(
            execute_tec(&mut comms, &tec_packet(Tec::AdcsTle, &payload)),
            Err(PacketError::CmdPayload)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn lora_state_holds_then_restores() {
        let (mut comms, _events) = test_comms();
        // OFF for 10 seconds
        let pkt = tec_packet(Tec::LoraState, &[0x00, 0, 0, 10]);
        assert_eq!(execute_tec(&mut comms, &pkt), Ok(()));
        assert_eq!(comms.tx_state, TxState::Off);

        time::sleep(Duration::from_secs(9)).await;
        assert!(comms.try_next_cmd().is_none(), "nothing queued before the deadline");

        time::sleep(Duration::from_secs(2)).await;
        // the self-command is waiting; execute it like the CMD state would
        let queued = comms.try_next_cmd().expect("restore command queued");
        assert_eq!(queued.command, CommandCode::Tec(Tec::LoraState));
        assert_eq!(queued.payload(), &[0x11, 0, 0, 0]);
        assert_eq!(execute_tec(&mut comms, &queued), Ok(()));
        assert_eq!(comms.tx_state, TxState::On);
    }

    #[tokio::test(start_paused = true)]
    async fn lora_state_reissue_cancels_previous_timer() {
        let (mut comms, _events) = test_comms();
        let pkt = tec_packet(Tec::LoraState, &[0x00, 0, 0, 10]);
        assert_eq!(execute_tec(&mut comms, &pkt), Ok(()));

        time::sleep(Duration::from_secs(5)).await;
        // NOBEACON for 3 more seconds; the 10 s timer must die
        let pkt = tec_packet(Tec::LoraState, &[0x22, 0, 0, 3]);
        assert_eq!(execute_tec(&mut comms, &pkt), Ok(()));
        assert_eq!(comms.tx_state, TxState::NoBeacon);

        time::sleep(Duration::from_secs(4)).await;
        let queued = comms.try_next_cmd().expect("exactly one restore command");
        assert_eq!(queued.payload(), &[0x11, 0, 0, 0]);
        assert!(comms.try_next_cmd().is_none(), "old timer must not fire");

        time::sleep(Duration::from_secs(10)).await;
        assert!(comms.try_next_cmd().is_none(), "cancelled timer stays dead");
    }

    #[tokio::test]
    async fn lora_state_rejects_mismatched_nibbles() {
        let (mut comms, _events) = test_comms();
        let pkt = tec_packet(Tec::LoraState, &[0x01, 0, 0, 0]);
        assert_eq!(execute_tec(&mut comms, &pkt), Err(PacketError::CmdPayload));
        let pkt = tec_packet(Tec::LoraState, &[0x33, 0, 0, 0]); // 3 is not a tx_state
        assert_eq!(execute_tec(&mut comms, &pkt), Err(PacketError::CmdPayload));
    }

    #[tokio::test]
    async fn lora_config_applies_all_fields_in_order() {
        let (mut comms, _events) = test_comms();
        // 434.5 MHz, BW code 1 (125 kHz), SF code 4 (SF10), CR code 3 (4/8),
        // power field 19 (10 dBm)
        let freq = 434_500u32.to_be_bytes();
        let mode = (1 << 6) | (4 << 3) | 3;
        let power = 19u8 << 3;
        let pkt = tec_packet(Tec::LoraConfig, &[freq[1], freq[2], freq[3], mode, power]);
        assert_eq!(execute_tec(&mut comms, &pkt), Ok(()));
        assert_eq!(
            comms.radio.settings,
            vec![
                Setting::Frequency(434.5),
                Setting::Bandwidth(125.0),
                Setting::SpreadingFactor(10),
                Setting::CodingRate(8),
                Setting::OutputPower(10),
            ]
        );
    }

    #[tokio::test]
    async fn lora_config_validates_before_touching_the_modem() {
        let (mut comms, _events) = test_comms();
        // frequency below 400 MHz must abort before any setter call
        let freq = 399_000u32.to_be_bytes();
        let pkt = tec_packet(Tec::LoraConfig, &[freq[1], freq[2], freq[3], 1 << 6, 19 << 3]);
        assert_eq!(execute_tec(&mut comms, &pkt), Err(PacketError::CmdPayload));
        assert!(comms.radio.settings.is_empty());

        // power field 0 → -9 dBm, below the -4 dBm floor
        let freq = 436_000u32.to_be_bytes();
        let pkt = tec_packet(Tec::LoraConfig, &[freq[1], freq[2], freq[3], 1 << 6, 0]);
        assert_eq!(execute_tec(&mut comms, &pkt), Err(PacketError::CmdPayload));
        assert!(comms.radio.settings.is_empty());
    }

    #[tokio::test]
    async fn lora_ping_queues_link_report() {
        let (mut comms, _events) = test_comms();
        assert!(!ack_needed(Tec::LoraPing));
        assert_eq!(execute_tec(&mut comms, &tec_packet(Tec::LoraPing, &[])), Ok(()));

        let reply = comms.try_next_tx().expect("link report queued");
        assert_eq!(reply.command, CommandCode::Ter(Ter::LoraLink));
        let payload = reply.payload();
        assert_eq!(payload.len(), 12);
        assert_eq!(
            f32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]),
            comms.radio.rssi_dbm
        );
        assert_eq!(
            f32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]),
            comms.radio.snr_db
        );
        assert_eq!(
            f32::from_be_bytes([payload[8], payload[9], payload[10], payload[11]]),
            comms.radio.freq_error_hz
        );
    }

    #[tokio::test]
    async fn cry_exp_rejects_glass_mismatch() {
        let (mut comms, _events) = test_comms();
        // halves 0b101 and 0b011 disagree
        let word: u64 = 0b101_011 << 42;
        let pkt = tec_packet(Tec::CryExp, &word.to_be_bytes()[2..]);
        assert_eq!(execute_tec(&mut comms, &pkt), Err(PacketError::CmdPayload));
    }

    #[tokio::test]
    async fn cry_exp_immediate_takes_photo() {
        let (mut comms, mut events) = test_comms();
        let word: u64 = (0b010_010u64 << 42) | (0b011u64 << 21) | (0b101u64 << 18) | 600;
        let pkt = tec_packet(Tec::CryExp, &word.to_be_bytes()[2..]);
        assert_eq!(execute_tec(&mut comms, &pkt), Ok(()));
        assert_eq!(
            events.obc.try_recv().expect("event"),
            ObcEvent::TakePhoto {
                glass: 0b010,
                diode: 0b011,
                picture: 0b101,
                acquisition_delay_s: 600,
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cry_exp_with_activation_delay_defers_itself() {
        let (mut comms, _events) = test_comms();
        let word: u64 = (0b001_001u64 << 42) | (120u64 << 24) | (0b010u64 << 21) | 900;
        let pkt = tec_packet(Tec::CryExp, &word.to_be_bytes()[2..]);
        assert_eq!(execute_tec(&mut comms, &pkt), Ok(()));
        assert!(comms.try_next_cmd().is_none());

        time::sleep(Duration::from_secs(121)).await;
        let deferred = comms.try_next_cmd().expect("deferred command queued");
        let payload = deferred.payload();
        let mut word = [0u8; 8];
        word[2..].copy_from_slice(payload);
        let v = u64::from_be_bytes(word);
        assert_eq!((v >> 24) & 0x3FFFF, 0, "activation delay cleared");
        assert_eq!(v & 0x3FFFF, 0, "acquisition delay cleared");
        assert_eq!((v >> 42) & 0x3F, 0b001_001, "glass state preserved");
    }

    #[tokio::test]
    async fn executing_a_ter_is_a_pointer_error() {
        let (mut comms, _events) = test_comms();
        let mut pkt = Packet::new(Ter::Beacon, false);
        pkt.seal(EPOCH_UNIX).expect("seal");
        assert_eq!(execute_tec(&mut comms, &pkt), Err(PacketError::CmdPointer));
    }
}
