// Emit-only interfaces to the external subsystems (OBC, EPS/ADCS, flash).
// The COMMS core only enqueues; draining is the collaborator's problem.

use tokio::sync::mpsc;

pub const EVENT_QUEUE_DEPTH: usize = 16;

/// Notifications the OBC task consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObcEvent {
    ExitContingency,
    ExitSunsafe,
    ExitSurvival,
    TleUpdated,
    CalibrationUpdated,
    TakePhoto {
        glass: u8,
        diode: u8,
        picture: u8,
        acquisition_delay_s: u32,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartTarget {
    Obc,
    Eps,
    Adcs,
}

/// A write request for the persistent storage task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageWrite {
    pub addr: u32,
    pub data: Vec<u8>,
}

/// Sender half, owned by the COMMS task.
pub struct Collaborators {
    pub storage: mpsc::Sender<StorageWrite>,
    pub obc: mpsc::Sender<ObcEvent>,
    pub restart: mpsc::Sender<RestartTarget>,
}

/// Receiver half, handed to whatever stands in for the collaborators.
pub struct CollaboratorEvents {
    pub storage: mpsc::Receiver<StorageWrite>,
    pub obc: mpsc::Receiver<ObcEvent>,
    pub restart: mpsc::Receiver<RestartTarget>,
}

pub fn channels() -> (Collaborators, CollaboratorEvents) {
    let (storage_tx, storage_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
    let (obc_tx, obc_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
    let (restart_tx, restart_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
    (
        Collaborators {
            storage: storage_tx,
            obc: obc_tx,
            restart: restart_tx,
        },
        CollaboratorEvents {
            storage: storage_rx,
            obc: obc_rx,
            restart: restart_rx,
        },
    )
}
