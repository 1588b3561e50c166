use anyhow::Result;
use tokio::sync::oneshot;

use crate::{
    device::{DatapathId, DeviceContext},
    statistics::manager::{ManagedDeviceInfo, WorkMode},
};

pub enum ManagerCommand {
    DeviceConnected {
        device: DeviceContext,
        response: oneshot::Sender<Result<()>>,
    },
    DeviceDisconnected {
        datapath_id: DatapathId,
        response: oneshot::Sender<Result<()>>,
    },
    GetWorkMode {
        response: oneshot::Sender<WorkMode>,
    },
    ChangeWorkMode {
        mode: WorkMode,
        response: oneshot::Sender<Result<()>>,
    },
    GetDevices {
        response: oneshot::Sender<Vec<ManagedDeviceInfo>>,
    },
    GetDevice {
        datapath_id: DatapathId,
        response: oneshot::Sender<Option<ManagedDeviceInfo>>,
    },
    Close {
        response: oneshot::Sender<Result<()>>,
    },
    /// Sent by the manager to itself once the first round of a device resolved.
    InitialRoundFinished {
        datapath_id: DatapathId,
        session: u64,
        succeeded: bool,
    },
}
