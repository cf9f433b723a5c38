use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};

use super::{Object, ObjectType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub enum DriveStatus {
    Down,
    Up,
    Mounting,
    Transferring,
    Unloading,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub enum MountType {
    NoMount,
    ArchiveForUser,
    ArchiveForRepack,
    Retrieve,
    Label,
}

/// Last reported state of one tape drive.
#[derive(Debug, Clone, PartialEq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub struct DriveState {
    pub drive_name: String,
    pub host: String,
    pub logical_library: String,
    pub status: DriveStatus,
    pub mount_type: MountType,
    /// Tape currently mounted, empty when none.
    pub vid: String,
    pub tape_pool: String,
    pub session_id: u64,
    pub bytes_transferred: u64,
    pub files_transferred: u64,
    pub latest_bandwidth: f64,
    pub session_start_time: i64,
    pub mount_start_time: i64,
    pub transfer_start_time: i64,
    pub unload_start_time: i64,
    pub last_update_time: i64,
    pub desired_up: bool,
    pub desired_force_down: bool,
}

impl DriveState {
    /// A drive just registered: down, nothing mounted.
    pub fn new(drive_name: &str, host: &str, logical_library: &str) -> Self {
        Self {
            drive_name: drive_name.to_string(),
            host: host.to_string(),
            logical_library: logical_library.to_string(),
            status: DriveStatus::Down,
            mount_type: MountType::NoMount,
            vid: String::new(),
            tape_pool: String::new(),
            session_id: 0,
            bytes_transferred: 0,
            files_transferred: 0,
            latest_bandwidth: 0.0,
            session_start_time: 0,
            mount_start_time: 0,
            transfer_start_time: 0,
            unload_start_time: 0,
            last_update_time: 0,
            desired_up: false,
            desired_force_down: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub struct DriveRegisterData {
    pub drives: Vec<DriveState>,
}

object_payload!(DriveRegisterData, ObjectType::DriveRegister);

pub type DriveRegister = Object<DriveRegisterData>;

impl Object<DriveRegisterData> {
    /// Insert or replace the state of `state.drive_name`.
    pub fn set_drive_state(&mut self, state: DriveState) {
        let drives = &mut self.payload_mut().drives;
        match drives.iter_mut().find(|d| d.drive_name == state.drive_name) {
            Some(existing) => *existing = state,
            None => drives.push(state),
        }
    }

    pub fn remove_drive(&mut self, drive_name: &str) -> bool {
        let drives = &mut self.payload_mut().drives;
        let before = drives.len();
        drives.retain(|d| d.drive_name != drive_name);
        drives.len() != before
    }

    pub fn drive_state(&self, drive_name: &str) -> Option<&DriveState> {
        self.payload().drives.iter().find(|d| d.drive_name == drive_name)
    }

    pub fn drive_states(&self) -> &[DriveState] {
        &self.payload().drives
    }
}
