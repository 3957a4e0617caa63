use std::future::Future;
use uuid::Uuid;

use crate::device::constants::{make_ring_service_uuid, RING_COMPANY_IDENTIFIER, RING_DISPLAY_NAME};
use crate::device::types::AccessoryIdentity;
use crate::error::AccessoryError;

/// Pairing lifecycle notifications, fed to
/// [`RingSession::handle_accessory_event`](crate::device::session::RingSession::handle_accessory_event).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessoryEvent {
    Added(AccessoryIdentity),
    Changed(AccessoryIdentity),
    Removed(AccessoryIdentity),
    /// The registry came up; carries the accessory it already knew about.
    Activated(Option<AccessoryIdentity>),
    PickerPresented,
    PickerDismissed,
}

/// What the picker is looking for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PickerDescriptor {
    pub name: String,
    pub company_identifier: u16,
    pub services: Vec<Uuid>,
}

impl PickerDescriptor {
    pub fn ring() -> Self {
        PickerDescriptor {
            name: RING_DISPLAY_NAME.to_string(),
            company_identifier: RING_COMPANY_IDENTIFIER,
            services: vec![make_ring_service_uuid()],
        }
    }
}

/// Lets the user pick and authorize one physical ring, and remembers it.
pub trait AccessoryRegistry {
    fn accessories(&self) -> impl Future<Output = Result<Vec<AccessoryIdentity>, AccessoryError>> + Send;

    fn present_picker(&self, descriptor: &PickerDescriptor) -> impl Future<Output = Result<AccessoryIdentity, AccessoryError>> + Send;

    fn remove_accessory(&self, identity: &AccessoryIdentity) -> impl Future<Output = Result<(), AccessoryError>> + Send;
}
