//! The match-acceptance saga: reserve a meeting slot, then notify the members.
//!
//! Shipped as the reference definition in `config/sagas.json`; this module
//! builds the same definition in code for tests and embedders.

use std::time::Duration;

use crate::definition::{CompensationSpec, DefinitionSpec, StepSpec};

/// Process type name.
pub const PROCESS_TYPE: &str = "MatchAcceptance";

/// Event that starts the saga.
pub const MATCH_ACCEPTED: &str = "MatchAccepted";

/// Payload field holding the match id.
pub const CORRELATION_KEY: &str = "match_id";

pub const STEP_RESERVE_SLOT: &str = "ReserveSlot";
pub const STEP_SEND_NOTIFICATIONS: &str = "SendNotifications";

pub const AWAITING_SLOT_RESERVATION: &str = "AwaitingSlotReservation";
pub const AWAITING_NOTIFICATIONS: &str = "AwaitingNotifications";

pub const RESERVE_SLOT: &str = "ReserveSlot";
pub const RELEASE_SLOT: &str = "ReleaseSlot";
pub const SEND_NOTIFICATIONS: &str = "SendNotifications";

pub const SLOT_RESERVED: &str = "SlotReserved";
pub const SLOT_RESERVATION_FAILED: &str = "SlotReservationFailed";
pub const SLOT_RELEASED: &str = "SlotReleased";
pub const NOTIFICATIONS_SENT: &str = "NotificationsSent";
pub const NOTIFICATIONS_FAILED: &str = "NotificationsFailed";

/// Builds the match-acceptance definition.
pub fn definition() -> DefinitionSpec {
    DefinitionSpec::new(PROCESS_TYPE, MATCH_ACCEPTED)
        .correlation_key(CORRELATION_KEY)
        .step(
            StepSpec::new(STEP_RESERVE_SLOT, RESERVE_SLOT)
                .state(AWAITING_SLOT_RESERVATION)
                .succeeds_on(SLOT_RESERVED)
                .fails_on(SLOT_RESERVATION_FAILED)
                .timeout(Duration::from_secs(30))
                .compensate_with(CompensationSpec::new(
                    RELEASE_SLOT,
                    SLOT_RELEASED,
                    Duration::from_secs(30),
                )),
        )
        .step(
            StepSpec::new(STEP_SEND_NOTIFICATIONS, SEND_NOTIFICATIONS)
                .state(AWAITING_NOTIFICATIONS)
                .succeeds_on(NOTIFICATIONS_SENT)
                .fails_on(NOTIFICATIONS_FAILED)
                .timeout(Duration::from_secs(60)),
        )
}
