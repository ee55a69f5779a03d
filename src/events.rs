mod event;
mod state_machine;
mod zone;

pub use event::{Event, EventKind, Severity};
pub use state_machine::{EventConfig, EventStateMachine, ZoneMembership};
pub use zone::{MAX_ZONE_COORD, MAX_ZONE_NAME_LEN, Zone, ZoneError, ZoneShape, validate_zones};
