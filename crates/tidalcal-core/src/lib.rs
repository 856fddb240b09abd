mod caldav_client;
mod clock;
mod error;
mod model;
mod reminder_sink;

pub use caldav_client::{
    CalDavClient, CalDavError, RemoteBody, RemoteCalendar, RemoteResource, DISCOVERY_PROBE_PATHS,
};
pub use clock::{Clock, SystemClock};
pub use error::CoreError;
pub use model::*;
pub use reminder_sink::ReminderSink;
