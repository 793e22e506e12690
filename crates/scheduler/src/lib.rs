//! Background services that run outside the live-conversation path: the
//! greeting scheduler that opens outreach during the day and the prospect
//! ingestor that pulls in new leads overnight.

mod greeter;
mod ingestor;
mod window;

pub use greeter::{build_schedule, clamped_normal_in_window, run_periodic_greeting};
pub use ingestor::{run_periodic_ingestion, ExternalLead, ExternalSource, IngestError};
pub use window::{in_awake_window, in_night_window, resolve_timezone};
