pub mod config;
pub mod error;
pub mod judge;
pub mod language;
pub mod limits;
pub mod normalize;
pub mod problem;
pub mod queue;
pub mod sandbox;
pub mod status;
pub mod worker;

pub fn create_timestamp() -> String {
    use chrono::{SecondsFormat, Utc};
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
