//! Synchronization with the Awesome portal.

mod meta;
mod objects;
mod sync;

pub use meta::{
    load_aqi_standards, load_reading_type_groups, parse_aqi_standards, parse_reading_type_groups,
    sync_aqi_standards, sync_reading_type_groups, MetaSummary, ReadingTypeGroup,
};
pub use objects::{
    AqiReading, AqiStandard, Location, NamedObject, PortalObject, Reading, ReadingCategory, ReadingType,
    Sensor, SensorCategory, SensorType,
};
pub use sync::{
    BulkOutcome, PortalClient, UpsertOutcome, BULK_AQI_READINGS_PATH, BULK_DELETE_READINGS_PATH,
    BULK_READINGS_PATH,
};
