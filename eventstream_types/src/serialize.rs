/// Serialize an [`iox_time::Time`] as nanoseconds since the unix epoch
pub(crate) mod time_nanos {
    use iox_time::Time;
    use serde::{Deserialize, Deserializer, Serializer};

    pub(crate) fn serialize<S>(time: &Time, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_i64(time.timestamp_nanos())
    }

    pub(crate) fn deserialize<'de, D>(deserializer: D) -> Result<Time, D::Error>
    where
        D: Deserializer<'de>,
    {
        i64::deserialize(deserializer).map(Time::from_timestamp_nanos)
    }
}
