/// Timestamps on the wire are epoch milliseconds. Older producers send
/// RFC 3339 strings, so both are accepted when reading.
pub mod timestamp {
    use core::fmt;

    use chrono::{DateTime, TimeZone as _, Utc};
    use serde::{
        de::{self, Visitor},
        Deserializer, Serializer,
    };

    struct TimestampVisitor;

    impl<'de> Visitor<'de> for TimestampVisitor {
        type Value = Option<DateTime<Utc>>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("epoch milliseconds or an RFC 3339 timestamp")
        }

        fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Utc.timestamp_millis_opt(value)
                .single()
                .map(Some)
                .ok_or_else(|| E::custom(format!("timestamp out of range: {value}")))
        }

        fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            let value = i64::try_from(value)
                .map_err(|_| E::custom(format!("timestamp out of range: {value}")))?;
            self.visit_i64(value)
        }

        fn visit_f64<E>(self, value: f64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            if !value.is_finite() {
                return Err(E::custom("timestamp is not finite"));
            }
            self.visit_i64(value.round() as i64)
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            if let Ok(millis) = value.parse::<i64>() {
                return self.visit_i64(millis);
            }
            DateTime::parse_from_rfc3339(value)
                .map(|date_time| Some(date_time.with_timezone(&Utc)))
                .map_err(E::custom)
        }

        fn visit_none<E>(self) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(None)
        }

        fn visit_unit<E>(self) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(None)
        }

        fn visit_some<D>(self, deserializer: D) -> Result<Self::Value, D::Error>
        where
            D: Deserializer<'de>,
        {
            deserializer.deserialize_any(TimestampVisitor)
        }
    }

    pub fn serialize<S>(date_time: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_i64(date_time.timestamp_millis())
    }

    pub fn serialize_option<S>(
        date_time: &Option<DateTime<Utc>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match date_time {
            Some(date_time) => serialize(date_time, serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer
            .deserialize_any(TimestampVisitor)?
            .ok_or_else(|| de::Error::custom("missing timestamp"))
    }

    pub fn deserialize_option<'de, D>(
        deserializer: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_option(TimestampVisitor)
    }
}

/// Identifiers arrive as strings from some clients and as numbers from
/// others.
pub mod string_or_number {
    use core::fmt;

    use serde::{
        de::{self, Visitor},
        Deserializer,
    };

    struct IdVisitor;

    impl<'de> Visitor<'de> for IdVisitor {
        type Value = Option<String>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a string or an integer")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            if value.is_empty() {
                Ok(None)
            } else {
                Ok(Some(value.to_owned()))
            }
        }

        fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(Some(value.to_string()))
        }

        fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(Some(value.to_string()))
        }

        fn visit_none<E>(self) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(None)
        }

        fn visit_unit<E>(self) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(None)
        }

        fn visit_some<D>(self, deserializer: D) -> Result<Self::Value, D::Error>
        where
            D: Deserializer<'de>,
        {
            deserializer.deserialize_any(IdVisitor)
        }
    }

    pub fn deserialize_option<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_option(IdVisitor)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use serde::Deserialize;

    #[derive(Deserialize)]
    struct Record {
        #[serde(deserialize_with = "super::timestamp::deserialize_option", default)]
        timestamp: Option<chrono::DateTime<Utc>>,
        #[serde(deserialize_with = "super::string_or_number::deserialize_option", default)]
        id: Option<String>,
    }

    #[test]
    fn timestamp_accepts_millis_and_rfc3339() {
        let expected = Utc.timestamp_millis_opt(1_700_000_000_000).unwrap();

        let record: Record = serde_json::from_str(r#"{"timestamp":1700000000000}"#).unwrap();
        assert_eq!(record.timestamp, Some(expected));

        let record: Record =
            serde_json::from_str(r#"{"timestamp":"2023-11-14T22:13:20Z"}"#).unwrap();
        assert_eq!(record.timestamp, Some(expected));
    }

    #[test]
    fn missing_or_null_timestamp_is_none() {
        let record: Record = serde_json::from_str(r#"{}"#).unwrap();
        assert_eq!(record.timestamp, None);
        let record: Record = serde_json::from_str(r#"{"timestamp":null}"#).unwrap();
        assert_eq!(record.timestamp, None);
    }

    #[test]
    fn garbage_timestamp_is_rejected() {
        assert!(serde_json::from_str::<Record>(r#"{"timestamp":"yesterday"}"#).is_err());
    }

    #[test]
    fn numeric_ids_are_stringified() {
        let record: Record = serde_json::from_str(r#"{"id":42}"#).unwrap();
        assert_eq!(record.id.as_deref(), Some("42"));
        let record: Record = serde_json::from_str(r#"{"id":"SHP-7"}"#).unwrap();
        assert_eq!(record.id.as_deref(), Some("SHP-7"));
    }
}
