//! Defines helper methods for Serializing and Deserializing external types.
use std::str::FromStr;

use base64::Engine;
use bytes::Bytes;
use log::LevelFilter;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

#[cfg(unix)]
use syslog::Facility;

//------------ Bytes ---------------------------------------------------------

pub fn de_bytes<'de, D>(d: D) -> Result<Bytes, D::Error>
where
    D: Deserializer<'de>,
{
    let some = String::deserialize(d)?;
    let dec = base64::engine::general_purpose::STANDARD
        .decode(&some)
        .map_err(de::Error::custom)?;
    Ok(Bytes::from(dec))
}

pub fn ser_bytes<S>(b: &Bytes, s: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    base64::engine::general_purpose::STANDARD.encode(b).serialize(s)
}

//------------ LevelFilter ---------------------------------------------------

pub fn de_level_filter<'de, D>(d: D) -> Result<LevelFilter, D::Error>
where
    D: Deserializer<'de>,
{
    let string = String::deserialize(d)?;
    LevelFilter::from_str(&string).map_err(de::Error::custom)
}

//------------ Facility ------------------------------------------------------

#[cfg(unix)]
pub fn de_facility<'de, D>(d: D) -> Result<Facility, D::Error>
where
    D: Deserializer<'de>,
{
    let string = String::deserialize(d)?;
    Facility::from_str(&string).map_err(|_| de::Error::custom(format!("Unsupported syslog_facility: \"{}\"", string)))
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Deserialize, Serialize)]
    struct Wrapped {
        #[serde(deserialize_with = "de_bytes", serialize_with = "ser_bytes")]
        content: Bytes,
    }

    #[test]
    fn bytes_are_base64_in_json() {
        let wrapped = Wrapped {
            content: Bytes::from_static(b"hello"),
        };
        let json = serde_json::to_string(&wrapped).unwrap();
        assert_eq!(r#"{"content":"aGVsbG8="}"#, json);

        let back: Wrapped = serde_json::from_str(&json).unwrap();
        assert_eq!(wrapped.content, back.content);
    }

    #[test]
    fn invalid_base64_is_rejected() {
        let res: Result<Wrapped, _> = serde_json::from_str(r#"{"content":"***"}"#);
        assert!(res.is_err());
    }
}
