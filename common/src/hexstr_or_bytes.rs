//! `serde` helper for `[u8; N]` / `Vec<u8>` fields which should serialize
//! as lowercase hex strings in human-readable formats (JSON) and as raw
//! bytes otherwise.
//!
//! Usage: `#[serde(with = "common::hexstr_or_bytes")]`.

use hex::FromHex;
use serde::{de, Deserialize, Deserializer, Serializer};

pub fn serialize<S, T>(data: &T, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
    T: AsRef<[u8]>,
{
    if serializer.is_human_readable() {
        serializer.collect_str(&hex::display(data.as_ref()))
    } else {
        serializer.serialize_bytes(data.as_ref())
    }
}

pub fn deserialize<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: FromHex + TryFrom<Vec<u8>>,
{
    if deserializer.is_human_readable() {
        let s = <&str>::deserialize(deserializer)?;
        T::from_hex(s).map_err(de::Error::custom)
    } else {
        let bytes = <Vec<u8>>::deserialize(deserializer)?;
        T::try_from(bytes)
            .map_err(|_| de::Error::custom("wrong byte length"))
    }
}

#[cfg(test)]
mod test {
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Eq, PartialEq, Serialize, Deserialize)]
    struct Foo {
        #[serde(with = "crate::hexstr_or_bytes")]
        bytes: [u8; 4],
    }

    #[test]
    fn json_uses_hex_strings() {
        let foo = Foo {
            bytes: [0xde, 0xad, 0xbe, 0xef],
        };
        let json = serde_json::to_string(&foo).unwrap();
        assert_eq!(json, r#"{"bytes":"deadbeef"}"#);
        assert_eq!(serde_json::from_str::<Foo>(&json).unwrap(), foo);
    }
}
