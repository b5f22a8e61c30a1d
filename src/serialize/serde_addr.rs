//! Addresses as `"0x..."` strings, for `#[serde(with = "serde_addr")]`.
//! Crash reports get read by people, and JSON numbers lose precision past
//! 2^53 in most consumers anyway.

use std::fmt;

use serde::{
    de::{self, SeqAccess, Visitor},
    ser::SerializeSeq,
    Deserializer, Serializer,
};

pub fn serialize<S>(addr: &usize, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.collect_str(&format_args!("{addr:#x}"))
}

fn parse<E: de::Error>(s: &str) -> Result<usize, E> {
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .ok_or_else(|| E::invalid_value(de::Unexpected::Str(s), &"a 0x-prefixed address"))?;
    usize::from_str_radix(digits, 16)
        .map_err(|_| E::invalid_value(de::Unexpected::Str(s), &"a hexadecimal address"))
}

struct AddrVisitor;

impl<'de> Visitor<'de> for AddrVisitor {
    type Value = usize;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("an address")
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        parse(v)
    }

    fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        usize::try_from(v).map_err(|_| E::invalid_value(de::Unexpected::Unsigned(v), &self))
    }
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<usize, D::Error>
where
    D: Deserializer<'de>,
{
    deserializer.deserialize_any(AddrVisitor)
}

/// The same, for a list of addresses (a stack trace)
pub mod seq {
    use super::*;

    pub fn serialize<S>(addrs: &[usize], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut seq = serializer.serialize_seq(Some(addrs.len()))?;
        for addr in addrs {
            seq.serialize_element(&format_args!("{addr:#x}").to_string())?;
        }
        seq.end()
    }

    struct SeqVisitor;

    impl<'de> Visitor<'de> for SeqVisitor {
        type Value = Vec<usize>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a list of addresses")
        }

        fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
        where
            A: SeqAccess<'de>,
        {
            let mut addrs = Vec::with_capacity(seq.size_hint().unwrap_or(0));
            while let Some(s) = seq.next_element::<String>()? {
                addrs.push(parse(&s)?);
            }
            Ok(addrs)
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<usize>, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_seq(SeqVisitor)
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct Frame {
        #[serde(with = "super")]
        pc: usize,
        #[serde(with = "super::seq")]
        stack: Vec<usize>,
    }

    #[test]
    fn addresses_are_hex_strings() {
        let frame = Frame {
            pc: 0x7f00_dead_beef,
            stack: vec![0x10, 0x20],
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert_eq!(json, r#"{"pc":"0x7f00deadbeef","stack":["0x10","0x20"]}"#);
        assert_eq!(serde_json::from_str::<Frame>(&json).unwrap(), frame);
    }

    #[test]
    fn plain_numbers_and_garbage() {
        let frame: Frame = serde_json::from_str(r#"{"pc":4096,"stack":[]}"#).unwrap();
        assert_eq!(frame.pc, 4096);
        assert!(serde_json::from_str::<Frame>(r#"{"pc":"4096","stack":[]}"#).is_err());
        assert!(serde_json::from_str::<Frame>(r#"{"pc":"0xzz","stack":[]}"#).is_err());
    }
}
