//! The payment-tag onion TLV.
//!
//! A single optional record (BigSize type, BigSize length, value) whose
//! content is the variable-length encrypted payment secret. An absent
//! record decodes to the explicit [`PaymentTagTlv::Empty`] arm rather
//! than an error: old senders simply don't attach one.

use anyhow::{bail, ensure, Context};

/// The record type carrying the encrypted payment secret.
pub const PAYMENT_TAG_RECORD: u64 = 4_127_926_135;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PaymentTagTlv {
    /// No payment-tag record present: an empty TLV stream.
    Empty,
    /// The encrypted payment secret of this HTLC stream.
    EncryptedSecret(Vec<u8>),
}

impl PaymentTagTlv {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::Empty => Vec::new(),
            Self::EncryptedSecret(data) => {
                let mut out = Vec::with_capacity(data.len() + 16);
                write_bigsize(&mut out, PAYMENT_TAG_RECORD);
                write_bigsize(&mut out, data.len() as u64);
                out.extend_from_slice(data);
                out
            }
        }
    }

    /// Parse a TLV stream, skipping unknown records.
    pub fn decode(mut bytes: &[u8]) -> anyhow::Result<Self> {
        let mut last_type: Option<u64> = None;
        while !bytes.is_empty() {
            let (record_type, rest) =
                read_bigsize(bytes).context("Bad record type")?;
            let (length, rest) =
                read_bigsize(rest).context("Bad record length")?;
            let length = usize::try_from(length)
                .ok()
                .filter(|len| *len <= rest.len())
                .context("Record length exceeds stream")?;
            ensure!(
                last_type.map(|last| last < record_type).unwrap_or(true),
                "Record types must strictly increase",
            );
            last_type = Some(record_type);

            let (value, rest) = rest.split_at(length);
            if record_type == PAYMENT_TAG_RECORD {
                return Ok(Self::EncryptedSecret(value.to_vec()));
            }
            bytes = rest;
        }
        Ok(Self::Empty)
    }
}

// --- BigSize varints --- //

fn write_bigsize(out: &mut Vec<u8>, value: u64) {
    match value {
        0..=0xfc => out.push(value as u8),
        0xfd..=0xffff => {
            out.push(0xfd);
            out.extend_from_slice(&(value as u16).to_be_bytes());
        }
        0x1_0000..=0xffff_ffff => {
            out.push(0xfe);
            out.extend_from_slice(&(value as u32).to_be_bytes());
        }
        _ => {
            out.push(0xff);
            out.extend_from_slice(&value.to_be_bytes());
        }
    }
}

fn read_bigsize(bytes: &[u8]) -> anyhow::Result<(u64, &[u8])> {
    let (&first, rest) = match bytes.split_first() {
        Some(split) => split,
        None => bail!("Empty input"),
    };
    let (value, rest) = match first {
        0xfd => {
            ensure!(rest.len() >= 2, "Truncated u16 varint");
            let (raw, rest) = rest.split_at(2);
            let value = u64::from(u16::from_be_bytes([raw[0], raw[1]]));
            ensure!(value >= 0xfd, "Non-canonical varint");
            (value, rest)
        }
        0xfe => {
            ensure!(rest.len() >= 4, "Truncated u32 varint");
            let (raw, rest) = rest.split_at(4);
            let value = u64::from(u32::from_be_bytes([
                raw[0], raw[1], raw[2], raw[3],
            ]));
            ensure!(value > u64::from(u16::MAX), "Non-canonical varint");
            (value, rest)
        }
        0xff => {
            ensure!(rest.len() >= 8, "Truncated u64 varint");
            let (raw, rest) = rest.split_at(8);
            let mut buf = [0u8; 8];
            buf.copy_from_slice(raw);
            let value = u64::from_be_bytes(buf);
            ensure!(value > u64::from(u32::MAX), "Non-canonical varint");
            (value, rest)
        }
        small => (u64::from(small), rest),
    };
    Ok((value, rest))
}
